//! Telegram front end: chat with the local model and trigger agents from a phone.
//!
//! Access is fail-closed. Only chat ids listed in the allowlist env var get
//! answers; `/id` always replies so a new user can find out what to add.

use anyhow::{Context, Result};
use common::Config;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::agents::{self, AgentKind};
use crate::pipeline::{Pipeline, RunMode};
use crate::sessions::SessionStore;

pub mod search;
pub mod telegram;

pub use search::{SearchKind, SearchQuery, SearchSources};
pub use telegram::TelegramClient;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful personal assistant running locally via Ollama. \
Be concise and direct. Use markdown formatting when it helps readability.";

pub const HELP_TEXT: &str = "*Available commands:*
/help - Show this message
/clear - Clear conversation history
/run <agent> - Run an agent (literature, email, news, grants, current, all)
/agents - List available agents
/search research <query> - Rank PubMed and arXiv results
/search news <query> - Rank news headlines
/id - Show your Telegram chat ID
/model - Show current LLM model
/system <prompt> - Change the system prompt

Anything else is sent to the model.";

const BACKEND_DOWN: &str = "Ollama is not running. Start it and try again.";
const NO_RESPONSE: &str = "Sorry, I couldn't generate a response.";
const SEARCH_USAGE: &str = "Usage: `/search research <query>` or `/search news <query>`";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Clear,
    Id,
    Model,
    Agents,
    /// `/run` with its (lowercased) argument, empty when missing
    Run(String),
    /// `/system` with the new prompt, `None` to show the current one
    System(Option<String>),
    /// `/search <kind> <query>`, `None` when either part is missing or unknown
    Search(Option<SearchQuery>),
}

impl Command {
    /// Parse a slash command. `None` means the text is a chat turn,
    /// including unknown commands.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (text, ""),
        };
        // "/run@MyBot" in group chats
        let cmd = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
        let command = match cmd.as_str() {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/clear" => Command::Clear,
            "/id" => Command::Id,
            "/model" => Command::Model,
            "/agents" => Command::Agents,
            "/run" => Command::Run(
                rest.split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase(),
            ),
            "/system" => Command::System((!rest.is_empty()).then(|| rest.to_string())),
            "/search" => Command::Search(rest.split_once(char::is_whitespace).and_then(
                |(kind, query)| {
                    let query = query.trim();
                    Some(SearchQuery {
                        kind: SearchKind::parse(kind)?,
                        query: query.to_string(),
                    })
                    .filter(|_| !query.is_empty())
                },
            )),
            _ => return None,
        };
        Some(command)
    }
}

/// Comma separated chat ids. Unparseable entries are dropped with a warning.
pub fn parse_allowlist(raw: &str) -> HashSet<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(entry = s, "ignoring malformed chat id in allowlist");
                None
            }
        })
        .collect()
}

/// Agents selected by a `/run` argument; `None` for an unknown name.
pub fn run_targets(arg: &str, config: &Config) -> Option<Vec<AgentKind>> {
    if arg == "all" {
        return Some(
            AgentKind::all()
                .into_iter()
                .filter(|k| config.agent(k.name()).enabled)
                .collect(),
        );
    }
    arg.parse::<AgentKind>().ok().map(|k| vec![k])
}

fn agents_text() -> String {
    let list: Vec<String> = AgentKind::all()
        .iter()
        .map(|k| format!("  `{}` - {}", k.alias(), k.label()))
        .collect();
    format!(
        "*Available agents:*\n{}\n\nUse `/run <agent>` or `/run all`",
        list.join("\n")
    )
}

fn run_usage() -> String {
    let names: Vec<&str> = AgentKind::all().iter().map(|k| k.alias()).collect();
    format!("Usage: `/run <agent>`\nAgents: {}, all", names.join(", "))
}

/// What to do with one incoming message
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(String),
    Run(Vec<AgentKind>),
    Search(SearchQuery),
    Chat(String),
}

pub struct Bot {
    telegram: TelegramClient,
    pipeline: Arc<Pipeline>,
    config: Arc<Config>,
    sessions: SessionStore,
    allowed: HashSet<i64>,
    base_prompt: String,
    search_sources: SearchSources,
}

impl Bot {
    pub fn new(
        telegram: TelegramClient,
        pipeline: Arc<Pipeline>,
        config: Arc<Config>,
        allowed: HashSet<i64>,
    ) -> Self {
        let base_prompt = config
            .telegram
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        Self {
            telegram,
            sessions: SessionStore::new(config.telegram.max_history),
            pipeline,
            config,
            allowed,
            base_prompt,
            search_sources: SearchSources::default(),
        }
    }

    pub fn with_search_sources(mut self, sources: SearchSources) -> Self {
        self.search_sources = sources;
        self
    }

    /// Build from config: token and allowlist come from the named env vars.
    pub fn from_env(pipeline: Arc<Pipeline>, config: Arc<Config>) -> Result<Self> {
        let token = std::env::var(&config.telegram.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .with_context(|| format!("{} not set", config.telegram.token_env))?;
        let allowed =
            parse_allowlist(&std::env::var(&config.telegram.allowed_chat_ids_env).unwrap_or_default());
        if allowed.is_empty() {
            error!(
                "{} not set. Bot will reject all messages. Send /id to the bot, then add your chat ID.",
                config.telegram.allowed_chat_ids_env
            );
        } else {
            info!(chat_ids = ?allowed, "restricted to allowlisted chats");
        }
        Ok(Self::new(TelegramClient::new(&token), pipeline, config, allowed))
    }

    async fn current_prompt(&self, chat_id: i64) -> String {
        self.sessions
            .system_prompt(chat_id)
            .await
            .unwrap_or_else(|| self.base_prompt.clone())
    }

    /// Decide how to answer `text`. Session side effects of commands happen here.
    pub async fn decide(&self, chat_id: i64, text: &str) -> Action {
        let command = Command::parse(text);

        if !self.allowed.contains(&chat_id) {
            if command == Some(Command::Id) {
                return Action::Reply(format!("Your chat ID: `{}`", chat_id));
            }
            warn!(chat_id, "unauthorized chat");
            return Action::Reply(format!(
                "Unauthorized. Your chat ID is `{}`. Add it to {} in .env.",
                chat_id,
                self.config.telegram.allowed_chat_ids_env.replace('_', "\\_")
            ));
        }

        let Some(command) = command else {
            return Action::Chat(text.to_string());
        };
        let model = self.pipeline.summarizer().model();
        match command {
            Command::Start => Action::Reply(format!(
                "Hello! I'm your local AI assistant.\n\nModel: `{}`\n\nSend me anything, or /help for commands.",
                model
            )),
            Command::Help => Action::Reply(HELP_TEXT.to_string()),
            Command::Clear => {
                self.sessions.clear(chat_id).await;
                Action::Reply("Conversation cleared.".into())
            }
            Command::Id => Action::Reply(format!("Your chat ID: `{}`", chat_id)),
            Command::Model => Action::Reply(format!("Model: `{}`", model)),
            Command::Agents => Action::Reply(agents_text()),
            Command::Run(arg) => match run_targets(&arg, &self.config) {
                Some(kinds) => Action::Run(kinds),
                None => Action::Reply(run_usage()),
            },
            Command::System(Some(prompt)) => {
                self.sessions.set_system_prompt(chat_id, Some(prompt)).await;
                self.sessions.clear(chat_id).await;
                Action::Reply("System prompt updated. History cleared.".into())
            }
            Command::System(None) => Action::Reply(format!(
                "Current system prompt:\n\n{}",
                self.current_prompt(chat_id).await
            )),
            Command::Search(Some(query)) => Action::Search(query),
            Command::Search(None) => Action::Reply(SEARCH_USAGE.to_string()),
        }
    }

    /// One chat turn against the model. A failed turn is taken back out of the session.
    pub async fn converse(&self, chat_id: i64, text: &str) -> String {
        self.sessions.push_user(chat_id, text).await;

        let summarizer = self.pipeline.summarizer();
        if !summarizer.health_check().await {
            self.sessions.pop_last(chat_id).await;
            return BACKEND_DOWN.to_string();
        }

        let prompt = self.current_prompt(chat_id).await;
        let history = self.sessions.history(chat_id).await;
        match summarizer
            .chat(&prompt, &history, self.config.telegram.temperature)
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => {
                self.sessions.push_assistant(chat_id, &reply).await;
                reply
            }
            Ok(_) => {
                self.sessions.pop_last(chat_id).await;
                NO_RESPONSE.to_string()
            }
            Err(e) => {
                error!(chat_id, error = %e, "chat completion failed");
                self.sessions.pop_last(chat_id).await;
                NO_RESPONSE.to_string()
            }
        }
    }

    /// Fetch, rank and format an ad-hoc search.
    pub async fn search(&self, query: &SearchQuery) -> String {
        let hits = match self.search_sources.gather(query).await {
            Ok(hits) => hits,
            Err(e) => {
                error!(query = %query.query, error = %format!("{:#}", e), "search fetch failed");
                return format!("Search failed for _{}_. Try again later.", query.query);
            }
        };
        let summarizer = self.pipeline.summarizer();
        if !hits.is_empty() && !summarizer.health_check().await {
            return BACKEND_DOWN.to_string();
        }
        search::rank(summarizer, query, &hits).await
    }

    async fn run_agents(&self, chat_id: i64, kinds: Vec<AgentKind>) -> Result<()> {
        for kind in kinds {
            self.telegram
                .send_message(chat_id, &format!("Running {} agent...", kind.label()))
                .await?;
            self.telegram.send_typing(chat_id).await;
            let outcome = agents::run(kind, &self.pipeline, &self.config, RunMode::Preview).await;
            self.telegram
                .send_message(chat_id, &agents::describe_outcome(kind, &outcome))
                .await?;
        }
        Ok(())
    }

    pub async fn handle(&self, chat_id: i64, text: &str) -> Result<()> {
        match self.decide(chat_id, text).await {
            Action::Reply(reply) => self.telegram.send_message(chat_id, &reply).await,
            Action::Run(kinds) => self.run_agents(chat_id, kinds).await,
            Action::Search(query) => {
                self.telegram
                    .send_message(
                        chat_id,
                        &format!("Searching {} for _{}_...", query.kind.label().to_lowercase(), query.query),
                    )
                    .await?;
                self.telegram.send_typing(chat_id).await;
                let reply = self.search(&query).await;
                self.telegram.send_message(chat_id, &reply).await
            }
            Action::Chat(text) => {
                self.telegram.send_typing(chat_id).await;
                let reply = self.converse(chat_id, &text).await;
                self.telegram.send_message(chat_id, &reply).await
            }
        }
    }

    /// Long-poll until `shutdown` is notified. Messages are handled one at a time.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        let username = self.telegram.get_me().await.context("invalid Telegram token")?;
        info!(bot = %username, model = %self.pipeline.summarizer().model(), "bot started");

        let mut offset: Option<i64> = None;
        loop {
            let updates = tokio::select! {
                _ = shutdown.notified() => {
                    info!("bot shutting down");
                    return Ok(());
                }
                res = self.telegram.get_updates(offset) => res,
            };

            let updates = match updates {
                Ok(u) => u,
                Err(e) => {
                    error!(error = %e, "polling failed");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                let Some(message) = update.message else { continue };
                let Some(text) = message.text.filter(|t| !t.is_empty()) else { continue };
                let chat_id = message.chat.id;
                info!(chat_id, text = %text.chars().take(80).collect::<String>(), "message received");
                if let Err(e) = self.handle(chat_id, &text).await {
                    error!(chat_id, error = %e, "failed to answer message");
                }
            }
        }
    }
}

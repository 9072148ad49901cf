/*
briefing - command line entry point.
Runs agents once, long-running as a scheduler, or as a Telegram bot.
*/

use anyhow::Result;
use clap::{Parser, Subcommand};
use common::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use briefing::agents::{self, AgentKind};
use briefing::bot::Bot;
use briefing::delivery::Dispatcher;
use briefing::history::HistoryStore;
use briefing::llm::remote::RemoteLlmProvider;
use briefing::llm::retry::RetryPolicy;
use briefing::llm::structured::Summarizer;
use briefing::pipeline::{Pipeline, RunMode, RunOutcome};
use briefing::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "briefing", about = "Local LLM agents: literature, news, grants, email triage, current events")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one agent (or `all` enabled agents) once
    Run {
        /// literature, email, news, grants, current or all
        agent: String,
        /// Fetch and summarize but don't deliver
        #[arg(long)]
        dry_run: bool,
    },
    /// Only check whether the LLM backend is running
    CheckLlm,
    /// Show seen-id counts and last run per agent
    History { agent: Option<String> },
    /// Run agents on their configured schedules until interrupted
    Schedule,
    /// Start the Telegram bot
    Bot,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Arc::new(load_config(args.config).await?);

    let history = Arc::new(HistoryStore::new(&config.history.path, config.history.max_ids));
    let provider = Arc::new(RemoteLlmProvider::from_config(&config.llm));
    let summarizer = Arc::new(
        Summarizer::new(provider, RetryPolicy::from_config(&config.llm))
            .with_sampling(config.llm.max_tokens, config.llm.temperature),
    );
    let channels = Arc::new(Dispatcher::from_config(&config.delivery));
    let pipeline = Arc::new(Pipeline::new(history, summarizer, channels));

    match args.command {
        Command::Run { agent, dry_run } => run_agents(&pipeline, &config, &agent, dry_run).await,
        Command::CheckLlm => {
            let ok = pipeline.summarizer().health_check().await;
            println!(
                "LLM backend ({}, model {}): {}",
                config.llm.base_url,
                config.llm.model,
                if ok { "running" } else { "NOT RUNNING" }
            );
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::History { agent } => show_history(&pipeline, agent.as_deref()).await,
        Command::Schedule => {
            let shutdown = shutdown_on_ctrl_c();
            Scheduler::new(pipeline, config).run(shutdown).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Bot => {
            let bot = Bot::from_env(pipeline, config)?;
            bot.run(shutdown_on_ctrl_c()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `config.default.toml` merged with `--config FILE` (must exist) or `config.toml` if present.
async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

fn shutdown_on_ctrl_c() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    let trigger = notify.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            trigger.notify_one();
        }
    });
    notify
}

async fn run_agents(pipeline: &Pipeline, config: &Config, agent: &str, dry_run: bool) -> Result<ExitCode> {
    let kinds: Vec<AgentKind> = if agent.eq_ignore_ascii_case("all") {
        AgentKind::all()
            .into_iter()
            .filter(|k| config.agent(k.name()).enabled)
            .collect()
    } else {
        let kind: AgentKind = agent.parse().map_err(anyhow::Error::msg)?;
        if !config.agent(kind.name()).enabled {
            info!(agent = kind.name(), "agent is disabled in config");
            return Ok(ExitCode::SUCCESS);
        }
        vec![kind]
    };

    let mode = if dry_run { RunMode::Preview } else { RunMode::Deliver };
    let mut failed = false;
    for kind in kinds {
        let outcome = agents::run(kind, pipeline, config, mode).await;
        match &outcome {
            RunOutcome::Delivered { delivery, .. } => {
                if !delivery.all_ok() {
                    warn!(agent = kind.name(), failed = ?delivery.failures(), "some deliveries failed");
                }
                info!(agent = kind.name(), sent = delivery.sent(), "agent completed");
            }
            RunOutcome::Previewed(digest) => println!("{}\n", digest),
            RunOutcome::Skipped(reason) if reason.is_error() => {
                error!(agent = kind.name(), %reason, "agent failed");
                failed = true;
            }
            RunOutcome::Skipped(reason) => info!(agent = kind.name(), %reason, "nothing to deliver"),
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn show_history(pipeline: &Pipeline, agent: Option<&str>) -> Result<ExitCode> {
    let kinds = match agent {
        Some(name) => vec![name.parse::<AgentKind>().map_err(anyhow::Error::msg)?],
        None => AgentKind::all().to_vec(),
    };
    for kind in kinds {
        match pipeline.history().status(kind.name()).await {
            Some(h) => {
                let last = h
                    .last_run
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<16} {:>6} seen  last run {}", kind.name(), h.seen_ids.len(), last);
            }
            None => println!("{:<16} {:>6} seen  last run never", kind.name(), 0),
        }
    }
    Ok(ExitCode::SUCCESS)
}

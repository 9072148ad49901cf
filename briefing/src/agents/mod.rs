//! The five concrete agents and a name-based dispatcher over them.

use common::{AgentConfig, Config, DeliveryMethod};
use std::fmt;
use std::str::FromStr;

use crate::delivery::{Channels, DeliveryReport};
use crate::pipeline::{run_agent, Pipeline, RunMode, RunOutcome};

pub mod current_events;
pub mod email_triage;
pub mod grants;
pub mod literature;
pub mod news;

pub use current_events::CurrentEventsAgent;
pub use email_triage::EmailTriageAgent;
pub use grants::GrantsAgent;
pub use literature::LiteratureAgent;
pub use news::NewsAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentKind {
    Literature,
    News,
    Grants,
    EmailTriage,
    CurrentEvents,
}

impl AgentKind {
    pub fn all() -> [AgentKind; 5] {
        [
            AgentKind::Literature,
            AgentKind::EmailTriage,
            AgentKind::News,
            AgentKind::Grants,
            AgentKind::CurrentEvents,
        ]
    }

    /// History key and config section name
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Literature => "literature",
            AgentKind::News => "news",
            AgentKind::Grants => "grants",
            AgentKind::EmailTriage => "email_triage",
            AgentKind::CurrentEvents => "current_events",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AgentKind::Literature => "Literature",
            AgentKind::News => "News",
            AgentKind::Grants => "Grants",
            AgentKind::EmailTriage => "Email Triage",
            AgentKind::CurrentEvents => "Current Events",
        }
    }

    /// Short name used on the command line and in chat
    pub fn alias(self) -> &'static str {
        match self {
            AgentKind::EmailTriage => "email",
            AgentKind::CurrentEvents => "current",
            other => other.name(),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        AgentKind::all()
            .into_iter()
            .find(|k| k.name() == wanted || k.alias() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = AgentKind::all().iter().map(|k| k.alias()).collect();
                format!("unknown agent '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Plain-text rendering of a report for chat replies.
pub trait Digest {
    fn digest(&self, label: &str) -> String;
}

/// Build the agent named by `kind` from `config` and run it once.
/// The report comes back as its chat digest.
pub async fn run(kind: AgentKind, pipeline: &Pipeline, config: &Config, mode: RunMode) -> RunOutcome<String> {
    let cfg = config.agent(kind.name());
    let label = kind.label();
    match kind {
        AgentKind::Literature => {
            let agent = LiteratureAgent::new(cfg, config.sources.literature.clone());
            run_agent(pipeline, &agent, mode).await.map(|r| r.digest(label))
        }
        AgentKind::News => {
            let agent = NewsAgent::new(cfg, config.sources.news.clone());
            run_agent(pipeline, &agent, mode).await.map(|r| r.digest(label))
        }
        AgentKind::Grants => {
            let agent = GrantsAgent::new(cfg, config.sources.grants.clone());
            run_agent(pipeline, &agent, mode).await.map(|r| r.digest(label))
        }
        AgentKind::EmailTriage => {
            let agent = EmailTriageAgent::new(cfg);
            run_agent(pipeline, &agent, mode).await.map(|r| r.digest(label))
        }
        AgentKind::CurrentEvents => {
            let agent = CurrentEventsAgent::new(cfg, config.sources.current_events.clone());
            run_agent(pipeline, &agent, mode).await.map(|r| r.digest(label))
        }
    }
}

/// Chat reply for a finished run.
pub fn describe_outcome(kind: AgentKind, outcome: &RunOutcome<String>) -> String {
    match outcome {
        RunOutcome::Delivered { report, .. } | RunOutcome::Previewed(report) => report.clone(),
        RunOutcome::Skipped(reason) if !reason.is_error() => {
            format!("*{}*: No new items found.", kind.label())
        }
        RunOutcome::Skipped(reason) => format!("*{}*: {}", kind.label(), reason),
    }
}

pub(crate) fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// `"[tag]"` suffix, empty when there is no tag.
pub(crate) fn bracketed(tag: &str) -> String {
    if tag.is_empty() {
        String::new()
    } else {
        format!(" [{}]", tag)
    }
}

/// Records each attempted delivery of one report.
pub(crate) struct Fanout<'a> {
    methods: &'a [DeliveryMethod],
    channels: &'a dyn Channels,
    report: DeliveryReport,
}

impl<'a> Fanout<'a> {
    pub fn new(cfg: &'a AgentConfig, channels: &'a dyn Channels) -> Self {
        Self {
            methods: &cfg.delivery,
            channels,
            report: DeliveryReport::default(),
        }
    }

    pub fn wants(&self, method: DeliveryMethod) -> bool {
        self.methods.contains(&method)
    }

    pub async fn text(&mut self, message: &str) {
        let ok = self.channels.send_text(message).await;
        self.report.record(DeliveryMethod::Text, ok);
    }

    pub async fn email(&mut self, subject: &str, html: &str) {
        let ok = self.channels.send_email(subject, html).await;
        self.report.record(DeliveryMethod::Email, ok);
    }

    pub async fn draft(&mut self, filename: &str, content: &str) {
        let ok = self.channels.save_draft(filename, content).await;
        self.report.record(DeliveryMethod::File, ok);
    }

    pub async fn notification(&mut self, title: &str, body: &str) {
        let ok = self.channels.send_notification(title, body).await;
        self.report.record(DeliveryMethod::Notification, ok);
    }

    pub async fn reminder(&mut self, title: &str) {
        let ok = self.channels.create_reminder(title).await;
        self.report.record(DeliveryMethod::Reminder, ok);
    }

    pub fn finish(self) -> DeliveryReport {
        self.report
    }
}

//! In-process wall-clock scheduler. Every tick compares local `HH:MM` with each
//! enabled agent's schedule and runs the agents that are due, one after another.

use chrono::{Datelike, NaiveDateTime};
use common::Config;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::agents::{self, AgentKind};
use crate::pipeline::{Pipeline, RunMode, RunOutcome};

pub const TICK: Duration = Duration::from_secs(30);

/// Agents whose schedule matches `now`, in run order.
pub fn due_agents(config: &Config, now: NaiveDateTime) -> Vec<AgentKind> {
    let hhmm = now.format("%H:%M").to_string();
    AgentKind::all()
        .into_iter()
        .filter(|k| {
            let cfg = config.agent(k.name());
            cfg.enabled
                && cfg
                    .schedule
                    .as_ref()
                    .is_some_and(|s| s.is_due(now.weekday(), &hhmm))
        })
        .collect()
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    config: Arc<Config>,
    /// Last minute (`%Y-%m-%d %H:%M`) each agent fired in
    fired: HashMap<AgentKind, String>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, config: Arc<Config>) -> Self {
        Self {
            pipeline,
            config,
            fired: HashMap::new(),
        }
    }

    /// Due agents that have not fired in this minute yet; they are recorded as fired.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<AgentKind> {
        let minute = now.format("%Y-%m-%d %H:%M").to_string();
        let mut due = Vec::new();
        for kind in due_agents(&self.config, now) {
            if self.fired.get(&kind) == Some(&minute) {
                continue;
            }
            self.fired.insert(kind, minute.clone());
            due.push(kind);
        }
        due
    }

    /// Log what will run when. Agents without times are never started.
    pub fn log_plan(&self) -> usize {
        let mut jobs = 0;
        for kind in AgentKind::all() {
            let cfg = self.config.agent(kind.name());
            if !cfg.enabled {
                info!(agent = kind.name(), "agent is disabled, skipping");
                continue;
            }
            match cfg.schedule.as_ref().filter(|s| !s.times.is_empty()) {
                Some(s) => {
                    jobs += 1;
                    info!(agent = kind.name(), times = ?s.times, days = ?s.days, "scheduled");
                }
                None => warn!(agent = kind.name(), "no schedule configured, skipping"),
            }
        }
        jobs
    }

    pub async fn tick(&mut self, now: NaiveDateTime) {
        let due = self.take_due(now);
        if due.is_empty() {
            return;
        }
        if !self.pipeline.summarizer().health_check().await {
            let names: Vec<&str> = due.iter().map(|k| k.name()).collect();
            error!(agents = ?names, "LLM backend not available, skipping scheduled runs");
            return;
        }
        for kind in due {
            info!(agent = kind.name(), "scheduled run");
            match agents::run(kind, &self.pipeline, &self.config, RunMode::Deliver).await {
                RunOutcome::Skipped(reason) if reason.is_error() => {
                    error!(agent = kind.name(), %reason, "scheduled run failed")
                }
                outcome => info!(agent = kind.name(), error = outcome.is_error(), "scheduled run finished"),
            }
        }
    }

    /// Tick until `shutdown` is notified.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let jobs = self.log_plan();
        info!(jobs, "scheduler starting");
        loop {
            self.tick(chrono::Local::now().naive_local()).await;
            select! {
                _ = tokio::time::sleep(TICK) => {},
                _ = shutdown.notified() => {
                    info!("scheduler: shutdown requested, exiting loop");
                    break;
                }
            }
        }
    }
}

//! Fetch → dedup → summarize → mark-seen → deliver, shared by every agent.
//!
//! A run never returns an error. Each early exit is a `SkipReason` that says
//! whether something broke or there was simply nothing to do; the caller
//! decides what to surface.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::delivery::{Channels, DeliveryReport};
use crate::history::HistoryStore;
use crate::llm::structured::{SummarizeError, Summarizer};

pub mod batch;

use batch::MergeError;

/// Default character budget for the numbered prompt
pub const DEFAULT_PROMPT_BUDGET: usize = 5000;

/// One source-specific instantiation of the pipeline.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    type Item: Send + Sync;
    type Report: Serialize + Send + Sync;

    /// History key; also the name used in logs
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> anyhow::Result<Vec<Self::Item>>;

    /// Stable, source-derived identifier used for dedup
    fn item_id<'a>(&self, item: &'a Self::Item) -> &'a str;

    /// Bound the deduplicated items to what is sent to the model. Order is kept.
    fn batch(&self, items: Vec<Self::Item>) -> Vec<Self::Item>;

    fn system_prompt(&self) -> String;

    /// Fields of one item as sent to the model (already clipped)
    fn render_item(&self, item: &Self::Item) -> String;

    /// Optional bracketed tag in the item header, e.g. `Item 3 [world]:`
    fn item_label<'a>(&self, _item: &'a Self::Item) -> Option<&'a str> {
        None
    }

    fn prompt_budget(&self) -> usize {
        DEFAULT_PROMPT_BUDGET
    }

    /// Join the model's judgments with the batch they refer to.
    fn merge(&self, batch: &[Self::Item], response: &Value) -> Result<Self::Report, MergeError>;

    async fn deliver(&self, report: &Self::Report, channels: &dyn Channels) -> DeliveryReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Deliver,
    /// Full run including mark-seen, but the payload is logged instead of sent
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Health,
    Fetch,
    Dedup,
    Summarize,
    Merge,
    MarkSeen,
    Deliver,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Health => "health",
            Stage::Fetch => "fetch",
            Stage::Dedup => "dedup",
            Stage::Summarize => "summarize",
            Stage::Merge => "merge",
            Stage::MarkSeen => "mark_seen",
            Stage::Deliver => "deliver",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BackendUnavailable,
    FetchFailed(String),
    NothingFetched,
    NothingNew,
    SummarizationUnavailable,
    /// Reply was not a JSON object (`Stage::Summarize`) or did not fit the
    /// agent's schema (`Stage::Merge`)
    MalformedModelOutput(Stage),
    SummarizationFailed,
    LedgerWriteFailed,
}

impl SkipReason {
    pub fn stage(&self) -> Stage {
        match self {
            SkipReason::BackendUnavailable => Stage::Health,
            SkipReason::FetchFailed(_) | SkipReason::NothingFetched => Stage::Fetch,
            SkipReason::NothingNew => Stage::Dedup,
            SkipReason::SummarizationUnavailable
            | SkipReason::SummarizationFailed => Stage::Summarize,
            SkipReason::MalformedModelOutput(stage) => *stage,
            SkipReason::LedgerWriteFailed => Stage::MarkSeen,
        }
    }

    /// False only for "nothing to do" outcomes
    pub fn is_error(&self) -> bool {
        !matches!(self, SkipReason::NothingFetched | SkipReason::NothingNew)
    }

    /// Repeated occurrences mean the local inference backend is down
    pub fn needs_alert(&self) -> bool {
        matches!(
            self,
            SkipReason::BackendUnavailable | SkipReason::SummarizationUnavailable
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BackendUnavailable => write!(f, "LLM backend is not running"),
            SkipReason::FetchFailed(e) => write!(f, "fetch failed: {}", e),
            SkipReason::NothingFetched => write!(f, "no items found"),
            SkipReason::NothingNew => write!(f, "all items already seen"),
            SkipReason::SummarizationUnavailable => {
                write!(f, "LLM backend unavailable after retries")
            }
            SkipReason::MalformedModelOutput(Stage::Merge) => {
                write!(f, "LLM output does not match the expected schema")
            }
            SkipReason::MalformedModelOutput(_) => write!(f, "LLM returned malformed JSON"),
            SkipReason::SummarizationFailed => write!(f, "LLM request failed"),
            SkipReason::LedgerWriteFailed => write!(f, "could not record seen items"),
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome<R> {
    Delivered { report: R, delivery: DeliveryReport },
    Previewed(R),
    Skipped(SkipReason),
}

impl<R> RunOutcome<R> {
    pub fn report(&self) -> Option<&R> {
        match self {
            RunOutcome::Delivered { report, .. } | RunOutcome::Previewed(report) => Some(report),
            RunOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            RunOutcome::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.skip_reason().is_some_and(SkipReason::is_error)
    }

    pub fn map<S>(self, f: impl FnOnce(R) -> S) -> RunOutcome<S> {
        match self {
            RunOutcome::Delivered { report, delivery } => RunOutcome::Delivered {
                report: f(report),
                delivery,
            },
            RunOutcome::Previewed(report) => RunOutcome::Previewed(f(report)),
            RunOutcome::Skipped(reason) => RunOutcome::Skipped(reason),
        }
    }
}

/// Shared collaborators of every run
#[derive(Clone)]
pub struct Pipeline {
    history: Arc<HistoryStore>,
    summarizer: Arc<Summarizer>,
    channels: Arc<dyn Channels>,
}

impl Pipeline {
    pub fn new(
        history: Arc<HistoryStore>,
        summarizer: Arc<Summarizer>,
        channels: Arc<dyn Channels>,
    ) -> Self {
        Self {
            history,
            summarizer,
            channels,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn summarizer(&self) -> &Summarizer {
        &self.summarizer
    }

    pub fn channels(&self) -> &dyn Channels {
        self.channels.as_ref()
    }
}

/// Drop items already in `seen`; repeated ids inside the batch keep their first occurrence.
pub fn dedup<A: Agent>(agent: &A, items: Vec<A::Item>, seen: &HashSet<String>) -> Vec<A::Item> {
    let mut in_batch = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let id = agent.item_id(item);
            !seen.contains(id) && in_batch.insert(id.to_string())
        })
        .collect()
}

/// Numbered prompt for exactly this batch, in this order.
pub fn build_prompt<A: Agent>(agent: &A, batch: &[A::Item]) -> String {
    let blocks: Vec<String> = batch
        .iter()
        .enumerate()
        .map(|(i, item)| batch::numbered_block(i + 1, agent.item_label(item), &agent.render_item(item)))
        .collect();
    batch::join_blocks(&blocks, agent.prompt_budget())
}

fn skipped<R>(agent: &str, reason: SkipReason) -> RunOutcome<R> {
    let stage = reason.stage();
    if reason.is_error() {
        error!(agent, %stage, %reason, "run skipped");
    } else {
        info!(agent, %stage, %reason, "run skipped");
    }
    RunOutcome::Skipped(reason)
}

/// Run one agent end to end.
pub async fn run_agent<A: Agent>(pipeline: &Pipeline, agent: &A, mode: RunMode) -> RunOutcome<A::Report> {
    let name = agent.name();
    info!(agent = name, ?mode, "running agent");

    if !pipeline.summarizer.health_check().await {
        return skipped(name, SkipReason::BackendUnavailable);
    }

    let items = match agent.fetch().await {
        Ok(items) if items.is_empty() => return skipped(name, SkipReason::NothingFetched),
        Ok(items) => items,
        Err(e) => return skipped(name, SkipReason::FetchFailed(format!("{:#}", e))),
    };
    let fetched = items.len();

    let seen = pipeline.history.get_seen_ids(name).await;
    let fresh = dedup(agent, items, &seen);
    if fresh.is_empty() {
        return skipped(name, SkipReason::NothingNew);
    }
    info!(agent = name, fetched, new = fresh.len(), "new items after dedup");

    // Everything that survived dedup counts as evaluated, including items the
    // batch cap leaves out of this prompt.
    let evaluated: Vec<String> = fresh.iter().map(|i| agent.item_id(i).to_string()).collect();

    let batch = agent.batch(fresh);
    let content = build_prompt(agent, &batch);

    let response = match pipeline
        .summarizer
        .structured_output(&agent.system_prompt(), &content)
        .await
    {
        Ok(v) => v,
        Err(SummarizeError::Unavailable { .. }) => {
            return skipped(name, SkipReason::SummarizationUnavailable)
        }
        Err(SummarizeError::Malformed(_)) => {
            return skipped(name, SkipReason::MalformedModelOutput(Stage::Summarize))
        }
        Err(SummarizeError::Failed(_)) => return skipped(name, SkipReason::SummarizationFailed),
    };

    let report = match agent.merge(&batch, &response) {
        Ok(r) => r,
        Err(e) => {
            error!(agent = name, error = %e, "model response does not match the expected schema");
            return skipped(name, SkipReason::MalformedModelOutput(Stage::Merge));
        }
    };

    if let Err(e) = pipeline.history.mark_seen(name, &evaluated).await {
        error!(agent = name, error = %e, "failed to persist history");
        return skipped(name, SkipReason::LedgerWriteFailed);
    }

    match mode {
        RunMode::Preview => {
            let payload = serde_json::to_string_pretty(&report).unwrap_or_default();
            info!(agent = name, "DRY RUN - would deliver:\n{}", payload);
            RunOutcome::Previewed(report)
        }
        RunMode::Deliver => {
            let delivery = agent.deliver(&report, pipeline.channels.as_ref()).await;
            if delivery.all_ok() {
                info!(agent = name, sent = delivery.sent(), "delivered");
            } else {
                warn!(
                    agent = name,
                    sent = delivery.sent(),
                    failed = ?delivery.failures(),
                    "some deliveries failed"
                );
            }
            RunOutcome::Delivered { report, delivery }
        }
    }
}

use anyhow::anyhow;
use briefing::delivery::{Channels, DeliveryReport};
use briefing::history::HistoryStore;
use briefing::llm::retry::RetryPolicy;
use briefing::llm::structured::Summarizer;
use briefing::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use briefing::pipeline::batch::{self, item_number, lenient_string, MergeError, Numbered};
use briefing::pipeline::{run_agent, Agent, Pipeline, RunMode, RunOutcome, SkipReason, Stage};
use common::DeliveryMethod;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------- test doubles ----------

struct FakeProvider {
    up: bool,
    replies: Mutex<Vec<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeProvider {
    fn replying(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            up: true,
            replies: Mutex::new(replies),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            up: false,
            replies: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for FakeProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let user = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(user);
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(LlmError::Empty);
        }
        let content = replies.remove(0)?;
        Ok(LlmResponse {
            content,
            usage: UsageMetadata::default(),
            model: "fake".into(),
        })
    }

    async fn health_check(&self) -> bool {
        self.up
    }

    fn model(&self) -> &str {
        "fake"
    }
}

#[derive(Default)]
struct FakeChannels {
    texts: Mutex<Vec<String>>,
    fail_text: bool,
}

#[async_trait::async_trait]
impl Channels for FakeChannels {
    async fn send_text(&self, message: &str) -> bool {
        self.texts.lock().unwrap().push(message.to_string());
        !self.fail_text
    }
    async fn send_email(&self, _subject: &str, _html_body: &str) -> bool {
        true
    }
    async fn save_draft(&self, _filename: &str, _content: &str) -> bool {
        true
    }
    async fn send_notification(&self, _title: &str, _body: &str) -> bool {
        true
    }
    async fn create_reminder(&self, _title: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct Note {
    id: String,
    title: String,
    body: String,
}

fn notes(ids: &[&str]) -> Vec<Note> {
    ids.iter()
        .map(|id| Note {
            id: id.to_string(),
            title: format!("Title {}", id),
            body: format!("Body of {}", id),
        })
        .collect()
}

#[derive(Deserialize)]
struct Pick {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    why: String,
}

impl Numbered for Pick {
    fn item_number(&self) -> Option<usize> {
        self.item_number
    }
}

#[derive(Debug, Serialize)]
struct Picked {
    id: String,
    title: String,
    why: String,
}

#[derive(Debug, Serialize)]
struct Digest {
    summary: String,
    picked: Vec<Picked>,
}

struct NotesAgent {
    items: Result<Vec<Note>, String>,
    cap: usize,
    fetches: AtomicUsize,
}

impl NotesAgent {
    fn new(items: Vec<Note>) -> Self {
        Self {
            items: Ok(items),
            cap: 10,
            fetches: AtomicUsize::new(0),
        }
    }

    fn failing(msg: &str) -> Self {
        Self {
            items: Err(msg.to_string()),
            cap: 10,
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Agent for NotesAgent {
    type Item = Note;
    type Report = Digest;

    fn name(&self) -> &'static str {
        "notes"
    }

    async fn fetch(&self) -> anyhow::Result<Vec<Note>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.items.clone().map_err(|e| anyhow!(e))
    }

    fn item_id<'a>(&self, item: &'a Note) -> &'a str {
        &item.id
    }

    fn batch(&self, mut items: Vec<Note>) -> Vec<Note> {
        items.truncate(self.cap);
        items
    }

    fn system_prompt(&self) -> String {
        "Pick the notes worth reading. Return {\"summary\": \"...\", \"picks\": [{\"item_number\": 1, \"why\": \"...\"}]}".into()
    }

    fn render_item(&self, item: &Note) -> String {
        format!("Title: {}\nBody: {}\n", item.title, batch::clip(&item.body, 100))
    }

    fn merge(&self, batch: &[Note], response: &Value) -> Result<Digest, MergeError> {
        let picks: Vec<Pick> = batch::assessments(response, "picks")?;
        Ok(Digest {
            summary: batch::text_field(response, "summary"),
            picked: batch::correlate(batch, picks)
                .into_iter()
                .map(|(note, pick)| Picked {
                    id: note.id.clone(),
                    title: note.title.clone(),
                    why: pick.why,
                })
                .collect(),
        })
    }

    async fn deliver(&self, report: &Digest, channels: &dyn Channels) -> DeliveryReport {
        let mut delivery = DeliveryReport::default();
        let ok = channels
            .send_text(&format!("{} ({} picked)", report.summary, report.picked.len()))
            .await;
        delivery.record(DeliveryMethod::Text, ok);
        delivery
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    history: Arc<HistoryStore>,
    channels: Arc<FakeChannels>,
    provider: Arc<FakeProvider>,
    pipeline: Pipeline,
}

fn harness_at(path: &Path, provider: Arc<FakeProvider>, channels: FakeChannels, dir: tempfile::TempDir) -> Harness {
    let history = Arc::new(HistoryStore::new(path, 5000));
    let channels = Arc::new(channels);
    let summarizer = Arc::new(Summarizer::new(
        provider.clone(),
        RetryPolicy::new(2, Duration::from_millis(1)),
    ));
    let pipeline = Pipeline::new(history.clone(), summarizer, channels.clone());
    Harness {
        _dir: dir,
        history,
        channels,
        provider,
        pipeline,
    }
}

fn harness(provider: Arc<FakeProvider>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    harness_at(&path, provider, FakeChannels::default(), dir)
}

fn pick_second() -> Result<String, LlmError> {
    Ok(r#"{"summary": "One worth it.", "picks": [{"item_number": 2, "why": "novel"}]}"#.into())
}

// ---------- scenarios ----------

#[tokio::test]
async fn test_all_survivors_marked_seen_but_only_picks_delivered() {
    let h = harness(FakeProvider::replying(vec![pick_second()]));
    let agent = NotesAgent::new(notes(&["a", "b", "c"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    let RunOutcome::Delivered { report, delivery } = outcome else {
        panic!("expected delivery");
    };
    assert_eq!(report.picked.len(), 1);
    assert_eq!(report.picked[0].id, "b");
    assert_eq!(report.picked[0].title, "Title b");
    assert_eq!(report.picked[0].why, "novel");
    assert!(delivery.all_ok());

    let seen = h.history.get_seen_ids("notes").await;
    assert_eq!(seen, HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()]));
    assert_eq!(h.channels.texts.lock().unwrap().as_slice(), ["One worth it. (1 picked)"]);

    let prompts = h.provider.prompts.lock().unwrap();
    assert!(prompts[0].starts_with("Item 1:\nTitle: Title a"));
    assert!(prompts[0].contains("\n---\nItem 3:\nTitle: Title c"));
}

#[tokio::test]
async fn test_second_run_finds_nothing_new() {
    let h = harness(FakeProvider::replying(vec![pick_second()]));
    let agent = NotesAgent::new(notes(&["a", "b", "c"]));

    run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    let again = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;

    assert_eq!(again.skip_reason(), Some(&SkipReason::NothingNew));
    assert!(!again.is_error());
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.channels.texts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_items_cut_by_batch_cap_are_still_marked_seen() {
    let h = harness(FakeProvider::replying(vec![Ok(r#"{"summary": "s", "picks": []}"#.into())]));
    let mut agent = NotesAgent::new(notes(&["a", "b", "c", "d"]));
    agent.cap = 2;

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert!(outcome.report().is_some());
    assert!(!h.provider.prompts.lock().unwrap()[0].contains("Item 3:"));
    assert_eq!(h.history.get_seen_ids("notes").await.len(), 4);
}

#[tokio::test]
async fn test_duplicate_ids_within_one_fetch_collapse() {
    let h = harness(FakeProvider::replying(vec![Ok(r#"{"summary": "s", "picks": []}"#.into())]));
    let mut items = notes(&["a", "b"]);
    items.push(Note {
        id: "a".into(),
        title: "Duplicate".into(),
        body: String::new(),
    });
    let agent = NotesAgent::new(items);

    run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    let prompt = h.provider.prompts.lock().unwrap()[0].clone();
    assert!(!prompt.contains("Duplicate"));
    assert!(!prompt.contains("Item 3:"));
}

#[tokio::test]
async fn test_empty_fetch_touches_nothing() {
    let h = harness(FakeProvider::replying(vec![]));
    let agent = NotesAgent::new(Vec::new());

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::NothingFetched));
    assert!(!outcome.is_error());
    assert_eq!(h.provider.calls(), 0);
    assert!(h.history.status("notes").await.is_none());
    assert!(h.channels.texts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_error_is_reported_not_raised() {
    let h = harness(FakeProvider::replying(vec![]));
    let agent = NotesAgent::failing("feed unreachable");

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    match outcome.skip_reason() {
        Some(SkipReason::FetchFailed(msg)) => assert!(msg.contains("feed unreachable")),
        other => panic!("expected FetchFailed, got {:?}", other),
    }
    assert!(outcome.is_error());
    assert!(h.history.status("notes").await.is_none());
}

#[tokio::test]
async fn test_backend_down_skips_before_fetch() {
    let h = harness(FakeProvider::down());
    let agent = NotesAgent::new(notes(&["a"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    let reason = outcome.skip_reason().unwrap();
    assert_eq!(reason, &SkipReason::BackendUnavailable);
    assert!(reason.needs_alert());
    assert_eq!(agent.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_output_leaves_history_alone() {
    let h = harness(FakeProvider::replying(vec![Ok("Sure! Here are the picks: 2".into())]));
    let agent = NotesAgent::new(notes(&["a", "b"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    let reason = outcome.skip_reason().unwrap();
    assert_eq!(reason, &SkipReason::MalformedModelOutput(Stage::Summarize));
    assert_eq!(reason.stage(), Stage::Summarize);
    assert_eq!(h.provider.calls(), 1);
    assert!(h.history.get_seen_ids("notes").await.is_empty());
    assert!(h.channels.texts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_schema_mismatch_is_malformed() {
    let h = harness(FakeProvider::replying(vec![Ok(r#"{"summary": "s", "picks": "2"}"#.into())]));
    let agent = NotesAgent::new(notes(&["a", "b"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert_eq!(
        outcome.skip_reason(),
        Some(&SkipReason::MalformedModelOutput(Stage::Merge))
    );
    assert!(h.history.get_seen_ids("notes").await.is_empty());
}

#[tokio::test]
async fn test_transient_failures_exhaust_to_unavailable() {
    let h = harness(FakeProvider::replying(vec![
        Err(LlmError::Connect("refused".into())),
        Err(LlmError::Timeout(Duration::from_secs(1))),
        Err(LlmError::Connect("refused".into())),
    ]));
    let agent = NotesAgent::new(notes(&["a"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::SummarizationUnavailable));
    assert_eq!(h.provider.calls(), 3);
    assert!(h.history.get_seen_ids("notes").await.is_empty());
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let h = harness(FakeProvider::replying(vec![
        Err(LlmError::Timeout(Duration::from_secs(1))),
        pick_second(),
    ]));
    let agent = NotesAgent::new(notes(&["a", "b"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert_eq!(outcome.report().unwrap().picked.len(), 1);
    assert_eq!(h.provider.calls(), 2);
}

#[tokio::test]
async fn test_api_error_is_not_retried() {
    let h = harness(FakeProvider::replying(vec![Err(LlmError::Api {
        status: 404,
        body: "model not found".into(),
    })]));
    let agent = NotesAgent::new(notes(&["a"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::SummarizationFailed));
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn test_preview_marks_seen_without_delivering() {
    let h = harness(FakeProvider::replying(vec![pick_second()]));
    let agent = NotesAgent::new(notes(&["a", "b"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Preview).await;
    assert!(matches!(outcome, RunOutcome::Previewed(_)));
    assert!(h.channels.texts.lock().unwrap().is_empty());
    assert_eq!(h.history.get_seen_ids("notes").await.len(), 2);
}

#[tokio::test]
async fn test_delivery_failure_does_not_roll_back_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    let channels = FakeChannels {
        fail_text: true,
        ..Default::default()
    };
    let h = harness_at(&path, FakeProvider::replying(vec![pick_second()]), channels, dir);
    let agent = NotesAgent::new(notes(&["a", "b"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    let RunOutcome::Delivered { delivery, .. } = outcome else {
        panic!("expected delivery attempt");
    };
    assert!(!delivery.all_ok());
    assert_eq!(delivery.failures(), vec![DeliveryMethod::Text]);
    assert_eq!(h.history.get_seen_ids("notes").await.len(), 2);
}

#[tokio::test]
async fn test_ledger_write_failure_blocks_delivery() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the ledger file should be: reads fail open, writes fail
    let path = dir.path().join("ledger");
    std::fs::create_dir(&path).unwrap();
    let h = harness_at(&path, FakeProvider::replying(vec![pick_second()]), FakeChannels::default(), dir);
    let agent = NotesAgent::new(notes(&["a", "b"]));

    let outcome = run_agent(&h.pipeline, &agent, RunMode::Deliver).await;
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::LedgerWriteFailed));
    assert!(h.channels.texts.lock().unwrap().is_empty());
}

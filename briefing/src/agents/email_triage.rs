use anyhow::Result;
use common::{AgentConfig, DeliveryMethod};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{today, Digest, Fanout};
use crate::delivery::{Channels, DeliveryReport};
use crate::pipeline::batch::{self, clip, item_number, lenient_string, MergeError, Numbered};
use crate::pipeline::Agent;
use crate::render;
use crate::sources::mail::{self, MailMessage};

const BODY_CLIP: usize = 1000;

const SYSTEM_PROMPT: &str = r#"You are an executive assistant for an academic physician. Below are numbered emails. For each, provide ONLY your analysis. Do NOT repeat the from address, subject, or date (those are already known).

Return JSON with this exact structure:
{
  "summary": "Brief overview of the inbox state",
  "urgent_count": 0,
  "assessments": [
    {
      "item_number": 1,
      "priority": "urgent|action-needed|fyi",
      "category": "meeting|request|review|deadline|informational",
      "one_liner": "What this email is about",
      "next_action": "What to do next",
      "draft_reply": "2-3 sentence professional reply, or empty string if no reply needed"
    }
  ]
}"#;

const PRIORITY_COLORS: [(&str, &str); 3] = [
    ("urgent", "#ff4444"),
    ("action-needed", "#ff8800"),
    ("fyi", "#44aa44"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub id: String,
    pub message: MailMessage,
}

impl From<MailMessage> for Email {
    fn from(message: MailMessage) -> Self {
        Email {
            id: message.message_id(),
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Assessment {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    priority: String,
    #[serde(default, deserialize_with = "lenient_string")]
    category: String,
    #[serde(default, deserialize_with = "lenient_string")]
    one_liner: String,
    #[serde(default, deserialize_with = "lenient_string")]
    next_action: String,
    #[serde(default, deserialize_with = "lenient_string")]
    draft_reply: String,
}

impl Numbered for Assessment {
    fn item_number(&self) -> Option<usize> {
        self.item_number
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriagedEmail {
    /// Position in the batch the model judged
    pub item_number: usize,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub priority: String,
    pub category: String,
    pub one_liner: String,
    pub next_action: String,
    pub draft_reply: String,
}

impl TriagedEmail {
    pub fn needs_action(&self) -> bool {
        matches!(self.priority.as_str(), "urgent" | "action-needed")
    }

    /// `reply_<subject>_<date>_<n>.txt` with the subject reduced to 50 safe characters.
    /// The item number keeps same-day drafts with a shared subject apart.
    pub fn draft_filename(&self, date: &str) -> String {
        let subject = if self.subject.is_empty() { "unknown" } else { self.subject.as_str() };
        let safe: String = subject
            .chars()
            .map(|c| if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_') { c } else { '_' })
            .take(50)
            .collect();
        format!("reply_{}_{}_{}.txt", safe, date, self.item_number)
    }

    pub fn draft_text(&self) -> String {
        format!("To: {}\nSubject: Re: {}\n\n{}", self.from, self.subject, self.draft_reply)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriageReport {
    pub summary: String,
    pub urgent_count: u32,
    pub items: Vec<TriagedEmail>,
}

impl TriageReport {
    pub fn to_html(&self, stamp: &str) -> String {
        let rows: Vec<Vec<String>> = self
            .items
            .iter()
            .map(|i| {
                vec![
                    render::td_colored(&i.priority, render::color_for(&i.priority, &PRIORITY_COLORS, "#888888")),
                    render::td(&i.from),
                    render::td(&i.subject),
                    render::td(&i.category),
                    render::td(&i.one_liner),
                    render::td(&i.next_action),
                    render::td_em(&i.draft_reply),
                ]
            })
            .collect();
        let table = render::table(
            &["Priority", "From", "Subject", "Category", "Summary", "Action", "Draft Reply"],
            &rows,
            false,
        );
        let intro = format!(
            "{}\n<p><strong>Urgent items:</strong> {}</p>",
            render::paragraph(&self.summary),
            self.urgent_count
        );
        render::page(&format!("Email Triage - {}", stamp), &intro, &table)
    }
}

impl Digest for TriageReport {
    fn digest(&self, label: &str) -> String {
        let mut lines = vec![
            format!("*{}* - {} emails, {} urgent\n", label, self.items.len(), self.urgent_count),
            self.summary.clone(),
        ];
        for i in &self.items {
            let icon = match i.priority.as_str() {
                "urgent" => "!!",
                "action-needed" => "!",
                _ => "",
            };
            lines.push(format!("\n{} {} (from {})", icon, i.subject, i.from));
            if !i.one_liner.is_empty() {
                lines.push(format!("  {}", i.one_liner));
            }
            if !i.next_action.is_empty() {
                lines.push(format!("  Action: {}", i.next_action));
            }
        }
        lines.join("\n")
    }
}

pub struct EmailTriageAgent {
    cfg: AgentConfig,
}

impl EmailTriageAgent {
    pub fn new(cfg: AgentConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait::async_trait]
impl Agent for EmailTriageAgent {
    type Item = Email;
    type Report = TriageReport;

    fn name(&self) -> &'static str {
        "email_triage"
    }

    async fn fetch(&self) -> Result<Vec<Email>> {
        let messages = mail::read_label(
            &self.cfg.mail_command,
            &self.cfg.label,
            self.cfg.max_items,
            mail::COMMAND_TIMEOUT,
        )
        .await?;
        Ok(messages.into_iter().map(Email::from).collect())
    }

    fn item_id<'a>(&self, item: &'a Email) -> &'a str {
        &item.id
    }

    fn batch(&self, mut items: Vec<Email>) -> Vec<Email> {
        items.truncate(self.cfg.max_items);
        items
    }

    fn system_prompt(&self) -> String {
        SYSTEM_PROMPT.to_string()
    }

    fn render_item(&self, item: &Email) -> String {
        let m = &item.message;
        format!(
            "From: {}\nSubject: {}\nDate: {}\nBody: {}\nAttachments: {}\n",
            m.from_addr,
            m.subject,
            m.date,
            clip(&m.body, BODY_CLIP),
            m.attachments
        )
    }

    fn merge(&self, batch: &[Email], response: &Value) -> Result<TriageReport, MergeError> {
        let assessments: Vec<Assessment> = batch::assessments(response, "assessments")?;
        let items = batch::correlate(batch, assessments)
            .into_iter()
            .map(|(e, a)| TriagedEmail {
                item_number: a.item_number.unwrap_or_default(),
                from: e.message.from_addr.clone(),
                subject: e.message.subject.clone(),
                date: e.message.date.clone(),
                priority: if a.priority.is_empty() { "fyi".to_string() } else { a.priority.to_lowercase() },
                category: a.category,
                one_liner: a.one_liner,
                next_action: a.next_action,
                draft_reply: a.draft_reply,
            })
            .collect();
        Ok(TriageReport {
            summary: batch::text_field(response, "summary"),
            urgent_count: batch::count_field(response, "urgent_count"),
            items,
        })
    }

    async fn deliver(&self, report: &TriageReport, channels: &dyn Channels) -> DeliveryReport {
        let mut out = Fanout::new(&self.cfg, channels);
        let date = today();

        if out.wants(DeliveryMethod::Text) && report.urgent_count > 0 {
            let urgent: Vec<&str> = report
                .items
                .iter()
                .filter(|i| i.priority == "urgent")
                .take(3)
                .map(|i| i.subject.as_str())
                .collect();
            let msg = format!(
                "{} urgent emails in {}: {}",
                report.urgent_count,
                self.cfg.label,
                urgent.join(", ")
            );
            out.text(&msg).await;
        }
        if out.wants(DeliveryMethod::Email) {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M").to_string();
            out.email(&format!("Email Triage - {}", date), &report.to_html(&stamp)).await;
        }
        if out.wants(DeliveryMethod::File) {
            for item in report.items.iter().filter(|i| !i.draft_reply.is_empty()) {
                out.draft(&item.draft_filename(&date), &item.draft_text()).await;
            }
        }
        if out.wants(DeliveryMethod::Reminder) {
            for item in report.items.iter().filter(|i| i.needs_action()) {
                let action = if item.next_action.is_empty() { "Review" } else { item.next_action.as_str() };
                out.reminder(&format!("Email: {} - {}", item.subject, action)).await;
            }
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{agent_config, RecordingChannels};
    use serde_json::json;
    use std::collections::HashSet;

    fn email(subject: &str) -> Email {
        Email::from(MailMessage {
            from_addr: "dean@uni.test".into(),
            subject: subject.into(),
            date: "2025-01-02".into(),
            body: "b".repeat(1200),
            attachments: "agenda.pdf".into(),
        })
    }

    fn agent(methods: &[DeliveryMethod]) -> EmailTriageAgent {
        EmailTriageAgent::new(agent_config(methods, 10))
    }

    #[test]
    fn id_and_rendering() {
        let e = email("Budget");
        assert_eq!(e.id, "dean@uni.test:Budget:2025-01-02");
        let text = agent(&[]).render_item(&e);
        assert!(text.starts_with("From: dean@uni.test\nSubject: Budget\nDate: 2025-01-02\nBody: "));
        assert!(text.contains(&format!("Body: {}\nAttachments: agenda.pdf\n", "b".repeat(1000))));
    }

    #[test]
    fn draft_filenames_are_safe() {
        let item = TriagedEmail {
            item_number: 4,
            from: "a@b".into(),
            subject: "Re: Q3/Q4 budget?".into(),
            date: String::new(),
            priority: "fyi".into(),
            category: String::new(),
            one_liner: String::new(),
            next_action: String::new(),
            draft_reply: "Thanks".into(),
        };
        assert_eq!(item.draft_filename("2025-01-02"), "reply_Re_ Q3_Q4 budget__2025-01-02_4.txt");
        assert_eq!(item.draft_text(), "To: a@b\nSubject: Re: Re: Q3/Q4 budget?\n\nThanks");
    }

    #[tokio::test]
    async fn fans_out_by_priority() {
        let a = agent(&[DeliveryMethod::Text, DeliveryMethod::File, DeliveryMethod::Reminder]);
        let batch = vec![email("Grant due"), email("Lunch"), email("IRB review")];
        let response = json!({
            "summary": "Busy inbox.",
            "urgent_count": "1",
            "assessments": [
                {"item_number": 1, "priority": "urgent", "next_action": "Submit", "draft_reply": "On it."},
                {"item_number": 2, "priority": "fyi"},
                {"item_number": 3, "priority": "action-needed", "draft_reply": ""}
            ]
        });
        let report = a.merge(&batch, &response).unwrap();
        assert_eq!(report.urgent_count, 1);

        let channels = RecordingChannels::default();
        a.deliver(&report, &channels).await;
        assert_eq!(
            channels.of(DeliveryMethod::Text)[0].0,
            "1 urgent emails in AI-REVIEW: Grant due"
        );
        let drafts = channels.of(DeliveryMethod::File);
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].0.starts_with("reply_Grant due_"));
        let reminders: Vec<String> = channels.of(DeliveryMethod::Reminder).into_iter().map(|(t, _)| t).collect();
        assert_eq!(reminders, vec!["Email: Grant due - Submit", "Email: IRB review - Review"]);
    }

    #[tokio::test]
    async fn same_subject_drafts_do_not_collide() {
        let a = agent(&[DeliveryMethod::File]);
        let batch = vec![email("Schedule"), email("Schedule")];
        let response = json!({
            "assessments": [
                {"item_number": 1, "priority": "action-needed", "draft_reply": "Tuesday works."},
                {"item_number": 2, "priority": "action-needed", "draft_reply": "Thursday works."}
            ]
        });
        let report = a.merge(&batch, &response).unwrap();

        let channels = RecordingChannels::default();
        a.deliver(&report, &channels).await;
        let names: HashSet<String> = channels
            .of(DeliveryMethod::File)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with("reply_Schedule_")));
    }

    #[tokio::test]
    async fn quiet_inbox_sends_no_text() {
        let a = agent(&[DeliveryMethod::Text]);
        let report = TriageReport {
            summary: "Nothing pressing.".into(),
            urgent_count: 0,
            items: vec![],
        };
        let channels = RecordingChannels::default();
        let delivery = a.deliver(&report, &channels).await;
        assert!(channels.calls().is_empty());
        assert_eq!(delivery.attempts().len(), 0);
    }

    #[test]
    fn missing_priority_defaults_to_fyi() {
        let a = agent(&[]);
        let report = a
            .merge(&[email("x")], &json!({"assessments": [{"item_number": 1}]}))
            .unwrap();
        assert_eq!(report.items[0].priority, "fyi");
        assert_eq!(report.urgent_count, 0);
        assert!(report.digest("Email Triage").starts_with("*Email Triage* - 1 emails, 0 urgent\n"));
    }
}

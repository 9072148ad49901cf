use anyhow::Result;
use common::{AgentConfig, DeliveryMethod, NewsSources};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{bracketed, today, Digest, Fanout};
use crate::delivery::{Channels, DeliveryReport};
use crate::pipeline::batch::{self, clip, item_number, lenient_string, MergeError, Numbered};
use crate::pipeline::Agent;
use crate::render;
use crate::sources::rss::{self, FeedItem};

const PER_FEED: usize = 10;
const SNIPPET_CLIP: usize = 300;

const SYSTEM_PROMPT: &str = r#"You are a news curator for a physician-informaticist. Below are numbered news items. For each, provide ONLY your analysis. Do NOT repeat the title, source, or URL.

Categorize each item: medical-ai, health-it, ai-general, policy, industry

Return JSON with this exact structure:
{
  "headline_summary": "2-3 sentence briefing of today's most important items",
  "selected_items": [
    {
      "item_number": 1,
      "category": "medical-ai",
      "one_liner": "Why this matters in one sentence",
      "relevance": "high|medium|low"
    }
  ]
}

Select at most 8 items. Prioritize actionable and novel information.
Skip routine product announcements unless from major health IT vendors."#;

const CATEGORY_COLORS: [(&str, &str); 5] = [
    ("medical-ai", "#0066cc"),
    ("health-it", "#009933"),
    ("ai-general", "#6600cc"),
    ("policy", "#cc6600"),
    ("industry", "#666666"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    pub source: String,
    pub url: String,
    pub snippet: String,
}

/// Feed URL, or `source:title[..50]` for entries without a link.
pub fn feed_item_id(item: &FeedItem) -> String {
    if item.url.is_empty() {
        format!("{}:{}", item.source, clip(&item.title, 50))
    } else {
        item.url.clone()
    }
}

impl From<FeedItem> for NewsItem {
    fn from(item: FeedItem) -> Self {
        NewsItem {
            id: feed_item_id(&item),
            title: item.title,
            source: item.source,
            url: item.url,
            snippet: item.summary,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Selection {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    category: String,
    #[serde(default, deserialize_with = "lenient_string")]
    one_liner: String,
    #[serde(default, deserialize_with = "lenient_string")]
    relevance: String,
}

impl Numbered for Selection {
    fn item_number(&self) -> Option<usize> {
        self.item_number
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedItem {
    pub title: String,
    pub source: String,
    pub url: String,
    pub category: String,
    pub one_liner: String,
    pub relevance: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewsReport {
    pub headline_summary: String,
    pub items: Vec<SelectedItem>,
}

impl NewsReport {
    pub fn to_html(&self, stamp: &str) -> String {
        let rows: Vec<Vec<String>> = self
            .items
            .iter()
            .map(|i| {
                vec![
                    render::td_colored(&i.category, render::color_for(&i.category, &CATEGORY_COLORS, "#333333")),
                    render::td_html(&render::link(&i.url, &i.title)),
                    render::td(&i.source),
                    render::td(&i.one_liner),
                    render::td(&i.relevance),
                ]
            })
            .collect();
        let table = render::table(&["Category", "Title", "Source", "Summary", "Relevance"], &rows, false);
        render::page(
            &format!("News Digest - {}", stamp),
            &render::paragraph(&self.headline_summary),
            &table,
        )
    }
}

impl Digest for NewsReport {
    fn digest(&self, label: &str) -> String {
        let mut lines = vec![
            format!("*{}* - {} items\n", label, self.items.len()),
            self.headline_summary.clone(),
        ];
        for i in &self.items {
            lines.push(format!("\n{}{}", i.title, bracketed(&i.category)));
            if !i.one_liner.is_empty() {
                lines.push(format!("  {}", i.one_liner));
            }
            lines.push(format!("  {}", i.url));
        }
        lines.join("\n")
    }
}

pub struct NewsAgent {
    cfg: AgentConfig,
    sources: NewsSources,
}

impl NewsAgent {
    pub fn new(cfg: AgentConfig, sources: NewsSources) -> Self {
        Self { cfg, sources }
    }
}

#[async_trait::async_trait]
impl Agent for NewsAgent {
    type Item = NewsItem;
    type Report = NewsReport;

    fn name(&self) -> &'static str {
        "news"
    }

    async fn fetch(&self) -> Result<Vec<NewsItem>> {
        let items = rss::fetch_multiple(&self.sources.feeds, PER_FEED)
            .await?
            .into_result()?;
        Ok(items.into_iter().map(NewsItem::from).collect())
    }

    fn item_id<'a>(&self, item: &'a NewsItem) -> &'a str {
        &item.id
    }

    fn batch(&self, mut items: Vec<NewsItem>) -> Vec<NewsItem> {
        items.truncate(self.cfg.max_items * 3);
        items
    }

    fn system_prompt(&self) -> String {
        SYSTEM_PROMPT.to_string()
    }

    fn render_item(&self, item: &NewsItem) -> String {
        format!(
            "Title: {}\nSource: {}\nSnippet: {}\n",
            item.title,
            item.source,
            clip(&item.snippet, SNIPPET_CLIP)
        )
    }

    fn merge(&self, batch: &[NewsItem], response: &Value) -> Result<NewsReport, MergeError> {
        let selections: Vec<Selection> = batch::assessments(response, "selected_items")?;
        let items = batch::correlate(batch, selections)
            .into_iter()
            .map(|(item, s)| SelectedItem {
                title: item.title.clone(),
                source: item.source.clone(),
                url: item.url.clone(),
                category: s.category,
                one_liner: s.one_liner,
                relevance: s.relevance,
            })
            .collect();
        Ok(NewsReport {
            headline_summary: batch::text_field(response, "headline_summary"),
            items,
        })
    }

    async fn deliver(&self, report: &NewsReport, channels: &dyn Channels) -> DeliveryReport {
        let mut out = Fanout::new(&self.cfg, channels);
        let headline = if report.headline_summary.is_empty() {
            "No summary available"
        } else {
            report.headline_summary.as_str()
        };

        if out.wants(DeliveryMethod::Text) {
            out.text(headline).await;
        }
        if out.wants(DeliveryMethod::Email) {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M").to_string();
            out.email(&format!("News Digest - {}", today()), &report.to_html(&stamp)).await;
        }
        if out.wants(DeliveryMethod::Notification) {
            let body = format!("{} items: {}", report.items.len(), clip(headline, 100));
            out.notification("News Monitor", &body).await;
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{agent_config, RecordingChannels};
    use serde_json::json;

    fn item(n: usize) -> NewsItem {
        NewsItem {
            id: format!("https://news.test/{}", n),
            title: format!("Story {}", n),
            source: "Health IT News".into(),
            url: format!("https://news.test/{}", n),
            snippet: "s".repeat(400),
        }
    }

    #[test]
    fn linkless_entries_get_a_synthetic_id() {
        let feed = FeedItem {
            title: "x".repeat(70),
            url: String::new(),
            summary: String::new(),
            source: "Wire".into(),
            published: None,
        };
        assert_eq!(feed_item_id(&feed), format!("Wire:{}", "x".repeat(50)));
    }

    #[test]
    fn batch_is_three_times_quota() {
        let a = NewsAgent::new(agent_config(&[], 2), NewsSources::default());
        assert_eq!(a.batch((1..=10).map(item).collect()).len(), 6);
        let rendered = a.render_item(&item(1));
        assert!(rendered.ends_with(&format!("Snippet: {}\n", "s".repeat(300))));
    }

    #[test]
    fn merge_keeps_source_facts() {
        let a = NewsAgent::new(agent_config(&[], 5), NewsSources::default());
        let batch: Vec<NewsItem> = (1..=2).map(item).collect();
        let response = json!({
            "headline_summary": "Big day.",
            "selected_items": [
                {"item_number": 2.0, "category": "policy", "one_liner": "Rules", "relevance": "high",
                 "url": "https://hallucinated.test"}
            ]
        });
        let report = a.merge(&batch, &response).unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].url, "https://news.test/2");
        assert_eq!(report.items[0].category, "policy");

        let html = report.to_html("2025-01-02 07:00");
        assert!(html.contains(r#"<td style="color:#cc6600;font-weight:bold;">policy</td>"#));
    }

    #[tokio::test]
    async fn notification_clips_headline() {
        let a = NewsAgent::new(
            agent_config(&[DeliveryMethod::Text, DeliveryMethod::Notification], 5),
            NewsSources::default(),
        );
        let report = NewsReport {
            headline_summary: "h".repeat(150),
            items: vec![],
        };
        let channels = RecordingChannels::default();
        a.deliver(&report, &channels).await;
        assert_eq!(channels.of(DeliveryMethod::Text)[0].0, "h".repeat(150));
        assert_eq!(
            channels.of(DeliveryMethod::Notification)[0].1,
            format!("0 items: {}", "h".repeat(100))
        );
        assert!(channels.of(DeliveryMethod::Email).is_empty());
    }
}

use anyhow::Result;
use common::{AgentConfig, CurrentEventsSources, DeliveryMethod, TopicConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use super::news::feed_item_id;
use super::{bracketed, today, Digest, Fanout};
use crate::delivery::{Channels, DeliveryReport};
use crate::pipeline::batch::{self, clip, item_number, lenient_string, MergeError, Numbered};
use crate::pipeline::Agent;
use crate::render;
use crate::sources::headlines::{self, CookieJar, Headline};
use crate::sources::rss::{self, FeedItem};
use crate::sources::{http_client, Gathered, DEFAULT_TIMEOUT_SECS};

const PER_FEED: usize = 8;
const PER_TOPIC: usize = 8;
const UNTOPICED: usize = 5;
const SNIPPET_CLIP: usize = 250;
const PROMPT_BUDGET: usize = 5500;
const DEFAULT_ITEM_HINT: &str = "2-3 items";

const IMPORTANCE_COLORS: [(&str, &str); 3] = [("high", "#cc0000"), ("medium", "#cc6600"), ("low", "#999999")];

#[derive(Debug, Clone, PartialEq)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub source: String,
    pub url: String,
    pub snippet: String,
    /// Key of the topic whose feed produced this item; empty for scraped headlines
    pub topic_hint: String,
}

impl Story {
    fn from_feed(item: FeedItem, topic: &str) -> Self {
        Story {
            id: feed_item_id(&item),
            title: item.title,
            source: item.source,
            url: item.url,
            snippet: item.summary,
            topic_hint: topic.to_string(),
        }
    }
}

impl From<Headline> for Story {
    fn from(h: Headline) -> Self {
        Story {
            id: h.url.clone(),
            title: h.title,
            source: h.source,
            url: h.url,
            snippet: String::new(),
            topic_hint: String::new(),
        }
    }
}

/// System prompt naming the configured topics, their enum keys and item hints.
pub fn system_prompt_for(topics: &[TopicConfig]) -> String {
    let names = topics.iter().map(|t| t.label.as_str()).collect::<Vec<_>>().join(", ");
    let topic_enum = topics.iter().map(|t| t.key.as_str()).collect::<Vec<_>>().join("|");
    let hints = topics
        .iter()
        .map(|t| format!("- {} for {}", t.item_hint.as_deref().unwrap_or(DEFAULT_ITEM_HINT), t.label))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a news briefing assistant. Below are numbered news items across these topics: {names}.

For each item, provide ONLY your analysis. Do NOT repeat the title, source, or URL.

Return JSON with this exact structure:
{{
  "briefing": "3-4 sentence executive summary covering the most important developments across all topics",
  "selected_items": [
    {{
      "item_number": 1,
      "topic": "{topic_enum}",
      "one_liner": "Why this matters in one sentence",
      "importance": "high|medium|low"
    }}
  ]
}}

Select the most important items across all topics. Aim for a balanced mix:
{hints}

Skip clickbait, opinion pieces, and routine/repetitive items."#
    )
}

#[derive(Debug, Deserialize)]
struct Selection {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    topic: String,
    #[serde(default, deserialize_with = "lenient_string")]
    one_liner: String,
    #[serde(default, deserialize_with = "lenient_string")]
    importance: String,
}

impl Numbered for Selection {
    fn item_number(&self) -> Option<usize> {
        self.item_number
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BriefingItem {
    pub title: String,
    pub source: String,
    pub url: String,
    pub topic: String,
    pub one_liner: String,
    pub importance: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BriefingReport {
    pub briefing: String,
    pub items: Vec<BriefingItem>,
}

impl BriefingReport {
    /// `(topic, count)` in first-seen order; an empty topic counts as "other".
    pub fn topic_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for item in &self.items {
            let topic = if item.topic.is_empty() { "other" } else { item.topic.as_str() };
            match counts.iter_mut().find(|(t, _)| t == topic) {
                Some((_, n)) => *n += 1,
                None => counts.push((topic.to_string(), 1)),
            }
        }
        counts
    }

    /// One section per configured topic in config order, then "Other".
    pub fn to_html(&self, topics: &[TopicConfig], stamp: &str) -> String {
        let headers = ["Importance", "Title", "Source", "Summary"];
        let row = |i: &BriefingItem| {
            vec![
                render::td_colored(&i.importance, render::color_for(&i.importance, &IMPORTANCE_COLORS, "#333333")),
                render::td_html(&render::link(&i.url, &i.title)),
                render::td(&i.source),
                render::td(&i.one_liner),
            ]
        };

        let mut sections = String::new();
        for topic in topics {
            let rows: Vec<Vec<String>> = self.items.iter().filter(|i| i.topic == topic.key).map(row).collect();
            if rows.is_empty() {
                continue;
            }
            sections.push_str(&format!(
                "<h3 style=\"color:{};margin-top:20px;\">{}</h3>\n{}\n",
                render::esc(topic.color.as_deref().unwrap_or("#333333")),
                render::esc(&topic.label),
                render::table(&headers, &rows, true)
            ));
        }

        let other: Vec<Vec<String>> = self
            .items
            .iter()
            .filter(|i| !topics.iter().any(|t| t.key == i.topic))
            .map(row)
            .collect();
        if !other.is_empty() {
            sections.push_str(&format!(
                "<h3 style=\"margin-top:20px;\">Other</h3>\n{}\n",
                render::table(&headers, &other, true)
            ));
        }

        let intro = format!(
            "<p style=\"font-size:16px;background:#f5f5f5;padding:12px;border-radius:6px;\">{}</p>",
            render::esc(&self.briefing)
        );
        render::page(&format!("Current Events Briefing - {}", stamp), &intro, &sections)
    }
}

impl Digest for BriefingReport {
    fn digest(&self, label: &str) -> String {
        let mut lines = vec![format!("*{}* - {} items\n", label, self.items.len()), self.briefing.clone()];
        for (topic, _) in self.topic_counts() {
            lines.push(format!("\n_{}_", topic));
            let in_topic = self
                .items
                .iter()
                .filter(|i| i.topic == topic || (i.topic.is_empty() && topic == "other"));
            for i in in_topic {
                lines.push(format!("  {}{}", i.title, bracketed(&i.importance)));
                if !i.one_liner.is_empty() {
                    lines.push(format!("    {}", i.one_liner));
                }
                lines.push(format!("    {}", i.url));
            }
        }
        lines.join("\n")
    }
}

pub struct CurrentEventsAgent {
    cfg: AgentConfig,
    sources: CurrentEventsSources,
}

impl CurrentEventsAgent {
    pub fn new(cfg: AgentConfig, sources: CurrentEventsSources) -> Self {
        Self { cfg, sources }
    }

    async fn scrape_paywalled(&self, gathered: &mut Gathered<Story>) -> Result<()> {
        let sites: Vec<_> = self.sources.paywalled.iter().filter(|s| s.enabled).collect();
        if sites.is_empty() {
            return Ok(());
        }
        let jar = match CookieJar::load(Path::new(&self.sources.cookie_file)).await {
            Ok(jar) => jar,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "ignoring unreadable browser auth file");
                CookieJar::default()
            }
        };
        let client = http_client(DEFAULT_TIMEOUT_SECS)?;
        for site in sites {
            let result = headlines::scrape(&client, &jar, &site.url, &site.name, headlines::MAX_PER_SITE).await;
            gathered.absorb(&site.name, result.map(|v| v.into_iter().map(Story::from).collect()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Agent for CurrentEventsAgent {
    type Item = Story;
    type Report = BriefingReport;

    fn name(&self) -> &'static str {
        "current_events"
    }

    async fn fetch(&self) -> Result<Vec<Story>> {
        let mut gathered: Gathered<Story> = Gathered::new();
        for topic in &self.sources.topics {
            let feeds = rss::fetch_multiple(&topic.feeds, PER_FEED).await?;
            gathered.absorb_all(feeds, |item| Story::from_feed(item, &topic.key));
        }
        self.scrape_paywalled(&mut gathered).await?;
        gathered.into_result()
    }

    fn item_id<'a>(&self, item: &'a Story) -> &'a str {
        &item.id
    }

    /// Up to eight items per topic in config order, then up to five untopiced ones.
    fn batch(&self, items: Vec<Story>) -> Vec<Story> {
        let mut selected = Vec::new();
        for topic in &self.sources.topics {
            selected.extend(
                items
                    .iter()
                    .filter(|s| s.topic_hint == topic.key)
                    .take(PER_TOPIC)
                    .cloned(),
            );
        }
        selected.extend(items.into_iter().filter(|s| s.topic_hint.is_empty()).take(UNTOPICED));
        selected
    }

    fn system_prompt(&self) -> String {
        system_prompt_for(&self.sources.topics)
    }

    fn render_item(&self, item: &Story) -> String {
        format!(
            "Title: {}\nSource: {}\nSnippet: {}\n",
            item.title,
            item.source,
            clip(&item.snippet, SNIPPET_CLIP)
        )
    }

    fn item_label<'a>(&self, item: &'a Story) -> Option<&'a str> {
        Some(item.topic_hint.as_str())
    }

    fn prompt_budget(&self) -> usize {
        PROMPT_BUDGET
    }

    fn merge(&self, batch: &[Story], response: &Value) -> Result<BriefingReport, MergeError> {
        let selections: Vec<Selection> = batch::assessments(response, "selected_items")?;
        let items = batch::correlate(batch, selections)
            .into_iter()
            .map(|(story, s)| BriefingItem {
                title: story.title.clone(),
                source: story.source.clone(),
                url: story.url.clone(),
                topic: if s.topic.is_empty() {
                    story.topic_hint.clone()
                } else {
                    s.topic.to_lowercase()
                },
                one_liner: s.one_liner,
                importance: s.importance.to_lowercase(),
            })
            .collect();
        Ok(BriefingReport {
            briefing: batch::text_field(response, "briefing"),
            items,
        })
    }

    async fn deliver(&self, report: &BriefingReport, channels: &dyn Channels) -> DeliveryReport {
        let mut out = Fanout::new(&self.cfg, channels);
        let time = chrono::Local::now().format("%H:%M").to_string();
        let date = today();

        if out.wants(DeliveryMethod::Text) {
            let text = if report.briefing.is_empty() { "No briefing available" } else { report.briefing.as_str() };
            out.text(text).await;
        }
        if out.wants(DeliveryMethod::Email) {
            let stamp = format!("{} {}", date, time);
            out.email(
                &format!("Current Events Briefing - {}", stamp),
                &report.to_html(&self.sources.topics, &stamp),
            )
            .await;
        }
        if out.wants(DeliveryMethod::Notification) {
            let summary = report
                .topic_counts()
                .iter()
                .map(|(t, n)| format!("{} {}", n, t))
                .collect::<Vec<_>>()
                .join(", ");
            out.notification("Current Events", &format!("{} items: {}", report.items.len(), summary))
                .await;
        }
        out.finish()
    }
}

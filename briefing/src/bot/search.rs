//! Ad-hoc `/search`: pull a handful of papers or headlines for a query and let
//! the model rank them. Links always come from the fetched records, never from
//! the model's reply.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};
use url::Url;

use crate::llm::structured::Summarizer;
use crate::pipeline::batch::{self, clip, item_number, lenient_string};
use crate::sources::{arxiv, http_client, pubmed, rss, Gathered, DEFAULT_TIMEOUT_SECS};

pub const GOOGLE_NEWS_URL: &str = "https://news.google.com/rss/search";

const RESEARCH_PER_SOURCE: usize = 10;
const NEWS_MAX_ITEMS: usize = 15;
const ABSTRACT_CHARS: usize = 500;
const PROMPT_BUDGET: usize = 12_000;

const RESEARCH_PROMPT: &str = r#"You are a research assistant. Given search results from PubMed and arXiv, rank them by relevance to the query. Return JSON with:
{"summary": "1-2 sentence overview of findings", "top_results": [{"item_number": N, "title": "...", "one_liner": "why this is relevant", "relevance": "high/medium/low"}]}
Return at most 5 top results, most relevant first."#;

const NEWS_PROMPT: &str = r#"You are a news analyst. Given news search results, summarize the key themes and rank by importance. Return JSON with:
{"summary": "2-3 sentence briefing on the topic", "top_items": [{"item_number": N, "one_liner": "why this is significant"}]}
Return at most 7 top items, most important first."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Research,
    News,
}

impl SearchKind {
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "research" | "papers" | "literature" | "pubmed" | "arxiv" => Some(SearchKind::Research),
            "news" | "headlines" => Some(SearchKind::News),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SearchKind::Research => "Research",
            SearchKind::News => "News",
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            SearchKind::Research => RESEARCH_PROMPT,
            SearchKind::News => NEWS_PROMPT,
        }
    }

    fn ranking_key(&self) -> &'static str {
        match self {
            SearchKind::Research => "top_results",
            SearchKind::News => "top_items",
        }
    }

    fn max_shown(&self) -> usize {
        match self {
            SearchKind::Research => 5,
            SearchKind::News => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub kind: SearchKind,
    pub query: String,
}

/// One search result as fetched
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// Where it came from: `PubMed`, `arXiv` or the feed's source name
    pub source: String,
    pub title: String,
    pub authors: String,
    pub snippet: String,
    pub url: String,
}

impl From<pubmed::Article> for Hit {
    fn from(a: pubmed::Article) -> Self {
        Self {
            source: "PubMed".into(),
            title: a.title,
            authors: a.authors,
            snippet: a.abstract_text,
            url: a.url,
        }
    }
}

impl From<arxiv::Preprint> for Hit {
    fn from(p: arxiv::Preprint) -> Self {
        Self {
            source: "arXiv".into(),
            title: p.title,
            authors: p.authors,
            snippet: p.abstract_text,
            url: p.url,
        }
    }
}

impl From<rss::FeedItem> for Hit {
    fn from(item: rss::FeedItem) -> Self {
        Self {
            source: item.source,
            title: item.title,
            authors: String::new(),
            snippet: String::new(),
            url: item.url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Ranked {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    one_liner: String,
    #[serde(default, deserialize_with = "lenient_string")]
    relevance: String,
}

/// Base URLs of the services a search talks to
#[derive(Debug, Clone)]
pub struct SearchSources {
    pub pubmed: String,
    pub arxiv: String,
    pub news: String,
}

impl Default for SearchSources {
    fn default() -> Self {
        Self {
            pubmed: pubmed::EUTILS_URL.to_string(),
            arxiv: arxiv::API_URL.to_string(),
            news: GOOGLE_NEWS_URL.to_string(),
        }
    }
}

impl SearchSources {
    pub fn news_url(&self, query: &str) -> Result<String> {
        let url = Url::parse_with_params(
            &self.news,
            &[("q", query), ("hl", "en-US"), ("gl", "US"), ("ceid", "US:en")],
        )
        .with_context(|| format!("invalid news search URL {}", self.news))?;
        Ok(url.to_string())
    }

    /// Fetch results in a stable order: the numbering the model sees.
    pub async fn gather(&self, search: &SearchQuery) -> Result<Vec<Hit>> {
        let client = http_client(DEFAULT_TIMEOUT_SECS)?;
        let mut gathered: Gathered<Hit> = Gathered::new();
        match search.kind {
            SearchKind::Research => {
                let pubmed = pubmed::PubMedClient::new(
                    client.clone(),
                    self.pubmed.as_str(),
                    std::env::var(pubmed::API_KEY_ENV).ok(),
                );
                let result = pubmed.search(&search.query, RESEARCH_PER_SOURCE).await;
                gathered.absorb("pubmed", result.map(|v| v.into_iter().map(Hit::from).collect()));

                let result = arxiv::search(&client, &self.arxiv, &search.query, &[], RESEARCH_PER_SOURCE).await;
                gathered.absorb("arxiv", result.map(|v| v.into_iter().map(Hit::from).collect()));
            }
            SearchKind::News => {
                let url = self.news_url(&search.query)?;
                let result = rss::fetch_and_parse_feed(&client, &url).await.map(|feed| {
                    rss::feed_items(&feed, "Google News", NEWS_MAX_ITEMS)
                        .into_iter()
                        .map(Hit::from)
                        .collect()
                });
                gathered.absorb("google news", result);
            }
        }
        info!(kind = search.kind.label(), query = %search.query, hits = gathered.len(), "search fetched");
        gathered.into_result()
    }
}

fn render_hit(kind: SearchKind, hit: &Hit) -> String {
    match kind {
        SearchKind::Research => format!(
            "[{}] {}\nAuthors: {}\nAbstract: {}",
            hit.source,
            hit.title,
            hit.authors,
            clip(&hit.snippet, ABSTRACT_CHARS)
        ),
        SearchKind::News => format!("{} ({})", hit.title, hit.source),
    }
}

/// Numbered prompt content, headed by the query.
pub fn build_content(search: &SearchQuery, hits: &[Hit]) -> String {
    let blocks: Vec<String> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| batch::numbered_block(i + 1, None, &render_hit(search.kind, hit)))
        .collect();
    format!(
        "Query: {}\n\n{}",
        search.query,
        batch::join_blocks(&blocks, PROMPT_BUDGET)
    )
}

/// The model's picks in its own order. Out-of-range and repeated numbers are dropped.
fn ranked_hits<'a>(kind: SearchKind, hits: &'a [Hit], response: &Value) -> Vec<(&'a Hit, Ranked)> {
    let ranked: Vec<Ranked> = match batch::assessments(response, kind.ranking_key()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unusable search ranking");
            return Vec::new();
        }
    };
    let mut taken = HashSet::new();
    ranked
        .into_iter()
        .filter_map(|r| {
            let n = r.item_number.filter(|n| (1..=hits.len()).contains(n))?;
            taken.insert(n).then(|| (&hits[n - 1], r))
        })
        .take(kind.max_shown())
        .collect()
}

/// Telegram reply for a search. Without a usable ranking the first few hits are listed as fetched.
pub fn format_reply(search: &SearchQuery, hits: &[Hit], response: Option<&Value>) -> String {
    let kind = search.kind;
    let mut lines = vec![format!("*{}: {}*\n", kind.label(), search.query)];

    let summary = response.map(|r| batch::text_field(r, "summary")).unwrap_or_default();
    if !summary.is_empty() {
        lines.push(summary);
    }

    let picks = response.map(|r| ranked_hits(kind, hits, r)).unwrap_or_default();
    if picks.is_empty() {
        for hit in hits.iter().take(kind.max_shown()) {
            lines.push(format!("\n{}", hit.title));
            lines.push(format!("  {}", hit.url));
        }
    } else {
        for (hit, r) in picks {
            let title = if kind == SearchKind::Research && !r.title.is_empty() {
                r.title.as_str()
            } else {
                hit.title.as_str()
            };
            let tag = if r.relevance.is_empty() {
                String::new()
            } else {
                format!(" [{}]", r.relevance)
            };
            lines.push(format!("\n{}{}", title, tag));
            if !r.one_liner.is_empty() {
                lines.push(format!("  {}", r.one_liner));
            }
            lines.push(format!("  {}", hit.url));
        }
    }
    lines.join("\n")
}

/// Rank `hits` with the model and format the reply. A failed ranking still lists the hits.
pub async fn rank(summarizer: &Summarizer, search: &SearchQuery, hits: &[Hit]) -> String {
    if hits.is_empty() {
        return format!("No {} results found for: _{}_", search.kind.label().to_lowercase(), search.query);
    }
    let content = build_content(search, hits);
    let response = match summarizer
        .structured_output(search.kind.system_prompt(), &content)
        .await
    {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(query = %search.query, error = %e, "search ranking failed, listing unranked");
            None
        }
    };
    format_reply(search, hits, response.as_ref())
}

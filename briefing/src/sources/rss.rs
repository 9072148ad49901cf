use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use feed_rs::model::Feed;
use feed_rs::parser;
use reqwest::Client;
use std::time::Duration;

use super::{http_client, plain_text, Gathered, DEFAULT_TIMEOUT_SECS};
use common::FeedConfig;

const MAX_ATTEMPTS: u32 = 3;

/// One entry of an RSS/Atom feed, reduced to what the agents use
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub url: String,
    pub summary: String,
    pub source: String,
    pub published: Option<DateTime<Utc>>,
}

/// Fetches a feed from the given URL and parses it.
///
/// Server errors, rate limiting and network failures are retried with a
/// doubling backoff; other client errors fail immediately.
pub async fn fetch_and_parse_feed(client: &Client, url: &str) -> Result<Feed> {
    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            let backoff = Duration::from_secs(2u64.pow(attempt - 2)); // 1s, 2s
            tracing::info!(url, attempt, backoff = ?backoff, "retrying feed fetch");
            tokio::time::sleep(backoff).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let bytes = response.bytes().await.context("failed to read response body")?;
                    return parser::parse(bytes.as_ref()).context("failed to parse feed");
                } else if status.is_server_error() {
                    last_error = Some(anyhow::anyhow!("server error: {}", status));
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow::anyhow!("rate limited: {}", status));
                } else {
                    // Other 4xx are permanent
                    anyhow::bail!("feed fetch failed with status: {}", status);
                }
            }
            Err(e) => {
                last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
}

/// Flatten a parsed feed into at most `max_items` entries, in feed order.
pub fn feed_items(feed: &Feed, source: &str, max_items: usize) -> Vec<FeedItem> {
    feed.entries
        .iter()
        .take(max_items)
        .map(|entry| {
            let summary = entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
                .unwrap_or_default();
            FeedItem {
                title: entry
                    .title
                    .as_ref()
                    .map(|t| plain_text(&t.content))
                    .unwrap_or_default(),
                url: entry.links.first().map(|l| l.href.clone()).unwrap_or_default(),
                summary: plain_text(&summary),
                source: source.to_string(),
                published: entry.published.or(entry.updated),
            }
        })
        .collect()
}

/// Display name for a configured feed: its name, else the feed's own title, else the URL.
fn source_name(cfg: &FeedConfig, feed: &Feed) -> String {
    cfg.name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| feed.title.as_ref().map(|t| t.content.trim().to_string()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| cfg.url.clone())
}

pub async fn fetch_feed(client: &Client, cfg: &FeedConfig, max_items: usize) -> Result<Vec<FeedItem>> {
    let feed = fetch_and_parse_feed(client, &cfg.url)
        .await
        .with_context(|| format!("feed {}", cfg.url))?;
    let source = source_name(cfg, &feed);
    Ok(feed_items(&feed, &source, max_items))
}

/// Fetch every feed in turn; a failing feed is logged and skipped.
pub async fn fetch_multiple(feeds: &[FeedConfig], max_per_feed: usize) -> Result<Gathered<FeedItem>> {
    let client = http_client(DEFAULT_TIMEOUT_SECS)?;
    let mut gathered = Gathered::new();
    for cfg in feeds {
        let result = fetch_feed(&client, cfg, max_per_feed).await;
        gathered.absorb(&cfg.url, result);
    }
    tracing::info!(feeds = feeds.len(), items = gathered.len(), "fetched feeds");
    Ok(gathered)
}

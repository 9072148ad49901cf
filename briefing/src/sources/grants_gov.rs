use anyhow::{Context, Result};
use feed_rs::model::Feed;
use reqwest::Client;

use super::plain_text;
use super::rss::fetch_and_parse_feed;
use crate::pipeline::batch::clip;

const DESCRIPTION_MAX_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub opportunity_id: String,
    pub title: String,
    pub agency: String,
    pub deadline: String,
    pub url: String,
    pub description: String,
}

/// Case-insensitive substring match of any keyword; no keywords keeps everything.
pub fn matches_keywords(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .any(|k| haystack.contains(&k))
}

pub fn parse_feed(feed: &Feed, keywords: &[String], max_results: usize) -> Vec<Opportunity> {
    let mut out = Vec::new();
    for entry in &feed.entries {
        let title = entry.title.as_ref().map(|t| plain_text(&t.content)).unwrap_or_default();
        let description = entry
            .summary
            .as_ref()
            .map(|s| plain_text(&s.content))
            .unwrap_or_default();
        if !matches_keywords(&format!("{} {}", title, description), keywords) {
            continue;
        }
        let url = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
        let opportunity_id = if entry.id.is_empty() { url.clone() } else { entry.id.clone() };
        out.push(Opportunity {
            opportunity_id,
            title,
            agency: entry.authors.first().map(|a| a.name.clone()).unwrap_or_default(),
            deadline: entry
                .published
                .map(|d| d.format("%a, %d %b %Y").to_string())
                .unwrap_or_default(),
            url,
            description: clip(&description, DESCRIPTION_MAX_CHARS).to_string(),
        });
        if out.len() >= max_results {
            break;
        }
    }
    out
}

pub async fn search(client: &Client, feed_url: &str, keywords: &[String], max_results: usize) -> Result<Vec<Opportunity>> {
    let feed = fetch_and_parse_feed(client, feed_url)
        .await
        .context("Grants.gov feed")?;
    Ok(parse_feed(&feed, keywords, max_results))
}

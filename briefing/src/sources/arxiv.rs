use anyhow::{Context, Result};
use feed_rs::model::Feed;
use reqwest::Client;

use super::{plain_text, short_authors};

pub const API_URL: &str = "https://export.arxiv.org/api/query";

#[derive(Debug, Clone, PartialEq)]
pub struct Preprint {
    pub arxiv_id: String,
    pub title: String,
    pub authors: String,
    pub abstract_text: String,
    pub url: String,
    /// `YYYY-MM-DD`
    pub published: String,
}

/// `(query) AND (cat:a OR cat:b)`, or the bare query without categories.
pub fn search_query(query: &str, categories: &[String]) -> String {
    if categories.is_empty() {
        return query.to_string();
    }
    let cats = categories
        .iter()
        .map(|c| format!("cat:{}", c))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("({}) AND ({})", query, cats)
}

pub async fn search(
    client: &Client,
    base_url: &str,
    query: &str,
    categories: &[String],
    max_results: usize,
) -> Result<Vec<Preprint>> {
    let max = max_results.to_string();
    let resp = client
        .get(base_url)
        .query(&[
            ("search_query", search_query(query, categories).as_str()),
            ("start", "0"),
            ("max_results", max.as_str()),
            ("sortBy", "submittedDate"),
            ("sortOrder", "descending"),
        ])
        .send()
        .await
        .context("arXiv request failed")?
        .error_for_status()
        .context("arXiv returned an error")?;
    let bytes = resp.bytes().await.context("failed to read arXiv response")?;
    let feed = feed_rs::parser::parse(bytes.as_ref()).context("failed to parse arXiv feed")?;
    Ok(parse_feed(&feed))
}

pub fn parse_feed(feed: &Feed) -> Vec<Preprint> {
    feed.entries
        .iter()
        .map(|entry| {
            let arxiv_id = entry
                .id
                .rsplit_once("/abs/")
                .map(|(_, id)| id.to_string())
                .unwrap_or_else(|| entry.id.clone());
            let url = entry
                .links
                .iter()
                .find(|l| l.media_type.as_deref() == Some("text/html"))
                .map(|l| l.href.clone())
                .unwrap_or_else(|| format!("https://arxiv.org/abs/{}", arxiv_id));
            let authors: Vec<String> = entry.authors.iter().map(|p| p.name.clone()).collect();
            Preprint {
                arxiv_id,
                title: entry.title.as_ref().map(|t| plain_text(&t.content)).unwrap_or_default(),
                authors: short_authors(&authors),
                abstract_text: entry
                    .summary
                    .as_ref()
                    .map(|s| plain_text(&s.content))
                    .unwrap_or_default(),
                url,
                published: entry
                    .published
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

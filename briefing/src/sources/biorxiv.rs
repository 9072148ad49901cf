use anyhow::{Context, Result};
use feed_rs::model::Feed;
use reqwest::Client;

use super::rss::fetch_and_parse_feed;
use super::{plain_text, short_authors};
use crate::pipeline::batch::clip;

pub const FEED_URL: &str = "https://connect.biorxiv.org/biorxiv_xml.php";
const ABSTRACT_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct BiorxivPaper {
    /// `10.1101/...` without version suffix; empty when the feed gives none
    pub doi: String,
    pub title: String,
    pub authors: String,
    pub abstract_text: String,
    pub published: String,
    pub url: String,
}

pub fn subject_url(base_url: &str, subject: &str) -> Result<String> {
    let url = url::Url::parse_with_params(base_url, &[("subject", subject)])
        .with_context(|| format!("invalid bioRxiv feed URL {}", base_url))?;
    Ok(url.into())
}

/// Pull a bare DOI out of a bioRxiv link or identifier.
///
/// `https://www.biorxiv.org/content/10.1101/2025.01.02.631234v1?rss=1`
/// becomes `10.1101/2025.01.02.631234`.
pub fn extract_doi(text: &str) -> Option<String> {
    let start = text.find("10.1101/")?;
    let rest = &text[start..];
    let end = rest.find(['?', '#', ' ']).unwrap_or(rest.len());
    let doi = rest[..end].trim_end_matches('/');
    let doi = match doi.rfind('v') {
        Some(v) if v > "10.1101/".len()
            && doi[v + 1..].chars().all(|c| c.is_ascii_digit())
            && v + 1 < doi.len() =>
        {
            &doi[..v]
        }
        _ => doi,
    };
    Some(doi.to_string())
}

pub fn parse_feed(feed: &Feed, max_results: usize) -> Vec<BiorxivPaper> {
    feed.entries
        .iter()
        .take(max_results)
        .map(|entry| {
            let url = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
            let doi = extract_doi(&entry.id)
                .or_else(|| extract_doi(&url))
                .unwrap_or_default();
            let authors: Vec<String> = entry.authors.iter().map(|p| p.name.clone()).collect();
            let abstract_text = entry
                .summary
                .as_ref()
                .map(|s| plain_text(&s.content))
                .unwrap_or_default();
            BiorxivPaper {
                doi,
                title: entry.title.as_ref().map(|t| plain_text(&t.content)).unwrap_or_default(),
                authors: short_authors(&authors),
                abstract_text: clip(&abstract_text, ABSTRACT_MAX_CHARS).to_string(),
                published: entry
                    .published
                    .or(entry.updated)
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                url,
            }
        })
        .collect()
}

pub async fn fetch(client: &Client, base_url: &str, subject: &str, max_results: usize) -> Result<Vec<BiorxivPaper>> {
    let url = subject_url(base_url, subject)?;
    let feed = fetch_and_parse_feed(client, &url)
        .await
        .with_context(|| format!("bioRxiv subject {}", subject))?;
    Ok(parse_feed(&feed, max_results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doi_from_links() {
        assert_eq!(
            extract_doi("https://www.biorxiv.org/content/10.1101/2025.01.02.631234v1?rss=1").as_deref(),
            Some("10.1101/2025.01.02.631234")
        );
        assert_eq!(
            extract_doi("doi:10.1101/2025.01.02.631234").as_deref(),
            Some("10.1101/2025.01.02.631234")
        );
        assert_eq!(extract_doi("http://biorxiv.org/cgi/content/short/123"), None);
    }

    #[test]
    fn builds_subject_url() {
        assert_eq!(
            subject_url(FEED_URL, "bioinformatics").unwrap(),
            "https://connect.biorxiv.org/biorxiv_xml.php?subject=bioinformatics"
        );
    }

    #[test]
    fn parses_rss_entries() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>bioRxiv Subject Collection: Bioinformatics</title>
<item>
  <title>Protein language models for variant effect</title>
  <link>https://www.biorxiv.org/content/10.1101/2025.01.02.631234v2?rss=1</link>
  <description>We benchmark PLMs.</description>
  <pubDate>Thu, 02 Jan 2025 00:00:00 GMT</pubDate>
</item>
<item>
  <title>No DOI here</title>
  <link>https://example.test/x</link>
</item>
</channel></rss>"#;
        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        let papers = parse_feed(&feed, 10);
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[0].doi, "10.1101/2025.01.02.631234");
        assert_eq!(papers[0].abstract_text, "We benchmark PLMs.");
        assert_eq!(papers[0].published, "2025-01-02");
        assert!(papers[1].doi.is_empty());
        assert_eq!(parse_feed(&feed, 1).len(), 1);
    }
}

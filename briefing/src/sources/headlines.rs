//! Headline links from subscription news front pages.
//!
//! Pages are fetched with a plain HTTP client; a subscriber session comes from
//! a browser storage-state export (`{"cookies": [...]}`) whose cookies are sent
//! for matching hosts.

use anyhow::{Context, Result};
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use url::Url;

use super::collapse_ws;
use crate::pipeline::batch::clip;

const LINK_SELECTOR: &str = "article a, h2 a, h3 a, [class*='headline'] a, [class*='story'] a";
const MIN_TITLE_CHARS: usize = 10;
const MAX_TITLE_CHARS: usize = 200;
pub const MAX_PER_SITE: usize = 5;
const BROWSER_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq)]
pub struct Headline {
    pub title: String,
    pub url: String,
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CookieJar {
    #[serde(default)]
    cookies: Vec<StoredCookie>,
}

impl CookieJar {
    /// Missing file is an empty jar; an unreadable one is an error.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("invalid browser auth file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "no browser auth file, fetching without cookies");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `Cookie` header value for `url`, if any stored cookie applies.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let path = url.path();
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| domain_matches(host, &c.domain))
            .filter(|c| c.path.as_deref().map_or(true, |p| path.starts_with(p)))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    !domain.is_empty()
        && (host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase())))
}

/// Headline links on a page: text of at least ten characters, absolute or
/// root-relative URLs, first occurrence of each URL, at most `max_items`.
pub fn extract_headlines(html: &str, page_url: &Url, source: &str, max_items: usize) -> Vec<Headline> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse(LINK_SELECTOR) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = ?e, "invalid headline selector");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for link in document.select(&selector) {
        let text = collapse_ws(&link.text().collect::<String>());
        if text.chars().count() < MIN_TITLE_CHARS {
            continue;
        }
        let Some(href) = link.value().attr("href") else { continue };
        let resolved = if href.starts_with('/') {
            match page_url.join(href) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            }
        } else if href.starts_with("http") {
            href.to_string()
        } else {
            continue;
        };
        if !seen.insert(resolved.clone()) {
            continue;
        }
        out.push(Headline {
            title: clip(&text, MAX_TITLE_CHARS).to_string(),
            url: resolved,
            source: source.to_string(),
        });
        if out.len() >= max_items {
            break;
        }
    }
    out
}

pub async fn scrape(client: &Client, jar: &CookieJar, page: &str, source: &str, max_items: usize) -> Result<Vec<Headline>> {
    let page_url = Url::parse(page).with_context(|| format!("invalid site URL {}", page))?;
    let mut req = client.get(page_url.clone()).header(USER_AGENT, BROWSER_UA);
    if let Some(cookie) = jar.header_for(&page_url) {
        req = req.header(COOKIE, cookie);
    }
    let html = req
        .send()
        .await
        .with_context(|| format!("failed to fetch {}", page))?
        .error_for_status()
        .with_context(|| format!("{} returned an error", page))?
        .text()
        .await
        .context("failed to read page body")?;

    let source = if source.is_empty() { page } else { source };
    let headlines = extract_headlines(&html, &page_url, source, max_items);
    tracing::debug!(site = source, count = headlines.len(), "scraped headlines");
    Ok(headlines)
}

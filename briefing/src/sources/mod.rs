//! Source adapters. Each one fetches raw records over HTTP (or a local
//! command) and hands back plain structs; agents turn them into items.

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{error, warn};

pub mod arxiv;
pub mod biorxiv;
pub mod grants_gov;
pub mod headlines;
pub mod mail;
pub mod nih_reporter;
pub mod pubmed;
pub mod rss;

pub const USER_AGENT: &str = concat!("Briefing/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build reqwest client")
}

/// Records gathered from several sources, tolerating partial failure.
///
/// A failing source is logged and skipped; only when every attempted source
/// failed does the whole fetch count as failed.
#[derive(Debug)]
pub struct Gathered<T> {
    items: Vec<T>,
    attempted: usize,
    failures: Vec<String>,
}

impl<T> Default for Gathered<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            attempted: 0,
            failures: Vec::new(),
        }
    }
}

impl<T> Gathered<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, source: &str, result: Result<Vec<T>>) {
        self.attempted += 1;
        match result {
            Ok(items) => self.items.extend(items),
            Err(e) => {
                error!(source, error = %format!("{:#}", e), "source fetch failed");
                self.failures.push(format!("{}: {:#}", source, e));
            }
        }
    }

    /// Merge another batch, mapping its records.
    pub fn absorb_all<U>(&mut self, other: Gathered<U>, f: impl FnMut(U) -> T) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
        self.items.extend(other.items.into_iter().map(f));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_result(self) -> Result<Vec<T>> {
        if self.attempted > 0 && self.failures.len() == self.attempted {
            anyhow::bail!(
                "all {} sources failed: {}",
                self.attempted,
                self.failures.join("; ")
            );
        }
        if !self.failures.is_empty() {
            warn!(
                failed = self.failures.len(),
                attempted = self.attempted,
                "continuing with partial results"
            );
        }
        Ok(self.items)
    }
}

/// Strip markup from a feed snippet and collapse whitespace.
pub fn plain_text(html: &str) -> String {
    if !html.contains('<') {
        return collapse_ws(html);
    }
    match html2text::from_read(html.as_bytes(), 10_000) {
        Ok(text) => collapse_ws(&text),
        Err(e) => {
            warn!(error = %e, "failed to convert snippet HTML to text");
            collapse_ws(html)
        }
    }
}

pub fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"A, B, C et al."` from a list of names.
pub fn short_authors(names: &[String]) -> String {
    let mut out = names.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
    if names.len() > 3 {
        out.push_str(" et al.");
    }
    out
}

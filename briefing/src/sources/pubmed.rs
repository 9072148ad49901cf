use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{collapse_ws, short_authors};
use crate::pipeline::batch::clip;

pub const EUTILS_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
pub const API_KEY_ENV: &str = "PUBMED_API_KEY";
const ABSTRACT_MAX_CHARS: usize = 2000;
/// Search window in days
const RELDATE_DAYS: &str = "7";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Article {
    pub pmid: String,
    pub title: String,
    pub authors: String,
    pub abstract_text: String,
    pub journal: String,
    pub pub_date: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    esearchresult: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

/// E-utilities client. NCBI allows ~3 requests/s without a key, ~10 with one.
pub struct PubMedClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl PubMedClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn from_env(client: Client) -> Self {
        Self::new(client, EUTILS_URL, std::env::var(API_KEY_ENV).ok())
    }

    pub fn request_delay(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(110)
        } else {
            Duration::from_millis(350)
        }
    }

    fn with_key<'a>(&'a self, mut params: Vec<(&'a str, &'a str)>) -> Vec<(&'a str, &'a str)> {
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.as_str()));
        }
        params
    }

    /// PMIDs of the newest matches from the last week.
    pub async fn esearch(&self, term: &str, max_results: usize) -> Result<Vec<String>> {
        let retmax = max_results.to_string();
        let params = self.with_key(vec![
            ("db", "pubmed"),
            ("term", term),
            ("retmax", &retmax),
            ("sort", "date"),
            ("retmode", "json"),
            ("datetype", "edat"),
            ("reldate", RELDATE_DAYS),
        ]);
        let envelope: SearchEnvelope = self
            .client
            .get(format!("{}/esearch.fcgi", self.base_url))
            .query(&params)
            .send()
            .await
            .context("PubMed search request failed")?
            .error_for_status()
            .context("PubMed search returned an error")?
            .json()
            .await
            .context("failed to decode PubMed search response")?;
        Ok(envelope.esearchresult.idlist)
    }

    pub async fn efetch(&self, pmids: &[String]) -> Result<Vec<Article>> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = pmids.join(",");
        let params = self.with_key(vec![
            ("db", "pubmed"),
            ("id", &ids),
            ("retmode", "xml"),
            ("rettype", "abstract"),
        ]);
        let xml = self
            .client
            .get(format!("{}/efetch.fcgi", self.base_url))
            .query(&params)
            .send()
            .await
            .context("PubMed fetch request failed")?
            .error_for_status()
            .context("PubMed fetch returned an error")?
            .text()
            .await
            .context("failed to read PubMed fetch response")?;
        parse_articles(&xml)
    }

    pub async fn search(&self, term: &str, max_results: usize) -> Result<Vec<Article>> {
        let pmids = self.esearch(term, max_results).await?;
        tracing::debug!(term, hits = pmids.len(), "PubMed search");
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        tokio::time::sleep(self.request_delay()).await;
        self.efetch(&pmids).await
    }
}

#[derive(Default)]
struct Author {
    last: String,
    initials: String,
    collective: String,
}

impl Author {
    fn display(&self) -> Option<String> {
        let last = self.last.trim();
        let initials = self.initials.trim();
        match (last.is_empty(), initials.is_empty()) {
            (false, false) => Some(format!("{} {}", last, initials)),
            (false, true) => Some(last.to_string()),
            _ if !self.collective.trim().is_empty() => Some(collapse_ws(&self.collective)),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ArticleBuilder {
    pmid: String,
    title: String,
    abstract_parts: Vec<String>,
    authors: Vec<String>,
    journal: String,
    year: String,
    month: String,
    medline_date: String,
}

impl ArticleBuilder {
    fn build(self) -> Article {
        let abstract_text = collapse_ws(&self.abstract_parts.join(" "));
        let pub_date = if !self.year.is_empty() {
            format!("{} {}", self.year.trim(), self.month.trim()).trim().to_string()
        } else {
            self.medline_date.trim().to_string()
        };
        let pmid = self.pmid.trim().to_string();
        Article {
            url: format!("https://pubmed.ncbi.nlm.nih.gov/{}/", pmid),
            pmid,
            title: collapse_ws(&self.title),
            authors: short_authors(&self.authors),
            abstract_text: clip(&abstract_text, ABSTRACT_MAX_CHARS).to_string(),
            journal: collapse_ws(&self.journal),
            pub_date,
        }
    }
}

/// Parse an efetch `PubmedArticleSet` document.
pub fn parse_articles(xml: &str) -> Result<Vec<Article>> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut articles = Vec::new();
    let mut current: Option<ArticleBuilder> = None;
    let mut author: Option<Author> = None;

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("malformed PubMed XML at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "PubmedArticle" => current = Some(ArticleBuilder::default()),
                    "Author" => author = Some(Author::default()),
                    "AbstractText" => {
                        if let Some(a) = current.as_mut() {
                            a.abstract_parts.push(String::new());
                        }
                    }
                    _ => {}
                }
                path.push(name);
            }
            Event::End(_) => {
                match path.pop().as_deref() {
                    Some("PubmedArticle") => {
                        if let Some(a) = current.take() {
                            if !a.pmid.trim().is_empty() {
                                articles.push(a.build());
                            }
                        }
                    }
                    Some("Author") => {
                        if let (Some(a), Some(au)) = (current.as_mut(), author.take()) {
                            if let Some(name) = au.display() {
                                a.authors.push(name);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let text = t.unescape().context("bad entity in PubMed XML")?;
                absorb_text(&path, &text, current.as_mut(), author.as_mut());
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                absorb_text(&path, &text, current.as_mut(), author.as_mut());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(articles)
}

fn absorb_text(path: &[String], text: &str, article: Option<&mut ArticleBuilder>, author: Option<&mut Author>) {
    let Some(article) = article else { return };
    let within = |name: &str| path.iter().any(|p| p == name);
    let leaf = path.last().map(String::as_str).unwrap_or("");
    let parent = path.len().checked_sub(2).map(|i| path[i].as_str()).unwrap_or("");

    if within("ArticleTitle") {
        article.title.push_str(text);
    } else if within("AbstractText") {
        if let Some(part) = article.abstract_parts.last_mut() {
            part.push_str(text);
        }
    } else if within("Author") {
        if let Some(au) = author {
            match leaf {
                "LastName" => au.last.push_str(text),
                "Initials" => au.initials.push_str(text),
                "CollectiveName" => au.collective.push_str(text),
                _ => {}
            }
        }
    } else if leaf == "PMID" && parent == "MedlineCitation" {
        article.pmid.push_str(text);
    } else if leaf == "Title" && parent == "Journal" {
        article.journal.push_str(text);
    } else if parent == "PubDate" {
        match leaf {
            "Year" => article.year.push_str(text),
            "Month" => article.month.push_str(text),
            "MedlineDate" => article.medline_date.push_str(text),
            _ => {}
        }
    }
}

use anyhow::Result;
use common::{AgentConfig, DeliveryMethod, LiteratureSources};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{bracketed, today, Digest, Fanout};
use crate::delivery::{Channels, DeliveryReport};
use crate::pipeline::batch::{self, clip, item_number, lenient_list, lenient_string, MergeError, Numbered};
use crate::pipeline::Agent;
use crate::render;
use crate::sources::{arxiv, biorxiv, http_client, pubmed, Gathered, DEFAULT_TIMEOUT_SECS};

const PER_SOURCE: usize = 10;
/// arXiv is only queried for the first few terms to stay under its rate limit
const ARXIV_TERMS: usize = 2;
const ABSTRACT_CLIP: usize = 500;

const SYSTEM_PROMPT: &str = r#"You are a research assistant for an academic physician specializing in clinical informatics and AI in medicine.

Below are numbered papers. For each, provide ONLY your analysis. Do NOT repeat the title, authors, source, or URL (those are already known).

Return JSON with this exact structure:
{
  "summary": "2-3 sentence overview of today's papers",
  "assessments": [
    {
      "item_number": 1,
      "one_liner": "One-sentence plain-English summary of what they found/built",
      "clinical_relevance": "high|medium|low",
      "tags": ["tag1", "tag2"]
    }
  ]
}

Select the 5 most relevant papers. Be concise."#;

#[derive(Debug, Clone, PartialEq)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub authors: String,
    pub abstract_text: String,
    pub source: String,
    pub url: String,
    pub date: String,
}

impl From<pubmed::Article> for Paper {
    fn from(a: pubmed::Article) -> Self {
        Paper {
            id: format!("PMID:{}", a.pmid),
            source: format!("PubMed - {}", a.journal),
            title: a.title,
            authors: a.authors,
            abstract_text: a.abstract_text,
            url: a.url,
            date: a.pub_date,
        }
    }
}

impl From<arxiv::Preprint> for Paper {
    fn from(p: arxiv::Preprint) -> Self {
        Paper {
            id: format!("arxiv:{}", p.arxiv_id),
            source: "arXiv".to_string(),
            title: p.title,
            authors: p.authors,
            abstract_text: p.abstract_text,
            url: p.url,
            date: p.published,
        }
    }
}

impl From<biorxiv::BiorxivPaper> for Paper {
    fn from(p: biorxiv::BiorxivPaper) -> Self {
        let id = if p.doi.is_empty() {
            format!("biorxiv:{}", clip(&p.title, 50))
        } else {
            format!("doi:{}", p.doi)
        };
        Paper {
            id,
            source: "bioRxiv".to_string(),
            title: p.title,
            authors: p.authors,
            abstract_text: p.abstract_text,
            url: p.url,
            date: p.published,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Assessment {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    one_liner: String,
    #[serde(default, deserialize_with = "lenient_string")]
    clinical_relevance: String,
    #[serde(default, deserialize_with = "lenient_list")]
    tags: Vec<String>,
}

impl Numbered for Assessment {
    fn item_number(&self) -> Option<usize> {
        self.item_number
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessedPaper {
    pub title: String,
    pub authors: String,
    pub source: String,
    pub url: String,
    pub one_liner: String,
    pub clinical_relevance: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiteratureReport {
    pub summary: String,
    pub papers: Vec<AssessedPaper>,
}

impl LiteratureReport {
    pub fn to_html(&self, date: &str) -> String {
        let rows: Vec<Vec<String>> = self
            .papers
            .iter()
            .map(|p| {
                vec![
                    render::td_html(&render::link(&p.url, &p.title)),
                    render::td(&p.authors),
                    render::td(&p.source),
                    render::td(&p.one_liner),
                    render::td(&p.clinical_relevance),
                    render::td(&p.tags.join(", ")),
                ]
            })
            .collect();
        let table = render::table(
            &["Title", "Authors", "Source", "Summary", "Relevance", "Tags"],
            &rows,
            false,
        );
        render::page(
            &format!("Literature Digest - {}", date),
            &render::paragraph(&self.summary),
            &table,
        )
    }
}

impl Digest for LiteratureReport {
    fn digest(&self, label: &str) -> String {
        let mut lines = vec![format!("*{}* - {} papers\n", label, self.papers.len()), self.summary.clone()];
        for p in &self.papers {
            lines.push(format!("\n{}{}", p.title, bracketed(&p.clinical_relevance)));
            if !p.one_liner.is_empty() {
                lines.push(format!("  {}", p.one_liner));
            }
            lines.push(format!("  {}", p.url));
        }
        lines.join("\n")
    }
}

pub struct LiteratureAgent {
    cfg: AgentConfig,
    sources: LiteratureSources,
}

impl LiteratureAgent {
    pub fn new(cfg: AgentConfig, sources: LiteratureSources) -> Self {
        Self { cfg, sources }
    }
}

#[async_trait::async_trait]
impl Agent for LiteratureAgent {
    type Item = Paper;
    type Report = LiteratureReport;

    fn name(&self) -> &'static str {
        "literature"
    }

    async fn fetch(&self) -> Result<Vec<Paper>> {
        let client = http_client(DEFAULT_TIMEOUT_SECS)?;
        let mut gathered: Gathered<Paper> = Gathered::new();

        let pubmed = pubmed::PubMedClient::from_env(client.clone());
        for (i, term) in self.sources.search_terms.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(pubmed.request_delay()).await;
            }
            let result = pubmed.search(term, PER_SOURCE).await;
            gathered.absorb(&format!("pubmed:{}", term), result.map(|v| v.into_iter().map(Paper::from).collect()));
        }

        for term in self.sources.search_terms.iter().take(ARXIV_TERMS) {
            let result = arxiv::search(&client, arxiv::API_URL, term, &self.sources.arxiv_categories, PER_SOURCE).await;
            gathered.absorb(&format!("arxiv:{}", term), result.map(|v| v.into_iter().map(Paper::from).collect()));
        }

        for subject in &self.sources.biorxiv_subjects {
            let result = biorxiv::fetch(&client, biorxiv::FEED_URL, subject, PER_SOURCE).await;
            gathered.absorb(&format!("biorxiv:{}", subject), result.map(|v| v.into_iter().map(Paper::from).collect()));
        }

        tracing::info!(agent = self.name(), papers = gathered.len(), "fetched literature");
        gathered.into_result()
    }

    fn item_id<'a>(&self, item: &'a Paper) -> &'a str {
        &item.id
    }

    fn batch(&self, mut items: Vec<Paper>) -> Vec<Paper> {
        // The model gets twice the quota and picks the best
        items.truncate(self.cfg.max_items * 2);
        items
    }

    fn system_prompt(&self) -> String {
        SYSTEM_PROMPT.to_string()
    }

    fn render_item(&self, item: &Paper) -> String {
        format!(
            "Title: {}\nAuthors: {}\nSource: {}\nAbstract: {}\n",
            item.title,
            item.authors,
            item.source,
            clip(&item.abstract_text, ABSTRACT_CLIP)
        )
    }

    fn merge(&self, batch: &[Paper], response: &Value) -> Result<LiteratureReport, MergeError> {
        let assessments: Vec<Assessment> = batch::assessments(response, "assessments")?;
        let papers = batch::correlate(batch, assessments)
            .into_iter()
            .map(|(p, a)| AssessedPaper {
                title: p.title.clone(),
                authors: p.authors.clone(),
                source: p.source.clone(),
                url: p.url.clone(),
                one_liner: a.one_liner,
                clinical_relevance: a.clinical_relevance,
                tags: a.tags,
            })
            .collect();
        Ok(LiteratureReport {
            summary: batch::text_field(response, "summary"),
            papers,
        })
    }

    async fn deliver(&self, report: &LiteratureReport, channels: &dyn Channels) -> DeliveryReport {
        let mut out = Fanout::new(&self.cfg, channels);
        let date = today();
        let count = report.papers.len();
        let summary = if report.summary.is_empty() {
            "No summary available"
        } else {
            report.summary.as_str()
        };

        if out.wants(DeliveryMethod::Text) {
            out.text(&format!("{}\n\n{} papers found.", summary, count)).await;
        }
        let html = report.to_html(&date);
        if out.wants(DeliveryMethod::Email) {
            out.email(&format!("Literature Digest - {}", date), &html).await;
        }
        // Email digests are kept as a draft too
        if out.wants(DeliveryMethod::File) || out.wants(DeliveryMethod::Email) {
            out.draft(&format!("literature_{}.html", date), &html).await;
        }
        if out.wants(DeliveryMethod::Notification) {
            out.notification("Literature Monitor", &format!("{} new papers in clinical AI", count))
                .await;
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{agent_config, RecordingChannels};
    use crate::pipeline::build_prompt;
    use serde_json::json;

    fn paper(n: usize) -> Paper {
        Paper {
            id: format!("PMID:{}", n),
            title: format!("Paper {}", n),
            authors: "Smith J".into(),
            abstract_text: "a".repeat(600),
            source: "PubMed - JAMIA".into(),
            url: format!("https://pubmed.ncbi.nlm.nih.gov/{}/", n),
            date: "2025 Jan".into(),
        }
    }

    fn agent(methods: &[DeliveryMethod]) -> LiteratureAgent {
        LiteratureAgent::new(agent_config(methods, 2), LiteratureSources::default())
    }

    #[test]
    fn ids_follow_source() {
        let bio = biorxiv::BiorxivPaper {
            doi: String::new(),
            title: "T".repeat(80),
            authors: String::new(),
            abstract_text: String::new(),
            published: String::new(),
            url: String::new(),
        };
        assert_eq!(Paper::from(bio.clone()).id, format!("biorxiv:{}", "T".repeat(50)));
        let with_doi = biorxiv::BiorxivPaper {
            doi: "10.1101/2025.01.02.1".into(),
            ..bio
        };
        assert_eq!(Paper::from(with_doi).id, "doi:10.1101/2025.01.02.1");
    }

    #[test]
    fn batch_and_prompt() {
        let a = agent(&[]);
        let batch = a.batch((1..=6).map(paper).collect());
        assert_eq!(batch.len(), 4);

        let prompt = build_prompt(&a, &batch[..1]);
        assert!(prompt.starts_with("Item 1:\nTitle: Paper 1\nAuthors: Smith J\nSource: PubMed - JAMIA\nAbstract: "));
        assert!(prompt.contains(&"a".repeat(500)));
        assert!(!prompt.contains(&"a".repeat(501)));
    }

    #[test]
    fn merges_by_item_number() {
        let a = agent(&[]);
        let batch: Vec<Paper> = (1..=3).map(paper).collect();
        let response = json!({
            "summary": "Two notable papers.",
            "assessments": [
                {"item_number": 3, "one_liner": "Third", "clinical_relevance": "high", "tags": ["llm"]},
                {"item_number": "1", "one_liner": "First", "clinical_relevance": "low", "tags": "nlp, ehr"},
                {"item_number": 9, "one_liner": "Hallucinated"}
            ]
        });
        let report = a.merge(&batch, &response).unwrap();
        assert_eq!(report.summary, "Two notable papers.");
        assert_eq!(report.papers.len(), 2);
        assert_eq!(report.papers[0].title, "Paper 1");
        assert_eq!(report.papers[0].tags, vec!["nlp", "ehr"]);
        assert_eq!(report.papers[1].url, "https://pubmed.ncbi.nlm.nih.gov/3/");
        assert_eq!(report.papers[1].clinical_relevance, "high");

        assert!(a.merge(&batch, &json!({"assessments": "none"})).is_err());
    }

    #[tokio::test]
    async fn email_also_writes_a_draft() {
        let a = agent(&[DeliveryMethod::Text, DeliveryMethod::Email, DeliveryMethod::Notification]);
        let report = LiteratureReport {
            summary: "Sum <b>".into(),
            papers: vec![AssessedPaper {
                title: "P & Q".into(),
                authors: "A".into(),
                source: "arXiv".into(),
                url: "https://arxiv.org/abs/1".into(),
                one_liner: "x".into(),
                clinical_relevance: "high".into(),
                tags: vec!["a".into(), "b".into()],
            }],
        };
        let channels = RecordingChannels::default();
        let delivery = a.deliver(&report, &channels).await;
        assert_eq!(delivery.sent(), 4);

        assert_eq!(channels.of(DeliveryMethod::Text)[0].0, "Sum <b>\n\n1 papers found.");
        let (subject, html) = &channels.of(DeliveryMethod::Email)[0];
        assert!(subject.starts_with("Literature Digest - "));
        assert!(html.contains("P &amp; Q"));
        assert!(html.contains("Sum &lt;b&gt;"));
        assert!(html.contains("<td>a, b</td>"));
        let (filename, _) = &channels.of(DeliveryMethod::File)[0];
        assert!(filename.starts_with("literature_") && filename.ends_with(".html"));
        assert_eq!(
            channels.of(DeliveryMethod::Notification)[0],
            ("Literature Monitor".to_string(), "1 new papers in clinical AI".to_string())
        );
    }

    #[test]
    fn digest_lists_papers() {
        let report = LiteratureReport {
            summary: "S".into(),
            papers: vec![AssessedPaper {
                title: "P".into(),
                authors: String::new(),
                source: String::new(),
                url: "u".into(),
                one_liner: "o".into(),
                clinical_relevance: "medium".into(),
                tags: vec![],
            }],
        };
        assert_eq!(report.digest("Literature"), "*Literature* - 1 papers\n\nS\n\nP [medium]\n  o\n  u");
    }
}

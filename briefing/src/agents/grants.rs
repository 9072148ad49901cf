use anyhow::Result;
use common::{AgentConfig, DeliveryMethod, GrantsSources};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{bracketed, today, Digest, Fanout};
use crate::delivery::{Channels, DeliveryReport};
use crate::pipeline::batch::{self, clip, item_number, lenient_string, MergeError, Numbered};
use crate::pipeline::Agent;
use crate::render;
use crate::sources::{grants_gov, http_client, nih_reporter, Gathered, DEFAULT_TIMEOUT_SECS};

const PER_SOURCE: usize = 20;
const DESCRIPTION_CLIP: usize = 400;

const SYSTEM_PROMPT: &str = r#"You are a grants specialist for an academic physician-informaticist. Below are numbered funding opportunities. For each, provide ONLY your analysis. Do NOT repeat the title, FOA number, agency, deadline, funding range, or URL (those are already known).

Return JSON with this exact structure:
{
  "summary": "2-3 sentence overview of this week's opportunities",
  "assessments": [
    {
      "item_number": 1,
      "relevance": "high|medium|low",
      "one_liner": "What they're funding in one sentence",
      "fit_assessment": "Why this matches or doesn't match the PI's clinical informatics + AI profile"
    }
  ]
}

Only include medium and high relevance opportunities."#;

const RELEVANCE_COLORS: [(&str, &str); 3] = [("high", "#cc0000"), ("medium", "#cc6600"), ("low", "#666666")];

#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub id: String,
    pub title: String,
    pub foa_number: String,
    pub agency: String,
    pub ic_code: String,
    pub funding: String,
    pub deadline: String,
    pub url: String,
    pub description: String,
}

fn grant_id(foa: &str, title: &str) -> String {
    if foa.is_empty() {
        clip(title, 50).to_string()
    } else {
        foa.to_string()
    }
}

impl From<nih_reporter::NihProject> for Grant {
    fn from(p: nih_reporter::NihProject) -> Self {
        Grant {
            id: grant_id(&p.foa_number, &p.title),
            title: p.title,
            foa_number: p.foa_number,
            agency: p.agency,
            ic_code: p.ic_code,
            funding: p.funding,
            // RePORTER does not publish deadlines
            deadline: String::new(),
            url: p.url,
            description: p.abstract_text,
        }
    }
}

impl From<grants_gov::Opportunity> for Grant {
    fn from(o: grants_gov::Opportunity) -> Self {
        Grant {
            id: grant_id(&o.opportunity_id, &o.title),
            title: o.title,
            foa_number: o.opportunity_id,
            agency: o.agency,
            ic_code: String::new(),
            funding: "See listing".to_string(),
            deadline: o.deadline,
            url: o.url,
            description: o.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Assessment {
    #[serde(default, deserialize_with = "item_number")]
    item_number: Option<usize>,
    #[serde(default, deserialize_with = "lenient_string")]
    relevance: String,
    #[serde(default, deserialize_with = "lenient_string")]
    one_liner: String,
    #[serde(default, deserialize_with = "lenient_string")]
    fit_assessment: String,
}

impl Numbered for Assessment {
    fn item_number(&self) -> Option<usize> {
        self.item_number
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessedGrant {
    pub title: String,
    pub foa_number: String,
    pub agency: String,
    pub ic_code: String,
    pub funding: String,
    pub deadline: String,
    pub url: String,
    pub relevance: String,
    pub one_liner: String,
    pub fit_assessment: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrantsReport {
    pub summary: String,
    pub opportunities: Vec<AssessedGrant>,
}

impl GrantsReport {
    pub fn high_relevance(&self) -> impl Iterator<Item = &AssessedGrant> {
        self.opportunities.iter().filter(|o| o.relevance == "high")
    }

    /// `"N new grant opportunities this week, H high relevance (deadline D)"`
    pub fn text_summary(&self) -> String {
        let high: Vec<&AssessedGrant> = self.high_relevance().collect();
        let mut msg = format!(
            "{} new grant opportunities this week, {} high relevance",
            self.opportunities.len(),
            high.len()
        );
        if let Some(first) = high.first() {
            let deadline = if first.deadline.is_empty() { "TBD" } else { first.deadline.as_str() };
            msg.push_str(&format!(" (deadline {})", deadline));
        }
        msg
    }

    pub fn to_html(&self, date: &str) -> String {
        let rows: Vec<Vec<String>> = self
            .opportunities
            .iter()
            .map(|o| {
                let agency = format!("{} {}", o.agency, o.ic_code);
                vec![
                    render::td_colored(&o.relevance, render::color_for(&o.relevance, &RELEVANCE_COLORS, "#333333")),
                    render::td_html(&render::link(&o.url, &o.title)),
                    render::td(&o.foa_number),
                    render::td(agency.trim()),
                    render::td(&o.funding),
                    render::td(&o.deadline),
                    render::td(&o.one_liner),
                    render::td_em(&o.fit_assessment),
                ]
            })
            .collect();
        let table = render::table(
            &["Relevance", "Title", "FOA", "Agency", "Funding", "Deadline", "Summary", "Fit"],
            &rows,
            false,
        );
        render::page(
            &format!("Grant Opportunities - {}", date),
            &render::paragraph(&self.summary),
            &table,
        )
    }
}

impl Digest for GrantsReport {
    fn digest(&self, label: &str) -> String {
        let mut lines = vec![
            format!("*{}* - {} opportunities\n", label, self.opportunities.len()),
            self.summary.clone(),
        ];
        for o in &self.opportunities {
            lines.push(format!("\n{}{}", o.title, bracketed(&o.relevance)));
            if !o.one_liner.is_empty() {
                lines.push(format!("  {}", o.one_liner));
            }
            if !o.deadline.is_empty() {
                lines.push(format!("  Deadline: {}", o.deadline));
            }
            lines.push(format!("  {}", o.url));
        }
        lines.join("\n")
    }
}

pub struct GrantsAgent {
    cfg: AgentConfig,
    sources: GrantsSources,
}

impl GrantsAgent {
    pub fn new(cfg: AgentConfig, sources: GrantsSources) -> Self {
        Self { cfg, sources }
    }
}

#[async_trait::async_trait]
impl Agent for GrantsAgent {
    type Item = Grant;
    type Report = GrantsReport;

    fn name(&self) -> &'static str {
        "grants"
    }

    async fn fetch(&self) -> Result<Vec<Grant>> {
        let client = http_client(DEFAULT_TIMEOUT_SECS)?;
        let keywords = &self.sources.search_terms;
        let mut gathered: Gathered<Grant> = Gathered::new();

        let nih = nih_reporter::search(&client, nih_reporter::SEARCH_URL, keywords, &self.sources.nih, PER_SOURCE).await;
        gathered.absorb("nih_reporter", nih.map(|v| v.into_iter().map(Grant::from).collect()));

        let gov = grants_gov::search(&client, &self.sources.grants_gov.feed_url, keywords, PER_SOURCE).await;
        gathered.absorb("grants_gov", gov.map(|v| v.into_iter().map(Grant::from).collect()));

        gathered.into_result()
    }

    fn item_id<'a>(&self, item: &'a Grant) -> &'a str {
        &item.id
    }

    fn batch(&self, mut items: Vec<Grant>) -> Vec<Grant> {
        items.truncate(self.cfg.max_items * 2);
        items
    }

    fn system_prompt(&self) -> String {
        SYSTEM_PROMPT.to_string()
    }

    fn render_item(&self, item: &Grant) -> String {
        format!(
            "Title: {}\nFOA/ID: {}\nAgency: {} {}\nFunding: {}\nDeadline: {}\nDescription: {}\n",
            item.title,
            item.foa_number,
            item.agency,
            item.ic_code,
            item.funding,
            item.deadline,
            clip(&item.description, DESCRIPTION_CLIP)
        )
    }

    fn merge(&self, batch: &[Grant], response: &Value) -> Result<GrantsReport, MergeError> {
        let assessments: Vec<Assessment> = batch::assessments(response, "assessments")?;
        let opportunities = batch::correlate(batch, assessments)
            .into_iter()
            .map(|(g, a)| AssessedGrant {
                title: g.title.clone(),
                foa_number: g.foa_number.clone(),
                agency: g.agency.clone(),
                ic_code: g.ic_code.clone(),
                funding: g.funding.clone(),
                deadline: g.deadline.clone(),
                url: g.url.clone(),
                relevance: a.relevance.to_lowercase(),
                one_liner: a.one_liner,
                fit_assessment: a.fit_assessment,
            })
            .collect();
        Ok(GrantsReport {
            summary: batch::text_field(response, "summary"),
            opportunities,
        })
    }

    async fn deliver(&self, report: &GrantsReport, channels: &dyn Channels) -> DeliveryReport {
        let mut out = Fanout::new(&self.cfg, channels);
        let date = today();

        if out.wants(DeliveryMethod::Text) {
            out.text(&report.text_summary()).await;
        }
        let html = report.to_html(&date);
        if out.wants(DeliveryMethod::Email) {
            out.email(&format!("Grant Opportunities - {}", date), &html).await;
        }
        if out.wants(DeliveryMethod::File) {
            out.draft(&format!("grants_{}.html", date), &html).await;
        }
        out.finish()
    }
}

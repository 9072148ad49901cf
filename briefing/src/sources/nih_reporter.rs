use anyhow::{Context, Result};
use chrono::Datelike;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::collapse_ws;
use crate::pipeline::batch::clip;
use common::NihSources;

pub const SEARCH_URL: &str = "https://api.reporter.nih.gov/v2/projects/search";
const ABSTRACT_MAX_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq)]
pub struct NihProject {
    pub foa_number: String,
    pub title: String,
    pub agency: String,
    pub ic_code: String,
    pub funding: String,
    pub url: String,
    pub abstract_text: String,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    criteria: Criteria<'a>,
    limit: usize,
    offset: usize,
    sort_field: &'a str,
    sort_order: &'a str,
}

#[derive(Debug, Serialize)]
struct Criteria<'a> {
    advanced_text_search: TextSearch,
    include_active_projects: bool,
    fiscal_years: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity_codes: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agency_ic_admin: Option<IncludeValues<'a>>,
}

#[derive(Debug, Serialize)]
struct TextSearch {
    operator: &'static str,
    search_field: &'static str,
    search_text: String,
}

#[derive(Debug, Serialize)]
struct IncludeValues<'a> {
    include_values: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ProjectRecord>,
}

#[derive(Debug, Deserialize)]
struct ProjectRecord {
    #[serde(default)]
    project_title: Option<String>,
    #[serde(default)]
    project_num: Option<String>,
    #[serde(default)]
    opportunity_number: Option<String>,
    #[serde(default)]
    award_amount: Option<f64>,
    #[serde(default)]
    abstract_text: Option<String>,
    #[serde(default)]
    agency_ic_fundings: Option<Vec<IcFunding>>,
}

#[derive(Debug, Deserialize)]
struct IcFunding {
    #[serde(default)]
    abbreviation: Option<String>,
}

/// Configured fiscal years, or this year and next when none are set.
fn fiscal_years(cfg: &NihSources) -> Vec<i32> {
    if cfg.fiscal_years.is_empty() {
        let year = chrono::Utc::now().year();
        vec![year, year + 1]
    } else {
        cfg.fiscal_years.clone()
    }
}

/// `$1,250,000`
pub fn format_dollars(amount: f64) -> String {
    let whole = amount.round().max(0.0) as u64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    format!("${}", out)
}

fn into_project(record: ProjectRecord) -> NihProject {
    let project_num = record.project_num.unwrap_or_default();
    let abstract_text = collapse_ws(record.abstract_text.as_deref().unwrap_or(""));
    NihProject {
        foa_number: record
            .opportunity_number
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| project_num.clone()),
        title: collapse_ws(record.project_title.as_deref().unwrap_or("")),
        agency: "NIH".to_string(),
        ic_code: record
            .agency_ic_fundings
            .and_then(|f| f.into_iter().next())
            .and_then(|f| f.abbreviation)
            .unwrap_or_default(),
        funding: match record.award_amount {
            Some(a) if a > 0.0 => format_dollars(a),
            _ => "Not specified".to_string(),
        },
        url: if project_num.is_empty() {
            String::new()
        } else {
            format!("https://reporter.nih.gov/project-details/{}", project_num)
        },
        abstract_text: clip(&abstract_text, ABSTRACT_MAX_CHARS).to_string(),
    }
}

pub async fn search(
    client: &Client,
    url: &str,
    keywords: &[String],
    cfg: &NihSources,
    max_results: usize,
) -> Result<Vec<NihProject>> {
    let request = SearchRequest {
        criteria: Criteria {
            advanced_text_search: TextSearch {
                operator: "or",
                search_field: "terms",
                search_text: keywords.join(" "),
            },
            include_active_projects: true,
            fiscal_years: fiscal_years(cfg),
            activity_codes: (!cfg.activity_codes.is_empty()).then_some(cfg.activity_codes.as_slice()),
            agency_ic_admin: (!cfg.ic_codes.is_empty()).then_some(IncludeValues {
                include_values: &cfg.ic_codes,
            }),
        },
        limit: max_results,
        offset: 0,
        sort_field: "project_start_date",
        sort_order: "desc",
    };

    let response: SearchResponse = client
        .post(url)
        .json(&request)
        .send()
        .await
        .context("NIH RePORTER request failed")?
        .error_for_status()
        .context("NIH RePORTER returned an error")?
        .json()
        .await
        .context("failed to decode NIH RePORTER response")?;

    Ok(response.results.into_iter().map(into_project).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn dollars_get_separators() {
        assert_eq!(format_dollars(1_250_000.0), "$1,250,000");
        assert_eq!(format_dollars(999.4), "$999");
        assert_eq!(format_dollars(1000.0), "$1,000");
    }

    #[tokio::test]
    async fn posts_criteria_and_maps_results() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v2/projects/search")
            .match_body(Matcher::PartialJson(json!({
                "criteria": {
                    "advanced_text_search": {"search_text": "clinical informatics"},
                    "fiscal_years": [2025],
                    "activity_codes": ["R01"],
                    "agency_ic_admin": {"include_values": ["LM"]}
                },
                "limit": 20
            })))
            .with_status(200)
            .with_body(
                json!({
                    "results": [
                        {
                            "project_title": "AI for   sepsis",
                            "project_num": "1R01LM000001-01",
                            "award_amount": 450000,
                            "abstract_text": "Predict sepsis.",
                            "agency_ic_fundings": [{"abbreviation": "NLM"}]
                        },
                        {"project_title": "Sparse", "opportunity_number": "PAR-25-001"}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let cfg = NihSources {
            activity_codes: vec!["R01".into()],
            ic_codes: vec!["LM".into()],
            fiscal_years: vec![2025],
        };
        let keywords = vec!["clinical".to_string(), "informatics".to_string()];
        let url = format!("{}/v2/projects/search", server.url());
        let projects = search(&Client::new(), &url, &keywords, &cfg, 20).await.unwrap();

        assert_eq!(projects.len(), 2);
        let p = &projects[0];
        assert_eq!(p.title, "AI for sepsis");
        assert_eq!(p.foa_number, "1R01LM000001-01");
        assert_eq!(p.ic_code, "NLM");
        assert_eq!(p.funding, "$450,000");
        assert_eq!(p.url, "https://reporter.nih.gov/project-details/1R01LM000001-01");

        let q = &projects[1];
        assert_eq!(q.foa_number, "PAR-25-001");
        assert_eq!(q.funding, "Not specified");
        assert!(q.url.is_empty());
    }
}

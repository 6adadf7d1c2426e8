//! Source API seam and the grants.gov search client behind it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use grantsync_core::{CandidateRecord, KeywordDirective, PriorHit};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "grantsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response from {endpoint}: {detail}")]
    Response { endpoint: String, detail: String },
}

/// Remote opportunity source. One implementation talks to grants.gov; tests
/// supply canned results through the same seam.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Reference data: eligibility code mapped to its display label.
    async fn fetch_eligibilities(&self) -> Result<BTreeMap<String, String>, SourceError>;

    /// Candidate records for the configured keyword directives, restricted
    /// to the `|`-joined eligibility filter. `prior_hits` names records the
    /// local table already holds so their stored ids are kept stable.
    async fn search_opportunities(
        &self,
        prior_hits: &[PriorHit],
        directives: &[KeywordDirective],
        eligibility_filter: &str,
    ) -> Result<Vec<CandidateRecord>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.grants.gov".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "grantsync-bot/0.1".to_string(),
        }
    }
}

pub struct GrantsGovClient {
    http: reqwest::Client,
    base_url: String,
}

impl GrantsGovClient {
    pub fn new(config: ClientConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn search(&self, keyword: &str, eligibilities: &str) -> Result<Search2Data, SourceError> {
        let endpoint = format!("{}/v1/api/search2", self.base_url);
        let body = serde_json::json!({
            "keyword": keyword,
            "eligibilities": eligibilities,
            "oppStatuses": "forecasted|posted",
            "rows": 500,
            "startRecordNum": 0,
        });
        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let envelope: Search2Envelope = response.json().await?;
        envelope.data.ok_or_else(|| SourceError::Response {
            endpoint,
            detail: "missing data payload".to_string(),
        })
    }
}

#[async_trait]
impl SourceApi for GrantsGovClient {
    async fn fetch_eligibilities(&self) -> Result<BTreeMap<String, String>, SourceError> {
        // The eligibility facet of an unconstrained search carries the full
        // code/label reference list.
        let data = self.search("", "").await?;
        let mut out = BTreeMap::new();
        for entry in data.eligibilities {
            out.insert(scalar_string(&entry.id), entry.label);
        }
        Ok(out)
    }

    async fn search_opportunities(
        &self,
        prior_hits: &[PriorHit],
        directives: &[KeywordDirective],
        eligibility_filter: &str,
    ) -> Result<Vec<CandidateRecord>, SourceError> {
        let mut batches = Vec::with_capacity(directives.len());
        for directive in directives {
            let data = self.search(&directive.term, eligibility_filter).await?;
            debug!(
                term = %directive.term,
                hits = data.opp_hits.len(),
                "keyword search complete"
            );
            batches.push((directive.clone(), data.opp_hits));
        }
        Ok(fold_search_results(batches, prior_hits))
    }
}

#[derive(Debug, Deserialize)]
struct Search2Envelope {
    data: Option<Search2Data>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Search2Data {
    #[serde(default)]
    opp_hits: Vec<OppHit>,
    #[serde(default)]
    eligibilities: Vec<FacetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FacetEntry {
    #[serde(alias = "value")]
    id: Value,
    label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OppHit {
    #[serde(default)]
    id: Value,
    number: String,
    #[serde(default)]
    title: String,
    #[serde(default, alias = "synopsis")]
    description: Option<String>,
    agency_code: Option<String>,
    open_date: Option<String>,
    close_date: Option<String>,
    award_ceiling: Option<Value>,
    cost_sharing: Option<Value>,
    cfda_list: Option<Vec<String>>,
    opportunity_category: Option<String>,
}

struct Accumulated {
    hit: OppHit,
    matched_terms: Vec<String>,
    keep: bool,
}

/// Folds per-directive hit lists into candidate records. A term is matching
/// when it appears in the record's title or description; a record is kept
/// once an auto-insert directive matches it (or sweeps it in via ALL scope).
/// Records already known locally keep their stored grant id.
fn fold_search_results(
    batches: Vec<(KeywordDirective, Vec<OppHit>)>,
    prior_hits: &[PriorHit],
) -> Vec<CandidateRecord> {
    let prior_ids: BTreeMap<&str, &str> = prior_hits
        .iter()
        .map(|hit| (hit.number.as_str(), hit.id.as_str()))
        .collect();
    let search_keywords: Vec<String> = batches
        .iter()
        .map(|(directive, _)| directive.term.clone())
        .collect();

    let mut seen: BTreeMap<String, Accumulated> = BTreeMap::new();
    for (directive, hits) in &batches {
        for hit in hits {
            let entry = seen.entry(hit.number.clone()).or_insert_with(|| Accumulated {
                hit: hit.clone(),
                matched_terms: Vec::new(),
                keep: false,
            });
            let matched = contains_ci(&entry.hit.title, &directive.term)
                || entry
                    .hit
                    .description
                    .as_deref()
                    .map(|text| contains_ci(text, &directive.term))
                    .unwrap_or(false);
            if matched && !entry.matched_terms.contains(&directive.term) {
                entry.matched_terms.push(directive.term.clone());
            }
            if directive.insert_mode && (matched || directive.insert_all) {
                entry.keep = true;
            }
        }
    }

    seen.into_values()
        .filter(|entry| entry.keep)
        .map(|entry| {
            let Accumulated {
                hit, matched_terms, ..
            } = entry;
            let id = prior_ids
                .get(hit.number.as_str())
                .map(|stored| stored.to_string())
                .unwrap_or_else(|| scalar_string(&hit.id));
            CandidateRecord {
                id,
                number: hit.number,
                agency_code: hit.agency_code,
                award_ceiling: hit.award_ceiling.as_ref().map(scalar_string),
                cost_sharing: flag_is_set(hit.cost_sharing.as_ref()),
                title: hit.title,
                cfda_list: hit.cfda_list,
                open_date: hit.open_date,
                close_date: hit.close_date,
                opportunity_category: hit.opportunity_category,
                matching_keywords: matched_terms,
                search_keywords: search_keywords.clone(),
            }
        })
        .collect()
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

fn flag_is_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("yes") || s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

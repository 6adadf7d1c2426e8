//! Domain model and pure transforms for the grant sync pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "grantsync-core";

/// Highest `grant_id` in the seed/reference range. Ids above this, and ids
/// that do not parse as integers, belong to records discovered by sync runs
/// and are reported to the source as prior hits.
pub const SEED_ID_CEILING: i64 = 200;

/// Far-future close date recorded when the source supplies none. A stored
/// value equal to this sentinel cannot be distinguished from a genuine
/// 2100-01-01 close date; no richer encoding is kept.
pub const CLOSE_DATE_SENTINEL: &str = "2100-01-01";

/// Annotation appended to search terms that matched the record's content.
pub const MATCHED_TERM_MARKER: &str = " [in title/desc]";

pub const STATUS_INBOX: &str = "inbox";
pub const REVIEWER_NONE: &str = "none";
pub const AUTO_INSERT_NOTE: &str = "auto-inserted by grantsync";

/// Columns a sync run may rewrite on an existing grant row. Every other
/// column is written once at insert time and then owned by the operator.
pub const GRANT_MUTABLE_COLUMNS: &[&str] = &[
    "search_terms",
    "cost_sharing",
    "award_ceiling",
    "close_date",
    "opportunity_category",
];

/// Generic row shape exchanged with the store. An absent column and a null
/// column mean the same thing everywhere in the pipeline.
pub type Row = Map<String, Value>;

/// Tables touched by a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Table {
    Grants,
    EligibilityCodes,
    Keywords,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Grants => "grants",
            Table::EligibilityCodes => "eligibility_codes",
            Table::Keywords => "keywords",
        }
    }
}

/// Structured keyword filter entry controlling auto-insert behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordDirective {
    pub term: String,
    /// Matches on this term are persisted without operator action.
    pub insert_mode: bool,
    /// Broadened matching scope: keep records the term's search returned
    /// even without a literal content match.
    pub insert_all: bool,
}

/// Builds directives from raw keyword configuration rows. Rows missing a
/// usable `mode` or `search_term` are dropped without comment; lenient
/// parsing here is policy, not failure. Output order follows input order.
pub fn load_keyword_directives(rows: &[Row]) -> Vec<KeywordDirective> {
    rows.iter()
        .filter_map(|row| {
            let mode = row
                .get("mode")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())?;
            let term = row
                .get("search_term")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())?;
            Some(KeywordDirective {
                term: term.to_string(),
                insert_mode: mode.starts_with("autoinsert"),
                insert_all: mode.contains("ALL"),
            })
        })
        .collect()
}

/// `|`-joined codes of the enabled eligibility rows, in input order. An
/// empty result is the caller's signal to abort the run rather than query
/// the source with an unbounded filter.
pub fn build_eligibility_filter(rows: &[Row]) -> String {
    rows.iter()
        .filter(|row| row.get("enabled").map(value_is_truthy).unwrap_or(false))
        .filter_map(|row| row.get("code").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("|")
}

pub fn value_is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// A locally stored record reported to the source as already known, so an
/// incremental search does not re-deliver detail for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorHit {
    pub id: String,
    pub number: String,
}

/// Scans the grants table (keyed by `grant_number`) for rows whose
/// `grant_id` falls outside the seed range: a value above
/// [`SEED_ID_CEILING`] or one that does not parse as an integer.
pub fn detect_prior_hits(existing: &BTreeMap<String, Row>) -> Vec<PriorHit> {
    let mut hits = Vec::new();
    for (number, row) in existing {
        let id = match row.get("grant_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        match parse_leading_i64(&id) {
            Some(parsed) if parsed <= SEED_ID_CEILING => {}
            _ => hits.push(PriorHit {
                id,
                number: number.clone(),
            }),
        }
    }
    hits
}

/// Parses a leading base-10 integer, ignoring trailing non-digit text, so
/// `"42-A"` parses to 42 while `"GR-42"` does not parse at all.
pub fn parse_leading_i64(input: &str) -> Option<i64> {
    let text = input.trim_start();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|v| sign * v)
}

/// One candidate record as handed over by the source, annotated with the
/// terms that matched it and the full set of terms searched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub number: String,
    pub agency_code: Option<String>,
    pub award_ceiling: Option<String>,
    pub cost_sharing: bool,
    pub title: String,
    pub cfda_list: Option<Vec<String>>,
    pub open_date: Option<String>,
    pub close_date: Option<String>,
    pub opportunity_category: Option<String>,
    pub matching_keywords: Vec<String>,
    pub search_keywords: Vec<String>,
}

/// Maps one candidate into the local grants schema. Total over any
/// candidate; fields the source omits are left absent rather than zeroed.
pub fn transform_candidate(hit: &CandidateRecord) -> Row {
    let mut row = Row::new();
    put(&mut row, "status", Value::from(STATUS_INBOX));
    put(&mut row, "grant_id", Value::from(hit.id.as_str()));
    put(&mut row, "grant_number", Value::from(hit.number.as_str()));
    if let Some(agency) = &hit.agency_code {
        put(&mut row, "agency_code", Value::from(agency.as_str()));
    }
    // Zero and unparsable ceilings mean "not stated", never a 0 column.
    if let Some(ceiling) = hit
        .award_ceiling
        .as_deref()
        .and_then(parse_leading_i64)
        .filter(|v| *v != 0)
    {
        put(&mut row, "award_ceiling", Value::from(ceiling));
    }
    put(
        &mut row,
        "cost_sharing",
        Value::from(if hit.cost_sharing { "Yes" } else { "No" }),
    );
    put(&mut row, "title", Value::from(hit.title.as_str()));
    if let Some(cfda) = &hit.cfda_list {
        put(&mut row, "cfda_list", Value::from(cfda.join(", ")));
    }
    if let Some(open) = &hit.open_date {
        put(&mut row, "open_date", Value::from(open.as_str()));
    }
    put(
        &mut row,
        "close_date",
        Value::from(hit.close_date.as_deref().unwrap_or(CLOSE_DATE_SENTINEL)),
    );
    put(&mut row, "notes", Value::from(AUTO_INSERT_NOTE));
    put(
        &mut row,
        "search_terms",
        Value::from(render_search_terms(
            &hit.matching_keywords,
            &hit.search_keywords,
        )),
    );
    put(&mut row, "reviewer_name", Value::from(REVIEWER_NONE));
    if let Some(category) = &hit.opportunity_category {
        put(&mut row, "opportunity_category", Value::from(category.as_str()));
    }
    row
}

/// Audit trail of the search: matched terms first, each annotated and
/// newline-terminated, then the searched-but-unmatched terms. Order within
/// each partition follows the given order; no further deduplication.
pub fn render_search_terms(matching: &[String], searched: &[String]) -> String {
    let mut out = String::new();
    for term in matching {
        out.push_str(term);
        out.push_str(MATCHED_TERM_MARKER);
        out.push('\n');
    }
    let unmatched = searched
        .iter()
        .filter(|term| !matching.contains(term))
        .map(String::as_str)
        .collect::<Vec<_>>();
    out.push_str(&unmatched.join("\n"));
    out
}

/// String form of a key column value, used to index rows by unique key.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn put(row: &mut Row, column: &str, value: Value) {
    row.insert(column.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut out = Row::new();
        for (k, v) in pairs {
            out.insert((*k).to_string(), v.clone());
        }
        out
    }

    #[test]
    fn keyword_rows_missing_fields_are_dropped() {
        let rows = vec![
            row(&[("mode", json!("autoinsert")), ("search_term", json!("climate"))]),
            row(&[("mode", json!("autoinsertALL")), ("search_term", json!("water"))]),
            row(&[("search_term", json!("orphaned"))]),
            row(&[("mode", json!("")), ("search_term", json!("blank-mode"))]),
            row(&[("mode", json!("watch")), ("search_term", json!("soil"))]),
        ];
        let directives = load_keyword_directives(&rows);
        assert_eq!(
            directives,
            vec![
                KeywordDirective {
                    term: "climate".into(),
                    insert_mode: true,
                    insert_all: false,
                },
                KeywordDirective {
                    term: "water".into(),
                    insert_mode: true,
                    insert_all: true,
                },
                KeywordDirective {
                    term: "soil".into(),
                    insert_mode: false,
                    insert_all: false,
                },
            ]
        );
    }

    #[test]
    fn autoinsert_prefix_is_case_sensitive() {
        let rows = vec![row(&[
            ("mode", json!("AUTOINSERT")),
            ("search_term", json!("climate")),
        ])];
        let directives = load_keyword_directives(&rows);
        assert!(!directives[0].insert_mode);
    }

    #[test]
    fn eligibility_filter_joins_enabled_codes_in_order() {
        let rows = vec![
            row(&[("code", json!("A")), ("enabled", json!(true))]),
            row(&[("code", json!("B")), ("enabled", json!(false))]),
            row(&[("code", json!("C")), ("enabled", json!(true))]),
        ];
        assert_eq!(build_eligibility_filter(&rows), "A|C");
    }

    #[test]
    fn eligibility_filter_is_empty_when_nothing_enabled() {
        assert_eq!(build_eligibility_filter(&[]), "");
        let rows = vec![row(&[("code", json!("A")), ("enabled", json!(false))])];
        assert_eq!(build_eligibility_filter(&rows), "");
    }

    #[test]
    fn seed_range_ids_are_not_prior_hits() {
        let mut existing = BTreeMap::new();
        existing.insert(
            "GR-SEED".to_string(),
            row(&[("grant_id", json!("200"))]),
        );
        existing.insert(
            "GR-EDGE".to_string(),
            row(&[("grant_id", json!("201"))]),
        );
        existing.insert(
            "GR-TEXT".to_string(),
            row(&[("grant_id", json!("EXT-77"))]),
        );
        let hits = detect_prior_hits(&existing);
        assert_eq!(
            hits,
            vec![
                PriorHit {
                    id: "201".into(),
                    number: "GR-EDGE".into(),
                },
                PriorHit {
                    id: "EXT-77".into(),
                    number: "GR-TEXT".into(),
                },
            ]
        );
    }

    #[test]
    fn numeric_grant_ids_are_handled_like_strings() {
        let mut existing = BTreeMap::new();
        existing.insert("GR-N".to_string(), row(&[("grant_id", json!(450))]));
        existing.insert("GR-S".to_string(), row(&[("grant_id", json!(12))]));
        let hits = detect_prior_hits(&existing);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "450");
    }

    #[test]
    fn leading_integer_parse_ignores_trailing_text() {
        assert_eq!(parse_leading_i64("42"), Some(42));
        assert_eq!(parse_leading_i64("42-A"), Some(42));
        assert_eq!(parse_leading_i64("  7 "), Some(7));
        assert_eq!(parse_leading_i64("-3"), Some(-3));
        assert_eq!(parse_leading_i64("GR-42"), None);
        assert_eq!(parse_leading_i64(""), None);
    }

    fn candidate() -> CandidateRecord {
        CandidateRecord {
            id: "287".into(),
            number: "EPA-R9-2026-01".into(),
            agency_code: Some("EPA".into()),
            award_ceiling: Some("500000".into()),
            cost_sharing: false,
            title: "Climate Resilience Planning".into(),
            cfda_list: Some(vec!["66.042".into(), "66.046".into()]),
            open_date: Some("2026-03-01".into()),
            close_date: Some("2026-06-30".into()),
            opportunity_category: Some("D".into()),
            matching_keywords: vec!["climate".into()],
            search_keywords: vec!["climate".into(), "water".into()],
        }
    }

    #[test]
    fn transform_sets_operator_defaults_and_derived_fields() {
        let row = transform_candidate(&candidate());
        assert_eq!(row["status"], json!("inbox"));
        assert_eq!(row["notes"], json!(AUTO_INSERT_NOTE));
        assert_eq!(row["reviewer_name"], json!("none"));
        assert_eq!(row["award_ceiling"], json!(500000));
        assert_eq!(row["cost_sharing"], json!("No"));
        assert_eq!(row["cfda_list"], json!("66.042, 66.046"));
        assert_eq!(row["close_date"], json!("2026-06-30"));
        assert_eq!(
            row["search_terms"],
            json!("climate [in title/desc]\nwater")
        );
    }

    #[test]
    fn transform_defaults_missing_close_date_to_sentinel() {
        let mut hit = candidate();
        hit.close_date = None;
        let row = transform_candidate(&hit);
        assert_eq!(row["close_date"], json!("2100-01-01"));
    }

    #[test]
    fn zero_or_unparsable_award_ceiling_stays_absent() {
        let mut hit = candidate();
        hit.award_ceiling = Some("0".into());
        assert!(!transform_candidate(&hit).contains_key("award_ceiling"));
        hit.award_ceiling = Some("TBD".into());
        assert!(!transform_candidate(&hit).contains_key("award_ceiling"));
        hit.award_ceiling = None;
        assert!(!transform_candidate(&hit).contains_key("award_ceiling"));
    }

    #[test]
    fn search_terms_keep_partition_order_without_dedup() {
        let matching = vec!["water".to_string(), "climate".to_string()];
        let searched = vec![
            "climate".to_string(),
            "soil".to_string(),
            "water".to_string(),
            "soil".to_string(),
        ];
        assert_eq!(
            render_search_terms(&matching, &searched),
            "water [in title/desc]\nclimate [in title/desc]\nsoil\nsoil"
        );
    }
}

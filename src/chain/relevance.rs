//! Relevance scoring for OSINT chain strategies (§4.8): exponential
//! hop decay, a common-name penalty, a connection-strength boost against
//! the root entity, and a source/chain provenance multiplier. Grounded
//! byte-for-byte on `chain_executor.py`'s `SOURCE_PROVENANCE_WEIGHTS`
//! table and `_calculate_relevance_score`/`_calculate_chain_provenance`.
//!
//! Also carries the `?age` operator (`age_operator`/`apply_age_to_results`)
//! and the heuristic AI-filter stand-in (`ai_filter_decision`) — both
//! informational/best-effort per DESIGN.md's Open Question decisions,
//! never load-bearing for the relevance score itself.

use crate::core::types::ScoringConfig;
use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

pub static SOURCE_PROVENANCE_WEIGHTS: LazyLock<HashMap<&'static str, f64>> = LazyLock::new(|| {
    HashMap::from([
        ("corporate_registry", 0.99),
        ("companies_house", 0.99),
        ("government_registry", 0.98),
        ("court_records", 0.95),
        ("land_registry", 0.95),
        ("fec", 0.97),
        ("sec", 0.97),
        ("opencorporates", 0.90),
        ("orbis", 0.92),
        ("lexisnexis", 0.88),
        ("dnb", 0.90),
        ("osint_industries", 0.85),
        ("dehashed", 0.80),
        ("leakcheck", 0.78),
        ("breach_data", 0.75),
        ("whois", 0.82),
        ("dns", 0.85),
        ("linkedin", 0.70),
        ("social_media", 0.65),
        ("news", 0.70),
        ("web_scrape", 0.60),
        ("ai_extraction", 0.75),
        ("entity_extraction", 0.72),
        ("unknown", 0.50),
    ])
});

const COMMON_NAMES: &[&str] = &[
    "john", "james", "michael", "david", "robert", "william", "mary", "jennifer", "smith", "johnson", "williams",
    "jones", "brown", "davis", "miller", "test", "admin", "user", "info", "contact", "support", "noreply", "no-reply",
];

/// Provenance weight for a named source: exact match first, then
/// substring match either direction, then the `unknown` default.
pub fn source_provenance(source: Option<&str>) -> f64 {
    let default = SOURCE_PROVENANCE_WEIGHTS["unknown"];
    let Some(source) = source.filter(|s| !s.is_empty()) else {
        return default;
    };
    let lower = source.to_lowercase();
    if let Some(w) = SOURCE_PROVENANCE_WEIGHTS.get(lower.as_str()) {
        return *w;
    }
    for (key, weight) in SOURCE_PROVENANCE_WEIGHTS.iter() {
        if lower.contains(key) || key.contains(lower.as_str()) {
            return *weight;
        }
    }
    default
}

/// Accumulated provenance through a chain of sources: a product, not a
/// sum, so confidence decays every time a hop passes through a weaker
/// source.
pub fn chain_provenance(source_sequence: &[String]) -> f64 {
    source_sequence.iter().fold(1.0, |acc, s| acc * source_provenance(Some(s)))
}

/// Scores one discovered entity: hop decay, common-name penalty,
/// connection-strength boost against `root_value`, then source and chain
/// provenance multipliers. Clamped to `[0, 1]`.
pub fn calculate_relevance_score(
    entity_value: &str,
    root_value: &str,
    depth: u32,
    scoring: &ScoringConfig,
    source: Option<&str>,
    chain_provenance_value: f64,
) -> f64 {
    let decay_per_step = scoring.decay_per_step.unwrap_or(0.15);
    let name_weight = scoring.name_weight.unwrap_or(0.3);
    let common_name_penalty = scoring.common_name_penalty.unwrap_or(0.7);
    let connection_weight = scoring.connection_weight.unwrap_or(0.3);

    let mut score = (1.0 - decay_per_step).powi(depth as i32);

    let entity_lower = entity_value.to_lowercase();
    if COMMON_NAMES.iter().any(|c| entity_lower.contains(c)) {
        score -= common_name_penalty * name_weight;
    }

    let root_lower = root_value.to_lowercase();
    if !root_lower.is_empty() && !entity_lower.is_empty() {
        if root_lower == entity_lower {
            score += 0.3 * connection_weight;
        } else if entity_lower.contains(&root_lower) || root_lower.contains(&entity_lower) {
            score += 0.2 * connection_weight;
        } else if root_lower.contains('@') && entity_lower.contains('@') {
            let root_domain = root_lower.rsplit('@').next().unwrap_or("");
            let entity_domain = entity_lower.rsplit('@').next().unwrap_or("");
            if root_domain == entity_domain {
                score += 0.15 * connection_weight;
            }
        }
    }

    if let Some(src) = source {
        score *= source_provenance(Some(src));
    }
    score *= chain_provenance_value;

    score.clamp(0.0, 1.0)
}

/// Generic email providers excluded from domain-ownership/AI-filter
/// special-casing — a person's Gmail address says nothing about the
/// domain itself.
pub const GENERIC_EMAIL_DOMAINS: &[&str] = &["gmail.com", "yahoo.com", "hotmail.com", "outlook.com"];

/// Stand-in for the "would call an ML classifier in production" decision
/// point: a handful of hand-written heuristics per entity type. Always
/// expands high-value identifier types, gates generic webmail domains,
/// and otherwise falls back to the relevance threshold.
pub async fn ai_filter_decision(entity_type: &str, entity_value: &str, relevance: f64, confidence_threshold: f64) -> bool {
    match entity_type {
        "email" | "username" => true,
        "domain" => !GENERIC_EMAIL_DOMAINS.contains(&entity_value),
        "person_name" => relevance >= 0.6,
        _ => relevance >= confidence_threshold,
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%Y%m%d",
    "%d.%m.%Y",
    "%Y.%m.%d",
    "%B %d, %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%d %b %Y",
];

static EMBEDDED_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}[-/]\d{1,2}[-/]\d{1,2}").unwrap());

fn date_field_patterns(entity_type: &str) -> &'static [&'static str] {
    match entity_type {
        "person" => &["birth_date", "birthdate", "date_of_birth", "dob", "born"],
        "company" => &[
            "incorporation_date",
            "registered_date",
            "founded",
            "established",
            "date_incorporated",
            "formation_date",
            "registration_date",
        ],
        "domain" => &["registration_date", "created", "created_date", "registered", "creation_date", "domain_registered"],
        _ => &[],
    }
}

/// `?age` operator (§4.8): finds the entity's most relevant date field
/// by type (birth date for a person, incorporation date for a company,
/// registration date for a domain), falls back to any date-shaped key,
/// and reports years/months/days relative to today.
pub fn age_operator(entity: &Value) -> Value {
    let Some(obj) = entity.as_object() else {
        return json!({"status": "no_date_found"});
    };
    let entity_type = obj
        .get("type")
        .or_else(|| obj.get("entity_type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_lowercase();

    let patterns = date_field_patterns(&entity_type);
    let mut source: Option<(String, String)> = None;

    'search: for pattern in patterns {
        for (key, value) in obj {
            if key.to_lowercase().contains(pattern) && !value.is_null() {
                if let Some(s) = value.as_str() {
                    source = Some((key.clone(), s.to_string()));
                    break 'search;
                }
            }
        }
    }
    if source.is_none() {
        for (key, value) in obj {
            let kl = key.to_lowercase();
            if ["date", "born", "founded", "created", "registered"].iter().any(|d| kl.contains(d)) {
                if let Some(s) = value.as_str().filter(|s| !s.is_empty()) {
                    source = Some((key.clone(), s.to_string()));
                    break;
                }
            }
        }
    }

    let Some((source_field, raw)) = source else {
        return json!({"status": "no_date_found", "entity_type": entity_type, "searched_patterns": patterns});
    };

    let trimmed: String = raw.trim().chars().take(20).collect();
    let mut parsed: Option<NaiveDate> = None;
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(&trimmed, fmt) {
            parsed = Some(d);
            break;
        }
    }
    if parsed.is_none() {
        if let Some(m) = EMBEDDED_DATE_RE.find(&trimmed) {
            let normalized = m.as_str().replace('/', "-");
            parsed = NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").ok();
        }
    }

    let Some(source_date) = parsed else {
        return json!({"status": "parse_error", "source_field": source_field, "raw_value": raw});
    };

    let today = Utc::now().date_naive();
    let days = (today - source_date).num_days();
    if days < 0 {
        return json!({"status": "future_date", "source_field": source_field, "source_date": source_date.to_string()});
    }

    let years = days / 365;
    let months = (days % 365) / 30;
    json!({
        "status": "success",
        "years": years,
        "months": months,
        "days": days,
        "age_string": format!("{} years, {} months", years, months),
        "source_date": source_date.to_string(),
        "source_field": source_field,
    })
}

/// Applies [`age_operator`] to every entity in `results[entity_key]`
/// (falling back to `results["results"]`), attaching an `age` field to
/// entities with a successfully parsed date.
pub fn apply_age_to_results(mut results: Value, entity_key: &str) -> Value {
    let path = if results.get(entity_key).and_then(Value::as_array).is_some() {
        entity_key.to_string()
    } else {
        "results".to_string()
    };

    if let Some(Value::Array(entities)) = results.get_mut(&path) {
        for entity in entities.iter_mut() {
            let age_info = age_operator(entity);
            if age_info.get("status").and_then(Value::as_str) == Some("success") {
                if let Value::Object(map) = entity {
                    map.insert("age".to_string(), age_info);
                }
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ScoringConfig;

    #[test]
    fn exact_match_boosts_relevance() {
        let scoring = ScoringConfig::default();
        let matched = calculate_relevance_score("jane@firm.com", "jane@firm.com", 1, &scoring, None, 1.0);
        let unrelated = calculate_relevance_score("someone@elsewhere.com", "jane@firm.com", 1, &scoring, None, 1.0);
        assert!(matched > unrelated);
    }

    #[test]
    fn common_name_is_penalized() {
        let scoring = ScoringConfig::default();
        let common = calculate_relevance_score("John Smith", "unrelated-root", 0, &scoring, None, 1.0);
        let distinctive = calculate_relevance_score("Zbigniew Kowalczyk", "unrelated-root", 0, &scoring, None, 1.0);
        assert!(common < distinctive);
    }

    #[test]
    fn depth_decays_score() {
        let scoring = ScoringConfig::default();
        let shallow = calculate_relevance_score("x", "root", 0, &scoring, None, 1.0);
        let deep = calculate_relevance_score("x", "root", 5, &scoring, None, 1.0);
        assert!(deep < shallow);
    }

    #[test]
    fn provenance_weight_prefers_official_sources() {
        assert!(source_provenance(Some("companies_house")) > source_provenance(Some("web_scrape")));
        assert_eq!(source_provenance(None), SOURCE_PROVENANCE_WEIGHTS["unknown"]);
    }

    #[test]
    fn chain_provenance_multiplies_weights() {
        let p = chain_provenance(&["companies_house".to_string(), "linkedin".to_string()]);
        assert!((p - (0.99 * 0.70)).abs() < 1e-9);
    }

    #[test]
    fn age_operator_parses_iso_dates() {
        let entity = json!({"type": "company", "incorporation_date": "2000-01-01"});
        let age = age_operator(&entity);
        assert_eq!(age["status"], "success");
        assert!(age["years"].as_i64().unwrap() > 20);
    }

    #[test]
    fn age_operator_reports_missing_date() {
        let entity = json!({"type": "company", "name": "Acme"});
        let age = age_operator(&entity);
        assert_eq!(age["status"], "no_date_found");
    }
}

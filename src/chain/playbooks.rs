//! Playbook-based chain strategies (§4.8): cascading, parallel, and
//! pivoting compositions of Registry playbooks, as opposed to the
//! graph-shaped strategies in [`super::graph`] which mostly walk rules.
//! Grounded on `chain_executor.py`'s `_playbook_cascade`/
//! `_multi_jurisdiction_sweep`/`_domain_to_corporate_pivot`/
//! `_compliance_stack`/`_media_aggregation`.

use super::{envelope, merge_chain_data};
use crate::contracts::RuleExecutionResult;
use crate::core::types::{ChainInput, ChainRule, ChainRunResult, ChainType, RuleKind};
use crate::events::{self, EventCallback};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

impl super::ChainExecutor {
    /// Runs a jurisdiction's playbooks/rules in the order `chain_config`
    /// lists them, aggregating each step's `data` into one map. A
    /// `playbook_recommendation` step (the original's dynamic
    /// recommendation-engine lookup) has no closed-enum counterpart here
    /// and is skipped — playbook ids in this table are already resolved
    /// ahead of time by [`crate::registry::RuleRegistry::resolve_playbook_id`].
    pub(crate) async fn playbook_cascade(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let value = &initial_input.value;

        events::emit(
            event_callback,
            "playbook_cascade:start",
            json!({"chain_id": chain_rule.id, "value": value, "jurisdiction": jurisdiction, "steps": chain_config.steps.len()}),
        );

        let mut all_results: Vec<Value> = Vec::new();
        let mut aggregated: Map<String, Value> = Map::new();

        for step in &chain_config.steps {
            let Some(result) = self.execute_chain_step(&step.action, step.action_type, value, jurisdiction).await else {
                continue;
            };
            if !result.is_success() {
                continue;
            }
            merge_chain_data(&mut aggregated, &result);
            events::emit(
                event_callback,
                "playbook_cascade:step_complete",
                json!({"action": step.action, "outputs": result.results.len()}),
            );
            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
        }

        let mut extra = Map::new();
        extra.insert("value".to_string(), json!(value));
        extra.insert("aggregated_data".to_string(), Value::Object(aggregated));
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::PlaybookCascade, 1, 1, all_results.len(), 0, jurisdiction, extra)
    }

    /// Runs every configured step against the same value, dispatching
    /// steps flagged `fallback_pattern` as a parallel fan-out (mirroring
    /// the original's `step.get('parallel')`/`asyncio.gather` split) and
    /// everything else sequentially, then merges and reports which
    /// jurisdictions actually produced a result.
    pub(crate) async fn multi_jurisdiction_sweep(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let value = &initial_input.value;
        let run_parallel = chain_config.parallel_execution;

        events::emit(
            event_callback,
            "multi_jur_sweep:start",
            json!({"chain_id": chain_rule.id, "value": value, "parallel": run_parallel}),
        );

        let mut all_results: Vec<RuleExecutionResult> = Vec::new();
        let mut aggregated: Map<String, Value> = Map::new();
        let mut parallel_steps = Vec::new();

        for step in &chain_config.steps {
            let is_parallel = run_parallel && step.condition.as_deref().is_some_and(|c| c.contains("parallel"));
            if is_parallel {
                parallel_steps.push(step);
                continue;
            }
            if let Some(result) = self.execute_chain_step(&step.action, step.action_type, value, jurisdiction).await {
                if result.is_success() {
                    merge_chain_data(&mut aggregated, &result);
                    all_results.push(result);
                }
            }
        }

        if !parallel_steps.is_empty() {
            let calls = parallel_steps.iter().map(|step| self.execute_chain_step(&step.action, step.action_type, value, jurisdiction));
            let outcomes = futures::future::join_all(calls).await;
            for outcome in outcomes.into_iter().flatten() {
                if outcome.is_success() {
                    merge_chain_data(&mut aggregated, &outcome);
                    all_results.push(outcome);
                }
            }
        }

        let jurisdictions_covered: HashSet<String> = all_results
            .iter()
            .map(|r| r.data.get("jurisdiction").and_then(Value::as_str).unwrap_or("GLOBAL").to_string())
            .collect();

        let mut extra = Map::new();
        extra.insert("value".to_string(), json!(value));
        extra.insert("jurisdictions_covered".to_string(), json!(jurisdictions_covered.into_iter().collect::<Vec<_>>()));
        extra.insert("aggregated_data".to_string(), Value::Object(aggregated));
        extra.insert(
            "results".to_string(),
            Value::Array(all_results.iter().map(|r| serde_json::to_value(r).unwrap_or(Value::Null)).collect()),
        );
        envelope(chain_rule, ChainType::MultiJurisdictionSweep, 1, 1, all_results.len(), 0, jurisdiction, extra)
    }

    /// Pivots from domain intelligence to corporate enrichment: runs a
    /// digital/WHOIS playbook on the domain, extracts registrant
    /// companies/persons, then runs a registry playbook against each
    /// extracted company. A step's `condition` carrying the
    /// `company_input` marker is treated as needing the extracted
    /// companies as input rather than the domain itself (a stand-in for
    /// the original's numeric `input_fields` field-code check — see
    /// DESIGN.md).
    pub(crate) async fn domain_to_corporate_pivot(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let domain = &initial_input.value;

        events::emit(event_callback, "domain_pivot:start", json!({"domain": domain}));

        let mut all_results: Vec<Value> = Vec::new();
        let mut extracted_companies: HashSet<String> = HashSet::new();
        let mut extracted_persons: HashSet<String> = HashSet::new();

        for step in &chain_config.steps {
            if step.action_type != RuleKind::Playbook {
                continue;
            }

            let pivots_on_company = step.condition.as_deref().is_some_and(|c| c.contains("company_input"));
            if pivots_on_company {
                if extracted_companies.is_empty() {
                    continue;
                }
                for company in extracted_companies.clone() {
                    if let Some(result) = self.execute_chain_step(&step.action, step.action_type, &company, jurisdiction).await {
                        if result.is_success() {
                            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                        }
                    }
                }
                continue;
            }

            let Some(result) = self.execute_chain_step(&step.action, step.action_type, domain, jurisdiction).await else {
                continue;
            };
            if !result.is_success() {
                continue;
            }
            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
            extracted_companies.extend(extract_companies_from_result(&result));
            extracted_persons.extend(extract_persons_from_result(&result));
        }

        let mut extra = Map::new();
        extra.insert("domain".to_string(), json!(domain));
        extra.insert("extracted_companies".to_string(), json!(extracted_companies.iter().cloned().collect::<Vec<_>>()));
        extra.insert("extracted_persons".to_string(), json!(extracted_persons.iter().cloned().collect::<Vec<_>>()));
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(
            chain_rule,
            ChainType::DomainToCorporatePivot,
            1,
            1,
            all_results.len(),
            extracted_companies.len() + extracted_persons.len(),
            jurisdiction,
            extra,
        )
    }

    /// Runs compliance/legal playbooks, then pulls the officer list out
    /// of a `COMPANY_OFFICERS` step and screens each one individually
    /// against a `SANCTIONS_FROM_NAME` rule if one is configured.
    pub(crate) async fn compliance_stack(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let value = &initial_input.value;

        events::emit(event_callback, "compliance_stack:start", json!({"entity": value, "jurisdiction": jurisdiction}));

        let mut all_results: Vec<Value> = Vec::new();
        let mut findings = ComplianceFindings::default();
        let mut officers: Vec<String> = Vec::new();

        for step in &chain_config.steps {
            match step.action_type {
                RuleKind::Playbook => {
                    let Some(result) = self.execute_chain_step(&step.action, step.action_type, value, jurisdiction).await else {
                        continue;
                    };
                    if result.is_success() {
                        extract_compliance_data(&result, &mut findings);
                        all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                    }
                }
                RuleKind::Rule if step.action == "COMPANY_OFFICERS" => {
                    let Some(result) = self.execute_chain_step(&step.action, step.action_type, value, jurisdiction).await else {
                        continue;
                    };
                    if result.is_success() {
                        officers = extract_officer_names(&result);
                        all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                    }
                }
                RuleKind::Rule if step.action == "SANCTIONS_FROM_NAME" && !officers.is_empty() => {
                    for officer in &officers {
                        let Some(result) = self.execute_chain_step(&step.action, step.action_type, officer, jurisdiction).await else {
                            continue;
                        };
                        if result.is_success() {
                            findings.officers_screened.push(json!({"name": officer, "result": result.data.clone()}));
                            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                        }
                    }
                }
                RuleKind::Rule => {
                    if let Some(result) = self.execute_chain_step(&step.action, step.action_type, value, jurisdiction).await {
                        if result.is_success() {
                            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                        }
                    }
                }
            }
        }

        let mut extra = Map::new();
        extra.insert("entity".to_string(), json!(value));
        extra.insert("compliance_findings".to_string(), findings.into_value());
        extra.insert("officers_count".to_string(), json!(officers.len()));
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::ComplianceStack, 1, 1, all_results.len(), officers.len(), jurisdiction, extra)
    }

    /// Fans every configured media playbook out concurrently, then
    /// dedups the combined article list by URL (falling back to title)
    /// and caps the output at 100 items.
    pub(crate) async fn media_aggregation(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let value = &initial_input.value;

        events::emit(event_callback, "media_aggregation:start", json!({"entity": value, "parallel": true}));

        let calls = chain_config
            .steps
            .iter()
            .filter(|s| s.action_type == RuleKind::Playbook)
            .map(|step| self.execute_chain_step(&step.action, step.action_type, value, jurisdiction));
        let outcomes = futures::future::join_all(calls).await;

        let mut all_results: Vec<Value> = Vec::new();
        let mut media_items: Vec<Value> = Vec::new();
        for outcome in outcomes.into_iter().flatten() {
            if outcome.is_success() {
                media_items.extend(extract_media_items(&outcome));
                all_results.push(serde_json::to_value(&outcome).unwrap_or(Value::Null));
            }
        }

        let mut seen = HashSet::new();
        let mut unique_media = Vec::new();
        for item in media_items {
            let key = item
                .get("url")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| item.get("title").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            if !key.is_empty() && seen.insert(key) {
                unique_media.push(item);
            }
        }
        unique_media.truncate(100);

        let mut extra = Map::new();
        extra.insert("entity".to_string(), json!(value));
        extra.insert("total_sources".to_string(), json!(all_results.len()));
        extra.insert("total_media_items".to_string(), json!(unique_media.len()));
        extra.insert("media_items".to_string(), Value::Array(unique_media));
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::MediaAggregation, 1, 1, all_results.len(), 0, jurisdiction, extra)
    }
}

#[derive(Default)]
struct ComplianceFindings {
    sanctions_matches: Vec<Value>,
    pep_matches: Vec<Value>,
    adverse_media: Vec<Value>,
    litigation: Vec<Value>,
    officers_screened: Vec<Value>,
}

impl ComplianceFindings {
    fn into_value(self) -> Value {
        json!({
            "sanctions_matches": self.sanctions_matches,
            "pep_matches": self.pep_matches,
            "adverse_media": self.adverse_media,
            "litigation": self.litigation,
            "officers_screened": self.officers_screened,
        })
    }
}

fn extract_companies_from_result(result: &RuleExecutionResult) -> Vec<String> {
    extract_string_fields(result, &["company_name", "registrant_company", "company", "organization"])
}

fn extract_persons_from_result(result: &RuleExecutionResult) -> Vec<String> {
    extract_string_fields(result, &["person_name", "registrant_person", "name", "contact"])
}

fn extract_string_fields(result: &RuleExecutionResult, keys: &[&str]) -> Vec<String> {
    let mut values = Vec::new();
    for res in &result.results {
        let Some(Value::Object(data)) = res.get("data") else { continue };
        for key in keys {
            if let Some(Value::String(v)) = data.get(*key) {
                if !v.is_empty() {
                    values.push(v.clone());
                }
            }
        }
    }
    values
}

fn extract_officer_names(result: &RuleExecutionResult) -> Vec<String> {
    let mut officers = HashSet::new();
    for res in &result.results {
        let Some(Value::Object(data)) = res.get("data") else { continue };
        if let Some(Value::Array(list)) = data.get("officers") {
            for officer in list {
                match officer {
                    Value::Object(o) => {
                        if let Some(name) = o.get("name").or_else(|| o.get("officer_name")).and_then(Value::as_str) {
                            officers.insert(name.to_string());
                        }
                    }
                    Value::String(s) => {
                        officers.insert(s.clone());
                    }
                    _ => {}
                }
            }
        }
        if let Some(Value::String(name)) = data.get("officer_name") {
            officers.insert(name.clone());
        }
    }
    officers.into_iter().collect()
}

fn extract_compliance_data(result: &RuleExecutionResult, findings: &mut ComplianceFindings) {
    for res in &result.results {
        let Some(Value::Object(data)) = res.get("data") else { continue };
        if data.get("sanctions_match").is_some_and(truthy) {
            findings.sanctions_matches.push(Value::Object(data.clone()));
        }
        if data.get("pep_status").is_some_and(truthy) {
            findings.pep_matches.push(Value::Object(data.clone()));
        }
        if let Some(adverse) = data.get("adverse_media").filter(|v| truthy(v)) {
            extend_with(&mut findings.adverse_media, adverse);
        }
        if let Some(litigation) = data.get("litigation").filter(|v| truthy(v)) {
            extend_with(&mut findings.litigation, litigation);
        }
    }
}

fn extract_media_items(result: &RuleExecutionResult) -> Vec<Value> {
    let mut items = Vec::new();
    for res in &result.results {
        let Some(Value::Object(data)) = res.get("data") else { continue };
        if let Some(Value::Array(articles)) = data.get("articles") {
            items.extend(articles.iter().cloned());
        }
        let url = data.get("url").and_then(Value::as_str);
        let title = data.get("title").and_then(Value::as_str);
        if url.is_some() || title.is_some() {
            items.push(json!({
                "url": url,
                "title": title,
                "source": data.get("source"),
                "date": data.get("date").or_else(|| data.get("published_date")),
                "snippet": data.get("snippet").or_else(|| data.get("description")),
            }));
        }
    }
    items
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false)) && value != &json!("") && value != &json!([])
}

fn extend_with(target: &mut Vec<Value>, value: &Value) {
    match value {
        Value::Array(items) => target.extend(items.iter().cloned()),
        other => target.push(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::RuleExecutor;
    use crate::core::types::{ChainConfig, Step};
    use crate::registry::RuleRegistry;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;

    fn write(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn registry_with_playbook(rules: &[&str]) -> RuleRegistry {
        let dir = std::env::temp_dir().join(format!("deepwake-playbooks-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let rules_json = format!(r#"[{{"id":"MEDIA_PB","label":"media","rules":{:?}}}]"#, rules);
        write(&dir, "playbooks.json", &rules_json);
        let registry = RuleRegistry::load(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        registry
    }

    struct NewsExecutor {
        per_source: usize,
        b_duplicates_a: bool,
    }

    #[async_trait]
    impl RuleExecutor for NewsExecutor {
        async fn execute_rule(&self, rule_id: &str, _value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
            let prefix = match rule_id {
                "NEWS_A" => "x",
                "NEWS_B" => "y",
                "NEWS_C" => "z",
                _ => return RuleExecutionResult::failed("unknown source"),
            };
            let mut articles: Vec<Value> = Vec::new();
            if rule_id == "NEWS_B" && self.b_duplicates_a {
                // Re-surfaces the first 5 NEWS_A urls verbatim, as a second
                // outlet covering the same stories would.
                for i in 0..5 {
                    articles.push(json!({"url": format!("http://x/{}", i), "title": "also covered"}));
                }
            }
            for i in 0..self.per_source {
                articles.push(json!({"url": format!("http://{}/{}", prefix, i), "title": format!("{} story {}", prefix, i)}));
            }
            RuleExecutionResult {
                status: "success".to_string(),
                data: json!({"articles": articles}),
                results: vec![],
                error: None,
            }
        }
    }

    fn media_chain_rule() -> ChainRule {
        ChainRule {
            id: "test_media".to_string(),
            label: "Media sweep".to_string(),
            chain_config: ChainConfig {
                chain_type: ChainType::MediaAggregation,
                max_depth: 1,
                steps: vec![Step {
                    action: "MEDIA_PB".to_string(),
                    action_type: RuleKind::Playbook,
                    condition: None,
                    output_fields: vec![],
                    fallback_pattern: None,
                }],
                ..Default::default()
            },
            cymonides_persistence: None,
        }
    }

    fn media_input() -> ChainInput {
        ChainInput {
            value: "Acme Corp".to_string(),
            entity_type: "company".to_string(),
        }
    }

    /// §4.8: a second outlet re-reporting the same five stories does not
    /// inflate the aggregated count — they collapse to one entry each by
    /// url.
    #[tokio::test]
    async fn media_aggregation_dedupes_by_url() {
        let registry = Arc::new(registry_with_playbook(&["NEWS_A", "NEWS_B"]));
        let exec = super::super::ChainExecutor::new(
            registry,
            Arc::new(NewsExecutor { per_source: 10, b_duplicates_a: true }),
        );

        let result = exec.media_aggregation(&media_chain_rule(), &media_input(), None, &None).await;
        assert!(result.is_success());
        // 10 (A) + 10 (B) + 5 repeats of A's first five urls = 25 raw,
        // minus the 5 duplicates = 20 unique.
        assert_eq!(result.extra.get("total_media_items").unwrap(), 20);
        let items = result.extra.get("media_items").unwrap().as_array().unwrap();
        let urls: HashSet<String> = items.iter().filter_map(|i| i["url"].as_str().map(String::from)).collect();
        assert_eq!(urls.len(), 20, "no duplicate urls should survive dedup");
    }

    /// §4.8: output is capped at 100 media items even when three sources
    /// together surface 150 distinct ones.
    #[tokio::test]
    async fn media_aggregation_caps_output_at_100() {
        let registry = Arc::new(registry_with_playbook(&["NEWS_A", "NEWS_B", "NEWS_C"]));
        let exec = super::super::ChainExecutor::new(
            registry,
            Arc::new(NewsExecutor { per_source: 50, b_duplicates_a: false }),
        );

        let result = exec.media_aggregation(&media_chain_rule(), &media_input(), None, &None).await;
        assert!(result.is_success());
        assert_eq!(result.extra.get("total_media_items").unwrap(), 100);
        let items = result.extra.get("media_items").unwrap().as_array().unwrap();
        assert_eq!(items.len(), 100);
    }
}

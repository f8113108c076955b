//! Graph-shaped chain strategies (§4.8): recursive BFS expansion,
//! ownership-tree cascades, clustering, portfolio and network expansion,
//! and company-centered entity-network extraction. Grounded on
//! `chain_executor.py`'s `_recursive_expand`/`_cascading_ownership`/
//! `_clustering_network`/`_portfolio_expand`/`_network_expand`/
//! `_entity_network_extract` and their `_extract_shareholders`/
//! `_extract_holdings`/`_extract_persons` helpers.

use super::{envelope, extract_entities, make_dedup_key};
use crate::contracts::RuleExecutionResult;
use crate::core::types::{ChainInput, ChainRule, ChainRunResult, ChainType};
use crate::events::{self, EventCallback};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

impl super::ChainExecutor {
    /// BFS over `chain_config.steps`, re-executed against every entity
    /// discovered at the previous hop until `max_depth` or the frontier
    /// dries up. Example: officer → companies → officers at those
    /// companies → repeat.
    pub(crate) async fn recursive_expand(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let dedup_fields = &chain_config.deduplication_fields;

        let mut all_results: Vec<Value> = Vec::new();
        let mut seen_entities: HashSet<String> = HashSet::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut current_level: Vec<String> = vec![initial_input.value.clone()];
        let mut depth = 0u32;

        while !current_level.is_empty() && depth < max_depth {
            events::emit(
                event_callback,
                "chain:hop",
                json!({
                    "chain_id": chain_rule.id,
                    "depth": depth,
                    "max_depth": max_depth,
                    "queue_size": current_level.len(),
                    "entities_discovered": seen_entities.len(),
                }),
            );

            let mut next_level = Vec::new();
            for value in &current_level {
                if !processed.insert(value.clone()) {
                    continue;
                }

                for step in &chain_config.steps {
                    let Some(result) = self.execute_chain_step(&step.action, step.action_type, value, jurisdiction).await else {
                        continue;
                    };
                    if !result.is_success() {
                        continue;
                    }

                    let entities = extract_entities(&self.registry, &result, &step.output_fields);
                    for entity in entities {
                        let key = make_dedup_key(&Value::String(entity.clone()), dedup_fields);
                        let is_new = seen_entities.insert(key);
                        if is_new && depth + 1 < max_depth {
                            next_level.push(entity);
                        }
                    }
                    all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                }
            }

            current_level = next_level;
            depth += 1;
        }

        let mut extra = Map::new();
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::RecursiveExpansion, depth, max_depth, all_results.len(), seen_entities.len(), jurisdiction, extra)
    }

    /// Builds a beneficial-ownership tree: from the root owner, recurse
    /// into every shareholder above `ownership_threshold_pct` that is
    /// itself corporate, stopping at `max_depth`. Also backs
    /// `ChainType::HierarchicalExpansion`, which is the same traversal
    /// with a different default threshold rather than a distinct
    /// algorithm.
    pub(crate) async fn cascading_ownership(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        _event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let ownership_threshold = chain_config.ownership_threshold_pct.unwrap_or(25.0);
        let dedup_fields = &chain_config.deduplication_fields;

        let mut all_results: Vec<Value> = Vec::new();
        let mut seen_entities: HashSet<String> = HashSet::new();
        let mut tree = json!({
            "root": initial_input.value,
            "depth": 0,
            "children": Vec::<Value>::new(),
        });

        build_ownership_level(
            self,
            &chain_config.steps,
            initial_input.value.clone(),
            0,
            max_depth,
            ownership_threshold,
            dedup_fields,
            jurisdiction,
            &mut all_results,
            &mut seen_entities,
            &mut tree,
        )
        .await;

        let mut extra = Map::new();
        extra.insert("ownership_threshold".to_string(), json!(ownership_threshold));
        extra.insert("ownership_tree".to_string(), tree);
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, chain_config.chain_type, max_depth, max_depth, all_results.len(), seen_entities.len(), jurisdiction, extra)
    }

    /// Finds entities sharing an initial attribute (e.g. a registered
    /// address), then cross-references a second step across every member
    /// to surface officers/owners who recur across `cluster_threshold` or
    /// more of them.
    pub(crate) async fn clustering_network(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        _event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let cluster_threshold = chain_config.cluster_threshold.unwrap_or(2);
        let dedup_fields = &chain_config.deduplication_fields;

        let mut all_results: Vec<Value> = Vec::new();
        let mut nodes: Vec<Value> = Vec::new();
        let mut edges: Vec<Value> = Vec::new();
        let mut clusters: Map<String, Value> = Map::new();
        let mut seen_entities: HashSet<String> = HashSet::new();

        for (i, step) in chain_config.steps.iter().enumerate() {
            let condition = step.condition.as_deref().unwrap_or("");

            if i == 0 {
                let Some(result) = self.execute_chain_step(&step.action, step.action_type, &initial_input.value, jurisdiction).await else {
                    continue;
                };
                if result.is_success() {
                    let entities = extract_entities(&self.registry, &result, &step.output_fields);
                    for entity in entities {
                        let key = make_dedup_key(&Value::String(entity.clone()), dedup_fields);
                        if seen_entities.insert(key) {
                            nodes.push(json!({"id": entity, "type": "company", "cluster": initial_input.value}));
                        }
                    }
                    all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                }
            } else if condition.contains("cluster_analysis") || step.action.contains("CROSS_REFERENCE") {
                let mut officer_to_companies: HashMap<String, Vec<String>> = HashMap::new();
                let company_nodes: Vec<String> = nodes
                    .iter()
                    .filter(|n| n.get("type").and_then(Value::as_str) == Some("company"))
                    .filter_map(|n| n.get("id").and_then(Value::as_str).map(String::from))
                    .collect();

                for company in company_nodes {
                    let Some(result) = self.execute_chain_step(&step.action, step.action_type, &company, jurisdiction).await else {
                        continue;
                    };
                    if !result.is_success() {
                        continue;
                    }
                    all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                    let officers = extract_entities(&self.registry, &result, &step.output_fields);
                    for officer in officers {
                        officer_to_companies.entry(officer.clone()).or_default().push(company.clone());
                        if !nodes.iter().any(|n| n.get("id").and_then(Value::as_str) == Some(officer.as_str())) {
                            nodes.push(json!({"id": officer, "type": "person", "role": "officer"}));
                        }
                        edges.push(json!({"from": officer, "to": company, "type": "officer_of"}));
                    }
                }

                let shared: Vec<Value> = officer_to_companies
                    .into_iter()
                    .filter(|(_, companies)| companies.len() as u32 >= cluster_threshold)
                    .map(|(officer, companies)| {
                        json!({"officer": officer, "count": companies.len(), "companies": companies})
                    })
                    .collect();
                if !shared.is_empty() {
                    clusters.insert("shared_officers".to_string(), Value::Array(shared));
                }
            } else {
                let company_nodes: Vec<String> = nodes
                    .iter()
                    .filter_map(|n| n.get("id").and_then(Value::as_str).map(String::from))
                    .collect();
                for company in company_nodes {
                    if (i as u32) >= max_depth {
                        continue;
                    }
                    if let Some(result) = self.execute_chain_step(&step.action, step.action_type, &company, jurisdiction).await {
                        if result.is_success() {
                            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                        }
                    }
                }
            }
        }

        let mut extra = Map::new();
        extra.insert("cluster_threshold".to_string(), json!(cluster_threshold));
        extra.insert("total_nodes".to_string(), json!(nodes.len()));
        extra.insert("total_edges".to_string(), json!(edges.len()));
        extra.insert("clusters_found".to_string(), json!(clusters.len()));
        extra.insert("network".to_string(), json!({"nodes": nodes, "edges": edges}));
        extra.insert("clusters".to_string(), Value::Object(clusters));
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::ClusteringNetwork, max_depth, max_depth, all_results.len(), seen_entities.len(), jurisdiction, extra)
    }

    /// Follows a shareholder's holdings, recursing into any corporate
    /// holding whose ownership clears `ownership_threshold_pct` (default
    /// 5%, looser than [`Self::cascading_ownership`]'s default since a
    /// portfolio view cares about breadth, not just control stakes).
    pub(crate) async fn portfolio_expand(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        _event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let ownership_threshold = chain_config.ownership_threshold_pct.unwrap_or(5.0);
        let dedup_fields = &chain_config.deduplication_fields;

        let mut all_results: Vec<Value> = Vec::new();
        let mut holdings: Vec<Value> = Vec::new();
        let mut seen_entities: HashSet<String> = HashSet::new();
        let mut queue: Vec<(String, u32)> = vec![(initial_input.value.clone(), 0)];
        let mut processed: HashSet<String> = HashSet::new();

        while let Some((entity_value, depth)) = queue.pop() {
            if depth >= max_depth || !processed.insert(entity_value.clone()) {
                continue;
            }

            for step in &chain_config.steps {
                let condition = step.condition.as_deref().unwrap_or("");
                if condition.contains("depth < max_depth") && depth >= max_depth {
                    continue;
                }

                let Some(result) = self.execute_chain_step(&step.action, step.action_type, &entity_value, jurisdiction).await else {
                    continue;
                };
                if !result.is_success() {
                    continue;
                }
                all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));

                for holding in extract_holdings(&result) {
                    let company = holding.get("company").and_then(Value::as_str).unwrap_or_default().to_string();
                    let ownership_pct = holding.get("ownership_pct").and_then(Value::as_f64).unwrap_or(0.0);
                    if company.is_empty() || ownership_pct < ownership_threshold {
                        continue;
                    }

                    let key = make_dedup_key(&Value::String(company.clone()), dedup_fields);
                    if !seen_entities.insert(key) {
                        continue;
                    }

                    holdings.push(json!({
                        "company": company,
                        "ownership_pct": ownership_pct,
                        "investor": entity_value,
                        "depth": depth,
                    }));

                    if condition.contains("follow_corporate") {
                        queue.push((company, depth + 1));
                    }
                }
            }
        }

        let mut extra = Map::new();
        extra.insert("ownership_threshold".to_string(), json!(ownership_threshold));
        extra.insert(
            "portfolio".to_string(),
            json!({"investor": initial_input.value, "total_holdings": holdings.len(), "holdings": holdings}),
        );
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::PortfolioExpansion, max_depth, max_depth, all_results.len(), seen_entities.len(), jurisdiction, extra)
    }

    /// BFS over an officer-to-company appointment graph: officer →
    /// companies they sit on → every other officer at those companies →
    /// repeat, tracking shared-appointment metrics.
    pub(crate) async fn network_expand(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        _event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let network_threshold = chain_config.network_threshold.unwrap_or(2);

        let mut all_results: Vec<Value> = Vec::new();
        let mut seen_officers: HashSet<String> = HashSet::new();
        let mut seen_companies: HashSet<String> = HashSet::new();
        let mut connections: Vec<Value> = Vec::new();
        let mut officer_to_companies: HashMap<String, HashSet<String>> = HashMap::new();

        let mut officer_queue: Vec<(String, u32)> = vec![(initial_input.value.clone(), 0)];
        let mut processed_officers: HashSet<String> = HashSet::new();

        while !officer_queue.is_empty() {
            let (officer_name, depth) = officer_queue.remove(0);
            if depth >= max_depth || !processed_officers.insert(officer_name.clone()) {
                continue;
            }

            for step in &chain_config.steps {
                let condition = step.condition.as_deref().unwrap_or("");
                if condition.contains("depth < max_depth") && depth >= max_depth {
                    continue;
                }
                if condition.contains("officer_name != target_officer") && officer_name == initial_input.value {
                    continue;
                }

                if step.action.contains("OFFICER_APPOINTMENTS") {
                    let Some(result) = self.execute_chain_step(&step.action, step.action_type, &officer_name, jurisdiction).await else {
                        continue;
                    };
                    if !result.is_success() {
                        continue;
                    }
                    all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                    for company in extract_entities(&self.registry, &result, &step.output_fields) {
                        seen_companies.insert(company.clone());
                        officer_to_companies.entry(officer_name.clone()).or_default().insert(company.clone());
                        connections.push(json!({"officer": officer_name, "company": company, "type": "appointment"}));
                    }
                } else if step.action.contains("COMPANY_OFFICERS") {
                    let companies: Vec<String> = officer_to_companies.get(&officer_name).cloned().unwrap_or_default().into_iter().collect();
                    for company in companies {
                        let Some(result) = self.execute_chain_step(&step.action, step.action_type, &company, jurisdiction).await else {
                            continue;
                        };
                        if !result.is_success() {
                            continue;
                        }
                        all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                        for connected_officer in extract_entities(&self.registry, &result, &step.output_fields) {
                            if seen_officers.insert(connected_officer.clone()) && depth + 1 < max_depth {
                                officer_queue.push((connected_officer, depth + 1));
                            }
                        }
                    }
                }
            }
        }

        let total_connections = connections.len();
        let avg = if seen_officers.is_empty() { 0.0 } else { total_connections as f64 / seen_officers.len() as f64 };
        let shared_appointments = officer_to_companies.values().filter(|c| c.len() as u32 >= network_threshold).count();

        let mut extra = Map::new();
        extra.insert("network_threshold".to_string(), json!(network_threshold));
        extra.insert(
            "network".to_string(),
            json!({
                "center": initial_input.value,
                "officers": seen_officers.iter().cloned().collect::<Vec<_>>(),
                "companies": seen_companies.iter().cloned().collect::<Vec<_>>(),
                "connections": connections,
                "metrics": {
                    "total_officers": seen_officers.len(),
                    "total_companies": seen_companies.len(),
                    "total_connections": total_connections,
                    "avg_appointments_per_officer": avg,
                    "shared_appointments": shared_appointments,
                },
            }),
        );
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(
            chain_rule,
            ChainType::NetworkExpansion,
            max_depth,
            max_depth,
            all_results.len(),
            seen_officers.len() + seen_companies.len(),
            jurisdiction,
            extra,
        )
    }

    /// Pulls every person connected to a company (officers, beneficial
    /// owners, shareholders) via the first three configured steps, then —
    /// if `max_depth` allows and a fourth step is configured — follows
    /// each person into their other appointments to surface secondary
    /// companies.
    pub(crate) async fn entity_network_extract(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        _event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        let chain_config = &chain_rule.chain_config;
        let dedup_fields = &chain_config.deduplication_fields;

        let mut all_results: Vec<Value> = Vec::new();
        let mut persons: Vec<Value> = Vec::new();
        let mut connections: Vec<Value> = Vec::new();
        let mut secondary_companies: Vec<Value> = Vec::new();
        let mut seen_persons: HashSet<String> = HashSet::new();

        for step in chain_config.steps.iter().take(3) {
            let Some(result) = self.execute_chain_step(&step.action, step.action_type, &initial_input.value, jurisdiction).await else {
                continue;
            };
            if !result.is_success() {
                continue;
            }
            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));

            for person in extract_persons(&result) {
                let name = person.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let role = person.get("role").and_then(Value::as_str).unwrap_or("unknown").to_string();
                if name.is_empty() {
                    continue;
                }
                let key = make_dedup_key(&Value::String(name.clone()), dedup_fields);
                if !seen_persons.insert(key) {
                    continue;
                }
                persons.push(json!({"name": name, "role": role, "connection_to_company": initial_input.value}));
                connections.push(json!({"person": name, "company": initial_input.value, "type": role}));
            }
        }

        if max_depth > 1 {
            if let Some(step) = chain_config.steps.get(3) {
                for person in &persons {
                    let name = person.get("name").and_then(Value::as_str).unwrap_or_default();
                    let Some(result) = self.execute_chain_step(&step.action, step.action_type, name, jurisdiction).await else {
                        continue;
                    };
                    if !result.is_success() {
                        continue;
                    }
                    all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                    for company in extract_entities(&self.registry, &result, &step.output_fields) {
                        secondary_companies.push(json!({"company": company, "via_person": name}));
                    }
                }
            }
        }

        let mut extra = Map::new();
        extra.insert(
            "network".to_string(),
            json!({
                "center_company": initial_input.value,
                "persons": persons,
                "connections": connections,
                "secondary_companies": secondary_companies,
            }),
        );
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(
            chain_rule,
            ChainType::EntityNetworkExtraction,
            max_depth,
            max_depth,
            all_results.len(),
            seen_persons.len(),
            jurisdiction,
            extra,
        )
    }
}

/// Boxed/pinned to allow recursion across an `async fn` (Rust can't
/// self-reference an `async fn`'s anonymous future type).
#[allow(clippy::too_many_arguments)]
fn build_ownership_level<'a>(
    executor: &'a super::ChainExecutor,
    steps: &'a [crate::core::types::Step],
    entity_value: String,
    current_depth: u32,
    max_depth: u32,
    ownership_threshold: f64,
    dedup_fields: &'a [String],
    jurisdiction: Option<&'a str>,
    all_results: &'a mut Vec<Value>,
    seen_entities: &'a mut HashSet<String>,
    parent_node: &'a mut Value,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        if current_depth >= max_depth {
            return;
        }

        for step in steps {
            let condition = step.condition.as_deref().unwrap_or("");
            if condition.contains("shareholder_type") && current_depth == 0 {
                continue;
            }

            let Some(result) = executor.execute_chain_step(&step.action, step.action_type, &entity_value, jurisdiction).await else {
                continue;
            };
            if !result.is_success() {
                continue;
            }
            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));

            for shareholder in extract_shareholders(&result) {
                let name = shareholder.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let ownership_pct = shareholder.get("ownership_pct").and_then(Value::as_f64).unwrap_or(0.0);
                let shareholder_type = shareholder.get("type").and_then(Value::as_str).unwrap_or("person").to_string();

                if ownership_pct < ownership_threshold || name.is_empty() {
                    continue;
                }
                let key = make_dedup_key(&Value::String(name.clone()), dedup_fields);
                if !seen_entities.insert(key) {
                    continue;
                }

                let mut child_node = json!({
                    "entity": name,
                    "type": shareholder_type,
                    "ownership_pct": ownership_pct,
                    "depth": current_depth + 1,
                    "children": Vec::<Value>::new(),
                });

                if shareholder_type == "company" && current_depth + 1 < max_depth {
                    build_ownership_level(
                        executor,
                        steps,
                        name.clone(),
                        current_depth + 1,
                        max_depth,
                        ownership_threshold,
                        dedup_fields,
                        jurisdiction,
                        all_results,
                        seen_entities,
                        &mut child_node,
                    )
                    .await;
                }

                if let Some(children) = parent_node.get_mut("children").and_then(Value::as_array_mut) {
                    children.push(child_node);
                }
            }
        }
    })
}

/// Extracts `{name, ownership_pct, type}` shareholder records from a
/// rule result's `data`, whether it is a list of records or a
/// `{shareholders: [...]}` object.
pub(crate) fn extract_shareholders(result: &RuleExecutionResult) -> Vec<Value> {
    let mut shareholders = Vec::new();
    for res in &result.results {
        let Some(data) = res.get("data") else { continue };
        match data {
            Value::Array(records) => {
                for record in records {
                    let Value::Object(map) = record else { continue };
                    let name = map.get("shareholder_name").or_else(|| map.get("name")).and_then(Value::as_str);
                    if let Some(name) = name {
                        let pct = map
                            .get("ownership_pct")
                            .or_else(|| map.get("shares_pct"))
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0);
                        let kind = map.get("shareholder_type").and_then(Value::as_str).unwrap_or("person");
                        shareholders.push(json!({"name": name, "ownership_pct": pct, "type": kind}));
                    }
                }
            }
            Value::Object(map) => {
                if let Some(Value::Array(list)) = map.get("shareholders") {
                    for s in list {
                        let Value::Object(s) = s else { continue };
                        let Some(name) = s.get("name").and_then(Value::as_str) else { continue };
                        let pct = s.get("ownership_pct").and_then(Value::as_f64).unwrap_or(0.0);
                        let kind = s.get("type").and_then(Value::as_str).unwrap_or("person");
                        shareholders.push(json!({"name": name, "ownership_pct": pct, "type": kind}));
                    }
                }
            }
            _ => {}
        }
    }
    shareholders
}

/// Extracts `{company, ownership_pct}` holding records.
pub(crate) fn extract_holdings(result: &RuleExecutionResult) -> Vec<Value> {
    let mut holdings = Vec::new();
    for res in &result.results {
        let Some(Value::Array(records)) = res.get("data") else { continue };
        for record in records {
            let Value::Object(map) = record else { continue };
            let company = map.get("company_name").or_else(|| map.get("company")).and_then(Value::as_str);
            if let Some(company) = company {
                let pct = map.get("ownership_pct").or_else(|| map.get("shares_pct")).and_then(Value::as_f64).unwrap_or(0.0);
                holdings.push(json!({"company": company, "ownership_pct": pct}));
            }
        }
    }
    holdings
}

/// Extracts `{name, role}` person records, checking the officer / owner
/// / shareholder / generic name fields in that priority order.
pub(crate) fn extract_persons(result: &RuleExecutionResult) -> Vec<Value> {
    let mut persons = Vec::new();
    for res in &result.results {
        let Some(Value::Array(records)) = res.get("data") else { continue };
        for record in records {
            let Value::Object(map) = record else { continue };
            let name = ["officer_name", "beneficial_owner_name", "shareholder_name", "person_name", "name"]
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str));
            if let Some(name) = name {
                let role = map
                    .get("officer_role")
                    .or_else(|| map.get("role"))
                    .or_else(|| map.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                persons.push(json!({"name": name, "role": role}));
            }
        }
    }
    persons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::RuleExecutor;
    use crate::core::types::{ChainConfig, RuleKind, Step};
    use crate::registry::RuleRegistry;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::Path;

    fn registry_with(files: &[(&str, &str)]) -> RuleRegistry {
        let dir = std::env::temp_dir().join(format!("deepwake-graph-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, contents) in files {
            write(&dir, name, contents);
        }
        let registry = RuleRegistry::load(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        registry
    }

    fn write(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    struct OfficerCompanyExecutor;

    #[async_trait]
    impl RuleExecutor for OfficerCompanyExecutor {
        async fn execute_rule(&self, rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
            match (rule_id, value) {
                ("OFFICER_APPOINTMENTS", "Jane Officer") => RuleExecutionResult {
                    status: "success".to_string(),
                    data: Value::Null,
                    results: vec![json!({"data": [{"company_name": "Alpha Ltd"}, {"company_name": "Beta Ltd"}]})],
                    error: None,
                },
                ("COMPANY_OFFICERS", "Alpha Ltd") => RuleExecutionResult {
                    status: "success".to_string(),
                    data: Value::Null,
                    results: vec![json!({"data": [
                        {"officer_name": "Officer A1"},
                        {"officer_name": "Officer A2"},
                        {"officer_name": "Officer A3"},
                    ]})],
                    error: None,
                },
                ("COMPANY_OFFICERS", "Beta Ltd") => RuleExecutionResult {
                    status: "success".to_string(),
                    data: Value::Null,
                    results: vec![json!({"data": [
                        {"officer_name": "Officer B1"},
                        {"officer_name": "Officer B2"},
                        {"officer_name": "Officer B3"},
                    ]})],
                    error: None,
                },
                _ => RuleExecutionResult::failed("no stub for this call"),
            }
        }
    }

    /// Scenario 2 (§8): officer appointments → company officers, two
    /// hops, expects `total_results >= 3` and `unique_entities == 8`
    /// (2 companies + 6 distinct officers).
    #[tokio::test]
    async fn recursive_expansion_officer_to_companies_to_officers() {
        let registry = std::sync::Arc::new(registry_with(&[
            ("rules.json", r#"[{"id":"OFFICER_APPOINTMENTS","kind":"rule"},{"id":"COMPANY_OFFICERS","kind":"rule"}]"#),
            ("legend.json", r#"{"1":"company_name","2":"officer_name"}"#),
        ]));
        let exec = super::super::ChainExecutor::new(registry, std::sync::Arc::new(OfficerCompanyExecutor));

        let chain_rule = ChainRule {
            id: "test_recursive".to_string(),
            label: "Officer network".to_string(),
            chain_config: ChainConfig {
                chain_type: ChainType::RecursiveExpansion,
                max_depth: 2,
                steps: vec![
                    Step {
                        action: "OFFICER_APPOINTMENTS".to_string(),
                        action_type: RuleKind::Rule,
                        condition: None,
                        output_fields: vec![1],
                        fallback_pattern: None,
                    },
                    Step {
                        action: "COMPANY_OFFICERS".to_string(),
                        action_type: RuleKind::Rule,
                        condition: None,
                        output_fields: vec![2],
                        fallback_pattern: None,
                    },
                ],
                ..Default::default()
            },
            cymonides_persistence: None,
        };
        let input = ChainInput {
            value: "Jane Officer".to_string(),
            entity_type: "person".to_string(),
        };

        let result = exec.recursive_expand(&chain_rule, &input, 2, None, &None).await;
        assert!(result.is_success());
        assert!(result.total_results >= 3);
        assert_eq!(result.unique_entities, 8);
    }

    struct ShareholderExecutor;

    #[async_trait]
    impl RuleExecutor for ShareholderExecutor {
        async fn execute_rule(&self, rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
            if rule_id != "SHAREHOLDER_LOOKUP" {
                return RuleExecutionResult::failed("unknown rule");
            }
            match value {
                "Root Co" => RuleExecutionResult {
                    status: "success".to_string(),
                    data: Value::Null,
                    results: vec![json!({"data": [
                        {"shareholder_name": "A Corp", "ownership_pct": 60.0, "shareholder_type": "company"},
                        {"shareholder_name": "P. Jones", "ownership_pct": 10.0, "shareholder_type": "person"},
                    ]})],
                    error: None,
                },
                "A Corp" => RuleExecutionResult {
                    status: "success".to_string(),
                    data: Value::Null,
                    results: vec![json!({"data": [
                        {"shareholder_name": "B Ltd", "ownership_pct": 30.0, "shareholder_type": "company"},
                    ]})],
                    error: None,
                },
                _ => RuleExecutionResult::failed("no shareholders on file"),
            }
        }
    }

    /// Scenario 3 (§8): root → A Corp (60%) → B Ltd (30%); P. Jones
    /// (10%) is excluded by the 25% threshold.
    #[tokio::test]
    async fn cascading_ownership_excludes_below_threshold_shareholder() {
        let registry = std::sync::Arc::new(registry_with(&[(
            "rules.json",
            r#"[{"id":"SHAREHOLDER_LOOKUP","kind":"rule"}]"#,
        )]));
        let exec = super::super::ChainExecutor::new(registry, std::sync::Arc::new(ShareholderExecutor));

        let chain_rule = ChainRule {
            id: "test_cascading".to_string(),
            label: "Ownership cascade".to_string(),
            chain_config: ChainConfig {
                chain_type: ChainType::CascadingOwnership,
                max_depth: 3,
                steps: vec![Step {
                    action: "SHAREHOLDER_LOOKUP".to_string(),
                    action_type: RuleKind::Rule,
                    condition: None,
                    output_fields: vec![],
                    fallback_pattern: None,
                }],
                ownership_threshold_pct: Some(25.0),
                ..Default::default()
            },
            cymonides_persistence: None,
        };
        let input = ChainInput {
            value: "Root Co".to_string(),
            entity_type: "company".to_string(),
        };

        let result = exec.cascading_ownership(&chain_rule, &input, 3, None, &None).await;
        assert!(result.is_success());

        let tree = result.extra.get("ownership_tree").unwrap();
        assert_eq!(tree["root"], "Root Co");
        let children = tree["children"].as_array().unwrap();
        assert_eq!(children.len(), 1, "P. Jones at 10% must be excluded by the 25% threshold");
        assert_eq!(children[0]["entity"], "A Corp");
        assert_eq!(children[0]["ownership_pct"], 60.0);

        let grandchildren = children[0]["children"].as_array().unwrap();
        assert_eq!(grandchildren.len(), 1);
        assert_eq!(grandchildren[0]["entity"], "B Ltd");
        assert_eq!(grandchildren[0]["ownership_pct"], 30.0);
        assert!(grandchildren[0]["children"].as_array().unwrap().is_empty());
    }
}

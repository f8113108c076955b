//! The three OSINT-specific chain strategies (§4.8): `osint_cascade` (the
//! centerpiece recursive discovery engine with relevance scoring and
//! optional persistence), `osint_breach_network` (credential-reuse and
//! password/breach clustering), and `osint_person_web` (the sequential
//! seven-step identity-resolution pipeline). Grounded on
//! `chain_executor.py`'s `_osint_cascade`/`_execute_osint_lookup`/
//! `_extract_osint_entities`/`_osint_breach_network`/`_osint_person_web`.
//!
//! Unlike [`super::graph`] and [`super::playbooks`], these three never
//! read `chain_config.steps` for their lookup calls — the original's
//! fallback chains (`OSINT_FROM_EMAIL -> DEHASHED_FROM_EMAIL -> ...`) are
//! fixed rule ids baked into the strategy itself, tried in order against
//! the Rule Executor directly until one succeeds (§4.8's "per-hop
//! protocol").

use super::{envelope, make_dedup_key};
use crate::contracts::RuleExecutionResult;
use crate::core::types::{
    ChainEntityNode, ChainInput, ChainRule, ChainRunResult, ChainType, EntityGraph, ScoringConfig,
};
use crate::events::{self, EventCallback};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

/// One item on the cascade's per-hop worklist. `source_chain` carries the
/// provenance labels of every ancestor hop (not including the hop that
/// is about to be processed), so `chain_provenance` stays the product of
/// *prior* weights while the current hop's own weight is applied
/// separately per the relevance formula (§4.8).
struct QueueItem {
    value: String,
    entity_type: String,
    depth: u32,
    source_chain: Vec<String>,
}

/// First-success-wins rule id chains per entity type (§4.8 "per-hop
/// protocol"). Unlisted types fall back to a single generic lookup id.
fn fallback_chain_for_type(entity_type: &str) -> &'static [&'static str] {
    match entity_type {
        "email" => &["OSINT_FROM_EMAIL", "DEHASHED_FROM_EMAIL", "OSINT_INDUSTRIES_FROM_EMAIL"],
        "username" => &["OSINT_FROM_USERNAME", "DEHASHED_FROM_USERNAME"],
        "person" | "person_name" => &["OSINT_FROM_PERSON", "OSINT_INDUSTRIES_FROM_NAME"],
        "domain" => &["WHOIS_FROM_DOMAIN", "DOMAIN_LOOKUP"],
        "phone" => &["OSINT_FROM_PHONE", "DEHASHED_FROM_PHONE"],
        _ => &["OSINT_FROM_ENTITY"],
    }
}

/// Maps a winning rule id to a provenance label understood by
/// [`super::relevance::source_provenance`]. Best-effort: an id this
/// crate doesn't recognize still falls through to that function's
/// substring match, or its `unknown` default.
fn source_label_for_rule(rule_id: &str) -> &'static str {
    let lower = rule_id.to_lowercase();
    if lower.contains("dehashed") {
        "dehashed"
    } else if lower.contains("whois") {
        "whois"
    } else if lower.contains("domain_lookup") || lower.contains("dns") {
        "dns"
    } else if lower.contains("industries") {
        "osint_industries"
    } else {
        "entity_extraction"
    }
}

/// Declarative field-name patterns (§4.8 step 4), checked in this order
/// so a key like `username` matches `username` before the looser `name`
/// pattern under `person_name`.
const DECLARATIVE_PATTERNS: &[(&str, &[&str])] = &[
    ("email", &["email", "e-mail", "mail"]),
    ("phone", &["phone", "mobile", "telephone", "cell"]),
    ("username", &["username", "user", "login", "handle"]),
    ("domain", &["domain", "website", "url"]),
    ("person_name", &["name", "full_name", "person_name"]),
];

/// Walks a rule result's `data` (and any nested object/array) collecting
/// `(entity_type, value)` pairs per the declarative patterns. Values are
/// accepted only at string length >= 3 (§4.8), and list-valued fields are
/// normalized to one entry per member (§9 "always normalize to
/// list-of-string before dedupe").
fn extract_declarative_entities(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    collect_declarative(value, &mut out);
    out
}

fn collect_declarative(value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let key_lower = key.to_lowercase();
                if let Some((entity_type, _)) = DECLARATIVE_PATTERNS.iter().find(|(_, pats)| pats.iter().any(|p| key_lower.contains(p))) {
                    push_declarative_values(entity_type, v, out);
                } else if matches!(v, Value::Object(_) | Value::Array(_)) {
                    collect_declarative(v, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_declarative(item, out);
            }
        }
        _ => {}
    }
}

fn push_declarative_values(entity_type: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) if s.trim().len() >= 3 => out.push((entity_type.to_string(), s.trim().to_string())),
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    if s.trim().len() >= 3 {
                        out.push((entity_type.to_string(), s.trim().to_string()));
                    }
                }
            }
        }
        _ => {}
    }
}

impl super::ChainExecutor {
    /// Tries each rule id in `fallback_chain_for_type(entity_type)`
    /// against the Rule Executor in order; the first success wins. These
    /// ids are fixed per §4.8 and are not looked up against the Rule
    /// Registry — unlike a chain-config `step`, they are the Chain
    /// Executor's own built-in OSINT lookup protocol.
    async fn execute_osint_lookup(&self, value: &str, entity_type: &str, jurisdiction: Option<&str>) -> (RuleExecutionResult, Option<String>) {
        for rule_id in fallback_chain_for_type(entity_type) {
            let result = self.rule_executor.execute_rule(rule_id, value, jurisdiction).await;
            if result.is_success() {
                return (result, Some(rule_id.to_string()));
            }
        }
        (RuleExecutionResult::failed(format!("no working rule for type: {}", entity_type)), None)
    }

    /// The centerpiece recursive OSINT discovery engine (§4.8): relevance-
    /// scored, depth-bounded, deduplicating expansion with an optional AI
    /// filter and best-effort persistence. Processes one depth level at a
    /// time (BFS depth monotonicity, testable property 1); `max_entities`
    /// is checked at each admission so a run stops mid-level rather than
    /// overshooting the budget.
    pub(crate) async fn osint_cascade(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        if initial_input.value.trim().is_empty() {
            return ChainRunResult::failed(chain_rule.id.clone(), ChainType::OsintCascade, "empty seed value");
        }

        let chain_config = &chain_rule.chain_config;
        let dedup_fields = &chain_config.deduplication_fields;
        let relevance_threshold = chain_config.relevance_threshold.or(chain_config.stopping_conditions.min_relevance).unwrap_or(0.3);
        let max_entities = chain_config.stopping_conditions.max_entities.unwrap_or(500) as usize;
        let ai_filter_enabled = chain_config.ai_filter_enabled;
        let ai_confidence_threshold = chain_config
            .ai_confidence_threshold
            .or(chain_config.stopping_conditions.ai_confidence_threshold)
            .unwrap_or(0.6);
        let scoring = ScoringConfig {
            decay_per_step: chain_config.scoring.decay_per_step.or(chain_config.decay_per_step),
            ..chain_config.scoring.clone()
        };
        let persist = chain_rule.cymonides_persistence.as_deref() == Some("always") && self.entity_store.is_some();

        let root_value = initial_input.value.clone();
        let mut graph = EntityGraph::new(root_value.clone(), initial_input.entity_type.clone());
        let mut all_entities: Vec<ChainEntityNode> = Vec::new();
        let mut all_results: Vec<Value> = Vec::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut seen_entities: HashSet<String> = HashSet::new();
        seen_entities.insert(make_dedup_key(&Value::String(root_value.clone()), dedup_fields));

        let mut current_level = vec![QueueItem {
            value: root_value.clone(),
            entity_type: initial_input.entity_type.clone(),
            depth: 0,
            source_chain: Vec::new(),
        }];
        let mut depth_reached = 0u32;
        let mut stop_reason = "queue_exhausted";

        'outer: while !current_level.is_empty() {
            if current_level[0].depth > max_depth {
                stop_reason = "max_depth_reached";
                break;
            }
            depth_reached = current_level[0].depth;

            events::emit(
                event_callback,
                "chain:hop",
                json!({
                    "chain_id": chain_rule.id,
                    "depth": depth_reached,
                    "queue_size": current_level.len(),
                    "entities_discovered": all_entities.len(),
                }),
            );

            let mut next_level: Vec<QueueItem> = Vec::new();

            for item in current_level.drain(..) {
                let processed_key = format!("{}:{}", item.entity_type.to_lowercase(), item.value.to_lowercase());
                if !processed.insert(processed_key) {
                    continue;
                }

                events::emit(
                    event_callback,
                    "osint_cascade:entity_processing",
                    json!({"value": item.value, "type": item.entity_type, "depth": item.depth}),
                );

                let (result, rule_id) = self.execute_osint_lookup(&item.value, &item.entity_type, jurisdiction).await;
                if !result.is_success() {
                    continue;
                }
                all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));

                let source_label = rule_id.as_deref().map(source_label_for_rule).unwrap_or("unknown").to_string();
                let chain_provenance_value = super::chain_provenance(&item.source_chain);

                let mut candidates = extract_declarative_entities(&result.data);
                for res in &result.results {
                    if let Some(data) = res.get("data") {
                        candidates.extend(extract_declarative_entities(data));
                    }
                }

                for (entity_type, value) in candidates {
                    if all_entities.len() >= max_entities {
                        stop_reason = "max_entities_reached";
                        break 'outer;
                    }

                    let key = make_dedup_key(&Value::String(value.clone()), dedup_fields);
                    if seen_entities.contains(&key) {
                        // Suppresses both the duplicate node and the edge
                        // back to an already-discovered entity (e.g. a
                        // related-entity lookup pointing back at the root).
                        continue;
                    }

                    let relevance = super::calculate_relevance_score(
                        &value,
                        &root_value,
                        item.depth + 1,
                        &scoring,
                        Some(&source_label),
                        chain_provenance_value,
                    );
                    if relevance < relevance_threshold {
                        continue;
                    }
                    if ai_filter_enabled && !super::relevance::ai_filter_decision(&entity_type, &value, relevance, ai_confidence_threshold).await {
                        continue;
                    }

                    seen_entities.insert(key);
                    let node = ChainEntityNode::new(value.clone(), entity_type.clone(), item.depth + 1, relevance, Value::Null);
                    graph.nodes.push(node.clone());
                    graph.add_edge(item.value.clone(), value.clone(), entity_type.clone());
                    all_entities.push(node.clone());

                    events::emit(
                        event_callback,
                        "osint_cascade:entity_discovered",
                        json!({"value": value, "type": entity_type, "depth": item.depth + 1, "relevance": relevance}),
                    );

                    if persist {
                        if let Some(store) = &self.entity_store {
                            match store.create_node(&entity_type, &value, &node.data, &source_label).await {
                                Ok(id) => events::emit(event_callback, "cymonides:persisted", json!({"value": value, "id": id})),
                                Err(e) => events::emit(event_callback, "cymonides:error", json!({"value": value, "error": e})),
                            }
                        }
                    }

                    if item.depth + 1 <= max_depth {
                        let mut source_chain = item.source_chain.clone();
                        source_chain.push(source_label.clone());
                        next_level.push(QueueItem {
                            value,
                            entity_type,
                            depth: item.depth + 1,
                            source_chain,
                        });
                    }
                }
            }

            if next_level.is_empty() {
                stop_reason = "queue_exhausted";
                break;
            }
            current_level = next_level;
        }

        events::emit(event_callback, "osint_cascade:stopped", json!({"chain_id": chain_rule.id, "reason": stop_reason}));

        let mut extra = Map::new();
        extra.insert("stopped_reason".to_string(), json!(stop_reason));
        extra.insert("entity_graph".to_string(), serde_json::to_value(&graph).unwrap_or(Value::Null));
        extra.insert("all_entities".to_string(), serde_json::to_value(&all_entities).unwrap_or(Value::Null));
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::OsintCascade, depth_reached, max_depth, all_results.len(), graph.nodes.len() + 1, jurisdiction, extra)
    }

    /// Depth-bounded walk over credential accounts (§4.8): each
    /// successful breach lookup yields zero or more `{email?, username?,
    /// password?, password_hash?, breach_source}` accounts; newly seen
    /// emails/usernames (other than the value that produced them) are
    /// enqueued for their own lookup. Clustering happens in a single pass
    /// over the accumulated accounts once the walk completes.
    pub(crate) async fn osint_breach_network(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        if initial_input.value.trim().is_empty() {
            return ChainRunResult::failed(chain_rule.id.clone(), ChainType::OsintBreachNetwork, "empty seed value");
        }

        let chain_config = &chain_rule.chain_config;
        let dedup_fields = &chain_config.deduplication_fields;

        let mut all_results: Vec<Value> = Vec::new();
        let mut accounts: Vec<Value> = Vec::new();
        let mut seen_accounts: HashSet<String> = HashSet::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut queue: Vec<(String, String, u32)> = vec![(initial_input.value.clone(), initial_input.entity_type.clone(), 0)];
        let mut depth_reached = 0u32;

        while let Some((value, entity_type, depth)) = queue.pop() {
            if depth > max_depth {
                continue;
            }
            depth_reached = depth_reached.max(depth);

            let processed_key = format!("{}:{}", entity_type.to_lowercase(), value.to_lowercase());
            if !processed.insert(processed_key) {
                continue;
            }

            events::emit(event_callback, "osint_breach_network:hop", json!({"value": value, "type": entity_type, "depth": depth}));

            let (result, _) = self.execute_osint_lookup(&value, &entity_type, jurisdiction).await;
            if !result.is_success() {
                continue;
            }
            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));

            for account in extract_breach_accounts(&result) {
                let key = make_dedup_key(&account, dedup_fields);
                if !seen_accounts.insert(key) {
                    continue;
                }
                accounts.push(account.clone());

                if depth < max_depth {
                    if let Some(email) = account.get("email").and_then(Value::as_str).filter(|e| !e.is_empty() && e.to_lowercase() != value.to_lowercase()) {
                        queue.push((email.to_string(), "email".to_string(), depth + 1));
                    }
                    if let Some(username) = account.get("username").and_then(Value::as_str).filter(|u| !u.is_empty() && u.to_lowercase() != value.to_lowercase()) {
                        queue.push((username.to_string(), "username".to_string(), depth + 1));
                    }
                }
            }
        }

        let mut by_password: HashMap<String, Vec<Value>> = HashMap::new();
        let mut by_source: HashMap<String, Vec<Value>> = HashMap::new();
        let mut email_sources: HashMap<String, HashSet<String>> = HashMap::new();

        for account in &accounts {
            if chain_config.breach_clustering.cluster_by_password {
                if let Some(pw) = account.get("password").and_then(Value::as_str).filter(|p| !p.is_empty()) {
                    by_password.entry(pw.to_string()).or_default().push(account.clone());
                }
            }
            if chain_config.breach_clustering.cluster_by_breach_source {
                if let Some(src) = account.get("breach_source").and_then(Value::as_str).filter(|s| !s.is_empty()) {
                    by_source.entry(src.to_string()).or_default().push(account.clone());
                }
            }
            if let (Some(email), Some(src)) = (
                account.get("email").and_then(Value::as_str).filter(|e| !e.is_empty()),
                account.get("breach_source").and_then(Value::as_str).filter(|s| !s.is_empty()),
            ) {
                email_sources.entry(email.to_lowercase()).or_default().insert(src.to_string());
            }
        }

        let password_clusters: Vec<Value> = by_password
            .into_iter()
            .filter(|(_, v)| v.len() >= 2)
            .map(|(password, accts)| json!({"password": password, "count": accts.len(), "accounts": accts}))
            .collect();
        let breach_clusters: Vec<Value> = by_source
            .into_iter()
            .map(|(source, accts)| json!({"breach_source": source, "count": accts.len(), "accounts": accts}))
            .collect();
        let credential_reuse: Vec<Value> = email_sources
            .into_iter()
            .filter(|(_, srcs)| srcs.len() >= 2)
            .map(|(email, srcs)| json!({"email": email, "breach_count": srcs.len(), "breach_sources": srcs.into_iter().collect::<Vec<_>>()}))
            .collect();

        let mut extra = Map::new();
        extra.insert(
            "breach_network".to_string(),
            json!({
                "seed": initial_input.value,
                "total_accounts": accounts.len(),
                "accounts": accounts,
                "password_clusters": password_clusters,
                "breach_clusters": breach_clusters,
                "credential_reuse": credential_reuse,
            }),
        );
        extra.insert("results".to_string(), Value::Array(all_results.clone()));
        envelope(chain_rule, ChainType::OsintBreachNetwork, depth_reached, max_depth, all_results.len(), accounts.len(), jurisdiction, extra)
    }

    /// Sequential seven-step identity-resolution pipeline (§4.8): person
    /// lookup, social profiles, breach data, corporate affiliations,
    /// domain ownership, a consolidated identity-resolution summary, and
    /// — only when `max_depth > 1` — one more hop following discovered
    /// social profiles back through the social-lookup step.
    pub(crate) async fn osint_person_web(
        &self,
        chain_rule: &ChainRule,
        initial_input: &ChainInput,
        max_depth: u32,
        jurisdiction: Option<&str>,
        event_callback: &Option<EventCallback>,
    ) -> ChainRunResult {
        if initial_input.value.trim().is_empty() {
            return ChainRunResult::failed(chain_rule.id.clone(), ChainType::OsintPersonWeb, "empty seed value");
        }

        let chain_config = &chain_rule.chain_config;
        let person_name = initial_input.value.clone();

        let mut all_results: Vec<Value> = Vec::new();
        let mut person_names: HashSet<String> = HashSet::new();
        person_names.insert(person_name.to_lowercase());
        let mut emails: HashSet<String> = HashSet::new();
        let mut usernames: HashSet<String> = HashSet::new();
        let mut domains: HashSet<String> = HashSet::new();
        let mut social_profiles: Vec<Value> = Vec::new();
        let mut breach_accounts: Vec<Value> = Vec::new();
        let mut corporate_affiliations: Vec<Value> = Vec::new();
        let mut domain_ownership: Vec<Value> = Vec::new();

        events::emit(event_callback, "osint_person_web:start", json!({"person": person_name}));

        // Step 1: person lookup.
        let (person_result, _) = self.execute_osint_lookup(&person_name, "person", jurisdiction).await;
        if person_result.is_success() {
            all_results.push(serde_json::to_value(&person_result).unwrap_or(Value::Null));
            bucket_declarative(&person_result.data, &mut emails, &mut usernames, &mut domains, &mut person_names);
        }

        // Step 2: social profiles, seeded from any username found so far
        // (falling back to the person's name itself).
        let social_seeds: Vec<String> = if usernames.is_empty() { vec![person_name.clone()] } else { usernames.iter().cloned().collect() };
        for seed in &social_seeds {
            let (result, _) = self.execute_osint_lookup(seed, "username", jurisdiction).await;
            if result.is_success() {
                all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                social_profiles.extend(extract_social_profiles(&result));
                bucket_declarative(&result.data, &mut emails, &mut usernames, &mut domains, &mut person_names);
            }
        }

        // Step 3: breach data for every email/username discovered so far.
        let breach_seeds: Vec<(String, String)> = emails
            .iter()
            .map(|e| (e.clone(), "email".to_string()))
            .chain(usernames.iter().map(|u| (u.clone(), "username".to_string())))
            .collect();
        for (seed, seed_type) in &breach_seeds {
            let (result, _) = self.execute_osint_lookup(seed, seed_type, jurisdiction).await;
            if result.is_success() {
                all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                breach_accounts.extend(extract_breach_accounts(&result));
            }
        }

        // Step 4: corporate affiliations for the person.
        let (corporate_result, _) = self.execute_osint_lookup(&person_name, "person", jurisdiction).await;
        if corporate_result.is_success() {
            all_results.push(serde_json::to_value(&corporate_result).unwrap_or(Value::Null));
            corporate_affiliations.extend(extract_corporate_affiliations(&corporate_result));
        }

        // Step 5: domain ownership, admitted only when the WHOIS
        // registrant name substring-matches a discovered person name and
        // the domain is not a free-mail provider (§4.8).
        for domain in &domains {
            if super::relevance::GENERIC_EMAIL_DOMAINS.contains(&domain.as_str()) {
                continue;
            }
            let (result, _) = self.execute_osint_lookup(domain, "domain", jurisdiction).await;
            if !result.is_success() {
                events::emit_warning(event_callback, "osint_person_web:domain_ownership", format!("WHOIS lookup failed for {}", domain));
                continue;
            }
            all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
            let Some(registrant) = result.data.get("registrant_name").and_then(Value::as_str) else {
                continue;
            };
            let registrant_lower = registrant.to_lowercase();
            let matches = person_names.iter().any(|p| registrant_lower.contains(p.as_str()) || p.contains(registrant_lower.as_str()));
            if matches {
                domain_ownership.push(json!({"domain": domain, "registrant": registrant}));
            }
        }

        // Step 6: identity resolution — a confidence-gated summary of
        // every identifier bucketed above.
        let identity_confidence = identity_resolution_confidence(&emails, &usernames, &domain_ownership, &corporate_affiliations);
        let identity_resolved = chain_config.identity_resolution.enabled && identity_confidence >= chain_config.identity_resolution.confidence_threshold;

        // Step 7: optional recursive expansion of social profiles.
        let mut expanded_social_profiles: Vec<Value> = Vec::new();
        if max_depth > 1 {
            let handles: Vec<String> = social_profiles.iter().filter_map(|p| p.get("username").and_then(Value::as_str).map(String::from)).collect();
            for handle in handles {
                let (result, _) = self.execute_osint_lookup(&handle, "username", jurisdiction).await;
                if result.is_success() {
                    all_results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                    expanded_social_profiles.extend(extract_social_profiles(&result));
                }
            }
        }

        let mut extra = Map::new();
        extra.insert(
            "person_profile".to_string(),
            json!({
                "person": person_name,
                "person_names": person_names.iter().cloned().collect::<Vec<_>>(),
                "emails": emails.iter().cloned().collect::<Vec<_>>(),
                "usernames": usernames.iter().cloned().collect::<Vec<_>>(),
                "social_profiles": social_profiles,
                "expanded_social_profiles": expanded_social_profiles,
                "breach_accounts": breach_accounts,
                "corporate_affiliations": corporate_affiliations,
                "domain_ownership": domain_ownership,
                "identity_confidence": identity_confidence,
                "identity_resolved": identity_resolved,
            }),
        );
        extra.insert("results".to_string(), Value::Array(all_results.clone()));

        let unique_entities =
            emails.len() + usernames.len() + domain_ownership.len() + corporate_affiliations.len() + social_profiles.len() + expanded_social_profiles.len();
        envelope(
            chain_rule,
            ChainType::OsintPersonWeb,
            if max_depth > 1 { 2 } else { 1 },
            max_depth,
            all_results.len(),
            unique_entities,
            jurisdiction,
            extra,
        )
    }
}

/// Pulls `{email?, username?, password?, password_hash?, breach_source}`
/// account records out of a breach lookup's `data.accounts`/`data.breaches`
/// array (§4.8).
fn extract_breach_accounts(result: &RuleExecutionResult) -> Vec<Value> {
    let mut accounts = Vec::new();
    let Some(data) = result.data.as_object() else { return accounts };
    let records = data
        .get("accounts")
        .or_else(|| data.get("breaches"))
        .or_else(|| data.get("credentials"))
        .and_then(Value::as_array);
    if let Some(records) = records {
        for record in records {
            let Value::Object(map) = record else { continue };
            accounts.push(json!({
                "email": map.get("email").and_then(Value::as_str),
                "username": map.get("username").and_then(Value::as_str),
                "password": map.get("password").and_then(Value::as_str),
                "password_hash": map.get("password_hash").or_else(|| map.get("hash")).and_then(Value::as_str),
                "breach_source": map.get("breach_source").or_else(|| map.get("source")).and_then(Value::as_str).unwrap_or("unknown"),
            }));
        }
    }
    accounts
}

/// Pulls `{platform?, username, url?}` social-profile records out of a
/// social lookup's `data.profiles` array.
fn extract_social_profiles(result: &RuleExecutionResult) -> Vec<Value> {
    let mut profiles = Vec::new();
    let Some(data) = result.data.as_object() else { return profiles };
    if let Some(Value::Array(records)) = data.get("profiles").or_else(|| data.get("social_profiles")) {
        for record in records {
            let Value::Object(map) = record else { continue };
            let Some(username) = map.get("username").or_else(|| map.get("handle")).and_then(Value::as_str) else { continue };
            profiles.push(json!({
                "platform": map.get("platform").and_then(Value::as_str).unwrap_or("unknown"),
                "username": username,
                "url": map.get("url").and_then(Value::as_str),
            }));
        }
    }
    profiles
}

/// Pulls `{company, role}` affiliation records out of a corporate
/// lookup's `data.appointments`/`data.companies` array.
fn extract_corporate_affiliations(result: &RuleExecutionResult) -> Vec<Value> {
    let mut affiliations = Vec::new();
    let Some(data) = result.data.as_object() else { return affiliations };
    if let Some(Value::Array(records)) = data.get("appointments").or_else(|| data.get("companies")) {
        for record in records {
            match record {
                Value::Object(map) => {
                    let company = map.get("company_name").or_else(|| map.get("company")).and_then(Value::as_str);
                    if let Some(company) = company {
                        affiliations.push(json!({
                            "company": company,
                            "role": map.get("role").or_else(|| map.get("officer_role")).and_then(Value::as_str).unwrap_or("unknown"),
                        }));
                    }
                }
                Value::String(s) => affiliations.push(json!({"company": s, "role": "unknown"})),
                _ => {}
            }
        }
    }
    affiliations
}

/// Buckets declarative entities straight into the person-web pipeline's
/// running sets, rather than building `ChainEntityNode`s — this strategy
/// reports a consolidated profile, not a discovery graph.
fn bucket_declarative(
    data: &Value,
    emails: &mut HashSet<String>,
    usernames: &mut HashSet<String>,
    domains: &mut HashSet<String>,
    person_names: &mut HashSet<String>,
) {
    for (entity_type, value) in extract_declarative_entities(data) {
        match entity_type.as_str() {
            "email" => {
                emails.insert(value.to_lowercase());
            }
            "username" => {
                usernames.insert(value);
            }
            "domain" => {
                domains.insert(value.to_lowercase());
            }
            "person_name" => {
                person_names.insert(value.to_lowercase());
            }
            _ => {}
        }
    }
}

/// A coarse confidence score for the identity-resolution step: the
/// fraction of the five identifier categories (email, username, domain
/// ownership, corporate affiliation — person name is always present as
/// the seed) that produced at least one result.
fn identity_resolution_confidence(emails: &HashSet<String>, usernames: &HashSet<String>, domain_ownership: &[Value], corporate: &[Value]) -> f64 {
    let mut hits = 1.0; // the seed person name itself.
    let mut total = 1.0;
    for present in [!emails.is_empty(), !usernames.is_empty(), !domain_ownership.is_empty(), !corporate.is_empty()] {
        total += 1.0;
        if present {
            hits += 1.0;
        }
    }
    hits / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{EntityStore, RuleExecutor};
    use crate::core::types::{ChainConfig, ChainInput, ChainRule};
    use crate::registry::RuleRegistry;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubExecutor;

    #[async_trait]
    impl RuleExecutor for StubExecutor {
        async fn execute_rule(&self, rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
            if value == "jane.doe@example.com" && rule_id == "OSINT_FROM_EMAIL" {
                return RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"email": ["jane.doe@example.com"], "phone": ["+15551234567"], "username": ["jane.doe"]}),
                    results: vec![],
                    error: None,
                };
            }
            if value == "jane.doe" && rule_id == "OSINT_FROM_USERNAME" {
                return RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"email": ["jane.doe@example.com", "john@example.com"]}),
                    results: vec![],
                    error: None,
                };
            }
            RuleExecutionResult::failed("no stub for this call")
        }
    }

    fn test_chain_rule(max_depth: u32, relevance_threshold: f64) -> ChainRule {
        ChainRule {
            id: "test_cascade".to_string(),
            label: "Test cascade".to_string(),
            chain_config: ChainConfig {
                chain_type: ChainType::OsintCascade,
                max_depth,
                relevance_threshold: Some(relevance_threshold),
                ai_filter_enabled: false,
                ..Default::default()
            },
            cymonides_persistence: None,
        }
    }

    fn executor() -> super::super::ChainExecutor {
        let registry = Arc::new(RuleRegistry::default());
        super::super::ChainExecutor::new(registry, Arc::new(StubExecutor))
    }

    #[tokio::test]
    async fn osint_cascade_discovers_related_entities_and_suppresses_self_edges() {
        let exec = executor();
        let chain_rule = test_chain_rule(2, 0.0);
        let input = ChainInput {
            value: "jane.doe@example.com".to_string(),
            entity_type: "email".to_string(),
        };

        let result = exec.osint_cascade(&chain_rule, &input, 2, None, &None).await;
        assert!(result.is_success());

        let entities = result.extra.get("all_entities").unwrap().as_array().unwrap();
        let values: HashSet<String> = entities.iter().map(|e| e["value"].as_str().unwrap().to_string()).collect();
        assert_eq!(values, HashSet::from(["+15551234567".to_string(), "jane.doe".to_string(), "john@example.com".to_string()]));

        let graph = result.extra.get("entity_graph").unwrap();
        let edges = graph["edges"].as_array().unwrap();
        // Root -> phone, root -> username, username -> john@example.com.
        // The username lookup's self-referencing "jane.doe@example.com"
        // is suppressed by dedupe, so no fourth edge exists.
        assert_eq!(edges.len(), 3);
    }

    #[tokio::test]
    async fn osint_cascade_respects_relevance_threshold() {
        let exec = executor();
        let chain_rule = test_chain_rule(2, 1.1); // unreachable threshold
        let input = ChainInput {
            value: "jane.doe@example.com".to_string(),
            entity_type: "email".to_string(),
        };
        let result = exec.osint_cascade(&chain_rule, &input, 2, None, &None).await;
        let entities = result.extra.get("all_entities").unwrap().as_array().unwrap();
        assert!(entities.is_empty());
        assert_eq!(result.extra.get("stopped_reason").unwrap(), "queue_exhausted");
    }

    #[tokio::test]
    async fn osint_cascade_empty_seed_fails_without_calling_executor() {
        let exec = executor();
        let chain_rule = test_chain_rule(2, 0.0);
        let input = ChainInput {
            value: String::new(),
            entity_type: "email".to_string(),
        };
        let result = exec.osint_cascade(&chain_rule, &input, 2, None, &None).await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn osint_cascade_max_entities_zero_stops_immediately() {
        let exec = executor();
        let mut chain_rule = test_chain_rule(2, 0.0);
        chain_rule.chain_config.stopping_conditions.max_entities = Some(0);
        let input = ChainInput {
            value: "jane.doe@example.com".to_string(),
            entity_type: "email".to_string(),
        };
        let result = exec.osint_cascade(&chain_rule, &input, 2, None, &None).await;
        let entities = result.extra.get("all_entities").unwrap().as_array().unwrap();
        assert!(entities.is_empty());
        assert_eq!(result.extra.get("stopped_reason").unwrap(), "max_entities_reached");
    }

    struct BreachExecutor;

    #[async_trait]
    impl RuleExecutor for BreachExecutor {
        async fn execute_rule(&self, _rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
            if value == "victim@example.com" {
                return RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"accounts": [
                        {"email": "victim@example.com", "username": "victim99", "password": "hunter2", "breach_source": "BreachA"},
                        {"email": "victim@example.com", "password_hash": "abc", "breach_source": "BreachB"},
                    ]}),
                    results: vec![],
                    error: None,
                };
            }
            if value == "victim99" {
                return RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"accounts": [{"email": "victim@example.com", "username": "victim99", "password": "hunter2", "breach_source": "BreachC"}]}),
                    results: vec![],
                    error: None,
                };
            }
            RuleExecutionResult::failed("no stub")
        }
    }

    #[tokio::test]
    async fn osint_breach_network_builds_credential_reuse_and_password_clusters() {
        let registry = Arc::new(RuleRegistry::default());
        let exec = super::super::ChainExecutor::new(registry, Arc::new(BreachExecutor));
        let chain_rule = ChainRule {
            id: "test_breach".to_string(),
            label: "Test breach".to_string(),
            chain_config: ChainConfig {
                chain_type: ChainType::OsintBreachNetwork,
                max_depth: 2,
                ..Default::default()
            },
            cymonides_persistence: None,
        };
        let input = ChainInput {
            value: "victim@example.com".to_string(),
            entity_type: "email".to_string(),
        };

        let result = exec.osint_breach_network(&chain_rule, &input, 2, None, &None).await;
        assert!(result.is_success());
        let network = result.extra.get("breach_network").unwrap();
        assert_eq!(network["total_accounts"], 3);
        let reuse = network["credential_reuse"].as_array().unwrap();
        assert_eq!(reuse.len(), 1);
        assert_eq!(reuse[0]["breach_count"], 3);
        let password_clusters = network["password_clusters"].as_array().unwrap();
        assert_eq!(password_clusters.len(), 1);
        assert_eq!(password_clusters[0]["count"], 2);
    }

    #[allow(dead_code)]
    struct NoopStore;

    #[async_trait]
    impl EntityStore for NoopStore {
        async fn create_node(&self, _entity_type: &str, _value: &str, _data: &Value, _source: &str) -> Result<Option<String>, String> {
            Ok(None)
        }
    }

    struct PersonWebExecutor;

    #[async_trait]
    impl RuleExecutor for PersonWebExecutor {
        async fn execute_rule(&self, rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
            match (rule_id, value) {
                ("OSINT_FROM_PERSON", "Jane Doe") => RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"email": ["jane@firm.com"], "username": ["janedoe"]}),
                    results: vec![],
                    error: None,
                },
                ("OSINT_FROM_USERNAME", "janedoe") => RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"profiles": [{"platform": "twitter", "username": "janedoe", "url": "https://twitter.com/janedoe"}]}),
                    results: vec![],
                    error: None,
                },
                ("OSINT_FROM_EMAIL", "jane@firm.com") => RuleExecutionResult {
                    status: "success".to_string(),
                    data: json!({"accounts": [{"email": "jane@firm.com", "password": "abc123", "breach_source": "BreachX"}]}),
                    results: vec![],
                    error: None,
                },
                _ => RuleExecutionResult::failed("no stub for this call"),
            }
        }
    }

    #[tokio::test]
    async fn osint_person_web_consolidates_identifiers_across_steps() {
        let registry = Arc::new(RuleRegistry::default());
        let exec = super::super::ChainExecutor::new(registry, Arc::new(PersonWebExecutor));
        let chain_rule = ChainRule {
            id: "test_person_web".to_string(),
            label: "Test person web".to_string(),
            chain_config: ChainConfig {
                chain_type: ChainType::OsintPersonWeb,
                max_depth: 1,
                ..Default::default()
            },
            cymonides_persistence: None,
        };
        let input = ChainInput {
            value: "Jane Doe".to_string(),
            entity_type: "person".to_string(),
        };

        let result = exec.osint_person_web(&chain_rule, &input, 1, None, &None).await;
        assert!(result.is_success());

        let profile = result.extra.get("person_profile").unwrap();
        assert_eq!(profile["emails"].as_array().unwrap(), &vec![json!("jane@firm.com")]);
        assert_eq!(profile["usernames"].as_array().unwrap(), &vec![json!("janedoe")]);
        let social = profile["social_profiles"].as_array().unwrap();
        assert_eq!(social.len(), 1);
        assert_eq!(social[0]["platform"], "twitter");
        let breaches = profile["breach_accounts"].as_array().unwrap();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0]["breach_source"], "BreachX");
        assert!(profile["domain_ownership"].as_array().unwrap().is_empty());
        // Seed + email + username present, domain/corporate absent: 3/5 confidence.
        assert!((profile["identity_confidence"].as_f64().unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(profile["identity_resolved"], false);
    }
}

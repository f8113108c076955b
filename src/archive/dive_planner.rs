//! Dive Planner (§4.4): composes Sonar + Periscope results into a
//! prioritized `DivePlan`. Algorithm and constants are carried from
//! `dive_planner/planner.py` (`_apply_domain_filters`, `_normalize_cc_
//! timestamp`, `_normalize_mime`, `_normalize_language`,
//! `_prioritize_domains`, `_keyword_to_cc_pattern`); the bounded-fan-out
//! shape is modeled on `tools/crawl.rs`'s `stream::iter(..).buffer_
//! unordered(n)` concurrency pattern.

use crate::archive::periscope::{CcIndexClient, LookupFilters};
use crate::archive::sonar::{Sonar, SonarResult};
use crate::core::state::ExecutorState;
use crate::core::types::{CCRecord, DivePlan, DiveTarget};
use crate::error::CoreError;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub query: String,
    pub max_domains: usize,
    pub max_pages_per_domain: usize,
    pub cc_archives: Vec<String>,
    pub filter_status: Option<u16>,
    pub filter_mime: Option<String>,
    pub filter_languages: Option<String>,
    pub from_ts: Option<String>,
    pub to_ts: Option<String>,
    pub domain_allowlist: Vec<String>,
    pub domain_denylist: Vec<String>,
    pub tld_include: Vec<String>,
    pub tld_exclude: Vec<String>,
    pub url_contains: Option<String>,
    pub enable_cc_keyword_fallback: bool,
}

impl PlanRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_domains: 200,
            max_pages_per_domain: 10,
            cc_archives: vec!["CC-MAIN-2025-51".to_string()],
            filter_status: Some(200),
            enable_cc_keyword_fallback: true,
            ..Default::default()
        }
    }
}

pub struct DivePlanner {
    periscope: Arc<dyn CcIndexClient>,
    sonar: Arc<Sonar>,
    /// Bounds concurrent CC Index lookups. Shared with the rest of the
    /// engine when built via `from_state`, so a `DivePlanner` never opens
    /// more simultaneous CC Index requests than `ExecutorState` allows.
    fan_out_limit: Arc<Semaphore>,
    /// `domain|archive|filters` -> merged `CCRecord`s. Shared with the
    /// rest of the engine when built via `from_state`.
    cache: moka::future::Cache<String, Vec<CCRecord>>,
    max_domains_cap: usize,
}

impl DivePlanner {
    pub fn new(periscope: Arc<dyn CcIndexClient>, sonar: Arc<Sonar>, cc_index_concurrency: usize, max_domains_cap: usize) -> Self {
        Self {
            periscope,
            sonar,
            fan_out_limit: Arc::new(Semaphore::new(cc_index_concurrency.clamp(1, 32))),
            cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60 * 30))
                .build(),
            max_domains_cap,
        }
    }

    /// Builds a planner that shares `state`'s CC Index concurrency limit
    /// and lookup cache, rather than each planner instance opening its
    /// own independent pool of CC Index requests.
    pub fn from_state(state: &ExecutorState) -> Self {
        Self {
            periscope: Arc::clone(&state.periscope),
            sonar: Arc::clone(&state.sonar),
            fan_out_limit: Arc::clone(&state.cc_index_limit),
            cache: state.cc_lookup_cache.clone(),
            max_domains_cap: state.config.resolve_max_domains_cap(),
        }
    }

    pub async fn create_plan(&self, req: PlanRequest) -> Result<DivePlan, CoreError> {
        let max_domains = req.max_domains.clamp(1, self.max_domains_cap);
        let max_pages_per_domain = req.max_pages_per_domain.clamp(1, 500);
        if req.query.trim().is_empty() {
            return Err(CoreError::Validation("empty query".to_string()));
        }

        let sonar_result = self.sonar.scan_all(&req.query, max_domains).await;

        let mut domains = seed_domains(&req.query, &sonar_result);
        domains = apply_domain_filters(
            domains,
            &req.domain_allowlist,
            &req.domain_denylist,
            &req.tld_include,
            &req.tld_exclude,
        );

        let mut plan = DivePlan::new(req.query.clone(), sonar_result.query_type.clone());
        plan.sonar_indices_used = sonar_result.indices_scanned.iter().map(|d| d.index.clone()).collect();
        plan.cc_archives_queried = req.cc_archives.clone();

        if domains.is_empty() && req.enable_cc_keyword_fallback {
            return self
                .create_plan_from_cc_keyword(req, plan, max_domains, max_pages_per_domain)
                .await;
        }

        let priorities = prioritize_domains(&req.query, &domains, &sonar_result);
        domains.truncate(max_domains);

        let filters = LookupFilters {
            limit: max_pages_per_domain,
            filter_status: req.filter_status,
            filter_mime: req.filter_mime.clone(),
            filter_languages: req.filter_languages.clone(),
            from_ts: req.from_ts.clone(),
            to_ts: req.to_ts.clone(),
            url_contains: req.url_contains.clone(),
        };

        let mut targets = self
            .fetch_targets(&domains, &priorities, &req.cc_archives, &filters, max_pages_per_domain, &sonar_result)
            .await;

        targets.sort_by_key(|t| t.priority);
        for target in targets {
            plan.add_target(target);
        }

        Ok(plan)
    }

    /// For callers that already possess a domain list (e.g. from
    /// exploration), bypassing Sonar entirely.
    pub async fn create_plan_from_domains(
        &self,
        domains: Vec<String>,
        req: PlanRequest,
    ) -> Result<DivePlan, CoreError> {
        let max_domains = req.max_domains.clamp(1, self.max_domains_cap);
        let max_pages_per_domain = req.max_pages_per_domain.clamp(1, 500);

        let mut domains = apply_domain_filters(
            normalize_domains(&domains),
            &req.domain_allowlist,
            &req.domain_denylist,
            &req.tld_include,
            &req.tld_exclude,
        );
        domains.truncate(max_domains);

        let priorities: HashMap<String, u8> = domains.iter().map(|d| (d.clone(), 3)).collect();

        let mut plan = DivePlan::new(req.query.clone(), "domain_list".to_string());
        plan.cc_archives_queried = req.cc_archives.clone();

        let filters = LookupFilters {
            limit: max_pages_per_domain,
            filter_status: req.filter_status,
            filter_mime: req.filter_mime.clone(),
            filter_languages: req.filter_languages.clone(),
            from_ts: req.from_ts.clone(),
            to_ts: req.to_ts.clone(),
            url_contains: req.url_contains.clone(),
        };

        let sonar_result = SonarResult::default();
        let mut targets = self
            .fetch_targets(&domains, &priorities, &req.cc_archives, &filters, max_pages_per_domain, &sonar_result)
            .await;
        targets.sort_by_key(|t| t.priority);
        for target in targets {
            plan.add_target(target);
        }
        Ok(plan)
    }

    async fn create_plan_from_cc_keyword(
        &self,
        req: PlanRequest,
        mut plan: DivePlan,
        max_domains: usize,
        max_pages_per_domain: usize,
    ) -> Result<DivePlan, CoreError> {
        let keyword = req.url_contains.clone().unwrap_or_else(|| req.query.clone());
        let pattern = keyword_to_cc_pattern(&keyword);
        if pattern.is_empty() {
            return Ok(plan);
        }

        let filters = LookupFilters {
            limit: max_pages_per_domain * max_domains,
            filter_status: req.filter_status,
            filter_mime: req.filter_mime.clone(),
            filter_languages: req.filter_languages.clone(),
            from_ts: req.from_ts.clone(),
            to_ts: req.to_ts.clone(),
            url_contains: None,
        };

        let mut by_domain: HashMap<String, Vec<CCRecord>> = HashMap::new();
        let mut seen_records: HashSet<(String, u64, u64)> = HashSet::new();

        for archive in &req.cc_archives {
            let records = match self.periscope.search(&pattern, archive, &filters).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("periscope keyword search failed for archive {}: {}", archive, e);
                    continue;
                }
            };
            for record in records {
                if !seen_records.insert(record.dedup_key()) {
                    continue;
                }
                if let Some(domain) = domain_from_url(&record.url) {
                    let domain = apply_domain_filters(
                        vec![domain],
                        &req.domain_allowlist,
                        &req.domain_denylist,
                        &req.tld_include,
                        &req.tld_exclude,
                    );
                    if let Some(domain) = domain.into_iter().next() {
                        by_domain.entry(domain).or_default().push(record);
                    }
                }
            }
        }

        let mut buckets: Vec<(String, Vec<CCRecord>)> = by_domain.into_iter().collect();
        buckets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        buckets.truncate(max_domains);

        for (priority, (domain, mut records)) in buckets.into_iter().enumerate() {
            records.truncate(max_pages_per_domain);
            plan.add_target(DiveTarget {
                domain,
                priority: (priority as u8 + 1).min(5),
                source: "periscope_keyword".to_string(),
                estimated_pages: records.len(),
                cc_records: records,
            });
        }

        Ok(plan)
    }

    async fn fetch_targets(
        &self,
        domains: &[String],
        priorities: &HashMap<String, u8>,
        archives: &[String],
        filters: &LookupFilters,
        max_pages_per_domain: usize,
        sonar_result: &SonarResult,
    ) -> Vec<DiveTarget> {
        let work: Vec<(String, u8, String)> = domains
            .iter()
            .map(|d| {
                let priority = priorities.get(d).copied().unwrap_or(5);
                let source = domain_source(d, sonar_result);
                (d.clone(), priority, source)
            })
            .collect();

        stream::iter(work)
            .map(|(domain, priority, source)| {
                let periscope = Arc::clone(&self.periscope);
                let archives = archives.to_vec();
                let filters = filters.clone();
                let limit = Arc::clone(&self.fan_out_limit);
                let cache = self.cache.clone();
                async move {
                    let mut merged: Vec<CCRecord> = Vec::new();
                    let mut seen = HashSet::new();
                    for archive in &archives {
                        let cache_key = lookup_cache_key(&domain, archive, &filters);
                        let records = if let Some(cached) = cache.get(&cache_key).await {
                            cached
                        } else {
                            let _permit = limit.acquire().await;
                            match periscope.lookup_domain(&domain, archive, &filters).await {
                                Ok(records) => {
                                    cache.insert(cache_key, records.clone()).await;
                                    records
                                }
                                Err(e) => {
                                    info!("periscope lookup failed for {} on {}: {}", domain, archive, e);
                                    Vec::new()
                                }
                            }
                        };
                        for r in records {
                            if seen.insert(r.dedup_key()) {
                                merged.push(r);
                            }
                        }
                    }
                    merged.truncate(max_pages_per_domain);
                    DiveTarget {
                        domain,
                        priority,
                        source,
                        estimated_pages: merged.len(),
                        cc_records: merged,
                    }
                }
            })
            .buffer_unordered(32)
            .collect()
            .await
    }
}

fn lookup_cache_key(domain: &str, archive: &str, filters: &LookupFilters) -> String {
    format!(
        "{}|{}|{}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}",
        domain,
        archive,
        filters.limit,
        filters.filter_status,
        filters.filter_mime,
        filters.filter_languages,
        filters.from_ts,
        filters.to_ts,
        filters.url_contains,
    )
}

/// Seed domains: Sonar first; if empty and the query is a URL, parse the
/// netloc; if domain-like, use directly; if an email, use the host part.
fn seed_domains(query: &str, sonar_result: &SonarResult) -> Vec<String> {
    if !sonar_result.domains.is_empty() {
        return normalize_domains(&sonar_result.domains);
    }

    let q = query.trim();
    if let Ok(url) = Url::parse(q) {
        if let Some(host) = url.host_str() {
            return normalize_domains(&[host.to_string()]);
        }
    }
    if let Some((_, host)) = q.split_once('@') {
        return normalize_domains(&[host.to_string()]);
    }
    if q.contains('.') && !q.contains(' ') {
        return normalize_domains(&[q.to_string()]);
    }
    Vec::new()
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for d in domains {
        let norm = d.trim().to_lowercase();
        let norm = norm.strip_prefix("www.").unwrap_or(&norm).to_string();
        if norm.is_empty() {
            continue;
        }
        if seen.insert(norm.clone()) {
            out.push(norm);
        }
    }
    out
}

fn normalize_suffixes(suffixes: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for s in suffixes {
        let suf = s.trim().to_lowercase();
        let suf = suf.trim_start_matches('.').to_string();
        if suf.is_empty() {
            continue;
        }
        if seen.insert(suf.clone()) {
            out.push(suf);
        }
    }
    out
}

fn matches_base(domain: &str, bases: &HashSet<String>) -> bool {
    if bases.is_empty() {
        return false;
    }
    let mut cur = domain;
    loop {
        if bases.contains(cur) {
            return true;
        }
        match cur.split_once('.') {
            Some((_, rest)) => cur = rest,
            None => return false,
        }
    }
}

fn suffix_match(domain: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suf| domain.ends_with(&format!(".{}", suf)))
}

/// `_apply_domain_filters`: allowlist match-by-base-suffix, denylist
/// match, `tld_include`/`tld_exclude` by exact dotted suffix.
pub fn apply_domain_filters(
    domains: Vec<String>,
    allowlist: &[String],
    denylist: &[String],
    tld_include: &[String],
    tld_exclude: &[String],
) -> Vec<String> {
    if domains.is_empty() {
        return Vec::new();
    }
    let allow_set: HashSet<String> = normalize_domains(allowlist).into_iter().collect();
    let deny_set: HashSet<String> = normalize_domains(denylist).into_iter().collect();
    let tld_inc = normalize_suffixes(tld_include);
    let tld_exc = normalize_suffixes(tld_exclude);

    normalize_domains(&domains)
        .into_iter()
        .filter(|d| {
            if !allow_set.is_empty() && !matches_base(d, &allow_set) {
                return false;
            }
            if !deny_set.is_empty() && matches_base(d, &deny_set) {
                return false;
            }
            if !tld_inc.is_empty() && !suffix_match(d, &tld_inc) {
                return false;
            }
            if !tld_exc.is_empty() && suffix_match(d, &tld_exc) {
                return false;
            }
            true
        })
        .collect()
}

/// `_prioritize_domains`: 1 = exact/direct-contact match, 2 = subdomain
/// or entity hit, 3 = same base domain or graph hit, 4 = other, 5 = no
/// hit at all.
fn prioritize_domains(query: &str, domains: &[String], sonar_result: &SonarResult) -> HashMap<String, u8> {
    let mut priorities = HashMap::new();
    let query_lower = query.trim().to_lowercase();
    let is_domain_query = query_lower.contains('.') && !query_lower.contains(' ');

    for domain in domains {
        let priority = if is_domain_query {
            if *domain == query_lower {
                1
            } else if domain.ends_with(&format!(".{}", query_lower)) {
                2
            } else if domain.contains(&query_lower) {
                3
            } else {
                4
            }
        } else {
            sonar_result
                .hits
                .iter()
                .find(|h| &h.domain == domain || h.url.as_deref().map(|u| u.contains(domain.as_str())).unwrap_or(false))
                .map(|hit| match hit.match_type {
                    crate::archive::sonar::MatchType::Phone
                    | crate::archive::sonar::MatchType::Email
                    | crate::archive::sonar::MatchType::Breach => 1,
                    crate::archive::sonar::MatchType::Entity => 2,
                    crate::archive::sonar::MatchType::Graph => 3,
                    _ => 4,
                })
                .unwrap_or(5)
        };
        priorities.insert(domain.clone(), priority);
    }
    priorities
}

fn domain_source(domain: &str, sonar_result: &SonarResult) -> String {
    sonar_result
        .hits
        .iter()
        .find(|h| &h.domain == domain || h.url.as_deref().map(|u| u.contains(domain)).unwrap_or(false))
        .map(|h| h.index.clone())
        .unwrap_or_else(|| "domain".to_string())
}

/// Turns a free-text keyword into a CC Index wildcard pattern:
/// whitespace becomes `*`, and the pattern is wrapped in leading/trailing
/// `*` unless already present.
fn keyword_to_cc_pattern(keyword: &str) -> String {
    let kw = keyword.trim();
    if kw.is_empty() {
        return String::new();
    }
    if kw.contains('*') {
        return kw.to_string();
    }
    let collapsed = kw.split_whitespace().collect::<Vec<_>>().join("*");
    let mut pattern = collapsed;
    if !pattern.starts_with('*') {
        pattern = format!("*{}", pattern);
    }
    if !pattern.ends_with('*') {
        pattern.push('*');
    }
    pattern
}

fn domain_from_url(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_pattern_wraps_and_collapses_whitespace() {
        assert_eq!(keyword_to_cc_pattern("panama papers"), "*panama*papers*");
        assert_eq!(keyword_to_cc_pattern("*already*"), "*already*");
    }

    #[test]
    fn domain_filters_allow_deny_and_tld() {
        let domains = vec!["a.gov".to_string(), "b.com".to_string(), "c.gov".to_string()];
        let filtered = apply_domain_filters(domains, &[], &["b.com".to_string()], &["gov".to_string()], &[]);
        assert_eq!(filtered, vec!["a.gov".to_string(), "c.gov".to_string()]);
    }

    #[test]
    fn prioritize_exact_domain_match_is_priority_one() {
        let sonar = SonarResult::default();
        let priorities = prioritize_domains("example.com", &["example.com".to_string()], &sonar);
        assert_eq!(priorities.get("example.com"), Some(&1));
    }

    #[test]
    fn prioritize_subdomain_is_priority_two() {
        let sonar = SonarResult::default();
        let priorities = prioritize_domains("example.com", &["docs.example.com".to_string()], &sonar);
        assert_eq!(priorities.get("docs.example.com"), Some(&2));
    }
}

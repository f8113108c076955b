//! Black-box runs of the scenarios the chain layer is built to satisfy,
//! driven entirely through the public API (`ChainExecutor`, `RuleRegistry`,
//! `DivePlan`) the way a caller outside this crate would use it.

use async_trait::async_trait;
use deepwake::archive::dive_planner::{DivePlanner, PlanRequest};
use deepwake::archive::periscope::{CcIndexClient, LookupFilters};
use deepwake::archive::sonar::Sonar;
use deepwake::error::CCIndexError;
use deepwake::{
    ChainExecutor, ChainInput, ChainRule, ChainType, CCRecord, DivePlan, DiveTarget,
    RuleExecutionResult, RuleExecutor, RuleRegistry,
};
use deepwake::core::types::{ChainConfig, RuleKind, Step};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

struct StaticExecutor {
    responses: HashMap<(&'static str, &'static str), serde_json::Value>,
}

#[async_trait]
impl RuleExecutor for StaticExecutor {
    async fn execute_rule(&self, rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
        for ((id, val), data) in &self.responses {
            if *id == rule_id && *val == value {
                return RuleExecutionResult {
                    status: "success".to_string(),
                    data: data.clone(),
                    results: vec![],
                    error: None,
                };
            }
        }
        RuleExecutionResult::failed("no stub for this call")
    }
}

fn write_fixture(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("write fixture file");
}

fn fixture_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("deepwake-e2e-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create fixture dir");
    dir
}

/// Scenario 1: OSINT Cascade over emails discovers the phone, username,
/// and the username's second email, suppressing the self-referencing edge.
#[tokio::test]
async fn osint_cascade_email_scenario() {
    let registry = Arc::new(RuleRegistry::default());
    let mut responses = HashMap::new();
    responses.insert(
        ("OSINT_FROM_EMAIL", "jane.doe@example.com"),
        json!({"email": ["jane.doe@example.com"], "phone": ["+15551234567"], "username": ["jane.doe"]}),
    );
    responses.insert(
        ("OSINT_FROM_USERNAME", "jane.doe"),
        json!({"email": ["jane.doe@example.com", "john@example.com"]}),
    );
    let executor = ChainExecutor::new(registry, Arc::new(StaticExecutor { responses }));

    let chain_rule = ChainRule {
        id: "osint_email_cascade".to_string(),
        label: "OSINT email cascade".to_string(),
        chain_config: ChainConfig {
            chain_type: ChainType::OsintCascade,
            max_depth: 2,
            relevance_threshold: Some(0.5),
            decay_per_step: Some(0.15),
            ai_filter_enabled: false,
            ..Default::default()
        },
        cymonides_persistence: None,
    };
    let input = ChainInput { value: "jane.doe@example.com".to_string(), entity_type: "email".to_string() };

    let result = executor.execute_chain(&chain_rule, input, None, None).await;
    assert!(result.is_success());
    assert_eq!(result.unique_entities, 4);

    let entities = result.extra.get("all_entities").unwrap().as_array().unwrap();
    let values: HashSet<String> = entities.iter().map(|e| e["value"].as_str().unwrap().to_string()).collect();
    assert_eq!(
        values,
        HashSet::from(["+15551234567".to_string(), "jane.doe".to_string(), "john@example.com".to_string()])
    );

    let graph = result.extra.get("entity_graph").unwrap();
    assert_eq!(graph["root"], json!("jane.doe@example.com"));
    assert_eq!(graph["edges"].as_array().unwrap().len(), 3);
}

struct OfficerCompanyExecutor;

#[async_trait]
impl RuleExecutor for OfficerCompanyExecutor {
    async fn execute_rule(&self, rule_id: &str, value: &str, _jurisdiction: Option<&str>) -> RuleExecutionResult {
        match (rule_id, value) {
            ("OFFICER_APPOINTMENTS", "Jane Officer") => RuleExecutionResult {
                status: "success".to_string(),
                data: serde_json::Value::Null,
                results: vec![json!({"data": [{"company_name": "Alpha Ltd"}, {"company_name": "Beta Ltd"}]})],
                error: None,
            },
            ("COMPANY_OFFICERS", "Alpha Ltd") => RuleExecutionResult {
                status: "success".to_string(),
                data: serde_json::Value::Null,
                results: vec![json!({"data": [
                    {"officer_name": "Officer A1"},
                    {"officer_name": "Officer A2"},
                    {"officer_name": "Officer A3"},
                ]})],
                error: None,
            },
            ("COMPANY_OFFICERS", "Beta Ltd") => RuleExecutionResult {
                status: "success".to_string(),
                data: serde_json::Value::Null,
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

/// Scenario 2: Recursive Expansion from an officer to their companies to
/// those companies' officers.
#[tokio::test]
async fn recursive_expansion_officer_scenario() {
    let dir = fixture_dir("recursive");
    write_fixture(
        &dir,
        "rules.json",
        r#"[
            {"id": "OFFICER_APPOINTMENTS", "kind": "rule"},
            {"id": "COMPANY_OFFICERS", "kind": "rule"}
        ]"#,
    );
    write_fixture(&dir, "legend.json", r#"{"1": "company_name", "2": "officer_name"}"#);
    let registry = Arc::new(RuleRegistry::load(&dir).expect("load registry"));
    std::fs::remove_dir_all(&dir).ok();

    let executor = ChainExecutor::new(registry, Arc::new(OfficerCompanyExecutor));

    let chain_rule = ChainRule {
        id: "officer_recursion".to_string(),
        label: "Officer recursion".to_string(),
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
    let input = ChainInput { value: "Jane Officer".to_string(), entity_type: "officer".to_string() };

    let result = executor.execute_chain(&chain_rule, input, None, None).await;
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
                data: serde_json::Value::Null,
                results: vec![json!({"data": [
                    {"shareholder_name": "A Corp", "ownership_pct": 60.0, "shareholder_type": "company"},
                    {"shareholder_name": "P. Jones", "ownership_pct": 10.0, "shareholder_type": "person"},
                ]})],
                error: None,
            },
            "A Corp" => RuleExecutionResult {
                status: "success".to_string(),
                data: serde_json::Value::Null,
                results: vec![json!({"data": [
                    {"shareholder_name": "B Ltd", "ownership_pct": 30.0, "shareholder_type": "company"},
                ]})],
                error: None,
            },
            _ => RuleExecutionResult::failed("no shareholders on file"),
        }
    }
}

/// Scenario 3: Cascading Ownership excludes a shareholder below threshold.
#[tokio::test]
async fn cascading_ownership_scenario() {
    let dir = fixture_dir("ownership");
    write_fixture(&dir, "rules.json", r#"[{"id": "SHAREHOLDER_LOOKUP", "kind": "rule"}]"#);
    let registry = Arc::new(RuleRegistry::load(&dir).expect("load registry"));
    std::fs::remove_dir_all(&dir).ok();

    let executor = ChainExecutor::new(registry, Arc::new(ShareholderExecutor));

    let chain_rule = ChainRule {
        id: "ownership_cascade".to_string(),
        label: "Ownership cascade".to_string(),
        chain_config: ChainConfig {
            chain_type: ChainType::CascadingOwnership,
            max_depth: 3,
            ownership_threshold_pct: Some(25.0),
            steps: vec![Step {
                action: "SHAREHOLDER_LOOKUP".to_string(),
                action_type: RuleKind::Rule,
                condition: None,
                output_fields: vec![],
                fallback_pattern: None,
            }],
            ..Default::default()
        },
        cymonides_persistence: None,
    };
    let input = ChainInput { value: "Root Co".to_string(), entity_type: "company".to_string() };

    let result = executor.execute_chain(&chain_rule, input, None, None).await;
    assert!(result.is_success());

    let tree = result.extra.get("ownership_tree").unwrap();
    assert_eq!(tree["root"], json!("Root Co"));
    let children = tree["children"].as_array().unwrap();
    assert_eq!(children.len(), 1, "P. Jones at 10% must be excluded by the 25% threshold");
    assert_eq!(children[0]["entity"], json!("A Corp"));
    assert_eq!(children[0]["ownership_pct"], 60.0);
    let grandchildren = children[0]["children"].as_array().unwrap();
    assert_eq!(grandchildren.len(), 1);
    assert_eq!(grandchildren[0]["entity"], json!("B Ltd"));
    assert_eq!(grandchildren[0]["ownership_pct"], 30.0);
    assert!(grandchildren[0]["children"].as_array().unwrap().is_empty());
}

/// Scenario 6: a 4-domain dive resumes after 2 domains complete, via
/// `DivePlan`'s own full-fidelity checkpoint round-trip.
#[test]
fn resume_after_partial_completion_scenario() {
    fn dive_target(domain: &str, priority: u8) -> DiveTarget {
        DiveTarget {
            domain: domain.to_string(),
            priority,
            source: "domain".to_string(),
            cc_records: vec![CCRecord {
                url: format!("https://{}/", domain),
                filename: format!("{}.warc.gz", domain),
                offset: 0,
                length: 1024,
                status: 200,
                mime: "text/html".to_string(),
                timestamp: "20250101000000".to_string(),
                digest: "deadbeef".to_string(),
            }],
            estimated_pages: 1,
        }
    }

    let mut plan = DivePlan::new("example.com", "domain");
    plan.add_target(dive_target("a.example.com", 1));
    plan.add_target(dive_target("b.example.com", 2));
    plan.add_target(dive_target("c.example.com", 3));
    plan.add_target(dive_target("d.example.com", 4));
    plan.completed_domains.insert("a.example.com".to_string());
    plan.completed_domains.insert("b.example.com".to_string());

    let checkpoint_bytes = plan.save_full().expect("serialize checkpoint");
    let resumed = DivePlan::load(&checkpoint_bytes).expect("reload checkpoint");

    assert_eq!(resumed.completed_domains, HashSet::from(["a.example.com".to_string(), "b.example.com".to_string()]));

    let remaining: Vec<&str> = resumed
        .targets
        .iter()
        .filter(|t| !resumed.completed_domains.contains(&t.domain))
        .map(|t| t.domain.as_str())
        .collect();
    assert_eq!(remaining, vec!["c.example.com", "d.example.com"]);
}

/// A `CcIndexClient` fixture keyed by the same (domain|pattern, archive)
/// pairs `Periscope` would be called with, so `DivePlanner` can be driven
/// end-to-end without a live CC Index backend.
struct FakePeriscope {
    by_domain: HashMap<(String, String), Vec<CCRecord>>,
    by_pattern: HashMap<(String, String), Vec<CCRecord>>,
}

impl FakePeriscope {
    fn new() -> Self {
        Self { by_domain: HashMap::new(), by_pattern: HashMap::new() }
    }

    fn with_domain(mut self, domain: &str, archive: &str, records: Vec<CCRecord>) -> Self {
        self.by_domain.insert((domain.to_string(), archive.to_string()), records);
        self
    }

    fn with_pattern(mut self, pattern: &str, archive: &str, records: Vec<CCRecord>) -> Self {
        self.by_pattern.insert((pattern.to_string(), archive.to_string()), records);
        self
    }
}

#[async_trait]
impl CcIndexClient for FakePeriscope {
    async fn lookup_domain(&self, domain: &str, archive: &str, _filters: &LookupFilters) -> Result<Vec<CCRecord>, CCIndexError> {
        Ok(self.by_domain.get(&(domain.to_string(), archive.to_string())).cloned().unwrap_or_default())
    }

    async fn search(&self, url_pattern: &str, archive: &str, _filters: &LookupFilters) -> Result<Vec<CCRecord>, CCIndexError> {
        Ok(self.by_pattern.get(&(url_pattern.to_string(), archive.to_string())).cloned().unwrap_or_default())
    }
}

fn cc_record(url: &str, offset: u64) -> CCRecord {
    CCRecord {
        url: url.to_string(),
        filename: "fake.warc.gz".to_string(),
        offset,
        length: 512,
        status: 200,
        mime: "text/html".to_string(),
        timestamp: "20250101000000".to_string(),
        digest: format!("digest-{}", offset),
    }
}

/// Scenario 4: Dive Plan from a single domain seed truncates to the
/// per-domain page cap and that cap propagates into `total_pages` and
/// `estimated_time_seconds`.
#[tokio::test]
async fn dive_plan_domain_seed_scenario() {
    let records: Vec<CCRecord> =
        (0..7).map(|i| cc_record(&format!("https://example.com/page{}", i), i)).collect();
    let periscope = Arc::new(FakePeriscope::new().with_domain("example.com", "CC-MAIN-2025-51", records));
    let sonar = Arc::new(Sonar::new(vec![]));
    let planner = DivePlanner::new(periscope, sonar, 4, 200);

    let mut req = PlanRequest::new("example.com");
    req.max_pages_per_domain = 5;

    let plan = planner.create_plan(req).await.expect("plan succeeds");

    assert_eq!(plan.targets.len(), 1);
    assert_eq!(plan.targets[0].domain, "example.com");
    assert_eq!(plan.targets[0].priority, 1);
    assert_eq!(plan.targets[0].cc_records.len(), 5);
    assert_eq!(plan.total_pages, 5);
    assert!((plan.estimated_time_seconds - 0.5).abs() < 1e-9);
}

/// Scenario 5: Dive Plan falls back to a CC Index keyword search when
/// Sonar finds no domains, bucketing matches by domain and ranking the
/// domains by hit count.
#[tokio::test]
async fn dive_plan_cc_keyword_fallback_scenario() {
    let mut records = Vec::new();
    for i in 0..5 {
        records.push(cc_record(&format!("https://a.example.com/panama-papers-{}", i), i));
    }
    for i in 0..3 {
        records.push(cc_record(&format!("https://b.example.com/panama-papers-{}", i), 10 + i));
    }
    for i in 0..2 {
        records.push(cc_record(&format!("https://c.example.com/panama-papers-{}", i), 20 + i));
    }
    assert_eq!(records.len(), 10);

    let periscope = Arc::new(FakePeriscope::new().with_pattern("*panama*papers*", "CC-MAIN-2025-51", records));
    let sonar = Arc::new(Sonar::new(vec![]));
    let planner = DivePlanner::new(periscope, sonar, 4, 200);

    let req = PlanRequest::new("panama papers");
    let plan = planner.create_plan(req).await.expect("plan succeeds");

    assert_eq!(plan.targets.len(), 3);
    assert!(plan.targets.iter().all(|t| t.source == "periscope_keyword"));

    let counts: HashMap<&str, usize> = plan.targets.iter().map(|t| (t.domain.as_str(), t.cc_records.len())).collect();
    assert_eq!(counts.get("a.example.com"), Some(&5));
    assert_eq!(counts.get("b.example.com"), Some(&3));
    assert_eq!(counts.get("c.example.com"), Some(&2));

    assert_eq!(plan.targets[0].domain, "a.example.com");
    assert_eq!(plan.targets[0].priority, 1);
}

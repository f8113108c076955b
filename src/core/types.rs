use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ─── Rule tables ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Rule,
    Playbook,
}

/// One named chain strategy. See `chain::strategies` for the dispatch
/// table this tag drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    RecursiveExpansion,
    CascadingOwnership,
    HierarchicalExpansion,
    ClusteringNetwork,
    PortfolioExpansion,
    NetworkExpansion,
    EntityNetworkExtraction,
    PlaybookCascade,
    MultiJurisdictionSweep,
    DomainToCorporatePivot,
    ComplianceStack,
    MediaAggregation,
    OsintCascade,
    OsintBreachNetwork,
    OsintPersonWeb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub max_depth: u32,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub ownership_threshold_pct: Option<f64>,
    #[serde(default)]
    pub cluster_threshold: Option<u32>,
    #[serde(default)]
    pub network_threshold: Option<u32>,
    #[serde(default)]
    pub relevance_threshold: Option<f64>,
    #[serde(default)]
    pub ai_confidence_threshold: Option<f64>,
    #[serde(default)]
    pub decay_per_step: Option<f64>,
    #[serde(default)]
    pub deduplication_fields: Vec<String>,
    #[serde(default)]
    pub ai_filter_enabled: bool,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub stopping_conditions: StoppingConditions,
    #[serde(default)]
    pub breach_clustering: BreachClustering,
    #[serde(default)]
    pub identity_resolution: IdentityResolution,
    #[serde(default = "default_true")]
    pub parallel_execution: bool,
}

fn default_true() -> bool {
    true
}

/// `osint_breach_network`'s clustering knobs (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreachClustering {
    pub cluster_by_password: bool,
    pub cluster_by_breach_source: bool,
}

impl Default for BreachClustering {
    fn default() -> Self {
        Self {
            cluster_by_password: true,
            cluster_by_breach_source: true,
        }
    }
}

/// `osint_person_web`'s identity-resolution knobs (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityResolution {
    pub enabled: bool,
    pub confidence_threshold: f64,
}

impl Default for IdentityResolution {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.75,
        }
    }
}

impl Default for ChainType {
    fn default() -> Self {
        ChainType::RecursiveExpansion
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub decay_per_step: Option<f64>,
    #[serde(default)]
    pub common_name_penalty: Option<f64>,
    #[serde(default)]
    pub name_weight: Option<f64>,
    #[serde(default)]
    pub connection_weight: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoppingConditions {
    #[serde(default)]
    pub max_entities: Option<u64>,
    #[serde(default)]
    pub min_relevance: Option<f64>,
    #[serde(default)]
    pub ai_confidence_threshold: Option<f64>,
}

/// A static rule or playbook definition, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: String,
    pub kind: RuleKind,
    #[serde(default)]
    pub chain_config: Option<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    pub action_type: RuleKind,
    #[serde(default)]
    pub condition: Option<String>,
    /// Integer codes resolved via the Legend to human field names.
    #[serde(default)]
    pub output_fields: Vec<u32>,
    #[serde(default)]
    pub fallback_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub label: String,
    pub rules: Vec<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRule {
    pub id: String,
    pub label: String,
    pub chain_config: ChainConfig,
    /// "always" enables best-effort persistence for this chain.
    #[serde(default)]
    pub cymonides_persistence: Option<String>,
}

// ─── Archive acquisition ───────────────────────────────────────────────

/// A single CC Index hit: one WARC byte-range. `(filename, offset,
/// length)` is the dedup key across multi-archive plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CCRecord {
    pub url: String,
    pub filename: String,
    pub offset: u64,
    pub length: u64,
    pub status: u16,
    pub mime: String,
    pub timestamp: String,
    pub digest: String,
}

impl CCRecord {
    /// The dedup key used to de-duplicate records across archives.
    pub fn dedup_key(&self) -> (String, u64, u64) {
        (self.filename.clone(), self.offset, self.length)
    }
}

/// Approximate seconds to range-fetch one WARC record at the default
/// fetch rate. Single tunable constant per §3.
pub const FETCH_SECONDS_PER_RECORD: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiveTarget {
    pub domain: String,
    /// 1 = highest priority, 5 = lowest.
    pub priority: u8,
    /// Where this domain was found (e.g. "domain", "periscope_keyword",
    /// a Sonar index name).
    pub source: String,
    #[serde(default)]
    pub cc_records: Vec<CCRecord>,
    pub estimated_pages: usize,
}

impl DiveTarget {
    pub fn estimated_fetch_time(&self) -> f64 {
        self.estimated_pages as f64 * FETCH_SECONDS_PER_RECORD
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivePlan {
    pub query: String,
    pub query_type: String,
    pub created_at: DateTime<Utc>,
    pub targets: Vec<DiveTarget>,
    pub total_domains: usize,
    pub total_pages: usize,
    pub estimated_time_seconds: f64,
    pub estimated_warc_bytes: u64,
    pub sonar_indices_used: Vec<String>,
    pub cc_archives_queried: Vec<String>,
    pub completed_domains: HashSet<String>,
}

impl DivePlan {
    pub fn new(query: impl Into<String>, query_type: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            query_type: query_type.into(),
            created_at: Utc::now(),
            targets: Vec::new(),
            total_domains: 0,
            total_pages: 0,
            estimated_time_seconds: 0.0,
            estimated_warc_bytes: 0,
            sonar_indices_used: Vec::new(),
            cc_archives_queried: Vec::new(),
            completed_domains: HashSet::new(),
        }
    }

    pub fn add_target(&mut self, target: DiveTarget) {
        self.total_domains += 1;
        self.total_pages += target.estimated_pages;
        self.estimated_time_seconds += target.estimated_fetch_time();
        self.estimated_warc_bytes += target.cc_records.iter().map(|r| r.length).sum::<u64>();
        self.targets.push(target);
    }

    /// Summary form: counts only, no CC records. Does not support resume.
    pub fn to_summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "query": self.query,
            "query_type": self.query_type,
            "created_at": self.created_at,
            "total_domains": self.total_domains,
            "total_pages": self.total_pages,
            "estimated_time_seconds": self.estimated_time_seconds,
            "estimated_warc_bytes": self.estimated_warc_bytes,
            "sonar_indices_used": self.sonar_indices_used,
            "cc_archives_queried": self.cc_archives_queried,
            "completed_domains": self.completed_domains,
            "targets": self.targets.iter().take(100).map(|t| serde_json::json!({
                "domain": t.domain,
                "priority": t.priority,
                "source": t.source,
                "estimated_pages": t.estimated_pages,
                "cc_records_count": t.cc_records.len(),
            })).collect::<Vec<_>>(),
        })
    }

    /// Full-fidelity checkpoint form: every target and CC record, not
    /// just counts. Write-to-tmp-then-rename is the caller's job (see
    /// `archive::deep_diver::write_checkpoint`); this just serializes.
    pub fn save_full(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Restores a plan written by `save_full`, including `targets` (with
    /// their `cc_records`) and `completed_domains`.
    pub fn load(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Page content recovered from a WARC/WAT fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    /// Normalized lowercase domain, `www.` stripped.
    pub domain: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub links: Vec<String>,
    /// Parsed JSON-LD objects found on the page.
    #[serde(default)]
    pub schemas: Vec<serde_json::Value>,
    pub http_status: u16,
    pub crawl_date: Option<String>,
    pub warc_file: String,
}

/// Result from fetching one WARC record via the Deep Diver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiveResult {
    pub url: String,
    pub domain: String,
    pub status: u16,
    pub content_type: String,
    pub content: String,
    pub timestamp: String,
    pub warc_file: String,
    #[serde(default)]
    pub error: Option<String>,
}

// ─── Entity extraction ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub value: String,
    pub entity_type: String,
    pub confidence: f64,
    pub source: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExtractedEntity {
    /// Dedup key per §4.7: lowercased, trimmed value plus entity type.
    pub fn dedup_key(&self) -> (String, String) {
        (self.value.trim().to_lowercase(), self.entity_type.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

// ─── Chain entity graph ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntityNode {
    pub value: String,
    /// email | phone | username | domain | person | linkedin | url | …
    #[serde(rename = "type")]
    pub entity_type: String,
    pub depth: u32,
    pub relevance: f64,
    #[serde(default)]
    pub data: serde_json::Value,
    pub confidence: f64,
    pub needs_verification: bool,
}

impl ChainEntityNode {
    pub fn new(value: String, entity_type: String, depth: u32, relevance: f64, data: serde_json::Value) -> Self {
        let relevance = relevance.clamp(0.0, 1.0);
        Self {
            value,
            entity_type,
            depth,
            relevance,
            data,
            confidence: relevance,
            needs_verification: relevance < 0.5,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.value).to_lowercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityGraph {
    pub root: String,
    #[serde(default)]
    pub root_type: String,
    pub nodes: Vec<ChainEntityNode>,
    pub edges: Vec<GraphEdge>,
}

impl EntityGraph {
    pub fn new(root: impl Into<String>, root_type: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            root_type: root_type.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>, edge_type: impl Into<String>) {
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.into(),
        });
    }
}

/// A seed entity fed to a chain run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInput {
    pub value: String,
    #[serde(rename = "type", default = "default_entity_type")]
    pub entity_type: String,
}

fn default_entity_type() -> String {
    "unknown".to_string()
}

/// Common envelope every chain strategy returns (§7: "the returned
/// envelope is always `{chain_id, chain_type, status: success|failed,
/// …}`"). Strategy-specific payloads (`ownership_tree`, `network`,
/// `portfolio`, `breach_network`, `person_profile`, `entity_graph`,
/// `aggregated_data`, `media_items`, …) are carried in `extra` rather
/// than as one giant struct with a field per strategy — the tagged-
/// union redesign note (§9) applied at the envelope level: the common
/// fields are typed, the strategy-shaped remainder stays dynamic.
#[derive(Debug, Clone, Serialize)]
pub struct ChainRunResult {
    pub chain_id: String,
    pub chain_type: ChainType,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    pub depth_reached: u32,
    pub max_depth: u32,
    pub total_results: usize,
    pub unique_entities: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChainRunResult {
    pub fn failed(chain_id: impl Into<String>, chain_type: ChainType, error: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            chain_type,
            status: "failed".to_string(),
            error: Some(error.into()),
            jurisdiction: None,
            depth_reached: 0,
            max_depth: 0,
            total_results: 0,
            unique_entities: 0,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

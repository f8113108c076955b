//! Sonar: entity lookup over pre-built indices (§4.3). A pure read;
//! per-index errors are isolated and recorded as diagnostics rather than
//! propagated, mirroring `features/proxy_manager.rs`'s per-resource
//! failure isolation (one bad proxy never aborts the caller) and
//! `tools/search/mod.rs`'s parallel-engine fan-out via `futures::join_all`.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Phone,
    Email,
    Breach,
    Entity,
    Graph,
    Domain,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonarHit {
    pub domain: String,
    #[serde(default)]
    pub url: Option<String>,
    pub match_type: MatchType,
    pub index: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SonarResult {
    pub query_type: String,
    pub domains: Vec<String>,
    pub indices_scanned: Vec<IndexDiagnostic>,
    pub hits: Vec<SonarHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDiagnostic {
    pub index: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// One backing index Sonar can scan (an Elasticsearch index, in the
/// original; here an arbitrary async source behind a trait object so the
/// core never depends on a specific search backend).
#[async_trait]
pub trait SonarIndex: Send + Sync {
    fn name(&self) -> &str;
    async fn scan(&self, query: &str, limit: usize) -> Result<Vec<SonarHit>, String>;
}

pub struct Sonar {
    indices: Vec<Box<dyn SonarIndex>>,
}

impl Sonar {
    pub fn new(indices: Vec<Box<dyn SonarIndex>>) -> Self {
        Self { indices }
    }

    pub async fn scan_all(&self, query: &str, limit: usize) -> SonarResult {
        let query_type = classify_query(query);

        let futures = self.indices.iter().map(|idx| async move {
            let result = idx.scan(query, limit).await;
            (idx.name().to_string(), result)
        });

        let outcomes = join_all(futures).await;

        let mut indices_scanned = Vec::new();
        let mut hits = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(mut h) => {
                    indices_scanned.push(IndexDiagnostic { index: name, ok: true, error: None });
                    hits.append(&mut h);
                }
                Err(e) => {
                    indices_scanned.push(IndexDiagnostic { index: name, ok: false, error: Some(e) });
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        let mut domains = Vec::new();
        for hit in &hits {
            if seen.insert(hit.domain.clone()) {
                domains.push(hit.domain.clone());
            }
        }

        SonarResult {
            query_type,
            domains,
            indices_scanned,
            hits,
        }
    }
}

fn classify_query(query: &str) -> String {
    let q = query.trim();
    if q.contains('@') {
        "email".to_string()
    } else if q.chars().filter(|c| c.is_ascii_digit()).count() >= 7 {
        "phone".to_string()
    } else if q.contains('.') && !q.contains(' ') {
        "domain".to_string()
    } else {
        "entity".to_string()
    }
}

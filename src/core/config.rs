//! File-based engine configuration with env-var fallback for every field.
//! Mirrors the teacher's `core/config.rs`: try a JSON file, fall back to
//! env vars, fall back to a hardcoded default; a missing file is quiet,
//! a malformed one logs a warning and falls back to defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cc_index_base_url: Option<String>,
    pub cc_archive: Option<String>,
    pub cc_index_concurrency: Option<usize>,
    pub max_domains_cap: Option<usize>,
    pub deep_diver_binary: Option<String>,
    pub deep_diver_threads: Option<usize>,
    pub archive_download_concurrency: Option<usize>,
    pub archive_process_concurrency: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cc_index_base_url: None,
            cc_archive: None,
            cc_index_concurrency: None,
            max_domains_cap: None,
            deep_diver_binary: None,
            deep_diver_threads: None,
            archive_download_concurrency: None,
            archive_process_concurrency: None,
        }
    }
}

impl EngineConfig {
    pub fn resolve_cc_index_base_url(&self) -> String {
        self.cc_index_base_url
            .clone()
            .or_else(|| env::var("CC_INDEX_BASE_URL").ok())
            .unwrap_or_else(|| "https://index.commoncrawl.org".to_string())
    }

    pub fn resolve_cc_archive(&self) -> String {
        self.cc_archive
            .clone()
            .or_else(|| env::var("CC_ARCHIVE").ok())
            .unwrap_or_else(|| "CC-MAIN-2025-51".to_string())
    }

    /// `SUBMARINE_CC_INDEX_CONCURRENCY`, default 8, clamped 1-32.
    pub fn resolve_cc_index_concurrency(&self) -> usize {
        let raw = self
            .cc_index_concurrency
            .or_else(|| env::var("SUBMARINE_CC_INDEX_CONCURRENCY").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(8);
        raw.clamp(1, 32)
    }

    /// `SUBMARINE_MAX_DOMAINS_CAP`, default 200.
    pub fn resolve_max_domains_cap(&self) -> usize {
        self.max_domains_cap
            .or_else(|| env::var("SUBMARINE_MAX_DOMAINS_CAP").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(200)
    }

    pub fn resolve_deep_diver_binary(&self) -> String {
        self.deep_diver_binary
            .clone()
            .or_else(|| env::var("DEEP_DIVER_BINARY").ok())
            .unwrap_or_else(|| "ccwarc".to_string())
    }

    pub fn resolve_deep_diver_threads(&self) -> usize {
        self.deep_diver_threads
            .or_else(|| env::var("DEEP_DIVER_THREADS").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(50)
    }

    /// Archive-processor WAT download semaphore size, default 20.
    pub fn resolve_archive_download_concurrency(&self) -> usize {
        self.archive_download_concurrency
            .or_else(|| env::var("ARCHIVE_DOWNLOAD_CONCURRENCY").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(20)
    }

    /// Archive-processor WAT parse semaphore size, default 10.
    pub fn resolve_archive_process_concurrency(&self) -> usize {
        self.archive_process_concurrency
            .or_else(|| env::var("ARCHIVE_PROCESS_CONCURRENCY").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(10)
    }
}


/// Candidate config file paths, tried in order.
fn candidate_paths() -> Vec<String> {
    let mut paths = vec!["./deepwake.json".to_string(), "../deepwake.json".to_string()];
    if let Ok(p) = env::var("DEEPWAKE_CONFIG") {
        paths.push(p);
    }
    paths
}

pub fn load_engine_config() -> EngineConfig {
    for path in candidate_paths() {
        if !Path::new(&path).exists() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<EngineConfig>(&raw) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!("failed to parse {}: {}, using defaults", path, e);
                    return EngineConfig::default();
                }
            },
            Err(e) => {
                warn!("failed to read {}: {}, using defaults", path, e);
                return EngineConfig::default();
            }
        }
    }
    EngineConfig::default()
}

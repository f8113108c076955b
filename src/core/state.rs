//! Central dependency-injection struct threaded through the Dive
//! Planner, Deep Diver, and Chain Executor. Modeled directly on the
//! teacher's `core/app_state.rs::AppState`: `Arc`-wrapped shared
//! services, optional components behind builder-style `with_*` methods,
//! and a `Debug` impl that only exposes enabled-flags rather than
//! internals.

use crate::archive::periscope::CcIndexClient;
use crate::archive::sonar::Sonar;
use crate::contracts::{EntityStore, RuleExecutor};
use crate::core::config::EngineConfig;
use crate::core::types::CCRecord;
use crate::registry::RuleRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct ExecutorState {
    pub registry: Arc<RuleRegistry>,
    pub periscope: Arc<dyn CcIndexClient>,
    pub sonar: Arc<Sonar>,
    pub rule_executor: Arc<dyn RuleExecutor>,
    pub entity_store: Option<Arc<dyn EntityStore>>,
    pub config: Arc<EngineConfig>,

    /// Bounds concurrent CC Index lookups. Consumed by
    /// `archive::dive_planner::DivePlanner::from_state` so every planner
    /// built from this state shares the same pool of in-flight CC Index
    /// requests (`SUBMARINE_CC_INDEX_CONCURRENCY`) rather than each
    /// opening its own.
    pub cc_index_limit: Arc<Semaphore>,

    /// CC Index lookups keyed by `domain|archive|filters`, consumed by
    /// `DivePlanner::from_state`'s `fetch_targets`, mirroring
    /// `AppState`'s `search_cache` moka cache.
    pub cc_lookup_cache: moka::future::Cache<String, Vec<CCRecord>>,
}

impl std::fmt::Debug for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorState")
            .field("entity_store_enabled", &self.entity_store.is_some())
            .field("cc_index_concurrency", &self.cc_index_limit.available_permits())
            .finish()
    }
}

impl ExecutorState {
    pub fn new(
        registry: Arc<RuleRegistry>,
        periscope: Arc<dyn CcIndexClient>,
        sonar: Arc<Sonar>,
        rule_executor: Arc<dyn RuleExecutor>,
        config: EngineConfig,
    ) -> Self {
        let cc_index_limit = config.resolve_cc_index_concurrency();
        Self {
            registry,
            periscope,
            sonar,
            rule_executor,
            entity_store: None,
            config: Arc::new(config),
            cc_index_limit: Arc::new(Semaphore::new(cc_index_limit)),
            cc_lookup_cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60 * 30))
                .build(),
        }
    }

    pub fn with_entity_store(mut self, entity_store: Arc<dyn EntityStore>) -> Self {
        self.entity_store = Some(entity_store);
        self
    }
}

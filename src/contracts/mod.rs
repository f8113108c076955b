//! External collaborator contracts. The core only ever calls through
//! these traits; it never implements the rule executor or the entity
//! store itself (§1).

use async_trait::async_trait;
use serde_json::Value;

/// Performs one HTTP/API transformation for a single rule id. Out of
/// scope per §1 — the core only consumes this contract.
#[async_trait]
pub trait RuleExecutor: Send + Sync {
    async fn execute_rule(
        &self,
        rule_id: &str,
        value: &str,
        jurisdiction: Option<&str>,
    ) -> RuleExecutionResult;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuleExecutionResult {
    pub status: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RuleExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            data: Value::Null,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Persistence to an external graph/index store. Probed at construction
/// time; its absence is treated as "persistence disabled" (§6), never as
/// an error. Mirrors the teacher's `Option<Arc<dyn ...>>` best-effort
/// dependency pattern (`core::state::ExecutorState::entity_store`).
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn create_node(
        &self,
        entity_type: &str,
        value: &str,
        data: &Value,
        source: &str,
    ) -> Result<Option<String>, String>;
}

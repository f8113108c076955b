//! Rule Registry (§4.1): loads `rules`, `playbooks`, `chain_rules` from
//! static tables, indexed by id. Immutable after load; no network. Any
//! failure at load is fatal at startup, per §7's configuration-error
//! kind — modeled on the teacher's `core/tools_registry.rs`, which loads
//! a built-in catalog and falls back to safe defaults when an optional
//! metadata file is absent, but treats a malformed *present* file as an
//! error rather than silently discarding it.

use crate::core::types::{ChainRule, Playbook, RuleDef};
use crate::error::CoreError;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: HashMap<String, RuleDef>,
    playbooks: HashMap<String, Playbook>,
    /// Ids in file/load order, for prefix-match resolution — `playbooks`
    /// is a `HashMap` and cannot answer "which id came first".
    playbook_order: Vec<String>,
    chain_rules: HashMap<String, ChainRule>,
    legend: HashMap<String, String>,
}

impl RuleRegistry {
    /// Loads `rules.json`, `playbooks_validated.json` (preferred) or
    /// `playbooks.json`, `chain_rules.json`, and `legend.json` from
    /// `dir`. Missing files yield empty tables (logged); a file that
    /// exists but fails to parse is a fatal configuration error.
    pub fn load(dir: &Path) -> Result<Self, CoreError> {
        let rules = load_table::<RuleDef>(dir, "rules.json")?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let playbooks_validated = dir.join("playbooks_validated.json");
        let playbook_file = if playbooks_validated.exists() {
            "playbooks_validated.json"
        } else {
            "playbooks.json"
        };
        let playbook_list = load_table::<Playbook>(dir, playbook_file)?;
        let playbook_order: Vec<String> = playbook_list.iter().map(|p| p.id.clone()).collect();
        let playbooks = playbook_list.into_iter().map(|p| (p.id.clone(), p)).collect();

        let chain_rules = load_table::<ChainRule>(dir, "chain_rules.json")?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let legend = load_map(dir, "legend.json")?;

        info!(
            "rule registry loaded: {} rules, {} playbooks, {} chain rules",
            rules.len(),
            playbooks.len(),
            chain_rules.len()
        );

        Ok(Self {
            rules,
            playbooks,
            playbook_order,
            chain_rules,
            legend,
        })
    }

    pub fn get_rule(&self, id: &str) -> Option<&RuleDef> {
        self.rules.get(id)
    }

    pub fn get_playbook(&self, id: &str) -> Option<&Playbook> {
        self.playbooks.get(id)
    }

    pub fn get_chain_rule(&self, id: &str) -> Option<&ChainRule> {
        self.chain_rules.get(id)
    }

    pub fn resolve_field_name(&self, code: u32) -> Option<&str> {
        self.legend.get(&code.to_string()).map(|s| s.as_str())
    }

    /// Resolve a playbook id pattern against a jurisdiction:
    /// - `{jurisdiction}` is substituted with the uppercased jurisdiction.
    /// - a trailing `*` is a prefix match, returning the first id with
    ///   that prefix in load order (not sorted — matches the original's
    ///   dict/file insertion-order resolution).
    /// - direct ids pass through unchanged if they exist.
    /// - references shaped `{...}` with no jurisdiction available return
    ///   `None` (the caller lacks context to resolve them).
    pub fn resolve_playbook_id(&self, pattern: &str, jurisdiction: Option<&str>) -> Option<String> {
        if pattern.contains("{jurisdiction}") {
            let jur = jurisdiction?;
            let resolved = pattern.replace("{jurisdiction}", &jur.to_uppercase());
            return self.playbooks.contains_key(&resolved).then_some(resolved);
        }

        if pattern.starts_with('{') && pattern.ends_with('}') {
            return None;
        }

        if let Some(prefix) = pattern.strip_suffix('*') {
            return self.playbook_order.iter().find(|id| id.starts_with(prefix)).cloned();
        }

        self.playbooks.contains_key(pattern).then(|| pattern.to_string())
    }
}

fn load_table<T: serde::de::DeserializeOwned>(dir: &Path, filename: &str) -> Result<Vec<T>, CoreError> {
    let path = dir.join(filename);
    if !path.exists() {
        debug!("{} not found, using empty table", filename);
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| CoreError::Configuration(format!("reading {}: {}", filename, e)))?;
    serde_json::from_str(&raw).map_err(|e| CoreError::Configuration(format!("parsing {}: {}", filename, e)))
}

fn load_map(dir: &Path, filename: &str) -> Result<HashMap<String, String>, CoreError> {
    let path = dir.join(filename);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| CoreError::Configuration(format!("reading {}: {}", filename, e)))?;
    serde_json::from_str(&raw).map_err(|e| CoreError::Configuration(format!("parsing {}: {}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn missing_tables_yield_empty_registry() {
        let dir = std::env::temp_dir().join(format!("deepwake-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let registry = RuleRegistry::load(&dir).unwrap();
        assert!(registry.get_rule("anything").is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resolve_playbook_id_prefix_match() {
        let dir = std::env::temp_dir().join(format!("deepwake-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write(
            &dir,
            "playbooks.json",
            r#"[{"id":"GB_CORPORATE_SWEEP","label":"x","rules":[]},{"id":"US_CORPORATE_SWEEP","label":"y","rules":[]}]"#,
        );
        let registry = RuleRegistry::load(&dir).unwrap();
        assert_eq!(
            registry.resolve_playbook_id("GB_*", None),
            Some("GB_CORPORATE_SWEEP".to_string())
        );
        assert_eq!(registry.resolve_playbook_id("ZZ_*", None), None);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resolve_playbook_id_prefix_match_prefers_load_order_over_alphabetical() {
        let dir = std::env::temp_dir().join(format!("deepwake-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write(
            &dir,
            "playbooks.json",
            r#"[{"id":"ZZ_FIRST","label":"x","rules":[]},{"id":"AA_SECOND","label":"y","rules":[]}]"#,
        );
        let registry = RuleRegistry::load(&dir).expect("load registry");
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(registry.resolve_playbook_id("*", None), Some("ZZ_FIRST".to_string()));
    }

    #[test]
    fn resolve_playbook_id_jurisdiction_substitution() {
        let dir = std::env::temp_dir().join(format!("deepwake-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write(
            &dir,
            "playbooks.json",
            r#"[{"id":"CORPORATE_SWEEP_GB","label":"x","rules":[]}]"#,
        );
        let registry = RuleRegistry::load(&dir).unwrap();
        assert_eq!(
            registry.resolve_playbook_id("CORPORATE_SWEEP_{jurisdiction}", Some("gb")),
            Some("CORPORATE_SWEEP_GB".to_string())
        );
        assert_eq!(registry.resolve_playbook_id("CORPORATE_SWEEP_{jurisdiction}", None), None);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_present_file_is_fatal() {
        let dir = std::env::temp_dir().join(format!("deepwake-registry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write(&dir, "rules.json", "not json");
        assert!(RuleRegistry::load(&dir).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

//! Registry of running orchestrators.
//!
//! Owned explicitly by the hosting composition root and passed by
//! reference; there is deliberately no process-wide global, so multiple
//! orchestrators coexist under test and in one host process.

use dashmap::DashMap;
use std::sync::Arc;

use crate::core::errors::{ForemanError, Result};
use crate::orchestrator::Orchestrator;

#[derive(Default)]
pub struct OrchestratorRegistry {
    orchestrators: DashMap<String, Arc<Orchestrator>>,
}

impl OrchestratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under a project id. A duplicate id is rejected; remove the
    /// old instance first.
    pub fn register(&self, project_id: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
        if self.orchestrators.contains_key(project_id) {
            return Err(ForemanError::validation(format!(
                "orchestrator already registered for project '{}'",
                project_id
            )));
        }
        self.orchestrators
            .insert(project_id.to_string(), orchestrator);
        Ok(())
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<Orchestrator>> {
        self.orchestrators.get(project_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, project_id: &str) -> Option<Arc<Orchestrator>> {
        self.orchestrators.remove(project_id).map(|(_, o)| o)
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.orchestrators
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.orchestrators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orchestrators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::orchestrator::OrchestratorConfig;

    fn orchestrator(project_id: &str) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(
                project_id,
                "demo",
                OrchestratorConfig::default(),
                AgentRegistry::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_register_get_remove() {
        let registry = OrchestratorRegistry::new();
        registry.register("p1", orchestrator("p1")).unwrap();
        registry.register("p2", orchestrator("p2")).unwrap();

        assert!(registry.register("p1", orchestrator("p1")).is_err());
        assert_eq!(registry.len(), 2);
        assert!(registry.get("p1").is_some());

        let mut ids = registry.project_ids();
        ids.sort();
        assert_eq!(ids, vec!["p1", "p2"]);

        assert!(registry.remove("p1").is_some());
        assert!(registry.get("p1").is_none());
        assert_eq!(registry.len(), 1);
    }
}

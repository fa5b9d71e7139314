//! Agent collaborator contract.
//!
//! Agents are the external boundary of the engine: one `process` call per
//! stage (or per iteration for the revise loops). The engine never inspects
//! agent internals or prompt content, only the outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::errors::{ForemanError, Result};
use crate::state::Stage;

/// Roles a stage's task template can bind work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ProjectManager,
    RequirementsAnalyst,
    Architect,
    UiDesigner,
    Developer,
    CodeReviewer,
    Tester,
    QaEngineer,
    TechnicalWriter,
    DevOps,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::ProjectManager => "project_manager",
            AgentRole::RequirementsAnalyst => "requirements_analyst",
            AgentRole::Architect => "architect",
            AgentRole::UiDesigner => "ui_designer",
            AgentRole::Developer => "developer",
            AgentRole::CodeReviewer => "code_reviewer",
            AgentRole::Tester => "tester",
            AgentRole::QaEngineer => "qa_engineer",
            AgentRole::TechnicalWriter => "technical_writer",
            AgentRole::DevOps => "devops",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context handed to an agent for one stage call. The engine treats the
/// content as opaque; it only canonicalizes it for cache keying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub stage: Stage,
    pub iteration: u32,
    pub project_id: String,
    pub input: Value,
}

impl StageContext {
    pub fn new(stage: Stage, project_id: &str, input: Value) -> Self {
        Self {
            stage,
            iteration: 0,
            project_id: project_id.to_string(),
            input,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Canonical JSON view used for result-cache keying.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "stage": self.stage,
            "iteration": self.iteration,
            "project_id": self.project_id,
            "input": self.input,
        })
    }
}

/// Outcome of one agent call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed<M: Into<String>>(message: M) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// A role-bound agent. Implementations return `anyhow::Result` so they can
/// bubble arbitrary backend errors; transient failures should be wrapped in
/// `ForemanError` variants (timeout, rate_limited, upstream) to stay
/// retryable across the boundary.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn role(&self) -> AgentRole;

    async fn process(&self, context: StageContext) -> anyhow::Result<AgentOutcome>;
}

/// Registry of agents by role. Registration happens once at composition
/// time; lookups are read-only afterwards.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentRole, Arc<dyn Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let role = agent.role();
        let mut agents = self
            .agents
            .write()
            .map_err(|_| ForemanError::internal("agent registry lock poisoned"))?;
        if agents.contains_key(&role) {
            return Err(ForemanError::validation(format!(
                "agent already registered for role '{}'",
                role
            )));
        }
        agents.insert(role, agent);
        Ok(())
    }

    pub fn get(&self, role: AgentRole) -> Result<Arc<dyn Agent>> {
        let agents = self
            .agents
            .read()
            .map_err(|_| ForemanError::internal("agent registry lock poisoned"))?;
        agents
            .get(&role)
            .cloned()
            .ok_or_else(|| ForemanError::agent(role.as_str(), "no agent registered for role"))
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        self.agents
            .read()
            .map(|agents| agents.keys().copied().collect())
            .unwrap_or_default()
    }
}

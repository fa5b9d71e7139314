//! Pipeline state machine.
//!
//! `PipelineState` owns everything a run accumulates: tasks, artifacts,
//! decisions, feedback and the requirement/architecture/design maps. It is
//! single-writer by construction: the orchestrator holds it behind
//! [`SharedState`], which exposes only the narrow mutation API below.
//! Every field round-trips through JSON; checkpointing depends on that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::agent::AgentRole;
use crate::core::errors::{ForemanError, Result};

/// Fixed ordered development stages. `Completed` terminates the sequence;
/// `Failed` sits outside it and never appears in progress denominators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialization,
    RequirementAnalysis,
    ArchitectureDesign,
    UiDesign,
    DatabaseDesign,
    Development,
    CodeReview,
    BugFixing,
    Testing,
    QaReview,
    Documentation,
    Deployment,
    Maintenance,
    Completed,
    Failed,
}

/// The full static stage order, ending in `Completed`.
pub const STAGE_SEQUENCE: [Stage; 14] = [
    Stage::Initialization,
    Stage::RequirementAnalysis,
    Stage::ArchitectureDesign,
    Stage::UiDesign,
    Stage::DatabaseDesign,
    Stage::Development,
    Stage::CodeReview,
    Stage::BugFixing,
    Stage::Testing,
    Stage::QaReview,
    Stage::Documentation,
    Stage::Deployment,
    Stage::Maintenance,
    Stage::Completed,
];

impl Stage {
    /// Position of this stage in the fixed sequence. `Failed` has none.
    pub fn position(&self) -> Option<usize> {
        STAGE_SEQUENCE.iter().position(|s| s == self)
    }

    /// Successor in the static order. `None` for `Completed` (sequence
    /// exhausted) and for `Failed`.
    pub fn next_in_sequence(&self) -> Option<Stage> {
        let pos = self.position()?;
        STAGE_SEQUENCE.get(pos + 1).copied()
    }

    /// Completion percentage by position in the fixed enum, with `Failed`
    /// excluded from the denominator.
    pub fn progress_percentage(&self) -> f64 {
        match self.position() {
            Some(pos) => (pos as f64 / (STAGE_SEQUENCE.len() - 1) as f64) * 100.0,
            None => 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initialization => "initialization",
            Stage::RequirementAnalysis => "requirement_analysis",
            Stage::ArchitectureDesign => "architecture_design",
            Stage::UiDesign => "ui_design",
            Stage::DatabaseDesign => "database_design",
            Stage::Development => "development",
            Stage::CodeReview => "code_review",
            Stage::BugFixing => "bug_fixing",
            Stage::Testing => "testing",
            Stage::QaReview => "qa_review",
            Stage::Documentation => "documentation",
            Stage::Deployment => "deployment",
            Stage::Maintenance => "maintenance",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Blocked,
}

/// A unit of work generated for a stage. Owned exclusively by
/// `PipelineState`; retained for audit after completion, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub assignee: Option<AgentRole>,
    pub status: TaskStatus,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new<T: Into<String>, D: Into<String>>(
        title: T,
        description: D,
        assignee: Option<AgentRole>,
        stage: Stage,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", Uuid::new_v4()),
            title: title.into(),
            description: description.into(),
            assignee,
            status: TaskStatus::Pending,
            stage,
            created_at: now,
            updated_at: now,
            completed_at: None,
            dependencies: Vec::new(),
            artifacts: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Field updates applied through `PipelineState::update_task`.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assignee: Option<AgentRole>,
    pub add_artifact: Option<String>,
    pub add_dependency: Option<String>,
    pub metadata: Option<(String, String)>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub made_by: String,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFeedback {
    pub feedback: String,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
}

/// Mutable state of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: String,
    pub name: String,
    pub description: String,
    pub current_stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub requirements: HashMap<String, Value>,
    #[serde(default)]
    pub architecture: HashMap<String, Value>,
    #[serde(default)]
    pub design: HashMap<String, Value>,
    #[serde(default)]
    pub tasks: HashMap<String, Task>,
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub client_feedback: Vec<ClientFeedback>,
}

impl PipelineState {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        let now = Utc::now();
        Self {
            id: format!("pipeline_{}", Uuid::new_v4()),
            name: name.into(),
            description: description.into(),
            current_stage: Stage::Initialization,
            created_at: now,
            updated_at: now,
            requirements: HashMap::new(),
            architecture: HashMap::new(),
            design: HashMap::new(),
            tasks: HashMap::new(),
            artifacts: HashMap::new(),
            decisions: Vec::new(),
            client_feedback: Vec::new(),
        }
    }

    /// Move to `next`. Sequence legality is the caller's responsibility;
    /// the executor only ever requests the next legal stage.
    pub fn advance_stage(&mut self, next: Stage) {
        debug!(from = %self.current_stage, to = %next, "Advancing stage");
        self.current_stage = next;
        self.touch();
    }

    /// Register a task. Task ids are unique within one pipeline.
    pub fn add_task(&mut self, task: Task) -> Result<String> {
        if self.tasks.contains_key(&task.id) {
            return Err(ForemanError::validation_field(
                format!("duplicate task id '{}'", task.id),
                "task.id",
            ));
        }
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        self.touch();
        Ok(id)
    }

    pub fn update_task(&mut self, id: &str, update: TaskUpdate) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ForemanError::validation(format!("unknown task id '{}'", id)))?;

        let now = Utc::now();
        if let Some(status) = update.status {
            task.status = status;
            if status == TaskStatus::Completed {
                task.completed_at = Some(now);
            }
        }
        if let Some(assignee) = update.assignee {
            task.assignee = Some(assignee);
        }
        if let Some(artifact) = update.add_artifact {
            task.artifacts.push(artifact);
        }
        if let Some(dep) = update.add_dependency {
            task.dependencies.push(dep);
        }
        if let Some((key, value)) = update.metadata {
            task.metadata.insert(key, value);
        }
        task.updated_at = now;
        self.touch();
        Ok(())
    }

    pub fn add_artifact<N: Into<String>, R: Into<String>>(&mut self, name: N, reference: R) {
        self.artifacts.insert(name.into(), reference.into());
        self.touch();
    }

    pub fn add_decision<D, B, R>(&mut self, decision: D, made_by: B, rationale: R)
    where
        D: Into<String>,
        B: Into<String>,
        R: Into<String>,
    {
        self.decisions.push(Decision {
            decision: decision.into(),
            made_by: made_by.into(),
            rationale: rationale.into(),
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn add_client_feedback<F: Into<String>>(&mut self, feedback: F, stage: Stage) {
        self.client_feedback.push(ClientFeedback {
            feedback: feedback.into(),
            stage,
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn tasks_by_stage(&self, stage: Stage) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.stage == stage).collect()
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.status == status).collect()
    }

    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(Into::into)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, serialized)
            .await
            .map_err(|e| ForemanError::io(format!("save pipeline state to {:?}", path), e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ForemanError::io(format!("load pipeline state from {:?}", path), e))?;
        serde_json::from_slice(&bytes).map_err(Into::into)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Single-writer handle to a `PipelineState`.
///
/// Only the orchestrator/executor holds one of these; agents and observers
/// see state excerpts through stage context values, never the lock. The
/// narrow API keeps the single-writer invariant structural instead of
/// conventional.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<RwLock<PipelineState>>,
}

impl SharedState {
    pub fn new(state: PipelineState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn advance_stage(&self, next: Stage) {
        self.inner.write().await.advance_stage(next);
    }

    pub async fn current_stage(&self) -> Stage {
        self.inner.read().await.current_stage
    }

    pub async fn add_task(&self, task: Task) -> Result<String> {
        self.inner.write().await.add_task(task)
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<()> {
        self.inner.write().await.update_task(id, update)
    }

    pub async fn add_artifact(&self, name: &str, reference: &str) {
        self.inner.write().await.add_artifact(name, reference);
    }

    pub async fn add_decision(&self, decision: &str, made_by: &str, rationale: &str) {
        self.inner
            .write()
            .await
            .add_decision(decision, made_by, rationale);
    }

    pub async fn add_client_feedback(&self, feedback: &str, stage: Stage) {
        self.inner.write().await.add_client_feedback(feedback, stage);
    }

    /// Record a value into one of the stage output maps.
    pub async fn set_output(&self, section: StateSection, key: &str, value: Value) {
        let mut state = self.inner.write().await;
        let map = match section {
            StateSection::Requirements => &mut state.requirements,
            StateSection::Architecture => &mut state.architecture,
            StateSection::Design => &mut state.design,
        };
        map.insert(key.to_string(), value);
        state.touch();
    }

    pub async fn get_output(&self, section: StateSection, key: &str) -> Option<Value> {
        let state = self.inner.read().await;
        let map = match section {
            StateSection::Requirements => &state.requirements,
            StateSection::Architecture => &state.architecture,
            StateSection::Design => &state.design,
        };
        map.get(key).cloned()
    }

    /// True when the given design-map key holds boolean `true`, the "done"
    /// signal checked by the orchestrator's revise loops.
    pub async fn signal_set(&self, key: &str) -> bool {
        self.get_output(StateSection::Design, key)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Snapshot the full state (checkpointing, progress reporting).
    pub async fn snapshot(&self) -> PipelineState {
        self.inner.read().await.clone()
    }

    /// Replace the entire state (resume path).
    pub async fn restore(&self, state: PipelineState) {
        *self.inner.write().await = state;
    }

    pub async fn artifacts(&self) -> HashMap<String, String> {
        self.inner.read().await.artifacts.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSection {
    Requirements,
    Architecture,
    Design,
}

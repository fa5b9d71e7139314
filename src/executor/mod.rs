//! Base stage executor.
//!
//! Drives the pipeline through the fixed stage order: instantiate the
//! stage's task template, announce assignments and stage start on the bus,
//! run the responsible agent, then mark the stage complete and move on.
//! No retry lives here; the orchestrator layers that on top.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::agent::{AgentOutcome, AgentRegistry, AgentRole, StageContext};
use crate::bus::{Message, MessageBus, MessageType};
use crate::cache::ResultCache;
use crate::core::errors::{ForemanError, Result};
use crate::state::{SharedState, Stage, StateSection, Task, TaskStatus, TaskUpdate};

const SENDER: &str = "stage_executor";

/// Role accountable for a stage's outcome. Terminal stages have none.
pub fn stage_primary_role(stage: Stage) -> Option<AgentRole> {
    match stage {
        Stage::Initialization => Some(AgentRole::ProjectManager),
        Stage::RequirementAnalysis => Some(AgentRole::RequirementsAnalyst),
        Stage::ArchitectureDesign => Some(AgentRole::Architect),
        Stage::UiDesign => Some(AgentRole::UiDesigner),
        Stage::DatabaseDesign => Some(AgentRole::Architect),
        Stage::Development => Some(AgentRole::Developer),
        Stage::CodeReview => Some(AgentRole::CodeReviewer),
        Stage::BugFixing => Some(AgentRole::Developer),
        Stage::Testing => Some(AgentRole::Tester),
        Stage::QaReview => Some(AgentRole::QaEngineer),
        Stage::Documentation => Some(AgentRole::TechnicalWriter),
        Stage::Deployment => Some(AgentRole::DevOps),
        Stage::Maintenance => Some(AgentRole::DevOps),
        Stage::Completed | Stage::Failed => None,
    }
}

/// Static task template for a stage, in declared order. Assignment
/// messages are published in exactly this order.
pub fn stage_task_template(stage: Stage) -> Vec<(&'static str, &'static str, Option<AgentRole>)> {
    match stage {
        Stage::Initialization => vec![(
            "Project kickoff",
            "Set up project scope and collaborators",
            Some(AgentRole::ProjectManager),
        )],
        Stage::RequirementAnalysis => vec![
            (
                "Gather requirements",
                "Collect functional and non-functional requirements",
                Some(AgentRole::RequirementsAnalyst),
            ),
            (
                "Prioritize requirements",
                "Rank requirements by value and risk",
                Some(AgentRole::ProjectManager),
            ),
        ],
        Stage::ArchitectureDesign => vec![(
            "Design system architecture",
            "Produce component and data-flow design",
            Some(AgentRole::Architect),
        )],
        Stage::UiDesign => vec![(
            "Design user interface",
            "Produce screens and interaction flows",
            Some(AgentRole::UiDesigner),
        )],
        Stage::DatabaseDesign => vec![(
            "Design database schema",
            "Define entities, relations and indexes",
            Some(AgentRole::Architect),
        )],
        Stage::Development => vec![(
            "Implement features",
            "Write code for the planned requirements",
            Some(AgentRole::Developer),
        )],
        Stage::CodeReview => vec![(
            "Review code",
            "Review implemented changes for defects",
            Some(AgentRole::CodeReviewer),
        )],
        Stage::BugFixing => vec![(
            "Fix reported defects",
            "Address review and test findings",
            Some(AgentRole::Developer),
        )],
        Stage::Testing => vec![(
            "Run test suite",
            "Execute and extend automated tests",
            Some(AgentRole::Tester),
        )],
        Stage::QaReview => vec![(
            "Quality review",
            "Verify acceptance criteria end to end",
            Some(AgentRole::QaEngineer),
        )],
        Stage::Documentation => vec![(
            "Write documentation",
            "Produce user and operator documentation",
            Some(AgentRole::TechnicalWriter),
        )],
        Stage::Deployment => vec![(
            "Deploy release",
            "Ship the release to the target environment",
            Some(AgentRole::DevOps),
        )],
        Stage::Maintenance => vec![(
            "Set up maintenance",
            "Establish monitoring and support rotation",
            Some(AgentRole::DevOps),
        )],
        Stage::Completed | Stage::Failed => Vec::new(),
    }
}

/// Output map a stage's agent result lands in.
fn stage_output_section(stage: Stage) -> StateSection {
    match stage {
        Stage::Initialization | Stage::RequirementAnalysis => StateSection::Requirements,
        Stage::ArchitectureDesign | Stage::DatabaseDesign => StateSection::Architecture,
        _ => StateSection::Design,
    }
}

pub struct StageExecutor {
    project_id: String,
    state: SharedState,
    bus: Arc<MessageBus>,
    agents: AgentRegistry,
    cache: Arc<ResultCache>,
    stage_history: RwLock<Vec<Stage>>,
}

impl StageExecutor {
    pub fn new(
        project_id: impl Into<String>,
        state: SharedState,
        bus: Arc<MessageBus>,
        agents: AgentRegistry,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            state,
            bus,
            agents,
            cache,
            stage_history: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub async fn stage_history(&self) -> Vec<Stage> {
        self.stage_history.read().await.clone()
    }

    /// Resume path: replace the history with a checkpointed one.
    pub async fn restore_history(&self, history: Vec<Stage>) {
        *self.stage_history.write().await = history;
    }

    /// Enter a stage: register its template tasks and announce them, then
    /// announce the stage itself. Returns the created task ids in template
    /// order.
    pub async fn begin_stage(&self, stage: Stage) -> Result<Vec<String>> {
        let mut task_ids = Vec::new();
        for (title, description, assignee) in stage_task_template(stage) {
            let task = Task::new(title, description, assignee, stage);
            let id = self.state.add_task(task).await?;
            let mut message = Message::new(
                MessageType::TaskAssigned,
                SENDER,
                json!({
                    "task_id": id,
                    "title": title,
                    "stage": stage.as_str(),
                }),
            );
            if let Some(role) = assignee {
                message = message.with_receiver(role.as_str());
            }
            self.bus.publish(message).await?;
            task_ids.push(id);
        }

        self.bus
            .publish(Message::new(
                MessageType::StageStart,
                SENDER,
                json!({ "stage": stage.as_str() }),
            ))
            .await?;
        info!(stage = %stage, tasks = task_ids.len(), "Stage started");
        Ok(task_ids)
    }

    /// Leave a stage: close its tasks, announce completion, append to the
    /// stage history.
    pub async fn complete_stage(&self, stage: Stage) -> Result<()> {
        let task_ids: Vec<String> = {
            let snapshot = self.state.snapshot().await;
            snapshot
                .tasks_by_stage(stage)
                .into_iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .map(|t| t.id.clone())
                .collect()
        };
        for id in &task_ids {
            self.state
                .update_task(id, TaskUpdate::status(TaskStatus::Completed))
                .await?;
        }

        self.bus
            .publish(Message::new(
                MessageType::StageComplete,
                SENDER,
                json!({
                    "stage": stage.as_str(),
                    "tasks_completed": task_ids.len(),
                }),
            ))
            .await?;
        self.stage_history.write().await.push(stage);
        info!(stage = %stage, "Stage completed");
        Ok(())
    }

    /// One agent call routed through the result cache. A cached value is
    /// returned without touching the agent; a fresh success is cached.
    pub async fn call_agent(&self, role: AgentRole, context: StageContext) -> Result<Value> {
        let key_context = context.to_value();
        if let Some(cached) = self.cache.get(role, &key_context) {
            debug!(role = %role, stage = %context.stage, "Result cache hit");
            return Ok(cached);
        }

        let agent = self.agents.get(role)?;
        let outcome: AgentOutcome = agent.process(context.clone()).await?;
        if !outcome.success {
            return Err(ForemanError::agent(
                role.as_str(),
                outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ));
        }
        let value = outcome.data.unwrap_or(Value::Null);
        self.cache.set(role, &key_context, value.clone());
        Ok(value)
    }

    /// Default action for one stage: run the responsible agent and record
    /// its output in the matching state section.
    pub async fn run_stage(&self, stage: Stage) -> Result<()> {
        self.begin_stage(stage).await?;
        if let Some(role) = stage_primary_role(stage) {
            let context = StageContext::new(
                stage,
                &self.project_id,
                json!({ "stage": stage.as_str() }),
            );
            let output = self.call_agent(role, context).await?;
            self.state
                .set_output(stage_output_section(stage), stage.as_str(), output)
                .await;
        }
        self.complete_stage(stage).await
    }

    /// Walk the static order from the current stage to `Completed`. A stage
    /// without a successor before the sequence ends is a hard error, never
    /// skipped past.
    pub async fn run_all(&self) -> Result<()> {
        let mut stage = self.state.current_stage().await;
        loop {
            if stage == Stage::Completed {
                return self.finish_workflow().await;
            }
            if stage == Stage::Failed {
                return Err(ForemanError::stage(
                    stage.as_str(),
                    "cannot execute from failed state",
                ));
            }
            self.run_stage(stage).await?;
            let next = stage.next_in_sequence().ok_or_else(|| {
                ForemanError::stage(stage.as_str(), "no successor in the stage sequence")
            })?;
            self.state.advance_stage(next).await;
            stage = next;
        }
    }

    async fn finish_workflow(&self) -> Result<()> {
        let history = self.stage_history().await;
        self.bus
            .publish(Message::new(
                MessageType::WorkflowComplete,
                SENDER,
                json!({
                    "stages_completed": history.len(),
                    "project_id": self.project_id,
                }),
            ))
            .await?;
        info!(stages = history.len(), "Workflow complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HistoryFilter;
    use crate::cache::ResultCacheConfig;
    use crate::state::{PipelineState, STAGE_SEQUENCE};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAgent {
        role: AgentRole,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::agent::Agent for StubAgent {
        fn role(&self) -> AgentRole {
            self.role
        }

        async fn process(&self, context: StageContext) -> anyhow::Result<AgentOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentOutcome::ok(json!({
                "stage": context.stage.as_str(),
                "role": self.role.as_str(),
            })))
        }
    }

    fn executor_with_all_agents() -> (StageExecutor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let agents = AgentRegistry::new();
        for role in [
            AgentRole::ProjectManager,
            AgentRole::RequirementsAnalyst,
            AgentRole::Architect,
            AgentRole::UiDesigner,
            AgentRole::Developer,
            AgentRole::CodeReviewer,
            AgentRole::Tester,
            AgentRole::QaEngineer,
            AgentRole::TechnicalWriter,
            AgentRole::DevOps,
        ] {
            agents
                .register(Arc::new(StubAgent {
                    role,
                    calls: calls.clone(),
                }))
                .unwrap();
        }
        let executor = StageExecutor::new(
            "proj-1",
            SharedState::new(PipelineState::new("proj", "demo")),
            Arc::new(MessageBus::new()),
            agents,
            Arc::new(ResultCache::new(ResultCacheConfig::default()).unwrap()),
        );
        (executor, calls)
    }

    #[tokio::test]
    async fn test_run_all_walks_full_sequence() {
        let (executor, _calls) = executor_with_all_agents();
        executor.run_all().await.unwrap();

        let history = executor.stage_history().await;
        // Every non-terminal stage exactly once, in order.
        let expected: Vec<Stage> = STAGE_SEQUENCE
            .iter()
            .copied()
            .filter(|s| *s != Stage::Completed)
            .collect();
        assert_eq!(history, expected);
        assert_eq!(executor.state().current_stage().await, Stage::Completed);

        let complete = executor
            .bus()
            .history(
                &HistoryFilter {
                    message_type: Some(MessageType::WorkflowComplete),
                    ..Default::default()
                },
                None,
            )
            .await;
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].content["stages_completed"], json!(13));
    }

    #[tokio::test]
    async fn test_begin_stage_publishes_assignments_in_template_order() {
        let (executor, _calls) = executor_with_all_agents();
        let task_ids = executor.begin_stage(Stage::RequirementAnalysis).await.unwrap();
        assert_eq!(task_ids.len(), 2);

        let assigned = executor
            .bus()
            .history(
                &HistoryFilter {
                    message_type: Some(MessageType::TaskAssigned),
                    ..Default::default()
                },
                None,
            )
            .await;
        let receivers: Vec<&str> = assigned
            .iter()
            .map(|m| m.receiver.as_deref().unwrap())
            .collect();
        assert_eq!(receivers, vec!["requirements_analyst", "project_manager"]);

        // Stage start follows the assignments.
        let start = executor
            .bus()
            .history(
                &HistoryFilter {
                    message_type: Some(MessageType::StageStart),
                    ..Default::default()
                },
                None,
            )
            .await;
        assert_eq!(start.len(), 1);
        assert!(start[0].timestamp >= assigned[1].timestamp);
    }

    #[tokio::test]
    async fn test_complete_stage_closes_tasks_and_appends_history() {
        let (executor, _calls) = executor_with_all_agents();
        executor.begin_stage(Stage::Development).await.unwrap();
        executor.complete_stage(Stage::Development).await.unwrap();

        let snapshot = executor.state().snapshot().await;
        for task in snapshot.tasks_by_stage(Stage::Development) {
            assert_eq!(task.status, TaskStatus::Completed);
            assert!(task.completed_at.is_some());
        }
        assert_eq!(executor.stage_history().await, vec![Stage::Development]);
    }

    #[tokio::test]
    async fn test_call_agent_uses_cache_on_identical_context() {
        let (executor, calls) = executor_with_all_agents();
        let context = StageContext::new(Stage::Development, "proj-1", json!({"k": 1}));

        let first = executor
            .call_agent(AgentRole::Developer, context.clone())
            .await
            .unwrap();
        let second = executor
            .call_agent(AgentRole::Developer, context)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_agent_reported_failure_is_an_error() {
        struct FailingAgent;

        #[async_trait]
        impl crate::agent::Agent for FailingAgent {
            fn role(&self) -> AgentRole {
                AgentRole::Developer
            }

            async fn process(&self, _context: StageContext) -> anyhow::Result<AgentOutcome> {
                Ok(AgentOutcome::failed("compilation broken"))
            }
        }

        let agents = AgentRegistry::new();
        agents.register(Arc::new(FailingAgent)).unwrap();
        let executor = StageExecutor::new(
            "proj-1",
            SharedState::new(PipelineState::new("proj", "demo")),
            Arc::new(MessageBus::new()),
            agents,
            Arc::new(ResultCache::new(ResultCacheConfig::default()).unwrap()),
        );

        let context = StageContext::new(Stage::Development, "proj-1", json!({}));
        let result = executor.call_agent(AgentRole::Developer, context).await;
        assert!(matches!(result, Err(ForemanError::Agent { .. })));
        // Failures are never cached.
        assert!(executor.cache().is_empty());
    }

    #[tokio::test]
    async fn test_run_all_from_failed_state_is_a_hard_error() {
        let (executor, _calls) = executor_with_all_agents();
        executor.state().advance_stage(Stage::Failed).await;
        assert!(matches!(
            executor.run_all().await,
            Err(ForemanError::Stage { .. })
        ));
    }
}

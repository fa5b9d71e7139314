//! Optimized orchestrator: the composition root.
//!
//! Owns one pipeline state, one bus, one cache and one checkpoint store,
//! and drives a seven-stage plan over the base executor: initialization,
//! requirements, an architecture/UI fork-join pair, then development,
//! testing and QA review as revise loops that break on a done signal in
//! shared state. Every agent call is retry-wrapped; every stage boundary
//! checkpoints; long stages also checkpoint on a wall-clock interval.
//! Cancellation is cooperative and wins over any pending retry.

pub mod registry;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::{AgentRegistry, AgentRole, StageContext};
use crate::bus::{Message, MessageBus, MessageType};
use crate::cache::{ResultCache, ResultCacheConfig};
use crate::checkpoint::{CheckpointConfig, CheckpointStore};
use crate::core::cancel::CancelToken;
use crate::core::errors::{ForemanError, Result};
use crate::executor::{stage_primary_role, StageExecutor};
use crate::retry::RetryPolicy;
use crate::state::{PipelineState, SharedState, Stage, StateSection};

const SENDER: &str = "orchestrator";

/// The plan's non-terminal stages, in execution order. Architecture and UI
/// design form the fork/join pair.
pub const PLAN_STAGES: [Stage; 7] = [
    Stage::Initialization,
    Stage::RequirementAnalysis,
    Stage::ArchitectureDesign,
    Stage::UiDesign,
    Stage::Development,
    Stage::Testing,
    Stage::QaReview,
];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Skip the UI design side of the fork/join pair entirely.
    pub skip_ui_design: bool,
    /// Run architecture and UI design concurrently when both are enabled.
    pub parallel_execution: bool,
    /// Iteration budget for each revise loop.
    pub max_iterations: u32,
    pub retry: RetryPolicy,
    pub cache: ResultCacheConfig,
    pub checkpoint: CheckpointConfig,
    /// Wall-clock interval for mid-stage checkpoints.
    pub checkpoint_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            skip_ui_design: false,
            parallel_execution: true,
            max_iterations: 3,
            retry: RetryPolicy::default(),
            cache: ResultCacheConfig::default(),
            checkpoint: CheckpointConfig::default(),
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ForemanError::configuration(
                "max_iterations cannot be zero",
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ForemanError::configuration(
                "checkpoint_interval cannot be zero",
            ));
        }
        self.retry.validate()?;
        self.cache.validate()?;
        self.checkpoint.validate()
    }
}

/// Progress report for the hosting application.
#[derive(Debug, Clone)]
pub struct Progress {
    pub current_stage: Stage,
    pub percentage: f64,
    pub stage_history: Vec<Stage>,
    pub errors: Vec<String>,
    /// Per-stage wall time in milliseconds.
    pub stage_timings: HashMap<Stage, u64>,
    pub elapsed_ms: Option<u64>,
    pub cache_entries: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    executor: StageExecutor,
    checkpoints: CheckpointStore,
    cancel: CancelToken,
    errors: RwLock<Vec<String>>,
    timings: RwLock<HashMap<Stage, u64>>,
    started_at: RwLock<Option<Instant>>,
    handle: Mutex<Option<JoinHandle<bool>>>,
    /// Held for the duration of any run, whether spawned or awaited
    /// directly. `cancel()` acquires it to wait out an in-flight run.
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        project_id: impl Into<String>,
        description: impl Into<String>,
        config: OrchestratorConfig,
        agents: AgentRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let project_id = project_id.into();
        let state = SharedState::new(PipelineState::new(project_id.clone(), description));
        let cache = Arc::new(ResultCache::new(config.cache.clone())?);
        let checkpoints = CheckpointStore::new(config.checkpoint.clone(), project_id.clone())?;
        let executor = StageExecutor::new(
            project_id,
            state,
            Arc::new(MessageBus::new()),
            agents,
            cache,
        );
        Ok(Self {
            config,
            executor,
            checkpoints,
            cancel: CancelToken::new(),
            errors: RwLock::new(Vec::new()),
            timings: RwLock::new(HashMap::new()),
            started_at: RwLock::new(None),
            handle: Mutex::new(None),
            run_lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> &SharedState {
        self.executor.state()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        self.executor.bus()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the plan to completion. Returns whether the pipeline finished
    /// successfully; failure details land in `get_progress().errors`.
    pub async fn execute(&self) -> bool {
        let _running = self.run_lock.lock().await;
        *self.started_at.write().await = Some(Instant::now());
        match self.run_plan().await {
            Ok(()) => {
                self.save_checkpoint("final", HashMap::new()).await;
                true
            }
            Err(e) => {
                self.fail(e).await;
                false
            }
        }
    }

    /// Spawn `execute` as a background task; `cancel()` will await it.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.execute().await });
        *self.handle.lock().await = Some(handle);
    }

    /// Cooperative cancellation. Awaits any in-flight run; after this
    /// returns the pipeline is in `Failed` with a final checkpoint written
    /// and no further mutation will occur.
    pub async fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // A run driven through `execute`/`resume` directly holds the run
        // lock; wait it out so it finalizes before we inspect the state.
        let _running = self.run_lock.lock().await;
        if self.state().current_stage().await != Stage::Failed {
            self.fail(ForemanError::cancelled_with_reason(
                "pipeline",
                "cancelled before failure was recorded",
            ))
            .await;
        }
    }

    /// Restore the latest checkpoint, then continue the plan from where it
    /// left off. The full pipeline state is restored, not just the stage
    /// cursor.
    pub async fn resume(&self) -> Result<bool> {
        let checkpoint = self
            .checkpoints
            .load_latest()
            .await?
            .ok_or_else(|| ForemanError::validation("no checkpoint to resume from"))?;
        info!(
            stage = %checkpoint.current_stage,
            completed = checkpoint.stage_history.len(),
            "Resuming from checkpoint"
        );
        self.state().restore(checkpoint.pipeline_state).await;
        self.executor.restore_history(checkpoint.stage_history).await;
        Ok(self.execute().await)
    }

    pub async fn get_progress(&self) -> Progress {
        let current_stage = self.state().current_stage().await;
        Progress {
            current_stage,
            percentage: current_stage.progress_percentage(),
            stage_history: self.executor.stage_history().await,
            errors: self.errors.read().await.clone(),
            stage_timings: self.timings.read().await.clone(),
            elapsed_ms: self
                .started_at
                .read()
                .await
                .map(|t| t.elapsed().as_millis() as u64),
            cache_entries: self.executor.cache().len(),
        }
    }

    pub async fn get_artifacts(&self) -> HashMap<String, String> {
        self.state().artifacts().await
    }

    async fn run_plan(&self) -> Result<()> {
        if self.state().current_stage().await == Stage::Completed {
            return Ok(());
        }

        self.run_plan_stage(Stage::Initialization).await?;
        self.run_plan_stage(Stage::RequirementAnalysis).await?;

        if self.config.skip_ui_design {
            self.run_plan_stage(Stage::ArchitectureDesign).await?;
        } else if self.config.parallel_execution {
            // Fork/join: both sides start together, fail-fast on the first
            // error. The pair touches disjoint state sections.
            self.state().advance_stage(Stage::ArchitectureDesign).await;
            tokio::try_join!(
                self.run_joined_stage(Stage::ArchitectureDesign),
                self.run_joined_stage(Stage::UiDesign),
            )?;
        } else {
            self.run_plan_stage(Stage::ArchitectureDesign).await?;
            self.run_plan_stage(Stage::UiDesign).await?;
        }

        self.run_revise_loop(Stage::Development, "code_approved", AgentRole::CodeReviewer)
            .await?;
        self.run_revise_loop(Stage::Testing, "tests_passed", AgentRole::Developer)
            .await?;
        self.run_revise_loop(Stage::QaReview, "qa_approved", AgentRole::Developer)
            .await?;

        self.state().advance_stage(Stage::Completed).await;
        self.bus()
            .publish(Message::new(
                MessageType::WorkflowComplete,
                SENDER,
                json!({
                    "project_id": self.executor.project_id(),
                    "stages_completed": self.executor.stage_history().await.len(),
                }),
            ))
            .await?;
        info!("Pipeline completed");
        Ok(())
    }

    /// One sequential plan stage: advance, announce, run the responsible
    /// agent under retry, complete, record timing, checkpoint.
    async fn run_plan_stage(&self, stage: Stage) -> Result<()> {
        if self.already_completed(stage).await {
            return Ok(());
        }
        self.cancel.check(stage.as_str())?;
        self.state().advance_stage(stage).await;
        self.run_joined_stage(stage).await
    }

    /// Stage body without the `advance_stage`, shared with the fork/join
    /// pair where a single "current stage" cannot name both sides.
    async fn run_joined_stage(&self, stage: Stage) -> Result<()> {
        if self.already_completed(stage).await {
            return Ok(());
        }
        let started = Instant::now();
        self.executor.begin_stage(stage).await?;

        let role = stage_primary_role(stage)
            .ok_or_else(|| ForemanError::stage(stage.as_str(), "stage has no responsible role"))?;
        let context = StageContext::new(
            stage,
            self.executor.project_id(),
            json!({ "stage": stage.as_str() }),
        );
        let output = self
            .supervised(stage, self.call_with_retry(stage, role, context))
            .await?;
        self.record_output(stage, output).await;

        self.executor.complete_stage(stage).await?;
        self.record_timing(stage, started).await;
        self.save_checkpoint("stage_boundary", HashMap::new()).await;
        Ok(())
    }

    /// Revise loop: producer, then corrective feedback, breaking the moment
    /// the done signal appears in the design map. The stage enters the
    /// history exactly once however many iterations run.
    async fn run_revise_loop(
        &self,
        stage: Stage,
        done_signal: &str,
        corrective_role: AgentRole,
    ) -> Result<()> {
        if self.already_completed(stage).await {
            return Ok(());
        }
        self.cancel.check(stage.as_str())?;
        self.state().advance_stage(stage).await;
        let started = Instant::now();
        self.executor.begin_stage(stage).await?;

        let producer_role = stage_primary_role(stage)
            .ok_or_else(|| ForemanError::stage(stage.as_str(), "stage has no responsible role"))?;

        let work = async {
            let mut iterations = 0u32;
            for iteration in 0..self.config.max_iterations {
                self.cancel.check(stage.as_str())?;
                iterations = iteration + 1;

                let context = StageContext::new(
                    stage,
                    self.executor.project_id(),
                    json!({ "stage": stage.as_str(), "phase": "produce" }),
                )
                .with_iteration(iteration);
                let output = self
                    .call_with_retry(stage, producer_role, context)
                    .await?;
                self.record_output(stage, output).await;
                if self.state().signal_set(done_signal).await {
                    break;
                }

                let context = StageContext::new(
                    stage,
                    self.executor.project_id(),
                    json!({ "stage": stage.as_str(), "phase": "revise" }),
                )
                .with_iteration(iteration);
                let feedback = self
                    .call_with_retry(stage, corrective_role, context)
                    .await?;
                self.record_output(stage, feedback).await;
                if self.state().signal_set(done_signal).await {
                    break;
                }
            }
            Ok(iterations)
        };
        let iterations = self.supervised(stage, work).await?;
        if self.state().signal_set(done_signal).await {
            info!(stage = %stage, iterations, "Revise loop accepted");
        } else {
            warn!(stage = %stage, iterations, "Revise loop budget exhausted");
        }

        self.executor.complete_stage(stage).await?;
        self.record_timing(stage, started).await;
        let metadata = HashMap::from([("iterations".to_string(), json!(iterations))]);
        self.save_checkpoint("stage_boundary", metadata).await;
        Ok(())
    }

    /// Race stage work against interval checkpointing and cancellation.
    async fn supervised<T>(
        &self,
        stage: Stage,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(work);
        let mut interval = tokio::time::interval(self.config.checkpoint_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = interval.tick() => {
                    self.save_checkpoint("interval", HashMap::new()).await;
                }
                _ = self.cancel.cancelled() => {
                    return Err(ForemanError::cancelled(stage.as_str()));
                }
            }
        }
    }

    async fn call_with_retry(
        &self,
        stage: Stage,
        role: AgentRole,
        context: StageContext,
    ) -> Result<Value> {
        let operation = format!("{}:{}", stage, role);
        self.config
            .retry
            .execute(&operation, &self.cancel, |_attempt| {
                let context = context.clone();
                async move { self.executor.call_agent(role, context).await }
            })
            .await
    }

    /// Record an agent's output under the stage key, and merge top-level
    /// object fields into the design map so done signals become visible.
    async fn record_output(&self, stage: Stage, output: Value) {
        self.state()
            .set_output(StateSection::Design, stage.as_str(), output.clone())
            .await;
        if let Value::Object(fields) = output {
            for (key, value) in fields {
                self.state()
                    .set_output(StateSection::Design, &key, value)
                    .await;
            }
        }
    }

    async fn already_completed(&self, stage: Stage) -> bool {
        self.executor.stage_history().await.contains(&stage)
    }

    async fn record_timing(&self, stage: Stage, started: Instant) {
        self.timings
            .write()
            .await
            .insert(stage, started.elapsed().as_millis() as u64);
    }

    /// Failure teardown: record the cause, flip to `Failed`, announce it,
    /// and force a final checkpoint carrying the cause.
    async fn fail(&self, cause: ForemanError) {
        let cancelled =
            self.cancel.is_cancelled() || matches!(cause, ForemanError::Cancelled { .. });
        let message = cause.to_string();
        error!(error = %message, cancelled, "Pipeline failed");
        self.errors.write().await.push(message.clone());
        self.state().advance_stage(Stage::Failed).await;

        if let Err(e) = self
            .bus()
            .publish(Message::new(
                MessageType::ErrorReport,
                SENDER,
                json!({ "error": message, "cancelled": cancelled }),
            ))
            .await
        {
            warn!(error = %e, "Failed to publish error report");
        }

        let metadata = HashMap::from([
            ("error".to_string(), json!(message)),
            ("cancelled".to_string(), json!(cancelled)),
        ]);
        self.save_checkpoint("failure", metadata).await;
    }

    /// Best-effort checkpoint: an I/O failure is logged, never propagated.
    async fn save_checkpoint(&self, kind: &str, mut metadata: HashMap<String, Value>) {
        metadata.insert("kind".to_string(), json!(kind));
        let current_stage = self.state().current_stage().await;
        let stage_history = self.executor.stage_history().await;
        let snapshot = self.state().snapshot().await;
        if let Err(e) = self
            .checkpoints
            .save(current_stage, stage_history, snapshot, metadata)
            .await
        {
            warn!(error = %e, kind, "Checkpoint save failed; continuing");
        }
    }
}

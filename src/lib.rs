// Core infrastructure modules
pub mod core {
    pub mod cancel;
    pub mod errors;
}

// Engine components, leaves first
pub mod bus; // topic-based pub/sub with history
pub mod state; // pipeline state machine
pub mod agent; // external collaborator contract
pub mod cache; // content-keyed result cache
pub mod checkpoint; // durable snapshots
pub mod retry; // bounded exponential backoff

// Execution layers
pub mod executor; // fixed-order base stage executor
pub mod orchestrator; // parallel/iterative composition root

// Re-exports for convenience
pub use core::cancel::CancelToken;
pub use core::errors::{ForemanError, Result};

pub use agent::{Agent, AgentOutcome, AgentRegistry, AgentRole, StageContext};
pub use bus::{HistoryFilter, Message, MessageBus, MessageType, SubscriptionId};
pub use cache::{CacheStats, ResultCache, ResultCacheConfig};
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore};
pub use executor::StageExecutor;
pub use orchestrator::registry::OrchestratorRegistry;
pub use orchestrator::{Orchestrator, OrchestratorConfig, Progress};
pub use retry::RetryPolicy;
pub use state::{
    PipelineState, SharedState, Stage, StateSection, Task, TaskStatus, TaskUpdate,
};

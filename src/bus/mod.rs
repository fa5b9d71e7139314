//! Topic-based publish/subscribe message bus with a history log.
//!
//! Routing is driven entirely by the message's tagged type and addressing
//! fields; content is never inspected. Fan-out for a single publish runs
//! handlers sequentially inside the publishing call; there are no hidden
//! background workers. Handler failures are logged and isolated so one
//! faulty observer cannot break the pipeline.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::errors::Result;

/// Tagged message kinds. Handling is decided by this enum at construction
/// time, never by sniffing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssigned,
    StageStart,
    StageComplete,
    WorkflowComplete,
    StatusUpdate,
    ErrorReport,
    FeedbackRequest,
    FeedbackResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskAssigned => "task_assigned",
            MessageType::StageStart => "stage_start",
            MessageType::StageComplete => "stage_complete",
            MessageType::WorkflowComplete => "workflow_complete",
            MessageType::StatusUpdate => "status_update",
            MessageType::ErrorReport => "error_report",
            MessageType::FeedbackRequest => "feedback_request",
            MessageType::FeedbackResponse => "feedback_response",
        }
    }

    pub fn topic(&self) -> String {
        format!("type:{}", self.as_str())
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bus message. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: MessageType,
    pub sender: String,
    pub receiver: Option<String>,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new<S: Into<String>>(message_type: MessageType, sender: S, content: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            sender: sender.into(),
            receiver: None,
            content,
            timestamp: Utc::now(),
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_receiver<R: Into<String>>(mut self, receiver: R) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_correlation_id<C: Into<String>>(mut self, correlation_id: C) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Topic set this message fans out to, in canonical order.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = vec![
            self.message_type.topic(),
            format!("sender:{}", self.sender),
        ];
        if let Some(receiver) = &self.receiver {
            topics.push(format!("receiver:{}", receiver));
        }
        topics.push("*".to_string());
        topics
    }
}

/// Handle returned by `subscribe`, required for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Filters applied by `history()`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub message_type: Option<MessageType>,
}

impl HistoryFilter {
    fn matches(&self, message: &Message) -> bool {
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(receiver) = &self.receiver {
            if message.receiver.as_deref() != Some(receiver.as_str()) {
                return false;
            }
        }
        if let Some(message_type) = self.message_type {
            if message.message_type != message_type {
                return false;
            }
        }
        true
    }
}

/// The bus. Publish calls may arrive concurrently from parallel stages;
/// the history log keeps global publish order via single-writer append.
#[derive(Default)]
pub struct MessageBus {
    subscriptions: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    history: RwLock<Vec<Message>>,
    published: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler on a topic.
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        let handler: Handler = Arc::new(move |message| Box::pin(handler(message)));
        self.subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        debug!(topic = topic, "Registered subscription");
        id
    }

    /// Remove a subscription. Returns whether anything was removed.
    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(handlers) = subscriptions.get_mut(topic) {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            let removed = handlers.len() < before;
            if handlers.is_empty() {
                subscriptions.remove(topic);
            }
            return removed;
        }
        false
    }

    /// Publish a message: append to history, then fan out to every handler
    /// subscribed on any of the message's topics, each exactly once, in
    /// subscription order. Handler errors are logged and swallowed.
    pub async fn publish(&self, message: Message) -> Result<Uuid> {
        let message_id = message.id;
        let topics = message.topics();

        self.history.write().await.push(message.clone());
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching handlers before awaiting any of them, deduped
        // across topics so multi-topic subscribers run once per message.
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let subscriptions = self.subscriptions.read().await;
            let mut seen = HashSet::new();
            let mut matched = Vec::new();
            for topic in &topics {
                if let Some(entries) = subscriptions.get(topic) {
                    for (id, handler) in entries {
                        if seen.insert(*id) {
                            matched.push((*id, handler.clone()));
                        }
                    }
                }
            }
            matched
        };

        debug!(
            message_id = %message_id,
            message_type = %message.message_type,
            sender = %message.sender,
            handlers = handlers.len(),
            "Publishing message"
        );

        for (id, handler) in handlers {
            if let Err(e) = handler(message.clone()).await {
                warn!(
                    message_id = %message_id,
                    subscription = ?id,
                    error = %e,
                    "Message handler failed; continuing fan-out"
                );
            }
        }

        Ok(message_id)
    }

    /// Filtered tail of the history log, preserving publish order.
    pub async fn history(&self, filter: &HistoryFilter, limit: Option<usize>) -> Vec<Message> {
        let history = self.history.read().await;
        let matched: Vec<Message> = history
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        match limit {
            Some(n) if matched.len() > n => matched[matched.len() - n..].to_vec(),
            _ => matched,
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

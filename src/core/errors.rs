use thiserror::Error;

/// Unified error type for the foreman engine.
///
/// Every failure surfaced by the orchestration core is one of these
/// variants. `category()` feeds the retry policy's classification and
/// `is_retryable()` gives the built-in default split between transient
/// and permanent failures.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// Execution-related errors inside an engine component
    #[error("Execution failed in {component}: {message}")]
    Execution {
        component: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stage-level failures
    #[error("Stage error: {stage} - {message}")]
    Stage { stage: String, message: String },

    /// Agent-reported failures
    #[error("Agent error: {role} - {message}")]
    Agent { role: String, message: String },

    /// Upstream/backend failures (server errors behind an agent call)
    #[error("Upstream error from {service}: {message}")]
    Upstream { service: String, message: String },

    /// Rate limiting signalled by an external collaborator
    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Filesystem/IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Cooperative cancellation
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ForemanError {
    pub fn execution<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn execution_with_source<C, M, E>(component: C, message: M, source: E) -> Self
    where
        C: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn stage<S: Into<String>, M: Into<String>>(stage: S, message: M) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn agent<R: Into<String>, M: Into<String>>(role: R, message: M) -> Self {
        Self::Agent {
            role: role.into(),
            message: message.into(),
        }
    }

    pub fn upstream<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn rate_limited<M: Into<String>>(message: M) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<M: Into<String>, F: Into<String>>(message: M, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn configuration<M: Into<String>>(message: M) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io<O: Into<String>>(operation: O, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<F, E>(format: F, source: E) -> Self
    where
        F: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn timeout<O: Into<String>>(operation: O, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<O: Into<String>>(operation: O) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    pub fn cancelled_with_reason<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Default transient/permanent split used by the retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Upstream { .. } => true,
            Self::Io { .. } => true,
            Self::Validation { .. } | Self::Configuration { .. } => false,
            Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Error category for retry classification and logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "execution",
            Self::Stage { .. } => "stage",
            Self::Agent { .. } => "agent",
            Self::Upstream { .. } => "upstream",
            Self::RateLimited { .. } => "rate_limit",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ForemanError>;

impl From<std::io::Error> for ForemanError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ForemanError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<anyhow::Error> for ForemanError {
    fn from(err: anyhow::Error) -> Self {
        // Agent calls cross an anyhow boundary; keep the original category
        // visible to retry classification when the inner error is ours.
        match err.downcast::<ForemanError>() {
            Ok(inner) => inner,
            Err(other) => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ForemanError::execution("bus", "publish failed");
        assert!(matches!(err, ForemanError::Execution { .. }));
        assert_eq!(err.category(), "execution");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(ForemanError::timeout("agent_call", 1000).is_retryable());
        assert!(ForemanError::rate_limited("429").is_retryable());
        assert!(ForemanError::upstream("backend", "500").is_retryable());
        assert!(!ForemanError::validation("bad input").is_retryable());
        assert!(!ForemanError::cancelled("stage").is_retryable());
    }

    #[test]
    fn test_anyhow_roundtrip_preserves_category() {
        let err: anyhow::Error = ForemanError::timeout("agent_call", 50).into();
        let back: ForemanError = err.into();
        assert_eq!(back.category(), "timeout");

        let plain: anyhow::Error = anyhow::anyhow!("something odd");
        let back: ForemanError = plain.into();
        assert_eq!(back.category(), "internal");
    }
}

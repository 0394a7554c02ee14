use crate::transport::TransportError;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "retry.max_delay").
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_validator", "dispatcher")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the client core.
///
/// Every request handle resolves with either a response or exactly one of these.
/// Transient categories (`Network`, `RateLimited`, `Server`, `Timeout`, `PoolTimeout`)
/// are retried locally before they are surfaced.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network transport error: {0}")]
    Network(#[from] TransportError),

    #[error("Rate limited on {route}{}", format_retry_after(.retry_after_ms, .global))]
    RateLimited {
        route: String,
        retry_after_ms: Option<u64>,
        global: bool,
    },

    #[error("Server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Client error: HTTP {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Circuit open for {key} (retry in {retry_in_ms}ms)")]
    CircuitOpen { key: String, retry_in_ms: u64 },

    #[error("Request queue full ({queue_size} items)")]
    QueueFull { queue_size: usize },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("No connection to {host} available within {waited_ms}ms")]
    PoolTimeout { host: String, waited_ms: u64 },

    #[error("Request cancelled before dispatch")]
    Cancelled,

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_retry_after(retry_after_ms: &Option<u64>, global: &bool) -> String {
    let scope = if *global { " (global)" } else { "" };
    match retry_after_ms {
        Some(ms) => format!("{scope}, retry after {ms}ms"),
        None => scope.to_string(),
    }
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// HTTP status associated with the error, if the remote answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::RateLimited { .. } => Some(429),
            Error::Server { status, .. } | Error::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error belongs to a transient class.
    ///
    /// This is classification only; whether a retry actually happens is decided by
    /// [`crate::resilience::retry::RetryPolicy`].
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::RateLimited { .. }
                | Error::Server { .. }
                | Error::Timeout { .. }
                | Error::PoolTimeout { .. }
        )
    }

    /// Server-provided delay carried by a 429.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}

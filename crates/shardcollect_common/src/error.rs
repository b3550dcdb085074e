use thiserror::Error;

use crate::types::{IndexName, ShardId};

/// Convenience alias for `Result<T, CollectError>`.
pub type CollectResult<T> = Result<T, CollectError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`        : bad input or invalid request shape
/// - `ResourceExhausted`: query memory ceiling breached; reduce the limit or add a filter
/// - `Transient`        : shard briefly unavailable (relocation race); re-resolved in place
/// - `Fatal`            : a source the result depends on is gone; must not be retried
/// - `InternalBug`      : protocol misuse or invariant violation; should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    ResourceExhausted,
    Transient,
    Fatal,
    InternalBug,
}

/// Top-level error type of the collect layer.
#[derive(Error, Debug, Clone)]
pub enum CollectError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// The per-query memory ceiling was crossed.
    #[error("[{label}] Data too large, data would be [{used_bytes}] bytes, which is larger than the limit of [{limit_bytes}] bytes")]
    CircuitBreaking {
        label: String,
        used_bytes: u64,
        limit_bytes: u64,
    },

    /// A non-droppable shard could not be opened. The global result would
    /// silently miss its rows, so the whole phase fails.
    #[error("Required source {shard} is missing: {cause}")]
    RequiredSourceMissing {
        shard: ShardId,
        #[source]
        cause: SourceError,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal bug: should never occur on a valid call sequence.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Reasons a shard-backed source cannot be opened or read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The shard is not (or no longer) allocated on this node.
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    /// The whole index is gone (e.g. a partition was dropped).
    #[error("Index not found: {0}")]
    IndexNotFound(IndexName),

    /// The shard exists but is in a state that cannot serve reads
    /// (relocating, recovering, closing).
    #[error("Shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: ShardId, reason: String },

    /// The source failed while producing rows.
    #[error("Shard {shard} failed: {reason}")]
    Failed { shard: ShardId, reason: String },
}

impl SourceError {
    /// Missing-source conditions: the source is absent, not broken.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            SourceError::ShardNotFound(_)
                | SourceError::IndexNotFound(_)
                | SourceError::ShardUnavailable { .. }
        )
    }
}

impl CollectError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollectError::InvalidArgument(_) => ErrorKind::UserError,
            CollectError::CircuitBreaking { .. } => ErrorKind::ResourceExhausted,
            CollectError::Source(SourceError::ShardNotFound(_)) => ErrorKind::Fatal,
            CollectError::Source(SourceError::IndexNotFound(_)) => ErrorKind::Fatal,
            CollectError::Source(SourceError::ShardUnavailable { .. }) => ErrorKind::Transient,
            CollectError::RequiredSourceMissing { .. } => ErrorKind::Fatal,
            CollectError::Source(SourceError::Failed { .. }) => ErrorKind::InternalBug,
            CollectError::Execution(_) => ErrorKind::InternalBug,
            CollectError::Internal(_) => ErrorKind::InternalBug,
            CollectError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceExhausted)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// True when the error means "the source is not there", as opposed to a
    /// query-fatal fault while reading it.
    pub fn is_missing_source(&self) -> bool {
        matches!(self, CollectError::Source(e) if e.is_missing())
    }

    /// Missing because of a topology race; worth re-resolving once.
    pub fn is_transient_missing(&self) -> bool {
        matches!(self, CollectError::Source(SourceError::ShardUnavailable { .. }))
    }

    /// The missing-source condition behind a fatal required-source failure.
    pub fn missing_cause(&self) -> Option<&SourceError> {
        match self {
            CollectError::RequiredSourceMissing { cause, .. } => Some(cause),
            CollectError::Source(e) if e.is_missing() => Some(e),
            _ => None,
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        CollectError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Error returned by any operation on an iterator that was closed
    /// (explicitly or by a failed load).
    pub fn closed(what: &str) -> Self {
        CollectError::internal_bug("E-ITER-CLOSED", format!("{what} is closed"), "")
    }

    /// Add context string to an error, **preserving error classification**.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            CollectError::Internal(msg) => CollectError::Internal(format!("{ctx}: {msg}")),
            CollectError::Execution(msg) => CollectError::Execution(format!("{ctx}: {msg}")),
            CollectError::InternalBug {
                error_code,
                message,
                debug_context,
            } => CollectError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            other => other,
        }
    }
}

use serde::Serialize;
use std::fmt;

/// Reconciler error types.
///
/// Only [`ReconcileError::Configuration`] is fatal. Every other variant is
/// captured at the smallest unit of work (one column, one table) and folded
/// into the report of the operation that produced it.
#[derive(Debug)]
pub enum ReconcileError {
    /// Missing or malformed binding input. Halts before any remote call.
    Configuration(String),
    /// Transport or authentication failure talking to the data store.
    Connectivity(String),
    /// The store understood the request but refused it.
    Rejected(String),
    /// A generated change statement was rejected by the store.
    SchemaConflict {
        /// The statement that failed.
        statement: String,
        /// Message returned by the store.
        message: String,
    },
    /// The run was cancelled before this unit of work started.
    Cancelled,
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<ReconcileError>,
        /// Additional context message.
        context: String,
    },
}

impl ReconcileError {
    /// True for errors that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconcileError::Configuration(_) => true,
            ReconcileError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// The innermost error, with context layers stripped.
    pub fn root(&self) -> &ReconcileError {
        match self {
            ReconcileError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short machine-readable category used in reports.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            ReconcileError::Configuration(_) => ErrorKind::Configuration,
            ReconcileError::Connectivity(_) => ErrorKind::Connectivity,
            ReconcileError::Rejected(_) => ErrorKind::Rejected,
            ReconcileError::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            ReconcileError::Cancelled => ErrorKind::Cancelled,
            ReconcileError::WithContext { .. } => unreachable!("root() strips context"),
        }
    }
}

impl fmt::Display for ReconcileError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ReconcileError::Connectivity(msg) => write!(f, "Connectivity error: {}", msg),
            ReconcileError::Rejected(msg) => write!(f, "Rejected by store: {}", msg),
            ReconcileError::SchemaConflict { statement, message } => {
                write!(f, "Schema conflict: {} (statement: {})", message, statement)
            }
            ReconcileError::Cancelled => write!(f, "Cancelled"),
            ReconcileError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for ReconcileError {}

/// Report-friendly error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Rejected,
    SchemaConflict,
    Cancelled,
}

/// A captured, non-fatal error as it appears in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ReconcileError> for ReportedError {
    fn from(err: &ReconcileError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ReconcileError> for ReportedError {
    fn from(err: ReconcileError) -> Self {
        ReportedError::from(&err)
    }
}

impl fmt::Display for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<sqlx::Error> for ReconcileError {
    /// Pool and I/O failures are connectivity problems; anything the server
    /// answered with is a rejection.
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => ReconcileError::Connectivity(err.to_string()),
            sqlx::Error::Database(db) => ReconcileError::Rejected(db.message().to_string()),
            other => ReconcileError::Rejected(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ReconcileError {
    /// Converts a `reqwest::Error` into a `ReconcileError`.
    fn from(err: reqwest::Error) -> Self {
        ReconcileError::Connectivity(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `ReconcileError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, ReconcileError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, ReconcileError> {
    fn context(self, context: impl Into<String>) -> Result<T, ReconcileError> {
        self.map_err(|e| ReconcileError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ReconcileError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, ReconcileError> {
        self.map_err(|e| ReconcileError::WithContext {
            source: Box::new(ReconcileError::from(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ReconcileError::WithContext {
            source: Box::new(ReconcileError::from(e)),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(ReconcileError::Configuration("x".into()).is_fatal());
        assert!(!ReconcileError::Connectivity("x".into()).is_fatal());
        assert!(!ReconcileError::Rejected("x".into()).is_fatal());

        let wrapped: Result<(), _> = Err(ReconcileError::Configuration("missing".into()));
        let wrapped = wrapped.context("resolving target").unwrap_err();
        assert!(wrapped.is_fatal());
        assert_eq!(wrapped.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_context_chain_display() {
        let err: Result<(), _> = Err(ReconcileError::Connectivity("timed out".into()));
        let err = err.with_context(|| "selecting from patients".to_string()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "selecting from patients: Connectivity error: timed out"
        );
        assert_eq!(ReportedError::from(&err).kind, ErrorKind::Connectivity);
    }
}

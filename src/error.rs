use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for kgrag
#[derive(Error, Debug)]
pub enum KgragError {
    /// Relational source could not be opened or its catalog could not be listed
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Graph store write failed after all retries
    #[error("Graph build failed on table '{table}' (batch {batch}): {message}")]
    GraphBuildFailed {
        table: String,
        batch: usize,
        message: String,
    },

    /// Embedding or vector index construction failed
    #[error("Index build failed: {0}")]
    IndexBuildFailed(String),

    /// Malformed tool arguments or traversal expression
    #[error("Invalid query: {0}")]
    QueryInvalid(String),

    /// LLM planning call did not answer in time
    #[error("Planning timed out after {0}s")]
    PlanningTimeout(u64),

    /// LLM planning produced an unusable decision
    #[error("Invalid planning decision: {0}")]
    PlanningInvalid(String),

    /// Agent loop hit its iteration bound
    #[error("Iteration budget of {0} exceeded")]
    IterationBudgetExceeded(usize),

    /// Graph and vector index are not both built and consistent
    #[error("Knowledge graph not ready: {0}")]
    NotReady(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding API errors
    #[error("Embedding API error: {0}")]
    Embedding(String),

    /// LLM completion errors
    #[error("LLM error: {0}")]
    Llm(String),
}

impl KgragError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            KgragError::SourceUnavailable(_) => "source_unavailable",
            KgragError::GraphBuildFailed { .. } => "graph_build_failed",
            KgragError::IndexBuildFailed(_) => "index_build_failed",
            KgragError::QueryInvalid(_) => "query_invalid",
            KgragError::PlanningTimeout(_) => "planning_timeout",
            KgragError::PlanningInvalid(_) => "planning_invalid",
            KgragError::IterationBudgetExceeded(_) => "iteration_budget_exceeded",
            KgragError::NotReady(_) => "not_ready",
            KgragError::Database(_) => "database",
            KgragError::Io(_) => "io",
            KgragError::Serialization(_) => "serialization",
            KgragError::Config(_) => "config",
            KgragError::Embedding(_) => "embedding",
            KgragError::Llm(_) => "llm",
        }
    }

    /// Errors that stay inside the agent loop as observations.
    pub fn is_recoverable_in_loop(&self) -> bool {
        matches!(self, KgragError::QueryInvalid(_))
    }
}

/// Serializable summary of an error for responses and health reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&KgragError> for ErrorInfo {
    fn from(err: &KgragError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Convenient Result type using KgragError
pub type Result<T> = std::result::Result<T, KgragError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KgragError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: KgragError = rusqlite_err.into();
        assert!(matches!(err, KgragError::Database(_)));
        assert_eq!(err.kind(), "database");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KgragError = io_err.into();
        assert!(matches!(err, KgragError::Io(_)));
    }

    #[test]
    fn test_graph_build_failed_names_table_and_batch() {
        let err = KgragError::GraphBuildFailed {
            table: "orders".to_string(),
            batch: 3,
            message: "disk full".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("orders"));
        assert!(text.contains("batch 3"));
        assert_eq!(err.kind(), "graph_build_failed");
    }

    #[test]
    fn test_error_info() {
        let info = ErrorInfo::from(&KgragError::NotReady("no graph".into()));
        assert_eq!(info.kind, "not_ready");
        assert!(info.message.contains("no graph"));
    }

    #[test]
    fn test_only_query_invalid_is_recoverable() {
        assert!(KgragError::QueryInvalid("x".into()).is_recoverable_in_loop());
        assert!(!KgragError::PlanningInvalid("x".into()).is_recoverable_in_loop());
        assert!(!KgragError::NotReady("x".into()).is_recoverable_in_loop());
    }
}

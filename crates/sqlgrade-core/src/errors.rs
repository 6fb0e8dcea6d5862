//! Error taxonomy for the grading pipeline.
//!
//! Two audiences: candidate-caused failures (syntax, semantics, disallowed
//! statements, timeouts, oversized results) are shown to the learner with a
//! sanitized message; platform failures (datasets, provisioning, storage,
//! engine crashes) are logged as incidents and surfaced generically.

use crate::model::{ErrorKind, GradingOutcome};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DatasetError {
    #[error("schema mismatch in table '{table}', column '{column}': {reason}")]
    SchemaMismatch {
        table: String,
        column: String,
        reason: String,
    },
    #[error("duplicate table name '{table}'")]
    DuplicateTable { table: String },
    #[error("duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },
    #[error("dataset for table '{table}' not found")]
    NotFound { table: String },
    #[error("dataset for table '{table}' changed since authoring (expected etag {expected})")]
    Stale { table: String, expected: String },
    #[error("dataset for table '{table}' is unreadable: {reason}")]
    Unreadable { table: String, reason: String },
    #[error("dataset for table '{table}' is too large: {reason}")]
    TooLarge { table: String, reason: String },
    #[error("object storage unavailable: {reason}")]
    Storage { reason: String },
    #[error("dataset fetch timed out after {timeout_ms}ms")]
    FetchTimeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    RowsPerTable,
    TotalBytes,
    TableCount,
    ResultRows,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitKind::RowsPerTable => "max_rows_per_table",
            LimitKind::TotalBytes => "max_total_bytes",
            LimitKind::TableCount => "max_tables",
            LimitKind::ResultRows => "max_result_rows",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    #[error("resource limit {} exceeded{}: observed {observed}, allowed {allowed}", .limit.as_str(), .table.as_ref().map(|t| format!(" by table '{t}'")).unwrap_or_default())]
    ResourceExceeded {
        limit: LimitKind,
        table: Option<String>,
        observed: u64,
        allowed: u64,
    },
    #[error("loading fixtures timed out after {timeout_ms}ms")]
    LoadTimeout { timeout_ms: u64 },
    #[error("sandbox engine error: {0}")]
    Engine(String),
}

/// Everything that can go wrong while running one statement in a sandbox.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("only a single SQL statement is allowed")]
    MultiStatementRejected,
    #[error("only read-only queries are allowed ({keyword} is not permitted)")]
    DisallowedStatement { keyword: String },
    #[error("query is empty")]
    Empty,
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{0}")]
    Semantic(String),
    #[error("query failed: {0}")]
    Other(String),
    #[error("query exceeded the time limit of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("query returned more than {cap} rows")]
    ResultRowsExceeded { cap: usize },
    #[error("sandbox failure: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::MultiStatementRejected => ErrorKind::MultiStatementRejected,
            ExecutionError::DisallowedStatement { .. } => ErrorKind::DisallowedStatement,
            ExecutionError::Empty | ExecutionError::Syntax(_) => ErrorKind::SyntaxError,
            ExecutionError::Semantic(_) => ErrorKind::SemanticError,
            ExecutionError::Other(_) => ErrorKind::Other,
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::ResultRowsExceeded { .. } => ErrorKind::ResourceExceeded,
            ExecutionError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn outcome(&self) -> GradingOutcome {
        match self {
            ExecutionError::Timeout { .. } => GradingOutcome::Timeout,
            ExecutionError::ResultRowsExceeded { .. } => GradingOutcome::ResourceExceeded,
            ExecutionError::Internal(_) => GradingOutcome::InternalError,
            _ => GradingOutcome::RuntimeError,
        }
    }

    pub fn is_candidate_fault(&self) -> bool {
        !matches!(self, ExecutionError::Internal(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object {bucket}/{key} does not match etag {etag}")]
    PreconditionFailed {
        bucket: String,
        key: String,
        etag: String,
    },
    #[error("object {bucket}/{key} exceeds {max} bytes")]
    TooLarge { bucket: String, key: String, max: u64 },
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store io: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Errors returned instead of a `GradingResult`: nothing was graded or persisted.
#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("problem '{0}' not found")]
    ProblemNotFound(String),
    #[error("rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("too many concurrent attempts for this user (max {max})")]
    TooManyConcurrent { max: usize },
    #[error("submission id '{0}' was already used for a different submission")]
    SubmissionConflict(String),
    #[error("invalid problem definition: {0}")]
    InvalidProblem(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GradeError {
    pub fn code(&self) -> &'static str {
        match self {
            GradeError::ProblemNotFound(_) => "E_PROBLEM_NOT_FOUND",
            GradeError::RateLimited { .. } => "E_RATE_LIMITED",
            GradeError::TooManyConcurrent { .. } => "E_TOO_MANY_CONCURRENT",
            GradeError::SubmissionConflict(_) => "E_SUBMISSION_CONFLICT",
            GradeError::InvalidProblem(_) => "E_INVALID_PROBLEM",
            GradeError::Other(_) => "E_INTERNAL",
        }
    }
}

/// Failure of one pipeline stage, as seen by the orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("attempt exceeded the overall deadline of {timeout_ms}ms")]
    AttemptTimeout { timeout_ms: u64 },
    #[error("reference solution failed: {0}")]
    Reference(String),
}

impl StageError {
    pub fn is_platform_incident(&self) -> bool {
        match self {
            StageError::Execution(e) => !e.is_candidate_fault(),
            StageError::AttemptTimeout { .. } => false,
            StageError::Dataset(_) | StageError::Provision(_) | StageError::Reference(_) => true,
        }
    }
}

pub const GENERIC_PLATFORM_MESSAGE: &str =
    "The grader could not evaluate this attempt due to a platform problem. Please try again later.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_classification() {
        assert_eq!(
            ExecutionError::MultiStatementRejected.kind(),
            ErrorKind::MultiStatementRejected
        );
        assert_eq!(
            ExecutionError::Timeout { timeout_ms: 10 }.outcome(),
            GradingOutcome::Timeout
        );
        assert_eq!(
            ExecutionError::ResultRowsExceeded { cap: 5 }.outcome(),
            GradingOutcome::ResourceExceeded
        );
        assert!(!ExecutionError::Internal("boom".into()).is_candidate_fault());
        assert!(ExecutionError::Semantic("no such table: x".into()).is_candidate_fault());
    }

    #[test]
    fn test_incident_split() {
        let dataset: StageError = DatasetError::Storage {
            reason: "down".into(),
        }
        .into();
        assert!(dataset.is_platform_incident());

        let candidate: StageError = ExecutionError::Syntax("near SELEC".into()).into();
        assert!(!candidate.is_platform_incident());
    }

    #[test]
    fn test_resource_exceeded_display() {
        let err = ProvisionError::ResourceExceeded {
            limit: LimitKind::RowsPerTable,
            table: Some("orders".into()),
            observed: 11,
            allowed: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("max_rows_per_table"));
        assert!(msg.contains("orders"));
        assert!(msg.contains("11"));
    }
}

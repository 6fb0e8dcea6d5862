use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An authored SQL problem. Immutable for the duration of a grading attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub tables: Vec<TableDef>,
    pub expected_output: ExpectedOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonPolicy>,
    #[serde(default, skip_serializing_if = "LimitOverrides::is_empty")]
    pub limits: LimitOverrides,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ProblemSpec {
    pub fn remote_refs(&self) -> impl Iterator<Item = (&TableDef, &ObjectRef)> {
        self.tables.iter().filter_map(|t| match &t.source {
            TableSource::Remote(r) => Some((t, r)),
            TableSource::Inline { .. } => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    pub source: TableSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[serde(alias = "int", alias = "bigint")]
    Integer,
    #[serde(alias = "double", alias = "real", alias = "decimal")]
    Float,
    #[serde(alias = "string", alias = "varchar")]
    Text,
    #[serde(alias = "bool")]
    Boolean,
    Date,
    Timestamp,
}

impl ColumnType {
    /// Storage affinity used when the table is created inside a sandbox.
    pub fn sql_affinity(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text | ColumnType::Date | ColumnType::Timestamp => "TEXT",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSource {
    Inline { rows: Vec<InlineRow> },
    Remote(ObjectRef),
}

/// Inline fixture rows are either positional or keyed by column name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InlineRow {
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            table_name_hint: None,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_table_name_hint(mut self, hint: impl Into<String>) -> Self {
        self.table_name_hint = Some(hint.into());
        self
    }

    pub fn is_sql(&self) -> bool {
        self.key.to_ascii_lowercase().ends_with(".sql")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutput {
    Literal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
        rows: Vec<BTreeMap<String, Value>>,
    },
    ReferenceSolution(ObjectRef),
}

impl ExpectedOutput {
    /// Materializes a literal expectation. Column order is the explicit list when
    /// given, otherwise first appearance across rows.
    pub fn literal_result_set(&self) -> Option<ResultSet> {
        let ExpectedOutput::Literal { columns, rows } = self else {
            return None;
        };

        let columns = match columns {
            Some(c) => c.clone(),
            None => {
                let mut seen: Vec<String> = Vec::new();
                for row in rows {
                    for k in row.keys() {
                        if !seen.contains(k) {
                            seen.push(k.clone());
                        }
                    }
                }
                seen
            }
        };

        let rows = rows
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Some(ResultSet { columns, rows })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonPolicy {
    pub row_order_sensitive: bool,
    pub float_tolerance: f64,
    pub case_sensitive_strings: bool,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        Self {
            row_order_sensitive: false,
            float_tolerance: 1e-6,
            case_sensitive_strings: true,
        }
    }
}

/// Problem-specific tuning on top of the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows_per_table: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tables: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_result_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timeout_ms: Option<u64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self == &LimitOverrides::default()
    }
}

/// A single cell. Serializes as a bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Rough in-memory footprint used for sandbox byte accounting.
    pub fn byte_estimate(&self) -> u64 {
        match self {
            Value::Null => 1,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len() as u64 + 8,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Ordered columns plus rows produced by a query or materialized from ground truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn preview(&self, limit: usize) -> Vec<Vec<Value>> {
        self.rows.iter().take(limit).cloned().collect()
    }
}

/// Identity of whoever asked for the grading work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GradingOutcome {
    Correct,
    Incorrect,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

impl GradingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GradingOutcome::Correct => "correct",
            GradingOutcome::Incorrect => "incorrect",
            GradingOutcome::RuntimeError => "runtime_error",
            GradingOutcome::Timeout => "timeout",
            GradingOutcome::ResourceExceeded => "resource_exceeded",
            GradingOutcome::InternalError => "internal_error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "correct" => GradingOutcome::Correct,
            "incorrect" => GradingOutcome::Incorrect,
            "runtime_error" => GradingOutcome::RuntimeError,
            "timeout" => GradingOutcome::Timeout,
            "resource_exceeded" => GradingOutcome::ResourceExceeded,
            _ => GradingOutcome::InternalError,
        }
    }
}

/// Finer classification carried next to the outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaMismatch,
    ProvisionError,
    ResourceExceeded,
    MultiStatementRejected,
    DisallowedStatement,
    SyntaxError,
    SemanticError,
    Timeout,
    Other,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    pub problem_id: String,
    pub outcome: GradingOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub candidate_columns: Vec<String>,
    pub candidate_preview: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_message: Option<String>,
    pub execution_time_ms: u64,
}

impl GradingResult {
    pub fn failed(
        problem_id: &str,
        outcome: GradingOutcome,
        kind: ErrorKind,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            submission_id: None,
            problem_id: problem_id.to_string(),
            outcome,
            error_kind: Some(kind),
            candidate_columns: Vec::new(),
            candidate_preview: Vec::new(),
            diagnostic_message: Some(message.into()),
            execution_time_ms,
        }
    }

    pub fn is_correct(&self) -> bool {
        self.outcome == GradingOutcome::Correct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Output of a test run: raw candidate output, never compared against ground truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRunResult {
    pub problem_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

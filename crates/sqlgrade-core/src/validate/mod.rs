//! Author-facing checks: dataset validation and problem self-checks.
//!
//! Validation reads the Parquet footer and at most the first non-empty row
//! group, so it stays cheap on very large objects. Unlike grading, a batch
//! reports every table even when some of them fail.

use crate::config::problem::validate_problem;
use crate::config::{EngineConfig, ValidationConfig};
use crate::dataset::parquet::{
    first_row_group_ranges, metadata_len, sample_row_group, schema_of, SparseObject, FOOTER_LEN,
};
use crate::dataset::{ReferenceSolution, Resolver};
use crate::engine;
use crate::errors::StorageError;
use crate::model::{ColumnDef, ExpectedOutput, ObjectRef, ProblemSpec, ResultSet, Value};
use crate::redaction::Redactor;
use crate::sandbox::SandboxSession;
use crate::storage::object_store::normalize_etag;
use crate::storage::ObjectStore;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// First read from the end of the object; usually covers the whole footer.
const TAIL_PROBE: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("etag mismatch: problem pins {expected}, object is now {actual}")]
    Stale { expected: String, actual: String },
    #[error("not a readable parquet file: {0}")]
    Unreadable(String),
    #[error("validation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size_bytes: u64,
    pub schema: Vec<ColumnDef>,
    pub row_count: u64,
    pub row_groups: usize,
    pub sample_rows: Vec<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_skipped: Option<String>,
    /// Bytes actually transferred from the store.
    pub bytes_read: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableValidation {
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name_hint: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiTableReport {
    pub ok: bool,
    pub tables: Vec<TableValidation>,
}

pub struct DatasetValidator {
    store: Arc<dyn ObjectStore>,
    cfg: ValidationConfig,
    fetch_timeout: Duration,
}

impl DatasetValidator {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: &ValidationConfig, fetch_timeout: Duration) -> Self {
        Self {
            store,
            cfg: cfg.clone(),
            fetch_timeout,
        }
    }

    pub async fn validate(&self, r: &ObjectRef) -> Result<ValidationReport, ValidationError> {
        let timeout_ms = self.fetch_timeout.as_millis() as u64;
        let report = tokio::time::timeout(self.fetch_timeout, self.inspect(r))
            .await
            .map_err(|_| ValidationError::Timeout { timeout_ms })?;
        match &report {
            Ok(rep) => tracing::info!(
                event = "dataset_validated",
                bucket = %r.bucket,
                key = %r.key,
                rows = rep.row_count,
                bytes_read = rep.bytes_read,
            ),
            Err(e) => tracing::warn!(
                event = "dataset_invalid",
                bucket = %r.bucket,
                key = %r.key,
                error = %e,
            ),
        }
        report
    }

    /// Validates every ref independently and concurrently.
    pub async fn validate_many(&self, refs: &[ObjectRef]) -> MultiTableReport {
        let results = futures::future::join_all(refs.iter().map(|r| async move {
            let outcome = self.validate(r).await;
            TableValidation {
                bucket: r.bucket.clone(),
                key: r.key.clone(),
                table_name_hint: r.table_name_hint.clone(),
                ok: outcome.is_ok(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                report: outcome.ok(),
            }
        }))
        .await;

        MultiTableReport {
            ok: results.iter().all(|t| t.ok),
            tables: results,
        }
    }

    async fn inspect(&self, r: &ObjectRef) -> Result<ValidationReport, ValidationError> {
        let meta = self.store.head(&r.bucket, &r.key).await?;
        if let Some(pinned) = &r.etag {
            let pinned = normalize_etag(pinned);
            if pinned != meta.etag {
                return Err(ValidationError::Stale {
                    expected: pinned,
                    actual: meta.etag,
                });
            }
        }
        if meta.size < 4 + FOOTER_LEN {
            return Err(ValidationError::Unreadable("object is too small".into()));
        }

        let mut tail_start = meta.size - meta.size.min(TAIL_PROBE);
        let mut tail = self
            .store
            .get_range(&r.bucket, &r.key, tail_start..meta.size)
            .await?;
        let needed = metadata_len(&tail).map_err(ValidationError::Unreadable)? + FOOTER_LEN;
        if needed > meta.size {
            return Err(ValidationError::Unreadable(
                "footer length exceeds object size".into(),
            ));
        }
        if needed > meta.size - tail_start {
            if needed > self.cfg.max_sample_bytes {
                return Err(ValidationError::Unreadable(format!(
                    "footer of {} bytes exceeds the {} byte read limit",
                    needed, self.cfg.max_sample_bytes
                )));
            }
            tail_start = meta.size - needed;
            tail = self
                .store
                .get_range(&r.bucket, &r.key, tail_start..meta.size)
                .await?;
        }

        let mut image = SparseObject::new(meta.size);
        image.insert(tail_start, tail);
        let reader = SerializedFileReader::new(image.clone())
            .map_err(|e| ValidationError::Unreadable(e.to_string()))?;
        let schema = schema_of(&reader).map_err(ValidationError::Unreadable)?;
        let row_count = reader.metadata().file_metadata().num_rows().max(0) as u64;
        let row_groups = reader.metadata().num_row_groups();

        let mut sample_rows = Vec::new();
        let mut sample_skipped = None;
        if let Some((rg, ranges)) = first_row_group_ranges(&reader) {
            let start = ranges.iter().map(|(s, _)| *s).min().unwrap_or(0);
            let end = ranges.iter().map(|(s, l)| s + l).max().unwrap_or(0);
            let span = end.saturating_sub(start);
            if span > self.cfg.max_sample_bytes {
                sample_skipped = Some(format!(
                    "first row group is {} bytes, above the {} byte sampling limit",
                    span, self.cfg.max_sample_bytes
                ));
            } else if span > 0 {
                if !image.covers(start, span) {
                    let chunk = self.store.get_range(&r.bucket, &r.key, start..end).await?;
                    image.insert(start, chunk);
                }
                let reader = SerializedFileReader::new(image.clone())
                    .map_err(|e| ValidationError::Unreadable(e.to_string()))?;
                sample_rows = sample_row_group(&reader, rg, self.cfg.sample_rows)
                    .map_err(ValidationError::Unreadable)?;
            }
        }

        Ok(ValidationReport {
            bucket: r.bucket.clone(),
            key: r.key.clone(),
            etag: meta.etag,
            size_bytes: meta.size,
            schema,
            row_count,
            row_groups,
            sample_rows,
            sample_skipped,
            bytes_read: image.fetched_bytes(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfCheckReport {
    pub problem_id: String,
    pub ok: bool,
    pub checks: Vec<Check>,
}

/// Proves a problem can be graded: every dataset resolves at its pinned
/// version, fixtures fit the sandbox, and the ground truth can be produced.
///
/// A decayed reference solution shows up here instead of silently failing
/// every learner's submission.
pub async fn self_check(
    problem: &ProblemSpec,
    resolver: &Resolver,
    config: &EngineConfig,
) -> SelfCheckReport {
    let settings = config.effective(problem);
    let mut checks = Vec::new();

    match validate_problem(problem) {
        Ok(()) => checks.push(Check::pass("definition", "structure is valid")),
        Err(e) => checks.push(Check::fail("definition", e.0)),
    }

    let store = resolver.cache().store();
    for (table, r) in problem.remote_refs() {
        let name = format!("dataset:{}", table.name);
        match store.head(&r.bucket, &r.key).await {
            Ok(meta) => match &r.etag {
                Some(pinned) if normalize_etag(pinned) != meta.etag => checks.push(Check::fail(
                    name,
                    format!("pinned etag {} no longer matches {}", pinned, meta.etag),
                )),
                Some(_) => checks.push(Check::pass(name, "pinned version is current")),
                None => checks.push(Check::pass(
                    name,
                    format!("unpinned; current etag {}", meta.etag),
                )),
            },
            Err(e) => checks.push(Check::fail(name, e.to_string())),
        }
    }

    checks.push(ground_truth_check(problem, resolver, &settings).await);

    let ok = checks.iter().all(|c| c.ok);
    tracing::info!(event = "self_check", problem = %problem.id, ok, checks = checks.len());
    SelfCheckReport {
        problem_id: problem.id.clone(),
        ok,
        checks,
    }
}

async fn ground_truth_check(
    problem: &ProblemSpec,
    resolver: &Resolver,
    settings: &crate::config::EffectiveSettings,
) -> Check {
    let tables = match resolver.resolve(&problem.tables, settings.fetch_timeout).await {
        Ok(t) => t,
        Err(e) => return Check::fail("resolve", e.to_string()),
    };
    let mut session =
        match SandboxSession::provision(tables, &settings.sandbox, settings.load_timeout).await {
            Ok(s) => s,
            Err(e) => return Check::fail("provision", e.to_string()),
        };

    let expected: Result<ResultSet, String> = match &problem.expected_output {
        ExpectedOutput::Literal { .. } => problem
            .expected_output
            .literal_result_set()
            .ok_or_else(|| "literal expected output is malformed".to_string()),
        ExpectedOutput::ReferenceSolution(r) => {
            let max_rows = settings.sandbox.max_result_rows as u64;
            match resolver.load_reference(r, settings.fetch_timeout, max_rows).await {
                Ok(ReferenceSolution::Output(rs)) => Ok(rs),
                Ok(ReferenceSolution::Query(sql)) => {
                    engine::execute(&mut session, &sql, settings.query_timeout, &Redactor::new())
                        .await
                        .map_err(|e| format!("reference query failed: {}", e))
                }
                Err(e) => Err(e.to_string()),
            }
        }
    };

    match expected {
        Ok(rs) if rs.columns.is_empty() => Check::fail("ground_truth", "expected output has no columns"),
        Ok(rs) => Check::pass(
            "ground_truth",
            format!("{} column(s), {} row(s)", rs.columns.len(), rs.rows.len()),
        ),
        Err(e) => Check::fail("ground_truth", e),
    }
}

use crate::model::{ErrorKind, GradingOutcome, GradingResult};
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A persisted submission as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSubmission {
    pub submission_id: String,
    pub user_id: String,
    pub problem_id: String,
    pub fingerprint: String,
    pub result: GradingResult,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStats {
    pub user_id: String,
    pub problem_id: String,
    pub attempts: u64,
    pub correct: u64,
    pub first_correct_at: Option<String>,
    pub last_outcome: Option<GradingOutcome>,
    pub updated_at: String,
}

/// Result of a `record` call. A second writer for the same id sees the first row.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Inserted,
    Existing(StoredSubmission),
}

/// Durable record of graded submissions and per-(user, problem) counters.
pub trait SubmissionStore: Send + Sync {
    fn get_submission(&self, submission_id: &str) -> anyhow::Result<Option<StoredSubmission>>;

    /// Writes the submission row and bumps the attempt counters in one transaction.
    fn record(
        &self,
        user_id: &str,
        fingerprint: &str,
        result: &GradingResult,
    ) -> anyhow::Result<RecordOutcome>;

    fn attempt_stats(&self, user_id: &str, problem_id: &str)
        -> anyhow::Result<Option<AttemptStats>>;
}

#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub submissions: Option<u64>,
    pub correct: Option<u64>,
    pub last_submission_at: Option<String>,
    pub version: Option<String>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("submission store lock poisoned"))
    }

    pub fn stats_best_effort(&self) -> anyhow::Result<StoreStats> {
        let conn = self.lock()?;

        let submissions: Option<u64> = conn
            .query_row("SELECT COUNT(*) FROM submissions", [], |r| {
                r.get::<_, i64>(0).map(|x| x as u64)
            })
            .ok();
        let correct: Option<u64> = conn
            .query_row(
                "SELECT COUNT(*) FROM submissions WHERE outcome = 'correct'",
                [],
                |r| r.get::<_, i64>(0).map(|x| x as u64),
            )
            .ok();
        let last_submission_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM submissions ORDER BY created_at DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .ok();
        let version: Option<String> = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .ok()
            .map(|v: i64| v.to_string());

        Ok(StoreStats {
            submissions,
            correct,
            last_submission_at,
            version,
        })
    }

    fn read_submission(
        conn: &Connection,
        submission_id: &str,
    ) -> anyhow::Result<Option<StoredSubmission>> {
        let row = conn
            .query_row(
                "SELECT submission_id, user_id, problem_id, fingerprint, result_json, created_at
                 FROM submissions WHERE submission_id = ?1",
                params![submission_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((submission_id, user_id, problem_id, fingerprint, json, created_at)) = row else {
            return Ok(None);
        };
        let result: GradingResult = serde_json::from_str(&json)
            .with_context(|| format!("corrupt result_json for submission {submission_id}"))?;
        Ok(Some(StoredSubmission {
            submission_id,
            user_id,
            problem_id,
            fingerprint,
            result,
            created_at,
        }))
    }
}

impl SubmissionStore for Store {
    fn get_submission(&self, submission_id: &str) -> anyhow::Result<Option<StoredSubmission>> {
        let conn = self.lock()?;
        Self::read_submission(&conn, submission_id)
    }

    fn record(
        &self,
        user_id: &str,
        fingerprint: &str,
        result: &GradingResult,
    ) -> anyhow::Result<RecordOutcome> {
        let submission_id = result
            .submission_id
            .as_deref()
            .context("cannot persist a result without a submission id")?;
        let now = now_rfc3339();
        let json = serde_json::to_string(result)?;
        let outcome = result.outcome.as_str();
        let error_kind = result.error_kind.map(error_kind_str);
        let correct = i64::from(result.is_correct());

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO submissions
               (submission_id, user_id, problem_id, fingerprint, outcome, error_kind,
                result_json, execution_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                submission_id,
                user_id,
                result.problem_id,
                fingerprint,
                outcome,
                error_kind,
                json,
                result.execution_time_ms as i64,
                now
            ],
        )?;

        if inserted == 0 {
            let existing = Self::read_submission(&tx, submission_id)?
                .context("submission vanished during insert")?;
            tx.commit()?;
            return Ok(RecordOutcome::Existing(existing));
        }

        tx.execute(
            "INSERT INTO attempt_counters
               (user_id, problem_id, attempts, correct, first_correct_at, last_outcome, updated_at)
             VALUES (?1, ?2, 1, ?3, CASE WHEN ?3 = 1 THEN ?5 END, ?4, ?5)
             ON CONFLICT(user_id, problem_id) DO UPDATE SET
               attempts = attempts + 1,
               correct = correct + excluded.correct,
               first_correct_at = COALESCE(first_correct_at, excluded.first_correct_at),
               last_outcome = excluded.last_outcome,
               updated_at = excluded.updated_at",
            params![user_id, result.problem_id, correct, outcome, now],
        )?;

        tx.commit()?;
        Ok(RecordOutcome::Inserted)
    }

    fn attempt_stats(
        &self,
        user_id: &str,
        problem_id: &str,
    ) -> anyhow::Result<Option<AttemptStats>> {
        let conn = self.lock()?;
        let stats = conn
            .query_row(
                "SELECT attempts, correct, first_correct_at, last_outcome, updated_at
                 FROM attempt_counters WHERE user_id = ?1 AND problem_id = ?2",
                params![user_id, problem_id],
                |r| {
                    Ok(AttemptStats {
                        user_id: user_id.to_string(),
                        problem_id: problem_id.to_string(),
                        attempts: r.get::<_, i64>(0)? as u64,
                        correct: r.get::<_, i64>(1)? as u64,
                        first_correct_at: r.get(2)?,
                        last_outcome: r
                            .get::<_, Option<String>>(3)?
                            .map(|s| GradingOutcome::parse(&s)),
                        updated_at: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn error_kind_str(kind: ErrorKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "other".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, outcome: GradingOutcome) -> GradingResult {
        GradingResult {
            submission_id: Some(id.to_string()),
            problem_id: "p1".into(),
            outcome,
            error_kind: None,
            candidate_columns: vec!["total".into()],
            candidate_preview: vec![],
            diagnostic_message: None,
            execution_time_ms: 7,
        }
    }

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    #[test]
    fn test_record_is_idempotent_per_submission_id() {
        let s = store();
        let first = result("s1", GradingOutcome::Incorrect);
        assert_eq!(s.record("u1", "fp", &first).unwrap(), RecordOutcome::Inserted);

        let again = s
            .record("u1", "fp", &result("s1", GradingOutcome::Correct))
            .unwrap();
        match again {
            RecordOutcome::Existing(row) => assert_eq!(row.result, first),
            other => panic!("unexpected {:?}", other),
        }

        let stats = s.attempt_stats("u1", "p1").unwrap().unwrap();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.correct, 0);
    }

    #[test]
    fn test_counters_track_first_correct() {
        let s = store();
        s.record("u1", "a", &result("s1", GradingOutcome::Incorrect))
            .unwrap();
        s.record("u1", "b", &result("s2", GradingOutcome::Correct))
            .unwrap();
        s.record("u1", "c", &result("s3", GradingOutcome::Correct))
            .unwrap();

        let stats = s.attempt_stats("u1", "p1").unwrap().unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.correct, 2);
        assert!(stats.first_correct_at.is_some());
        assert_eq!(stats.last_outcome, Some(GradingOutcome::Correct));
        assert!(s.attempt_stats("u2", "p1").unwrap().is_none());
    }

    #[test]
    fn test_error_kind_column() {
        let s = store();
        let mut r = result("s1", GradingOutcome::RuntimeError);
        r.error_kind = Some(ErrorKind::SyntaxError);
        s.record("u1", "fp", &r).unwrap();
        let kind: String = s
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT error_kind FROM submissions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "syntax_error");
        assert_eq!(s.stats_best_effort().unwrap().submissions, Some(1));
    }

    #[test]
    fn test_schema_version_and_reinit() {
        let s = store();
        s.record("u1", "fp", &result("s1", GradingOutcome::Correct))
            .unwrap();
        s.init_schema().unwrap();

        let stats = s.stats_best_effort().unwrap();
        assert_eq!(stats.version.as_deref(), Some("1"));
        assert_eq!(stats.submissions, Some(1));
    }
}

//! Disposable in-memory SQL engines, one per grading attempt.
//!
//! A session owns its connection exclusively. Work runs on the blocking pool
//! under a deadline; when the deadline passes the engine is interrupted and
//! the caller waits for the worker to hand the connection back before
//! reporting, so a timed-out session never outlives its attempt.

use crate::dataset::ResolvedTable;
use crate::errors::{LimitKind, ProvisionError};
use crate::model::Value;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, InterruptHandle, ToSql};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub max_rows_per_table: u64,
    pub max_total_bytes: u64,
    pub max_tables: usize,
    pub max_result_rows: usize,
}

static LIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of sandbox engines currently alive in this process.
pub fn live_sessions() -> usize {
    LIVE_SESSIONS.load(Ordering::SeqCst)
}

struct LiveGuard;

impl LiveGuard {
    fn acquire() -> Self {
        LIVE_SESSIONS.fetch_add(1, Ordering::SeqCst);
        LiveGuard
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        LIVE_SESSIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connection plus its liveness token; moved between tasks as one unit.
pub(crate) struct EngineHandle {
    pub(crate) conn: Connection,
    _live: LiveGuard,
}

/// Cooperative cancellation visible to blocking work.
pub(crate) struct Watchdog {
    cancel: Arc<AtomicBool>,
    deadline: Instant,
}

impl Watchdog {
    pub(crate) fn expired(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || Instant::now() >= self.deadline
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Stops the engine if the awaiting future is dropped mid-flight.
struct InterruptOnDrop {
    interrupt: Arc<InterruptHandle>,
    cancel: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.cancel.store(true, Ordering::SeqCst);
            self.interrupt.interrupt();
        }
    }
}

pub(crate) enum Guarded<T> {
    Done(EngineHandle, T),
    /// The connection is returned when the worker wound down normally.
    TimedOut(Option<EngineHandle>),
    Crashed(String),
}

pub(crate) async fn run_guarded<T, F>(
    handle: EngineHandle,
    interrupt: Arc<InterruptHandle>,
    limit: Duration,
    work: F,
) -> Guarded<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection, &Watchdog) -> T + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let watchdog = Watchdog {
        cancel: cancel.clone(),
        deadline: Instant::now() + limit,
    };
    let mut guard = InterruptOnDrop {
        interrupt: interrupt.clone(),
        cancel: cancel.clone(),
        armed: true,
    };

    let mut task = tokio::task::spawn_blocking(move || {
        let mut handle = handle;
        let out = work(&mut handle.conn, &watchdog);
        (handle, out)
    });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok((handle, out))) => {
            guard.armed = false;
            Guarded::Done(handle, out)
        }
        Ok(Err(join)) => {
            guard.armed = false;
            Guarded::Crashed(join.to_string())
        }
        Err(_) => {
            cancel.store(true, Ordering::SeqCst);
            // Interrupt is a no-op between statements, so repeat until the worker yields.
            loop {
                interrupt.interrupt();
                match tokio::time::timeout(Duration::from_millis(50), &mut task).await {
                    Ok(Ok((handle, _))) => {
                        guard.armed = false;
                        return Guarded::TimedOut(Some(handle));
                    }
                    Ok(Err(_)) => {
                        guard.armed = false;
                        return Guarded::TimedOut(None);
                    }
                    Err(_) => continue,
                }
            }
        }
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(Sql::Null),
            Value::Bool(b) => ToSqlOutput::Owned(Sql::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(Sql::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(Sql::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// An isolated engine loaded with one problem's fixtures. Read-only once provisioned.
pub struct SandboxSession {
    handle: Option<EngineHandle>,
    interrupt: Arc<InterruptHandle>,
    limits: SandboxLimits,
    tables: Vec<String>,
    loaded_bytes: u64,
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("tables", &self.tables)
            .field("loaded_bytes", &self.loaded_bytes)
            .field("usable", &self.handle.is_some())
            .finish()
    }
}

impl SandboxSession {
    /// Checks limits, creates the tables and loads every row. Limits are
    /// enforced before any row is written.
    pub async fn provision(
        tables: Vec<ResolvedTable>,
        limits: &SandboxLimits,
        load_timeout: Duration,
    ) -> Result<Self, ProvisionError> {
        check_limits(&tables, limits)?;
        let loaded_bytes: u64 = tables.iter().map(|t| t.byte_estimate()).sum();
        let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();

        let conn = Connection::open_in_memory().map_err(|e| ProvisionError::Engine(e.to_string()))?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        let handle = EngineHandle {
            conn,
            _live: LiveGuard::acquire(),
        };

        let timeout_ms = load_timeout.as_millis() as u64;
        let started = Instant::now();
        let outcome = run_guarded(handle, interrupt.clone(), load_timeout, move |conn, dog| {
            load_tables(conn, &tables, dog)
        })
        .await;

        match outcome {
            Guarded::Done(handle, Ok(())) => {
                tracing::debug!(
                    event = "sandbox_provisioned",
                    tables = names.len(),
                    bytes = loaded_bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                );
                Ok(Self {
                    handle: Some(handle),
                    interrupt,
                    limits: limits.clone(),
                    tables: names,
                    loaded_bytes,
                })
            }
            Guarded::Done(_, Err(ProvisionError::LoadTimeout { .. })) => {
                Err(ProvisionError::LoadTimeout { timeout_ms })
            }
            Guarded::Done(_, Err(e)) => Err(e),
            Guarded::TimedOut(_) => Err(ProvisionError::LoadTimeout { timeout_ms }),
            Guarded::Crashed(msg) => Err(ProvisionError::Engine(msg)),
        }
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes
    }

    pub(crate) fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.interrupt.clone()
    }

    pub(crate) fn take_handle(&mut self) -> Option<EngineHandle> {
        self.handle.take()
    }

    pub(crate) fn restore_handle(&mut self, handle: EngineHandle) {
        self.handle = Some(handle);
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        tracing::debug!(
            event = "sandbox_teardown",
            tables = self.tables.len(),
            usable = self.handle.is_some(),
        );
    }
}

fn check_limits(tables: &[ResolvedTable], limits: &SandboxLimits) -> Result<(), ProvisionError> {
    if tables.len() > limits.max_tables {
        return Err(ProvisionError::ResourceExceeded {
            limit: LimitKind::TableCount,
            table: None,
            observed: tables.len() as u64,
            allowed: limits.max_tables as u64,
        });
    }

    let mut total = 0u64;
    for t in tables {
        let rows = t.source_rows();
        if rows > limits.max_rows_per_table {
            return Err(ProvisionError::ResourceExceeded {
                limit: LimitKind::RowsPerTable,
                table: Some(t.name.clone()),
                observed: rows,
                allowed: limits.max_rows_per_table,
            });
        }
        total += t.byte_estimate();
    }
    if total > limits.max_total_bytes {
        return Err(ProvisionError::ResourceExceeded {
            limit: LimitKind::TotalBytes,
            table: None,
            observed: total,
            allowed: limits.max_total_bytes,
        });
    }
    Ok(())
}

fn load_tables(
    conn: &mut Connection,
    tables: &[ResolvedTable],
    dog: &Watchdog,
) -> Result<(), ProvisionError> {
    let engine = |e: rusqlite::Error| ProvisionError::Engine(e.to_string());
    let timed_out = || ProvisionError::LoadTimeout { timeout_ms: 0 };

    let tx = conn.transaction().map_err(engine)?;
    for t in tables {
        let cols: Vec<String> = t
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_affinity()))
            .collect();
        tx.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            quote_ident(&t.name),
            cols.join(", ")
        ))
        .map_err(engine)?;

        if t.columns.is_empty() {
            continue;
        }
        let placeholders = vec!["?"; t.columns.len()].join(", ");
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(&t.name),
                placeholders
            ))
            .map_err(engine)?;
        for (i, row) in t.rows().enumerate() {
            if i % 512 == 0 && dog.expired() {
                return Err(timed_out());
            }
            stmt.execute(rusqlite::params_from_iter(row)).map_err(engine)?;
        }
    }
    tx.commit().map_err(engine)?;

    conn.execute_batch("PRAGMA query_only = ON")
        .map_err(engine)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TableData;
    use crate::model::{ColumnDef, ColumnType};

    fn limits() -> SandboxLimits {
        SandboxLimits {
            max_rows_per_table: 100,
            max_total_bytes: 1024 * 1024,
            max_tables: 4,
            max_result_rows: 100,
        }
    }

    fn table(name: &str, n: i64) -> ResolvedTable {
        ResolvedTable {
            name: name.into(),
            columns: vec![ColumnDef::new("id", ColumnType::Integer)],
            data: TableData::Owned((0..n).map(|i| vec![Value::Int(i)]).collect()),
        }
    }

    #[tokio::test]
    async fn test_provision_loads_tables() {
        let session = SandboxSession::provision(vec![table("t", 3)], &limits(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.tables(), &["t".to_string()]);
        assert!(session.loaded_bytes() > 0);
        assert!(live_sessions() >= 1);
    }

    #[tokio::test]
    async fn test_row_limit_rejected_before_load() {
        let err = SandboxSession::provision(vec![table("t", 101)], &limits(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ProvisionError::ResourceExceeded {
                limit, observed, ..
            } => {
                assert_eq!(limit, LimitKind::RowsPerTable);
                assert_eq!(observed, 101);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_table_count_limit() {
        let tables = (0..5).map(|i| table(&format!("t{i}"), 1)).collect();
        let err = SandboxSession::provision(tables, &limits(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ResourceExceeded {
                limit: LimitKind::TableCount,
                ..
            }
        ));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}

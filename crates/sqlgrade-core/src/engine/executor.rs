use crate::engine::statement;
use crate::errors::ExecutionError;
use crate::model::{ResultSet, Value};
use crate::redaction::Redactor;
use crate::sandbox::{run_guarded, Guarded, SandboxSession, Watchdog};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::time::{Duration, Instant};

/// Runs one candidate statement inside `session` under `timeout`.
///
/// The session is left usable after a timeout as long as the worker wound
/// down; a crashed worker leaves it empty and later calls fail as internal.
pub async fn execute(
    session: &mut SandboxSession,
    sql: &str,
    timeout: Duration,
    redactor: &Redactor,
) -> Result<ResultSet, ExecutionError> {
    let sql = statement::inspect(sql)?;
    let cap = session.limits().max_result_rows;
    let timeout_ms = timeout.as_millis() as u64;

    let Some(handle) = session.take_handle() else {
        return Err(ExecutionError::Internal("sandbox is no longer usable".into()));
    };
    let interrupt = session.interrupt_handle();

    let started = Instant::now();
    let outcome = run_guarded(handle, interrupt, timeout, move |conn, dog| {
        run_query(conn, &sql, cap, dog)
    })
    .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let result = match outcome {
        Guarded::Done(handle, out) => {
            session.restore_handle(handle);
            out
        }
        Guarded::TimedOut(handle) => {
            if let Some(h) = handle {
                session.restore_handle(h);
            }
            Err(ExecutionError::Timeout { timeout_ms })
        }
        Guarded::Crashed(msg) => Err(ExecutionError::Internal(msg)),
    };

    match &result {
        Ok(rs) => tracing::debug!(
            event = "query_executed",
            rows = rs.rows.len(),
            elapsed_ms,
        ),
        Err(e) => tracing::debug!(event = "query_failed", kind = ?e.kind(), elapsed_ms),
    }

    result.map_err(|e| match e {
        ExecutionError::Timeout { .. } => ExecutionError::Timeout { timeout_ms },
        ExecutionError::Syntax(m) => ExecutionError::Syntax(redactor.redact(&m).into_owned()),
        ExecutionError::Semantic(m) => ExecutionError::Semantic(redactor.redact(&m).into_owned()),
        ExecutionError::Other(m) => ExecutionError::Other(redactor.redact(&m).into_owned()),
        other => other,
    })
}

fn run_query(
    conn: &mut Connection,
    sql: &str,
    cap: usize,
    dog: &Watchdog,
) -> Result<ResultSet, ExecutionError> {
    let mut stmt = conn.prepare(sql).map_err(|e| classify(&e, dog))?;
    if !stmt.readonly() {
        return Err(ExecutionError::DisallowedStatement {
            keyword: "write".into(),
        });
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query([]).map_err(|e| classify(&e, dog))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| classify(&e, dog))? {
        if dog.expired() {
            return Err(ExecutionError::Timeout { timeout_ms: 0 });
        }
        if out.len() >= cap {
            return Err(ExecutionError::ResultRowsExceeded { cap });
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            let v = row.get_ref(i).map_err(|e| classify(&e, dog))?;
            values.push(from_sql(v));
        }
        out.push(values);
    }

    Ok(ResultSet::new(columns, out))
}

pub(crate) fn from_sql(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(hex::encode(b)),
    }
}

fn classify(e: &rusqlite::Error, dog: &Watchdog) -> ExecutionError {
    if dog.cancelled() || e.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) {
        return ExecutionError::Timeout { timeout_ms: 0 };
    }
    let msg = match e {
        rusqlite::Error::SqliteFailure(_, Some(m)) => m.clone(),
        other => other.to_string(),
    };
    classify_message(msg)
}

fn classify_message(msg: String) -> ExecutionError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("syntax error") || lower.contains("incomplete input") || lower.contains("unrecognized token") {
        return ExecutionError::Syntax(msg);
    }
    const SEMANTIC: &[&str] = &[
        "no such table",
        "no such column",
        "no such function",
        "ambiguous column",
        "misuse of aggregate",
        "misuse of window function",
        "wrong number of arguments",
        "selects to the left and right",
        "is not a function",
        "group by term out of range",
        "order by term out of range",
    ];
    if SEMANTIC.iter().any(|p| lower.contains(p)) {
        return ExecutionError::Semantic(msg);
    }
    ExecutionError::Other(msg)
}

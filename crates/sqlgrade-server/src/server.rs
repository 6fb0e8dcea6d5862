use crate::cache::ReportCache;
use crate::config::ServerConfig;
use crate::methods::{self, MethodContext, MethodError};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgrade_core::Grader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

static RID: AtomicU64 = AtomicU64::new(1);

fn next_rid() -> String {
    let n = RID.fetch_add(1, Ordering::Relaxed);
    format!("r-{n:06}")
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Response {
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<MethodError>,
}

impl Response {
    fn from_outcome(id: Option<Value>, outcome: Result<Value, MethodError>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Self::error(id, error),
        }
    }

    fn error(id: Option<Value>, error: MethodError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

pub struct Server;

impl Server {
    /// Serves stdin/stdout until stdin closes.
    pub async fn run(grader: Arc<Grader>, cfg: ServerConfig) -> Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        Self::serve(grader, cfg, stdin, tokio::io::stdout()).await
    }

    /// One JSON request per input line, one JSON response per output line.
    /// Requests run concurrently, so responses may come back out of order;
    /// clients match them by `id`.
    pub async fn serve<R, W>(grader: Arc<Grader>, cfg: ServerConfig, input: R, output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = Arc::new(MethodContext {
            grader,
            reports: ReportCache::new(cfg.report_cache_entries),
        });
        let slots = Arc::new(Semaphore::new(cfg.max_in_flight));
        let (tx, mut rx) = mpsc::channel::<String>(256);

        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(line) = rx.recv().await {
                output.write_all(line.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            anyhow::Ok(())
        });

        let mut tasks = JoinSet::new();
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let rid = next_rid();

            if line.len() > cfg.max_msg_bytes {
                tracing::warn!(
                    event = "limit_exceeded",
                    rid = %rid,
                    bytes_in = line.len(),
                    max = cfg.max_msg_bytes
                );
                let resp = Response::error(
                    None,
                    MethodError::new(
                        "E_LIMIT_EXCEEDED",
                        format!("message bytes={} > max={}", line.len(), cfg.max_msg_bytes),
                    ),
                );
                send(&tx, &resp).await;
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            let req: Request = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(event = "json_parse_error", rid = %rid, error = %e);
                    let resp = Response::error(None, MethodError::new("E_PARSE", e.to_string()));
                    send(&tx, &resp).await;
                    continue;
                }
            };

            let permit = slots.clone().acquire_owned().await?;
            let ctx = ctx.clone();
            let tx = tx.clone();
            let request_timeout = Duration::from_millis(cfg.timeout_ms);
            tasks.spawn(async move {
                let _permit = permit;
                let resp = handle(&ctx, req, &rid, request_timeout).await;
                send(&tx, &resp).await;
            });

            // Reap finished tasks so the set stays small on long sessions.
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        drop(tx);
        writer.await??;
        Ok(())
    }
}

async fn handle(ctx: &MethodContext, req: Request, rid: &str, limit: Duration) -> Response {
    let start = std::time::Instant::now();
    tracing::info!(event = "request_start", rid = %rid, rpc_id = ?req.id, method = %req.method);

    let params = req.params.unwrap_or(Value::Object(Default::default()));
    let outcome = match timeout(limit, methods::handle_call(ctx, &req.method, params)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(MethodError::new(
            "E_TIMEOUT",
            format!("request exceeded {}ms", limit.as_millis()),
        )),
    };

    let dur = start.elapsed().as_millis() as u64;
    match &outcome {
        Ok(_) => tracing::info!(
            event = "request_done",
            rid = %rid,
            method = %req.method,
            duration_ms = dur,
            outcome = "ok"
        ),
        Err(e) => tracing::info!(
            event = "request_done",
            rid = %rid,
            method = %req.method,
            duration_ms = dur,
            outcome = "error",
            code = %e.code
        ),
    }
    Response::from_outcome(req.id, outcome)
}

async fn send(tx: &mpsc::Sender<String>, resp: &Response) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                tracing::warn!(event = "writer_closed");
            }
        }
        Err(e) => tracing::error!(event = "response_encode_error", error = %e),
    }
}

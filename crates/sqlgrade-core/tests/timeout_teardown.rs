//! Runs alone in its own binary: the live-session gauge is process-wide.

mod common;

use common::*;
use sqlgrade_core::model::{Caller, ErrorKind, GradingOutcome};
use sqlgrade_core::sandbox::live_sessions;
use std::time::{Duration, Instant};

const RUNAWAY: &str =
    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

async fn wait_for_no_sessions() {
    let deadline = Instant::now() + Duration::from_secs(5);
    while live_sessions() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeouts_tear_down_every_session() -> anyhow::Result<()> {
    let caller = Caller::new("learner-1");

    // Query deadline.
    let h = Harness::new(test_config());
    let mut p = sum_orders();
    p.limits.query_timeout_ms = Some(200);
    h.add(p);

    let started = Instant::now();
    let res = h.grader.submit(&caller, "sum-orders", RUNAWAY, "t1").await?;
    assert_eq!(res.outcome, GradingOutcome::Timeout);
    assert_eq!(res.error_kind, Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(live_sessions(), 0);

    let run = h.grader.run_test(&caller, "sum-orders", RUNAWAY).await?;
    assert_eq!(run.error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(live_sessions(), 0);

    let next = h
        .grader
        .submit(&caller, "sum-orders", "SELECT SUM(amount) AS total FROM orders", "t2")
        .await?;
    assert_eq!(next.outcome, GradingOutcome::Correct);
    assert_eq!(live_sessions(), 0);

    // Overall attempt deadline shorter than the query deadline.
    let mut cfg = test_config();
    cfg.timeouts.attempt_timeout_ms = Some(300);
    let h = Harness::new(cfg);
    h.add(sum_orders());

    let res = h.grader.submit(&caller, "sum-orders", RUNAWAY, "t3").await?;
    assert_eq!(res.outcome, GradingOutcome::Timeout);
    wait_for_no_sessions().await;
    assert_eq!(live_sessions(), 0);
    Ok(())
}

mod common;

use common::*;
use sqlgrade_core::config::CacheConfig;
use sqlgrade_core::dataset::DatasetCache;
use sqlgrade_core::errors::DatasetError;
use sqlgrade_core::model::{Caller, GradingOutcome, ObjectRef, Value};
use sqlgrade_core::storage::ObjectStore;
use std::sync::Arc;

fn count_problem(id: &str, r: ObjectRef, expected: i64) -> sqlgrade_core::model::ProblemSpec {
    problem(
        id,
        vec![remote_table("orders", r)],
        literal(serde_json::json!([{ "n": expected }])),
    )
}

#[tokio::test]
async fn test_same_object_version_is_fetched_once() -> anyhow::Result<()> {
    let h = Harness::new(test_config());
    h.put("datasets", "orders.parquet", &orders_parquet(&[(1, 1.0), (2, 2.0)]));
    let etag = h.objects.head("datasets", "orders.parquet").await?.etag;
    let pinned = ObjectRef::new("datasets", "orders.parquet").with_etag(etag);

    h.add(count_problem("count-a", pinned.clone(), 2));
    h.add(count_problem("count-b", pinned, 2));

    let caller = Caller::new("u");
    let sql = "SELECT COUNT(*) AS n FROM orders";
    let a = h.grader.submit(&caller, "count-a", sql, "a1").await?;
    let b = h.grader.submit(&caller, "count-b", sql, "b1").await?;
    assert_eq!(a.outcome, GradingOutcome::Correct);
    assert_eq!(b.outcome, GradingOutcome::Correct);
    assert_eq!(h.objects.gets(), 1);
    Ok(())
}

#[tokio::test]
async fn test_new_version_forces_refetch() -> anyhow::Result<()> {
    let h = Harness::new(test_config());
    h.put("datasets", "orders.parquet", &orders_parquet(&[(1, 1.0)]));
    h.add(count_problem(
        "count",
        ObjectRef::new("datasets", "orders.parquet"),
        3,
    ));

    let caller = Caller::new("u");
    let sql = "SELECT COUNT(*) AS n FROM orders";
    let before = h.grader.run_test(&caller, "count", sql).await?;
    assert_eq!(before.rows, vec![vec![Value::Int(1)]]);
    let again = h.grader.run_test(&caller, "count", sql).await?;
    assert_eq!(again.rows, vec![vec![Value::Int(1)]]);
    assert_eq!(h.objects.gets(), 1);

    h.put(
        "datasets",
        "orders.parquet",
        &orders_parquet(&[(1, 1.0), (2, 2.0), (3, 3.0)]),
    );
    let after = h.grader.submit(&caller, "count", sql, "s1").await?;
    assert_eq!(after.outcome, GradingOutcome::Correct);
    assert_eq!(h.objects.gets(), 2);
    Ok(())
}

#[tokio::test]
async fn test_pinned_etag_mismatch_is_stale() -> anyhow::Result<()> {
    let h = Harness::new(test_config());
    h.put("datasets", "orders.parquet", &orders_parquet(&[(1, 1.0)]));
    let cache = DatasetCache::new(
        h.objects.clone() as Arc<dyn ObjectStore>,
        &CacheConfig::default(),
    );

    let r = ObjectRef::new("datasets", "orders.parquet").with_etag("authored-long-ago");
    let err = cache.get_or_fetch(&r, "orders").await.unwrap_err();
    assert!(matches!(err, DatasetError::Stale { .. }));
    assert_eq!(cache.entry_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() -> anyhow::Result<()> {
    let h = Harness::new(test_config());
    let rows: Vec<(i64, f64)> = (0..500).map(|i| (i, i as f64)).collect();
    h.put("datasets", "orders.parquet", &orders_parquet(&rows));
    let cache = Arc::new(DatasetCache::new(
        h.objects.clone() as Arc<dyn ObjectStore>,
        &CacheConfig::default(),
    ));
    let etag = h.objects.head("datasets", "orders.parquet").await?.etag;
    let r = ObjectRef::new("datasets", "orders.parquet").with_etag(etag);

    let lookups = (0..8).map(|_| {
        let cache = cache.clone();
        let r = r.clone();
        tokio::spawn(async move { cache.get_or_fetch(&r, "orders").await })
    });
    for handle in futures::future::join_all(lookups).await {
        let object = handle??;
        assert_eq!(object.total_rows, 500);
        assert!(object.is_complete());
    }
    assert_eq!(h.objects.gets(), 1);
    Ok(())
}

#[tokio::test]
async fn test_object_above_decode_ceiling_is_not_materialized() -> anyhow::Result<()> {
    let h = Harness::new(test_config());
    let rows: Vec<(i64, f64)> = (0..50).map(|i| (i, 1.0)).collect();
    h.put("datasets", "orders.parquet", &orders_parquet(&rows));
    let cache = DatasetCache::new(
        h.objects.clone() as Arc<dyn ObjectStore>,
        &CacheConfig {
            max_rows_per_object: 10,
            ..Default::default()
        },
    );

    let object = cache
        .get_or_fetch(&ObjectRef::new("datasets", "orders.parquet"), "orders")
        .await?;
    assert_eq!(object.total_rows, 50);
    assert!(object.rows.is_empty());
    assert!(!object.is_complete());
    Ok(())
}

#[tokio::test]
async fn test_injected_cache_ceiling_fails_closed() -> anyhow::Result<()> {
    let h = Harness::new(test_config());
    let rows: Vec<(i64, f64)> = (0..50).map(|i| (i, 1.0)).collect();
    h.put("datasets", "orders.parquet", &orders_parquet(&rows));

    // A cache whose ceiling is below the sandbox row limit.
    let cache = Arc::new(DatasetCache::new(
        h.objects.clone() as Arc<dyn ObjectStore>,
        &CacheConfig {
            max_rows_per_object: 10,
            ..Default::default()
        },
    ));
    let grader = sqlgrade_core::Grader::with_cache(
        test_config(),
        h.catalog.clone() as Arc<dyn sqlgrade_core::catalog::ProblemCatalog>,
        cache,
        h.store.clone() as Arc<dyn sqlgrade_core::storage::SubmissionStore>,
    );
    h.add(count_problem(
        "count",
        ObjectRef::new("datasets", "orders.parquet"),
        50,
    ));

    let res = grader
        .submit(&Caller::new("u"), "count", "SELECT COUNT(*) AS n FROM orders", "c1")
        .await?;
    assert_eq!(res.outcome, GradingOutcome::ResourceExceeded);
    let msg = res.diagnostic_message.unwrap_or_default();
    assert!(msg.contains("decode ceiling"), "{msg}");
    assert!(!msg.contains("orders.parquet"), "{msg}");
    Ok(())
}

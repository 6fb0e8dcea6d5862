#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parquet::data_type::{DoubleType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use sqlgrade_core::catalog::{MemoryCatalog, ProblemCatalog};
use sqlgrade_core::config::EngineConfig;
use sqlgrade_core::errors::StorageError;
use sqlgrade_core::model::{
    ColumnDef, ColumnType, ExpectedOutput, InlineRow, ObjectRef, ProblemSpec, TableDef,
    TableSource, Value,
};
use sqlgrade_core::storage::{LocalObjectStore, ObjectMeta, ObjectStore, Store, SubmissionStore};
use sqlgrade_core::Grader;
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Local object store that counts full-object downloads.
pub struct CountingStore {
    inner: LocalObjectStore,
    gets: AtomicUsize,
    heads: AtomicUsize,
}

impl CountingStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalObjectStore::new(root),
            gets: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.inner.head(bucket, key).await
    }

    async fn get_to(
        &self,
        bucket: &str,
        key: &str,
        if_match: Option<&str>,
        max_bytes: u64,
        sink: &mut (dyn Write + Send),
    ) -> Result<ObjectMeta, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_to(bucket, key, if_match, max_bytes, sink).await
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes, StorageError> {
        self.inner.get_range(bucket, key, range).await
    }
}

pub struct Harness {
    pub grader: Grader,
    pub catalog: Arc<MemoryCatalog>,
    pub objects: Arc<CountingStore>,
    pub store: Arc<Store>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::memory().unwrap());
        store.init_schema().unwrap();
        Self::with_store(config, dir, store)
    }

    pub fn with_store(config: EngineConfig, dir: TempDir, store: Arc<Store>) -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        let objects = Arc::new(CountingStore::new(dir.path()));
        let grader = Grader::new(
            config,
            catalog.clone() as Arc<dyn ProblemCatalog>,
            objects.clone() as Arc<dyn ObjectStore>,
            store.clone() as Arc<dyn SubmissionStore>,
        );
        Self {
            grader,
            catalog,
            objects,
            store,
            dir,
        }
    }

    pub fn add(&self, problem: ProblemSpec) {
        self.catalog.insert(problem);
    }

    /// Writes an object at `<root>/<bucket>/<key>`.
    pub fn put(&self, bucket: &str, key: &str, bytes: &[u8]) {
        let path = self.dir.path().join(bucket).join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

/// Config with a generous rate limit so tests only throttle when they mean to.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.rate_limit.burst = 1_000;
    cfg.rate_limit.max_concurrent_per_user = 16;
    cfg
}

pub fn orders_inline() -> TableDef {
    TableDef {
        name: "orders".into(),
        columns: vec![
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("amount", ColumnType::Float),
        ],
        source: TableSource::Inline {
            rows: vec![
                InlineRow::Positional(vec![Value::Int(1), Value::Float(10.0)]),
                InlineRow::Positional(vec![Value::Int(2), Value::Float(20.0)]),
            ],
        },
    }
}

pub fn remote_table(name: &str, r: ObjectRef) -> TableDef {
    TableDef {
        name: name.into(),
        columns: vec![],
        source: TableSource::Remote(r),
    }
}

/// Literal expectation from a JSON array of row objects.
pub fn literal(rows: serde_json::Value) -> ExpectedOutput {
    serde_json::from_value(serde_json::json!({ "literal": { "rows": rows } })).unwrap()
}

pub fn problem(id: &str, tables: Vec<TableDef>, expected: ExpectedOutput) -> ProblemSpec {
    ProblemSpec {
        id: id.into(),
        title: None,
        tables,
        expected_output: expected,
        comparison: None,
        limits: Default::default(),
        tags: vec![],
    }
}

pub fn sum_orders() -> ProblemSpec {
    problem(
        "sum-orders",
        vec![orders_inline()],
        literal(serde_json::json!([{ "total": 30.0 }])),
    )
}

/// `(id INT64, amount DOUBLE)` in a single row group.
pub fn orders_parquet(rows: &[(i64, f64)]) -> Vec<u8> {
    let schema = Arc::new(
        parse_message_type(
            "message schema {
                REQUIRED INT64 id;
                REQUIRED DOUBLE amount;
            }",
        )
        .unwrap(),
    );
    let props = Arc::new(WriterProperties::builder().build());
    let mut buf = Vec::new();
    {
        let mut writer = SerializedFileWriter::new(&mut buf, schema, props).unwrap();
        let mut rg = writer.next_row_group().unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
        let amounts: Vec<f64> = rows.iter().map(|r| r.1).collect();

        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<Int64Type>().write_batch(&ids, None, None).unwrap();
        col.close().unwrap();
        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<DoubleType>().write_batch(&amounts, None, None).unwrap();
        col.close().unwrap();

        rg.close().unwrap();
        writer.close().unwrap();
    }
    buf
}

/// A one-column `total DOUBLE` file, used as a precomputed expected output.
pub fn totals_parquet(values: &[f64]) -> Vec<u8> {
    let schema = Arc::new(parse_message_type("message schema { REQUIRED DOUBLE total; }").unwrap());
    let props = Arc::new(WriterProperties::builder().build());
    let mut buf = Vec::new();
    {
        let mut writer = SerializedFileWriter::new(&mut buf, schema, props).unwrap();
        let mut rg = writer.next_row_group().unwrap();
        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<DoubleType>().write_batch(values, None, None).unwrap();
        col.close().unwrap();
        rg.close().unwrap();
        writer.close().unwrap();
    }
    buf
}

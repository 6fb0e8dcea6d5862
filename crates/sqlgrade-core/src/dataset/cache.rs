use crate::config::CacheConfig;
use crate::dataset::parquet::{decode_file, decode_result_set};
use crate::errors::{DatasetError, StorageError};
use crate::model::{ColumnDef, ObjectRef, ResultSet, Value};
use crate::storage::ObjectStore;
use moka::future::Cache;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub bucket: String,
    pub key: String,
    pub etag: String,
}

/// Decoded remote table shared by every problem that references the same object version.
#[derive(Debug)]
pub struct DecodedObject {
    pub key: ObjectKey,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    /// Footer row count. Rows are only decoded when it is within the decode ceiling.
    pub total_rows: u64,
    pub byte_estimate: u64,
}

impl DecodedObject {
    pub fn is_complete(&self) -> bool {
        self.rows.len() as u64 == self.total_rows
    }
}

pub(crate) fn storage_to_dataset(e: StorageError, table: &str) -> DatasetError {
    match e {
        StorageError::NotFound { .. } => DatasetError::NotFound {
            table: table.to_string(),
        },
        StorageError::PreconditionFailed { etag, .. } => DatasetError::Stale {
            table: table.to_string(),
            expected: etag,
        },
        StorageError::TooLarge { max, .. } => DatasetError::TooLarge {
            table: table.to_string(),
            reason: format!("object exceeds {} bytes", max),
        },
        StorageError::Unavailable(reason) | StorageError::Io(reason) => {
            DatasetError::Storage { reason }
        }
    }
}

/// Get-or-fetch cache of decoded remote objects keyed by `(bucket, key, etag)`.
///
/// Concurrent requests for the same key share one fetch. An object whose
/// store reports no etag is fetched every time and never cached.
pub struct DatasetCache {
    store: Arc<dyn ObjectStore>,
    objects: Cache<ObjectKey, Arc<DecodedObject>>,
    max_rows_per_object: u64,
    max_object_bytes: u64,
}

impl DatasetCache {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: &CacheConfig) -> Self {
        let objects = Cache::builder()
            .weigher(|_k: &ObjectKey, v: &Arc<DecodedObject>| -> u32 {
                v.byte_estimate.min(u64::from(u32::MAX)) as u32
            })
            .max_capacity(cfg.max_bytes)
            .build();
        Self {
            store,
            objects,
            max_rows_per_object: cfg.max_rows_per_object,
            max_object_bytes: cfg.max_object_bytes,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn entry_count(&self) -> u64 {
        self.objects.entry_count()
    }

    /// Returns the decoded object for `r`, fetching it on a miss.
    ///
    /// A pinned etag that no longer matches the stored object is `Stale`.
    /// Without a pin the current etag comes from `HEAD`; if the object
    /// changes between `HEAD` and `GET` the lookup is retried once.
    pub async fn get_or_fetch(
        &self,
        r: &ObjectRef,
        table: &str,
    ) -> Result<Arc<DecodedObject>, DatasetError> {
        if let Some(etag) = &r.etag {
            return self.lookup(r, etag.clone(), table).await;
        }

        let mut attempt = 0;
        loop {
            let meta = self
                .store
                .head(&r.bucket, &r.key)
                .await
                .map_err(|e| storage_to_dataset(e, table))?;
            match self.lookup(r, meta.etag, table).await {
                Err(DatasetError::Stale { .. }) if attempt == 0 => attempt += 1,
                other => return other,
            }
        }
    }

    async fn lookup(
        &self,
        r: &ObjectRef,
        etag: String,
        table: &str,
    ) -> Result<Arc<DecodedObject>, DatasetError> {
        let key = ObjectKey {
            bucket: r.bucket.clone(),
            key: r.key.clone(),
            etag,
        };
        if key.etag.is_empty() {
            return self.fetch(key, table.to_string()).await;
        }
        if let Some(hit) = self.objects.get(&key).await {
            tracing::debug!(event = "dataset_cache_hit", table = %table, etag = %key.etag);
            return Ok(hit);
        }

        self.objects
            .try_get_with(key.clone(), self.fetch(key, table.to_string()))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn fetch(&self, key: ObjectKey, table: String) -> Result<Arc<DecodedObject>, DatasetError> {
        tracing::info!(event = "dataset_cache_miss", table = %table, etag = %key.etag);
        let started = std::time::Instant::now();

        let mut file = tempfile::tempfile().map_err(|e| DatasetError::Storage {
            reason: format!("scratch file: {}", e),
        })?;
        let if_match = (!key.etag.is_empty()).then_some(key.etag.as_str());
        let meta = self
            .store
            .get_to(&key.bucket, &key.key, if_match, self.max_object_bytes, &mut file)
            .await
            .map_err(|e| storage_to_dataset(e, &table))?;

        let max_rows = self.max_rows_per_object;
        let contents = tokio::task::spawn_blocking(move || decode_file(file, max_rows))
            .await
            .map_err(|e| DatasetError::Unreadable {
                table: table.clone(),
                reason: e.to_string(),
            })?
            .map_err(|reason| DatasetError::Unreadable {
                table: table.clone(),
                reason,
            })?;

        let byte_estimate = contents
            .rows
            .iter()
            .flat_map(|r| r.iter())
            .map(Value::byte_estimate)
            .sum::<u64>()
            .max(meta.size);

        tracing::info!(
            event = "dataset_fetched",
            table = %table,
            rows = contents.total_rows,
            bytes = meta.size,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );

        Ok(Arc::new(DecodedObject {
            key,
            columns: contents.columns,
            rows: contents.rows,
            total_rows: contents.total_rows,
            byte_estimate,
        }))
    }

    /// Reads a small text object (a reference query), honoring a pinned etag.
    pub async fn fetch_text(&self, r: &ObjectRef, max_bytes: u64) -> Result<String, DatasetError> {
        let label = "reference solution";
        let mut buf = Vec::new();
        self.store
            .get_to(&r.bucket, &r.key, r.etag.as_deref(), max_bytes, &mut buf)
            .await
            .map_err(|e| storage_to_dataset(e, label))?;
        String::from_utf8(buf).map_err(|_| DatasetError::Unreadable {
            table: label.into(),
            reason: "reference query is not valid UTF-8".into(),
        })
    }

    /// Loads a precomputed expected output stored as Parquet.
    pub async fn fetch_result_set(
        &self,
        r: &ObjectRef,
        max_rows: u64,
    ) -> Result<ResultSet, DatasetError> {
        let label = "reference output";
        let mut file = tempfile::tempfile().map_err(|e| DatasetError::Storage {
            reason: format!("scratch file: {}", e),
        })?;
        self.store
            .get_to(&r.bucket, &r.key, r.etag.as_deref(), self.max_object_bytes, &mut file)
            .await
            .map_err(|e| storage_to_dataset(e, label))?;
        tokio::task::spawn_blocking(move || decode_result_set(file, max_rows))
            .await
            .map_err(|e| DatasetError::Unreadable {
                table: label.into(),
                reason: e.to_string(),
            })?
            .map_err(|reason| DatasetError::Unreadable {
                table: label.into(),
                reason,
            })
    }
}

use moka::sync::Cache;
use sha2::{Digest, Sha256};
use sqlgrade_core::model::ObjectRef;
use sqlgrade_core::validate::ValidationReport;
use std::sync::Arc;

/// Validation reports for etag-pinned objects. A pinned object version never
/// changes, so its report can be served again without touching storage.
pub struct ReportCache {
    reports: Cache<String, Arc<ValidationReport>>,
}

impl ReportCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            reports: Cache::new(max_entries),
        }
    }

    pub fn get(&self, r: &ObjectRef) -> Option<Arc<ValidationReport>> {
        key(r).and_then(|k| self.reports.get(&k))
    }

    pub fn insert(&self, r: &ObjectRef, report: Arc<ValidationReport>) {
        if let Some(k) = key(r) {
            self.reports.insert(k, report);
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `None` for unpinned refs.
pub fn key(r: &ObjectRef) -> Option<String> {
    let etag = r.etag.as_deref().filter(|e| !e.is_empty())?;
    Some(sha256_hex(
        format!("{}\n{}\n{}", r.bucket, r.key, etag).as_bytes(),
    ))
}

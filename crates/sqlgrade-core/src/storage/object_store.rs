//! Read-only access to dataset objects (bucket + key).

use crate::errors::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError>;

    /// Streams the whole object into `sink`. With `if_match`, an object whose
    /// current etag differs yields `PreconditionFailed` instead of data.
    async fn get_to(
        &self,
        bucket: &str,
        key: &str,
        if_match: Option<&str>,
        max_bytes: u64,
        sink: &mut (dyn Write + Send),
    ) -> Result<ObjectMeta, StorageError>;

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes, StorageError>;
}

/// Strips quotes and the weak validator prefix so etags compare by value.
pub fn normalize_etag(raw: &str) -> String {
    let t = raw.trim();
    let t = t.strip_prefix("W/").unwrap_or(t);
    t.trim_matches('"').to_string()
}

/// S3-compatible, path-style HTTP GETs: `{endpoint}/{bucket}/{key}`.
#[derive(Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, bearer_token: Option<String>) -> anyhow::Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("invalid object store endpoint '{}': {}", endpoint, e))?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("object store endpoint must be a base URL");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            bearer_token,
        })
    }

    fn url(&self, bucket: &str, key: &str) -> Result<reqwest::Url, StorageError> {
        let mut url = self.endpoint.clone();
        {
            let mut segs = url
                .path_segments_mut()
                .map_err(|_| StorageError::Unavailable("endpoint cannot be a base".into()))?;
            segs.pop_if_empty();
            segs.push(bucket);
            segs.extend(key.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: reqwest::Url) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.bearer_token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    fn check_status(
        resp: &reqwest::Response,
        bucket: &str,
        key: &str,
        if_match: Option<&str>,
    ) -> Result<(), StorageError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                bucket: bucket.into(),
                key: key.into(),
            });
        }
        if status == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(StorageError::PreconditionFailed {
                bucket: bucket.into(),
                key: key.into(),
                etag: if_match.unwrap_or_default().into(),
            });
        }
        if !status.is_success() {
            return Err(StorageError::Unavailable(format!("unexpected status {}", status)));
        }
        Ok(())
    }

    fn etag_of(resp: &reqwest::Response) -> String {
        resp.headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .unwrap_or_default()
    }
}

fn transport(e: reqwest::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError> {
        let url = self.url(bucket, key)?;
        let resp = self
            .request(reqwest::Method::HEAD, url)
            .send()
            .await
            .map_err(transport)?;
        Self::check_status(&resp, bucket, key, None)?;
        Ok(ObjectMeta {
            size: resp.content_length().unwrap_or(0),
            etag: Self::etag_of(&resp),
        })
    }

    async fn get_to(
        &self,
        bucket: &str,
        key: &str,
        if_match: Option<&str>,
        max_bytes: u64,
        sink: &mut (dyn Write + Send),
    ) -> Result<ObjectMeta, StorageError> {
        let url = self.url(bucket, key)?;
        let mut req = self.request(reqwest::Method::GET, url);
        if let Some(etag) = if_match {
            req = req.header(reqwest::header::IF_MATCH, format!("\"{}\"", etag));
        }
        let mut resp = req.send().await.map_err(transport)?;
        Self::check_status(&resp, bucket, key, if_match)?;

        let etag = Self::etag_of(&resp);
        if let Some(expected) = if_match {
            // Some gateways ignore If-Match; compare the returned validator too.
            if !etag.is_empty() && etag != expected {
                return Err(StorageError::PreconditionFailed {
                    bucket: bucket.into(),
                    key: key.into(),
                    etag: expected.into(),
                });
            }
        }

        let mut size = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(transport)? {
            size += chunk.len() as u64;
            if size > max_bytes {
                return Err(StorageError::TooLarge {
                    bucket: bucket.into(),
                    key: key.into(),
                    max: max_bytes,
                });
            }
            sink.write_all(&chunk)?;
        }
        sink.flush()?;

        Ok(ObjectMeta { size, etag })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes, StorageError> {
        if range.start >= range.end {
            return Ok(Bytes::new());
        }
        let url = self.url(bucket, key)?;
        let resp = self
            .request(reqwest::Method::GET, url)
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.start, range.end - 1),
            )
            .send()
            .await
            .map_err(transport)?;
        Self::check_status(&resp, bucket, key, None)?;

        let partial = resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let body = resp.bytes().await.map_err(transport)?;
        if partial {
            return Ok(body);
        }
        // Server ignored the Range header and sent the full object.
        let end = (range.end as usize).min(body.len());
        let start = (range.start as usize).min(end);
        Ok(body.slice(start..end))
    }
}

/// Filesystem-backed store: `{root}/{bucket}/{key}`. Used for local authoring and tests.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let mut out = self.root.clone();
        for part in [bucket, key] {
            let p = Path::new(part);
            for c in p.components() {
                match c {
                    Component::Normal(seg) => out.push(seg),
                    Component::CurDir => {}
                    _ => {
                        return Err(StorageError::NotFound {
                            bucket: bucket.into(),
                            key: key.into(),
                        })
                    }
                }
            }
        }
        Ok(out)
    }

    async fn meta(&self, bucket: &str, key: &str) -> Result<(PathBuf, ObjectMeta), StorageError> {
        let path = self.path(bucket, key)?;
        let md = match tokio::fs::metadata(&path).await {
            Ok(md) if md.is_file() => md,
            Ok(_) => {
                return Err(StorageError::NotFound {
                    bucket: bucket.into(),
                    key: key.into(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    bucket: bucket.into(),
                    key: key.into(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let etag = format!("{:x}-{:x}", md.len(), mtime);
        Ok((
            path,
            ObjectMeta {
                size: md.len(),
                etag,
            },
        ))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StorageError> {
        Ok(self.meta(bucket, key).await?.1)
    }

    async fn get_to(
        &self,
        bucket: &str,
        key: &str,
        if_match: Option<&str>,
        max_bytes: u64,
        sink: &mut (dyn Write + Send),
    ) -> Result<ObjectMeta, StorageError> {
        let (path, meta) = self.meta(bucket, key).await?;
        if let Some(expected) = if_match {
            if expected != meta.etag {
                return Err(StorageError::PreconditionFailed {
                    bucket: bucket.into(),
                    key: key.into(),
                    etag: expected.into(),
                });
            }
        }
        if meta.size > max_bytes {
            return Err(StorageError::TooLarge {
                bucket: bucket.into(),
                key: key.into(),
                max: max_bytes,
            });
        }

        let mut file = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
        }
        sink.flush()?;
        Ok(meta)
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes, StorageError> {
        let (path, meta) = self.meta(bucket, key).await?;
        let end = range.end.min(meta.size);
        if range.start >= end {
            return Ok(Bytes::new());
        }
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (end - range.start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[test]
    fn test_http_url_building() {
        let store = HttpObjectStore::new("http://localhost:9000/", None).unwrap();
        let url = store.url("datasets", "shop/orders v2.parquet").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/datasets/shop/orders%20v2.parquet"
        );
    }

    #[tokio::test]
    async fn test_local_store_roundtrip_and_etag_precondition() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/k")).unwrap();
        std::fs::write(dir.path().join("b/k/data.bin"), b"0123456789").unwrap();
        let store = LocalObjectStore::new(dir.path());

        let meta = store.head("b", "k/data.bin").await.unwrap();
        assert_eq!(meta.size, 10);

        let mut sink = Vec::new();
        store
            .get_to("b", "k/data.bin", Some(&meta.etag), 1024, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink, b"0123456789");

        let err = store
            .get_to("b", "k/data.bin", Some("stale"), 1024, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed { .. }));

        let part = store.get_range("b", "k/data.bin", 2..5).await.unwrap();
        assert_eq!(&part[..], b"234");

        assert!(matches!(
            store.head("b", "../escape").await.unwrap_err(),
            StorageError::NotFound { .. }
        ));
    }
}

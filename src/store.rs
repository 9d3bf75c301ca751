//! Object storage for raw uploads.

use crate::IngestResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

pub type ObjectReader = Box<dyn AsyncRead + Unpin + Send>;

/// Put/get by key. Implementations must tolerate concurrent callers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> IngestResult<()>;
    async fn get(&self, key: &str) -> IngestResult<ObjectReader>;
}

/// `bms/csv/YYYY/MM/DD/<token>.csv`
pub fn object_key(token: &str, day: NaiveDate) -> String {
    format!("bms/csv/{}/{}.csv", day.format("%Y/%m/%d"), token)
}

/// Objects as files under a root directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        let rel = Path::new(key);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("object key escapes store root: {key}"),
            ));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, body: Bytes) -> IngestResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> IngestResult<ObjectReader> {
        let file = tokio::fs::File::open(self.path_for(key)?).await?;
        Ok(Box::new(file))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes) -> IngestResult<()> {
        self.objects.lock().insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> IngestResult<ObjectReader> {
        let body = self.objects.lock().get(key).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no object at {key}"))
        })?;
        Ok(Box::new(io::Cursor::new(body)))
    }
}

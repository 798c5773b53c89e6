use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{fs, sync::Mutex};
use tracing::debug;

use crate::storage::{
    metadata::Document,
    traits::{MetadataStorage, MetricRecord, StorageResult, VersionRecord},
};

/// A metadata store persisted as a single JSON document.
///
/// The document is loaded once when the store is opened and rewritten on every mutation. A
/// mutation is only visible in memory once it has been written to disk.
#[derive(Clone, Debug)]
pub struct JsonStore {
    path: Arc<PathBuf>,
    document: Arc<Mutex<Document>>,
}

impl JsonStore {
    /// Opens the store at `path`. A missing file is treated as an empty document.
    ///
    /// # Errors
    /// Fails if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("malformed metadata document {}", path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no metadata document at {}: starting empty", path.display());
                Document::default()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read metadata document {}", path.display()))
            }
        };
        Ok(Self {
            path: Arc::new(path),
            document: Arc::new(Mutex::new(document)),
        })
    }

    /// Applies `mutate` to a copy of the document, persists the copy and swaps it in.
    async fn update<F>(&self, mutate: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Document) + Send,
    {
        let mut document = self.document.lock().await;
        let mut next = document.clone();
        mutate(&mut next);
        self.persist(&next).await?;
        *document = next;
        Ok(())
    }

    async fn persist(&self, document: &Document) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, self.path.as_ref())
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStorage for JsonStore {
    async fn version(&mut self, name: &str) -> StorageResult<Option<VersionRecord>> {
        Ok(self.document.lock().await.version(name))
    }

    async fn set_version(&mut self, record: &VersionRecord) -> StorageResult<()> {
        self.update(|document| document.set_version(record)).await
    }

    async fn append_metric(&mut self, record: &MetricRecord) -> StorageResult<()> {
        self.update(|document| document.append_metric(record)).await
    }

    async fn metrics(&mut self) -> StorageResult<Vec<MetricRecord>> {
        Ok(self.document.lock().await.metrics())
    }

    async fn metric_count(&mut self) -> StorageResult<u64> {
        Ok(self.document.lock().await.metric_count())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        match self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            Some(dir) if !dir.exists() => {
                fs::create_dir_all(dir).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::storage::{
    metadata::Document,
    traits::{MetadataStorage, MetricRecord, StorageResult, VersionRecord},
};

/// A metadata store that lives as long as the process. All clones share the same content.
#[derive(Clone, Debug, Default)]
pub struct InMemory(Arc<Mutex<Document>>);

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStorage for InMemory {
    async fn version(&mut self, name: &str) -> StorageResult<Option<VersionRecord>> {
        Ok(self.0.lock().await.version(name))
    }

    async fn set_version(&mut self, record: &VersionRecord) -> StorageResult<()> {
        self.0.lock().await.set_version(record);
        Ok(())
    }

    async fn append_metric(&mut self, record: &MetricRecord) -> StorageResult<()> {
        self.0.lock().await.append_metric(record);
        Ok(())
    }

    async fn metrics(&mut self) -> StorageResult<Vec<MetricRecord>> {
        Ok(self.0.lock().await.metrics())
    }

    async fn metric_count(&mut self) -> StorageResult<u64> {
        Ok(self.0.lock().await.metric_count())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

//! Storage API of the version registry and the metric ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, malformed documents, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// The version of the artifact currently in the live slot, keyed by model name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub name: String,
    pub version: String,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
}

/// One evaluation result of one artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub model_name: String,
    pub version: String,
    pub accuracy: f64,
    pub loss: f64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
/// An abstract store for the version registry and the metric ledger.
pub trait MetadataStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Returns the [`VersionRecord`] of a model.
    ///
    /// # Behavior
    ///
    /// - If the model has never been registered, return `StorageResult::Ok(None)`.
    /// - Otherwise, return `StorageResult::Ok(Some(VersionRecord))`.
    async fn version(&mut self, name: &str) -> StorageResult<Option<VersionRecord>>;

    /// Sets the [`VersionRecord`] of a model.
    ///
    /// # Behavior
    ///
    /// - If no record exists for `record.name`, insert it.
    /// - If a record exists, overwrite it.
    async fn set_version(&mut self, record: &VersionRecord) -> StorageResult<()>;

    /// Inserts a [`VersionRecord`] unless the model is already registered.
    ///
    /// Returns whether the record was inserted.
    async fn seed_version(&mut self, record: &VersionRecord) -> StorageResult<bool> {
        if self.version(&record.name).await?.is_some() {
            return Ok(false);
        }
        self.set_version(record).await?;
        Ok(true)
    }

    /// Appends a [`MetricRecord`] to the ledger. Records are never updated or deleted.
    async fn append_metric(&mut self, record: &MetricRecord) -> StorageResult<()>;

    /// Returns all [`MetricRecord`]s ordered by `created_at`, oldest first.
    async fn metrics(&mut self) -> StorageResult<Vec<MetricRecord>>;

    /// Returns the number of [`MetricRecord`]s in the ledger.
    async fn metric_count(&mut self) -> StorageResult<u64>;

    /// Checks if the [`MetadataStorage`] is ready to process requests.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

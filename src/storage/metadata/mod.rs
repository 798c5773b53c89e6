//! Backends of the version registry and the metric ledger.

pub mod in_memory;
pub mod json;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::traits::{MetricRecord, VersionRecord};

pub use self::{in_memory::InMemory, json::JsonStore};

/// The content shared by all metadata backends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Document {
    #[serde(default)]
    versions: BTreeMap<String, VersionRecord>,
    #[serde(default)]
    metrics: Vec<MetricRecord>,
}

impl Document {
    fn version(&self, name: &str) -> Option<VersionRecord> {
        self.versions.get(name).cloned()
    }

    fn set_version(&mut self, record: &VersionRecord) {
        self.versions.insert(record.name.clone(), record.clone());
    }

    fn append_metric(&mut self, record: &MetricRecord) {
        self.metrics.push(record.clone());
    }

    fn metrics(&self) -> Vec<MetricRecord> {
        let mut metrics = self.metrics.clone();
        // stable: records with equal timestamps keep their insertion order
        metrics.sort_by_key(|record| record.created_at);
        metrics
    }

    fn metric_count(&self) -> u64 {
        self.metrics.len() as u64
    }
}

//! Artifact zones and metadata stores.

pub mod artifacts;
pub mod metadata;
pub mod stamp;
pub mod traits;

pub use self::{
    artifacts::{ArchivedArtifact, ArtifactError, ArtifactStore, CleanupReport, StagedUpdate},
    metadata::{InMemory, JsonStore},
    stamp::{Stamp, StampClock},
    traits::{MetadataStorage, MetricRecord, StorageError, StorageResult, VersionRecord},
};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    procedures::{Evaluator, Merger},
    settings::{AggregationSettings, RecoverySettings, StorageSettings},
    state_machine::{
        events::{EventPublisher, EventSubscriber, LiveModelUpdate},
        file_label,
        Aggregator,
        PhaseName,
        Pipeline,
    },
    storage::{
        ArtifactError,
        ArtifactStore,
        MetadataStorage,
        MetricRecord,
        StorageError,
        VersionRecord,
    },
};

type InitializationResult<T> = Result<T, InitializationError>;

/// Error that can occur during the initialization of the [`Aggregator`].
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("initializing the artifact zones failed: {0}")]
    Artifacts(#[from] ArtifactError),
    #[error("metadata store is not ready: {0}")]
    Metadata(StorageError),
}

/// The aggregator initializer that recovers the live model and builds a new [`Aggregator`].
pub struct AggregatorInitializer<M, E, S>
where
    M: Merger,
    E: Evaluator,
    S: MetadataStorage,
{
    aggregation_settings: AggregationSettings,
    storage_settings: StorageSettings,
    recovery_settings: RecoverySettings,
    store: ArtifactStore,
    merger: M,
    evaluator: E,
    metadata: S,
}

impl<M, E, S> AggregatorInitializer<M, E, S>
where
    M: Merger,
    E: Evaluator,
    S: MetadataStorage,
{
    /// Creates a new [`AggregatorInitializer`].
    pub fn new(
        aggregation_settings: AggregationSettings,
        storage_settings: StorageSettings,
        recovery_settings: RecoverySettings,
        store: ArtifactStore,
        merger: M,
        evaluator: E,
        metadata: S,
    ) -> Self {
        Self {
            aggregation_settings,
            storage_settings,
            recovery_settings,
            store,
            merger,
            evaluator,
            metadata,
        }
    }

    /// Initializes a new [`Aggregator`].
    ///
    /// 1. Creates the staging and archive zones and checks the metadata store. Only this step
    ///    can fail.
    /// 2. Seeds the version registry from the live slot if the model was never registered.
    /// 3. Resolves the live model pointer: the most recently modified archived artifact, or
    ///    the default model if the archive zone holds none.
    ///
    /// The returned [`Backfill`] is meant to be spawned; it evaluates the reference artifacts
    /// and fills the metric history without holding up the service.
    pub async fn init(
        mut self,
    ) -> InitializationResult<(Aggregator<M, E, S>, EventSubscriber, Backfill<E, S>)> {
        self.store.init().await?;
        self.metadata
            .is_ready()
            .await
            .map_err(InitializationError::Metadata)?;

        self.seed_version().await;
        let live_model = self.resolve_live_model().await;
        info!("serving {}", live_model.display());

        let (events, subscriber) =
            EventPublisher::init(0, PhaseName::Idle, LiveModelUpdate::New(live_model));

        let backfill = Backfill {
            model_name: self.aggregation_settings.model_name.clone(),
            baseline: self.recovery_settings.baseline.clone(),
            threshold: self.recovery_settings.backfill_threshold,
            store: self.store.clone(),
            evaluator: self.evaluator.clone(),
            metadata: self.metadata.clone(),
        };

        let aggregator = Aggregator::new(Pipeline {
            pass_id: 0,
            model_name: self.aggregation_settings.model_name,
            min_updates: self.aggregation_settings.min_updates,
            store: self.store,
            merger: self.merger,
            evaluator: self.evaluator,
            metadata: self.metadata,
            events,
        });

        Ok((aggregator, subscriber, backfill))
    }

    /// Registers the artifact of the live slot, labeled by its modification time, unless the
    /// model is registered already.
    async fn seed_version(&mut self) {
        let live = match self.store.live().await {
            Ok(Some(live)) => live,
            Ok(None) => {
                debug!("live slot is empty: no version to seed");
                return;
            }
            Err(err) => {
                warn!("failed to inspect the live slot: {}", err);
                return;
            }
        };

        let record = VersionRecord {
            name: self.aggregation_settings.model_name.clone(),
            version: DateTime::<Utc>::from(live.modified)
                .format("%Y%m%d%H%M%S")
                .to_string(),
            size: live.size,
            updated_at: Utc::now(),
        };
        match self.metadata.seed_version(&record).await {
            Ok(true) => info!("seeded {} with version {}", record.name, record.version),
            Ok(false) => debug!("{} is registered already", record.name),
            Err(err) => warn!("failed to seed the version of {}: {:?}", record.name, err),
        }
    }

    async fn resolve_live_model(&self) -> PathBuf {
        match self.store.newest_archived().await {
            Ok(Some(newest)) => return newest.path,
            Ok(None) => debug!("archive zone is empty"),
            Err(err) => warn!("failed to scan the archive zone: {}", err),
        }

        let default = self.storage_settings.default_model.clone();
        if !exists(&default).await {
            warn!(
                "default model {} does not exist: serving will fail until a pass succeeds",
                default.display()
            );
        }
        default
    }
}

/// Fills the metric history at startup.
///
/// The reference artifacts (the pristine baseline and the live slot) are always evaluated. If
/// the metric ledger then holds at most `threshold` records, every archived artifact is
/// evaluated too, labeled by its file name.
pub struct Backfill<E, S> {
    model_name: String,
    baseline: Option<PathBuf>,
    threshold: u64,
    store: ArtifactStore,
    evaluator: E,
    metadata: S,
}

impl<E, S> Backfill<E, S>
where
    E: Evaluator,
    S: MetadataStorage,
{
    /// Runs the backfill. Returns the number of appended metric records.
    pub async fn run(mut self) -> usize {
        let mut references = Vec::with_capacity(2);
        if let Some(baseline) = self.baseline.take() {
            references.push((baseline, "original_baseline".to_string()));
        }
        references.push((self.store.live_path().to_path_buf(), "current_live".to_string()));

        let mut appended = 0;
        for (path, label) in references {
            appended += self.evaluate(&path, label).await;
        }

        let count = match self.metadata.metric_count().await {
            Ok(count) => count,
            Err(err) => {
                warn!("failed to count the metric records: {:?}", err);
                return appended;
            }
        };
        if count > self.threshold {
            debug!("{} metric records present: no backfill needed", count);
            return appended;
        }

        info!("{} metric records present: backfilling from the archive", count);
        match self.store.archived().await {
            Ok(archived) => {
                for artifact in archived {
                    appended += self.evaluate(&artifact.path, file_label(&artifact.path)).await;
                }
            }
            Err(err) => warn!("failed to scan the archive zone: {}", err),
        }
        appended
    }

    async fn evaluate(&mut self, path: &Path, label: String) -> usize {
        if !exists(path).await {
            info!("{} does not exist: skipping {}", path.display(), label);
            return 0;
        }
        let evaluation = match self.evaluator.evaluate(path).await {
            Ok(evaluation) => evaluation,
            Err(err) => {
                warn!("failed to evaluate {}: {}", path.display(), err);
                return 0;
            }
        };
        let record = MetricRecord {
            model_name: self.model_name.clone(),
            version: label,
            accuracy: evaluation.accuracy,
            loss: evaluation.loss,
            created_at: Utc::now(),
        };
        match self.metadata.append_metric(&record).await {
            Ok(()) => 1,
            Err(err) => {
                warn!("failed to record metrics of {}: {:?}", record.version, err);
                0
            }
        }
    }
}

async fn exists(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

//! The aggregation state machine.
//!
//! An aggregation pass runs the following phases in order:
//!
//! - **Gating**: lists the staging zone. A pass with fewer staged updates than required ends
//!   here and leaves every zone and every record untouched.
//! - **Merging**: hands the staged updates to the [`Merger`], which writes a new artifact into
//!   the archive zone. A failed merge ends the pass; the staged updates are retried by the next
//!   pass.
//! - **Evaluating**: scores the artifact of the live slot (as `previous`) and the merged
//!   artifact with the [`Evaluator`]. A failed evaluation is logged and skipped; it never
//!   prevents the promotion.
//! - **Promoting**: moves the artifact of the live slot into the archive zone and writes the
//!   merged artifact into the live slot. The live model pointer is updated afterwards.
//! - **Recording**: updates the version registry and appends the collected metrics.
//! - **Cleanup**: removes exactly the staged updates that were merged.
//!
//! At most one pass runs at a time. A pass that is started while another one is running is
//! skipped without any side effect (see [`Aggregator::run_pass`]).
//!
//! A pass is driven either by the [`Scheduler`] at a fixed interval or on demand through a
//! [`TriggerHandle`]. The [`AggregatorInitializer`] recovers the live model pointer at startup
//! and hands out a [`Backfill`] task which fills the metric history in the background.

pub mod events;
pub mod initializer;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod tests;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use derive_more::Display;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, error_span, info, warn};
use tracing_futures::Instrument;

pub use self::{
    events::{Event, EventListener, EventPublisher, EventSubscriber, LiveModelUpdate},
    initializer::{AggregatorInitializer, Backfill, InitializationError},
    scheduler::{Scheduler, TriggerError, TriggerHandle},
};
use crate::{
    procedures::{Evaluator, MergeError, Merger},
    storage::{
        ArtifactError,
        ArtifactStore,
        CleanupReport,
        MetadataStorage,
        MetricRecord,
        StagedUpdate,
        VersionRecord,
    },
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Gating")]
    Gating,
    #[display(fmt = "Merging")]
    Merging,
    #[display(fmt = "Evaluating")]
    Evaluating,
    #[display(fmt = "Promoting")]
    Promoting,
    #[display(fmt = "Recording")]
    Recording,
    #[display(fmt = "Cleanup")]
    Cleanup,
}

/// Error that aborts an aggregation pass.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("listing the staged updates failed: {0}")]
    Gating(#[source] ArtifactError),
    #[error("merging the staged updates failed: {0}")]
    Merging(#[from] MergeError),
    #[error("promoting the merged artifact failed: {0}")]
    Promoting(#[source] ArtifactError),
}

impl PassError {
    /// The phase in which the pass was aborted.
    pub fn phase(&self) -> PhaseName {
        match self {
            Self::Gating(_) => PhaseName::Gating,
            Self::Merging(_) => PhaseName::Merging,
            Self::Promoting(_) => PhaseName::Promoting,
        }
    }
}

/// The outcome of an aggregation pass.
#[derive(Debug)]
pub enum PassOutcome {
    /// Another pass was running.
    Skipped,
    /// Not enough updates were staged.
    BelowThreshold { staged: usize, required: usize },
    /// The pass was aborted. Nothing was promoted.
    Failed(PassError),
    /// A merged artifact was promoted to the live slot.
    Promoted(PassReport),
}

/// What a successful pass did.
#[derive(Debug)]
pub struct PassReport {
    pub pass_id: u64,
    /// The merged artifact in the archive zone, now pointed to by the live model pointer.
    pub artifact: PathBuf,
    /// Where the previous artifact of the live slot was archived, if there was one.
    pub archived: Option<PathBuf>,
    /// The version label of the promoted artifact.
    pub version: String,
    /// Whether `version` was stored in the version registry. If not, the registry still
    /// describes the previous artifact.
    pub registered: bool,
    pub size: u64,
    /// The number of staged updates that were merged.
    pub merged: usize,
    /// The number of metric records that were appended.
    pub metrics: usize,
    pub cleanup: CleanupReport,
}

/// Runs aggregation passes, one at a time.
///
/// All clones share the same pipeline and the same pass lock.
pub struct Aggregator<M, E, S> {
    pipeline: Arc<Mutex<Pipeline<M, E, S>>>,
}

impl<M, E, S> Clone for Aggregator<M, E, S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<M, E, S> Aggregator<M, E, S>
where
    M: Merger,
    E: Evaluator,
    S: MetadataStorage,
{
    pub(in crate::state_machine) fn new(pipeline: Pipeline<M, E, S>) -> Self {
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
        }
    }

    /// Runs one aggregation pass to completion.
    ///
    /// If another pass holds the lock, returns [`PassOutcome::Skipped`] immediately. Nothing is
    /// queued: the next pass happens at the next tick or trigger.
    pub async fn run_pass(&self) -> PassOutcome {
        let mut pipeline = match self.pipeline.try_lock() {
            Ok(pipeline) => pipeline,
            Err(_) => {
                debug!("aggregation pass already in progress: skipping");
                return PassOutcome::Skipped;
            }
        };

        pipeline.pass_id += 1;
        let pass_id = pipeline.pass_id;
        pipeline.events.set_pass_id(pass_id);
        pipeline
            .run()
            .instrument(error_span!("run_pass", pass_id = pass_id))
            .await
    }
}

/// The collaborators and settings of an aggregation pass.
pub(in crate::state_machine) struct Pipeline<M, E, S> {
    pub(in crate::state_machine) pass_id: u64,
    pub(in crate::state_machine) model_name: String,
    pub(in crate::state_machine) min_updates: usize,
    pub(in crate::state_machine) store: ArtifactStore,
    pub(in crate::state_machine) merger: M,
    pub(in crate::state_machine) evaluator: E,
    pub(in crate::state_machine) metadata: S,
    pub(in crate::state_machine) events: EventPublisher,
}

struct Promotion {
    archived: Option<PathBuf>,
    size: u64,
}

impl<M, E, S> Pipeline<M, E, S>
where
    M: Merger,
    E: Evaluator,
    S: MetadataStorage,
{
    async fn run(&mut self) -> PassOutcome {
        let outcome = match self.try_run().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(phase = %err.phase(), "aggregation pass aborted: {}", err);
                PassOutcome::Failed(err)
            }
        };
        self.events.broadcast_phase(PhaseName::Idle);
        outcome
    }

    async fn try_run(&mut self) -> Result<PassOutcome, PassError> {
        let staged = self.gate().instrument(phase_span(PhaseName::Gating)).await?;
        if staged.len() < self.min_updates {
            info!(
                "{} staged updates, {} required: nothing to aggregate",
                staged.len(),
                self.min_updates
            );
            return Ok(PassOutcome::BelowThreshold {
                staged: staged.len(),
                required: self.min_updates,
            });
        }

        let artifact = self
            .merge(&staged)
            .instrument(phase_span(PhaseName::Merging))
            .await?;

        let evaluations = self
            .evaluate(&artifact)
            .instrument(phase_span(PhaseName::Evaluating))
            .await;

        let Promotion { archived, size } = self
            .promote(&artifact)
            .instrument(phase_span(PhaseName::Promoting))
            .await?;

        let version = self.store.stamp().version_label();
        let (registered, metrics) = self
            .record(&version, size, evaluations)
            .instrument(phase_span(PhaseName::Recording))
            .await;

        let cleanup = self
            .cleanup(&staged)
            .instrument(phase_span(PhaseName::Cleanup))
            .await;

        if registered {
            info!("promoted {} as version {}", artifact.display(), version);
        } else {
            warn!("promoted {} without registering version {}", artifact.display(), version);
        }
        Ok(PassOutcome::Promoted(PassReport {
            pass_id: self.pass_id,
            artifact,
            archived,
            version,
            registered,
            size,
            merged: staged.len(),
            metrics,
            cleanup,
        }))
    }

    async fn gate(&mut self) -> Result<Vec<StagedUpdate>, PassError> {
        self.events.broadcast_phase(PhaseName::Gating);
        let staged = self.store.staged().await.map_err(PassError::Gating)?;
        debug!("found {} staged updates", staged.len());
        Ok(staged)
    }

    async fn merge(&mut self, staged: &[StagedUpdate]) -> Result<PathBuf, PassError> {
        self.events.broadcast_phase(PhaseName::Merging);
        let inputs: Vec<PathBuf> = staged.iter().map(|update| update.path.clone()).collect();
        let output = self.store.merge_target();
        info!(
            "merging {} staged updates into {}",
            inputs.len(),
            output.display()
        );

        if let Err(err) = self.merger.merge(&inputs, &output).await {
            // the procedure may have left a partial output behind
            if let Err(remove_err) = self.store.remove(&output).await {
                warn!("failed to remove the incomplete merge output: {}", remove_err);
            }
            return Err(err.into());
        }
        Ok(output)
    }

    /// Evaluates the live slot and the merged artifact. Failed evaluations are skipped.
    async fn evaluate(&mut self, artifact: &Path) -> Vec<MetricRecord> {
        self.events.broadcast_phase(PhaseName::Evaluating);
        let mut candidates = Vec::with_capacity(2);
        match self.store.live().await {
            Ok(Some(_)) => {
                candidates.push((self.store.live_path().to_path_buf(), "previous".to_string()))
            }
            Ok(None) => debug!("live slot is empty: nothing to compare against"),
            Err(err) => warn!("failed to inspect the live slot: {}", err),
        }
        candidates.push((artifact.to_path_buf(), file_label(artifact)));

        let mut records = Vec::with_capacity(candidates.len());
        for (path, label) in candidates {
            match self.evaluator.evaluate(&path).await {
                Ok(evaluation) => {
                    info!(
                        "{}: accuracy {:.4}, loss {:.4}",
                        label, evaluation.accuracy, evaluation.loss
                    );
                    records.push(MetricRecord {
                        model_name: self.model_name.clone(),
                        version: label,
                        accuracy: evaluation.accuracy,
                        loss: evaluation.loss,
                        created_at: Utc::now(),
                    });
                }
                Err(err) => warn!("failed to evaluate {}: {}", path.display(), err),
            }
        }
        records
    }

    /// Archives the artifact of the live slot and writes the merged artifact into it.
    ///
    /// If the write fails, the archived artifact is moved back into the live slot. A merged
    /// artifact that was not promoted is removed from the archive zone so that startup recovery
    /// never resolves it.
    async fn promote(&mut self, artifact: &Path) -> Result<Promotion, PassError> {
        self.events.broadcast_phase(PhaseName::Promoting);
        match self.try_promote(artifact).await {
            Ok(promotion) => {
                self.events
                    .broadcast_live_model(LiveModelUpdate::New(artifact.to_path_buf()));
                Ok(promotion)
            }
            Err(err) => {
                if let Err(remove_err) = self.store.remove(artifact).await {
                    warn!(
                        "failed to remove the merged artifact that was not promoted: {}",
                        remove_err
                    );
                }
                Err(PassError::Promoting(err))
            }
        }
    }

    async fn try_promote(&mut self, artifact: &Path) -> Result<Promotion, ArtifactError> {
        let data = self.store.read(artifact).await?;
        let archived = self.store.archive_live(&self.model_name).await?;
        if let Some(archived) = &archived {
            info!("archived the previous live artifact as {}", archived.display());
        }

        if let Err(err) = self.store.write_live(&data).await {
            if let Some(archived) = &archived {
                match self.store.restore_live(archived).await {
                    Ok(()) => info!("restored the previous live artifact"),
                    Err(restore_err) => error!(
                        "failed to restore the previous live artifact, the live slot is empty: {}",
                        restore_err
                    ),
                }
            }
            return Err(err);
        }

        Ok(Promotion {
            archived,
            size: data.len() as u64,
        })
    }

    /// Registers the promoted version and appends the metrics. Returns whether the version was
    /// registered and the number of appended metric records.
    async fn record(
        &mut self,
        version: &str,
        size: u64,
        metrics: Vec<MetricRecord>,
    ) -> (bool, usize) {
        self.events.broadcast_phase(PhaseName::Recording);
        let record = VersionRecord {
            name: self.model_name.clone(),
            version: version.to_string(),
            size,
            updated_at: Utc::now(),
        };
        let registered = match self.metadata.set_version(&record).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "failed to register version {}, the version registry is stale: {:?}",
                    version, err
                );
                false
            }
        };

        let mut appended = 0;
        for metric in metrics {
            match self.metadata.append_metric(&metric).await {
                Ok(()) => appended += 1,
                Err(err) => warn!("failed to record metrics of {}: {:?}", metric.version, err),
            }
        }
        (registered, appended)
    }

    async fn cleanup(&mut self, staged: &[StagedUpdate]) -> CleanupReport {
        self.events.broadcast_phase(PhaseName::Cleanup);
        let report = self.store.discard(staged).await;
        if report.failed.is_empty() {
            debug!("removed {} processed updates", report.removed);
        } else {
            warn!(
                "removed {} processed updates, {} left behind",
                report.removed,
                report.failed.len()
            );
        }
        report
    }
}

fn phase_span(phase: PhaseName) -> tracing::Span {
    error_span!("run_phase", phase = %phase)
}

/// Labels an artifact by its file name.
pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

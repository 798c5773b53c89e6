//! The artifact store.
//!
//! The store manages three zones on the filesystem:
//!
//! - **staging**: uploaded updates awaiting aggregation,
//! - **archive**: merged and superseded artifacts, never mutated after creation,
//! - **live**: the single artifact served to clients.
//!
//! The store implements no policy; the aggregation pass decides what to move where.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::{
    settings::StorageSettings,
    storage::stamp::{Stamp, StampClock},
};

/// Error returned by the artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to create directory {0}: {1}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("failed to list {0}: {1}")]
    List(PathBuf, #[source] io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, #[source] io::Error),
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("failed to move {0} to {1}: {2}")]
    Move(PathBuf, PathBuf, #[source] io::Error),
    #[error("failed to remove {0}: {1}")]
    Remove(PathBuf, #[source] io::Error),
}

/// An uploaded update waiting in the staging zone.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StagedUpdate {
    pub path: PathBuf,
}

impl StagedUpdate {
    /// The caller visible identifier of the update.
    pub fn name(&self) -> String {
        file_name(&self.path)
    }
}

/// An immutable artifact of the archive zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivedArtifact {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl ArchivedArtifact {
    pub fn name(&self) -> String {
        file_name(&self.path)
    }
}

/// Filesystem metadata of the live slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveMetadata {
    pub size: u64,
    pub modified: SystemTime,
}

/// The outcome of removing processed updates from the staging zone.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: Vec<(PathBuf, io::Error)>,
}

/// A handle to the staging, archive and live zones.
///
/// Cloning the handle is cheap; all clones share the same stamp clock, so names handed out by
/// the intake and by the aggregation pass never collide.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    staging_dir: PathBuf,
    archive_dir: PathBuf,
    live_path: PathBuf,
    extension: String,
    clock: Arc<StampClock>,
}

impl ArtifactStore {
    /// Creates a new store for artifacts with the given file extension.
    pub fn new(settings: &StorageSettings, extension: impl Into<String>) -> Self {
        Self {
            staging_dir: settings.staging_dir.clone(),
            archive_dir: settings.archive_dir.clone(),
            live_path: settings.live_path.clone(),
            extension: extension.into(),
            clock: Arc::new(StampClock::new()),
        }
    }

    /// Creates the staging and archive zones as well as the parent directory of the live slot.
    ///
    /// # Errors
    /// Fails if one of the directories cannot be created. The service cannot run without them.
    pub async fn init(&self) -> Result<(), ArtifactError> {
        let live_dir = self.live_path.parent().filter(|dir| !dir.as_os_str().is_empty());
        for dir in [Some(self.staging_dir.as_path()), Some(self.archive_dir.as_path()), live_dir]
            .iter()
            .flatten()
        {
            fs::create_dir_all(dir)
                .await
                .map_err(|err| ArtifactError::CreateDir(dir.to_path_buf(), err))?;
        }
        Ok(())
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    /// Returns a fresh stamp of the store clock.
    pub fn stamp(&self) -> Stamp {
        self.clock.next()
    }

    /// Writes an uploaded update into the staging zone.
    ///
    /// The staged name is `update_<stamp>_<original name>`, where only the final component of
    /// the original name is kept. The content is not validated.
    pub async fn stage(
        &self,
        original_name: &str,
        data: &[u8],
    ) -> Result<StagedUpdate, ArtifactError> {
        let original = Path::new(original_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let name = format!("update_{}_{}", self.clock.next(), original);
        let path = self.staging_dir.join(name);
        write_atomic(&path, data).await?;
        debug!("staged update {}", path.display());
        Ok(StagedUpdate { path })
    }

    /// Lists the staged updates with the expected extension, in arrival order.
    ///
    /// Staged names start with their arrival stamp, so the name order is the arrival order.
    pub async fn staged(&self) -> Result<Vec<StagedUpdate>, ArtifactError> {
        let mut staged: Vec<StagedUpdate> = self
            .list_matching(&self.staging_dir)
            .await?
            .into_iter()
            .map(|(path, _)| StagedUpdate { path })
            .collect();
        staged.sort();
        Ok(staged)
    }

    /// Returns a fresh, unique path in the archive zone for a merged artifact.
    pub fn merge_target(&self) -> PathBuf {
        self.archive_dir
            .join(format!("global_model_{}.{}", self.clock.next(), self.extension))
    }

    /// Returns the filesystem metadata of the live slot if it is occupied.
    pub async fn live(&self) -> Result<Option<LiveMetadata>, ArtifactError> {
        match fs::metadata(&self.live_path).await {
            Ok(meta) if meta.is_file() => Ok(Some(LiveMetadata {
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ArtifactError::Read(self.live_path.clone(), err)),
        }
    }

    /// Moves the artifact of the live slot into the archive zone as
    /// `<model_name>_old_<stamp>.<ext>`.
    ///
    /// Returns the archived path, or `None` if the live slot was empty.
    pub async fn archive_live(&self, model_name: &str) -> Result<Option<PathBuf>, ArtifactError> {
        if self.live().await?.is_none() {
            return Ok(None);
        }
        let target = self.archive_dir.join(format!(
            "{}_old_{}.{}",
            model_name,
            self.clock.next(),
            self.extension
        ));
        fs::rename(&self.live_path, &target)
            .await
            .map_err(|err| ArtifactError::Move(self.live_path.clone(), target.clone(), err))?;
        Ok(Some(target))
    }

    /// Replaces the content of the live slot.
    ///
    /// The content is first written next to the live slot and then renamed over it, so readers
    /// never observe a partially written artifact.
    pub async fn write_live(&self, data: &[u8]) -> Result<(), ArtifactError> {
        write_atomic(&self.live_path, data).await
    }

    /// Moves a previously archived artifact back into the live slot.
    pub async fn restore_live(&self, archived: &Path) -> Result<(), ArtifactError> {
        fs::rename(archived, &self.live_path).await.map_err(|err| {
            ArtifactError::Move(archived.to_path_buf(), self.live_path.clone(), err)
        })
    }

    /// Reads an artifact.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        fs::read(path)
            .await
            .map_err(|err| ArtifactError::Read(path.to_path_buf(), err))
    }

    /// Removes a single artifact. A missing artifact is not an error.
    pub async fn remove(&self, path: &Path) -> Result<(), ArtifactError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ArtifactError::Remove(path.to_path_buf(), err)),
        }
    }

    /// Removes exactly the given updates from the staging zone.
    ///
    /// A failed removal is logged and reported but does not stop the removal of the others.
    pub async fn discard(&self, updates: &[StagedUpdate]) -> CleanupReport {
        let mut report = CleanupReport::default();
        for update in updates {
            match fs::remove_file(&update.path).await {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    warn!(
                        "failed to delete processed update {}: {}",
                        update.path.display(),
                        err
                    );
                    report.failed.push((update.path.clone(), err));
                }
            }
        }
        report
    }

    /// Lists the archived artifacts with the expected extension, in name order.
    pub async fn archived(&self) -> Result<Vec<ArchivedArtifact>, ArtifactError> {
        let mut archived: Vec<ArchivedArtifact> = self
            .list_matching(&self.archive_dir)
            .await?
            .into_iter()
            .map(|(path, modified)| ArchivedArtifact { path, modified })
            .collect();
        archived.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(archived)
    }

    /// Returns the archived artifact with the most recent modification time.
    ///
    /// Ties are broken by name, so the result does not depend on the listing order.
    pub async fn newest_archived(&self) -> Result<Option<ArchivedArtifact>, ArtifactError> {
        Ok(self
            .archived()
            .await?
            .into_iter()
            .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path))))
    }

    /// Lists the regular files of `dir` carrying the expected extension.
    async fn list_matching(&self, dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, ArtifactError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|err| ArtifactError::List(dir.to_path_buf(), err))?;
        let mut matching = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ArtifactError::List(dir.to_path_buf(), err))?
        {
            let path = entry.path();
            if !self.has_extension(&path) {
                continue;
            }
            // entries may vanish while we are listing, e.g. during a concurrent cleanup
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_file() {
                matching.push((path, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
            }
        }
        Ok(matching)
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy() == self.extension.as_str())
            .unwrap_or(false)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Writes `data` to a temporary sibling of `path` and renames it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ArtifactError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, data)
        .await
        .map_err(|err| ArtifactError::Write(tmp.clone(), err))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|err| ArtifactError::Move(tmp, path.to_path_buf(), err))
}

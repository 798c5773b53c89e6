use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::procedures::command::{ExternalCommand, ProcedureError};

/// Error returned by a [`Merger`].
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge procedure failed: {0}")]
    Procedure(#[from] ProcedureError),
    #[error("merge procedure succeeded but did not write {0}")]
    MissingOutput(PathBuf),
}

#[async_trait]
/// Merges several artifacts into one.
///
/// Merging the same inputs again, or a superset of inputs that were merged before, must be
/// safe: a pass whose cleanup did not complete re-merges the leftovers.
pub trait Merger
where
    Self: Clone + Send + Sync + 'static,
{
    /// Merges `inputs`, in the given order, into a new artifact at `output`.
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

/// A [`Merger`] that runs `<program> <args...> --output <output> <inputs...>`.
#[derive(Clone, Debug)]
pub struct CommandMerger(ExternalCommand);

impl CommandMerger {
    pub fn new(command: impl Into<ExternalCommand>) -> Self {
        Self(command.into())
    }
}

#[async_trait]
impl Merger for CommandMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        let mut args: Vec<OsString> = vec!["--output".into(), output.as_os_str().to_owned()];
        args.extend(inputs.iter().map(|input| input.as_os_str().to_owned()));

        let log = self.0.run(args).await?;
        debug!("merge procedure output: {}", log.trim_end());

        match fs::metadata(output).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(MergeError::MissingOutput(output.to_path_buf())),
        }
    }
}

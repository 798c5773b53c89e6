use std::{ffi::OsString, io, process::ExitStatus};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::settings::CommandSettings;

/// Error returned when an external procedure could not be run to a successful exit.
#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with {status}: {output}")]
    Failed {
        program: String,
        status: ExitStatus,
        output: String,
    },
}

/// An external program invoked with a fixed set of leading arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Runs the program with `extra` appended to the leading arguments and waits for it to exit.
    ///
    /// Returns the combined stdout and stderr on a successful exit.
    pub async fn run<I>(&self, extra: I) -> Result<String, ProcedureError>
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.args(extra.into_iter().map(Into::into));
        command.kill_on_drop(true);
        debug!("running {:?}", command);

        let output = command
            .output()
            .await
            .map_err(|source| ProcedureError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ProcedureError::Failed {
                program: self.program.clone(),
                status: output.status,
                output: combined,
            })
        }
    }
}

impl From<CommandSettings> for ExternalCommand {
    fn from(CommandSettings { program, args }: CommandSettings) -> Self {
        Self::new(program, args)
    }
}

use std::{ffi::OsStr, path::Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::procedures::command::{ExternalCommand, ProcedureError};

/// The quality of a single artifact.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub loss: f64,
}

/// Error returned by an [`Evaluator`].
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation procedure failed: {0}")]
    Procedure(#[from] ProcedureError),
    #[error("evaluation procedure reported no result: {0}")]
    NoResult(String),
}

#[async_trait]
/// Measures the quality of an artifact.
pub trait Evaluator
where
    Self: Clone + Send + Sync + 'static,
{
    async fn evaluate(&self, artifact: &Path) -> Result<Evaluation, EvaluationError>;
}

/// An [`Evaluator`] that runs `<program> <args...> --model <artifact>`.
///
/// The procedure may print arbitrary text; the first JSON object carrying a numeric `accuracy`
/// and `loss` is taken as the result.
#[derive(Clone, Debug)]
pub struct CommandEvaluator(ExternalCommand);

impl CommandEvaluator {
    pub fn new(command: impl Into<ExternalCommand>) -> Self {
        Self(command.into())
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(&self, artifact: &Path) -> Result<Evaluation, EvaluationError> {
        let output = self
            .0
            .run([OsStr::new("--model"), artifact.as_os_str()])
            .await?;
        let evaluation = parse_evaluation(&output)
            .ok_or_else(|| EvaluationError::NoResult(output.trim().to_string()))?;
        debug!(
            "evaluated {}: accuracy {} loss {}",
            artifact.display(),
            evaluation.accuracy,
            evaluation.loss
        );
        Ok(evaluation)
    }
}

/// Finds the first JSON object in `output` that describes an [`Evaluation`].
pub fn parse_evaluation(output: &str) -> Option<Evaluation> {
    output.match_indices('{').find_map(|(start, _)| {
        serde_json::Deserializer::from_str(&output[start..])
            .into_iter::<Evaluation>()
            .next()
            .and_then(Result::ok)
    })
}

//! The external merge and evaluation procedures.
//!
//! Both are opaque to the coordinator: the [`Merger`] turns a set of staged updates into one
//! artifact and the [`Evaluator`] scores an artifact. The command implementations run a
//! configured program as a child process.

pub mod command;
pub mod evaluate;
pub mod merge;

pub use self::{
    command::{ExternalCommand, ProcedureError},
    evaluate::{parse_evaluation, CommandEvaluator, Evaluation, EvaluationError, Evaluator},
    merge::{CommandMerger, MergeError, Merger},
};

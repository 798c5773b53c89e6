//! `chithram-fl` is the federated learning side of the Chithram photo backup server.
//!
//! Devices train the on-device face detection model locally and upload the resulting model
//! updates. This crate collects those updates, periodically merges them into a new global model,
//! evaluates it and promotes it to the model that is served back to the devices.
//!
//! # Artifact zones
//!
//! Model artifacts live in three places on the local filesystem:
//! - the **staging zone** holds uploaded updates until an aggregation pass consumes them,
//! - the **archive** holds every merged global model as well as the superseded live models,
//! - the **live slot** is the single file that is served under the stable model name.
//!
//! See the [`storage`] module for the details.
//!
//! # Aggregation passes
//!
//! An aggregation pass runs through a fixed sequence of phases:
//!
//! ```text
//! Idle -> Gating -> Merging -> Evaluating -> Promoting -> Recording -> Cleanup -> Idle
//! ```
//!
//! A pass only merges when at least `min_updates` updates are staged. Merging and evaluation are
//! delegated to external procedures (see [`procedures`]). A failed evaluation never prevents a
//! promotion, while a failed merge leaves every staged update in place for the next pass. Passes
//! are started by the [`Scheduler`](state_machine::Scheduler) at a fixed interval or on demand and
//! never overlap.
//!
//! # Live model pointer
//!
//! The aggregator publishes the artifact it considers live through an event channel. At startup
//! the pointer is recovered from the newest archived artifact, falling back to the configured
//! default model. The REST API reads the pointer to serve the global model.
//!
//! # REST API
//!
//! | Route                       | Description                               |
//! |-----------------------------|-------------------------------------------|
//! | `POST /fl/update`           | upload a model update (multipart)         |
//! | `GET /fl/global`            | download the current global model         |
//! | `GET /fl/metrics`           | list the recorded evaluation metrics      |
//! | `POST /fl/aggregate`        | request an immediate aggregation pass     |
//! | `GET /models/{name}/info`   | version information of a served model     |
//! | `GET /models/{name}/download` | download the live slot of a served model |

pub mod procedures;
pub mod rest;
pub mod settings;
pub mod state_machine;
pub mod storage;

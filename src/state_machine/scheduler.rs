use std::time::Duration;

use displaydoc::Display;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    procedures::{Evaluator, Merger},
    state_machine::Aggregator,
    storage::MetadataStorage,
};

/// Error returned when a pass request is not accepted.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum TriggerError {
    /// An aggregation pass is already requested.
    Pending,
    /// The aggregation scheduler is not running.
    Stopped,
}

/// Requests an immediate aggregation pass from a [`Scheduler`].
#[derive(Clone, Debug)]
pub struct TriggerHandle(mpsc::Sender<()>);

impl TriggerHandle {
    /// Requests a pass.
    ///
    /// A request that arrives while a pass is running is dropped once that pass is over.
    pub fn trigger(&self) -> Result<(), TriggerError> {
        self.0.try_send(()).map_err(|err| match err {
            TrySendError::Full(()) => {
                debug!("aggregation pass already requested");
                TriggerError::Pending
            }
            TrySendError::Closed(()) => {
                warn!("aggregation scheduler is not running");
                TriggerError::Stopped
            }
        })
    }
}

/// Runs an aggregation pass at a fixed interval and whenever a [`TriggerHandle`] asks for one.
pub struct Scheduler<M, E, S> {
    aggregator: Aggregator<M, E, S>,
    interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
}

impl<M, E, S> Scheduler<M, E, S>
where
    M: Merger,
    E: Evaluator,
    S: MetadataStorage,
{
    pub fn new(aggregator: Aggregator<M, E, S>, interval: Duration) -> (Self, TriggerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let scheduler = Self {
            aggregator,
            interval,
            trigger_rx,
        };
        (scheduler, TriggerHandle(trigger_tx))
    }

    /// Runs the scheduler until the task is dropped. The first scheduled pass happens one
    /// interval after the start.
    pub async fn run(mut self) {
        let mut ticks = time::interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    debug!("scheduled aggregation pass");
                }
                trigger = self.trigger_rx.recv(), if triggers_open => {
                    if trigger.is_none() {
                        triggers_open = false;
                        continue;
                    }
                    info!("aggregation pass requested");
                }
            }

            self.aggregator.run_pass().await;

            while self.trigger_rx.try_recv().is_ok() {
                debug!("dropping a pass request received during the pass");
            }
        }
    }
}

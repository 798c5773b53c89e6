//! This module provides the aggregator's `Event`s, `EventPublisher` and `EventSubscriber` types.
//!
//! The live model pointer is one of these events: the aggregation pass is its only writer and
//! the REST layer reads it through an [`EventListener`].

use std::path::PathBuf;

use tokio::sync::watch;

use crate::state_machine::PhaseName;

/// An event emitted by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<E> {
    /// The id of the pass in which the event was emitted. Events emitted during startup
    /// recovery carry the id `0`.
    pub pass_id: u64,
    /// The event itself
    pub event: E,
}

/// Live model pointer update event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveModelUpdate {
    Invalidate,
    New(PathBuf),
}

/// A convenience type to emit any aggregator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Pass ID that is attached to all the events.
    pass_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    live_model_tx: EventBroadcaster<LiveModelUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any aggregator event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    live_model_rx: EventListener<LiveModelUpdate>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        pass_id: u64,
        phase: PhaseName,
        live_model: LiveModelUpdate,
    ) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            pass_id,
            event: phase,
        });

        let (live_model_tx, live_model_rx) = watch::channel::<Event<LiveModelUpdate>>(Event {
            pass_id,
            event: live_model,
        });

        let publisher = EventPublisher {
            pass_id,
            phase_tx: phase_tx.into(),
            live_model_tx: live_model_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            live_model_rx: live_model_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the pass ID that is attached to the events the publisher broadcasts.
    pub fn set_pass_id(&mut self, id: u64) {
        self.pass_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            pass_id: self.pass_id,
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a live model event
    pub fn broadcast_live_model(&mut self, update: LiveModelUpdate) {
        self.live_model_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for live model events
    pub fn live_model_listener(&self) -> EventListener<LiveModelUpdate> {
        self.live_model_rx.clone()
    }
}

/// A listener for aggregator events. It can be used to either retrieve the latest `Event<E>`
/// emitted by the aggregator (with `EventListener::get_latest`) or to wait for an event (with
/// `EventListener::wait_for`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits until the latest event satisfies `condition`.
    ///
    /// Returns `None` if the publisher is gone and the latest event does not satisfy `condition`.
    pub async fn wait_for<F>(&mut self, mut condition: F) -> Option<Event<E>>
    where
        F: FnMut(&Event<E>) -> bool,
    {
        loop {
            {
                let latest = self.0.borrow_and_update();
                if condition(&latest) {
                    return Some(latest.clone());
                }
            }
            self.0.changed().await.ok()?;
        }
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // the value is replaced even if there is no listener left
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}

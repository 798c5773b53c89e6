//! Monotonic stamps for artifact names and version labels.

use std::{
    cmp,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, TimeZone, Utc};
use derive_more::Display;

/// A point in time that is unique within a [`StampClock`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord)]
#[display(fmt = "{}", _0)]
pub struct Stamp(i64);

impl Stamp {
    /// Nanoseconds since the unix epoch.
    pub fn nanos(&self) -> i64 {
        self.0
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    /// The label under which a promoted artifact is registered, e.g. `20240131235959123456789`.
    pub fn version_label(&self) -> String {
        self.datetime().format("%Y%m%d%H%M%S%f").to_string()
    }
}

/// Hands out strictly increasing [`Stamp`]s, even if the wall clock stalls or goes backwards.
#[derive(Debug, Default)]
pub struct StampClock {
    last: AtomicI64,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Stamp {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        // the closure never returns `None`, so the update always succeeds
        let previous = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(cmp::max(now, last + 1))
            }) {
            Ok(previous) | Err(previous) => previous,
        };
        Stamp(cmp::max(now, previous + 1))
    }
}

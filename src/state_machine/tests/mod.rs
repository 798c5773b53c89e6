//! Aggregation pass, recovery and scheduler tests.

pub mod utils;

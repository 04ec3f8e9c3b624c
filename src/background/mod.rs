//! Background services: named job groups and panic isolation.
//!
//! Relays and vehicles run their heartbeat, ping, relay and executor loops
//! as jobs in a [`JobGroup`]; hooks and callbacks run through [`isolate`].

pub mod isolation;
pub mod jobs;

pub use isolation::{isolate, isolate_sync};
pub use jobs::{JobGroup, JobName};

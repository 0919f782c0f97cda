//! Cron and heartbeat producers of synthetic inbound events.
//!
//! # Overview
//!
//! Two independent producers feed the `system` channel:
//!
//! - [`engine::SchedulerEngine`] polls a [`store::JobStore`] (a `jobs.json`
//!   file, rewritten atomically on every mutation) every second and
//!   publishes one synthetic event per due job via an
//!   [`warden_core::InboundPublisherPort`]. One-shot `at` jobs are deleted
//!   after firing.
//! - [`heartbeat::HeartbeatEngine`] fires a fixed-interval prompt
//!   independent of any job store.
//!
//! Neither producer calls the responder directly; both publish through the
//! same port the channel adapters use, so the orchestrator decides what a
//! `system`-channel event means.

pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{SchedulerEngine, SYSTEM_CHANNEL};
pub use error::{Result, SchedulerError};
pub use heartbeat::HeartbeatEngine;
pub use schedule::compute_next_run_ms;
pub use store::JobStore;
pub use types::{CronJob, Payload, Schedule};

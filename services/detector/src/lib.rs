//! Parking occupancy detection engine.
//!
//! Each registered parking lot gets its own worker that pulls frames from the
//! lot's camera feed, classifies every spot with a foreground-density
//! heuristic, debounces the raw observations and publishes a snapshot. A sync
//! client periodically delivers the latest snapshots to the backend, and an
//! HTTP API manages the set of lots.
//!
//! # Architecture
//!
//! ```text
//! Feed -> LotWorker (classify + stabilize) -> watch snapshot -+-> SyncClient -> Backend
//!                                                              +-> Status API
//! ```

pub mod api;
pub mod classifier;
pub mod config;
pub mod debug_images;
pub mod frame;
pub mod lot;
pub mod pacing;
pub mod scheduler;
pub mod source;
pub mod stabilizer;
pub mod sync;
pub mod telemetry;
pub mod worker;

pub use config::DetectorConfig;
pub use scheduler::{Scheduler, SchedulerError, UpsertOutcome};
pub use source::{DefaultSourceFactory, SourceFactory};
pub use sync::{BackendSink, HttpBackendSink, SnapshotProvider, SyncClient};

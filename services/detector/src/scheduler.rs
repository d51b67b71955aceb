//! Lot registry and worker lifecycle.
//!
//! The scheduler is the only owner of the registry mapping lot ids to running
//! workers. Registering, replacing and removing lots are synchronous with
//! respect to the registry: when `upsert` or `remove` returns, status queries
//! and sync batches already reflect the change. Stopping a replaced or removed
//! worker happens in the background.

use crate::classifier::{ClassifierParams, SpotClassifier};
use crate::config::DetectorConfig;
use crate::lot::{LotConfig, LotId, LotValidationError, SpotId};
use crate::source::{Feed, SourceError, SourceFactory};
use crate::stabilizer::SpotState;
use crate::sync::SnapshotProvider;
use crate::telemetry;
use crate::worker::{LotSnapshot, LotWorker, WorkerSettings, WorkerStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] LotValidationError),

    #[error("Parking lot {0} not found")]
    NotFound(LotId),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Result of a register-or-replace call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Replaced,
    Unchanged,
}

/// Summary row for the status listing.
#[derive(Debug, Clone, Serialize)]
pub struct LotStatus {
    pub lot_id: LotId,
    pub name: String,
    pub status: WorkerStatus,
    pub spot_count: usize,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub skip_factor: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

struct WorkerHandle {
    config: Arc<LotConfig>,
    cancel: CancellationToken,
    snapshot: watch::Receiver<Arc<LotSnapshot>>,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

impl WorkerHandle {
    fn latest(&self) -> Arc<LotSnapshot> {
        self.snapshot.borrow().clone()
    }
}

pub struct Scheduler {
    settings: WorkerSettings,
    factory: Arc<dyn SourceFactory>,
    classifier: Arc<SpotClassifier>,
    pool: Arc<Semaphore>,
    max_workers: usize,
    shutdown_timeout: Duration,
    workers: RwLock<HashMap<LotId, WorkerHandle>>,
}

impl Scheduler {
    pub fn new(config: &DetectorConfig, factory: Arc<dyn SourceFactory>) -> Self {
        let params = ClassifierParams::from(&config.classifier);
        Self {
            settings: WorkerSettings::from_config(config),
            factory,
            classifier: Arc::new(SpotClassifier::new(params)),
            pool: Arc::new(Semaphore::new(config.scheduler.max_workers)),
            max_workers: config.scheduler.max_workers,
            shutdown_timeout: config.scheduler.shutdown_timeout(),
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn classifier_params(&self) -> &ClassifierParams {
        self.classifier.params()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn active_lots(&self) -> usize {
        self.workers.read().len()
    }

    /// Register a new lot or replace an existing one.
    ///
    /// Submitting a configuration identical to the registered one is a no-op.
    /// On replacement, spots whose geometry and feed are both unchanged keep
    /// their stabilized state; everything else starts fresh. Nothing changes
    /// when validation fails.
    pub fn upsert(&self, config: LotConfig) -> Result<UpsertOutcome, SchedulerError> {
        self.factory.check(&config.feed_url)?;

        let lot_id = config.lot_id;
        let mut workers = self.workers.write();

        let seeds = match workers.get(&lot_id) {
            Some(existing) if *existing.config == config => {
                debug!(lot_id = lot_id, "Configuration unchanged");
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(existing) if existing.config.feed_url == config.feed_url => {
                let snapshot = existing.latest();
                if let Some(size) = snapshot.frame_size {
                    config.check_fits(size)?;
                }
                carry_over(&existing.config, &config, &snapshot.spots)
            }
            _ => HashMap::new(),
        };

        let feed = Feed::new(self.factory.open(&config.feed_url)?, &self.settings.feed);
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let carried = seeds.len();
        let (worker, snapshot) = LotWorker::new(
            config.clone(),
            feed,
            self.classifier.clone(),
            seeds,
            self.pool.clone(),
            self.settings.clone(),
            cancel.clone(),
        );

        let handle = WorkerHandle {
            config: config.clone(),
            cancel,
            snapshot,
            task: tokio::spawn(worker.run()),
            started_at: Utc::now(),
        };

        let outcome = match workers.insert(lot_id, handle) {
            Some(previous) => {
                self.retire(previous);
                UpsertOutcome::Replaced
            }
            None => UpsertOutcome::Created,
        };
        metrics::gauge!(telemetry::ACTIVE_LOTS).set(workers.len() as f64);

        info!(
            lot_id = lot_id,
            name = %config.name,
            spots = config.spots.len(),
            carried_over = carried,
            outcome = ?outcome,
            "Parking lot registered"
        );
        Ok(outcome)
    }

    /// Unregister a lot. Its worker stops within one cycle.
    pub fn remove(&self, lot_id: LotId) -> Result<(), SchedulerError> {
        let mut workers = self.workers.write();
        let handle = workers.remove(&lot_id).ok_or(SchedulerError::NotFound(lot_id))?;
        metrics::gauge!(telemetry::ACTIVE_LOTS).set(workers.len() as f64);
        drop(workers);

        self.retire(handle);
        info!(lot_id = lot_id, "Parking lot removed");
        Ok(())
    }

    /// Cancel a worker and reap it in the background.
    fn retire(&self, handle: WorkerHandle) {
        handle.cancel.cancel();
        let lot_id = handle.config.lot_id;
        let timeout = self.shutdown_timeout;
        let abort = handle.task.abort_handle();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, handle.task).await {
                Ok(Ok(())) => debug!(lot_id = lot_id, "Retired worker finished"),
                Ok(Err(e)) => warn!(lot_id = lot_id, error = %e, "Retired worker panicked"),
                Err(_) => {
                    warn!(lot_id = lot_id, "Retired worker did not stop in time, aborting");
                    abort.abort();
                }
            }
        });
    }

    /// Summary of every registered lot, ordered by lot id.
    pub fn list_status(&self) -> Vec<LotStatus> {
        let workers = self.workers.read();
        let mut rows: Vec<LotStatus> = workers
            .values()
            .map(|handle| {
                let snapshot = handle.latest();
                LotStatus {
                    lot_id: handle.config.lot_id,
                    name: handle.config.name.clone(),
                    status: snapshot.status,
                    spot_count: handle.config.spots.len(),
                    last_frame_at: snapshot.last_frame_at,
                    consecutive_failures: snapshot.consecutive_failures,
                    skip_factor: snapshot.skip_factor,
                    last_error: snapshot.last_error.clone(),
                    started_at: handle.started_at,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.lot_id);
        rows
    }

    pub fn lot_snapshot(&self, lot_id: LotId) -> Option<Arc<LotSnapshot>> {
        self.workers.read().get(&lot_id).map(WorkerHandle::latest)
    }

    pub fn lot_config(&self, lot_id: LotId) -> Option<Arc<LotConfig>> {
        self.workers.read().get(&lot_id).map(|h| h.config.clone())
    }

    /// Stop every worker, waiting up to the shutdown timeout.
    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = self.workers.write().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        info!(lots = handles.len(), "Stopping lot workers");

        for handle in &handles {
            handle.cancel.cancel();
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.task.abort_handle()).collect();
        let tasks = handles.into_iter().map(|h| h.task);

        if tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Lot workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        metrics::gauge!(telemetry::ACTIVE_LOTS).set(0.0);
    }
}

impl SnapshotProvider for Scheduler {
    fn snapshots(&self) -> Vec<Arc<LotSnapshot>> {
        let mut snapshots: Vec<_> = self.workers.read().values().map(WorkerHandle::latest).collect();
        snapshots.sort_by_key(|s| s.lot_id);
        snapshots
    }
}

/// Stabilizer states to keep when a lot is reconfigured on the same feed:
/// only spots present in both configurations with identical geometry.
fn carry_over(old: &LotConfig, new: &LotConfig, states: &[SpotState]) -> HashMap<SpotId, SpotState> {
    states
        .iter()
        .filter(|state| {
            match (old.region(state.spot_id), new.region(state.spot_id)) {
                (Some(before), Some(after)) => before.geometry == after.geometry,
                _ => false,
            }
        })
        .map(|state| (state.spot_id, state.clone()))
        .collect()
}

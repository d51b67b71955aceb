//! Periodic delivery of stabilized spot states to the backend.
//!
//! Every interval the sync client collects the latest published snapshot of
//! each registered lot and hands one batch to a [`BackendSink`]. There are no
//! retries: a failed delivery is logged and dropped, and the next batch
//! carries fresher states anyway.

use crate::config::{BackendConfig, SyncMode};
use crate::lot::{LotId, SpotId};
use crate::telemetry;
use crate::worker::LotSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from a backend delivery.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{failed} of {total} lot deliveries failed")]
    Partial { failed: usize, total: usize },
}

/// One spot's stabilized state as the backend expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotDetection {
    pub spot_id: SpotId,
    pub occupied: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
}

/// All spot states of one lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotPayload {
    pub lot_id: LotId,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<SpotDetection>,
}

/// Body of a per-lot `ml-update` call, which reads `is_occupied`.
#[derive(Debug, Serialize)]
pub struct LotUpdate<'a> {
    pub lot_id: LotId,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<SpotUpdate<'a>>,
}

#[derive(Debug, Serialize)]
pub struct SpotUpdate<'a> {
    pub spot_id: SpotId,
    pub is_occupied: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<&'a str>,
}

impl<'a> From<&'a LotPayload> for LotUpdate<'a> {
    fn from(lot: &'a LotPayload) -> Self {
        Self {
            lot_id: lot.lot_id,
            timestamp: lot.timestamp,
            detections: lot
                .detections
                .iter()
                .map(|d| SpotUpdate {
                    spot_id: d.spot_id,
                    is_occupied: d.occupied,
                    confidence: d.confidence,
                    license_plate: d.license_plate.as_deref(),
                })
                .collect(),
        }
    }
}

/// One interval's worth of lot states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncBatch {
    pub generated_at: DateTime<Utc>,
    #[serde(rename = "lots")]
    pub entries: Vec<LotPayload>,
}

impl SyncBatch {
    /// Build a batch from published snapshots.
    ///
    /// Only Running and Degraded lots that already have spot states are
    /// included.
    pub fn from_snapshots(snapshots: &[Arc<LotSnapshot>], generated_at: DateTime<Utc>) -> Self {
        let entries = snapshots
            .iter()
            .filter(|s| s.status.is_syncable() && !s.spots.is_empty())
            .map(|s| LotPayload {
                lot_id: s.lot_id,
                timestamp: generated_at,
                detections: s
                    .spots
                    .iter()
                    .map(|spot| SpotDetection {
                        spot_id: spot.spot_id,
                        occupied: spot.occupied,
                        confidence: spot.confidence,
                        license_plate: spot.license_plate.clone(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            generated_at,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of the latest per-lot snapshots.
pub trait SnapshotProvider: Send + Sync {
    fn snapshots(&self) -> Vec<Arc<LotSnapshot>>;
}

/// Transport for sync batches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendSink: Send + Sync {
    async fn deliver(&self, batch: &SyncBatch) -> Result<(), SyncError>;
}

/// Delivers batches to the backend over HTTP.
pub struct HttpBackendSink {
    client: reqwest::Client,
    base_url: String,
    mode: SyncMode,
}

impl HttpBackendSink {
    pub fn new(config: &BackendConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            mode: config.mode,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/parking-events/{}", self.base_url, path)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), SyncError> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BackendSink for HttpBackendSink {
    async fn deliver(&self, batch: &SyncBatch) -> Result<(), SyncError> {
        match self.mode {
            SyncMode::Batch => self.post(&self.endpoint("ml-batch"), batch).await,
            SyncMode::PerLot => {
                let url = self.endpoint("ml-update");
                let mut failed = 0;
                for lot in &batch.entries {
                    if let Err(e) = self.post(&url, &LotUpdate::from(lot)).await {
                        warn!(lot_id = lot.lot_id, error = %e, "Lot delivery failed");
                        failed += 1;
                    }
                }
                if failed == 0 {
                    Ok(())
                } else {
                    Err(SyncError::Partial {
                        failed,
                        total: batch.entries.len(),
                    })
                }
            }
        }
    }
}

/// Periodically pushes snapshots to a sink.
pub struct SyncClient {
    provider: Arc<dyn SnapshotProvider>,
    sink: Arc<dyn BackendSink>,
    interval: Duration,
}

impl SyncClient {
    pub fn new(provider: Arc<dyn SnapshotProvider>, sink: Arc<dyn BackendSink>, interval: Duration) -> Self {
        Self {
            provider,
            sink,
            interval,
        }
    }

    /// Build and deliver one batch. Returns the number of lots sent; an empty
    /// batch is not delivered.
    pub async fn flush_once(&self) -> Result<usize, SyncError> {
        let batch = SyncBatch::from_snapshots(&self.provider.snapshots(), Utc::now());
        if batch.is_empty() {
            debug!("No lot states to sync");
            return Ok(0);
        }

        let lots = batch.entries.len();
        match self.sink.deliver(&batch).await {
            Ok(()) => {
                metrics::counter!(telemetry::SYNC_BATCHES, "result" => "delivered").increment(1);
                debug!(lots = lots, "Sync batch delivered");
                Ok(lots)
            }
            Err(e) => {
                metrics::counter!(telemetry::SYNC_BATCHES, "result" => "failed").increment(1);
                Err(e)
            }
        }
    }

    /// Run until cancelled. The first batch goes out one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Sync client started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.flush_once().await {
                warn!(error = %e, "Sync batch dropped");
            }
        }

        info!("Sync client stopped");
    }
}

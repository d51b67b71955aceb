//! Per-lot worker: one long-lived task per registered lot.
//!
//! Each cycle the worker takes a permit from the shared pool, reads a frame
//! from its feed, classifies every region on the blocking thread pool and runs
//! the observations through the lot's stabilizer. The permit is released
//! before any pacing or backoff sleep, so idle lots never hold capacity.
//!
//! The worker publishes an immutable [`LotSnapshot`] after every cycle through
//! a `watch` channel. Readers (the sync client, the status API) only ever see
//! whole snapshots.

use crate::classifier::SpotClassifier;
use crate::config::{DetectorConfig, FeedConfig};
use crate::debug_images;
use crate::frame::{Frame, FrameSize};
use crate::lot::{LotConfig, LotId, SpotId};
use crate::pacing::AdaptiveSkip;
use crate::source::{Feed, FeedEvent};
use crate::stabilizer::{LotStabilizer, RawObservation, SpotState};
use crate::telemetry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a lot worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    /// Whether the lot's states belong in a sync batch.
    pub fn is_syncable(self) -> bool {
        matches!(self, WorkerStatus::Running | WorkerStatus::Degraded)
    }
}

/// Immutable per-lot view published after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct LotSnapshot {
    pub lot_id: LotId,
    pub name: String,
    pub status: WorkerStatus,
    pub spots: Vec<SpotState>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub frame_size: Option<FrameSize>,
    pub consecutive_failures: u32,
    pub skip_factor: u32,
    pub frames_processed: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LotSnapshot {
    /// Snapshot of a worker that has not processed anything yet.
    pub fn starting(config: &LotConfig, spots: Vec<SpotState>) -> Self {
        Self {
            lot_id: config.lot_id,
            name: config.name.clone(),
            status: WorkerStatus::Starting,
            spots,
            last_frame_at: None,
            frame_size: None,
            consecutive_failures: 0,
            skip_factor: 0,
            frames_processed: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Where and how often annotated frames are written.
#[derive(Debug, Clone)]
pub struct DebugImageSettings {
    pub directory: PathBuf,
    pub interval: Duration,
}

/// Knobs shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub cycle_budget: Duration,
    pub max_skip_factor: u32,
    pub rolling_window: usize,
    pub recovery_ratio: f64,
    pub streak_length: u32,
    pub feed: FeedConfig,
    pub debug_images: Option<DebugImageSettings>,
}

impl WorkerSettings {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            cycle_budget: config.scheduler.cycle_budget(),
            max_skip_factor: config.scheduler.max_skip_factor,
            rolling_window: config.scheduler.rolling_window,
            recovery_ratio: config.scheduler.recovery_ratio,
            streak_length: config.stabilizer.streak_length,
            feed: config.feed.clone(),
            debug_images: config.debug.save_images.then(|| DebugImageSettings {
                directory: PathBuf::from(&config.debug.directory),
                interval: config.backend.sync_interval(),
            }),
        }
    }
}

/// The processing loop for one lot.
pub struct LotWorker {
    config: Arc<LotConfig>,
    feed: Feed,
    classifier: Arc<SpotClassifier>,
    stabilizer: LotStabilizer,
    pacer: AdaptiveSkip,
    pool: Arc<Semaphore>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    snapshots: watch::Sender<Arc<LotSnapshot>>,

    status: WorkerStatus,
    frame_size: Option<FrameSize>,
    last_frame_at: Option<DateTime<Utc>>,
    frames_processed: u64,
    last_error: Option<String>,
    last_debug_image: Option<Instant>,
}

impl LotWorker {
    /// Build a worker and the receiver its snapshots are published on.
    ///
    /// `seeds` carries stabilizer state over from a replaced worker; spots
    /// without a seed start fresh.
    pub fn new(
        config: Arc<LotConfig>,
        feed: Feed,
        classifier: Arc<SpotClassifier>,
        seeds: HashMap<SpotId, SpotState>,
        pool: Arc<Semaphore>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<Arc<LotSnapshot>>) {
        let stabilizer = LotStabilizer::with_seeds(&config.spots, settings.streak_length, seeds);
        let pacer = AdaptiveSkip::new(
            settings.cycle_budget,
            settings.max_skip_factor,
            settings.rolling_window,
            settings.recovery_ratio,
        );
        let initial = LotSnapshot::starting(&config, stabilizer.snapshot());
        let (snapshots, receiver) = watch::channel(Arc::new(initial));

        let worker = Self {
            config,
            feed,
            classifier,
            stabilizer,
            pacer,
            pool,
            settings,
            cancel,
            snapshots,
            status: WorkerStatus::Starting,
            frame_size: None,
            last_frame_at: None,
            frames_processed: 0,
            last_error: None,
            last_debug_image: None,
        };
        (worker, receiver)
    }

    pub fn lot_id(&self) -> LotId {
        self.config.lot_id
    }

    /// Run until cancelled. Never returns early on feed errors.
    pub async fn run(mut self) {
        let lot_id = self.lot_id();
        info!(
            lot_id = lot_id,
            feed = self.feed.kind(),
            spots = self.config.spots.len(),
            "Lot worker started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let cycle_start = Instant::now();
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.feed.next_frame() => event,
            };

            let wait = match event {
                FeedEvent::Frame(frame) => {
                    // Classification is not raced against cancellation; an
                    // in-flight cycle always completes.
                    self.process_frame(frame).await;
                    let elapsed = cycle_start.elapsed();
                    drop(permit);
                    let extra = self.pace(elapsed).await;
                    self.settings.cycle_budget.saturating_sub(elapsed) + extra
                }
                FeedEvent::BadFrame(reason) => {
                    drop(permit);
                    metrics::counter!(telemetry::BAD_FRAMES).increment(1);
                    debug!(lot_id = lot_id, reason = %reason, "Skipping undecodable frame");
                    self.last_error = Some(format!("frame decode failed: {reason}"));
                    self.settings.cycle_budget
                }
                FeedEvent::Unavailable {
                    consecutive_failures,
                    retry_in,
                    reason,
                } => {
                    drop(permit);
                    self.on_feed_failure(consecutive_failures, retry_in, reason);
                    retry_in
                }
            };

            self.publish();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.shutdown();
    }

    async fn process_frame(&mut self, frame: Frame) {
        let lot_id = self.lot_id();
        let size = frame.size();
        self.frame_size = Some(size);
        self.last_frame_at = Some(frame.captured_at);

        // Regions are re-checked on every frame so a feed that changes
        // resolution is caught immediately.
        if let Err(e) = self.config.check_fits(size) {
            let message = e.to_string();
            if self.last_error.as_deref() != Some(message.as_str()) {
                warn!(lot_id = lot_id, frame = %size, error = %e, "Spot regions do not fit the feed");
            }
            self.status = WorkerStatus::Degraded;
            self.last_error = Some(message);
            return;
        }

        let config = self.config.clone();
        let classifier = self.classifier.clone();
        let captured_at = frame.captured_at;
        let classified = tokio::task::spawn_blocking(move || {
            let observations: Vec<RawObservation> = config
                .spots
                .iter()
                .filter_map(|region| {
                    classifier
                        .classify(&frame.image, &region.geometry)
                        .map(|c| RawObservation::from_classification(region.spot_id, c, captured_at))
                })
                .collect();
            (frame, observations)
        })
        .await;

        let (frame, observations) = match classified {
            Ok(result) => result,
            Err(e) => {
                error!(lot_id = lot_id, error = %e, "Classification task failed");
                self.last_error = Some(format!("classification failed: {e}"));
                return;
            }
        };

        for change in self.stabilizer.observe_all(&observations) {
            if change.initial {
                debug!(
                    lot_id = lot_id,
                    spot_id = change.spot_id,
                    occupied = change.occupied,
                    "Spot state established"
                );
            } else {
                info!(
                    lot_id = lot_id,
                    spot_id = change.spot_id,
                    occupied = change.occupied,
                    changed_at = %change.changed_at,
                    "Spot state changed"
                );
            }
        }

        if self.status != WorkerStatus::Running {
            info!(lot_id = lot_id, previous = ?self.status, "Lot worker running");
        }
        self.status = WorkerStatus::Running;
        self.last_error = None;
        self.frames_processed += 1;
        metrics::counter!(telemetry::FRAMES_PROCESSED).increment(1);

        self.maybe_save_debug_image(&frame);
    }

    fn on_feed_failure(&mut self, consecutive_failures: u32, retry_in: Duration, reason: String) {
        let lot_id = self.lot_id();
        metrics::counter!(telemetry::FEED_FAILURES).increment(1);

        if consecutive_failures >= self.settings.feed.degraded_after_failures
            && self.status != WorkerStatus::Degraded
        {
            warn!(
                lot_id = lot_id,
                failures = consecutive_failures,
                error = %reason,
                "Feed unavailable, lot degraded"
            );
            self.status = WorkerStatus::Degraded;
        } else {
            debug!(
                lot_id = lot_id,
                failures = consecutive_failures,
                retry_in_ms = retry_in.as_millis() as u64,
                error = %reason,
                "Feed read failed, retrying"
            );
        }
        self.last_error = Some(reason);
    }

    /// Update the skip factor and discard frames accordingly.
    ///
    /// Returns extra time to wait before the next cycle. Live snapshot feeds
    /// have no backlog to discard, so for them each skipped frame becomes one
    /// cycle budget of waiting instead.
    async fn pace(&mut self, elapsed: Duration) -> Duration {
        let lot_id = self.lot_id();
        let previous = self.pacer.skip_factor();
        let skip = self.pacer.record(elapsed);

        metrics::histogram!(telemetry::CYCLE_SECONDS).record(elapsed.as_secs_f64());
        metrics::gauge!(telemetry::SKIP_FACTOR, "lot_id" => lot_id.to_string()).set(f64::from(skip));
        if skip != previous {
            debug!(
                lot_id = lot_id,
                skip_factor = skip,
                average_ms = ?self.pacer.average().map(|d| d.as_millis()),
                "Skip factor adjusted"
            );
        }
        if skip == 0 {
            return Duration::ZERO;
        }

        if self.feed.is_live_snapshot() {
            metrics::counter!(telemetry::FRAMES_SKIPPED).increment(u64::from(skip));
            return self.settings.cycle_budget * skip;
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Duration::ZERO,
            result = self.feed.skip_frames(skip) => result,
        };
        match result {
            Ok(()) => metrics::counter!(telemetry::FRAMES_SKIPPED).increment(u64::from(skip)),
            Err(e) => debug!(lot_id = lot_id, error = %e, "Frame skip interrupted"),
        }
        Duration::ZERO
    }

    fn maybe_save_debug_image(&mut self, frame: &Frame) {
        let Some(settings) = self.settings.debug_images.as_ref() else {
            return;
        };
        if self
            .last_debug_image
            .is_some_and(|at| at.elapsed() < settings.interval)
        {
            return;
        }
        self.last_debug_image = Some(Instant::now());

        let lot_id = self.lot_id();
        let directory = settings.directory.clone();
        let annotated =
            debug_images::annotate_states(&frame.image, &self.config.spots, &self.stabilizer.snapshot());
        let at = frame.captured_at;
        tokio::task::spawn_blocking(move || {
            match debug_images::save_debug_frame(&directory, lot_id, &annotated, at) {
                Ok(path) => debug!(lot_id = lot_id, path = %path.display(), "Debug image saved"),
                Err(e) => warn!(lot_id = lot_id, error = %e, "Failed to save debug image"),
            }
        });
    }

    fn snapshot(&self) -> LotSnapshot {
        LotSnapshot {
            lot_id: self.config.lot_id,
            name: self.config.name.clone(),
            status: self.status,
            spots: self.stabilizer.snapshot(),
            last_frame_at: self.last_frame_at,
            frame_size: self.frame_size,
            consecutive_failures: self.feed.consecutive_failures(),
            skip_factor: self.pacer.skip_factor(),
            frames_processed: self.frames_processed,
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(Arc::new(self.snapshot()));
    }

    fn shutdown(mut self) {
        let lot_id = self.lot_id();
        self.status = WorkerStatus::Stopping;
        self.publish();

        let mut last = self.snapshot();
        drop(self.feed);
        last.status = WorkerStatus::Stopped;
        last.updated_at = Utc::now();
        self.snapshots.send_replace(Arc::new(last));

        info!(lot_id = lot_id, frames = self.frames_processed, "Lot worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierParams;
    use crate::lot::{Geometry, Region};
    use crate::source::{DefaultSourceFactory, FrameSource, SourceError, SourceFactory};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Pull source that takes a fixed time per read and counts its reads.
    struct SlowSnapshotSource {
        delay: Duration,
        reads: Arc<AtomicU64>,
    }

    #[async_trait]
    impl FrameSource for SlowSnapshotSource {
        async fn next_frame(&mut self) -> Result<Frame, SourceError> {
            tokio::time::sleep(self.delay).await;
            let sequence = self.reads.fetch_add(1, Ordering::SeqCst);
            Frame::new(RgbImage::from_pixel(64, 48, Rgb([128, 128, 128])), sequence).map_err(SourceError::from)
        }

        async fn skip_frames(&mut self, _count: u32) -> Result<(), SourceError> {
            Ok(())
        }

        fn is_live_snapshot(&self) -> bool {
            true
        }

        fn kind(&self) -> &'static str {
            "slow"
        }
    }

    /// Run a worker on a slow pull source for `run_for` and return how many
    /// reads it made plus its last snapshot.
    async fn run_slow_snapshot_worker(max_skip_factor: u32, run_for: Duration) -> (u64, Arc<LotSnapshot>) {
        let mut settings = create_test_settings();
        settings.max_skip_factor = max_skip_factor;
        settings.rolling_window = 1;
        let reads = Arc::new(AtomicU64::new(0));
        let source = SlowSnapshotSource {
            delay: Duration::from_millis(20),
            reads: reads.clone(),
        };
        let spots = vec![Region { spot_id: 1, geometry: Geometry::new(4, 4, 20, 10) }];
        let cancel = CancellationToken::new();
        let (worker, rx) = LotWorker::new(
            create_test_lot("http://camera.local/snapshot.jpg", spots),
            Feed::new(Box::new(source), &settings.feed),
            Arc::new(SpotClassifier::new(ClassifierParams::default())),
            HashMap::new(),
            Arc::new(Semaphore::new(1)),
            settings,
            cancel.clone(),
        );
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(run_for).await;
        let snapshot = rx.borrow().clone();
        cancel.cancel();
        task.await.unwrap();
        (reads.load(Ordering::SeqCst), snapshot)
    }

    fn create_test_settings() -> WorkerSettings {
        WorkerSettings {
            cycle_budget: Duration::from_millis(10),
            max_skip_factor: 0,
            rolling_window: 3,
            recovery_ratio: 0.8,
            streak_length: 3,
            feed: FeedConfig {
                degraded_after_failures: 3,
                reconnect_base_delay_ms: 1,
                reconnect_max_delay_ms: 5,
                frame_timeout_secs: 5,
            },
            debug_images: None,
        }
    }

    fn create_test_lot(feed_url: &str, spots: Vec<Region>) -> Arc<LotConfig> {
        Arc::new(LotConfig {
            lot_id: 1,
            name: "Test Lot".to_string(),
            location: "Nowhere".to_string(),
            feed_url: feed_url.to_string(),
            spots,
            frame_size: None,
        })
    }

    fn two_spots() -> Vec<Region> {
        vec![
            Region { spot_id: 1, geometry: Geometry::new(10, 10, 103, 43) },
            Region { spot_id: 2, geometry: Geometry::new(150, 10, 103, 43) },
        ]
    }

    fn spawn_worker(
        config: Arc<LotConfig>,
        settings: WorkerSettings,
    ) -> (
        tokio::task::JoinHandle<()>,
        watch::Receiver<Arc<LotSnapshot>>,
        CancellationToken,
    ) {
        let factory = DefaultSourceFactory::new(Duration::from_secs(1)).unwrap();
        let feed = Feed::new(factory.open(&config.feed_url).unwrap(), &settings.feed);
        let cancel = CancellationToken::new();
        let (worker, rx) = LotWorker::new(
            config,
            feed,
            Arc::new(SpotClassifier::new(ClassifierParams::default())),
            HashMap::new(),
            Arc::new(Semaphore::new(2)),
            settings,
            cancel.clone(),
        );
        (tokio::spawn(worker.run()), rx, cancel)
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<Arc<LotSnapshot>>, predicate: F) -> Arc<LotSnapshot>
    where
        F: FnMut(&Arc<LotSnapshot>) -> bool,
    {
        let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("worker dropped its sender");
        snapshot.clone()
    }

    #[tokio::test]
    async fn test_busy_feed_runs_and_marks_occupied() {
        let (task, mut rx, cancel) = spawn_worker(create_test_lot("stub://busy", two_spots()), create_test_settings());

        let snapshot = wait_for(&mut rx, |s| s.frames_processed >= 2).await;
        assert_eq!(snapshot.status, WorkerStatus::Running);
        assert_eq!(snapshot.spots.len(), 2);
        assert!(snapshot.spots.iter().all(|s| s.occupied));
        assert_eq!(snapshot.frame_size, Some(FrameSize::new(640, 480)));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_feed_degrades() {
        let (task, mut rx, cancel) =
            spawn_worker(create_test_lot("stub://offline", two_spots()), create_test_settings());

        let snapshot = wait_for(&mut rx, |s| s.status == WorkerStatus::Degraded).await;
        assert!(snapshot.consecutive_failures >= 3);
        assert!(snapshot.spots.is_empty());
        assert!(snapshot.last_error.is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_misfit_regions_degrade_with_error() {
        let spots = vec![Region { spot_id: 9, geometry: Geometry::new(600, 10, 103, 43) }];
        let (task, mut rx, cancel) = spawn_worker(create_test_lot("stub://empty", spots), create_test_settings());

        let snapshot = wait_for(&mut rx, |s| s.status == WorkerStatus::Degraded).await;
        let error = snapshot.last_error.clone().unwrap();
        assert!(error.contains("Spot 9"), "unexpected error: {error}");
        assert_eq!(snapshot.frames_processed, 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flickering_feed_holds_first_state() {
        let (task, mut rx, cancel) =
            spawn_worker(create_test_lot("stub://flicker", two_spots()), create_test_settings());

        let snapshot = wait_for(&mut rx, |s| s.frames_processed >= 12).await;
        assert!(snapshot.spots.iter().all(|s| s.occupied));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_publishes_stopped() {
        let (task, mut rx, cancel) = spawn_worker(create_test_lot("stub://empty", two_spots()), create_test_settings());
        wait_for(&mut rx, |s| s.status == WorkerStatus::Running).await;

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(rx.borrow().status, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_seeded_states_published_before_first_frame() {
        let config = create_test_lot("stub://offline", two_spots());
        let settings = create_test_settings();
        let factory = DefaultSourceFactory::new(Duration::from_secs(1)).unwrap();
        let feed = Feed::new(factory.open(&config.feed_url).unwrap(), &settings.feed);

        let seed = SpotState {
            spot_id: 2,
            occupied: true,
            confidence: 0.9,
            changed_at: Utc::now(),
            consecutive_agreeing_count: 5,
            foreground_pixels: 2000,
            license_plate: None,
        };
        let (_worker, rx) = LotWorker::new(
            config,
            feed,
            Arc::new(SpotClassifier::new(ClassifierParams::default())),
            HashMap::from([(2, seed.clone())]),
            Arc::new(Semaphore::new(1)),
            settings,
            CancellationToken::new(),
        );

        let initial = rx.borrow().clone();
        assert_eq!(initial.status, WorkerStatus::Starting);
        assert_eq!(initial.spots, vec![seed]);
    }

    #[tokio::test]
    async fn test_skip_slows_live_snapshot_polling() {
        // Each read takes 20ms against a 10ms budget, so the skip factor
        // climbs to its maximum and polling should slow down accordingly.
        let run_for = Duration::from_millis(800);
        let (baseline_reads, baseline) = run_slow_snapshot_worker(0, run_for).await;
        let (skipping_reads, skipping) = run_slow_snapshot_worker(4, run_for).await;

        assert_eq!(baseline.skip_factor, 0);
        assert_eq!(skipping.skip_factor, 4);
        assert!(
            skipping_reads * 2 < baseline_reads,
            "skipping worker read {skipping_reads} frames, baseline {baseline_reads}"
        );
    }

    #[tokio::test]
    async fn test_debug_images_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = create_test_settings();
        settings.debug_images = Some(DebugImageSettings {
            directory: dir.path().to_path_buf(),
            interval: Duration::from_secs(60),
        });
        let (task, mut rx, cancel) = spawn_worker(create_test_lot("stub://busy", two_spots()), settings);
        wait_for(&mut rx, |s| s.frames_processed >= 3).await;
        cancel.cancel();
        task.await.unwrap();

        // Written off the async runtime; give it a moment
        let mut files = 0;
        for _ in 0..50 {
            files = std::fs::read_dir(dir.path()).unwrap().count();
            if files > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(files, 1);
    }
}

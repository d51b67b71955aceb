//! Frame sources and the feed wrapper that adds retry policy on top of them.
//!
//! A [`FrameSource`] only knows how to produce the next decoded frame from one
//! kind of feed. [`Feed`] owns a source and turns its results into
//! [`FeedEvent`]s: per-attempt timeouts, exponential backoff between failed
//! attempts, and a running count of consecutive failures. A feed never gives
//! up on its own; only the owning worker stops it.

mod file;
mod http;
#[cfg(feature = "rtsp")]
mod rtsp;
mod stub;

pub use file::FileSource;
pub use http::HttpSnapshotSource;
#[cfg(feature = "rtsp")]
pub use rtsp::RtspSource;
pub use stub::{StubPattern, StubSource};

use crate::config::FeedConfig;
use crate::frame::{Frame, FrameError};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors a frame source can report.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The feed cannot deliver frames right now; retried with backoff.
    #[error("Feed unavailable: {0}")]
    Unavailable(String),

    /// One frame could not be decoded; the feed itself is fine.
    #[error("Frame decode failed: {0}")]
    Decode(String),

    #[error("Unsupported feed URL {url}: {reason}")]
    Unsupported { url: String, reason: String },

    #[error("No frame within {0:?}")]
    Timeout(Duration),
}

impl From<FrameError> for SourceError {
    fn from(err: FrameError) -> Self {
        SourceError::Decode(err.to_string())
    }
}

/// A producer of decoded frames for one feed.
#[async_trait]
pub trait FrameSource: Send {
    /// Acquire and decode the next frame.
    async fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Discard up to `count` frames without processing them.
    async fn skip_frames(&mut self, count: u32) -> Result<(), SourceError> {
        for _ in 0..count {
            match self.next_frame().await {
                Ok(_) | Err(SourceError::Decode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether every read returns the current picture rather than the next
    /// queued frame. Such sources have nothing to discard, so skipping is
    /// realised by reading them less often.
    fn is_live_snapshot(&self) -> bool {
        false
    }

    /// Short label for logs (`http`, `file`, `stub`, `rtsp`).
    fn kind(&self) -> &'static str;
}

/// Maps feed URLs to frame sources.
pub trait SourceFactory: Send + Sync {
    /// Check that a URL can be opened, without touching the network.
    fn check(&self, url: &str) -> Result<(), SourceError>;

    /// Build a source for the URL. Connection happens lazily on first read.
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Feed kinds recognized by [`DefaultSourceFactory`].
#[derive(Debug, Clone, PartialEq)]
enum FeedKind {
    Http(Url),
    File(PathBuf),
    Stub(Url),
    #[cfg_attr(not(feature = "rtsp"), allow(dead_code))]
    Rtsp(Url),
}

fn unsupported(url: &str, reason: impl Into<String>) -> SourceError {
    SourceError::Unsupported {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn parse_feed_url(url: &str) -> Result<FeedKind, SourceError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(unsupported(url, "empty URL"));
    }

    // Bare local paths have no scheme
    if !trimmed.contains("://") {
        return Ok(FeedKind::File(PathBuf::from(trimmed)));
    }
    let parsed = Url::parse(trimmed).map_err(|e| unsupported(url, e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => Ok(FeedKind::Http(parsed)),
        "file" => parsed
            .to_file_path()
            .map(FeedKind::File)
            .map_err(|_| unsupported(url, "not a local file path")),
        "stub" => Ok(FeedKind::Stub(parsed)),
        "rtsp" | "rtsps" => {
            if cfg!(feature = "rtsp") {
                Ok(FeedKind::Rtsp(parsed))
            } else {
                Err(unsupported(url, "built without the `rtsp` feature"))
            }
        }
        other => Err(unsupported(url, format!("unknown scheme `{other}`"))),
    }
}

/// Source factory covering HTTP snapshots, local files, synthetic stubs and,
/// with the `rtsp` feature, GStreamer RTSP streams.
#[derive(Clone)]
pub struct DefaultSourceFactory {
    http: reqwest::Client,
}

impl DefaultSourceFactory {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http })
    }

    /// Factory whose HTTP snapshot requests give up after the feed's frame timeout.
    pub fn from_config(config: &FeedConfig) -> Result<Self, reqwest::Error> {
        Self::new(config.frame_timeout())
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn check(&self, url: &str) -> Result<(), SourceError> {
        match parse_feed_url(url)? {
            FeedKind::Stub(parsed) => StubSource::from_url(&parsed).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let source: Box<dyn FrameSource> = match parse_feed_url(url)? {
            FeedKind::Http(parsed) => Box::new(HttpSnapshotSource::new(self.http.clone(), parsed)),
            FeedKind::File(path) => Box::new(FileSource::new(path)),
            FeedKind::Stub(parsed) => Box::new(StubSource::from_url(&parsed)?),
            #[cfg(feature = "rtsp")]
            FeedKind::Rtsp(parsed) => Box::new(RtspSource::new(parsed.as_str())?),
            #[cfg(not(feature = "rtsp"))]
            FeedKind::Rtsp(_) => return Err(unsupported(url, "built without the `rtsp` feature")),
        };
        debug!(url = %url, kind = source.kind(), "Opened frame source");
        Ok(source)
    }
}

/// Outcome of one feed read.
#[derive(Debug)]
pub enum FeedEvent {
    Frame(Frame),

    /// A single frame failed to decode; the next read may succeed.
    BadFrame(String),

    /// The feed is down; the caller should wait `retry_in` before reading again.
    Unavailable {
        consecutive_failures: u32,
        retry_in: Duration,
        reason: String,
    },
}

/// One source plus its retry policy.
pub struct Feed {
    source: Box<dyn FrameSource>,
    backoff: ExponentialBackoff,
    max_delay: Duration,
    frame_timeout: Duration,
    consecutive_failures: u32,
}

impl Feed {
    pub fn new(source: Box<dyn FrameSource>, config: &FeedConfig) -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: config.reconnect_base_delay(),
            max_interval: config.reconnect_max_delay(),
            max_elapsed_time: None, // A feed retries until its worker stops
            ..Default::default()
        };
        backoff.reset();

        Self {
            source,
            backoff,
            max_delay: config.reconnect_max_delay(),
            frame_timeout: config.frame_timeout(),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }

    pub fn is_live_snapshot(&self) -> bool {
        self.source.is_live_snapshot()
    }

    /// Read the next frame, applying timeout and backoff bookkeeping.
    pub async fn next_frame(&mut self) -> FeedEvent {
        let result = match tokio::time::timeout(self.frame_timeout, self.source.next_frame()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.frame_timeout)),
        };

        match result {
            Ok(frame) => {
                if self.consecutive_failures > 0 {
                    info!(
                        kind = self.source.kind(),
                        failures = self.consecutive_failures,
                        "Feed recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.backoff.reset();
                FeedEvent::Frame(frame)
            }
            Err(SourceError::Decode(reason)) => FeedEvent::BadFrame(reason),
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let retry_in = self
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay);
                FeedEvent::Unavailable {
                    consecutive_failures: self.consecutive_failures,
                    retry_in,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Discard frames between processed ones.
    pub async fn skip_frames(&mut self, count: u32) -> Result<(), SourceError> {
        if count == 0 {
            return Ok(());
        }
        match tokio::time::timeout(self.frame_timeout, self.source.skip_frames(count)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.frame_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;

    /// Source replaying a fixed script of outcomes, then blank frames.
    struct ScriptedSource {
        script: VecDeque<Result<(), SourceError>>,
        reads: u64,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<(), SourceError>>) -> Self {
            Self {
                script: script.into(),
                reads: 0,
            }
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Frame, SourceError> {
            self.reads += 1;
            self.script.pop_front().unwrap_or(Ok(()))?;
            Ok(Frame::new(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), self.reads)?)
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    /// Source that never answers.
    struct HangingSource;

    #[async_trait]
    impl FrameSource for HangingSource {
        async fn next_frame(&mut self) -> Result<Frame, SourceError> {
            futures::future::pending().await
        }

        fn kind(&self) -> &'static str {
            "hanging"
        }
    }

    fn create_test_feed_config() -> FeedConfig {
        FeedConfig {
            degraded_after_failures: 3,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 400,
            frame_timeout_secs: 1,
        }
    }

    fn unavailable() -> Result<(), SourceError> {
        Err(SourceError::Unavailable("connection refused".to_string()))
    }

    #[test]
    fn test_parse_feed_urls() {
        assert!(matches!(parse_feed_url("http://cam/snap.jpg"), Ok(FeedKind::Http(_))));
        assert!(matches!(parse_feed_url("https://cam/snap.jpg"), Ok(FeedKind::Http(_))));
        assert!(matches!(parse_feed_url("stub://empty"), Ok(FeedKind::Stub(_))));
        assert_eq!(
            parse_feed_url("videos/lot1").unwrap(),
            FeedKind::File(PathBuf::from("videos/lot1"))
        );
        assert_eq!(
            parse_feed_url("file:///srv/frames").unwrap(),
            FeedKind::File(PathBuf::from("/srv/frames"))
        );
    }

    #[test]
    fn test_rejects_bad_feed_urls() {
        assert!(matches!(parse_feed_url("  "), Err(SourceError::Unsupported { .. })));
        assert!(matches!(parse_feed_url("gopher://cam"), Err(SourceError::Unsupported { .. })));
    }

    #[cfg(not(feature = "rtsp"))]
    #[test]
    fn test_rtsp_needs_feature() {
        assert!(matches!(
            parse_feed_url("rtsp://cam:554/stream"),
            Err(SourceError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_request_bounded_by_frame_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let factory = DefaultSourceFactory::from_config(&create_test_feed_config()).unwrap();
        let mut source = factory.open(&format!("http://{addr}/snapshot.jpg")).unwrap();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), source.next_frame()).await;
        assert!(matches!(result, Ok(Err(_))), "request was not bounded by the client");
        assert!(started.elapsed() < Duration::from_secs(3));

        server.abort();
    }

    #[test]
    fn test_factory_checks_stub_pattern() {
        let factory = DefaultSourceFactory::new(Duration::from_secs(1)).unwrap();
        assert!(factory.check("stub://busy").is_ok());
        assert!(factory.check("stub://sideways").is_err());
        assert_eq!(factory.open("stub://empty").unwrap().kind(), "stub");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_counted_and_backoff_capped() {
        let source = ScriptedSource::new(vec![unavailable(), unavailable(), unavailable(), unavailable()]);
        let config = create_test_feed_config();
        let mut feed = Feed::new(Box::new(source), &config);

        for expected in 1..=4 {
            match feed.next_frame().await {
                FeedEvent::Unavailable {
                    consecutive_failures,
                    retry_in,
                    ..
                } => {
                    assert_eq!(consecutive_failures, expected);
                    assert!(retry_in <= config.reconnect_max_delay());
                }
                other => panic!("expected Unavailable, got {other:?}"),
            }
        }
        assert_eq!(feed.consecutive_failures(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let source = ScriptedSource::new(vec![unavailable(), unavailable(), Ok(())]);
        let mut feed = Feed::new(Box::new(source), &create_test_feed_config());

        feed.next_frame().await;
        feed.next_frame().await;
        assert_eq!(feed.consecutive_failures(), 2);

        assert!(matches!(feed.next_frame().await, FeedEvent::Frame(_)));
        assert_eq!(feed.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_is_not_a_feed_failure() {
        let source = ScriptedSource::new(vec![Err(SourceError::Decode("truncated".to_string()))]);
        let mut feed = Feed::new(Box::new(source), &create_test_feed_config());

        assert!(matches!(feed.next_frame().await, FeedEvent::BadFrame(_)));
        assert_eq!(feed.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_source_times_out() {
        let mut feed = Feed::new(Box::new(HangingSource), &create_test_feed_config());
        match feed.next_frame().await {
            FeedEvent::Unavailable { reason, .. } => assert!(reason.contains("No frame")),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_skip_reads_frames() {
        let mut source = ScriptedSource::new(Vec::new());
        source.skip_frames(3).await.unwrap();
        assert_eq!(source.reads, 3);
    }
}

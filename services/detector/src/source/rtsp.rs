//! RTSP camera feeds through a GStreamer appsink pipeline.
//!
//! The pipeline is built lazily on the first read and torn down on any bus
//! error or end of stream; the owning [`Feed`](super::Feed) then retries with
//! backoff, which rebuilds it. Frames are converted to packed RGB in the
//! appsink callback and handed over through a small bounded channel; when the
//! worker falls behind, new frames are dropped rather than queued.

use super::{FrameSource, SourceError};
use crate::frame::Frame;
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const FRAME_BUFFER: usize = 2;
const LATENCY_MS: u32 = 200;
const START_TIMEOUT_SECS: u64 = 10;

pub struct RtspSource {
    url: String,
    pipeline: Option<gst::Pipeline>,
    frames: Option<mpsc::Receiver<Result<Frame, SourceError>>>,
    sequence: Arc<AtomicU64>,
}

impl RtspSource {
    pub fn new(url: &str) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::Unavailable(format!("GStreamer init failed: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            pipeline: None,
            frames: None,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    fn pipeline_description(url: &str) -> String {
        format!(
            "rtspsrc location={url} protocols=tcp latency={LATENCY_MS} \
             ! decodebin ! videoconvert \
             ! video/x-raw,format=RGB \
             ! appsink name=sink emit-signals=true sync=false max-buffers={FRAME_BUFFER} drop=true"
        )
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        let description = Self::pipeline_description(&self.url);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SourceError::Unavailable("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SourceError::Unavailable("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SourceError::Unavailable("Could not cast to AppSink".to_string()))?;

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let sequence = self.sequence.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let seq = sequence.fetch_add(1, Ordering::SeqCst);
                    let frame = sample_to_frame(&sample, seq);

                    match tx.try_send(frame) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(gst::FlowSuccess::Ok),
                        Err(mpsc::error::TrySendError::Closed(_)) => Err(gst::FlowError::Eos),
                    }
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let (result, _state, _pending) =
            pipeline.state(gst::ClockTime::from_seconds(START_TIMEOUT_SECS));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(SourceError::Unavailable(
                "Timeout waiting for pipeline to start".to_string(),
            ));
        }

        self.pipeline = Some(pipeline);
        self.frames = Some(rx);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        self.frames = None;
    }

    /// Surface pipeline errors posted on the bus since the last read.
    fn check_bus(&mut self) -> Result<(), SourceError> {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return Ok(());
        };

        while let Some(msg) =
            bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos, gst::MessageType::Warning])
        {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let reason = format!("pipeline error: {}", err.error());
                    self.teardown();
                    return Err(SourceError::Unavailable(reason));
                }
                gst::MessageView::Eos(_) => {
                    self.teardown();
                    return Err(SourceError::Unavailable("end of stream".to_string()));
                }
                gst::MessageView::Warning(w) => {
                    warn!(url = %self.url, warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Copy a packed RGB sample out of a (possibly padded) GStreamer buffer.
fn sample_to_frame(sample: &gst::Sample, sequence: u64) -> Result<Frame, SourceError> {
    let caps = sample
        .caps()
        .ok_or_else(|| SourceError::Decode("sample without caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|e| SourceError::Decode(e.to_string()))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| SourceError::Decode("sample without buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|e| SourceError::Decode(e.to_string()))?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;
    let row_bytes = width as usize * 3;
    let data = map.as_slice();

    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| SourceError::Decode("short video buffer".to_string()))?;
        packed.extend_from_slice(line);
    }

    Ok(Frame::from_rgb(width, height, packed, sequence)?)
}

#[async_trait]
impl FrameSource for RtspSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.pipeline.is_none() {
            self.connect()?;
        }
        self.check_bus()?;

        let Some(frames) = self.frames.as_mut() else {
            return Err(SourceError::Unavailable("stream not connected".to_string()));
        };
        match frames.recv().await {
            Some(frame) => frame,
            None => {
                self.teardown();
                Err(SourceError::Unavailable("stream closed".to_string()))
            }
        }
    }

    // Only drop what is already buffered; a live stream is never waited on.
    async fn skip_frames(&mut self, count: u32) -> Result<(), SourceError> {
        if let Some(frames) = self.frames.as_mut() {
            for _ in 0..count {
                if frames.try_recv().is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "rtsp"
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.teardown();
    }
}

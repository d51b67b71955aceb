//! HTTP snapshot feeds: one GET per frame, JPEG/PNG body.

use super::{FrameSource, SourceError};
use crate::frame::Frame;
use async_trait::async_trait;
use reqwest::{Client, Url};

pub struct HttpSnapshotSource {
    client: Client,
    url: Url,
    sequence: u64,
}

impl HttpSnapshotSource {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            sequence: 0,
        }
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("snapshot returned HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let sequence = self.sequence;
        self.sequence += 1;

        tokio::task::spawn_blocking(move || Frame::decode(&body, sequence))
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?
            .map_err(SourceError::from)
    }

    // Every request returns the live picture, so there is nothing to discard.
    async fn skip_frames(&mut self, _count: u32) -> Result<(), SourceError> {
        Ok(())
    }

    fn is_live_snapshot(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

//! Local file feeds.
//!
//! The path may point at a single still image or at a directory of images.
//! Directories are replayed in file-name order and start over from the first
//! image when the last one has been read, so recorded footage loops like a
//! live camera. The listing is refreshed on every rewind.

use super::{FrameSource, SourceError};
use crate::frame::Frame;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub struct FileSource {
    path: PathBuf,
    entries: Vec<PathBuf>,
    cursor: usize,
    sequence: u64,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
            cursor: 0,
            sequence: 0,
        }
    }

    async fn list_entries(&self) -> Result<Vec<PathBuf>, SourceError> {
        let unavailable =
            |e: std::io::Error| SourceError::Unavailable(format!("{}: {e}", self.path.display()));

        let metadata = tokio::fs::metadata(&self.path).await.map_err(unavailable)?;
        if metadata.is_file() {
            return Ok(vec![self.path.clone()]);
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path).await.map_err(unavailable)?;
        while let Some(entry) = dir.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            if is_image(&path) {
                entries.push(path);
            }
        }
        entries.sort();

        if entries.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "{}: no images found",
                self.path.display()
            )));
        }
        Ok(entries)
    }

    async fn ensure_listed(&mut self) -> Result<(), SourceError> {
        if self.entries.is_empty() {
            self.entries = self.list_entries().await?;
        }
        Ok(())
    }

    fn advance(&mut self, count: usize) {
        let next = self.cursor + count;
        if next >= self.entries.len() {
            debug!(path = %self.path.display(), "Rewinding file feed");
            let remaining = next % self.entries.len().max(1);
            self.entries.clear();
            self.cursor = remaining;
        } else {
            self.cursor = next;
        }
    }
}

#[async_trait]
impl FrameSource for FileSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.ensure_listed().await?;
        let index = self.cursor % self.entries.len();
        let path = self.entries[index].clone();
        self.advance(1);

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?;

        let sequence = self.sequence;
        self.sequence += 1;

        tokio::task::spawn_blocking(move || Frame::decode(&bytes, sequence))
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?
            .map_err(SourceError::from)
    }

    async fn skip_frames(&mut self, count: u32) -> Result<(), SourceError> {
        self.ensure_listed().await?;
        self.advance(count as usize);
        self.sequence += u64::from(count);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, value: u8) {
        RgbImage::from_pixel(16, 16, Rgb([value, value, value]))
            .save_with_format(dir.join(name), ImageFormat::Png)
            .unwrap();
    }

    fn create_test_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 20);
        write_png(dir.path(), "a.png", 10);
        write_png(dir.path(), "c.png", 30);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        dir
    }

    async fn next_value(source: &mut FileSource) -> u8 {
        source.next_frame().await.unwrap().image.get_pixel(0, 0).0[0]
    }

    #[tokio::test]
    async fn test_directory_replayed_in_order_and_looped() {
        let dir = create_test_dir();
        let mut source = FileSource::new(dir.path().to_path_buf());

        let mut values = Vec::new();
        for _ in 0..5 {
            values.push(next_value(&mut source).await);
        }
        assert_eq!(values, vec![10, 20, 30, 10, 20]);
    }

    #[tokio::test]
    async fn test_skip_advances_cursor() {
        let dir = create_test_dir();
        let mut source = FileSource::new(dir.path().to_path_buf());

        assert_eq!(next_value(&mut source).await, 10);
        source.skip_frames(1).await.unwrap();
        assert_eq!(next_value(&mut source).await, 30);
        source.skip_frames(4).await.unwrap();
        assert_eq!(next_value(&mut source).await, 20);
    }

    #[tokio::test]
    async fn test_single_still_image() {
        let dir = create_test_dir();
        let mut source = FileSource::new(dir.path().join("b.png"));
        assert_eq!(next_value(&mut source).await, 20);
        assert_eq!(next_value(&mut source).await, 20);
    }

    #[tokio::test]
    async fn test_missing_path_is_unavailable() {
        let mut source = FileSource::new(PathBuf::from("/definitely/not/here"));
        assert!(matches!(source.next_frame().await, Err(SourceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_directory_without_images_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileSource::new(dir.path().to_path_buf());
        assert!(matches!(source.next_frame().await, Err(SourceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unreadable_image_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"garbage").unwrap();
        let mut source = FileSource::new(dir.path().to_path_buf());
        assert!(matches!(source.next_frame().await, Err(SourceError::Decode(_))));
    }
}

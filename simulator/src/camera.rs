use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use tracing::debug;

use crate::{
    collaborators::{CaptureDevice, Frame},
    error::CaptureError,
};

/// Stand-in camera producing a diagonal gradient that drifts each frame.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frames: AtomicU64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frames: AtomicU64::new(0),
        }
    }

    fn render(&self, frame_index: u64) -> RgbImage {
        let shift = (frame_index % 256) as u32;
        let (width, height) = (self.width, self.height);
        RgbImage::from_fn(width, height, |x, y| {
            let red = ((x * 255 / width + shift) % 256) as u8;
            let green = ((y * 255 / height + shift) % 256) as u8;
            let blue = (((x + y) / 2 + shift * 3) % 256) as u8;
            Rgb([red, green, blue])
        })
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCamera {
    async fn capture_frame(&self) -> Result<Frame, CaptureError> {
        let index = self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(self.render(index))
    }

    async fn write_frame(&self, frame: &Frame, path: &Path) -> Result<(), CaptureError> {
        let format = ImageFormat::from_path(path)
            .map_err(|err| CaptureError::Encode(format!("{}: {err}", path.display())))?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let frame = frame.clone();
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || frame.save_with_format(&target, format))
            .await
            .map_err(|err| CaptureError::Device(format!("encoder task failed: {err}")))?
            .map_err(|err| CaptureError::Encode(err.to_string()))?;

        debug!(path = %path.display(), "frame written");
        Ok(())
    }
}

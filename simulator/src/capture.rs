use std::{convert::Infallible, path::PathBuf, sync::Arc};

use chrono::{DateTime, Local};
use thing_common::CaptureConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    collaborators::{BlobUploader, CaptureDevice},
    error::{Result, SimulatorError},
    simulator::Shared,
};

/// Where frames are written locally and how uploaded blobs are named.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturePlan {
    pub work_path: PathBuf,
    pub prefix: String,
    pub extension: String,
}

impl CapturePlan {
    pub fn from_config(capture: &CaptureConfig, connection_string: &str) -> Self {
        Self {
            work_path: PathBuf::from(&capture.work_dir)
                .join(format!("{}.{}", capture.work_file, capture.extension)),
            prefix: capture.resolve_prefix(connection_string),
            extension: capture.extension.clone(),
        }
    }

    /// `<prefix><YYYYMMDDHHMMSS>.<ext>`
    pub fn blob_name(&self, at: DateTime<Local>) -> String {
        format!(
            "{}{}.{}",
            self.prefix,
            at.format("%Y%m%d%H%M%S"),
            self.extension
        )
    }
}

/// Captures and uploads a frame every capture interval until cancelled.
///
/// The token is checked after each sleep, so cancellation takes effect
/// within one interval plus one capture. The loop never finishes on its own:
/// the only way out is `Err(SimulatorError::Cancelled)`.
pub(crate) async fn run(
    shared: Arc<Shared>,
    device: Arc<dyn CaptureDevice>,
    uploader: Arc<dyn BlobUploader>,
    plan: CapturePlan,
    cancel: CancellationToken,
) -> Result<Infallible> {
    info!(path = %plan.work_path.display(), "capture loop started");
    loop {
        match capture_once(device.as_ref(), uploader.as_ref(), &plan).await {
            Ok(name) => debug!(blob = %name, "frame uploaded"),
            Err(err) => warn!("capture cycle failed: {err}"),
        }

        let interval = shared.capture_interval();
        tokio::time::sleep(interval).await;

        if cancel.is_cancelled() {
            info!("capture loop cancelled");
            return Err(SimulatorError::Cancelled);
        }
    }
}

async fn capture_once(
    device: &dyn CaptureDevice,
    uploader: &dyn BlobUploader,
    plan: &CapturePlan,
) -> Result<String> {
    let frame = device.capture_frame().await?;
    device.write_frame(&frame, &plan.work_path).await?;

    let name = plan.blob_name(Local::now());
    uploader.upload(&name, &plan.work_path).await?;
    Ok(name)
}

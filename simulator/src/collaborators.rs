//! Interfaces of the I/O collaborators the engine drives.
//!
//! The engine never talks to a broker, camera or blob store directly. Host
//! implementations live in [`crate::mqtt`], [`crate::camera`] and
//! [`crate::blob`]; tests substitute in-memory doubles.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use image::RgbImage;
use thing_common::{DesiredConfig, ReportedState};

use crate::error::{CaptureError, TransportError};

/// A single captured image.
pub type Frame = RgbImage;

/// A message delivered to the device by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Transport-assigned identifier used to acknowledge the message.
    pub id: u64,
    pub topic: String,
    pub body: Vec<u8>,
}

/// A remote procedure invocation addressed to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub name: String,
    pub request_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Entry points the transport calls when the remote side acts on the device.
///
/// Implementations must not fail: whatever happens inside, the transport
/// always gets a response to send back.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    async fn on_command(&self, request: CommandRequest) -> CommandResponse;

    async fn on_desired_update(&self, desired: DesiredConfig);
}

/// Factory for sessions with the remote management service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers the callbacks for commands and desired-configuration
    /// changes. Must happen before [`Transport::open`].
    async fn set_remote_handler(&self, handler: Arc<dyn RemoteHandler>);

    async fn open(&self) -> Result<Arc<dyn Session>, TransportError>;
}

/// An open connection to the remote management service.
///
/// Sends and receives may run concurrently. Opening and closing are
/// lifecycle operations the owner serializes against in-flight sends.
#[async_trait]
pub trait Session: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Suspends until a message arrives. Returns `None` when the transport's
    /// receive window elapses without one.
    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError>;

    /// Completes a message so the service does not redeliver it.
    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError>;

    async fn desired_config(&self) -> Result<DesiredConfig, TransportError>;

    async fn report_state(&self, reported: ReportedState) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn capture_frame(&self) -> Result<Frame, CaptureError>;

    /// Encodes the frame by the path's extension and writes it, replacing
    /// any existing file.
    async fn write_frame(&self, frame: &Frame, path: &Path) -> Result<(), CaptureError>;
}

#[async_trait]
pub trait BlobUploader: Send + Sync {
    async fn upload(&self, name: &str, local_path: &Path) -> Result<(), TransportError>;
}

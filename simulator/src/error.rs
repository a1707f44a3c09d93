use thing_common::ConfigParseError;
use thiserror::Error;

/// Failures of the remote session collaborator. Not retried by the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session is not open")]
    NotOpen,
    #[error("transport client error: {0}")]
    Client(String),
    #[error("transport operation timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the capture device while producing or persisting a frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device error: {0}")]
    Device(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    ConfigParse(#[from] ConfigParseError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("simulator session has not been initialized")]
    NotInitialized,
    #[error("simulator has already been started")]
    AlreadyStarted,
    #[error("a capture loop is already running")]
    CaptureAlreadyRunning,
}

impl SimulatorError {
    /// Cancellation is the expected way a capture loop ends.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T, E = SimulatorError> = std::result::Result<T, E>;

pub mod config;
pub mod desired;
pub mod thing;
pub mod topics;
pub mod types;

pub use config::{CaptureConfig, NetworkConfig, RuntimeConfig, SimulatorSettings, ThingConfig};
pub use desired::{ConfigParseError, DesiredConfig, ReportedState};
pub use thing::Thing;
pub use types::{
    CommandAck, Payload, SensorReading, TelemetryEnvelope, ThingStatus, COMMAND_STATUS_OK,
};

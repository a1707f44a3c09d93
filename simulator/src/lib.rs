//! Engine for a simulated connected thing: a drifting sensor, periodic
//! telemetry, remote commands and desired-configuration updates, and an
//! optional camera upload loop.

pub mod blob;
mod cadence;
pub mod camera;
mod capture;
pub mod collaborators;
pub mod error;
mod handlers;
pub mod http;
pub mod mqtt;
pub mod observers;
mod receive;
pub mod simulator;
mod telemetry;
#[cfg(test)]
mod testing;

pub use capture::CapturePlan;
pub use error::{CaptureError, Result, SimulatorError, TransportError};
pub use observers::{
    CommandInvoked, DesiredConfigUpdated, EventHub, MessageReceived, ObserverId, Observers,
};
pub use simulator::{Simulator, SimulatorStatus};

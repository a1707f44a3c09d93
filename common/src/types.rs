use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThingStatus {
    Initializing,
    Stable,
    Transitioning,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "currentTemperature")]
    pub current_temperature: f64,
    #[serde(rename = "currentHumidity")]
    pub current_humidity: f64,
    pub status: ThingStatus,
    pub timestamp: DateTime<Utc>,
}

/// Message body of a telemetry envelope.
///
/// Text that looks like a JSON object travels as structured data, anything
/// else as a plain string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Structured(Value),
}

impl Payload {
    pub fn probe(message: &str) -> Self {
        if message.starts_with('{') && message.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<Value>(message) {
                return Self::Structured(value);
            }
        }
        Self::Text(message.to_string())
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEnvelope {
    pub time: DateTime<Utc>,
    pub message: Payload,
}

impl TelemetryEnvelope {
    pub fn new(time: DateTime<Utc>, message: Payload) -> Self {
        Self { time, message }
    }

    pub fn from_text(time: DateTime<Utc>, message: &str) -> Self {
        Self::new(time, Payload::probe(message))
    }
}

pub const COMMAND_STATUS_OK: u16 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub status: String,
    #[serde(rename = "invokedTime")]
    pub invoked_time: DateTime<Utc>,
}

impl CommandAck {
    pub fn ok(invoked_time: DateTime<Utc>) -> Self {
        Self {
            status: "OK".to_string(),
            invoked_time,
        }
    }
}

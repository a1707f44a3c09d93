use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Desired-configuration key that retunes the telemetry cadence.
pub const TELEMETRY_CYCLE_KEY: &str = "telemetry-cycle-msec";

/// Reported key acknowledging receipt of a desired-configuration change.
pub const LAST_DESIRED_CHANGE_KEY: &str = "DateTimeLastDesiredPropertyChangeReceived";

/// Remote-pushed key/value settings, either a sparse delta or the full document.
pub type DesiredConfig = Map<String, Value>;

/// Device-pushed key/value snapshot.
pub type ReportedState = Map<String, Value>;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigParseError {
    #[error("desired value for {key} is not an integer: {value}")]
    NotAnInteger { key: &'static str, value: Value },
    #[error("desired value for {key} is negative: {value}")]
    Negative { key: &'static str, value: Value },
    #[error("desired configuration is not a JSON object")]
    NotAnObject,
}

/// Reads the telemetry cadence out of a desired-configuration document.
///
/// `None` when the key is absent.
pub fn telemetry_cycle_ms(desired: &DesiredConfig) -> Option<Result<u64, ConfigParseError>> {
    desired
        .get(TELEMETRY_CYCLE_KEY)
        .map(|value| parse_interval(TELEMETRY_CYCLE_KEY, value))
}

/// Parses raw bytes into a desired-configuration mapping.
pub fn parse_desired(raw: &[u8]) -> Result<DesiredConfig, ConfigParseError> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ConfigParseError::NotAnObject),
    }
}

pub fn desired_change_report(received_at: DateTime<Utc>) -> ReportedState {
    let mut reported = ReportedState::new();
    reported.insert(
        LAST_DESIRED_CHANGE_KEY.to_string(),
        Value::String(received_at.to_rfc3339()),
    );
    reported
}

fn parse_interval(key: &'static str, value: &Value) -> Result<u64, ConfigParseError> {
    // Services commonly send numbers as strings.
    let number = match value {
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    };

    match number {
        Some(ms) if ms < 0 => Err(ConfigParseError::Negative {
            key,
            value: value.clone(),
        }),
        Some(ms) => Ok(ms as u64),
        None => Err(ConfigParseError::NotAnInteger {
            key,
            value: value.clone(),
        }),
    }
}

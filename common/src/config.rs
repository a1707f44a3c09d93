use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub telemetry_cycle_ms: u64,
    pub update_interval_ms: u64,
    pub capture_interval_ms: u64,
    pub room_temperature: f64,
    pub room_humidity: f64,
    pub capture_on_start: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            telemetry_cycle_ms: 5_000,
            update_interval_ms: 1_000,
            capture_interval_ms: 10_000,
            room_temperature: 22.0,
            room_humidity: 45.0,
            capture_on_start: false,
        }
    }
}

impl SimulatorSettings {
    pub fn sanitize(&mut self) {
        // A zero cadence would spin the thing's tick loop.
        if self.update_interval_ms == 0 {
            self.update_interval_ms = 1_000;
        }
        if !self.room_temperature.is_finite() {
            self.room_temperature = 22.0;
        }
        if !self.room_humidity.is_finite() {
            self.room_humidity = 45.0;
        }
        self.room_humidity = self.room_humidity.clamp(0.0, 100.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThingConfig {
    pub temperature_step: f64,
    pub humidity_step: f64,
    pub transition_threshold: f64,
}

impl Default for ThingConfig {
    fn default() -> Self {
        Self {
            temperature_step: 0.5,
            humidity_step: 1.0,
            transition_threshold: 5.0,
        }
    }
}

impl ThingConfig {
    pub fn sanitize(&mut self) {
        self.temperature_step = self.temperature_step.clamp(0.01, 10.0);
        self.humidity_step = self.humidity_step.clamp(0.01, 20.0);
        self.transition_threshold = self.transition_threshold.clamp(0.5, 100.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub work_dir: String,
    pub work_file: String,
    #[serde(default)]
    pub file_prefix: Option<String>,
    pub extension: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub blob_dir: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            work_dir: "./.thing-sim".to_string(),
            work_file: "photo".to_string(),
            file_prefix: None,
            extension: "jpeg".to_string(),
            frame_width: 320,
            frame_height: 240,
            blob_dir: "./.thing-sim/blobs".to_string(),
        }
    }
}

impl CaptureConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.extension.trim().trim_start_matches('.');
        self.extension = if trimmed.is_empty() {
            "jpeg".to_string()
        } else {
            trimmed.to_ascii_lowercase()
        };

        if self.work_file.trim().is_empty() {
            self.work_file = "photo".to_string();
        }
        if self
            .file_prefix
            .as_deref()
            .is_some_and(|prefix| prefix.trim().is_empty())
        {
            self.file_prefix = None;
        }

        self.frame_width = self.frame_width.clamp(16, 4096);
        self.frame_height = self.frame_height.clamp(16, 4096);
    }

    /// Prefix for uploaded file names: the configured one, otherwise the
    /// device id from the connection string, otherwise `img`.
    pub fn resolve_prefix(&self, connection_string: &str) -> String {
        self.file_prefix
            .clone()
            .or_else(|| device_id_from_connection_string(connection_string))
            .unwrap_or_else(|| "img".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connection_string: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub keep_alive_secs: u64,
    pub receive_timeout_ms: u64,
    pub desired_config_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection_string: "HostName=127.0.0.1;DeviceId=thing-simulator".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            keep_alive_secs: 30,
            receive_timeout_ms: 5_000,
            desired_config_timeout_ms: 2_000,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
        self.keep_alive_secs = self.keep_alive_secs.clamp(5, 3_600);
        self.receive_timeout_ms = self.receive_timeout_ms.clamp(100, 600_000);
    }

    pub fn device_id(&self) -> String {
        device_id_from_connection_string(&self.connection_string)
            .unwrap_or_else(|| "thing-simulator".to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub simulator: SimulatorSettings,
    #[serde(default)]
    pub thing: ThingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.simulator.sanitize();
        self.thing.sanitize();
        self.capture.sanitize();
        self.network.sanitize();
    }
}

/// Extracts `DeviceId` from a `Key=Value;Key=Value` connection string.
pub fn device_id_from_connection_string(connection_string: &str) -> Option<String> {
    connection_string
        .split(';')
        .filter_map(|segment| segment.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("deviceid"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_device_id_from_connection_string() {
        let id = device_id_from_connection_string(
            "HostName=hub.local;DeviceId=kitchen-01;SharedAccessKey=abc=",
        );
        assert_eq!(id.as_deref(), Some("kitchen-01"));
        assert_eq!(device_id_from_connection_string("HostName=hub.local"), None);
        assert_eq!(device_id_from_connection_string("DeviceId=  "), None);
    }

    #[test]
    fn prefix_prefers_configured_value() {
        let mut capture = CaptureConfig {
            file_prefix: Some("cam".to_string()),
            ..CaptureConfig::default()
        };
        assert_eq!(capture.resolve_prefix("DeviceId=kitchen-01"), "cam");

        capture.file_prefix = None;
        assert_eq!(capture.resolve_prefix("DeviceId=kitchen-01"), "kitchen-01");
        assert_eq!(capture.resolve_prefix("HostName=hub.local"), "img");
    }

    #[test]
    fn sanitize_normalizes_capture_extension_and_blank_prefix() {
        let mut capture = CaptureConfig {
            extension: ".JPG".to_string(),
            file_prefix: Some(" ".to_string()),
            frame_width: 0,
            ..CaptureConfig::default()
        };
        capture.sanitize();

        assert_eq!(capture.extension, "jpg");
        assert_eq!(capture.file_prefix, None);
        assert_eq!(capture.frame_width, 16);
    }

    #[test]
    fn sanitize_repairs_simulator_settings() {
        let mut settings = SimulatorSettings {
            update_interval_ms: 0,
            room_humidity: 140.0,
            room_temperature: f64::NAN,
            ..SimulatorSettings::default()
        };
        settings.sanitize();

        assert_eq!(settings.update_interval_ms, 1_000);
        assert_eq!(settings.room_humidity, 100.0);
        assert_eq!(settings.room_temperature, 22.0);
    }

    #[test]
    fn partial_runtime_json_fills_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{ "network": { "connection_string": "DeviceId=porch", "mqtt_port": 1884 } }"#)
                .unwrap();

        assert_eq!(runtime.network.device_id(), "porch");
        assert_eq!(runtime.network.mqtt_port, 1884);
        assert_eq!(runtime.network.mqtt_host, "127.0.0.1");
        assert_eq!(runtime.simulator.telemetry_cycle_ms, 5_000);
        assert_eq!(runtime.capture.extension, "jpeg");
    }
}

use chrono::{DateTime, Utc};

use crate::{
    config::ThingConfig,
    types::{SensorReading, ThingStatus},
};

/// Simulated device with temperature/humidity sensors and a setpoint.
///
/// The model has no concurrency of its own. Owners serialize access through a
/// lock and drive it with [`Thing::tick`] on the cadence returned by
/// [`Thing::update_interval_ms`].
#[derive(Debug, Clone)]
pub struct Thing {
    pub config: ThingConfig,

    status: ThingStatus,
    current_temperature: f64,
    target_temperature: f64,
    current_humidity: f64,
    target_humidity: f64,

    // Target the actuator last settled on; a jump past the threshold
    // triggers a transition tick.
    settled_target: f64,
    update_interval_ms: u64,
}

impl Thing {
    pub fn new(config: ThingConfig) -> Self {
        Self {
            config,
            status: ThingStatus::Initializing,
            current_temperature: 0.0,
            target_temperature: 0.0,
            current_humidity: 0.0,
            target_humidity: 0.0,
            settled_target: 0.0,
            update_interval_ms: 0,
        }
    }

    pub fn status(&self) -> ThingStatus {
        self.status
    }

    pub fn current_temperature(&self) -> f64 {
        self.current_temperature
    }

    pub fn current_humidity(&self) -> f64 {
        self.current_humidity
    }

    pub fn target_temperature(&self) -> f64 {
        self.target_temperature
    }

    pub fn target_humidity(&self) -> f64 {
        self.target_humidity
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.update_interval_ms
    }

    /// Seeds the model from room conditions before it starts.
    ///
    /// Only the target temperature is seeded; the current temperature keeps
    /// its power-on value and converges once the cadence runs. Humidity is
    /// seeded on both sides. Returns `false` once the thing has left
    /// `Initializing`.
    pub fn prime(&mut self, room_temperature: f64, room_humidity: f64) -> bool {
        if self.status != ThingStatus::Initializing {
            return false;
        }
        self.target_temperature = room_temperature;
        self.current_humidity = room_humidity;
        self.target_humidity = room_humidity;
        true
    }

    /// Moves the thing to `Stable`. Must be called at most once.
    pub fn initialize(&mut self, update_interval_ms: u64) {
        self.status = ThingStatus::Stable;
        self.update_interval_ms = update_interval_ms;
        self.settled_target = self.target_temperature;
    }

    pub fn terminate(&mut self) {
        self.status = ThingStatus::Terminated;
    }

    pub fn is_terminated(&self) -> bool {
        self.status == ThingStatus::Terminated
    }

    pub fn set_target_temperature(&mut self, temperature: f64) -> bool {
        if (self.target_temperature - temperature).abs() > f64::EPSILON {
            self.target_temperature = temperature;
            true
        } else {
            false
        }
    }

    pub fn set_target_humidity(&mut self, humidity: f64) {
        self.target_humidity = humidity;
    }

    pub fn read(&self, at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            current_temperature: self.current_temperature,
            current_humidity: self.current_humidity,
            status: self.status,
            timestamp: at,
        }
    }

    /// Advances the model by one cadence step.
    pub fn tick(&mut self) {
        match self.status {
            ThingStatus::Stable => {
                if (self.target_temperature - self.settled_target).abs()
                    > self.config.transition_threshold
                {
                    self.settled_target = self.target_temperature;
                    self.status = ThingStatus::Transitioning;
                    return;
                }

                self.settled_target = self.target_temperature;
                self.current_temperature = approach(
                    self.current_temperature,
                    self.target_temperature,
                    self.config.temperature_step,
                );
                self.current_humidity = approach(
                    self.current_humidity,
                    self.target_humidity,
                    self.config.humidity_step,
                );
            }
            ThingStatus::Transitioning => {
                self.status = ThingStatus::Stable;
            }
            ThingStatus::Initializing | ThingStatus::Terminated => {}
        }
    }
}

fn approach(current: f64, target: f64, max_step: f64) -> f64 {
    let delta = target - current;
    if delta.abs() <= max_step {
        target
    } else {
        current + max_step.copysign(delta)
    }
}

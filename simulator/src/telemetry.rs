use std::sync::Arc;

use chrono::Utc;
use thing_common::{Payload, SensorReading, TelemetryEnvelope};
use tracing::{info, warn};

use crate::{collaborators::Session, simulator::Shared};

/// Publishes a reading every telemetry cycle while the run flag is set.
///
/// The run flag is consulted after each publish and again after each sleep,
/// so a publish already in flight completes but no new one starts once the
/// flag clears. The interval is re-read every cycle; a change lands on the
/// next sleep, never the current one.
pub(crate) async fn run(shared: Arc<Shared>, session: Arc<dyn Session>) {
    info!("telemetry loop started");
    loop {
        if !shared.is_running() {
            break;
        }

        let reading = shared.thing().read(Utc::now());
        match encode(reading) {
            Ok(body) => {
                if let Err(err) = session.publish(body).await {
                    warn!("telemetry publish failed: {err}");
                }
            }
            Err(err) => warn!("telemetry serialization failed: {err}"),
        }

        if !shared.is_running() {
            break;
        }

        let interval = shared.telemetry_interval();
        tokio::time::sleep(interval).await;
    }
    info!("telemetry loop stopped");
}

fn encode(reading: SensorReading) -> serde_json::Result<Vec<u8>> {
    let message = Payload::Structured(serde_json::to_value(&reading)?);
    serde_json::to_vec(&TelemetryEnvelope::new(reading.timestamp, message))
}

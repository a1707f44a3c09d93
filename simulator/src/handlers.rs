use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thing_common::{
    desired::{desired_change_report, telemetry_cycle_ms},
    CommandAck, DesiredConfig, COMMAND_STATUS_OK,
};
use tracing::{debug, info, warn};

use crate::{
    collaborators::{CommandRequest, CommandResponse, RemoteHandler},
    observers::{CommandInvoked, DesiredConfigUpdated},
    simulator::Shared,
};

#[async_trait]
impl RemoteHandler for Shared {
    async fn on_command(&self, request: CommandRequest) -> CommandResponse {
        info!(
            command = %request.name,
            request_id = %request.request_id,
            "command invoked"
        );
        let failures = self.events.command_invoked.notify(&CommandInvoked { request });
        if failures > 0 {
            debug!("{failures} command observers failed");
        }

        let ack = CommandAck::ok(Utc::now());
        let body = serde_json::to_vec(&ack).unwrap_or_else(|err| {
            warn!("failed to encode command ack: {err}");
            b"{}".to_vec()
        });
        CommandResponse {
            status: COMMAND_STATUS_OK,
            body,
        }
    }

    async fn on_desired_update(&self, desired: DesiredConfig) {
        let document = Value::Object(desired.clone());
        debug!("desired configuration update: {document}");
        self.events
            .desired_config_updated
            .notify(&DesiredConfigUpdated {
                desired: desired.clone(),
            });

        match telemetry_cycle_ms(&desired) {
            Some(Ok(interval_ms)) => {
                self.set_telemetry_interval_ms(interval_ms);
                info!("telemetry cycle changed to {interval_ms} ms");
            }
            Some(Err(err)) => warn!("ignoring desired telemetry cycle: {err}"),
            None => {}
        }

        let Some(session) = self.session() else {
            warn!("no open session; desired change not acknowledged");
            return;
        };
        if let Err(err) = session.report_state(desired_change_report(Utc::now())).await {
            warn!("failed to report desired change: {err}");
        }
    }
}

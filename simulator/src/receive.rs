use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{collaborators::Session, observers::MessageReceived, simulator::Shared};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Waits for inbound messages, notifies observers and completes each one,
/// until the run flag clears.
pub(crate) async fn run(shared: Arc<Shared>, session: Arc<dyn Session>) {
    info!("receive loop started");
    loop {
        match session.receive().await {
            Ok(Some(message)) => {
                debug!(id = message.id, topic = %message.topic, "message received");
                shared.events.message_received.notify(&MessageReceived {
                    message: message.clone(),
                });
                if let Err(err) = session.acknowledge(&message).await {
                    warn!("failed to acknowledge message {}: {err}", message.id);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("receive failed: {err}");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }

        if !shared.is_running() {
            break;
        }
    }
    info!("receive loop stopped");
}

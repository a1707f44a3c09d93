use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::simulator::Shared;

/// Drives the thing's internal adjustment tick until it is terminated.
///
/// Only the inner lock is taken here.
pub(crate) async fn run(shared: Arc<Shared>) {
    debug!("thing cadence started");
    loop {
        let interval = {
            let thing = shared.thing();
            if thing.is_terminated() {
                break;
            }
            Duration::from_millis(thing.update_interval_ms())
        };

        tokio::time::sleep(interval).await;

        let terminated = {
            let mut thing = shared.thing();
            thing.tick();
            thing.is_terminated()
        };
        if terminated {
            break;
        }
    }
    debug!("thing cadence stopped");
}

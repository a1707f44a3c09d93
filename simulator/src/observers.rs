use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use thing_common::DesiredConfig;
use tracing::warn;

use crate::collaborators::{CommandRequest, InboundMessage};

pub type ObserverId = u64;

/// Callback invoked with a borrowed event.
pub type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registration list of callbacks for one event type.
///
/// Callbacks run synchronously on the notifying task. A panicking callback
/// is logged and skipped; the remaining callbacks still run.
pub struct Observers<E> {
    name: &'static str,
    entries: RwLock<Vec<(ObserverId, Observer<E>)>>,
    next_id: AtomicU64,
}

impl<E> Observers<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, observer: Observer<E>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every registered observer and returns how many failed.
    pub fn notify(&self, event: &E) -> usize {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let snapshot: Vec<(ObserverId, Observer<E>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        for (id, observer) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                failures += 1;
                warn!("{} observer {id} panicked; continuing", self.name);
            }
        }
        failures
    }
}

#[derive(Debug, Clone)]
pub struct CommandInvoked {
    pub request: CommandRequest,
}

#[derive(Debug, Clone)]
pub struct DesiredConfigUpdated {
    pub desired: DesiredConfig,
}

#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub message: InboundMessage,
}

/// The three event streams the simulator exposes to local code.
pub struct EventHub {
    pub command_invoked: Observers<CommandInvoked>,
    pub desired_config_updated: Observers<DesiredConfigUpdated>,
    pub message_received: Observers<MessageReceived>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self {
            command_invoked: Observers::new("command-invoked"),
            desired_config_updated: Observers::new("desired-config-updated"),
            message_received: Observers::new("message-received"),
        }
    }
}

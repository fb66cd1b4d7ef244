//! Per-message expiry timers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::trace;

use crate::connection::Connection;
use crate::shutdown::{stopped, ShutdownSignal};

/// Arms one timer per submitted message and expires the session through
/// [`Connection::timeout`] when it fires.
///
/// Timers hold only a weak reference to their connection and are a no-op for
/// sessions that closed in the meantime. Cloning shares the same timers.
#[derive(Debug, Clone)]
pub struct TimeoutScheduler {
    runtime: Handle,
    shutdown: Arc<ShutdownSignal>,
}

impl TimeoutScheduler {
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            shutdown: Arc::new(ShutdownSignal::new()),
        }
    }

    /// Scheduler on the current tokio runtime, if there is one.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn schedule(&self, connection: Weak<Connection>, session_id: u64, after: Duration) {
        if after.is_zero() || self.shutdown.is_triggered() {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        self.runtime.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(after) => {
                    if let Some(connection) = connection.upgrade() {
                        connection.timeout(session_id);
                    }
                }
                () = stopped(&mut shutdown) => {
                    trace!(session_id, "timer cancelled");
                }
            }
        });
    }

    /// Cancels every outstanding timer and refuses new ones.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

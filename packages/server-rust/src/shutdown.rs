//! Broadcast stop signal shared by background tasks.

use tokio::sync::watch;

/// One-way stop signal backed by a `watch` channel.
///
/// Every task that must stop with its owner holds a receiver and selects on
/// [`stopped`] alongside its main work.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns a receiver that observes [`ShutdownSignal::trigger`].
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Signals every receiver. Triggering twice is harmless.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes once the signal fires or its sender is dropped.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let fired = *rx.borrow_and_update();
        if fired || rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn stopped_completes_after_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        signal.trigger();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn stopped_completes_when_already_triggered_or_dropped() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut late = signal.subscribe();
        stopped(&mut late).await;

        let signal = ShutdownSignal::new();
        let mut orphan = signal.subscribe();
        drop(signal);
        stopped(&mut orphan).await;
    }
}

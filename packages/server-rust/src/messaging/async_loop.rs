//! Dedicated message loop behind an async container.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use switchyard_core::Envelope;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use super::{MessagingCaller, MessagingHandler};
use crate::shutdown::{stopped, ShutdownSignal};

type Queues = (
    mpsc::UnboundedReceiver<Envelope>,
    mpsc::UnboundedReceiver<Envelope>,
);

/// Inbound and outbound queues drained by one spawned task.
///
/// Items can be queued before the loop is spawned; they are processed once
/// it starts. Each tick takes at most one inbound and one outbound item so
/// neither direction starves the other.
pub struct AsyncLoop {
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    queues: Mutex<Option<Queues>>,
    shutdown: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLoop {
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            outbound_tx,
            queues: Mutex::new(Some((inbound_rx, outbound_rx))),
            shutdown: ShutdownSignal::new(),
            task: Mutex::new(None),
        }
    }

    pub fn inbound(&self, envelope: Envelope) {
        if self.inbound_tx.send(envelope).is_err() {
            warn!("inbound queue closed, dropping message");
        }
    }

    pub fn outbound(&self, envelope: Envelope) {
        if self.outbound_tx.send(envelope).is_err() {
            warn!("outbound queue closed, dropping reply");
        }
    }

    /// Spawns the loop on `runtime`. Calling it a second time does nothing.
    pub fn spawn(
        &self,
        runtime: &Handle,
        handler: Arc<dyn MessagingHandler>,
        caller: Weak<dyn MessagingCaller>,
    ) {
        let Some((inbound, outbound)) = self.queues.lock().take() else {
            return;
        };
        let shutdown = self.shutdown.subscribe();
        let task = runtime.spawn(run(handler, caller, inbound, outbound, shutdown));
        *self.task.lock() = Some(task);
    }

    /// Signals the loop to stop. Items still queued are dropped.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Default for AsyncLoop {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(
    handler: Arc<dyn MessagingHandler>,
    caller: Weak<dyn MessagingCaller>,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stop = *shutdown.borrow();
        if stop {
            break;
        }

        let mut busy = false;
        if let Ok(envelope) = inbound.try_recv() {
            handler.inbound(envelope);
            busy = true;
        }
        if let Ok(envelope) = outbound.try_recv() {
            deliver(&caller, handler.name(), envelope);
            busy = true;
        }
        if busy {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            biased;
            () = stopped(&mut shutdown) => break,
            Some(envelope) = inbound.recv() => handler.inbound(envelope),
            Some(envelope) = outbound.recv() => deliver(&caller, handler.name(), envelope),
            else => break,
        }
    }
}

fn deliver(caller: &Weak<dyn MessagingCaller>, name: &str, envelope: Envelope) {
    match caller.upgrade() {
        Some(caller) => caller.outbound(envelope),
        None => warn!(node = name, "caller is gone, dropping reply"),
    }
}

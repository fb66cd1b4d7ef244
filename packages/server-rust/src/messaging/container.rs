//! Concurrency wrapper around a routing node.
//!
//! Every broker, service and process handler sits inside exactly one
//! container. Parents only ever talk to the container, so each level of the
//! tree can pick its own concurrency model.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use switchyard_core::Envelope;
use tokio::runtime::Handle;
use tracing::warn;

use super::async_loop::AsyncLoop;
use super::{MessagingCaller, MessagingHandler, MessagingStatus, StartContext};
use crate::config::ContainerMode;
use crate::error::StartError;

// ---------------------------------------------------------------------------
// Inline delivery
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InlineState {
    /// Inbound calls currently running on any thread.
    depth: usize,
    /// A thread is draining `outbound`.
    flushing: bool,
    outbound: VecDeque<Envelope>,
}

enum Delivery {
    Inline(Mutex<InlineState>),
    Async(AsyncLoop),
}

// ---------------------------------------------------------------------------
// MessagingContainer
// ---------------------------------------------------------------------------

/// Wraps one [`MessagingHandler`] and carries its traffic.
///
/// - Async: inbound and outbound items are queued and handled by a spawned
///   loop, so callers never block on the handler.
/// - Inline: the handler runs on the caller's stack. Replies produced while
///   an inbound call is running are queued and flushed once it returns, and
///   a single thread drains the queue at a time. Nested traffic through the
///   tree therefore never recurses without bound.
pub struct MessagingContainer {
    handler: Arc<dyn MessagingHandler>,
    caller: OnceLock<Weak<dyn MessagingCaller>>,
    delivery: Delivery,
}

impl MessagingContainer {
    #[must_use]
    pub fn new(mode: ContainerMode, handler: Arc<dyn MessagingHandler>) -> Arc<Self> {
        let delivery = match mode {
            ContainerMode::Async => Delivery::Async(AsyncLoop::new()),
            ContainerMode::Inline => Delivery::Inline(Mutex::new(InlineState::default())),
        };
        Arc::new(Self {
            handler,
            caller: OnceLock::new(),
            delivery,
        })
    }

    #[must_use]
    pub fn mode(&self) -> ContainerMode {
        match self.delivery {
            Delivery::Inline(_) => ContainerMode::Inline,
            Delivery::Async(_) => ContainerMode::Async,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    #[must_use]
    pub fn status(&self) -> &Arc<MessagingStatus> {
        self.handler.status()
    }

    /// Binds the caller, starts the handler and, for async containers, the
    /// message loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the container was already started, if an async
    /// container is started outside a tokio runtime, or if a child fails.
    pub fn start(
        self: &Arc<Self>,
        caller: Weak<dyn MessagingCaller>,
        ctx: &StartContext<'_>,
    ) -> Result<(), StartError> {
        let runtime = match &self.delivery {
            Delivery::Async(_) => Some(Handle::try_current().map_err(|_| StartError::NoRuntime {
                name: self.name().to_string(),
            })?),
            Delivery::Inline(_) => None,
        };
        if self.caller.set(caller.clone()).is_err() {
            return Err(StartError::AlreadyStarted {
                name: self.name().to_string(),
            });
        }

        self.handler.start(Arc::downgrade(self), ctx)?;

        if let (Delivery::Async(worker), Some(runtime)) = (&self.delivery, runtime) {
            worker.spawn(&runtime, Arc::clone(&self.handler), caller);
        }
        Ok(())
    }

    /// Passes a request down to the handler.
    pub fn inbound(&self, envelope: Envelope) {
        match &self.delivery {
            Delivery::Async(worker) => worker.inbound(envelope),
            Delivery::Inline(state) => {
                state.lock().depth += 1;
                self.handler.inbound(envelope);
                state.lock().depth -= 1;
                self.flush(state);
            }
        }
    }

    /// Passes a reply up to the caller.
    pub fn outbound(&self, envelope: Envelope) {
        match &self.delivery {
            Delivery::Async(worker) => worker.outbound(envelope),
            Delivery::Inline(state) => {
                {
                    let mut state = state.lock();
                    state.outbound.push_back(envelope);
                    if state.depth > 0 {
                        return;
                    }
                }
                self.flush(state);
            }
        }
    }

    /// Stops the handler, its children and any message loop.
    pub fn close(&self) {
        self.handler.close();
        if let Delivery::Async(worker) = &self.delivery {
            worker.stop();
        }
    }

    fn flush(&self, state: &Mutex<InlineState>) {
        {
            let mut state = state.lock();
            if state.flushing || state.depth > 0 {
                return;
            }
            state.flushing = true;
        }
        loop {
            let next = {
                let mut state = state.lock();
                match state.outbound.pop_front() {
                    Some(envelope) => envelope,
                    None => {
                        state.flushing = false;
                        return;
                    }
                }
            };
            self.deliver(next);
        }
    }

    fn deliver(&self, envelope: Envelope) {
        match self.caller.get().and_then(Weak::upgrade) {
            Some(caller) => caller.outbound(envelope),
            None => warn!(node = self.name(), "container has no caller, dropping reply"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

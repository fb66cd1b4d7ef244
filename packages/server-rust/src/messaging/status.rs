//! Counter tree mirroring the routing hierarchy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_core::{Envelope, StatusSnapshot};

/// Identity of one request at a node: the session that submitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection_id: u64,
    pub source_id: u64,
}

impl From<&Envelope> for SessionKey {
    fn from(envelope: &Envelope) -> Self {
        Self {
            connection_id: envelope.connection_id,
            source_id: envelope.source_id,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: u64,
    replied: u64,
    error: u64,
    /// Requests settled without a closing reply from this node.
    unanswered: u64,
    open: HashSet<SessionKey>,
}

impl Counters {
    #[allow(clippy::cast_possible_wrap)]
    fn pending(&self) -> i64 {
        self.received as i64 - self.replied as i64 - self.unanswered as i64
    }

    fn settle(&mut self, key: SessionKey) -> bool {
        self.open.remove(&key)
    }
}

/// Message counters for one routing node, plus the status of its children.
///
/// Every request is tracked until it settles, either by a closing reply
/// (`replied`) or by being written off (failed, or closed by its caller).
/// Each request settles once, so `pending` is the number of requests still
/// open and never goes negative. `error` counts bounces and failures; a
/// bounce is both an error and a reply.
#[derive(Debug)]
pub struct MessagingStatus {
    name: String,
    counters: Mutex<Counters>,
    children: Vec<Arc<MessagingStatus>>,
    active: AtomicBool,
}

impl MessagingStatus {
    #[must_use]
    pub fn new(name: impl Into<String>, children: Vec<Arc<MessagingStatus>>) -> Self {
        Self {
            name: name.into(),
            counters: Mutex::new(Counters::default()),
            children,
            active: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn leaf(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a request. A key that is already open is not counted twice.
    pub fn add_received(&self, key: SessionKey) {
        let mut counters = self.counters.lock();
        if counters.open.insert(key) {
            counters.received += 1;
        }
    }

    /// Settles a request with its closing reply. Replies for requests that
    /// already settled are not counted.
    pub fn add_replied(&self, key: SessionKey) {
        let mut counters = self.counters.lock();
        if counters.settle(key) {
            counters.replied += 1;
        }
    }

    /// Records an error that leaves the request open, such as a bounce-back
    /// about to be replied or a worker stage that may still recover.
    pub fn add_error(&self) {
        self.counters.lock().error += 1;
    }

    /// Records an error after which the request gets no reply from this node.
    pub fn add_failure(&self, key: SessionKey) {
        let mut counters = self.counters.lock();
        counters.error += 1;
        if counters.settle(key) {
            counters.unanswered += 1;
        }
    }

    /// Settles a request whose caller closed it before any closing reply.
    pub fn add_abandoned(&self, key: SessionKey) {
        let mut counters = self.counters.lock();
        if counters.settle(key) {
            counters.unanswered += 1;
        }
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.counters.lock().received
    }

    #[must_use]
    pub fn replied(&self) -> u64 {
        self.counters.lock().replied
    }

    #[must_use]
    pub fn error(&self) -> u64 {
        self.counters.lock().error
    }

    /// Requests still awaiting a reply from this node.
    #[must_use]
    pub fn pending(&self) -> i64 {
        self.counters.lock().pending()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// True when this node and every descendant is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.children.iter().all(|c| c.is_active())
    }

    #[must_use]
    pub fn children(&self) -> &[Arc<MessagingStatus>] {
        &self.children
    }

    /// Copies the counters of this node and its descendants.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let (received, replied, pending, error) = {
            let counters = self.counters.lock();
            (counters.received, counters.replied, counters.pending(), counters.error)
        };
        let children = if self.children.is_empty() {
            None
        } else {
            Some(self.children.iter().map(|c| c.snapshot()).collect())
        };
        StatusSnapshot {
            name: self.name.clone(),
            received,
            replied,
            pending,
            error,
            children,
        }
    }
}

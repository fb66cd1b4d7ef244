//! A submitted request and the replies it accumulates.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::{Envelope, MessageReply, Payload};
use tokio::sync::watch;

/// Owner of a message, told about its replies and its close.
///
/// Callbacks run on whichever thread delivered the reply, with no message
/// lock held.
pub trait MessageSource: Send + Sync {
    /// The first reply fragment arrived.
    fn reply_received(&self, message: &Arc<Message>, fragment: &Envelope);

    /// A further reply fragment arrived.
    fn update_received(&self, message: &Arc<Message>, fragment: &Envelope);

    /// The message closed, by a closing reply, a timeout or its connection closing.
    fn message_closed(&self, message: &Arc<Message>);
}

#[derive(Debug, Default)]
struct MessageState {
    connection_id: u64,
    source_id: u64,
    reply: MessageReply,
    received: bool,
    new_reply: bool,
    closed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    fragments: usize,
    closed: bool,
}

/// A request submitted on a [`Connection`](crate::connection::Connection).
///
/// The request payload is fixed at construction. Identity is bound when the
/// owning connection builds the header; replies are merged into a single
/// [`MessageReply`] until a fragment closes the message.
pub struct Message {
    service: String,
    message: String,
    request: Payload,
    origin: Option<Envelope>,
    source_ref: Option<u64>,
    owner: Option<Weak<dyn MessageSource>>,
    timeout: Option<Duration>,
    state: Mutex<MessageState>,
    progress: watch::Sender<Progress>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Message")
            .field("service", &self.service)
            .field("message", &self.message)
            .field("connection_id", &state.connection_id)
            .field("source_id", &state.source_id)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl Message {
    #[must_use]
    pub fn new(service: impl Into<String>, message: impl Into<String>, request: Payload) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            service: service.into(),
            message: message.into(),
            request,
            origin: None,
            source_ref: None,
            owner: None,
            timeout: None,
            state: Mutex::new(MessageState::default()),
            progress,
        }
    }

    /// Sets the owner notified of replies and close.
    #[must_use]
    pub fn with_source(mut self, owner: Weak<dyn MessageSource>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Records the request that caused this one and the worker that sent it.
    #[must_use]
    pub fn with_origin(mut self, origin: Option<Envelope>, source_ref: Option<u64>) -> Self {
        self.origin = origin;
        self.source_ref = source_ref;
        self
    }

    /// Overrides the connection's default timeout. Zero disables it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn source_ref(&self) -> Option<u64> {
        self.source_ref
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.state.lock().connection_id
    }

    #[must_use]
    pub fn source_id(&self) -> u64 {
        self.state.lock().source_id
    }

    /// Binds identity and returns the routing header.
    ///
    /// A connection calls this once per submission; binding again overwrites
    /// the previous identity.
    pub fn get_header(&self, connection_id: u64, source_id: u64) -> Envelope {
        {
            let mut state = self.state.lock();
            state.connection_id = connection_id;
            state.source_id = source_id;
        }
        self.header()
    }

    /// Binds identity and returns the header together with the request body.
    pub fn get_request(&self, connection_id: u64, source_id: u64) -> Envelope {
        let mut envelope = self.get_header(connection_id, source_id);
        envelope.request = Some(self.request.clone());
        envelope
    }

    /// Routing header using the identity already bound.
    #[must_use]
    pub fn header(&self) -> Envelope {
        let (connection_id, source_id) = {
            let state = self.state.lock();
            (state.connection_id, state.source_id)
        };
        Envelope {
            service: self.service.clone(),
            message: self.message.clone(),
            connection_id,
            source_id,
            source_ref: self.source_ref,
            source: self.origin.clone().map(Box::new),
            ..Envelope::default()
        }
    }

    /// Merges a reply fragment and notifies the owner.
    ///
    /// The first fragment raises `reply_received`, later ones
    /// `update_received`. A closing fragment then closes the message.
    /// Fragments arriving after close are ignored.
    pub fn add_reply(self: &Arc<Self>, fragment: &Envelope) {
        let first = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.reply.merge(fragment);
            let first = !state.received;
            state.received = true;
            state.new_reply = true;
            first
        };
        self.progress.send_modify(|p| p.fragments += 1);

        if let Some(owner) = self.owner() {
            if first {
                owner.reply_received(self, fragment);
            } else {
                owner.update_received(self, fragment);
            }
        }
        if fragment.close {
            self.close();
        }
    }

    /// Closes the message and tells the owner. Closing twice does nothing.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.progress.send_modify(|p| p.closed = true);
        if let Some(owner) = self.owner() {
            owner.message_closed(self);
        }
    }

    /// Returns the accumulated reply, clearing the new-reply flag.
    #[must_use]
    pub fn get_reply(&self) -> Option<MessageReply> {
        let mut state = self.state.lock();
        if !state.received {
            return None;
        }
        state.new_reply = false;
        Some(state.reply.clone())
    }

    #[must_use]
    pub fn has_reply(&self) -> bool {
        self.state.lock().received
    }

    #[must_use]
    pub fn has_new_reply(&self) -> bool {
        self.state.lock().new_reply
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Waits until at least one reply fragment has arrived.
    pub async fn wait_for_reply(&self) -> MessageReply {
        self.wait_until(|p| p.fragments > 0).await
    }

    /// Waits until the message is closed and returns everything it received.
    pub async fn wait_for_close(&self) -> MessageReply {
        self.wait_until(|p| p.closed).await
    }

    async fn wait_until(&self, ready: impl FnMut(&Progress) -> bool) -> MessageReply {
        let mut progress = self.progress.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = progress.wait_for(ready).await;
        self.state.lock().reply.clone()
    }

    fn owner(&self) -> Option<Arc<dyn MessageSource>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

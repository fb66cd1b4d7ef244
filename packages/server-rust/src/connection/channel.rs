//! A caller's channel into a broker and the sessions it has in flight.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use switchyard_core::{Envelope, SystemRequest, TIMEOUT_RETURN};
use tracing::{debug, trace, warn};

use super::transport::{Transport, TransportListener};
use crate::messaging::{Message, MessagingContainer};
use crate::timeout::TimeoutScheduler;

/// Where a connection delivers its requests.
pub enum Link {
    /// Loopback into this broker's root container.
    Local(Weak<MessagingContainer>),
    /// Session to another broker.
    Remote(Arc<dyn Transport>),
}

#[derive(Default)]
struct Sessions {
    last_id: u64,
    live: HashMap<u64, Arc<Message>>,
}

/// A channel into a broker, tracking every message it has in flight.
///
/// Session ids start at 1 and increase for the life of the connection; a
/// closed session is removed and its id never reused. Replies for sessions
/// that are no longer live are dropped.
///
/// Requests and close notices leave in the order their ids were assigned:
/// `dispatch` is held from id assignment until the envelope has been sent
/// down. It is re-entrant because an inline tree may submit on the same
/// connection again before the outer send returns.
pub struct Connection {
    id: u64,
    name: String,
    link: Link,
    dispatch: ReentrantMutex<()>,
    sessions: Mutex<Sessions>,
    timeouts: Option<TimeoutScheduler>,
    default_timeout: Duration,
    me: Weak<Connection>,
}

impl Connection {
    /// Creates a connection. A remote connection registers itself as the
    /// listener of its transport.
    #[must_use]
    pub fn new(
        id: u64,
        name: impl Into<String>,
        link: Link,
        timeouts: Option<TimeoutScheduler>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|me| Self {
            id,
            name: name.into(),
            link,
            dispatch: ReentrantMutex::new(()),
            sessions: Mutex::new(Sessions::default()),
            timeouts,
            default_timeout,
            me: me.clone(),
        });
        if let Link::Remote(transport) = &connection.link {
            let listener: Weak<dyn TransportListener> = connection.me.clone();
            transport.set_listener(listener);
        }
        connection
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.link, Link::Local(_))
    }

    /// Number of sessions still awaiting a closing reply.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().live.len()
    }

    #[must_use]
    pub fn is_live(&self, session_id: u64) -> bool {
        self.sessions.lock().live.contains_key(&session_id)
    }

    /// Registers `message` under the next session id and sends its request
    /// down. The reply arrives later through [`Connection::reply`].
    pub fn submit(&self, message: &Arc<Message>) -> u64 {
        let _dispatch = self.dispatch.lock();
        let session_id = {
            let mut sessions = self.sessions.lock();
            sessions.last_id += 1;
            let session_id = sessions.last_id;
            sessions.live.insert(session_id, Arc::clone(message));
            session_id
        };
        let request = message.get_request(self.id, session_id);
        trace!(
            connection_id = self.id,
            session_id,
            service = %request.service,
            message = %request.message,
            "submit"
        );

        if let Some(timeouts) = &self.timeouts {
            let after = message.timeout().unwrap_or(self.default_timeout);
            timeouts.schedule(self.me.clone(), session_id, after);
        }
        self.send_down(request);
        session_id
    }

    /// Merges a reply into its live message, removing the session when the
    /// reply closes it. Replies for sessions that are not live are dropped.
    pub fn reply(&self, reply: Envelope) {
        let message = {
            let mut sessions = self.sessions.lock();
            if reply.close {
                sessions.live.remove(&reply.source_id)
            } else {
                sessions.live.get(&reply.source_id).cloned()
            }
        };
        match message {
            Some(message) => message.add_reply(&reply),
            None => debug!(
                connection_id = self.id,
                session_id = reply.source_id,
                "dropping reply for a closed session"
            ),
        }
    }

    /// Expires a session: the caller gets a reply carrying the timeout reason,
    /// then the session is force-closed. Does nothing if already closed.
    pub fn timeout(&self, session_id: u64) {
        let Some(message) = self.sessions.lock().live.get(&session_id).cloned() else {
            return;
        };
        warn!(connection_id = self.id, session_id, "message timed out");

        let mut expired = message.header();
        expired.reply = Some(switchyard_core::Payload::new());
        expired.return_message = Some(TIMEOUT_RETURN.to_string());
        self.reply(expired);
        self.close_message(session_id);
    }

    /// Removes a live session, tells the tree it is gone and closes the message.
    pub fn close_message(&self, session_id: u64) {
        let _dispatch = self.dispatch.lock();
        let Some(message) = self.sessions.lock().live.remove(&session_id) else {
            return;
        };
        let mut notice = message.header();
        notice.system_request = Some(SystemRequest::CloseMessage);
        self.send_down(notice);
        message.close();
    }

    /// Force-closes every live session, then releases the transport.
    pub fn close(&self) {
        let mut open: Vec<u64> = self.sessions.lock().live.keys().copied().collect();
        open.sort_unstable();
        for session_id in open {
            self.close_message(session_id);
        }
        if let Link::Remote(transport) = &self.link {
            transport.close();
        }
        debug!(connection_id = self.id, name = %self.name, "connection closed");
    }

    fn send_down(&self, envelope: Envelope) {
        match &self.link {
            Link::Local(broker) => match broker.upgrade() {
                Some(root) => root.inbound(envelope),
                None => warn!(connection_id = self.id, "broker is gone, dropping request"),
            },
            Link::Remote(transport) => {
                if let Err(e) = transport.send(&envelope) {
                    warn!(
                        connection_id = self.id,
                        session_id = envelope.source_id,
                        error = %e,
                        "send failed, dropping request"
                    );
                }
            }
        }
    }
}

impl TransportListener for Connection {
    fn on_message(&self, envelope: Envelope) {
        self.reply(envelope);
    }

    /// The peer went away: every live message is closed locally since no
    /// reply can arrive any more.
    fn on_closed(&self) {
        let orphaned: Vec<Arc<Message>> = self.sessions.lock().live.drain().map(|(_, m)| m).collect();
        if !orphaned.is_empty() {
            warn!(
                connection_id = self.id,
                name = %self.name,
                orphaned = orphaned.len(),
                "session transport closed"
            );
        }
        for message in orphaned {
            message.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use switchyard_core::Payload;

    use super::*;
    use crate::error::TransportError;

    fn detached(id: u64) -> Arc<Connection> {
        Connection::new(id, "local", Link::Local(Weak::new()), None, Duration::ZERO)
    }

    fn request() -> Arc<Message> {
        Arc::new(Message::new("math", "add", Payload::new()))
    }

    fn reply_for(session_id: u64, close: bool) -> Envelope {
        let mut reply = Envelope::default().into_reply(
            match json!({"result": 5}) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            },
            close,
        );
        reply.source_id = session_id;
        reply
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Envelope>>,
        closed: Mutex<bool>,
    }

    impl Transport for Recording {
        fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
            if *self.closed.lock() {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push(envelope.clone());
            Ok(())
        }
        fn set_listener(&self, _listener: Weak<dyn TransportListener>) {}
        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    proptest! {
        #[test]
        fn session_ids_are_sequential_from_one(count in 1usize..64) {
            let connection = detached(3);
            let ids: Vec<u64> = (0..count).map(|_| connection.submit(&request())).collect();
            let expected: Vec<u64> = (1..=count as u64).collect();
            prop_assert_eq!(ids, expected);
            prop_assert_eq!(connection.live_sessions(), count);
        }
    }

    #[test]
    fn new_connections_restart_numbering() {
        let first = detached(1);
        let second = detached(2);
        assert_eq!(first.submit(&request()), 1);
        assert_eq!(first.submit(&request()), 2);
        assert_eq!(second.submit(&request()), 1);
    }

    #[test]
    fn submit_binds_identity() {
        let connection = detached(9);
        let message = request();
        let session_id = connection.submit(&message);
        assert_eq!(message.connection_id(), 9);
        assert_eq!(message.source_id(), session_id);
    }

    #[test]
    fn closing_reply_removes_session_and_late_reply_is_dropped() {
        let connection = detached(1);
        let message = request();
        let session_id = connection.submit(&message);

        connection.reply(reply_for(session_id, false));
        assert!(connection.is_live(session_id));
        connection.reply(reply_for(session_id, true));
        assert!(!connection.is_live(session_id));
        assert_eq!(message.get_reply().unwrap().fragments, 2);

        connection.reply(reply_for(session_id, true));
        assert_eq!(message.get_reply().unwrap().fragments, 2);
    }

    #[test]
    fn timeout_unblocks_caller() {
        let connection = detached(1);
        let message = request();
        let session_id = connection.submit(&message);

        connection.timeout(session_id);

        assert!(message.has_reply());
        assert!(message.is_closed());
        let reply = message.get_reply().unwrap();
        assert_eq!(reply.return_message.as_deref(), Some(TIMEOUT_RETURN));
        assert_eq!(connection.live_sessions(), 0);

        connection.timeout(session_id);
        assert_eq!(message.get_reply().unwrap().fragments, 1);
    }

    #[test]
    fn remote_close_sends_close_notices_then_closes_transport() {
        let transport = Arc::new(Recording::default());
        let connection = Connection::new(
            4,
            "peer",
            Link::Remote(Arc::clone(&transport) as Arc<dyn Transport>),
            None,
            Duration::ZERO,
        );
        let first = request();
        let second = request();
        connection.submit(&first);
        connection.submit(&second);

        connection.close();

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].request.is_some());
        assert!(sent[2].is_close_request());
        assert_eq!(sent[2].source_id, 1);
        assert_eq!(sent[3].source_id, 2);
        assert!(first.is_closed() && second.is_closed());
        assert!(*transport.closed.lock());

        drop(sent);
        let late = request();
        connection.submit(&late);
        assert_eq!(transport.sent.lock().len(), 4);
    }

    #[test]
    fn transport_loss_closes_every_message() {
        let connection = detached(1);
        let message = request();
        connection.submit(&message);
        connection.on_closed();
        assert!(message.is_closed());
        assert_eq!(connection.live_sessions(), 0);
    }

    /// Holds the first request on the wire until told to let it go.
    #[derive(Default)]
    struct Stalling {
        order: Mutex<Vec<u64>>,
        entered: std::sync::atomic::AtomicBool,
    }

    impl Transport for Stalling {
        fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
            if envelope.source_id == 1 {
                self.entered
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
            }
            self.order.lock().push(envelope.source_id);
            Ok(())
        }
        fn set_listener(&self, _listener: Weak<dyn TransportListener>) {}
        fn close(&self) {}
    }

    #[test]
    fn concurrent_submits_leave_in_session_order() {
        let transport = Arc::new(Stalling::default());
        let connection = Connection::new(
            2,
            "peer",
            Link::Remote(Arc::clone(&transport) as Arc<dyn Transport>),
            None,
            Duration::ZERO,
        );

        let first = {
            let connection = Arc::clone(&connection);
            std::thread::spawn(move || connection.submit(&request()))
        };
        while !transport.entered.load(std::sync::atomic::Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let second = {
            let connection = Arc::clone(&connection);
            std::thread::spawn(move || connection.submit(&request()))
        };

        assert_eq!(first.join().unwrap(), 1);
        assert_eq!(second.join().unwrap(), 2);
        assert_eq!(*transport.order.lock(), vec![1, 2]);
    }

    #[test]
    fn nested_submit_on_the_same_connection_does_not_block() {
        struct Reentering {
            connection: Mutex<Weak<Connection>>,
            sent: Mutex<Vec<u64>>,
        }
        impl Transport for Reentering {
            fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
                self.sent.lock().push(envelope.source_id);
                if envelope.source_id == 1 {
                    let connection = self.connection.lock().upgrade();
                    if let Some(connection) = connection {
                        connection.submit(&request());
                    }
                }
                Ok(())
            }
            fn set_listener(&self, _listener: Weak<dyn TransportListener>) {}
            fn close(&self) {}
        }

        let transport = Arc::new(Reentering {
            connection: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
        });
        let connection = Connection::new(
            3,
            "peer",
            Link::Remote(Arc::clone(&transport) as Arc<dyn Transport>),
            None,
            Duration::ZERO,
        );
        *transport.connection.lock() = Arc::downgrade(&connection);

        assert_eq!(connection.submit(&request()), 1);
        assert_eq!(*transport.sent.lock(), vec![1, 2]);
        assert_eq!(connection.live_sessions(), 2);
    }
}

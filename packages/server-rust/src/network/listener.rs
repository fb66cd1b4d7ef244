//! Server side of broker-to-broker sessions.
//!
//! Each accepted peer gets its own local connection into this broker.
//! Requests from the peer are resubmitted on that connection and every reply
//! fragment is sent back readdressed to the peer's own ids.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use switchyard_core::{Envelope, LOCAL_CONNECTION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::transport::{read_frames, write_frames};
use crate::connection::{Connection, ConnectionList};
use crate::messaging::{Message, MessageSource};
use crate::shutdown::{stopped, ShutdownSignal};

/// Accepts sessions from remote brokers.
pub struct SessionListener {
    listener: TcpListener,
}

impl SessionListener {
    /// Binds the session port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "session listener bound");
        Ok(Self { listener })
    }

    /// Address actually bound, useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts peers until `shutdown` fires. Open sessions are told to stop
    /// at the same time.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and skipped.
    pub async fn serve(
        self,
        connections: Arc<ConnectionList>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let sessions = ShutdownSignal::new();
        loop {
            tokio::select! {
                () = stopped(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connections = Arc::clone(&connections);
                        let stop = sessions.subscribe();
                        tokio::spawn(async move {
                            run_session(stream, peer, &connections, stop).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        sessions.trigger();
        info!("session listener stopped");
        Ok(())
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    connections: &ConnectionList,
    stop: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not set nodelay");
    }
    let connection = match connections.new_connection(LOCAL_CONNECTION) {
        Ok(connection) => connection,
        Err(e) => {
            warn!(%peer, error = %e, "refusing session");
            return;
        }
    };
    info!(%peer, connection_id = connection.id(), "session opened");

    let (read, write) = stream.into_split();
    let (frames, outgoing) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(write, outgoing, stop.clone()));

    let session = PeerSession::new(peer, Arc::clone(&connection), frames);
    read_frames(read, |envelope| session.receive(envelope), stop).await;

    connections.remove(connection.id());
    connection.close();
    drop(session);
    let _ = writer.await;
    info!(%peer, connection_id = connection.id(), "session closed");
}

// ---------------------------------------------------------------------------
// PeerSession
// ---------------------------------------------------------------------------

/// Relays one peer's requests into the broker and its replies back out.
///
/// The peer's request header travels as the origin of each resubmitted
/// message, so a reply can be readdressed without a lookup.
struct PeerSession {
    peer: SocketAddr,
    connection: Arc<Connection>,
    frames: mpsc::UnboundedSender<Bytes>,
    /// Peer `(connection_id, source_id)` to local session id.
    live: Mutex<HashMap<(u64, u64), u64>>,
    me: Weak<PeerSession>,
}

impl PeerSession {
    fn new(
        peer: SocketAddr,
        connection: Arc<Connection>,
        frames: mpsc::UnboundedSender<Bytes>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            peer,
            connection,
            frames,
            live: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    fn receive(&self, envelope: Envelope) {
        let key = (envelope.connection_id, envelope.source_id);
        if envelope.is_close_request() {
            let session_id = self.live.lock().get(&key).copied();
            if let Some(session_id) = session_id {
                debug!(peer = %self.peer, session_id, "peer closed session");
                self.connection.close_message(session_id);
            }
            return;
        }

        let owner: Weak<dyn MessageSource> = self.me.clone();
        let header = envelope.header();
        let message = Arc::new(
            Message::new(
                envelope.service,
                envelope.message,
                envelope.request.unwrap_or_default(),
            )
            .with_source(owner)
            .with_origin(Some(header), None),
        );
        let session_id = self.connection.submit(&message);

        let mut live = self.live.lock();
        if !message.is_closed() {
            live.insert(key, session_id);
        }
    }

    /// Readdresses `fragment` to the peer request behind `message`.
    fn send_back(&self, message: &Message, mut fragment: Envelope) {
        let Some(origin) = message.header().source else {
            return;
        };
        fragment.connection_id = origin.connection_id;
        fragment.source_id = origin.source_id;
        fragment.source_ref = origin.source_ref;
        fragment.source = origin.source;
        fragment.system_request = None;

        match fragment.to_msgpack() {
            Ok(bytes) => {
                if self.frames.send(Bytes::from(bytes)).is_err() {
                    debug!(peer = %self.peer, "session gone, dropping reply");
                }
            }
            Err(e) => warn!(peer = %self.peer, error = %e, "could not encode reply"),
        }
    }
}

impl MessageSource for PeerSession {
    fn reply_received(&self, message: &Arc<Message>, fragment: &Envelope) {
        self.send_back(message, fragment.clone());
    }

    fn update_received(&self, message: &Arc<Message>, fragment: &Envelope) {
        self.send_back(message, fragment.clone());
    }

    /// Forgets the session. A session closed without a closing reply, by a
    /// timeout or shutdown, still gets a close sent to the peer.
    fn message_closed(&self, message: &Arc<Message>) {
        let header = message.header();
        if let Some(origin) = &header.source {
            self.live
                .lock()
                .remove(&(origin.connection_id, origin.source_id));
        }
        let answered = message.get_reply().is_some_and(|reply| reply.close);
        if !answered {
            let mut close = header;
            close.close = true;
            self.send_back(message, close);
        }
    }
}

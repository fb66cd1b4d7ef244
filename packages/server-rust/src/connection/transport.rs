//! Session transport between brokers: length-delimited frames carrying
//! named `MsgPack` envelopes over TCP.

use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use switchyard_core::Envelope;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::{ConnectionError, TransportError};
use crate::shutdown::{stopped, ShutdownSignal};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec shared by both ends of a session.
#[must_use]
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Receives envelopes pushed by the remote side.
pub trait TransportListener: Send + Sync {
    fn on_message(&self, envelope: Envelope);

    /// The session ended; nothing more will arrive.
    fn on_closed(&self) {}
}

/// An outbound session to another broker.
pub trait Transport: Send + Sync {
    /// Queues an envelope for the peer without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or the session is
    /// closed.
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Sets the receiver of incoming envelopes. Only the first call counts.
    fn set_listener(&self, listener: Weak<dyn TransportListener>);

    fn close(&self);
}

// ---------------------------------------------------------------------------
// TcpTransport
// ---------------------------------------------------------------------------

/// Client side of a broker session.
///
/// Writes go through an unbounded queue to a writer task so that `send`
/// never blocks the routing thread that calls it.
pub struct TcpTransport {
    peer: String,
    frames: mpsc::UnboundedSender<Bytes>,
    listener: Arc<OnceLock<Weak<dyn TransportListener>>>,
    shutdown: ShutdownSignal,
}

impl TcpTransport {
    /// Connects to `host:port` on behalf of remote host `name`.
    ///
    /// The TCP handshake runs on the calling thread; frame I/O runs on the
    /// current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no runtime or the peer cannot be reached.
    pub fn connect(name: &str, host: &str, port: u16) -> Result<Arc<Self>, ConnectionError> {
        let runtime = Handle::try_current().map_err(|_| ConnectionError::NoRuntime {
            name: name.to_string(),
        })?;
        let address = format!("{host}:{port}");
        let failed = |source: std::io::Error| ConnectionError::Connect {
            name: name.to_string(),
            address: address.clone(),
            source,
        };

        let stream = std::net::TcpStream::connect(&address).map_err(failed)?;
        stream.set_nodelay(true).map_err(failed)?;
        stream.set_nonblocking(true).map_err(failed)?;
        let stream = {
            let _entered = runtime.enter();
            TcpStream::from_std(stream).map_err(failed)?
        };

        debug!(peer = %address, "session transport connected");
        Ok(Self::spawn(name.to_string(), stream, &runtime))
    }

    fn spawn(peer: String, stream: TcpStream, runtime: &Handle) -> Arc<Self> {
        let (read, write) = stream.into_split();
        let (frames, outgoing) = mpsc::unbounded_channel();
        let listener: Arc<OnceLock<Weak<dyn TransportListener>>> = Arc::new(OnceLock::new());
        let shutdown = ShutdownSignal::new();

        runtime.spawn(write_frames(write, outgoing, shutdown.subscribe()));
        {
            let listener = Arc::clone(&listener);
            let reader = Arc::clone(&listener);
            let peer = peer.clone();
            let stop = shutdown.subscribe();
            runtime.spawn(async move {
                read_frames(
                    read,
                    |envelope| match reader.get().and_then(Weak::upgrade) {
                        Some(listener) => listener.on_message(envelope),
                        None => warn!(peer = %peer, "no listener for incoming envelope"),
                    },
                    stop,
                )
                .await;
                if let Some(listener) = listener.get().and_then(Weak::upgrade) {
                    listener.on_closed();
                }
            });
        }

        Arc::new(Self {
            peer,
            frames,
            listener,
            shutdown,
        })
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        let frame = Bytes::from(envelope.to_msgpack()?);
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }

    fn set_listener(&self, listener: Weak<dyn TransportListener>) {
        let _ = self.listener.set(listener);
    }

    fn close(&self) {
        self.shutdown.trigger();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

// ---------------------------------------------------------------------------
// Frame pumps
// ---------------------------------------------------------------------------

/// Drains `outgoing` onto the socket until stopped or the queue closes.
pub(crate) async fn write_frames(
    write: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sink = FramedWrite::new(write, frame_codec());
    loop {
        tokio::select! {
            () = stopped(&mut shutdown) => break,
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "session write failed");
                    break;
                }
            }
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

/// Decodes incoming frames and hands each envelope to `deliver` until the
/// peer disconnects or the session is stopped.
pub(crate) async fn read_frames(
    read: OwnedReadHalf,
    mut deliver: impl FnMut(Envelope) + Send,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(read, frame_codec());
    loop {
        tokio::select! {
            () = stopped(&mut shutdown) => break,
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => match Envelope::from_msgpack(&bytes) {
                    Ok(envelope) => deliver(envelope),
                    Err(e) => warn!(error = %e, "dropping undecodable frame"),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "session read failed");
                    break;
                }
                None => break,
            },
        }
    }
}

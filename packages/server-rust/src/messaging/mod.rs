//! Messaging primitives: messages, status counters and the containers that
//! carry traffic between routing nodes.

pub mod async_loop;
pub mod container;
pub mod message;
pub mod status;

use std::sync::{Arc, Weak};

use switchyard_core::Envelope;

use crate::connection::ConnectionList;
use crate::error::StartError;

pub use container::MessagingContainer;
pub use message::{Message, MessageSource};
pub use status::{MessagingStatus, SessionKey};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Receiver of replies travelling up the tree.
///
/// A child container holds its caller as a `Weak` reference; the owning
/// direction of the tree is always top-down.
pub trait MessagingCaller: Send + Sync {
    fn outbound(&self, envelope: Envelope);
}

/// Shared resources handed down the tree while it starts.
#[derive(Clone, Copy)]
pub struct StartContext<'a> {
    pub connections: &'a Arc<ConnectionList>,
}

/// A routing node wrapped by a [`MessagingContainer`].
///
/// Replies a handler produces go to its own container, which forwards them
/// to the container's caller.
pub trait MessagingHandler: MessagingCaller {
    fn name(&self) -> &str;

    fn status(&self) -> &Arc<MessagingStatus>;

    /// Handles a request travelling down the tree.
    fn inbound(&self, envelope: Envelope);

    /// Binds the handler to its container and starts its children.
    ///
    /// # Errors
    ///
    /// Returns an error if any child container fails to start.
    fn start(
        &self,
        container: Weak<MessagingContainer>,
        ctx: &StartContext<'_>,
    ) -> Result<(), StartError>;

    /// Stops the handler and its children.
    fn close(&self);
}

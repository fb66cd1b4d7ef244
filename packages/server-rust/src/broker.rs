//! The broker: root of the routing tree and owner of its connections.

use std::sync::{Arc, Weak};

use switchyard_core::{Envelope, StatusSnapshot, LOCAL_CONNECTION};
use tracing::{info, info_span, warn, Span};

use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionList};
use crate::error::{ConfigError, ConnectionError, StartError};
use crate::messaging::{MessagingCaller, MessagingContainer, MessagingStatus, StartContext};
use crate::processes::ProcessRegistry;
use crate::routing::BrokerHandler;
use crate::timeout::TimeoutScheduler;

/// Receives replies from the root container and hands each one to the
/// connection that submitted the request.
struct Dispatch {
    connections: Arc<ConnectionList>,
    span: Span,
}

impl MessagingCaller for Dispatch {
    fn outbound(&self, envelope: Envelope) {
        match self.connections.get(envelope.connection_id) {
            Some(connection) => connection.reply(envelope),
            None => warn!(
                parent: &self.span,
                connection_id = envelope.connection_id,
                session_id = envelope.source_id,
                "reply for unknown connection, dropping it"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A configured routing tree with its connection table.
///
/// Lifecycle:
/// 1. `new()` validates the configuration and builds every node
/// 2. `start()` binds the tree to its connections and starts the containers
/// 3. `connection()` / `connection_to()` open channels into a broker
/// 4. `close()` force-closes every session and stops the tree
pub struct Broker {
    name: String,
    root: Arc<MessagingContainer>,
    dispatch: Arc<Dispatch>,
    timeouts: Option<TimeoutScheduler>,
}

impl Broker {
    /// Builds the broker described by `config`, resolving process factories
    /// through `registry`. Timeouts are armed only when this is called inside
    /// a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a process cannot
    /// build its first worker.
    pub fn new(config: &BrokerConfig, registry: &ProcessRegistry) -> Result<Self, ConfigError> {
        config.validate(registry)?;

        let span = info_span!("broker", name = %config.name);
        let handler = BrokerHandler::new(config, registry, span.clone())?;
        let root = MessagingContainer::new(config.mode, handler);

        let timeouts = TimeoutScheduler::current();
        let connections = Arc::new(ConnectionList::new(
            &config.remote_hosts,
            timeouts.clone(),
            config.timeout_ms,
        ));
        info!(
            parent: &span,
            services = config.services.len(),
            remote_hosts = config.remote_hosts.len(),
            timeouts = timeouts.is_some(),
            "broker built"
        );

        Ok(Self {
            name: config.name.clone(),
            root,
            dispatch: Arc::new(Dispatch { connections, span }),
            timeouts,
        })
    }

    /// Starts every container in the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker was already started or an async
    /// container is started outside a tokio runtime.
    pub fn start(&self) -> Result<(), StartError> {
        let connections = &self.dispatch.connections;
        connections.bind_broker(Arc::downgrade(&self.root));
        let caller: Weak<dyn MessagingCaller> =
            Arc::downgrade(&self.dispatch) as Weak<dyn MessagingCaller>;
        self.root.start(caller, &StartContext { connections })?;
        info!(parent: &self.dispatch.span, "broker started");
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a loopback connection into this broker.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotStarted`] before [`Broker::start`].
    pub fn connection(&self) -> Result<Arc<Connection>, ConnectionError> {
        self.connection_to(LOCAL_CONNECTION)
    }

    /// Opens a connection by name: `local` or a configured remote host.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unknown or the host is unreachable.
    pub fn connection_to(&self, name: &str) -> Result<Arc<Connection>, ConnectionError> {
        self.dispatch.connections.new_connection(name)
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionList> {
        &self.dispatch.connections
    }

    #[must_use]
    pub fn status(&self) -> &Arc<MessagingStatus> {
        self.root.status()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.root.status().snapshot()
    }

    /// True once started and until closed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.root.status().is_active()
    }

    /// Closes every connection, stops the tree and cancels pending timers.
    pub fn close(&self) {
        self.dispatch.connections.close_all();
        self.root.close();
        if let Some(timeouts) = &self.timeouts {
            timeouts.shutdown();
        }
        info!(parent: &self.dispatch.span, "broker closed");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.name)
            .field("connections", &self.dispatch.connections.len())
            .finish_non_exhaustive()
    }
}

//! Connection table shared by a broker and the listener that serves its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use switchyard_core::LOCAL_CONNECTION;
use tracing::info;

use super::channel::{Connection, Link};
use super::transport::{TcpTransport, Transport};
use crate::config::RemoteHostConfig;
use crate::error::ConnectionError;
use crate::messaging::MessagingContainer;
use crate::timeout::TimeoutScheduler;

/// Table of every open connection on a broker, plus the static list of
/// remote brokers it may connect to.
///
/// Connection ids start at 1 and are never reused while the broker runs.
pub struct ConnectionList {
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    remote_hosts: HashMap<String, RemoteHostConfig>,
    broker: OnceLock<Weak<MessagingContainer>>,
    timeouts: Option<TimeoutScheduler>,
    default_timeout: Duration,
}

impl ConnectionList {
    #[must_use]
    pub fn new(
        remote_hosts: &[RemoteHostConfig],
        timeouts: Option<TimeoutScheduler>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            remote_hosts: remote_hosts
                .iter()
                .map(|host| (host.name.clone(), host.clone()))
                .collect(),
            broker: OnceLock::new(),
            timeouts,
            default_timeout: Duration::from_millis(default_timeout_ms),
        }
    }

    /// Points local connections at the broker's root container. Only the
    /// first call has any effect.
    pub fn bind_broker(&self, root: Weak<MessagingContainer>) {
        let _ = self.broker.set(root);
    }

    /// Opens a connection by name: `local` loops back into this broker, any
    /// other name must be a configured remote host.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is not started, the name is unknown or
    /// the remote host cannot be reached.
    pub fn new_connection(&self, name: &str) -> Result<Arc<Connection>, ConnectionError> {
        let link = if name == LOCAL_CONNECTION {
            let broker = self.broker.get().ok_or(ConnectionError::NotStarted)?;
            Link::Local(broker.clone())
        } else {
            let host = self
                .remote_hosts
                .get(name)
                .ok_or_else(|| ConnectionError::UnknownHost {
                    name: name.to_string(),
                })?;
            let transport = TcpTransport::connect(&host.name, &host.host, host.port)?;
            Link::Remote(transport as Arc<dyn Transport>)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, name, link, self.timeouts.clone(), self.default_timeout);
        self.connections.insert(id, Arc::clone(&connection));
        info!(connection_id = id, name, "connection opened");
        Ok(connection)
    }

    /// Looks up a connection by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a connection from the table without closing it.
    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Removes and closes every connection.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(connection) = self.remove(id) {
                connection.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_connection_needs_a_started_broker() {
        let list = ConnectionList::new(&[], None, 0);
        assert!(matches!(
            list.new_connection(LOCAL_CONNECTION),
            Err(ConnectionError::NotStarted)
        ));
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let list = ConnectionList::new(&[], None, 0);
        list.bind_broker(Weak::new());

        let first = list.new_connection(LOCAL_CONNECTION).unwrap();
        let second = list.new_connection(LOCAL_CONNECTION).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert!(first.is_local());
        assert_eq!(list.len(), 2);
        assert!(Arc::ptr_eq(&list.get(2).unwrap(), &second));

        list.close_all();
        assert!(list.is_empty());
    }

    #[test]
    fn unknown_name_is_an_error() {
        let list = ConnectionList::new(&[], None, 0);
        list.bind_broker(Weak::new());
        assert!(matches!(
            list.new_connection("elsewhere"),
            Err(ConnectionError::UnknownHost { .. })
        ));
    }

    #[test]
    fn remote_host_needs_a_runtime() {
        let host = RemoteHostConfig {
            name: "core".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9,
        };
        let list = ConnectionList::new(&[host], None, 0);
        assert!(matches!(
            list.new_connection("core"),
            Err(ConnectionError::NoRuntime { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_remote_host_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let host = RemoteHostConfig {
            name: "core".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        };
        let list = ConnectionList::new(&[host], None, 0);
        assert!(matches!(
            list.new_connection("core"),
            Err(ConnectionError::Connect { .. })
        ));
    }
}

//! Connections into brokers, the per-broker connection table and the
//! session transport used to reach remote brokers.

pub mod channel;
pub mod list;
pub mod transport;

pub use channel::{Connection, Link};
pub use list::ConnectionList;
pub use transport::{TcpTransport, Transport, TransportListener};

//! Switchyard server: a message broker that routes requests through a tree of
//! services to pools of worker processes, over local or remote connections.

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod network;
pub mod processes;
pub mod routing;
pub mod shutdown;
pub mod timeout;

pub use broker::Broker;
pub use config::{BrokerConfig, ContainerMode, ProcessConfig, RemoteHostConfig, ServiceConfig};
pub use connection::{Connection, ConnectionList};
pub use error::{ConfigError, ConnectionError, ForwardError, StartError, TransportError};
pub use messaging::{Message, MessageSource, MessagingContainer, MessagingStatus, SessionKey};
pub use processes::ProcessRegistry;
pub use routing::RouteOutcome;

//! Error types for broker construction, startup, connections and forwarding.

use std::path::PathBuf;

use switchyard_core::ProcessError;

/// Fatal configuration problems. A broker that fails validation never starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },
    #[error("duplicate {kind} name '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("{kind} wildcard '{name}' does not name a configured {kind}")]
    UnresolvedWildcard { kind: &'static str, name: String },
    #[error("'{name}' is a reserved {kind} name")]
    Reserved { kind: &'static str, name: String },
    #[error("process '{process}' must allow at least one worker")]
    NoWorkers { process: String },
    #[error("process '{process}' forwards to unknown connection '{connection}'")]
    UnknownConnection { process: String, connection: String },
    #[error("process '{process}' uses unknown factory '{factory}'")]
    UnknownFactory { process: String, factory: String },
    #[error("process '{process}' could not be configured: {source}")]
    Process {
        process: String,
        #[source]
        source: ProcessError,
    },
}

/// Errors raised while starting a container tree.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("'{name}' has already been started")]
    AlreadyStarted { name: String },
    #[error("'{name}' needs a tokio runtime to run its message loop")]
    NoRuntime { name: String },
}

/// Errors raised while opening a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no remote host named '{name}'")]
    UnknownHost { name: String },
    #[error("the broker has not been started")]
    NotStarted,
    #[error("remote host '{name}' needs a tokio runtime")]
    NoRuntime { name: String },
    #[error("could not reach remote host '{name}' at {address}: {source}")]
    Connect {
        name: String,
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a session transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("transport is closed")]
    Closed,
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while forwarding a worker's sub-request.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("process '{process}' has no forward connection configured")]
    NoConnection { process: String },
    #[error("process '{process}' is not started")]
    NotStarted { process: String },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

//! Broker configuration: the shape of the routing tree and its remote peers.
//!
//! Configuration is loaded from JSON and validated as a whole before any part
//! of the tree is built, so a broker either starts with a consistent tree or
//! not at all.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use switchyard_core::{Payload, DEFAULT_TIMEOUT_MS, HOST_SERVICE, LOCAL_CONNECTION};

use crate::error::ConfigError;
use crate::processes::ProcessRegistry;

/// Concurrency model of a routing node's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerMode {
    /// Dedicated message loop with unbounded inbound/outbound queues.
    #[default]
    Async,
    /// Direct call on the caller's stack, with outbound traffic deferred
    /// until the current inbound call returns.
    Inline,
}

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    pub name: String,
    /// Container mode for the whole tree unless a service or process overrides it.
    #[serde(rename = "type", default)]
    pub mode: ContainerMode,
    /// Service that receives messages addressed to an unknown service.
    #[serde(default)]
    pub wildcard: Option<String>,
    /// Default message timeout in milliseconds. Zero disables timeouts.
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(rename = "brokerList", default)]
    pub remote_hosts: Vec<RemoteHostConfig>,
    #[serde(rename = "serviceList", default)]
    pub services: Vec<ServiceConfig>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "broker".to_string(),
            mode: ContainerMode::default(),
            wildcard: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            remote_hosts: Vec::new(),
            services: Vec::new(),
        }
    }
}

/// A named remote broker reachable over a session transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHostConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub mode: Option<ContainerMode>,
    /// Process that receives messages addressed to an unknown message name.
    #[serde(default)]
    pub wildcard: Option<String>,
    #[serde(rename = "processList", default)]
    pub processes: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub name: String,
    /// Registered factory that builds this process's workers.
    #[serde(rename = "class")]
    pub factory: String,
    #[serde(rename = "type", default)]
    pub mode: Option<ContainerMode>,
    /// Connection used to forward sub-requests: `local` or a remote host name.
    #[serde(rename = "connectionName", default)]
    pub connection: Option<String>,
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    /// Factory-specific settings.
    #[serde(default)]
    pub config: Payload,
}

fn default_max_processes() -> usize {
    1
}

impl ProcessConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: factory.into(),
            mode: None,
            connection: None,
            max_processes: 1,
            config: Payload::new(),
        }
    }
}

impl BrokerConfig {
    /// Parses a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not a valid configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Checks the whole tree before anything is built.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: an empty or duplicate name, an
    /// unresolved wildcard, a reserved name, a process without workers, a
    /// forward connection that names no known host, or an unknown factory.
    pub fn validate(&self, registry: &ProcessRegistry) -> Result<(), ConfigError> {
        non_empty("broker", &self.name)?;

        let mut hosts = HashSet::new();
        for host in &self.remote_hosts {
            non_empty("remote host", &host.name)?;
            if host.name == LOCAL_CONNECTION {
                return Err(ConfigError::Reserved {
                    kind: "remote host",
                    name: host.name.clone(),
                });
            }
            unique("remote host", &mut hosts, &host.name)?;
        }

        let mut services = HashSet::new();
        for service in &self.services {
            non_empty("service", &service.name)?;
            if service.name == HOST_SERVICE {
                return Err(ConfigError::Reserved {
                    kind: "service",
                    name: service.name.clone(),
                });
            }
            unique("service", &mut services, &service.name)?;
            service.validate(&hosts, registry)?;
        }
        resolvable("service", self.wildcard.as_deref(), &services)
    }
}

impl ServiceConfig {
    fn validate(&self, hosts: &HashSet<&str>, registry: &ProcessRegistry) -> Result<(), ConfigError> {
        let mut processes = HashSet::new();
        for process in &self.processes {
            non_empty("process", &process.name)?;
            unique("process", &mut processes, &process.name)?;
            if process.max_processes == 0 {
                return Err(ConfigError::NoWorkers {
                    process: process.name.clone(),
                });
            }
            if let Some(connection) = &process.connection {
                if connection != LOCAL_CONNECTION && !hosts.contains(connection.as_str()) {
                    return Err(ConfigError::UnknownConnection {
                        process: process.name.clone(),
                        connection: connection.clone(),
                    });
                }
            }
            if !registry.contains(&process.factory) {
                return Err(ConfigError::UnknownFactory {
                    process: process.name.clone(),
                    factory: process.factory.clone(),
                });
            }
        }
        resolvable("process", self.wildcard.as_deref(), &processes)
    }
}

fn non_empty(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyName { kind });
    }
    Ok(())
}

fn unique<'a>(
    kind: &'static str,
    seen: &mut HashSet<&'a str>,
    name: &'a str,
) -> Result<(), ConfigError> {
    if !seen.insert(name) {
        return Err(ConfigError::Duplicate {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn resolvable(
    kind: &'static str,
    wildcard: Option<&str>,
    names: &HashSet<&str>,
) -> Result<(), ConfigError> {
    match wildcard {
        Some(name) if !names.contains(name) => Err(ConfigError::UnresolvedWildcard {
            kind,
            name: name.to_string(),
        }),
        _ => Ok(()),
    }
}

//! The broker's root routing node.

use std::sync::{Arc, Weak};

use switchyard_core::Envelope;
use tracing::Span;

use super::{RouteLevel, Router, Service};
use crate::config::BrokerConfig;
use crate::error::{ConfigError, StartError};
use crate::messaging::{
    MessagingCaller, MessagingContainer, MessagingHandler, MessagingStatus, StartContext,
};
use crate::processes::ProcessRegistry;

/// Root routing node: picks a service by name, falling back to the broker's
/// wildcard service.
pub struct BrokerHandler {
    router: Arc<Router>,
}

impl BrokerHandler {
    /// Builds the whole service tree described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if any service or process is misconfigured.
    pub fn new(
        config: &BrokerConfig,
        registry: &ProcessRegistry,
        span: Span,
    ) -> Result<Arc<Self>, ConfigError> {
        let services = config
            .services
            .iter()
            .map(|service| Service::container(service, config.mode, registry, &span))
            .collect::<Result<Vec<_>, _>>()?;
        let router = Router::new(
            &config.name,
            RouteLevel::Service,
            services,
            config.wildcard.clone(),
            span,
        )?;
        Ok(Arc::new(Self {
            router: Arc::new(router),
        }))
    }
}

impl MessagingCaller for BrokerHandler {
    fn outbound(&self, envelope: Envelope) {
        self.router.outbound(envelope);
    }
}

impl MessagingHandler for BrokerHandler {
    fn name(&self) -> &str {
        self.router.name()
    }

    fn status(&self) -> &Arc<MessagingStatus> {
        self.router.status()
    }

    fn inbound(&self, envelope: Envelope) {
        self.router.inbound(envelope);
    }

    fn start(
        &self,
        container: Weak<MessagingContainer>,
        ctx: &StartContext<'_>,
    ) -> Result<(), StartError> {
        self.router.start(container, ctx)
    }

    fn close(&self) {
        self.router.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, ServiceConfig};

    fn config() -> BrokerConfig {
        BrokerConfig {
            name: "hub".to_string(),
            services: vec![
                ServiceConfig {
                    name: "math".to_string(),
                    mode: None,
                    wildcard: None,
                    processes: vec![ProcessConfig::new("add", "Echo")],
                },
                ServiceConfig {
                    name: "text".to_string(),
                    mode: None,
                    wildcard: None,
                    processes: vec![ProcessConfig::new("upper", "Echo")],
                },
            ],
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn status_tree_mirrors_configuration() {
        let handler =
            BrokerHandler::new(&config(), &ProcessRegistry::with_builtins(), Span::none()).unwrap();
        let snapshot = handler.status().snapshot();

        assert_eq!(snapshot.name, "hub");
        let mut services: Vec<&str> = snapshot
            .children
            .as_ref()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        services.sort_unstable();
        assert_eq!(services, vec!["math", "text"]);
        assert!(snapshot.find("upper").is_some());
    }

    #[test]
    fn unresolved_service_wildcard_is_fatal() {
        let mut config = config();
        config.wildcard = Some("misc".to_string());
        assert!(matches!(
            BrokerHandler::new(&config, &ProcessRegistry::with_builtins(), Span::none()),
            Err(ConfigError::UnresolvedWildcard { kind: "service", .. })
        ));
    }
}

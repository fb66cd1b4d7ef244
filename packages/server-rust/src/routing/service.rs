//! Service-level routing from message names to process agents.

use std::sync::{Arc, Weak};

use switchyard_core::Envelope;
use tracing::{info_span, Span};

use super::{ProcessAgent, RouteLevel, Router};
use crate::config::{ContainerMode, ServiceConfig};
use crate::error::{ConfigError, StartError};
use crate::messaging::{
    MessagingCaller, MessagingContainer, MessagingHandler, MessagingStatus, StartContext,
};
use crate::processes::ProcessRegistry;

/// Routes requests to a process by message name, falling back to the
/// service's wildcard process.
pub struct Service {
    router: Arc<Router>,
}

impl Service {
    /// Builds a service from already-built process containers.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate process names or an unresolved wildcard.
    pub fn new(
        name: impl Into<String>,
        processes: Vec<Arc<MessagingContainer>>,
        wildcard: Option<String>,
        span: Span,
    ) -> Result<Arc<Self>, ConfigError> {
        let router = Router::new(name, RouteLevel::Message, processes, wildcard, span)?;
        Ok(Arc::new(Self {
            router: Arc::new(router),
        }))
    }

    /// Builds a service and its processes from configuration and wraps it in
    /// a container. The service inherits `mode` unless it sets its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the service or any of its processes is misconfigured.
    pub fn container(
        config: &ServiceConfig,
        mode: ContainerMode,
        registry: &ProcessRegistry,
        parent: &Span,
    ) -> Result<Arc<MessagingContainer>, ConfigError> {
        let mode = config.mode.unwrap_or(mode);
        let span = info_span!(parent: parent, "service", name = %config.name);
        let processes = config
            .processes
            .iter()
            .map(|process| ProcessAgent::container(process, mode, registry, &span))
            .collect::<Result<Vec<_>, _>>()?;
        let service = Self::new(&config.name, processes, config.wildcard.clone(), span)?;
        Ok(MessagingContainer::new(mode, service))
    }
}

impl MessagingCaller for Service {
    fn outbound(&self, envelope: Envelope) {
        self.router.outbound(envelope);
    }
}

impl MessagingHandler for Service {
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

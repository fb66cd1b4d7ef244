//! Routing nodes: the broker handler, services and process agents.
//!
//! Broker handlers and services share [`Router`], a fixed name-to-child map
//! with an optional wildcard. Process agents are the leaves that own workers.

pub mod broker_handler;
pub mod process_agent;
pub mod service;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use switchyard_core::Envelope;
use tracing::{debug, warn, Span};

use crate::error::{ConfigError, StartError};
use crate::messaging::{
    MessagingCaller, MessagingContainer, MessagingStatus, SessionKey, StartContext,
};

pub use broker_handler::BrokerHandler;
pub use process_agent::ProcessAgent;
pub use service::Service;

/// Result of routing one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Handed to a child container.
    Delivered,
    /// No child matched; carries the closing reply to send back.
    Bounced(Envelope),
}

/// Which envelope field selects the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteLevel {
    /// Route on `service`, at the broker.
    Service,
    /// Route on `message`, at a service.
    Message,
}

impl RouteLevel {
    fn key(self, envelope: &Envelope) -> &str {
        match self {
            Self::Service => &envelope.service,
            Self::Message => &envelope.message,
        }
    }

    fn unknown(self) -> &'static str {
        match self {
            Self::Service => "unknown service",
            Self::Message => "unknown message",
        }
    }

    fn child_kind(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Message => "process",
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Name-to-child routing shared by broker handlers and services.
///
/// The map is fixed at construction. Every request increments `received`;
/// a request with no matching child and no wildcard is bounced with a closing
/// reply and counted as an error. A close notice settles its request if it is
/// still open here, then is passed on to the matching child.
pub struct Router {
    name: String,
    level: RouteLevel,
    children: HashMap<String, Arc<MessagingContainer>>,
    wildcard: Option<String>,
    status: Arc<MessagingStatus>,
    span: Span,
    container: OnceLock<Weak<MessagingContainer>>,
}

impl Router {
    /// Builds the routing map.
    ///
    /// # Errors
    ///
    /// Returns an error if two children share a name or the wildcard does not
    /// name a child.
    pub fn new(
        name: impl Into<String>,
        level: RouteLevel,
        children: Vec<Arc<MessagingContainer>>,
        wildcard: Option<String>,
        span: Span,
    ) -> Result<Self, ConfigError> {
        let kind = level.child_kind();
        let mut map = HashMap::with_capacity(children.len());
        let mut statuses = Vec::with_capacity(children.len());
        for child in children {
            let child_name = child.name().to_string();
            statuses.push(Arc::clone(child.status()));
            if map.insert(child_name.clone(), child).is_some() {
                return Err(ConfigError::Duplicate {
                    kind,
                    name: child_name,
                });
            }
        }
        if let Some(wildcard) = &wildcard {
            if !map.contains_key(wildcard) {
                return Err(ConfigError::UnresolvedWildcard {
                    kind,
                    name: wildcard.clone(),
                });
            }
        }

        let name = name.into();
        Ok(Self {
            status: Arc::new(MessagingStatus::new(name.clone(), statuses)),
            name,
            level,
            children: map,
            wildcard,
            span,
            container: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn status(&self) -> &Arc<MessagingStatus> {
        &self.status
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Exact match first, then the wildcard.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Arc<MessagingContainer>> {
        self.children.get(key).or_else(|| {
            self.wildcard
                .as_ref()
                .and_then(|wildcard| self.children.get(wildcard))
        })
    }

    /// Hands the request to its child or builds the bounce-back.
    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        match self.lookup(self.level.key(&envelope)) {
            Some(child) => {
                child.inbound(envelope);
                RouteOutcome::Delivered
            }
            None => RouteOutcome::Bounced(envelope.into_bounce(self.level.unknown())),
        }
    }

    pub fn inbound(&self, envelope: Envelope) {
        if envelope.is_close_request() {
            self.status.add_abandoned(SessionKey::from(&envelope));
            if let Some(child) = self.lookup(self.level.key(&envelope)) {
                child.inbound(envelope);
            }
            return;
        }

        self.status.add_received(SessionKey::from(&envelope));
        if let RouteOutcome::Bounced(bounce) = self.route(envelope) {
            debug!(
                parent: &self.span,
                service = %bounce.service,
                message = %bounce.message,
                reason = bounce.return_message.as_deref().unwrap_or_default(),
                "bouncing request"
            );
            self.status.add_error();
            self.outbound(bounce);
        }
    }

    /// Binds the router to its container and starts every child with the
    /// router as their caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the router was already started or a child fails.
    pub fn start(
        self: &Arc<Self>,
        container: Weak<MessagingContainer>,
        ctx: &StartContext<'_>,
    ) -> Result<(), StartError> {
        if self.container.set(container).is_err() {
            return Err(StartError::AlreadyStarted {
                name: self.name.clone(),
            });
        }
        let caller: Weak<dyn MessagingCaller> = Arc::downgrade(self) as Weak<dyn MessagingCaller>;
        for child in self.children.values() {
            child.start(caller.clone(), ctx)?;
        }
        self.status.set_active(true);
        debug!(parent: &self.span, children = self.children.len(), "started");
        Ok(())
    }

    pub fn close(&self) {
        for child in self.children.values() {
            child.close();
        }
        self.status.set_active(false);
    }
}

impl MessagingCaller for Router {
    /// Counts closing replies and passes every reply to this node's container.
    fn outbound(&self, envelope: Envelope) {
        if envelope.close {
            self.status.add_replied(SessionKey::from(&envelope));
        }
        match self.container.get().and_then(Weak::upgrade) {
            Some(container) => container.outbound(envelope),
            None => warn!(parent: &self.span, "router has no container, dropping reply"),
        }
    }
}

//! Relay worker that forwards each request to another service and returns its reply.

use std::sync::Arc;

use switchyard_core::{
    Envelope, ForwardRequest, MessageReply, Payload, ProcessError, ProcessFactory,
    ProcessInstance, ProcessStatus,
};

use crate::config::ProcessConfig;

pub const NAME: &str = "PassThrough";

#[derive(Debug)]
enum Stage {
    Idle,
    /// Holding the sub-request until the agent takes it.
    Forwarding(ForwardRequest),
    Waiting,
    /// Reply arrived and is waiting for the agent to resume processing.
    Received(MessageReply),
    Ready(Envelope),
}

/// Forwards each request to another service and answers with whatever that
/// service replied.
///
/// Settings: `service` (required) names the target service and `message`
/// overrides the message name, which defaults to the incoming one.
#[derive(Debug)]
pub struct PassThrough {
    id: u64,
    service: String,
    message: Option<String>,
    origin: Option<Envelope>,
    stage: Stage,
}

impl PassThrough {
    #[must_use]
    pub fn new(id: u64, service: impl Into<String>, message: Option<String>) -> Self {
        Self {
            id,
            service: service.into(),
            message,
            origin: None,
            stage: Stage::Idle,
        }
    }

    /// Factory builder registered under [`NAME`].
    ///
    /// # Errors
    ///
    /// Returns an error if `service` is missing or a setting is not a string.
    pub fn factory(config: &ProcessConfig) -> Result<Arc<dyn ProcessFactory>, ProcessError> {
        let service = setting(&config.config, "service")?
            .ok_or_else(|| ProcessError::Config("`service` is required".to_string()))?;
        let message = setting(&config.config, "message")?;
        let factory = move |id: u64| -> Result<Box<dyn ProcessInstance>, ProcessError> {
            Ok(Box::new(Self::new(id, service.clone(), message.clone())))
        };
        Ok(Arc::new(factory))
    }
}

fn setting(config: &Payload, key: &str) -> Result<Option<String>, ProcessError> {
    match config.get(key) {
        None => Ok(None),
        Some(serde_json::Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(ProcessError::Config(format!("`{key}` must be a string"))),
    }
}

impl ProcessInstance for PassThrough {
    fn id(&self) -> u64 {
        self.id
    }

    fn status(&self) -> ProcessStatus {
        ProcessStatus {
            accept_requests: matches!(self.stage, Stage::Idle),
            request_pending: matches!(self.stage, Stage::Forwarding(_)),
            waiting_process: matches!(self.stage, Stage::Received(_)),
            reply_ready: matches!(self.stage, Stage::Ready(_)),
        }
    }

    fn handle_request(&mut self, mut request: Envelope) -> Result<(), ProcessError> {
        if !matches!(self.stage, Stage::Idle) {
            return Err(ProcessError::Busy { id: self.id });
        }
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| request.message.clone());
        let body = request.request.take().unwrap_or_default();
        self.stage = Stage::Forwarding(ForwardRequest::new(&self.service, message, body));
        self.origin = Some(request);
        Ok(())
    }

    fn process(&mut self) -> Result<(), ProcessError> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Received(reply) => {
                let origin = self.origin.take().ok_or(ProcessError::Failed(
                    "reply without an originating request".to_string(),
                ))?;
                let mut envelope = origin.into_reply(reply.data, true);
                envelope.return_message = reply.return_message;
                self.stage = Stage::Ready(envelope);
                Ok(())
            }
            other => {
                self.stage = other;
                Ok(())
            }
        }
    }

    fn take_reply(&mut self) -> Result<Envelope, ProcessError> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Ready(envelope) => Ok(envelope),
            other => {
                self.stage = other;
                Err(ProcessError::NothingReady {
                    id: self.id,
                    what: "reply",
                })
            }
        }
    }

    fn take_requests(&mut self) -> Result<Vec<ForwardRequest>, ProcessError> {
        match std::mem::replace(&mut self.stage, Stage::Waiting) {
            Stage::Forwarding(request) => Ok(vec![request]),
            other => {
                self.stage = other;
                Err(ProcessError::NothingReady {
                    id: self.id,
                    what: "requests",
                })
            }
        }
    }

    fn handle_reply(&mut self, reply: MessageReply) -> Result<(), ProcessError> {
        if !matches!(self.stage, Stage::Waiting) {
            return Err(ProcessError::UnexpectedReply { id: self.id });
        }
        self.stage = Stage::Received(reply);
        Ok(())
    }
}

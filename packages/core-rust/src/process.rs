//! Capabilities implemented by business-logic workers.
//!
//! A process agent owns a pool of [`ProcessInstance`] values produced by a
//! [`ProcessFactory`] and drives them by polling [`ProcessInstance::status`].
//! Instances never call back into the agent; every interaction is initiated
//! by the agent's scheduling sweep.

use crate::envelope::{Envelope, MessageReply, Payload};

/// Errors raised by a worker or its factory.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process {id} is not accepting requests")]
    Busy { id: u64 },
    #[error("process {id} has no {what} ready")]
    NothingReady { id: u64, what: &'static str },
    #[error("process {id} received a reply it was not waiting for")]
    UnexpectedReply { id: u64 },
    #[error("invalid process configuration: {0}")]
    Config(String),
    #[error("process failed: {0}")]
    Failed(String),
}

/// Externally visible state of a worker, polled by the scheduler.
///
/// More than one flag may be set at once; the scheduler acts on each in turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ProcessStatus {
    /// Idle and able to take a new request.
    pub accept_requests: bool,
    /// Has sub-requests ready to be forwarded.
    pub request_pending: bool,
    /// Ready to resume internal processing.
    pub waiting_process: bool,
    /// Has a reply ready to send back to the caller.
    pub reply_ready: bool,
}

impl ProcessStatus {
    /// An idle worker.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            accept_requests: true,
            ..Self::default()
        }
    }
}

/// A sub-request a worker wants forwarded to another service.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRequest {
    pub service: String,
    pub message: String,
    pub request: Payload,
}

impl ForwardRequest {
    #[must_use]
    pub fn new(service: impl Into<String>, message: impl Into<String>, request: Payload) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            request,
        }
    }
}

/// One stateful worker inside a process agent's pool.
pub trait ProcessInstance: Send {
    /// Stable identity used to correlate forwarded replies back to this worker.
    fn id(&self) -> u64;

    /// Current state of the worker.
    fn status(&self) -> ProcessStatus;

    /// Accepts a new request. The envelope carries the routing header needed
    /// to build the eventual reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot take the request.
    fn handle_request(&mut self, request: Envelope) -> Result<(), ProcessError>;

    /// Resumes internal processing.
    ///
    /// # Errors
    ///
    /// Returns an error if processing fails.
    fn process(&mut self) -> Result<(), ProcessError>;

    /// Takes the ready reply, leaving the worker free for new work.
    ///
    /// # Errors
    ///
    /// Returns an error if no reply is ready.
    fn take_reply(&mut self) -> Result<Envelope, ProcessError>;

    /// Takes the batch of sub-requests waiting to be forwarded.
    ///
    /// # Errors
    ///
    /// Returns an error if no requests are pending.
    fn take_requests(&mut self) -> Result<Vec<ForwardRequest>, ProcessError>;

    /// Delivers the reply to a previously forwarded sub-request.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker was not waiting for a reply.
    fn handle_reply(&mut self, reply: MessageReply) -> Result<(), ProcessError>;
}

/// Produces worker instances for one process agent.
pub trait ProcessFactory: Send + Sync {
    /// Creates a worker with the given identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot be created; the agent logs it and
    /// carries on with the pool it already has.
    fn instance(&self, id: u64) -> Result<Box<dyn ProcessInstance>, ProcessError>;
}

impl<F> ProcessFactory for F
where
    F: Fn(u64) -> Result<Box<dyn ProcessInstance>, ProcessError> + Send + Sync,
{
    fn instance(&self, id: u64) -> Result<Box<dyn ProcessInstance>, ProcessError> {
        self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle(u64);

    impl ProcessInstance for Idle {
        fn id(&self) -> u64 {
            self.0
        }
        fn status(&self) -> ProcessStatus {
            ProcessStatus::idle()
        }
        fn handle_request(&mut self, _request: Envelope) -> Result<(), ProcessError> {
            Ok(())
        }
        fn process(&mut self) -> Result<(), ProcessError> {
            Ok(())
        }
        fn take_reply(&mut self) -> Result<Envelope, ProcessError> {
            Err(ProcessError::NothingReady { id: self.0, what: "reply" })
        }
        fn take_requests(&mut self) -> Result<Vec<ForwardRequest>, ProcessError> {
            Ok(Vec::new())
        }
        fn handle_reply(&mut self, _reply: MessageReply) -> Result<(), ProcessError> {
            Err(ProcessError::UnexpectedReply { id: self.0 })
        }
    }

    #[test]
    fn closures_are_factories() {
        let factory = |id: u64| -> Result<Box<dyn ProcessInstance>, ProcessError> {
            Ok(Box::new(Idle(id)))
        };
        let worker = factory.instance(7).unwrap();
        assert_eq!(worker.id(), 7);
        assert_eq!(worker.status(), ProcessStatus::idle());
    }

    #[test]
    fn error_messages_name_the_worker() {
        let err = ProcessError::NothingReady { id: 3, what: "reply" };
        assert_eq!(err.to_string(), "process 3 has no reply ready");
    }
}

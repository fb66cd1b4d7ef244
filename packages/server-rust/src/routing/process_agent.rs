//! Worker-pool scheduler at the leaves of the routing tree.
//!
//! A process agent queues requests from its service and multiplexes them
//! over a bounded pool of worker instances. Workers that need data from
//! another service emit sub-requests, which the agent forwards on its own
//! connection and correlates back to the worker when the reply arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use switchyard_core::{Envelope, ForwardRequest, ProcessError, ProcessFactory, ProcessInstance};
use tracing::{debug, error, info_span, warn, Span};

use crate::config::{ContainerMode, ProcessConfig};
use crate::connection::{Connection, ConnectionList};
use crate::error::{ConfigError, ForwardError, StartError};
use crate::messaging::{
    Message, MessageSource, MessagingCaller, MessagingContainer, MessagingHandler,
    MessagingStatus, SessionKey, StartContext,
};
use crate::processes::ProcessRegistry;

struct Worker {
    instance: Box<dyn ProcessInstance>,
    /// Header of the request the worker is currently serving.
    origin: Option<Envelope>,
}

#[derive(Default)]
struct Queues {
    inbound: VecDeque<Envelope>,
    forward_replies: VecDeque<Arc<Message>>,
    /// A scheduling pass is running.
    active: bool,
    /// Work arrived since the current pass started.
    dirty: bool,
}

/// Side effects collected during a sweep and run once the pool is unlocked.
enum Effect {
    Reply(Envelope),
    Forward {
        worker: u64,
        origin: Option<Envelope>,
        requests: Vec<ForwardRequest>,
    },
}

// ---------------------------------------------------------------------------
// ProcessAgent
// ---------------------------------------------------------------------------

/// Owns a pool of at most `max_processes` workers for one message type.
///
/// Scheduling is a trampoline: whichever thread finds the agent idle runs
/// passes until no new work arrived during the last one, while callers that
/// find it busy only queue their work and mark it dirty. Two sweeps over the
/// same pool never overlap.
pub struct ProcessAgent {
    name: String,
    connection_name: Option<String>,
    max_processes: usize,
    factory: Arc<dyn ProcessFactory>,
    status: Arc<MessagingStatus>,
    span: Span,
    me: Weak<ProcessAgent>,
    container: OnceLock<Weak<MessagingContainer>>,
    connections: OnceLock<Weak<ConnectionList>>,
    forward: Mutex<Option<Arc<Connection>>>,
    queues: Mutex<Queues>,
    pool: Mutex<Vec<Worker>>,
    outstanding: Mutex<HashMap<u64, Arc<Message>>>,
    next_worker_id: AtomicU64,
}

impl ProcessAgent {
    /// Creates the agent and its first worker, which proves the factory works.
    ///
    /// # Errors
    ///
    /// Returns an error if the first worker cannot be created.
    pub fn new(
        config: &ProcessConfig,
        factory: Arc<dyn ProcessFactory>,
        parent: &Span,
    ) -> Result<Arc<Self>, ConfigError> {
        let first = factory.instance(1).map_err(|source| ConfigError::Process {
            process: config.name.clone(),
            source,
        })?;
        let span = info_span!(parent: parent, "process", name = %config.name);

        Ok(Arc::new_cyclic(|me| Self {
            name: config.name.clone(),
            connection_name: config.connection.clone(),
            max_processes: config.max_processes.max(1),
            factory,
            status: Arc::new(MessagingStatus::leaf(&config.name)),
            span,
            me: me.clone(),
            container: OnceLock::new(),
            connections: OnceLock::new(),
            forward: Mutex::new(None),
            queues: Mutex::new(Queues::default()),
            pool: Mutex::new(vec![Worker {
                instance: first,
                origin: None,
            }]),
            outstanding: Mutex::new(HashMap::new()),
            next_worker_id: AtomicU64::new(2),
        }))
    }

    /// Builds the agent with the factory registered for `config.factory` and
    /// wraps it in a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory is unknown or cannot build a worker.
    pub fn container(
        config: &ProcessConfig,
        mode: ContainerMode,
        registry: &ProcessRegistry,
        parent: &Span,
    ) -> Result<Arc<MessagingContainer>, ConfigError> {
        let factory = registry.build(config)?;
        let agent = Self::new(config, factory, parent)?;
        Ok(MessagingContainer::new(config.mode.unwrap_or(mode), agent))
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Requests waiting for a free worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.lock().inbound.len()
    }

    /// Forwarded sub-requests still awaiting their close.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    // -- scheduling ---------------------------------------------------------

    fn schedule(&self) {
        {
            let mut queues = self.queues.lock();
            queues.dirty = true;
            if queues.active {
                return;
            }
            queues.active = true;
        }

        loop {
            self.queues.lock().dirty = false;
            self.action_phase();
            if self.forward_reply_phase() {
                self.action_phase();
            }

            let mut queues = self.queues.lock();
            if !queues.dirty && queues.forward_replies.is_empty() {
                queues.active = false;
                return;
            }
        }
    }

    /// Sweeps the pool until a full pass makes no progress.
    fn action_phase(&self) {
        loop {
            let mut effects = Vec::new();
            let progressed = {
                let mut pool = self.pool.lock();
                self.sweep(&mut pool, &mut effects)
            };
            for effect in effects {
                self.apply(effect);
            }
            if !progressed {
                return;
            }
        }
    }

    fn sweep(&self, pool: &mut Vec<Worker>, effects: &mut Vec<Effect>) -> bool {
        let mut progressed = false;
        for worker in pool.iter_mut() {
            progressed |= self.step(worker, effects);
        }

        let backlog = !self.queues.lock().inbound.is_empty();
        if backlog && pool.len() < self.max_processes {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            match self.factory.instance(id) {
                Ok(instance) => {
                    debug!(parent: &self.span, worker = id, pool = pool.len() + 1, "worker added");
                    pool.push(Worker {
                        instance,
                        origin: None,
                    });
                    progressed = true;
                }
                Err(e) => {
                    error!(parent: &self.span, worker = id, error = %e, "could not create worker");
                    self.status.add_error();
                }
            }
        }
        progressed
    }

    /// Acts on each status flag of one worker in turn.
    fn step(&self, worker: &mut Worker, effects: &mut Vec<Effect>) -> bool {
        let id = worker.instance.id();
        let mut progressed = false;

        if worker.instance.status().accept_requests {
            let next = self.queues.lock().inbound.pop_front();
            if let Some(request) = next {
                let origin = request.header();
                match worker.instance.handle_request(request) {
                    Ok(()) => worker.origin = Some(origin),
                    Err(e) => {
                        error!(parent: &self.span, worker = id, error = %e, "worker refused request");
                        self.status.add_failure(SessionKey::from(&origin));
                    }
                }
                // The request left the queue either way.
                progressed = true;
            }
        }

        if worker.instance.status().request_pending {
            match worker.instance.take_requests() {
                Ok(requests) => {
                    effects.push(Effect::Forward {
                        worker: id,
                        origin: worker.origin.clone(),
                        requests,
                    });
                    progressed = true;
                }
                Err(e) => self.worker_failed(id, "take_requests", &e),
            }
        }

        if worker.instance.status().waiting_process {
            match worker.instance.process() {
                Ok(()) => progressed = true,
                Err(e) => self.worker_failed(id, "process", &e),
            }
        }

        if worker.instance.status().reply_ready {
            match worker.instance.take_reply() {
                Ok(reply) => {
                    worker.origin = None;
                    effects.push(Effect::Reply(reply));
                    progressed = true;
                }
                Err(e) => self.worker_failed(id, "take_reply", &e),
            }
        }

        progressed
    }

    /// Hands queued forwarded replies to the workers that asked for them.
    fn forward_reply_phase(&self) -> bool {
        let replies: Vec<Arc<Message>> = self.queues.lock().forward_replies.drain(..).collect();
        if replies.is_empty() {
            return false;
        }

        let mut pool = self.pool.lock();
        for message in replies {
            let Some(reply) = message.get_reply() else {
                continue;
            };
            let target = message.source_ref();
            match pool
                .iter_mut()
                .find(|worker| Some(worker.instance.id()) == target)
            {
                Some(worker) => {
                    let id = worker.instance.id();
                    if let Err(e) = worker.instance.handle_reply(reply) {
                        self.worker_failed(id, "handle_reply", &e);
                    }
                }
                None => warn!(
                    parent: &self.span,
                    worker = ?target,
                    "no worker for forwarded reply, dropping it"
                ),
            }
        }
        true
    }

    fn apply(&self, effect: Effect) {
        match effect {
            Effect::Reply(reply) => self.outbound(reply),
            Effect::Forward {
                worker,
                origin,
                requests,
            } => {
                for request in requests {
                    if let Err(e) = self.forward(worker, origin.clone(), request) {
                        error!(parent: &self.span, worker, error = %e, "forward failed");
                        // The worker waits on a reply that cannot come.
                        match &origin {
                            Some(origin) => self.status.add_failure(SessionKey::from(origin)),
                            None => self.status.add_error(),
                        }
                    }
                }
            }
        }
    }

    /// Logs and counts a stage error. The worker stays in the pool and may
    /// still answer its request.
    fn worker_failed(&self, worker: u64, stage: &'static str, e: &ProcessError) {
        error!(parent: &self.span, worker, stage, error = %e, "worker failed");
        self.status.add_error();
    }

    // -- forwarding ---------------------------------------------------------

    fn forward(
        &self,
        worker: u64,
        origin: Option<Envelope>,
        request: ForwardRequest,
    ) -> Result<(), ForwardError> {
        let connection = self.forward_connection()?;
        let owner: Weak<dyn MessageSource> = self.me.clone();
        let message = Arc::new(
            Message::new(request.service, request.message, request.request)
                .with_source(owner)
                .with_origin(origin, Some(worker)),
        );

        let session_id = connection.submit(&message);
        let mut outstanding = self.outstanding.lock();
        // An inline tree may already have answered and closed it.
        if !message.is_closed() {
            outstanding.insert(session_id, message);
        }
        Ok(())
    }

    /// The agent's forward connection, opened on first use.
    fn forward_connection(&self) -> Result<Arc<Connection>, ForwardError> {
        let mut forward = self.forward.lock();
        if let Some(connection) = forward.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let name = self
            .connection_name
            .as_deref()
            .ok_or_else(|| ForwardError::NoConnection {
                process: self.name.clone(),
            })?;
        let connections = self
            .connections
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ForwardError::NotStarted {
                process: self.name.clone(),
            })?;
        let connection = connections.new_connection(name)?;
        *forward = Some(Arc::clone(&connection));
        Ok(connection)
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

impl MessagingCaller for ProcessAgent {
    fn outbound(&self, envelope: Envelope) {
        if envelope.close {
            self.status.add_replied(SessionKey::from(&envelope));
        }
        match self.container.get().and_then(Weak::upgrade) {
            Some(container) => container.outbound(envelope),
            None => warn!(parent: &self.span, "agent has no container, dropping reply"),
        }
    }
}

impl MessagingHandler for ProcessAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> &Arc<MessagingStatus> {
        &self.status
    }

    /// Queues a request and runs the scheduler. A close notice settles the
    /// matching request and removes it if it is still queued.
    fn inbound(&self, envelope: Envelope) {
        if envelope.is_close_request() {
            self.status.add_abandoned(SessionKey::from(&envelope));
            let mut queues = self.queues.lock();
            let before = queues.inbound.len();
            queues.inbound.retain(|queued| {
                queued.connection_id != envelope.connection_id
                    || queued.source_id != envelope.source_id
            });
            if queues.inbound.len() < before {
                debug!(
                    parent: &self.span,
                    connection_id = envelope.connection_id,
                    source_id = envelope.source_id,
                    "dropped queued request for closed session"
                );
            }
            return;
        }

        self.status.add_received(SessionKey::from(&envelope));
        self.queues.lock().inbound.push_back(envelope);
        self.schedule();
    }

    fn start(
        &self,
        container: Weak<MessagingContainer>,
        ctx: &StartContext<'_>,
    ) -> Result<(), StartError> {
        if self.container.set(container).is_err() {
            return Err(StartError::AlreadyStarted {
                name: self.name.clone(),
            });
        }
        let _ = self.connections.set(Arc::downgrade(ctx.connections));
        if self.connection_name.is_some() {
            if let Err(e) = self.forward_connection() {
                warn!(parent: &self.span, error = %e, "forward connection unavailable, will retry on use");
            }
        }
        self.status.set_active(true);
        Ok(())
    }

    fn close(&self) {
        self.status.set_active(false);
    }
}

impl MessageSource for ProcessAgent {
    fn reply_received(&self, message: &Arc<Message>, _fragment: &Envelope) {
        self.queues
            .lock()
            .forward_replies
            .push_back(Arc::clone(message));
        self.schedule();
    }

    fn update_received(&self, message: &Arc<Message>, _fragment: &Envelope) {
        debug!(
            parent: &self.span,
            worker = ?message.source_ref(),
            "ignoring further reply fragment for forwarded request"
        );
    }

    fn message_closed(&self, message: &Arc<Message>) {
        self.outstanding.lock().remove(&message.source_id());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

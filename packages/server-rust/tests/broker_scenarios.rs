//! End-to-end scenarios: requests travel from a connection through the broker,
//! service and process levels and back, locally and between brokers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use switchyard_core::{
    Envelope, ForwardRequest, MessageReply, Payload, ProcessError, ProcessFactory,
    ProcessInstance, ProcessStatus, StatusSnapshot, TIMEOUT_RETURN,
};
use switchyard_server::network::SessionListener;
use switchyard_server::shutdown::ShutdownSignal;
use switchyard_server::{
    Broker, BrokerConfig, ContainerMode, Message, ProcessConfig, ProcessRegistry,
    RemoteHostConfig, ServiceConfig,
};

// ---------------------------------------------------------------------------
// Test processes
// ---------------------------------------------------------------------------

/// Adds `a` and `b`.
struct Adder {
    id: u64,
    reply: Option<Envelope>,
}

impl ProcessInstance for Adder {
    fn id(&self) -> u64 {
        self.id
    }

    fn status(&self) -> ProcessStatus {
        ProcessStatus {
            accept_requests: self.reply.is_none(),
            reply_ready: self.reply.is_some(),
            ..ProcessStatus::default()
        }
    }

    fn handle_request(&mut self, mut request: Envelope) -> Result<(), ProcessError> {
        let body = request.request.take().unwrap_or_default();
        let operand = |key: &str| {
            body.get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| ProcessError::Failed(format!("missing operand {key}")))
        };
        let sum = operand("a")? + operand("b")?;
        self.reply = Some(request.into_reply(payload(json!({"result": sum})), true));
        Ok(())
    }

    fn process(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    fn take_reply(&mut self) -> Result<Envelope, ProcessError> {
        self.reply.take().ok_or(ProcessError::NothingReady {
            id: self.id,
            what: "reply",
        })
    }

    fn take_requests(&mut self) -> Result<Vec<ForwardRequest>, ProcessError> {
        Err(ProcessError::NothingReady {
            id: self.id,
            what: "requests",
        })
    }

    fn handle_reply(&mut self, _reply: MessageReply) -> Result<(), ProcessError> {
        Err(ProcessError::UnexpectedReply { id: self.id })
    }
}

/// Takes one request and never answers it.
struct Sleeper {
    id: u64,
    busy: bool,
}

impl ProcessInstance for Sleeper {
    fn id(&self) -> u64 {
        self.id
    }

    fn status(&self) -> ProcessStatus {
        ProcessStatus {
            accept_requests: !self.busy,
            ..ProcessStatus::default()
        }
    }

    fn handle_request(&mut self, _request: Envelope) -> Result<(), ProcessError> {
        self.busy = true;
        Ok(())
    }

    fn process(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    fn take_reply(&mut self) -> Result<Envelope, ProcessError> {
        Err(ProcessError::NothingReady { id: self.id, what: "reply" })
    }

    fn take_requests(&mut self) -> Result<Vec<ForwardRequest>, ProcessError> {
        Err(ProcessError::NothingReady { id: self.id, what: "requests" })
    }

    fn handle_reply(&mut self, _reply: MessageReply) -> Result<(), ProcessError> {
        Err(ProcessError::UnexpectedReply { id: self.id })
    }
}

fn registry() -> ProcessRegistry {
    let mut registry = ProcessRegistry::with_builtins();
    registry.register("Adder", |_config: &ProcessConfig| {
        let factory = |id: u64| -> Result<Box<dyn ProcessInstance>, ProcessError> {
            Ok(Box::new(Adder { id, reply: None }))
        };
        Ok(Arc::new(factory) as Arc<dyn ProcessFactory>)
    });
    registry.register("Sleeper", |_config: &ProcessConfig| {
        let factory = |id: u64| -> Result<Box<dyn ProcessInstance>, ProcessError> {
            Ok(Box::new(Sleeper { id, busy: false }))
        };
        Ok(Arc::new(factory) as Arc<dyn ProcessFactory>)
    });
    registry
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn service(name: &str, processes: Vec<ProcessConfig>) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        mode: None,
        wildcard: None,
        processes,
    }
}

fn relay(target: &str, connection: &str) -> ProcessConfig {
    let mut relay = ProcessConfig::new("add", "PassThrough");
    relay.connection = Some(connection.to_string());
    relay.config.insert("service".to_string(), json!(target));
    relay
}

fn math_broker(name: &str, mode: ContainerMode) -> BrokerConfig {
    let mut add = ProcessConfig::new("add", "Adder");
    add.max_processes = 4;
    BrokerConfig {
        name: name.to_string(),
        mode,
        services: vec![service("math", vec![add])],
        ..BrokerConfig::default()
    }
}

fn add(a: i64, b: i64) -> Arc<Message> {
    Arc::new(Message::new("math", "add", payload(json!({"a": a, "b": b}))))
}

/// Every node along every path has settled all of its requests.
fn assert_settled(snapshot: &StatusSnapshot) {
    snapshot.walk(&mut |node| {
        assert_eq!(node.pending, 0, "{} still has open requests", node.name);
    });
}

async fn closed(message: &Message) -> MessageReply {
    tokio::time::timeout(Duration::from_secs(5), message.wait_for_close())
        .await
        .expect("message did not close in time")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn inline_add_completes_before_submit_returns() {
    let broker = Broker::new(&math_broker("hub", ContainerMode::Inline), &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let message = add(2, 3);
    let session_id = connection.submit(&message);

    assert_eq!(session_id, 1);
    assert!(message.is_closed());
    assert_eq!(message.get_reply().unwrap().get("result"), Some(&json!(5)));
    assert!(!connection.is_live(session_id));

    let snapshot = broker.snapshot();
    for name in ["hub", "math", "add"] {
        let node = snapshot.find(name).unwrap();
        assert_eq!(
            (node.received, node.replied, node.error, node.pending),
            (1, 1, 0, 0),
            "counters at {name}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_tree_answers_concurrent_requests() {
    let broker = Broker::new(&math_broker("hub", ContainerMode::Async), &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let messages: Vec<_> = (0..50).map(|i| add(i, i)).collect();
    for message in &messages {
        connection.submit(message);
    }
    for (i, message) in (0_i64..).zip(&messages) {
        let reply = closed(message).await;
        assert_eq!(reply.get("result"), Some(&json!(i * 2)));
    }

    assert_eq!(connection.live_sessions(), 0);
    let snapshot = broker.snapshot();
    assert_eq!(snapshot.received, 50);
    assert_eq!(snapshot.pending, 0);
    broker.close();
}

#[test]
fn unknown_service_and_message_bounce() {
    let broker = Broker::new(&math_broker("hub", ContainerMode::Inline), &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let nowhere = Arc::new(Message::new("text", "upper", Payload::new()));
    connection.submit(&nowhere);
    let subtract = Arc::new(Message::new("math", "subtract", Payload::new()));
    connection.submit(&subtract);

    assert!(nowhere.is_closed());
    assert_eq!(
        nowhere.get_reply().unwrap().return_message.as_deref(),
        Some("unknown service")
    );
    assert_eq!(
        subtract.get_reply().unwrap().return_message.as_deref(),
        Some("unknown message")
    );

    let snapshot = broker.snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.error, 1);
    assert_eq!(snapshot.find("math").unwrap().error, 1);
    assert_eq!(snapshot.pending, 0);
}

#[test]
fn broker_wildcard_catches_unknown_services() {
    let mut config = math_broker("hub", ContainerMode::Inline);
    config.services.push(ServiceConfig {
        wildcard: Some("echo".to_string()),
        ..service("misc", vec![ProcessConfig::new("echo", "Echo")])
    });
    config.wildcard = Some("misc".to_string());
    let broker = Broker::new(&config, &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let message = Arc::new(Message::new("text", "upper", payload(json!({"s": "abc"}))));
    connection.submit(&message);

    let reply = message.get_reply().unwrap();
    assert!(reply.return_message.is_none());
    assert_eq!(reply.get("s"), Some(&json!("abc")));
    assert_eq!(broker.snapshot().find("echo").unwrap().received, 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_messages_time_out() {
    let config = BrokerConfig {
        name: "hub".to_string(),
        mode: ContainerMode::Inline,
        timeout_ms: 1_000,
        services: vec![service("slow", vec![ProcessConfig::new("wait", "Sleeper")])],
        ..BrokerConfig::default()
    };
    let broker = Broker::new(&config, &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let held = Arc::new(Message::new("slow", "wait", Payload::new()));
    let queued = Arc::new(Message::new("slow", "wait", Payload::new()));
    let patient = Arc::new(
        Message::new("slow", "wait", Payload::new()).with_timeout(Duration::from_secs(60)),
    );
    connection.submit(&held);
    connection.submit(&queued);
    connection.submit(&patient);

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    for message in [&held, &queued] {
        assert!(message.is_closed());
        let reply = message.get_reply().unwrap();
        assert_eq!(reply.return_message.as_deref(), Some(TIMEOUT_RETURN));
        assert!(reply.data.is_empty());
    }
    assert!(!patient.is_closed());
    assert_eq!(connection.live_sessions(), 1);

    let snapshot = broker.snapshot();
    for name in ["hub", "slow", "wait"] {
        let node = snapshot.find(name).unwrap();
        assert_eq!((node.received, node.pending), (3, 1), "counters at {name}");
    }

    broker.close();
    assert!(patient.is_closed());
    assert!(!patient.has_reply());
    assert_settled(&broker.snapshot());
}

#[test]
fn late_reply_after_timeout_is_dropped() {
    let config = BrokerConfig {
        name: "hub".to_string(),
        mode: ContainerMode::Inline,
        services: vec![service("slow", vec![ProcessConfig::new("wait", "Sleeper")])],
        ..BrokerConfig::default()
    };
    let broker = Broker::new(&config, &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let message = Arc::new(Message::new("slow", "wait", Payload::new()));
    let session_id = connection.submit(&message);
    connection.timeout(session_id);

    assert!(message.is_closed());
    assert!(!connection.is_live(session_id));
    let before = broker.snapshot();
    assert_settled(&before);
    assert_eq!(before.find("wait").unwrap().error, 0);

    let late = message
        .header()
        .into_reply(payload(json!({"result": 1})), true);
    assert_eq!(late.source_id, session_id);
    broker
        .connections()
        .get(late.connection_id)
        .unwrap()
        .reply(late);

    let reply = message.get_reply().unwrap();
    assert_eq!(reply.fragments, 1);
    assert_eq!(reply.get("result"), None);
    assert_eq!(reply.return_message.as_deref(), Some(TIMEOUT_RETURN));
    assert_eq!(broker.snapshot(), before);
}

#[test]
fn pass_through_forwards_over_local_connection() {
    let mut config = math_broker("hub", ContainerMode::Inline);
    config.services.push(service("front", vec![relay("math", "local")]));
    let broker = Broker::new(&config, &registry()).unwrap();
    broker.start().unwrap();
    let connection = broker.connection().unwrap();

    let message = Arc::new(Message::new("front", "add", payload(json!({"a": 4, "b": 5}))));
    connection.submit(&message);

    assert!(message.is_closed());
    assert_eq!(message.get_reply().unwrap().get("result"), Some(&json!(9)));

    let snapshot = broker.snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.find("front").unwrap().replied, 1);
    assert_eq!(snapshot.find("math").unwrap().replied, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn brokers_talk_over_tcp() {
    let core = Broker::new(&math_broker("core", ContainerMode::Async), &registry()).unwrap();
    core.start().unwrap();
    let listener = SessionListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = ShutdownSignal::new();
    let server = tokio::spawn(listener.serve(Arc::clone(core.connections()), stop.subscribe()));

    let edge_config = BrokerConfig {
        name: "edge".to_string(),
        remote_hosts: vec![RemoteHostConfig {
            name: "core".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }],
        services: vec![service("front", vec![relay("math", "core")])],
        ..BrokerConfig::default()
    };
    let edge = Broker::new(&edge_config, &registry()).unwrap();
    edge.start().unwrap();

    // Straight to the remote broker.
    let direct = edge.connection_to("core").unwrap();
    let message = add(20, 22);
    direct.submit(&message);
    assert_eq!(closed(&message).await.get("result"), Some(&json!(42)));

    // Through the edge broker's relay process.
    let local = edge.connection().unwrap();
    let relayed = Arc::new(Message::new("front", "add", payload(json!({"a": 1, "b": 2}))));
    local.submit(&relayed);
    assert_eq!(closed(&relayed).await.get("result"), Some(&json!(3)));

    assert_eq!(core.snapshot().find("add").unwrap().received, 2);

    edge.close();
    stop.trigger();
    server.await.unwrap().unwrap();
    core.close();
}

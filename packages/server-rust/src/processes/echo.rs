use std::sync::Arc;

use switchyard_core::{
    Envelope, ForwardRequest, MessageReply, Payload, ProcessError, ProcessFactory,
    ProcessInstance, ProcessStatus,
};

use crate::config::ProcessConfig;

pub const NAME: &str = "Echo";

/// Replies to every request with its own body, closing the session.
///
/// An object under `data` in the process settings is merged into each reply,
/// overriding request keys of the same name.
#[derive(Debug)]
pub struct Echo {
    id: u64,
    extra: Payload,
    reply: Option<Envelope>,
}

impl Echo {
    #[must_use]
    pub fn new(id: u64, extra: Payload) -> Self {
        Self {
            id,
            extra,
            reply: None,
        }
    }

    /// Factory builder registered under [`NAME`].
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is present but not an object.
    pub fn factory(config: &ProcessConfig) -> Result<Arc<dyn ProcessFactory>, ProcessError> {
        let extra = match config.config.get("data") {
            None => Payload::new(),
            Some(serde_json::Value::Object(data)) => data.clone(),
            Some(_) => return Err(ProcessError::Config("`data` must be an object".to_string())),
        };
        let factory = move |id: u64| -> Result<Box<dyn ProcessInstance>, ProcessError> {
            Ok(Box::new(Self::new(id, extra.clone())))
        };
        Ok(Arc::new(factory))
    }
}

impl ProcessInstance for Echo {
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
        if self.reply.is_some() {
            return Err(ProcessError::Busy { id: self.id });
        }
        let mut body = request.request.take().unwrap_or_default();
        for (key, value) in &self.extra {
            body.insert(key.clone(), value.clone());
        }
        self.reply = Some(request.into_reply(body, true));
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn echoes_body_with_extra_data() {
        let mut echo = Echo::new(1, payload(json!({"tag": "x"})));
        let mut request = Envelope::request("math", "add", payload(json!({"a": 2})));
        request.source_id = 4;

        echo.handle_request(request).unwrap();
        assert!(echo.status().reply_ready);
        assert!(matches!(
            echo.handle_request(Envelope::default()),
            Err(ProcessError::Busy { id: 1 })
        ));

        let reply = echo.take_reply().unwrap();
        assert!(reply.close);
        assert_eq!(reply.source_id, 4);
        let body = reply.reply.unwrap();
        assert_eq!(body["a"], json!(2));
        assert_eq!(body["tag"], json!("x"));
        assert_eq!(echo.status(), ProcessStatus::idle());
    }

    #[test]
    fn data_must_be_an_object() {
        let mut config = ProcessConfig::new("add", NAME);
        config.config.insert("data".to_string(), json!(3));
        assert!(matches!(Echo::factory(&config), Err(ProcessError::Config(_))));
    }
}

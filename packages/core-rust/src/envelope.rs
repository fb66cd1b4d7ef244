//! Routing envelope carried through the handler tree and over the wire.
//!
//! Every request travelling down the tree and every reply travelling back up
//! is an [`Envelope`]. Field names are camelCase on the wire, and optional
//! fields are omitted when absent so that a close header stays small.

use serde::{Deserialize, Serialize};

/// Request and reply bodies: an ordered-by-insertion JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Reserved connection name for the loopback connection into the local broker.
pub const LOCAL_CONNECTION: &str = "local";

/// Reserved service name that may not appear in a broker configuration.
pub const HOST_SERVICE: &str = "host";

/// Default period in milliseconds after which an unanswered message expires.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Return text attached to a reply synthesized by a timeout.
pub const TIMEOUT_RETURN: &str = "message timed out with no response";

/// Internal control markers carried in the `systemRequest` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemRequest {
    /// The originating session was closed; any queued work for it may be dropped.
    #[serde(rename = "CLOSE_MESSAGE")]
    CloseMessage,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

/// The request/reply envelope routed between connections and handlers.
///
/// `connection_id` and `source_id` together identify the originating session
/// and are what the broker uses to deliver a reply. `source` is the header of
/// the request that caused this one to be forwarded, giving a provenance path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub connection_id: u64,
    #[serde(default)]
    pub source_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_ref: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<Box<Envelope>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply: Option<Payload>,
    /// Human-readable bounce or timeout reason. `return` is a Rust keyword.
    #[serde(rename = "return", skip_serializing_if = "Option::is_none", default)]
    pub return_message: Option<String>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub close: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub system_request: Option<SystemRequest>,
}

impl Envelope {
    /// Creates a request envelope addressed to `service`/`message`.
    #[must_use]
    pub fn request(service: impl Into<String>, message: impl Into<String>, request: Payload) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            request: Some(request),
            ..Self::default()
        }
    }

    /// Returns only the routing header: addressing, identity and provenance.
    #[must_use]
    pub fn header(&self) -> Self {
        Self {
            service: self.service.clone(),
            message: self.message.clone(),
            connection_id: self.connection_id,
            source_id: self.source_id,
            source_ref: self.source_ref,
            source: self.source.clone(),
            ..Self::default()
        }
    }

    /// Turns a request into its reply, keeping the header so the broker can
    /// find the originating session.
    #[must_use]
    pub fn into_reply(mut self, reply: Payload, close: bool) -> Self {
        self.request = None;
        self.reply = Some(reply);
        self.close = close;
        self
    }

    /// Marks this envelope as a closing bounce-back carrying `reason`.
    #[must_use]
    pub fn into_bounce(mut self, reason: impl Into<String>) -> Self {
        self.return_message = Some(reason.into());
        self.close = true;
        self
    }

    /// True when this envelope is an internal session-close notification.
    #[must_use]
    pub fn is_close_request(&self) -> bool {
        self.system_request == Some(SystemRequest::CloseMessage)
    }

    /// Encodes the envelope as named `MsgPack` for the session transport.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload value cannot be encoded.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes an envelope previously produced by [`Envelope::to_msgpack`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Reply data accumulated for one message across all received fragments.
///
/// Each fragment's `reply` payload is merged key-by-key into `data`; a later
/// fragment overwrites keys set by an earlier one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReply {
    pub data: Payload,
    #[serde(rename = "return", skip_serializing_if = "Option::is_none", default)]
    pub return_message: Option<String>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub close: bool,
    /// Number of fragments merged so far.
    #[serde(default)]
    pub fragments: usize,
}

impl MessageReply {
    /// Merges one reply fragment.
    pub fn merge(&mut self, fragment: &Envelope) {
        if let Some(reply) = &fragment.reply {
            for (key, value) in reply {
                self.data.insert(key.clone(), value.clone());
            }
        }
        if fragment.return_message.is_some() {
            self.return_message.clone_from(&fragment.return_message);
        }
        self.close |= fragment.close;
        self.fragments += 1;
    }

    /// Looks up a single reply field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

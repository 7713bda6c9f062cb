//! The wire envelope exchanged with the routing daemon.
//!
//! One JSON object per WebSocket message:
//!
//! ```text
//! {
//!   "command": "register_service",
//!   "data": {"service": "wallet_ui"},
//!   "origin": "wallet_ui",
//!   "destination": "daemon",
//!   "ack": false,
//!   "request_id": "9b2f...",
//!   "error": null
//! }
//! ```
//!
//! `command` and `request_id` are required on the wire; everything else has a
//! default. `data` is kept as an opaque JSON tree, typed projection happens in
//! callers via [`Message::data_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DaemonError, Result};

/// Identity of the routing daemon itself.
pub const DAEMON_SERVICE: &str = "daemon";

/// Announces that the sender is reachable as a routing destination.
pub const REGISTER_SERVICE: &str = "register_service";

/// Liveness probe answered by the daemon.
pub const PING: &str = "ping";

/// A single envelope.
///
/// Immutable once built: outbound requests come from a [`MessageFactory`],
/// replies from [`Message::reply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    /// Requested operation.
    pub command: String,
    /// Opaque payload; `None` for commands without arguments.
    #[serde(default)]
    pub data: Option<Value>,
    /// Sending service.
    #[serde(default)]
    pub origin: String,
    /// Receiving service.
    #[serde(default)]
    pub destination: String,
    /// `true` on replies.
    #[serde(default)]
    pub ack: bool,
    /// Correlates a reply to its request.
    pub request_id: String,
    /// Set by the peer when it could not satisfy the request.
    #[serde(default)]
    pub error: Option<String>,
}

impl Message {
    /// Build the acknowledgement for `request`.
    ///
    /// Echoes `command` and `request_id` and swaps origin and destination.
    pub fn reply(request: &Message, data: Option<Value>) -> Self {
        Self {
            command: request.command.clone(),
            data: present(data),
            origin: request.destination.clone(),
            destination: request.origin.clone(),
            ack: true,
            request_id: request.request_id.clone(),
            error: None,
        }
    }

    /// Build an error acknowledgement for `request`.
    pub fn error_reply(request: &Message, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::reply(request, None)
        }
    }

    /// The peer's error text, if it reported a non-empty one.
    pub fn remote_error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// Project `data` into a typed shape.
    ///
    /// An absent payload is projected as JSON `null`, so `Option<T>` and unit
    /// targets accept it.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            DaemonError::Protocol(format!("unexpected payload for '{}': {}", self.command, e))
        })
    }

    /// Reject shapes serde accepts but the wire does not.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_id.is_empty() {
            return Err(DaemonError::Protocol("empty request_id".to_string()));
        }
        match &self.data {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
            Some(other) => Err(DaemonError::Protocol(format!(
                "data must be an object or null, got {}",
                json_type_name(other)
            ))),
        }
    }
}

/// JSON `null` and an absent payload are the same on the wire.
fn present(data: Option<Value>) -> Option<Value> {
    data.filter(|value| !value.is_null())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Mint a fresh request id.
///
/// Random v4 UUID in simple hex form; collisions between concurrently
/// outstanding requests are negligible but still checked on registration.
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Builds outbound requests for one origin identity.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    origin: String,
}

impl MessageFactory {
    /// Create a factory stamping `origin` on every message.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
        }
    }

    /// The origin this factory stamps.
    #[inline]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Build a request with a freshly minted `request_id`.
    pub fn request(&self, command: &str, data: Option<Value>, destination: &str) -> Message {
        Message {
            command: command.to_string(),
            data: present(data),
            origin: self.origin.clone(),
            destination: destination.to_string(),
            ack: false,
            request_id: new_request_id(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_factory_stamps_origin_and_destination() {
        let factory = MessageFactory::new("wallet_ui");
        let msg = factory.request("get_height_info", None, "wallet");

        assert_eq!(msg.origin, "wallet_ui");
        assert_eq!(msg.destination, "wallet");
        assert_eq!(msg.command, "get_height_info");
        assert!(!msg.ack);
        assert!(msg.error.is_none());
        assert_eq!(msg.request_id.len(), 32);
    }

    #[test]
    fn test_factory_request_ids_are_unique() {
        let factory = MessageFactory::new("client");
        let ids: std::collections::HashSet<String> = (0..1000)
            .map(|_| factory.request(PING, None, DAEMON_SERVICE).request_id)
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_reply_swaps_routing() {
        let request = MessageFactory::new("wallet_ui").request(PING, None, DAEMON_SERVICE);
        let reply = Message::reply(&request, Some(json!({"success": true})));

        assert!(reply.ack);
        assert_eq!(reply.request_id, request.request_id);
        assert_eq!(reply.command, PING);
        assert_eq!(reply.origin, DAEMON_SERVICE);
        assert_eq!(reply.destination, "wallet_ui");
    }

    #[test]
    fn test_remote_error_ignores_empty() {
        let request = MessageFactory::new("a").request("x", None, "b");

        assert_eq!(Message::reply(&request, None).remote_error(), None);
        assert_eq!(Message::error_reply(&request, "").remote_error(), None);
        assert_eq!(
            Message::error_reply(&request, "wallet locked").remote_error(),
            Some("wallet locked")
        );
    }

    #[test]
    fn test_data_as_projection() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Height {
            height: u32,
        }

        let request = MessageFactory::new("a").request("get_height_info", None, "wallet");
        let reply = Message::reply(&request, Some(json!({"height": 42})));
        assert_eq!(reply.data_as::<Height>().unwrap(), Height { height: 42 });

        let empty = Message::reply(&request, None);
        assert_eq!(empty.data_as::<Option<Height>>().unwrap(), None);
        assert!(matches!(
            empty.data_as::<Height>(),
            Err(DaemonError::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_object_data() {
        let mut msg = MessageFactory::new("a").request("x", Some(json!([1, 2])), "b");
        assert!(matches!(msg.validate(), Err(DaemonError::Protocol(_))));

        msg.data = Some(json!({}));
        assert!(msg.validate().is_ok());

        msg.request_id.clear();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_null_data_is_absent_data() {
        let request = MessageFactory::new("a").request("x", Some(Value::Null), "b");
        assert_eq!(request.data, None);
        assert!(Message::reply(&request, Some(Value::Null)).data.is_none());

        let mut raw = request.clone();
        raw.data = Some(Value::Null);
        assert!(raw.validate().is_ok());
    }
}

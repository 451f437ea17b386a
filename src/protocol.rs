//! Page <-> controller message protocol
//!
//! Wire shapes are JSON objects discriminated by `type`:
//!
//! | direction          | message                               | reply               |
//! |--------------------|---------------------------------------|---------------------|
//! | page -> controller | `{"type":"SKIP_WAITING"}`             | none                |
//! | page -> controller | `{"type":"GET_VERSION"}`              | `{"version":"..."}` |
//! | page -> controller | `{"type":"CLEAR_CACHE"}`              | `{"success":true}`  |
//! | controller -> page | `{"type":"SW_UPDATED","version":"..."}` | none              |
//!
//! Payloads with an unknown `type` (or no `type` at all) are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Message sent by a page to a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SkipWaiting,
    GetVersion,
    ClearCache,
}

impl ClientMessage {
    /// Decode a payload, `None` for anything unrecognized
    pub fn parse(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Message broadcast by a controller to its pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerMessage {
    /// Sent once a controller has finished activating
    #[serde(rename = "SW_UPDATED")]
    Updated { version: String },
}

/// Reply to `GET_VERSION`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

/// Reply to `CLEAR_CACHE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCacheReply {
    pub success: bool,
}

/// Dedicated reply channel handed over with a message
#[derive(Debug)]
pub struct ReplyPort(oneshot::Sender<Value>);

impl ReplyPort {
    /// Create a port and the receiving end the sender awaits
    pub fn channel() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Post a reply; a receiver that already went away is not an error
    pub fn post<T: Serialize>(self, reply: &T) {
        match serde_json::to_value(reply) {
            Ok(value) => {
                if self.0.send(value).is_err() {
                    debug!("Reply port closed before reply was posted");
                }
            }
            Err(e) => debug!("Failed to encode reply: {}", e),
        }
    }
}

/// A message in flight: the payload plus its optional reply port
#[derive(Debug)]
pub struct Envelope {
    pub data: Value,
    pub reply: Option<ReplyPort>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Self { data, reply: None }
    }

    pub fn with_reply(data: Value, reply: ReplyPort) -> Self {
        Self {
            data,
            reply: Some(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        assert_eq!(ClientMessage::SkipWaiting.to_value(), json!({"type": "SKIP_WAITING"}));
        assert_eq!(ClientMessage::GetVersion.to_value(), json!({"type": "GET_VERSION"}));
        assert_eq!(ClientMessage::ClearCache.to_value(), json!({"type": "CLEAR_CACHE"}));
    }

    #[test]
    fn test_parse_ignores_unknown() {
        assert_eq!(
            ClientMessage::parse(&json!({"type": "GET_VERSION"})),
            Some(ClientMessage::GetVersion)
        );
        assert_eq!(ClientMessage::parse(&json!({"type": "REBOOT"})), None);
        assert_eq!(ClientMessage::parse(&json!({"version": "1"})), None);
        assert_eq!(ClientMessage::parse(&json!("SKIP_WAITING")), None);
    }

    #[test]
    fn test_controller_message_wire_shape() {
        let message = ControllerMessage::Updated {
            version: "2.0.0".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "SW_UPDATED", "version": "2.0.0"})
        );
    }

    #[tokio::test]
    async fn test_reply_port() {
        let (port, rx) = ReplyPort::channel();
        port.post(&VersionReply {
            version: "2.0.0".into(),
        });
        assert_eq!(rx.await.unwrap(), json!({"version": "2.0.0"}));
    }
}

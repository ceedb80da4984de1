// message.rs — contexts, the message catalogue, and the wire shapes exchanged between them
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Port name used by streaming chat requests.
pub const CHAT_REQUEST_STREAM: &str = "CHAT_REQUEST_STREAM";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Contexts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextId {
    Content,
    Background,
    Popup,
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextId::Content    => "content",
            ContextId::Background => "background",
            ContextId::Popup      => "popup",
        };
        f.write_str(name)
    }
}

/// Address of one attached context instance (a tab's content script, the
/// background worker, an open popup).
pub type EndpointId = u64;

/// Who sent a request; handed to handlers alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub endpoint: EndpointId,
    pub context:  ContextId,
}

// ── Message catalogue ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Non-streaming chat, content/popup → background
    ChatRequest,
    /// Config-validated test call, content/popup → background
    TestApiKey,
    /// Persisted settings changed, background/popup → content
    SettingsChanged,
    /// Read settings through a content context, popup → content
    SettingsGet,
    /// Write settings through a content context, popup → content
    SettingsSet,
    /// Status snapshot of a content context, popup → content
    SystemStatus,
    /// Liveness probe answered by every bridge
    HealthCheck,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::ChatRequest,
        MessageType::TestApiKey,
        MessageType::SettingsChanged,
        MessageType::SettingsGet,
        MessageType::SettingsSet,
        MessageType::SystemStatus,
        MessageType::HealthCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ChatRequest     => "CHAT_REQUEST",
            MessageType::TestApiKey      => "TEST_API_KEY",
            MessageType::SettingsChanged => "SETTINGS_CHANGED",
            MessageType::SettingsGet     => "SETTINGS_GET",
            MessageType::SettingsSet     => "SETTINGS_SET",
            MessageType::SystemStatus    => "SYSTEM_STATUS",
            MessageType::HealthCheck     => "HEALTH_CHECK",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

// ── Wire shapes ─────────────────────────────────────────────────────────

/// One-shot request unit. `id` is the correlation key for the reply.
///
/// `msg_type` stays a string on the wire so that a peer running a newer
/// catalogue can still be answered with an "unknown message type" reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id:        u64,
    #[serde(rename = "type")]
    pub msg_type:  String,
    pub data:      Value,
    pub source:    ContextId,
    pub target:    Option<ContextId>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Success,
    Error,
}

/// Reply routed back to the sender of an [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id:        u64,
    #[serde(rename = "type")]
    pub msg_type:  String,
    pub status:    MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data:      Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:     Option<String>,
    pub source:    ContextId,
    pub target:    ContextId,
    pub timestamp: i64,
}

impl Reply {
    /// Build the reply for `envelope` from a handler outcome.
    pub fn to(envelope: &Envelope, from: ContextId, outcome: Result<Value, String>) -> Self {
        let (status, data, error) = match outcome {
            Ok(data) => (MessageStatus::Success, Some(data), None),
            Err(e)   => (MessageStatus::Error, None, Some(e)),
        };
        Reply {
            id:        envelope.id,
            msg_type:  format!("{}_RESPONSE", envelope.msg_type),
            status,
            data,
            error,
            source:    from,
            target:    envelope.source,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_round_trips_through_str() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>(), Ok(t));
        }
    }

    #[test]
    fn test_unknown_message_type_keeps_name() {
        assert_eq!("NOPE".parse::<MessageType>(), Err("NOPE".to_string()));
    }

    #[test]
    fn test_envelope_wire_names() {
        let env = Envelope {
            id:        7,
            msg_type:  "CHAT_REQUEST".into(),
            data:      json!({ "text": "hi" }),
            source:    ContextId::Content,
            target:    Some(ContextId::Background),
            timestamp: 1,
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "CHAT_REQUEST");
        assert_eq!(v["source"], "content");
        assert_eq!(v["target"], "background");
    }

    #[test]
    fn test_reply_to_error_outcome() {
        let env = Envelope {
            id:        3,
            msg_type:  "TEST_API_KEY".into(),
            data:      Value::Null,
            source:    ContextId::Popup,
            target:    None,
            timestamp: 0,
        };
        let reply = Reply::to(&env, ContextId::Background, Err("bad key".into()));
        assert_eq!(reply.id, 3);
        assert_eq!(reply.msg_type, "TEST_API_KEY_RESPONSE");
        assert_eq!(reply.status, MessageStatus::Error);
        assert_eq!(reply.error.as_deref(), Some("bad key"));
        assert_eq!(reply.target, ContextId::Popup);
        assert!(reply.data.is_none());
    }
}

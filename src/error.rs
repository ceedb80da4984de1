// error.rs — failures of the cross-context bridge
use crate::message::ContextId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// No reply arrived before the deadline. Always safe to retry.
    #[error("message timed out: {message_type}")]
    Timeout { message_type: String },

    /// The substrate refused to carry the message (e.g. nobody is listening).
    #[error("transport error: {0}")]
    Transport(String),

    /// The receiving context has no handler for this type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The remote handler answered with an error status.
    #[error("{0}")]
    Remote(String),

    #[error("{operation} is not available in the {context} context")]
    Capability { operation: &'static str, context: ContextId },

    #[error("service destroyed")]
    Destroyed,

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

use crate::message::MessageType;

/// Errors produced while encoding or decoding a frame
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The transport delivered a message with no bytes at all
    #[error("empty frame")]
    Empty,

    /// The payload of a structured frame is not valid JSON for its type
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },

    /// A structured payload could not be marshalled
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

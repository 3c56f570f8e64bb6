//! Frame encode/decode.
//!
//! Wire format: `[type byte][payload]`. The transport is message-oriented, so
//! there is no length prefix and no escaping.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ProtocolError;
use crate::message::{
    AuthRequest, ConnectRequest, ErrorMessage, ExitNotification, HeartBeat, MessageType,
    ResizeRequest,
};

/// One decoded wire message
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Connect(ConnectRequest),
    Key(Vec<u8>),
    Resize(ResizeRequest),
    Auth(AuthRequest),
    /// Reserved, carried verbatim
    Close(Vec<u8>),
    /// Reserved, carried verbatim
    Initialize(Vec<u8>),
    Output(Vec<u8>),
    Exit(ExitNotification),
    /// `None` is a heartbeat with no body
    HeartBeat(Option<HeartBeat>),
    Error(ErrorMessage),
    /// Type byte outside `'0'..='9'`. Callers log and drop these.
    Unrecognized { type_byte: u8, payload: Vec<u8> },
}

impl Frame {
    /// The message type, or `None` for [`Frame::Unrecognized`]
    pub fn message_type(&self) -> Option<MessageType> {
        let ty = match self {
            Frame::Connect(_) => MessageType::Connect,
            Frame::Key(_) => MessageType::Key,
            Frame::Resize(_) => MessageType::Resize,
            Frame::Auth(_) => MessageType::Auth,
            Frame::Close(_) => MessageType::Close,
            Frame::Initialize(_) => MessageType::Initialize,
            Frame::Output(_) => MessageType::Output,
            Frame::Exit(_) => MessageType::Exit,
            Frame::HeartBeat(_) => MessageType::HeartBeat,
            Frame::Error(_) => MessageType::Error,
            Frame::Unrecognized { .. } => return None,
        };
        Some(ty)
    }

    fn type_byte(&self) -> u8 {
        match self {
            Frame::Unrecognized { type_byte, .. } => *type_byte,
            other => other
                .message_type()
                .map(MessageType::as_byte)
                .unwrap_or_default(),
        }
    }

    /// Serialize into a single transport message.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![self.type_byte()];
        match self {
            Frame::Key(bytes)
            | Frame::Output(bytes)
            | Frame::Close(bytes)
            | Frame::Initialize(bytes) => out.extend_from_slice(bytes),
            Frame::Unrecognized { payload, .. } => out.extend_from_slice(payload),
            Frame::HeartBeat(None) => {}
            Frame::HeartBeat(Some(hb)) => append_json(&mut out, MessageType::HeartBeat, hb)?,
            Frame::Connect(req) => append_json(&mut out, MessageType::Connect, req)?,
            Frame::Resize(req) => append_json(&mut out, MessageType::Resize, req)?,
            Frame::Auth(req) => append_json(&mut out, MessageType::Auth, req)?,
            Frame::Exit(exit) => append_json(&mut out, MessageType::Exit, exit)?,
            Frame::Error(err) => append_json(&mut out, MessageType::Error, err)?,
        }
        Ok(out)
    }

    /// Parse a single transport message.
    ///
    /// Unknown type bytes are not an error: they come back as
    /// [`Frame::Unrecognized`].
    pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
        let (&type_byte, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;

        let Some(kind) = MessageType::from_byte(type_byte) else {
            return Ok(Frame::Unrecognized {
                type_byte,
                payload: payload.to_vec(),
            });
        };

        let frame = match kind {
            MessageType::Key => Frame::Key(payload.to_vec()),
            MessageType::Output => Frame::Output(payload.to_vec()),
            MessageType::Close => Frame::Close(payload.to_vec()),
            MessageType::Initialize => Frame::Initialize(payload.to_vec()),
            MessageType::Connect => {
                Frame::Connect(parse_optional::<ConnectRequest>(kind, payload)?.unwrap_or_default())
            }
            MessageType::HeartBeat => Frame::HeartBeat(parse_optional(kind, payload)?),
            MessageType::Resize => Frame::Resize(parse(kind, payload)?),
            MessageType::Auth => Frame::Auth(parse(kind, payload)?),
            MessageType::Exit => Frame::Exit(parse(kind, payload)?),
            MessageType::Error => Frame::Error(parse(kind, payload)?),
        };
        Ok(frame)
    }
}

fn append_json<T: Serialize>(
    out: &mut Vec<u8>,
    kind: MessageType,
    value: &T,
) -> Result<(), ProtocolError> {
    serde_json::to_writer(out, value).map_err(|source| ProtocolError::Encode { kind, source })
}

fn parse<T: DeserializeOwned>(kind: MessageType, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Empty body and JSON `null` both mean "absent"
fn parse_optional<T: DeserializeOwned>(
    kind: MessageType,
    payload: &[u8],
) -> Result<Option<T>, ProtocolError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    parse::<Option<T>>(kind, payload)
}

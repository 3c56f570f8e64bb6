//! Terminal Protocol - the binary framing used between terminal clients and servers
//!
//! Every WebSocket message carries exactly one frame. The first byte is the
//! message type (an ASCII digit), the remainder is the payload: raw bytes for
//! keystrokes and output, JSON for everything structured.
//!
//! # Example
//!
//! ```
//! use terminal_protocol::{Frame, MessageType, ResizeRequest};
//!
//! let frame = Frame::Resize(ResizeRequest { cols: 120, rows: 40 });
//! let bytes = frame.encode().unwrap();
//! assert_eq!(bytes[0], MessageType::Resize.as_byte());
//!
//! let decoded = Frame::decode(&bytes).unwrap();
//! assert_eq!(decoded, frame);
//! ```

mod error;
mod frame;
mod message;

pub use error::ProtocolError;
pub use frame::Frame;
pub use message::{
    AuthRequest, ConnectRequest, ErrorMessage, ExitNotification, HeartBeat, MessageType,
    ResizeRequest,
};

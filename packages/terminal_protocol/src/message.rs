use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Discriminator carried in the first byte of every frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = b'0',
    Key = b'1',
    Resize = b'2',
    Auth = b'3',
    Close = b'4',
    Initialize = b'5',
    Output = b'6',
    Exit = b'7',
    HeartBeat = b'8',
    Error = b'9',
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Connect,
        MessageType::Key,
        MessageType::Resize,
        MessageType::Auth,
        MessageType::Close,
        MessageType::Initialize,
        MessageType::Output,
        MessageType::Exit,
        MessageType::HeartBeat,
        MessageType::Error,
    ];

    /// Map a wire byte back to its type, `None` for anything outside `'0'..='9'`
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Self::Connect),
            b'1' => Some(Self::Key),
            b'2' => Some(Self::Resize),
            b'3' => Some(Self::Auth),
            b'4' => Some(Self::Close),
            b'5' => Some(Self::Initialize),
            b'6' => Some(Self::Output),
            b'7' => Some(Self::Exit),
            b'8' => Some(Self::HeartBeat),
            b'9' => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Key => "key",
            Self::Resize => "resize",
            Self::Auth => "auth",
            Self::Close => "close",
            Self::Initialize => "initialize",
            Self::Output => "output",
            Self::Exit => "exit",
            Self::HeartBeat => "heartbeat",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session parameters sent by the client as its first frame.
///
/// Every field may be empty; the server fills blanks from the URL query and
/// then from its own configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    /// Driver name (`host`, `docker`). Kept as `container` on the wire.
    #[serde(rename = "container")]
    pub driver: String,
    pub shell: String,
    #[serde(deserialize_with = "null_as_default")]
    pub environment: BTreeMap<String, String>,
    pub workdir: String,
    pub user: String,
    pub init_command: String,
    pub image: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Sent once by the server when the session ends or could not start
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNotification {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartBeat {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
}

/// Reserved: signed client authentication. No flow sends it yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthRequest {
    pub client_id: String,
    pub timestamp: i64,
    pub signature: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

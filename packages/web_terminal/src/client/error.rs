use terminal_protocol::ProtocolError;
use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// The server answered the upgrade with a plain HTTP response
    #[error("server rejected connection with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to connect: {0}")]
    Dial(#[source] tungstenite::Error),

    #[error("connection closed before the session started")]
    HandshakeClosed,

    /// The server reported an exit before acknowledging the connect
    #[error("{message}")]
    ConnectFailed { code: i32, message: String },

    #[error("connection error: {0}")]
    Transport(#[source] tungstenite::Error),

    #[error("connection closed abnormally ({code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Classify a failed dial, keeping the HTTP status and body of a rejected upgrade
    pub fn from_dial(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default()
                    .into_owned();
                Self::Rejected {
                    status: response.status().as_u16(),
                    body,
                }
            }
            other => Self::Dial(other),
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectFailed { code, .. } => *code,
            _ => 1,
        }
    }
}

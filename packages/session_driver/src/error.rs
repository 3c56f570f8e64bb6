/// Errors that can occur while driving a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Driver name is not one of `host`, `docker` or `container`
    #[error("unknown driver: {0:?}")]
    UnknownDriver(String),

    /// The process or container could not be started
    #[error("{0}")]
    Spawn(String),

    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    #[error("failed to resize session: {0}")]
    ResizeFailed(String),

    #[error("failed to close session: {0}")]
    CloseFailed(String),

    /// The process exited with a nonzero status
    #[error("{message}")]
    Exit { code: i32, message: String },

    /// The process was killed because the session was closed
    #[error("signal: killed")]
    Killed,

    /// Operation on a session that has already been closed
    #[error("session is closed")]
    Closed,

    #[error("docker: {0}")]
    Container(#[from] bollard::errors::Error),

    /// The backend task went away
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl SessionError {
    pub(crate) fn exit(code: i32) -> Self {
        SessionError::Exit {
            code,
            message: format!("exit status {code}"),
        }
    }

    /// Exit code to report to a peer for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Exit { code, .. } => *code,
            _ => 1,
        }
    }
}

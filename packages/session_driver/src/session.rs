use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info};

use crate::config::{Driver, SessionConfig};
use crate::container::ContainerSession;
use crate::error::SessionError;
use crate::host::HostSession;

/// Chunks buffered between a backend reader and `Session::read`
const OUTPUT_QUEUE_DEPTH: usize = 256;

/// How a session's process ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    Code(i32),
    /// Torn down by `close()`
    Killed,
    /// The backend could not determine an exit status
    Failed(String),
}

/// Receiving end of a backend's output, readable into caller buffers.
pub(crate) struct OutputQueue {
    inner: Mutex<OutputState>,
}

struct OutputState {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl OutputQueue {
    pub(crate) fn channel() -> (mpsc::Sender<Vec<u8>>, OutputQueue) {
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let queue = OutputQueue {
            inner: Mutex::new(OutputState {
                rx,
                pending: Vec::new(),
                offset: 0,
            }),
        };
        (tx, queue)
    }

    /// Returns 0 once the backend has finished producing output.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut state = self.inner.lock().await;
        while state.offset >= state.pending.len() {
            match state.rx.recv().await {
                Some(chunk) => {
                    state.pending = chunk;
                    state.offset = 0;
                }
                None => return 0,
            }
        }
        let available = &state.pending[state.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        state.offset += n;
        n
    }
}

/// Exit status published once by a backend watcher.
pub(crate) struct ExitWatch {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitWatch {
    pub(crate) fn channel() -> (watch::Sender<Option<ExitOutcome>>, ExitWatch) {
        let (tx, rx) = watch::channel(None);
        (tx, ExitWatch { rx })
    }

    pub(crate) async fn wait(&self) -> Result<(), SessionError> {
        let mut rx = self.rx.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SessionError::ChannelError("exit watcher went away".into()))?
            .clone();
        match outcome {
            Some(ExitOutcome::Code(0)) => Ok(()),
            Some(ExitOutcome::Code(code)) => Err(SessionError::exit(code)),
            Some(ExitOutcome::Killed) => Err(SessionError::Killed),
            Some(ExitOutcome::Failed(message)) => Err(SessionError::Exit { code: 1, message }),
            None => Err(SessionError::ChannelError("exit watcher went away".into())),
        }
    }

    pub(crate) fn exit_code(&self) -> i32 {
        match &*self.rx.borrow() {
            Some(ExitOutcome::Code(code)) => *code,
            Some(ExitOutcome::Failed(_)) => 1,
            Some(ExitOutcome::Killed) | None => -1,
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Single-shot guard for teardown
#[derive(Default)]
pub(crate) struct CloseGuard {
    closed: AtomicBool,
}

impl CloseGuard {
    /// True exactly once, for the first caller
    pub(crate) fn begin(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// An interactive process bound to one connection.
///
/// All operations take `&self` so the session can be shared between the
/// tasks serving a connection behind an `Arc`.
pub enum Session {
    Host(HostSession),
    Container(ContainerSession),
}

impl Session {
    /// Start a session with the configured driver
    pub async fn connect(config: SessionConfig) -> Result<Session, SessionError> {
        info!(
            driver = %config.driver,
            shell = %config.shell(),
            workdir = %config.workdir,
            "starting session"
        );
        let session = match config.driver {
            Driver::Host => Session::Host(HostSession::spawn(&config)?),
            Driver::Container => Session::Container(ContainerSession::start(&config).await?),
        };
        debug!(driver = %config.driver, "session started");
        Ok(session)
    }

    pub fn driver(&self) -> Driver {
        match self {
            Session::Host(_) => Driver::Host,
            Session::Container(_) => Driver::Container,
        }
    }

    /// Read output into `buf`. Blocks until data is available; `Ok(0)` means
    /// the output stream is over.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let n = match self {
            Session::Host(s) => s.output().read(buf).await,
            Session::Container(s) => s.output().read(buf).await,
        };
        Ok(n)
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        match self {
            Session::Host(s) => s.write(data).await,
            Session::Container(s) => s.write(data).await,
        }
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        match self {
            Session::Host(s) => s.resize(rows, cols).await,
            Session::Container(s) => s.resize(rows, cols).await,
        }
    }

    /// Block until the process exits. A nonzero status is
    /// [`SessionError::Exit`]; a process taken down by [`Session::close`] is
    /// [`SessionError::Killed`].
    pub async fn wait(&self) -> Result<(), SessionError> {
        match self {
            Session::Host(s) => s.exit_watch().wait().await,
            Session::Container(s) => s.exit_watch().wait().await,
        }
    }

    /// Exit code of the finished process, `-1` while it is still running
    pub fn exit_code(&self) -> i32 {
        match self {
            Session::Host(s) => s.exit_watch().exit_code(),
            Session::Container(s) => s.exit_watch().exit_code(),
        }
    }

    pub fn has_exited(&self) -> bool {
        match self {
            Session::Host(s) => s.exit_watch().has_exited(),
            Session::Container(s) => s.exit_watch().has_exited(),
        }
    }

    /// Release the process and its resources. Only the first call does
    /// anything; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), SessionError> {
        match self {
            Session::Host(s) => s.close().await,
            Session::Container(s) => s.close().await,
        }
    }
}

//! Host backend: a local process attached to a PTY.
//!
//! The PTY master is owned by an actor task that serves resize/close
//! commands. Input is written on a blocking thread, output is read on another,
//! and the child is reaped on a third, which publishes the exit status.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{CloseGuard, ExitOutcome, ExitWatch, OutputQueue};

const READ_BUFFER_SIZE: usize = 4096;

const INPUT_QUEUE_DEPTH: usize = 32;

struct WriteRequest {
    data: Vec<u8>,
    respond_to: oneshot::Sender<Result<usize, SessionError>>,
}

enum HostCommand {
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Handle to a PTY-backed process
pub struct HostSession {
    commands: mpsc::Sender<HostCommand>,
    input: mpsc::Sender<WriteRequest>,
    output: OutputQueue,
    exit: ExitWatch,
    guard: CloseGuard,
    pid: Option<u32>,
}

struct HostActor {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    closing: Arc<AtomicBool>,
    receiver: mpsc::Receiver<HostCommand>,
}

impl HostSession {
    pub(crate) fn spawn(config: &SessionConfig) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(format!("failed to open pty: {e}")))?;

        let argv = config.command_line();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SessionError::Spawn("empty command line".into()))?;
        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);

        if !config.workdir.is_empty() {
            cmd.cwd(&config.workdir);
        }
        // CommandBuilder starts from this process's environment
        for (key, value) in config.environment_overrides() {
            cmd.env(key, value);
        }
        if !config.user.is_empty() {
            warn!(user = %config.user, "host driver cannot switch users, ignoring");
        }

        info!(command = ?argv, "spawning pty command");
        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(program = %program, error = %e, "failed to spawn command");
            SessionError::Spawn(e.to_string())
        })?;
        // Keep only the child's copy of the slave, so the reader sees EOF on exit
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(format!("failed to take pty writer: {e}")))?;
        info!(pid = ?pid, "pty process started");

        let (output_tx, output) = OutputQueue::channel();
        let (exit_tx, exit) = ExitWatch::channel();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let closing = Arc::new(AtomicBool::new(false));

        spawn_reader(reader, output_tx)?;
        spawn_writer(writer, input_rx)?;

        let wait_closing = closing.clone();
        std::thread::Builder::new()
            .name("pty-wait".into())
            .spawn(move || {
                let status = child.wait();
                let outcome = if wait_closing.load(Ordering::Acquire) {
                    ExitOutcome::Killed
                } else {
                    match status {
                        Ok(status) => match status.signal() {
                            Some(signal) => ExitOutcome::Failed(format!("signal: {signal}")),
                            None => ExitOutcome::Code(status.exit_code() as i32),
                        },
                        Err(e) => ExitOutcome::Failed(e.to_string()),
                    }
                };
                debug!(pid = ?pid, outcome = ?outcome, "pty process exited");
                exit_tx.send_replace(Some(outcome));
            })
            .map_err(|e| SessionError::Spawn(format!("failed to start wait thread: {e}")))?;

        let actor = HostActor {
            master: pair.master,
            killer,
            pid,
            closing,
            receiver: command_rx,
        };
        tokio::spawn(actor.run());

        Ok(HostSession {
            commands: command_tx,
            input: input_tx,
            output,
            exit,
            guard: CloseGuard::default(),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn output(&self) -> &OutputQueue {
        &self.output
    }

    pub(crate) fn exit_watch(&self) -> &ExitWatch {
        &self.exit
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if self.guard.is_closed() {
            return Err(SessionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.input
            .send(WriteRequest {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub(crate) async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if self.guard.is_closed() {
            return Err(SessionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::Resize {
            rows,
            cols,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| SessionError::ChannelError("pty actor dropped resize reply".into()))?
    }

    pub(crate) async fn close(&self) -> Result<(), SessionError> {
        if !self.guard.begin() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(HostCommand::Close { respond_to: tx })
            .await
            .is_err()
        {
            // Actor already gone, nothing left to release
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    async fn send(&self, command: HostCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ChannelError("pty actor is gone".into()))
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO once the slave side closes; this is end of stream
                        debug!(error = %e, "pty read ended");
                        break;
                    }
                }
            }
            debug!("pty reader thread exiting");
        })
        .map(|_| ())
        .map_err(|e| SessionError::Spawn(format!("failed to start reader thread: {e}")))
}

/// Blocking writer. A write into a full PTY blocks only this thread; once the
/// process group is killed the slave hangs up and the write fails with EIO.
fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<WriteRequest>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            while let Some(WriteRequest { data, respond_to }) = input_rx.blocking_recv() {
                let result = writer
                    .write_all(&data)
                    .and_then(|()| writer.flush())
                    .map(|()| data.len())
                    .map_err(|e| SessionError::WriteFailed(e.to_string()));
                let failed = result.is_err();
                let _ = respond_to.send(result);
                if failed {
                    debug!("pty write failed, writer thread stopping");
                    break;
                }
            }
            debug!("pty writer thread exiting");
        })
        .map(|_| ())
        .map_err(|e| SessionError::Spawn(format!("failed to start writer thread: {e}")))
}

impl HostActor {
    async fn run(mut self) {
        debug!(pid = ?self.pid, "pty actor started");
        while let Some(command) = self.receiver.recv().await {
            match command {
                HostCommand::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                HostCommand::Close { respond_to } => {
                    let _ = respond_to.send(self.handle_close());
                    break;
                }
            }
        }
        // Dropping the master hangs up the terminal
        debug!(pid = ?self.pid, "pty actor shutting down");
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), SessionError> {
        debug!(rows, cols, "resizing pty");
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn handle_close(&mut self) -> Result<(), SessionError> {
        self.closing.store(true, Ordering::Release);

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, kill, killpg};
            use nix::unistd::Pid;

            // The child leads its own session; take its whole group so no
            // descendant keeps the slave open
            let pid = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(pid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    debug!(error = %e, "failed to signal pty process group");
                }
            }
            return match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(SessionError::CloseFailed(e.to_string())),
            };
        }

        match self.killer.kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::CloseFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::Session;

    async fn read_all(session: &Session) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(10), session.read(&mut buf))
                .await
                .expect("timed out reading session output")
                .unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn command(init_command: &str) -> SessionConfig {
        SessionConfig {
            init_command: init_command.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn runs_init_command() {
        let session = Session::connect(command("echo hi")).await.unwrap();
        let output = read_all(&session).await;
        assert!(output.contains("hi"), "output: {output:?}");

        session.wait().await.unwrap();
        assert_eq!(session.exit_code(), 0);
        assert!(session.has_exited());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let session = Session::connect(command("exit 3")).await.unwrap();
        let err = session.wait().await.unwrap_err();
        assert!(matches!(err, SessionError::Exit { code: 3, .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(session.exit_code(), 3);
    }

    #[tokio::test]
    async fn missing_shell_fails_to_spawn() {
        let config = SessionConfig {
            shell: "/nonexistent/shell".into(),
            ..Default::default()
        };
        let result = Session::connect(config).await;
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_kills() {
        let session = Session::connect(command("sleep 30")).await.unwrap();
        assert_eq!(session.exit_code(), -1);

        session.close().await.unwrap();
        session.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::Killed)));
        assert!(matches!(
            session.write(b"x").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_not_blocked_by_full_input() {
        // Raw mode without echo and a reader that never reads: the PTY input
        // buffer fills and the write below blocks
        let session = Arc::new(
            Session::connect(command("stty raw -echo; sleep 30"))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;

        let writer = session.clone();
        let flood = tokio::spawn(async move { writer.write(&vec![b'x'; 1 << 20]).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!flood.is_finished(), "write should still be blocked");

        tokio::time::timeout(Duration::from_secs(5), session.close())
            .await
            .expect("close stalled behind a blocked write")
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::Killed)));

        let write_result = tokio::time::timeout(Duration::from_secs(5), flood)
            .await
            .expect("blocked write never returned")
            .unwrap();
        assert!(write_result.is_err());
    }

    #[tokio::test]
    async fn signal_exit_is_reported() {
        let session = Session::connect(command("kill -9 $$")).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            SessionError::Exit { code, message } => {
                assert_eq!(code, 1);
                assert!(message.starts_with("signal: "), "message: {message:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn environment_is_applied() {
        let mut config = command("echo \"$FOO:$TERM\"");
        config.environment.insert("FOO".into(), "bar".into());
        let session = Session::connect(config).await.unwrap();
        let output = read_all(&session).await;
        assert!(output.contains("bar:xterm"), "output: {output:?}");
    }

    #[tokio::test]
    async fn workdir_is_applied() {
        let mut config = command("pwd");
        config.workdir = "/".into();
        let session = Session::connect(config).await.unwrap();
        let output = read_all(&session).await;
        assert!(output.lines().any(|l| l.trim() == "/"), "output: {output:?}");
    }

    #[tokio::test]
    async fn interactive_input() {
        let session = Session::connect(SessionConfig::default()).await.unwrap();
        session.write(b"echo ready\nexit 0\n").await.unwrap();
        let output = read_all(&session).await;
        assert!(output.contains("ready"), "output: {output:?}");
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn resize_changes_geometry() {
        let session = Session::connect(command("sleep 1; stty size")).await.unwrap();
        session.resize(40, 120).await.unwrap();
        let output = read_all(&session).await;
        assert!(output.contains("40 120"), "output: {output:?}");
    }
}

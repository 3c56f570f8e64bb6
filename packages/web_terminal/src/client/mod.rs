//! Terminal client: dial the server, run the handshake, relay local I/O.

mod endpoint;
mod error;
mod session;
#[cfg(unix)]
mod terminal;

pub use endpoint::Endpoint;
pub use error::ClientError;
pub use session::{ClientInput, SessionEnd, run_session};

use terminal_protocol::ConnectRequest;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

use crate::config::ClientConfig;

/// Socket returned by [`dial`]
pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ctrl-]
#[cfg(unix)]
const DETACH_BYTE: u8 = 0x1D;

/// Connect frame for `config`. A configured image selects the container driver.
/// Credentials travel in the upgrade request, never in the frame.
pub fn connect_request(config: &ClientConfig) -> ConnectRequest {
    let driver = if !config.image.is_empty() {
        "docker".to_string()
    } else {
        config.driver.clone()
    };
    ConnectRequest {
        driver,
        shell: config.shell.clone(),
        environment: config.environment.clone(),
        workdir: config.workdir.clone(),
        user: config.user.clone(),
        init_command: config.init_command.clone(),
        image: config.image.clone(),
        username: String::new(),
        password: String::new(),
    }
}

/// Open the WebSocket, bounded by the configured connect timeout
pub async fn dial(config: &ClientConfig) -> Result<ClientSocket, ClientError> {
    let endpoint = Endpoint::resolve(&config.server, &config.username, &config.password)?;
    let request = endpoint.request()?;
    info!(url = %endpoint.url, auth = endpoint.credentials.is_some(), "connecting");

    let (ws, _response) =
        tokio::time::timeout(config.connect_timeout(), tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout(endpoint.url.clone()))?
            .map_err(ClientError::from_dial)?;
    Ok(ws)
}

/// Run an interactive (or piped) session against the server in `config`
#[cfg(unix)]
pub async fn run(config: ClientConfig) -> Result<SessionEnd, ClientError> {
    use std::io::IsTerminal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    let ws = dial(&config).await?;
    let request = connect_request(&config);

    let interactive = std::io::stdin().is_terminal();
    let (input_tx, input_rx) = mpsc::channel::<ClientInput>(64);

    let guard = interactive.then(terminal::RawModeGuard::enter);
    let mut resize_task = None;
    if interactive {
        // Queued now, sent right after the connect ack
        if let Ok((rows, cols)) = terminal::terminal_size() {
            let _ = input_tx.send(ClientInput::Resize { rows, cols }).await;
        }
        let mut sigwinch =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;
        let resize_tx = input_tx.clone();
        resize_task = Some(tokio::spawn(async move {
            while sigwinch.recv().await.is_some() {
                let Ok((rows, cols)) = terminal::terminal_size() else {
                    continue;
                };
                if resize_tx
                    .send(ClientInput::Resize { rows, cols })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    let stdin_shutdown = Arc::new(AtomicBool::new(false));
    spawn_stdin_reader(input_tx, interactive, stdin_shutdown.clone());

    let result = run_session(ws, request, input_rx, tokio::io::stdout()).await;

    stdin_shutdown.store(true, Ordering::Relaxed);
    if let Some(task) = resize_task {
        task.abort();
    }
    drop(guard);
    if matches!(result, Ok(SessionEnd::Detached)) {
        eprintln!("\r\n[terminal: detached]");
    }
    result
}

/// Blocking stdin reader. Polls so it notices `shutdown` without input.
#[cfg(unix)]
fn spawn_stdin_reader(
    tx: tokio::sync::mpsc::Sender<ClientInput>,
    detect_detach: bool,
    shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::Ordering;

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();
        let mut buf = [0u8; 4096];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let mut pfd = nix::libc::pollfd {
                fd: stdin_fd,
                events: nix::libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { nix::libc::poll(&mut pfd, 1, 100) };
            if ret <= 0 {
                continue;
            }
            let mut handle = stdin.lock();
            match handle.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(ClientInput::Eof);
                    break;
                }
                Ok(n) => {
                    drop(handle);
                    let data = &buf[..n];
                    let detach_at = if detect_detach {
                        data.iter().position(|&b| b == DETACH_BYTE)
                    } else {
                        None
                    };
                    if let Some(pos) = detach_at {
                        if pos > 0 {
                            let _ = tx.blocking_send(ClientInput::Data(data[..pos].to_vec()));
                        }
                        let _ = tx.blocking_send(ClientInput::Detach);
                        break;
                    }
                    if tx.blocking_send(ClientInput::Data(data.to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "stdin read failed");
                    let _ = tx.blocking_send(ClientInput::Eof);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_connect_request_from_config() {
        let config = ClientConfig {
            shell: "/bin/bash".into(),
            workdir: "/tmp".into(),
            init_command: "echo hi".into(),
            environment: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            username: "admin".into(),
            password: "secret".into(),
            ..Default::default()
        };
        let req = connect_request(&config);
        assert_eq!(req.shell, "/bin/bash");
        assert_eq!(req.workdir, "/tmp");
        assert_eq!(req.init_command, "echo hi");
        assert_eq!(req.environment.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(req.driver, "");
        assert!(req.username.is_empty());
        assert!(req.password.is_empty());
    }

    #[test]
    fn test_image_forces_container_driver() {
        let config = ClientConfig {
            driver: "host".into(),
            image: "alpine:3".into(),
            ..Default::default()
        };
        let req = connect_request(&config);
        assert_eq!(req.driver, "docker");
        assert_eq!(req.image, "alpine:3");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            server: format!("ws://{addr}/ws"),
            ..Default::default()
        };
        let err = dial(&config).await.unwrap_err();
        assert!(matches!(err, ClientError::Dial(_)), "got {err:?}");
    }
}

//! Container backend: a throwaway Docker container with a TTY.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    RemoveContainerOptions, ResizeContainerTtyOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::{CloseGuard, ExitOutcome, ExitWatch, OutputQueue};

/// Handle to a running container
pub struct ContainerSession {
    docker: Docker,
    id: String,
    input: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    output: OutputQueue,
    exit: ExitWatch,
    guard: CloseGuard,
    closing: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

/// Create-container body for a session
pub(crate) fn container_config(config: &SessionConfig) -> Config<String> {
    let env = config
        .environment_overrides()
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    Config {
        image: Some(config.image().to_string()),
        cmd: Some(config.command_line()),
        env: Some(env),
        working_dir: (!config.workdir.is_empty()).then(|| config.workdir.clone()),
        user: (!config.user.is_empty()).then(|| config.user.clone()),
        tty: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

impl ContainerSession {
    pub(crate) async fn start(config: &SessionConfig) -> Result<Self, SessionError> {
        let docker = Docker::connect_with_local_defaults()?;
        let name = format!("terminal-{}", Uuid::new_v4());

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config(config),
            )
            .await?;
        let id = created.id;
        for warning in &created.warnings {
            warn!(container = %name, warning = %warning, "docker create warning");
        }
        info!(container = %name, image = %config.image(), "container created");

        match Self::attach_and_start(docker.clone(), id.clone(), config).await {
            Ok(session) => Ok(session),
            Err(e) => {
                // Don't leak a container that never started
                if let Err(remove_err) = remove(&docker, &id).await {
                    warn!(container = %id, error = %remove_err, "failed to remove container");
                }
                Err(e)
            }
        }
    }

    async fn attach_and_start(
        docker: Docker,
        id: String,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let AttachContainerResults {
            output: mut stream,
            input,
        } = docker
            .attach_container(
                &id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await?;

        docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;

        if let Err(e) = docker
            .resize_container_tty(
                &id,
                ResizeContainerTtyOptions {
                    width: config.cols,
                    height: config.rows,
                },
            )
            .await
        {
            debug!(container = %id, error = %e, "initial tty resize failed");
        }

        let (output_tx, output) = OutputQueue::channel();
        let pump_id = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        if output_tx.send(chunk.into_bytes().to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(container = %pump_id, error = %e, "attach stream ended");
                        break;
                    }
                }
            }
        });

        let (exit_tx, exit) = ExitWatch::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let wait_closing = closing.clone();
        let wait_docker = docker.clone();
        let wait_id = id.clone();
        tokio::spawn(async move {
            let mut wait = std::pin::pin!(wait_docker.wait_container(
                &wait_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            ));
            let outcome = match wait.next().await {
                Some(Ok(response)) => ExitOutcome::Code(response.status_code as i32),
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                    ExitOutcome::Code(code as i32)
                }
                Some(Err(e)) => ExitOutcome::Failed(e.to_string()),
                None => ExitOutcome::Failed("container wait ended without a status".into()),
            };
            let outcome = if wait_closing.load(Ordering::Acquire) {
                ExitOutcome::Killed
            } else {
                outcome
            };
            debug!(container = %wait_id, outcome = ?outcome, "container exited");
            exit_tx.send_replace(Some(outcome));
        });

        info!(container = %id, "container started");
        Ok(ContainerSession {
            docker,
            id,
            input: Mutex::new(input),
            output,
            exit,
            guard: CloseGuard::default(),
            closing,
            pump,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
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
        let mut input = self.input.lock().await;
        input
            .write_all(data)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        input
            .flush()
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    pub(crate) async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if self.guard.is_closed() {
            return Err(SessionError::Closed);
        }
        self.docker
            .resize_container_tty(
                &self.id,
                ResizeContainerTtyOptions {
                    width: cols,
                    height: rows,
                },
            )
            .await
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    pub(crate) async fn close(&self) -> Result<(), SessionError> {
        if !self.guard.begin() {
            return Ok(());
        }
        self.closing.store(true, Ordering::Release);

        if let Err(e) = self.input.lock().await.shutdown().await {
            debug!(container = %self.id, error = %e, "stdin shutdown failed");
        }
        let result = remove(&self.docker, &self.id)
            .await
            .map_err(|e| SessionError::CloseFailed(e.to_string()));
        self.pump.abort();
        info!(container = %self.id, "container removed");
        result
    }
}

async fn remove(docker: &Docker, id: &str) -> Result<(), DockerError> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => Ok(()),
        Err(DockerError::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_session_fields() {
        let mut session = SessionConfig {
            shell: "/bin/bash".into(),
            init_command: "make test".into(),
            workdir: "/src".into(),
            user: "builder".into(),
            history_disabled: true,
            ..Default::default()
        };
        session.environment.insert("CI".into(), "1".into());

        let config = container_config(&session);
        assert_eq!(config.image.as_deref(), Some("whatwewant/zmicro:v1"));
        assert_eq!(
            config.cmd,
            Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "make test".to_string()
            ])
        );
        assert_eq!(config.working_dir.as_deref(), Some("/src"));
        assert_eq!(config.user.as_deref(), Some("builder"));
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.open_stdin, Some(true));

        let env = config.env.unwrap();
        assert!(env.contains(&"CI=1".to_string()));
        assert!(env.contains(&"TERM=xterm".to_string()));
        assert!(env.contains(&"HISTFILE=/dev/null".to_string()));
    }

    #[test]
    fn empty_optional_fields_are_omitted() {
        let config = container_config(&SessionConfig {
            image: String::new(),
            ..Default::default()
        });
        assert_eq!(config.image.as_deref(), Some("whatwewant/zmicro:v1"));
        assert_eq!(config.working_dir, None);
        assert_eq!(config.user, None);
        assert_eq!(config.cmd, Some(vec!["/bin/sh".to_string()]));
    }
}

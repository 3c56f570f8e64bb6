use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::config::{ClientOverrides, ServerOverrides};

#[derive(Parser)]
#[command(name = "terminal")]
#[command(about = "Remote terminal sessions over WebSocket")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve terminal sessions
    Server(ServerArgs),

    /// Connect to a terminal server
    Client(ClientArgs),
}

#[derive(Parser)]
pub struct ServerArgs {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (default 8838)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(short = 'b', long)]
    pub host: Option<String>,

    /// WebSocket endpoint path (default /ws)
    #[arg(long)]
    pub path: Option<String>,

    /// Shell to start for each session
    #[arg(short, long)]
    pub shell: Option<String>,

    /// Command run through `<shell> -c`
    #[arg(long)]
    pub init_command: Option<String>,

    /// Basic auth username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Basic auth password
    #[arg(long)]
    pub password: Option<String>,

    /// Session driver: host or docker
    #[arg(long)]
    pub driver: Option<String>,

    /// Image for the docker driver
    #[arg(long)]
    pub driver_image: Option<String>,

    /// Set HISTFILE=/dev/null in sessions
    #[arg(long)]
    pub disable_history: bool,

    /// Ignore keyboard input from clients
    #[arg(long)]
    pub read_only: bool,
}

impl ServerArgs {
    pub fn overrides(&self) -> ServerOverrides {
        ServerOverrides {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            shell: self.shell.clone(),
            driver: self.driver.clone(),
            driver_image: self.driver_image.clone(),
            init_command: self.init_command.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            history_disabled: self.disable_history.then_some(true),
            read_only: self.read_only.then_some(true),
        }
    }
}

#[derive(Parser)]
pub struct ClientArgs {
    /// Server URL, e.g. ws://user:pass@127.0.0.1:8838/ws
    pub server: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Basic auth username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Basic auth password
    #[arg(long)]
    pub password: Option<String>,

    /// Driver to request from the server
    #[arg(long)]
    pub driver: Option<String>,

    /// Remote shell
    #[arg(short, long)]
    pub shell: Option<String>,

    /// Remote working directory
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Remote user
    #[arg(long)]
    pub user: Option<String>,

    /// Run in a container from this image
    #[arg(short, long)]
    pub image: Option<String>,

    /// Run this command instead of an interactive shell
    #[arg(short, long, conflicts_with = "scriptfile")]
    pub command: Option<String>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// File of KEY=VALUE lines
    #[arg(long)]
    pub envfile: Option<PathBuf>,

    /// Script whose contents become the command
    #[arg(long)]
    pub scriptfile: Option<PathBuf>,
}

impl ClientArgs {
    /// Resolve files and flags into config overrides. `--env` wins over
    /// `--envfile`.
    pub fn overrides(&self) -> Result<ClientOverrides> {
        let mut environment = match &self.envfile {
            Some(path) => read_env_file(path)?,
            None => BTreeMap::new(),
        };
        environment.extend(self.env.iter().cloned());

        let init_command = match (&self.command, &self.scriptfile) {
            (Some(command), _) => Some(command.clone()),
            (None, Some(path)) => Some(read_script_file(path)?),
            (None, None) => None,
        };

        Ok(ClientOverrides {
            server: self.server.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            driver: self.driver.clone(),
            shell: self.shell.clone(),
            workdir: self.workdir.clone(),
            user: self.user.clone(),
            image: self.image.clone(),
            init_command,
            environment,
        })
    }
}

/// Parse `KEY=VALUE`. Only the first `=` separates; the value may be empty.
pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Parse env file contents: blank lines and `#` comments are skipped.
pub fn parse_env_file(contents: &str) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_env_pair(line) {
            Ok((key, value)) => {
                env.insert(key, value);
            }
            Err(e) => bail!("line {}: {}", index + 1, e),
        }
    }
    Ok(env)
}

pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;
    parse_env_file(&contents).with_context(|| format!("invalid env file {}", path.display()))
}

pub fn read_script_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script file {}", path.display()))
}

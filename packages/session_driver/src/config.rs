use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_IMAGE: &str = "whatwewant/zmicro:v1";

/// Which backend runs the session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Driver {
    /// A process on this machine attached to a PTY
    #[default]
    Host,
    /// A fresh Docker container with a TTY
    Container,
}

impl Driver {
    /// Resolve a driver by name. Unknown and empty names are rejected rather
    /// than falling back to the host.
    pub fn from_name(name: &str) -> Result<Self, SessionError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Driver::Host),
            "docker" | "container" => Ok(Driver::Container),
            _ => Err(SessionError::UnknownDriver(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Driver::Host => "host",
            Driver::Container => "docker",
        }
    }
}

impl FromStr for Driver {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Driver::from_name(s)
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to start a session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub driver: Driver,
    pub shell: String,
    /// Passed to the shell as `-c <init_command>` when non-empty
    pub init_command: String,
    pub environment: BTreeMap<String, String>,
    /// Working directory, empty for the backend default
    pub workdir: String,
    /// User to run as, empty for the backend default
    pub user: String,
    /// Container image, ignored by the host driver
    pub image: String,
    /// Force `HISTFILE=/dev/null`
    pub history_disabled: bool,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            driver: Driver::Host,
            shell: DEFAULT_SHELL.to_string(),
            init_command: String::new(),
            environment: BTreeMap::new(),
            workdir: String::new(),
            user: String::new(),
            image: DEFAULT_IMAGE.to_string(),
            history_disabled: false,
            rows: 24,
            cols: 80,
        }
    }
}

impl SessionConfig {
    pub(crate) fn shell(&self) -> &str {
        if self.shell.is_empty() {
            DEFAULT_SHELL
        } else {
            &self.shell
        }
    }

    pub(crate) fn image(&self) -> &str {
        if self.image.is_empty() {
            DEFAULT_IMAGE
        } else {
            &self.image
        }
    }

    /// Program and arguments
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = vec![self.shell().to_string()];
        if !self.init_command.is_empty() {
            argv.push("-c".to_string());
            argv.push(self.init_command.clone());
        }
        argv
    }

    /// Variables set on top of whatever the backend inherits. Configured
    /// values win over `TERM`/`HISTFILE`.
    pub fn environment_overrides(&self) -> Vec<(String, String)> {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "xterm".to_string());
        if self.history_disabled {
            env.insert("HISTFILE".to_string(), "/dev/null".to_string());
        }
        for (key, value) in &self.environment {
            env.insert(key.clone(), value.clone());
        }
        env.into_iter().collect()
    }
}

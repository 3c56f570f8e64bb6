use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

// =============================================================================
// Layering: struct defaults → config file (TOML) → env vars → CLI flags
// =============================================================================
//
//   config.toml:     shell = "/bin/bash"
//   env var:         TERMINAL_SHELL=/bin/bash          (server)
//                    TERMINAL_CLIENT_SHELL=/bin/bash   (client)
//   flag:            --shell /bin/bash

pub const SERVER_ENV_PREFIX: &str = "TERMINAL_";
pub const CLIENT_ENV_PREFIX: &str = "TERMINAL_CLIENT_";

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// WebSocket endpoint
    pub path: String,
    pub shell: String,
    /// `host` or `docker`
    pub driver: String,
    pub driver_image: String,
    pub init_command: String,
    /// Basic auth is enforced when both username and password are set
    pub username: String,
    pub password: String,
    pub history_disabled: bool,
    /// Drop all keyboard input from clients
    pub read_only: bool,
    pub heartbeat_interval_ms: u64,
    /// Pause between the Exit frame and closing the connection
    pub exit_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8838,
            path: "/ws".to_string(),
            shell: session_driver::DEFAULT_SHELL.to_string(),
            driver: "host".to_string(),
            driver_image: session_driver::DEFAULT_IMAGE.to_string(),
            init_command: String::new(),
            username: String::new(),
            password: String::new(),
            history_disabled: false,
            read_only: false,
            heartbeat_interval_ms: 13_000,
            exit_grace_ms: 1_000,
        }
    }
}

impl ServerConfig {
    pub fn auth_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    /// Reject settings the router or driver layer cannot serve
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            bail!("websocket path must start with '/': {:?}", self.path);
        }
        if self.path == "/" || self.path == "/health" {
            bail!("websocket path {:?} collides with a built-in route", self.path);
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        session_driver::Driver::from_name(&self.driver)
            .with_context(|| format!("invalid default driver {:?}", self.driver))?;
        Ok(())
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Build the server figment: defaults → `file` → `TERMINAL_*` → `overrides`.
pub fn server_figment(file: Option<&Path>, overrides: &ServerOverrides) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }
    figment
        .merge(
            // TERMINAL_CLIENT_* belongs to the client
            Env::prefixed(SERVER_ENV_PREFIX)
                .filter(|key| !key.as_str().to_ascii_lowercase().starts_with("client_")),
        )
        .merge(Serialized::defaults(overrides))
}

pub fn load_server_config(file: Option<&Path>, overrides: &ServerOverrides) -> Result<ServerConfig> {
    let config: ServerConfig = server_figment(file, overrides)
        .extract()
        .context("failed to load server configuration")?;
    config.validate()?;
    Ok(config)
}

/// Client configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// `ws://[user:pass@]host:port/path`
    pub server: String,
    pub username: String,
    pub password: String,
    /// Driver to request; forced to `docker` when an image is set
    pub driver: String,
    pub shell: String,
    pub workdir: String,
    pub user: String,
    pub image: String,
    pub init_command: String,
    pub environment: BTreeMap<String, String>,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:8838/ws".to_string(),
            username: String::new(),
            password: String::new(),
            driver: String::new(),
            shell: String::new(),
            workdir: String::new(),
            user: String::new(),
            image: String::new(),
            init_command: String::new(),
            environment: BTreeMap::new(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ClientOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_command: Option<String>,
    /// Merged key by key over lower layers
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Build the client figment: defaults → `file` → `TERMINAL_CLIENT_*` → `overrides`.
pub fn client_figment(file: Option<&Path>, overrides: &ClientOverrides) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));
    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }
    figment
        .merge(Env::prefixed(CLIENT_ENV_PREFIX))
        .merge(Serialized::defaults(overrides))
}

pub fn load_client_config(file: Option<&Path>, overrides: &ClientOverrides) -> Result<ClientConfig> {
    client_figment(file, overrides)
        .extract()
        .context("failed to load client configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_defaults() {
        let d = ServerConfig::default();
        assert_eq!(d.port, 8838);
        assert_eq!(d.path, "/ws");
        assert_eq!(d.shell, "/bin/sh");
        assert_eq!(d.driver, "host");
        assert_eq!(d.driver_image, "whatwewant/zmicro:v1");
        assert_eq!(d.heartbeat_interval(), Duration::from_secs(13));
        assert_eq!(d.exit_grace(), Duration::from_secs(1));
        assert!(!d.auth_enabled());
        d.validate().unwrap();
    }

    #[test]
    fn test_client_defaults() {
        let d = ClientConfig::default();
        assert_eq!(d.server, "ws://127.0.0.1:8838/ws");
        assert_eq!(d.connect_timeout(), Duration::from_secs(10));
        assert!(d.environment.is_empty());
    }

    #[test]
    fn test_auth_needs_both_credentials() {
        let mut c = ServerConfig {
            username: "admin".into(),
            ..Default::default()
        };
        assert!(!c.auth_enabled());
        c.password = "secret".into();
        assert!(c.auth_enabled());
    }

    // ── validate ────────────────────────────────────────────────────────

    #[test]
    fn test_validate_rejects_bad_paths() {
        for path in ["ws", "/", "/health"] {
            let c = ServerConfig {
                path: path.into(),
                ..Default::default()
            };
            assert!(c.validate().is_err(), "path {path:?} should be rejected");
        }
    }

    #[test]
    fn test_validate_rejects_unknown_driver() {
        let c = ServerConfig {
            driver: "ssh".into(),
            ..Default::default()
        };
        let err = c.validate().unwrap_err();
        assert!(format!("{err:#}").contains("unknown driver"));
    }

    // ── layering ────────────────────────────────────────────────────────

    #[test]
    fn test_toml_file_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "port = 9000\nshell = \"/bin/bash\"\nread_only = true\n").unwrap();

        let c = load_server_config(Some(&path), &ServerOverrides::default()).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.shell, "/bin/bash");
        assert!(c.read_only);
        assert_eq!(c.path, "/ws");
    }

    #[test]
    fn test_cli_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "port = 9000\ndriver = \"docker\"\n").unwrap();

        let overrides = ServerOverrides {
            port: Some(9100),
            ..Default::default()
        };
        let c = load_server_config(Some(&path), &overrides).unwrap();
        assert_eq!(c.port, 9100);
        // Unset overrides leave the file value alone
        assert_eq!(c.driver, "docker");
    }

    #[test]
    fn test_missing_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let c = load_server_config(
            Some(&tmp.path().join("absent.toml")),
            &ServerOverrides::default(),
        )
        .unwrap();
        assert_eq!(c.port, 8838);
    }

    #[test]
    fn test_client_environment_merges() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("client.toml");
        std::fs::write(
            &path,
            "server = \"ws://example:1/ws\"\n[environment]\nA = \"1\"\nB = \"2\"\n",
        )
        .unwrap();

        let mut overrides = ClientOverrides::default();
        overrides.environment.insert("B".into(), "3".into());
        overrides.environment.insert("C".into(), "4".into());

        let c = load_client_config(Some(&path), &overrides).unwrap();
        assert_eq!(c.server, "ws://example:1/ws");
        assert_eq!(c.environment.get("A").map(String::as_str), Some("1"));
        assert_eq!(c.environment.get("B").map(String::as_str), Some("3"));
        assert_eq!(c.environment.get("C").map(String::as_str), Some("4"));
    }
}

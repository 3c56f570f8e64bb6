use session_driver::{Driver, SessionConfig, SessionError};
use terminal_protocol::ConnectRequest;

use crate::config::ServerConfig;
use crate::server::query::ConnectQuery;

/// Per-connection behaviour that is not part of the driver config
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Drop Key frames
    pub read_only: bool,
    /// Keep the session running after the peer disconnects
    pub wait_until_finished: bool,
}

/// Effective session parameters for a Connect frame.
///
/// Each field is taken from the frame if non-empty, else from the URL query,
/// else from the server configuration. Environment variables from the query
/// and the frame are merged, frame values winning.
pub fn resolve_session(
    request: &ConnectRequest,
    query: &ConnectQuery,
    config: &ServerConfig,
) -> Result<(SessionConfig, ConnectOptions), SessionError> {
    let driver = Driver::from_name(pick(
        &request.driver,
        query.driver.as_deref(),
        &config.driver,
    ))?;

    let mut environment = query.environment_map();
    environment.extend(
        request
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let session = SessionConfig {
        driver,
        shell: pick(&request.shell, query.shell.as_deref(), &config.shell).to_string(),
        init_command: pick(
            &request.init_command,
            query.init_command.as_deref(),
            &config.init_command,
        )
        .to_string(),
        environment,
        workdir: pick(&request.workdir, query.workdir.as_deref(), "").to_string(),
        user: pick(&request.user, query.user.as_deref(), "").to_string(),
        image: pick(&request.image, query.image.as_deref(), &config.driver_image).to_string(),
        history_disabled: config.history_disabled,
        ..Default::default()
    };

    let options = ConnectOptions {
        read_only: config.read_only || query.read_only(),
        wait_until_finished: query.wait_until_finished(),
    };
    Ok((session, options))
}

fn pick<'a>(frame: &'a str, query: Option<&'a str>, default: &'a str) -> &'a str {
    if !frame.is_empty() {
        return frame;
    }
    match query {
        Some(q) if !q.is_empty() => q,
        _ => default,
    }
}

//! Server address resolution and the upgrade request.

use data_encoding::BASE64;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use crate::client::ClientError;

const DEFAULT_PATH: &str = "/ws";

/// Where to dial and with which credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// `ws://` or `wss://` url without userinfo
    pub url: String,
    pub credentials: Option<(String, String)>,
}

impl Endpoint {
    /// Normalise `server` and pick credentials. Explicit `username`/`password`
    /// win over ones embedded in the url.
    pub fn resolve(server: &str, username: &str, password: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidUrl {
            url: server.to_string(),
            reason: reason.to_string(),
        };

        let server = server.trim();
        let (scheme, rest) = match server.split_once("://") {
            Some(("ws" | "http", rest)) => ("ws", rest),
            Some(("wss" | "https", rest)) => ("wss", rest),
            Some((other, _)) => return Err(invalid(&format!("unsupported scheme {other:?}"))),
            None => ("ws", server),
        };

        // The authority ends at the first path, query or fragment delimiter
        let (authority, path) = match rest.find(['/', '?', '#']) {
            Some(idx) if rest[idx..].starts_with('/') => (&rest[..idx], rest[idx..].to_string()),
            Some(idx) => (&rest[..idx], format!("{DEFAULT_PATH}{}", &rest[idx..])),
            None => (rest, DEFAULT_PATH.to_string()),
        };
        let (userinfo, host) = match authority.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo), host),
            None => (None, authority),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let embedded = match userinfo {
            Some(info) => {
                let (user, pass) = info.split_once(':').unwrap_or((info, ""));
                let decode = |part: &str| {
                    percent_decode(part).ok_or_else(|| invalid("userinfo is not valid UTF-8"))
                };
                Some((decode(user)?, decode(pass)?))
            }
            None => None,
        };
        let credentials = if !username.is_empty() || !password.is_empty() {
            Some((username.to_string(), password.to_string()))
        } else {
            embedded.filter(|(user, pass)| !user.is_empty() || !pass.is_empty())
        };

        Ok(Self {
            url: format!("{scheme}://{host}{path}"),
            credentials,
        })
    }

    /// Upgrade request carrying a Basic `Authorization` header when credentials are set
    pub fn request(&self) -> Result<Request, ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        if let Some((user, pass)) = &self.credentials {
            let token = BASE64.encode(format!("{user}:{pass}").as_bytes());
            let value = HeaderValue::from_str(&format!("Basic {token}")).map_err(|e| {
                ClientError::InvalidUrl {
                    url: self.url.clone(),
                    reason: e.to_string(),
                }
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// Decode `%XX` escapes. Malformed escapes are kept as written; `None` when
/// the decoded bytes are not UTF-8.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |b: u8| (b as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}

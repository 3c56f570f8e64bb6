use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

/// Session parameters from the WebSocket URL query string.
///
/// `environment` may repeat: `?environment=A=1&environment=B=2`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectQuery {
    pub init_command: Option<String>,
    pub read_only: Option<String>,
    pub shell: Option<String>,
    pub driver: Option<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub image: Option<String>,
    pub environment: Vec<String>,
    pub wait_until_finished: Option<String>,
}

impl ConnectQuery {
    pub fn read_only(&self) -> bool {
        is_truthy(self.read_only.as_deref())
    }

    pub fn wait_until_finished(&self) -> bool {
        is_truthy(self.wait_until_finished.as_deref())
    }

    pub fn environment_map(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for entry in &self.environment {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    env.insert(key.to_string(), value.to_string());
                }
                _ => warn!(entry = %entry, "ignoring malformed environment query parameter"),
            }
        }
        env
    }
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::FromRequestParts;
    use axum::http::Request;
    use axum_extra::extract::Query;

    async fn parse(uri: &str) -> ConnectQuery {
        let (mut parts, ()) = Request::builder().uri(uri).body(()).unwrap().into_parts();
        let Query(query) = Query::<ConnectQuery>::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        query
    }

    #[tokio::test]
    async fn parses_all_fields() {
        let q = parse(
            "/ws?shell=zsh&driver=docker&workdir=%2Ftmp&user=root&image=alpine\
             &init_command=ls%20-la&read_only=true&wait_until_finished=1",
        )
        .await;
        assert_eq!(q.shell.as_deref(), Some("zsh"));
        assert_eq!(q.driver.as_deref(), Some("docker"));
        assert_eq!(q.workdir.as_deref(), Some("/tmp"));
        assert_eq!(q.user.as_deref(), Some("root"));
        assert_eq!(q.image.as_deref(), Some("alpine"));
        assert_eq!(q.init_command.as_deref(), Some("ls -la"));
        assert!(q.read_only());
        assert!(q.wait_until_finished());
    }

    #[tokio::test]
    async fn repeated_environment() {
        let q = parse("/ws?environment=A%3D1&environment=B%3Dx%3Dy&environment=bad").await;
        let env = q.environment_map();
        assert_eq!(env.len(), 2);
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
    }

    #[tokio::test]
    async fn empty_query() {
        let q = parse("/ws").await;
        assert_eq!(q, ConnectQuery::default());
        assert!(!q.read_only());
        assert!(q.environment_map().is_empty());
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(is_truthy(Some(v)), "{v}");
        }
        for v in ["", "0", "false", "off", "nope"] {
            assert!(!is_truthy(Some(v)), "{v}");
        }
        assert!(!is_truthy(None));
    }
}

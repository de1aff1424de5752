//! Session identity and terminal endpoint addressing.
//!
//! A terminal connection is addressed by its [`SessionKey`] encoded in the
//! request path:
//!
//! ```text
//! /api/v1/instances/{target_id}/component/{component}/terminal?lines={depth}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{ProtocolError, Result};

/// History depth requested when the query does not name one.
pub const DEFAULT_HISTORY_DEPTH: usize = 500;

const PATH_PREFIX: [&str; 3] = ["api", "v1", "instances"];

/// Process roles that can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "napcat")]
    Napcat,
    #[serde(rename = "napcat-ada")]
    NapcatAdapter,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Main, Component::Napcat, Component::NapcatAdapter];

    /// Name used on the wire and in session ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Main => "main",
            Component::Napcat => "napcat",
            Component::NapcatAdapter => "napcat-ada",
        }
    }

    /// Human readable name shown in banners.
    pub fn display_name(&self) -> &'static str {
        match self {
            Component::Main => "MaiBot",
            Component::Napcat => "NapCat",
            Component::NapcatAdapter => "MaiBot-Napcat-Adapter",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = ProtocolError;

    /// Accepts wire names and display names, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self> {
        Component::ALL
            .into_iter()
            .find(|c| s.eq_ignore_ascii_case(c.as_str()) || s.eq_ignore_ascii_case(c.display_name()))
            .ok_or_else(|| ProtocolError::UnknownComponent(s.to_string()))
    }
}

/// Returns true if `id` is usable as a target id inside a URL path segment.
pub fn is_valid_target_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && id != "."
        && id != ".."
}

/// Identity of a relay session: one managed target plus one process role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub target_id: String,
    pub component: Component,
}

impl SessionKey {
    pub fn new(target_id: impl Into<String>, component: Component) -> Self {
        Self {
            target_id: target_id.into(),
            component,
        }
    }

    /// Flat identifier, `{target_id}_{component}`.
    pub fn session_id(&self) -> String {
        format!("{}_{}", self.target_id, self.component)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target_id, self.component)
    }
}

/// A parsed terminal endpoint: session key plus requested history depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEndpoint {
    pub key: SessionKey,
    pub history_depth: usize,
}

impl TerminalEndpoint {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }

    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    /// Absolute path without the query.
    pub fn path(&self) -> String {
        format!(
            "/{}/{}/component/{}/terminal",
            PATH_PREFIX.join("/"),
            self.key.target_id,
            self.key.component
        )
    }

    /// Absolute path with the `lines` query.
    pub fn path_and_query(&self) -> String {
        format!("{}?lines={}", self.path(), self.history_depth)
    }

    /// Build a WebSocket URL against `base`. `http`/`https` bases are mapped
    /// to `ws`/`wss`.
    pub fn url(&self, base: &Url) -> Result<Url> {
        if !is_valid_target_id(&self.key.target_id) {
            return Err(ProtocolError::InvalidEndpoint(format!(
                "invalid target id: {:?}",
                self.key.target_id
            )));
        }
        let mut url = base.join(&self.path_and_query())?;
        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            "ws" | "wss" => None,
            other => {
                return Err(ProtocolError::InvalidEndpoint(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme).map_err(|_| {
                ProtocolError::InvalidEndpoint(format!("cannot switch scheme to {scheme}"))
            })?;
        }
        Ok(url)
    }

    /// Parse a request target such as the one in an HTTP upgrade request.
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` for a path of the wrong shape, a bad target id or a
    /// non-numeric `lines` query; `UnknownComponent` for an unknown role.
    pub fn parse(path_and_query: &str) -> Result<Self> {
        let base = Url::parse("ws://relay.invalid/")?;
        let url = base.join(path_and_query)?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let (target_id, component) = match segments.as_slice() {
            [a, b, c, target, "component", component, "terminal"]
                if [*a, *b, *c] == PATH_PREFIX =>
            {
                (*target, *component)
            }
            _ => {
                return Err(ProtocolError::InvalidEndpoint(format!(
                    "not a terminal path: {}",
                    url.path()
                )))
            }
        };

        if !is_valid_target_id(target_id) {
            return Err(ProtocolError::InvalidEndpoint(format!(
                "invalid target id: {target_id:?}"
            )));
        }
        let component: Component = component.parse()?;

        let mut history_depth = DEFAULT_HISTORY_DEPTH;
        for (name, value) in url.query_pairs() {
            if name == "lines" {
                history_depth = value.parse().map_err(|_| {
                    ProtocolError::InvalidEndpoint(format!("invalid lines value: {value:?}"))
                })?;
            }
        }

        Ok(Self {
            key: SessionKey::new(target_id, component),
            history_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_parse_wire_names() {
        assert_eq!("main".parse::<Component>().unwrap(), Component::Main);
        assert_eq!("napcat".parse::<Component>().unwrap(), Component::Napcat);
        assert_eq!(
            "napcat-ada".parse::<Component>().unwrap(),
            Component::NapcatAdapter
        );
    }

    #[test]
    fn test_component_parse_display_names() {
        assert_eq!("MaiBot".parse::<Component>().unwrap(), Component::Main);
        assert_eq!("nAPcAT".parse::<Component>().unwrap(), Component::Napcat);
        assert_eq!(
            "MaiBot-Napcat-Adapter".parse::<Component>().unwrap(),
            Component::NapcatAdapter
        );
    }

    #[test]
    fn test_component_parse_unknown() {
        let err = "worker".parse::<Component>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownComponent(_)));
    }

    #[test]
    fn test_component_serde_names() {
        let json = serde_json::to_string(&Component::NapcatAdapter).unwrap();
        assert_eq!(json, "\"napcat-ada\"");
    }

    #[test]
    fn test_session_id() {
        let key = SessionKey::new("bot-1", Component::Napcat);
        assert_eq!(key.session_id(), "bot-1_napcat");
        assert_eq!(key.to_string(), "bot-1/napcat");
    }

    #[test]
    fn test_target_id_validation() {
        assert!(is_valid_target_id("bot-1"));
        assert!(is_valid_target_id("a_b.c"));
        assert!(!is_valid_target_id(""));
        assert!(!is_valid_target_id(".."));
        assert!(!is_valid_target_id("a/b"));
        assert!(!is_valid_target_id("a b"));
    }

    #[test]
    fn test_path_and_query() {
        let endpoint = TerminalEndpoint::new(SessionKey::new("bot-1", Component::Main))
            .with_history_depth(100);
        assert_eq!(
            endpoint.path_and_query(),
            "/api/v1/instances/bot-1/component/main/terminal?lines=100"
        );
    }

    #[test]
    fn test_parse_round_trips_path() {
        let endpoint = TerminalEndpoint::new(SessionKey::new("bot-1", Component::NapcatAdapter))
            .with_history_depth(42);
        let parsed = TerminalEndpoint::parse(&endpoint.path_and_query()).unwrap();
        assert_eq!(parsed, endpoint);
    }

    #[test]
    fn test_parse_defaults_history_depth() {
        let parsed = TerminalEndpoint::parse("/api/v1/instances/x/component/main/terminal").unwrap();
        assert_eq!(parsed.history_depth, DEFAULT_HISTORY_DEPTH);
        assert_eq!(parsed.key, SessionKey::new("x", Component::Main));
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        let err = TerminalEndpoint::parse("/api/v1/instances/x/logs").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_component() {
        let err =
            TerminalEndpoint::parse("/api/v1/instances/x/component/worker/terminal").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownComponent(_)));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        let err = TerminalEndpoint::parse("/api/v1/instances/x/component/main/terminal?lines=many")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_url_maps_http_to_ws() {
        let base = Url::parse("http://127.0.0.1:23456").unwrap();
        let endpoint = TerminalEndpoint::new(SessionKey::new("bot-1", Component::Main));
        let url = endpoint.url(&base).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:23456/api/v1/instances/bot-1/component/main/terminal?lines=500"
        );
    }

    #[test]
    fn test_url_keeps_wss() {
        let base = Url::parse("wss://relay.example.com/").unwrap();
        let endpoint = TerminalEndpoint::new(SessionKey::new("b", Component::Napcat));
        let url = endpoint.url(&base).unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_url_rejects_invalid_target() {
        let base = Url::parse("ws://localhost").unwrap();
        let endpoint = TerminalEndpoint::new(SessionKey::new("a/b", Component::Main));
        assert!(endpoint.url(&base).is_err());
    }
}

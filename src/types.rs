//! fallbranch/src/types.rs
//! Core data structures shared across the connection lifecycle pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::raw_conn::RawConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Java,
    Bedrock,
}

/// A parsed server domain pattern. Parsing happens once at config-load time
/// so the hot routing path never re-splits a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(String),
    /// Everything after the leading `*` (e.g. `*.example.com` -> `.example.com`,
    /// bare `*` -> `""`, which matches any domain).
    WildcardSuffix(String),
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Self {
        let lower = pattern.to_ascii_lowercase();
        match lower.strip_prefix('*') {
            Some(rest) => DomainPattern::WildcardSuffix(rest.to_string()),
            None => DomainPattern::Exact(lower),
        }
    }

    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Exact(pat) => pat.eq_ignore_ascii_case(domain),
            DomainPattern::WildcardSuffix(suffix) => {
                suffix.is_empty() || domain.to_ascii_lowercase().ends_with(suffix.as_str())
            }
        }
    }
}

/// One entry in a status response's `players.sample` list -- the hover
/// tooltip showing a handful of (fake or real) online player names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSample {
    pub name: String,
    pub id: String,
}

/// Template for the status response a Listener sends when no server matches a
/// Java status probe. `protocol_version` in the rendered JSON is filled in
/// from the client's own handshake, the rest is static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponseTemplate {
    pub version_name: String,
    pub max_players: i32,
    pub online_players: i32,
    pub description: serde_json::Value,
    pub favicon: Option<String>,
    #[serde(default)]
    pub sample: Vec<StatusSample>,
}

impl Default for StatusResponseTemplate {
    fn default() -> Self {
        StatusResponseTemplate {
            version_name: "fallbranch".to_string(),
            max_players: 20,
            online_players: 0,
            description: serde_json::json!({ "text": "A Fallbranch Proxy" }),
            favicon: None,
            sample: Vec::new(),
        }
    }
}

impl StatusResponseTemplate {
    pub fn render(&self, protocol_version: i32) -> String {
        let mut players = serde_json::json!({ "max": self.max_players, "online": self.online_players });
        if !self.sample.is_empty() {
            let sample: Vec<_> = self
                .sample
                .iter()
                .map(|s| serde_json::json!({ "name": s.name, "id": s.id }))
                .collect();
            players["sample"] = serde_json::Value::Array(sample);
        }
        let value = serde_json::json!({
            "version": { "name": self.version_name, "protocol": protocol_version },
            "players": players,
            "description": self.description,
            "favicon": self.favicon,
        });
        value.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Filled in from the owning `GatewayConfig` when the gateway binds,
    /// so a CPN worker handed only a `RawConn`/`ListenerConfig` can still
    /// stamp `ProcessedConn::gateway_id` for the isolation invariant.
    pub gateway_id: String,
    pub bind_address: String,
    pub protocol: Protocol,
    pub receive_proxy_protocol: bool,
    pub receive_real_ip: bool,
    pub server_not_found_message: String,
    pub status_response_template: StatusResponseTemplate,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub id: String,
    pub listeners: Vec<ListenerConfig>,
    pub server_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub domains: Vec<DomainPattern>,
    pub dial_address: String,
    pub dial_timeout: Duration,
    pub send_proxy_protocol: bool,
    pub dial_timeout_message: String,
    pub webhook_ids: Vec<String>,
}

impl ServerConfig {
    pub fn matches_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|p| p.matches(domain))
    }
}

/// The live routing tables every `Gateway` and `ServerGateway` consult: which
/// listeners belong to which gateway, and which servers exist. Held behind a
/// single reader-preferring lock so a reconfigure replaces both tables in one
/// atomic swap -- readers on the hot path never observe a gateway whose
/// listeners were updated but whose servers weren't, or vice versa.
#[derive(Debug, Clone, Default)]
pub struct GatewayState {
    pub gateways: HashMap<String, Arc<GatewayConfig>>,
    pub servers: HashMap<String, Arc<ServerConfig>>,
}

impl GatewayState {
    pub fn new(gateways: Vec<Arc<GatewayConfig>>, servers: Vec<Arc<ServerConfig>>) -> Self {
        GatewayState {
            gateways: gateways.into_iter().map(|g| (g.id.clone(), g)).collect(),
            servers: servers.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyChannelCaps {
    pub conn_processor: usize,
    pub server: usize,
    pub conn_pool: usize,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub channel_caps: ProxyChannelCaps,
    pub cpn_count: usize,
    pub handshake_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            channel_caps: ProxyChannelCaps {
                conn_processor: 64,
                server: 64,
                conn_pool: 64,
            },
            cpn_count: 4,
            handshake_timeout: Duration::from_secs(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnIntent {
    Status,
    Login,
}

/// A connection after its handshake has been parsed and its routing fields
/// extracted. Owns the raw transport until handed to `ServerGateway`.
pub struct ProcessedConn {
    pub raw: RawConn,
    pub gateway_id: String,
    pub requested_domain: String,
    pub requested_virtual_port: u16,
    pub username: Option<String>,
    pub intent: ConnIntent,
    pub client_addr: SocketAddr,
    pub server_not_found_message: String,
    pub status_response_json: Option<String>,
    /// Exact bytes consumed by the CPN while parsing the handshake; must be
    /// replayed to the backend verbatim ahead of anything else read from `raw`.
    pub read_bytes: Vec<u8>,
    pub protocol_version: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_pattern_wildcard_matches_suffix() {
        let pat = DomainPattern::parse("*.example.com");
        assert!(pat.matches("play.example.com"));
        assert!(!pat.matches("example.com"));
    }

    #[test]
    fn domain_pattern_bare_star_matches_anything() {
        let pat = DomainPattern::parse("*");
        assert!(pat.matches("anything.at.all"));
    }

    #[test]
    fn status_response_omits_sample_when_empty() {
        let template = StatusResponseTemplate::default();
        let json: serde_json::Value = serde_json::from_str(&template.render(763)).unwrap();
        assert!(json["players"].get("sample").is_none());
    }

    #[test]
    fn gateway_state_indexes_by_id() {
        let gateway = Arc::new(GatewayConfig {
            id: "g1".to_string(),
            listeners: Vec::new(),
            server_ids: vec!["s1".to_string()],
        });
        let server = Arc::new(ServerConfig {
            id: "s1".to_string(),
            domains: vec![DomainPattern::parse("*")],
            dial_address: "127.0.0.1:25566".to_string(),
            dial_timeout: Duration::from_secs(5),
            send_proxy_protocol: false,
            dial_timeout_message: String::new(),
            webhook_ids: Vec::new(),
        });
        let state = GatewayState::new(vec![gateway], vec![server]);
        assert!(state.gateways.contains_key("g1"));
        assert!(state.servers.contains_key("s1"));
    }

    #[test]
    fn status_response_includes_sample_when_present() {
        let mut template = StatusResponseTemplate::default();
        template.sample.push(StatusSample {
            name: "Notch".to_string(),
            id: "069a79f4-44e9-4726-a5be-fca90e38aaf5".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&template.render(763)).unwrap();
        assert_eq!(json["players"]["sample"][0]["name"], "Notch");
    }
}

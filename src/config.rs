//! fallbranch/src/config.rs
//! The configuration seam: `ProxyConfig` is all the core pipeline depends
//! on, so a different config source (a database, a remote control plane) can
//! replace `JsonFileConfig` without touching anything else. `JsonFileConfig`
//! is the one concrete loader this crate ships, reading a single JSON
//! document shaped like the wire types in `types.rs`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{
    DomainPattern, GatewayConfig, ListenerConfig, Protocol, ProxyChannelCaps, ProxySettings,
    ServerConfig, StatusResponseTemplate,
};

/// What the rest of the proxy needs from a configuration source. The core
/// pipeline (`Proxy::new`) takes plain `Vec<GatewayConfig>`/`Vec<ServerConfig>`
/// rather than this trait directly, so a caller can implement `ProxyConfig`
/// against whatever storage it likes and call `load()` once at startup.
pub trait ProxyConfig {
    fn load(&self) -> Result<LoadedConfig, ConfigError>;
}

pub struct LoadedConfig {
    pub settings: ProxySettings,
    pub gateways: Vec<GatewayConfig>,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub struct JsonFileConfig {
    path: std::path::PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFileConfig {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ProxyConfig for JsonFileConfig {
    fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        let doc: ConfigDocument = serde_json::from_str(&raw)?;
        Ok(doc.into_loaded())
    }
}

#[derive(Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    settings: SettingsDoc,
    gateways: Vec<GatewayDoc>,
    servers: Vec<ServerDoc>,
}

#[derive(Deserialize, Default)]
struct SettingsDoc {
    #[serde(default = "default_cpn_count")]
    cpn_count: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    handshake_timeout_ms: u64,
    #[serde(default = "default_channel_cap")]
    conn_processor_channel_cap: usize,
    #[serde(default = "default_channel_cap")]
    server_channel_cap: usize,
    #[serde(default = "default_channel_cap")]
    conn_pool_channel_cap: usize,
}

fn default_cpn_count() -> usize {
    4
}

fn default_handshake_timeout_ms() -> u64 {
    7_000
}

fn default_channel_cap() -> usize {
    64
}

#[derive(Deserialize)]
struct GatewayDoc {
    id: String,
    listeners: Vec<ListenerDoc>,
    server_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ListenerDoc {
    bind_address: String,
    protocol: Protocol,
    #[serde(default)]
    receive_proxy_protocol: bool,
    #[serde(default)]
    receive_real_ip: bool,
    #[serde(default = "default_not_found_message")]
    server_not_found_message: String,
    #[serde(default)]
    status_response_template: StatusResponseTemplate,
}

fn default_not_found_message() -> String {
    "No server found for {requestedAddress}.".to_string()
}

#[derive(Deserialize)]
struct ServerDoc {
    id: String,
    domains: Vec<String>,
    dial_address: String,
    #[serde(default = "default_dial_timeout_ms")]
    dial_timeout_ms: u64,
    #[serde(default)]
    send_proxy_protocol: bool,
    #[serde(default = "default_dial_timeout_message")]
    dial_timeout_message: String,
    #[serde(default)]
    webhook_ids: Vec<String>,
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_dial_timeout_message() -> String {
    "Could not connect to {serverID}.".to_string()
}

impl ConfigDocument {
    fn into_loaded(self) -> LoadedConfig {
        let settings = ProxySettings {
            channel_caps: ProxyChannelCaps {
                conn_processor: self.settings.conn_processor_channel_cap,
                server: self.settings.server_channel_cap,
                conn_pool: self.settings.conn_pool_channel_cap,
            },
            cpn_count: self.settings.cpn_count,
            handshake_timeout: Duration::from_millis(self.settings.handshake_timeout_ms),
        };

        let gateways = self
            .gateways
            .into_iter()
            .map(|g| GatewayConfig {
                id: g.id,
                listeners: g
                    .listeners
                    .into_iter()
                    .map(|l| ListenerConfig {
                        gateway_id: String::new(),
                        bind_address: l.bind_address,
                        protocol: l.protocol,
                        receive_proxy_protocol: l.receive_proxy_protocol,
                        receive_real_ip: l.receive_real_ip,
                        server_not_found_message: l.server_not_found_message,
                        status_response_template: l.status_response_template,
                    })
                    .collect(),
                server_ids: g.server_ids,
            })
            .collect();

        let servers = self
            .servers
            .into_iter()
            .map(|s| ServerConfig {
                id: s.id,
                domains: s.domains.iter().map(|d| DomainPattern::parse(d)).collect(),
                dial_address: s.dial_address,
                dial_timeout: Duration::from_millis(s.dial_timeout_ms),
                send_proxy_protocol: s.send_proxy_protocol,
                dial_timeout_message: s.dial_timeout_message,
                webhook_ids: s.webhook_ids,
            })
            .collect();

        LoadedConfig {
            settings,
            gateways,
            servers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_document() {
        let json = r#"
        {
            "gateways": [
                { "id": "default", "listeners": [
                    { "bind_address": "0.0.0.0:25565", "protocol": "java" }
                ], "server_ids": ["lobby"] }
            ],
            "servers": [
                { "id": "lobby", "domains": ["play.example.com"], "dial_address": "127.0.0.1:25566" }
            ]
        }
        "#;
        let path = std::env::temp_dir().join(format!("fallbranch-test-{}.json", std::process::id()));
        std::fs::write(&path, json).unwrap();

        let loaded = JsonFileConfig::new(&path).load().unwrap();
        assert_eq!(loaded.gateways.len(), 1);
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.settings.cpn_count, 4);

        let _ = std::fs::remove_file(&path);
    }
}

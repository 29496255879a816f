//! fallbranch/src/main.rs
//! Binary entrypoint: load config, start the proxy, run until shutdown.

use fallbranch::config::{JsonFileConfig, ProxyConfig};
use fallbranch::logging;
use fallbranch::proxy::Proxy;

#[tokio::main]
async fn main() {
    let log_handle = logging::init_logging("info");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "fallbranch.json".to_string());

    if let Ok(directive) = std::env::var("FALLBRANCH_LOG") {
        if let Err(err) = logging::set_level(&log_handle, &directive) {
            tracing::warn!("invalid FALLBRANCH_LOG directive: {err}");
        }
    }

    let loaded = match JsonFileConfig::new(&config_path).load() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("failed to load config from {config_path}: {err}");
            std::process::exit(1);
        }
    };

    tracing::info!(path = %config_path, "loaded configuration");

    let proxy = Proxy::new(loaded.settings, loaded.gateways, loaded.servers);
    proxy.run().await;
}

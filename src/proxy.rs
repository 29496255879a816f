//! fallbranch/src/proxy.rs
//! The supervisor that owns every stage of the pipeline and wires the
//! channels between them: Gateway -> CPN pool -> ServerGateway -> ConnPool.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::conn_pool::ConnPool;
use crate::cpn::CpnPool;
use crate::events::{EventBus, EventBusHandle};
use crate::gateway::Gateway;
use crate::server_gateway::ServerGateway;
use crate::types::{GatewayConfig, GatewayState, ProxySettings, ServerConfig};

pub struct Proxy {
    settings: Arc<ProxySettings>,
    gateways: Vec<Arc<GatewayConfig>>,
    servers: Vec<Arc<ServerConfig>>,
    server_gateway: Arc<ServerGateway>,
    events: EventBus,
    events_handle: EventBusHandle,
    cpn_pool: Arc<CpnPool>,
    conn_pool: Arc<ConnPool>,
    gateway_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Proxy {
    pub fn new(
        settings: ProxySettings,
        gateways: Vec<GatewayConfig>,
        servers: Vec<ServerConfig>,
    ) -> Self {
        let settings = Arc::new(settings);
        let (events, events_handle) = EventBus::new();

        let (ingress_tx, ingress_rx) = mpsc::channel(settings.channel_caps.conn_processor);
        let (srv_tx, srv_rx) = mpsc::channel(settings.channel_caps.server);
        let (pool_tx, pool_rx) = mpsc::channel(settings.channel_caps.conn_pool);

        let cpn_pool = CpnPool::new(ingress_rx, srv_tx, events.clone(), settings.clone());
        let conn_pool = ConnPool::new(events.clone());

        let gateways: Vec<Arc<GatewayConfig>> = gateways.into_iter().map(Arc::new).collect();
        let servers: Vec<Arc<ServerConfig>> = servers.into_iter().map(Arc::new).collect();

        let state = Arc::new(RwLock::new(GatewayState::new(gateways.clone(), servers.clone())));

        let server_gateway = Arc::new(ServerGateway::new(state.clone()));
        tokio::spawn(server_gateway.clone().serve(srv_rx, pool_tx, events.clone()));
        tokio::spawn(conn_pool.clone().serve(pool_rx));

        let mut gateway_tasks = Vec::new();
        for gateway_cfg in gateways.iter().cloned() {
            let ingress_tx = ingress_tx.clone();
            let events = events.clone();
            let state = state.clone();
            let gateway_id = gateway_cfg.id.clone();
            gateway_tasks.push(tokio::spawn(async move {
                let gateway = Arc::new(Gateway::new(gateway_id, state));
                match gateway.bind(&events).await {
                    Ok(bound) => gateway.clone().serve(bound, ingress_tx, events).await,
                    Err(err) => {
                        tracing::error!("gateway {} failed to bind any listener: {err}", gateway.id);
                    }
                }
            }));
        }

        Proxy {
            settings,
            gateways,
            servers,
            server_gateway,
            events,
            events_handle,
            cpn_pool,
            conn_pool,
            gateway_tasks,
        }
    }

    pub fn events(&self) -> &EventBusHandle {
        &self.events_handle
    }

    /// Hot-reconfigures the gateway/server routing table in one atomic swap.
    /// Existing tunnels and in-flight handshakes are unaffected; only the
    /// next routing decision sees the new table. Listener sockets already
    /// bound under the old `GatewayConfig` are not rebound by this call.
    pub async fn reconfigure(&self, gateways: Vec<GatewayConfig>, servers: Vec<ServerConfig>) {
        let gateways: Vec<Arc<GatewayConfig>> = gateways.into_iter().map(Arc::new).collect();
        let servers: Vec<Arc<ServerConfig>> = servers.into_iter().map(Arc::new).collect();
        self.server_gateway
            .reconfigure(gateways, servers)
            .await;
        info!("gateway/server routing table reconfigured");
    }

    /// Starts the CPN pool at its configured size and blocks until a
    /// shutdown signal (SIGINT/SIGTERM) arrives, then drains everything in
    /// flight before returning.
    pub async fn run(self) {
        self.cpn_pool.clone().set_size(self.settings.cpn_count).await;
        info!(
            gateways = self.gateways.len(),
            servers = self.servers.len(),
            cpn_count = self.settings.cpn_count,
            "proxy running"
        );

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining in-flight connections");

        for task in &self.gateway_tasks {
            task.abort();
        }
        self.cpn_pool.shutdown().await;
        self.conn_pool.shutdown().await;
        info!("proxy shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

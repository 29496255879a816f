//! fallbranch/src/server_gateway.rs
//! Routes each processed connection to the server whose domain pattern
//! matches, restricted to the set of servers the connection's gateway is
//! allowed to reach. A connection from Gateway G can only ever be routed to
//! a server in G's `server_ids` -- this is enforced here, not left to the
//! server list itself, so a misconfigured domain pattern can't leak a
//! connection across gateways.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::error::RouteError;
use crate::events::{Event, EventBus, TOPIC_SERVER_NOT_FOUND};
use crate::protocol::java;
use crate::raw_conn::RawConn;
use crate::template::{current_time, render, TemplateContext};
use crate::types::{ConnIntent, GatewayConfig, GatewayState, ProcessedConn, ServerConfig};

pub struct RoutedConn {
    pub processed: ProcessedConn,
    pub server: Arc<ServerConfig>,
}

/// Routes processed connections against the shared `GatewayState`. Reads take
/// the lock's read side, so routing never blocks behind another route -- only
/// `reconfigure`'s atomic swap takes the write side, and only for as long as
/// the single assignment takes.
pub struct ServerGateway {
    state: Arc<RwLock<GatewayState>>,
}

impl ServerGateway {
    pub fn new(state: Arc<RwLock<GatewayState>>) -> Self {
        ServerGateway { state }
    }

    /// First-match-in-declaration-order among the candidate servers the
    /// connection's gateway is allowed to reach.
    async fn route(&self, gateway_id: &str, domain: &str) -> Option<Arc<ServerConfig>> {
        let state = self.state.read().await;
        let gateway = state.gateways.get(gateway_id)?;
        gateway
            .server_ids
            .iter()
            .filter_map(|id| state.servers.get(id))
            .find(|server| server.matches_domain(domain))
            .cloned()
    }

    /// Atomically replaces the entire gateway/server routing table. Readers
    /// in `route` either see the table exactly as it was before this call or
    /// exactly as it is after -- never a mix of old gateways and new servers.
    pub async fn reconfigure(&self, gateways: Vec<Arc<GatewayConfig>>, servers: Vec<Arc<ServerConfig>>) {
        let mut state = self.state.write().await;
        *state = GatewayState::new(gateways, servers);
    }

    /// Drains the queue from the CPN pool, routes each connection, and
    /// either forwards it to the pool channel or resolves the no-match case
    /// itself (status response / disconnect) without ever touching the pool.
    pub async fn serve(
        self: Arc<Self>,
        mut srv_rx: mpsc::Receiver<ProcessedConn>,
        pool_tx: mpsc::Sender<RoutedConn>,
        events: EventBus,
    ) {
        while let Some(processed) = srv_rx.recv().await {
            match self.route(&processed.gateway_id, &processed.requested_domain).await {
                Some(server) => {
                    info!(
                        gateway = %processed.gateway_id,
                        server = %server.id,
                        domain = %processed.requested_domain,
                        "routed connection"
                    );
                    if pool_tx.send(RoutedConn { processed, server }).await.is_err() {
                        warn!("connection pool queue closed, dropping routed connection");
                    }
                }
                None => {
                    let err = RouteError::NoServerMatch {
                        gateway_id: processed.gateway_id.clone(),
                        domain: processed.requested_domain.clone(),
                    };
                    warn!("{err}");
                    events.publish(
                        Event::new(TOPIC_SERVER_NOT_FOUND)
                            .with_gateway(processed.gateway_id.clone())
                            .with_fields(serde_json::json!({ "domain": processed.requested_domain })),
                    );
                    resolve_unrouted(processed).await;
                }
            }
        }
    }
}

/// No server matched: answer the client directly rather than dialing
/// anything. A Java status probe gets the listener's own status response; a
/// Java login (or any Bedrock connection, which has no separate status
/// intent) gets the templated not-found disconnect.
async fn resolve_unrouted(processed: ProcessedConn) {
    match processed.raw {
        RawConn::Java(mut conn) => match processed.intent {
            ConnIntent::Status => {
                if let Some(json) = processed.status_response_json {
                    let _ = java::write_status_response(&mut conn.stream, &json).await;
                }
            }
            ConnIntent::Login => {
                let ctx = TemplateContext::new()
                    .set("username", processed.username.unwrap_or_default())
                    .set("requestedAddress", processed.requested_domain.clone())
                    .set("serverDomain", processed.requested_domain.clone())
                    .set("clientIP", processed.client_addr.ip().to_string())
                    .set("remoteAddress", processed.client_addr.to_string())
                    .set("gatewayID", processed.gateway_id.clone())
                    .set("protocolVersion", processed.protocol_version.to_string())
                    .set("currentTime", current_time());
                let message = render(&processed.server_not_found_message, &ctx);
                let disconnect_json = serde_json::json!({ "text": message }).to_string();
                let _ = java::write_disconnect(&mut conn.stream, &disconnect_json).await;
            }
        },
        RawConn::Bedrock(_) => {
            // RakNet has no disconnect-with-message packet in scope here;
            // dropping the connection is the observable "not found" behavior.
        }
    }
}

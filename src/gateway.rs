//! fallbranch/src/gateway.rs
//! Listener acceptance: binds every listener a Gateway declares and feeds
//! accepted connections into the CPN ingress queue, tagged with the
//! listener/gateway they arrived on.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::error::GatewayError;
use crate::events::{Event, EventBus, TOPIC_CLIENT_ACCEPTED, TOPIC_LISTENER_BOUND};
use crate::raw_conn::{BedrockRawConn, JavaRawConn, RawConn};
use crate::types::{GatewayState, ListenerConfig, Protocol};

/// A single bound listener plus the gateway/listener config it belongs to.
/// Kept separate from `Gateway` so a partial-bind failure can drop just the
/// listeners that didn't come up instead of failing the whole gateway.
pub(crate) enum BoundListener {
    Java {
        listener: TcpListener,
        config: Arc<ListenerConfig>,
    },
    Bedrock {
        listener: rak_rs::Listener,
        config: Arc<ListenerConfig>,
    },
}

/// One gateway's listener side. Holds only its own id and a handle to the
/// shared routing state -- the actual `GatewayConfig` is looked up through
/// `state` at bind time, so a `reconfigure` that replaces the whole table
/// is visible the next time this gateway (re)binds.
pub struct Gateway {
    pub id: String,
    state: Arc<RwLock<GatewayState>>,
}

impl Gateway {
    pub fn new(id: String, state: Arc<RwLock<GatewayState>>) -> Self {
        Gateway { id, state }
    }

    /// Binds every listener declared on this gateway. A listener that fails
    /// to bind is logged and skipped rather than aborting the whole gateway
    /// (spec'd partial-bind tolerance) -- but a gateway with zero live
    /// listeners is useless, so that case is fatal.
    pub async fn bind(&self, events: &EventBus) -> Result<Vec<BoundListener>, GatewayError> {
        let mut bound = Vec::new();

        let listeners: Vec<ListenerConfig> = {
            let state = self.state.read().await;
            state
                .gateways
                .get(&self.id)
                .map(|cfg| cfg.listeners.clone())
                .unwrap_or_default()
        };

        for listener_cfg in &listeners {
            let mut listener_cfg = listener_cfg.clone();
            listener_cfg.gateway_id = self.id.clone();
            let cfg = Arc::new(listener_cfg);
            match cfg.protocol {
                Protocol::Java => match TcpListener::bind(&cfg.bind_address).await {
                    Ok(listener) => {
                        info!(gateway = %self.id, addr = %cfg.bind_address, "bound Java listener");
                        events.publish(
                            Event::new(TOPIC_LISTENER_BOUND)
                                .with_gateway(self.id.clone())
                                .with_fields(serde_json::json!({ "addr": cfg.bind_address, "protocol": "java" })),
                        );
                        bound.push(BoundListener::Java { listener, config: cfg });
                    }
                    Err(source) => {
                        warn!(gateway = %self.id, addr = %cfg.bind_address, %source, "failed to bind Java listener");
                    }
                },
                Protocol::Bedrock => match rak_rs::Listener::bind(&cfg.bind_address).await {
                    Ok(listener) => {
                        info!(gateway = %self.id, addr = %cfg.bind_address, "bound Bedrock listener");
                        events.publish(
                            Event::new(TOPIC_LISTENER_BOUND)
                                .with_gateway(self.id.clone())
                                .with_fields(serde_json::json!({ "addr": cfg.bind_address, "protocol": "bedrock" })),
                        );
                        bound.push(BoundListener::Bedrock { listener, config: cfg });
                    }
                    Err(source) => {
                        warn!(gateway = %self.id, addr = %cfg.bind_address, ?source, "failed to bind Bedrock listener");
                    }
                },
            }
        }

        if bound.is_empty() {
            return Err(GatewayError::Bind {
                addr: self.id.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no listener on this gateway bound successfully",
                ),
            });
        }

        Ok(bound)
    }

    /// Runs every bound listener's accept loop concurrently until every one
    /// of them hits a fatal error or the process is shutting down.
    pub async fn serve(
        self: Arc<Self>,
        bound: Vec<BoundListener>,
        ingress_tx: mpsc::Sender<RawConn>,
        events: EventBus,
    ) {
        let mut tasks = Vec::new();
        for listener in bound {
            let ingress_tx = ingress_tx.clone();
            let gateway_id = self.id.clone();
            let events = events.clone();
            tasks.push(tokio::spawn(async move {
                accept_loop(gateway_id, listener, ingress_tx, events).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    gateway_id: String,
    listener: BoundListener,
    ingress_tx: mpsc::Sender<RawConn>,
    events: EventBus,
) {
    match listener {
        BoundListener::Java { listener, config } => loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    events.publish(
                        Event::new(TOPIC_CLIENT_ACCEPTED)
                            .with_gateway(gateway_id.clone())
                            .with_fields(serde_json::json!({ "addr": peer_addr.to_string(), "protocol": "java" })),
                    );
                    let raw = RawConn::Java(JavaRawConn {
                        stream,
                        listener: config.clone(),
                        peer_addr,
                    });
                    if ingress_tx.send(raw).await.is_err() {
                        info!(gateway = %gateway_id, "ingress queue closed, stopping accept loop");
                        return;
                    }
                }
                Err(source) => {
                    if is_transient(&source) {
                        warn!(gateway = %gateway_id, %source, "transient accept error");
                        continue;
                    }
                    error!(gateway = %gateway_id, %source, "fatal accept error, listener stopping");
                    return;
                }
            }
        },
        BoundListener::Bedrock { listener, config } => loop {
            match listener.accept().await {
                Ok(conn) => {
                    let peer_addr = conn.address;
                    events.publish(
                        Event::new(TOPIC_CLIENT_ACCEPTED)
                            .with_gateway(gateway_id.clone())
                            .with_fields(serde_json::json!({ "addr": peer_addr.to_string(), "protocol": "bedrock" })),
                    );
                    let raw = RawConn::Bedrock(BedrockRawConn {
                        conn,
                        listener: config.clone(),
                        peer_addr,
                    });
                    if ingress_tx.send(raw).await.is_err() {
                        info!(gateway = %gateway_id, "ingress queue closed, stopping accept loop");
                        return;
                    }
                }
                Err(source) => {
                    error!(gateway = %gateway_id, ?source, "fatal RakNet accept error, listener stopping");
                    return;
                }
            }
        },
    }
}

/// Accept errors that don't indicate the listening socket itself is broken;
/// worth retrying rather than tearing down the whole accept loop.
fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

//! fallbranch/src/conn_pool.rs
//! Dials the routed connection's backend and relays bytes until either side
//! closes. Java tunnels are a byte-stream copy loop; Bedrock tunnels forward
//! one RakNet datagram at a time, since RakNet's own framing means a raw byte
//! copy would scramble message boundaries.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::backend::{backend_for, ConnTunnel};
use crate::events::{duration_millis, Event, EventBus, TOPIC_CONN_CLOSED, TOPIC_CONN_TUNNELED, TOPIC_SERVER_DIAL_FAILED};
use crate::protocol::java;
use crate::raw_conn::RawConn;
use crate::server_gateway::RoutedConn;
use crate::template::{current_time, render, TemplateContext};

pub struct ConnPool {
    events: EventBus,
    active: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnPool {
    pub fn new(events: EventBus) -> Arc<Self> {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Arc::new(ConnPool {
            events,
            active: AsyncMutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub async fn serve(self: Arc<Self>, mut pool_rx: mpsc::Receiver<RoutedConn>) {
        while let Some(routed) = pool_rx.recv().await {
            let this = self.clone();
            let handle = tokio::spawn(async move { this.handle_routed(routed).await });
            let mut active = self.active.lock().await;
            active.retain(|h| !h.is_finished());
            active.push(handle);
        }
    }

    /// Signals every live tunnel's relay loop to force-close both ends, then
    /// waits for all of them to return. There is no idle timeout on an
    /// established tunnel, so without this signal an idle client/backend
    /// pair would keep its relay loop parked forever and shutdown would hang.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut active = self.active.lock().await;
        for handle in active.drain(..) {
            let _ = handle.await;
        }
    }

    async fn handle_routed(&self, routed: RoutedConn) {
        let server = routed.server.clone();
        let dial_timeout_message = server.dial_timeout_message.clone();
        let gateway_id = routed.processed.gateway_id.clone();
        let client_addr = routed.processed.client_addr;
        let username = routed.processed.username.clone();
        let requested_domain = routed.processed.requested_domain.clone();
        let protocol_version = routed.processed.protocol_version;
        let server_id = server.id.clone();

        let backend = backend_for(&server);
        let tunnel = match backend.dial(routed).await {
            Ok(tunnel) => tunnel,
            Err(failure) => {
                warn!(gateway = %gateway_id, server = %server_id, "dial failed: {}", failure.error);
                self.events.publish(
                    Event::new(TOPIC_SERVER_DIAL_FAILED)
                        .with_gateway(gateway_id.clone())
                        .with_server(server_id.clone())
                        .with_fields(serde_json::json!({ "error": failure.error.to_string() })),
                );
                let ctx = TemplateContext::new()
                    .set("username", username.clone().unwrap_or_default())
                    .set("clientIP", client_addr.ip().to_string())
                    .set("remoteAddress", client_addr.to_string())
                    .set("gatewayID", gateway_id)
                    .set("serverID", server_id)
                    .set("serverAddress", server.dial_address.clone())
                    .set("requestedAddress", requested_domain.clone())
                    .set("serverDomain", requested_domain)
                    .set("protocolVersion", protocol_version.to_string())
                    .set("currentTime", current_time());
                let message = render(&dial_timeout_message, &ctx);
                answer_dial_failure(failure.client, &message).await;
                return;
            }
        };

        let meta = tunnel.meta();
        info!(gateway = %meta.gateway_id, server = %meta.server_id, client = %meta.client_addr, "tunnel opened");
        self.events.publish(
            Event::new(TOPIC_CONN_TUNNELED)
                .with_gateway(meta.gateway_id.clone())
                .with_server(meta.server_id.clone()),
        );

        let started_at = Instant::now();
        let (gateway_id, server_id, client_addr) = (
            meta.gateway_id.clone(),
            meta.server_id.clone(),
            meta.client_addr,
        );

        let result = relay(tunnel, self.shutdown_tx.subscribe()).await;

        let elapsed = started_at.elapsed();
        match &result {
            Ok((up, down)) => {
                info!(
                    gateway = %gateway_id, server = %server_id, client = %client_addr,
                    bytes_up = up, bytes_down = down, duration_ms = duration_millis(elapsed),
                    "tunnel closed"
                );
                self.events.publish(
                    Event::new(TOPIC_CONN_CLOSED)
                        .with_gateway(gateway_id)
                        .with_server(server_id)
                        .with_fields(serde_json::json!({
                            "bytesUp": up,
                            "bytesDown": down,
                            "durationMs": duration_millis(elapsed),
                        })),
                );
            }
            Err(err) => {
                warn!(gateway = %gateway_id, server = %server_id, "tunnel relay error: {err}");
                self.events.publish(
                    Event::new(TOPIC_CONN_CLOSED)
                        .with_gateway(gateway_id)
                        .with_server(server_id)
                        .with_fields(serde_json::json!({
                            "error": err.to_string(),
                            "durationMs": duration_millis(elapsed),
                        })),
                );
            }
        }
    }
}

/// Answers a client whose backend dial failed with the templated
/// dial-timeout message. Bedrock has no disconnect-with-reason packet in
/// scope, so that side is simply dropped.
async fn answer_dial_failure(client: RawConn, message: &str) {
    if let RawConn::Java(mut conn) = client {
        let disconnect_json = serde_json::json!({ "text": message }).to_string();
        let _ = java::write_disconnect(&mut conn.stream, &disconnect_json).await;
    }
}

async fn relay(
    tunnel: ConnTunnel,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(u64, u64), crate::error::TunnelError> {
    match tunnel {
        ConnTunnel::Java {
            meta: _,
            mut client,
            mut backend,
        } => copy_bidirectional_bytes(&mut client, &mut backend, shutdown_rx).await,
        ConnTunnel::Bedrock {
            meta: _,
            client,
            backend,
        } => copy_bidirectional_datagrams(client, backend, shutdown_rx).await,
    }
}

async fn copy_bidirectional_bytes<A, B>(
    a: &mut A,
    b: &mut B,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(u64, u64), crate::error::TunnelError>
where
    A: AsyncReadExt + AsyncWriteExt + Unpin,
    B: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut a_buf = [0u8; 8192];
    let mut b_buf = [0u8; 8192];
    let mut a_closed = false;
    let mut b_closed = false;
    let mut up = 0u64;
    let mut down = 0u64;

    loop {
        if a_closed && b_closed {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = a.shutdown().await;
                    let _ = b.shutdown().await;
                    break;
                }
            }
            result = a.read(&mut a_buf), if !a_closed => {
                let n = result?;
                if n == 0 {
                    a_closed = true;
                    if !b_closed { b.shutdown().await?; }
                } else {
                    b.write_all(&a_buf[..n]).await?;
                    up += n as u64;
                }
            }
            result = b.read(&mut b_buf), if !b_closed => {
                let n = result?;
                if n == 0 {
                    b_closed = true;
                    if !a_closed { a.shutdown().await?; }
                } else {
                    a.write_all(&b_buf[..n]).await?;
                    down += n as u64;
                }
            }
        }
    }

    Ok((up, down))
}

async fn copy_bidirectional_datagrams(
    mut client: rak_rs::Conn,
    mut backend: rak_rs::Conn,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(u64, u64), crate::error::TunnelError> {
    let mut up = 0u64;
    let mut down = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            msg = client.recv() => {
                match msg {
                    Ok(datagram) => {
                        up += datagram.len() as u64;
                        if backend.send(&datagram).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            msg = backend.recv() => {
                match msg {
                    Ok(datagram) => {
                        down += datagram.len() as u64;
                        if client.send(&datagram).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    Ok((up, down))
}


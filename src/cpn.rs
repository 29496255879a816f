//! fallbranch/src/cpn.rs
//! Connection Processor (CPN) pool: drains the ingress queue, parses each
//! connection's handshake, and produces a `ProcessedConn` for routing. A
//! worker that hits a parse error logs it, publishes
//! `pre-conn-processing-failed`, and moves on to the next connection --
//! one bad handshake never takes down the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use crate::events::{Event, EventBus, TOPIC_PLAYER_JOIN, TOPIC_PRE_CONN_PROCESSED, TOPIC_PRE_CONN_PROCESSING_FAILED};
use crate::protocol::{bedrock, java};
use crate::raw_conn::{RawConn, TeeReader};
use crate::types::{ConnIntent, ProcessedConn, ProxySettings};

/// Max bytes to peek for a PROXY protocol header, per the v1/v2 spec's
/// largest possible header size.
const PROXY_HEADER_PEEK_LEN: usize = 536;

/// A worker's own graceful-exit signal, distinct from the pool-wide
/// `shutdown_tx`. Set by `set_size` when shrinking; the worker only checks it
/// between connections, so a handshake already in flight always finishes.
struct WorkerControl {
    stop: AtomicBool,
    notify: Notify,
}

pub struct CpnPool {
    ingress_rx: Arc<AsyncMutex<mpsc::Receiver<RawConn>>>,
    srv_tx: mpsc::Sender<ProcessedConn>,
    events: EventBus,
    settings: Arc<ProxySettings>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: AsyncMutex<Vec<(Arc<WorkerControl>, tokio::task::JoinHandle<()>)>>,
}

impl CpnPool {
    pub fn new(
        ingress_rx: mpsc::Receiver<RawConn>,
        srv_tx: mpsc::Sender<ProcessedConn>,
        events: EventBus,
        settings: Arc<ProxySettings>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(CpnPool {
            ingress_rx: Arc::new(AsyncMutex::new(ingress_rx)),
            srv_tx,
            events,
            settings,
            shutdown_tx,
            shutdown_rx,
            handles: AsyncMutex::new(Vec::new()),
        })
    }

    /// Grows or shrinks the live worker count to `target`. Shrinking signals
    /// the newest workers to exit gracefully: each only checks its own
    /// `WorkerControl` between connections, so a handshake already in flight
    /// always finishes before the worker stops picking up new ones.
    pub async fn set_size(self: Arc<Self>, target: usize) {
        let mut handles = self.handles.lock().await;
        while handles.len() < target {
            let id = handles.len();
            handles.push(self.clone().spawn_worker(id));
        }
        while handles.len() > target {
            if let Some((control, handle)) = handles.pop() {
                control.stop.store(true, Ordering::Release);
                control.notify.notify_one();
                // Don't block set_size on the worker finishing its current
                // item -- dropping a JoinHandle detaches it, it keeps running
                // in the background until it observes the stop signal.
                drop(handle);
            }
        }
    }

    fn spawn_worker(self: Arc<Self>, id: usize) -> (Arc<WorkerControl>, tokio::task::JoinHandle<()>) {
        let ingress_rx = self.ingress_rx.clone();
        let srv_tx = self.srv_tx.clone();
        let events = self.events.clone();
        let settings = self.settings.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let control = Arc::new(WorkerControl {
            stop: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let worker_control = control.clone();
        let handle = tokio::spawn(async move {
            loop {
                if worker_control.stop.load(Ordering::Acquire) {
                    info!(worker = id, "worker resized down, exiting");
                    return;
                }
                let next = {
                    let mut rx = ingress_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                            continue;
                        }
                        _ = worker_control.notify.notified() => {
                            if worker_control.stop.load(Ordering::Acquire) {
                                info!(worker = id, "worker resized down, exiting");
                                return;
                            }
                            continue;
                        }
                        item = rx.recv() => item,
                    }
                };
                match next {
                    Some(raw) => process_one(raw, &srv_tx, &events, &settings).await,
                    None => {
                        info!(worker = id, "cpn ingress queue closed, worker exiting");
                        return;
                    }
                }
            }
        });
        (control, handle)
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn process_one(
    raw: RawConn,
    srv_tx: &mpsc::Sender<ProcessedConn>,
    events: &EventBus,
    settings: &ProxySettings,
) {
    let gateway_id_for_log = raw.listener().gateway_id.clone();
    let result = tokio::time::timeout(settings.handshake_timeout, process_raw_conn(raw)).await;

    match result {
        Ok(Ok(processed)) => {
            info!(
                gateway = %processed.gateway_id,
                domain = %processed.requested_domain,
                "processed connection handshake"
            );
            events.publish(
                Event::new(TOPIC_PRE_CONN_PROCESSED)
                    .with_gateway(processed.gateway_id.clone())
                    .with_fields(serde_json::json!({
                        "domain": processed.requested_domain,
                        "intent": match processed.intent {
                            ConnIntent::Status => "status",
                            ConnIntent::Login => "login",
                        },
                    })),
            );
            if processed.intent == ConnIntent::Login {
                events.publish(
                    Event::new(TOPIC_PLAYER_JOIN)
                        .with_gateway(processed.gateway_id.clone())
                        .with_fields(serde_json::json!({
                            "username": processed.username,
                            "domain": processed.requested_domain,
                        })),
                );
            }
            if srv_tx.send(processed).await.is_err() {
                warn!("server-gateway queue closed, dropping processed connection");
            }
        }
        Ok(Err(err)) => {
            warn!(gateway = %gateway_id_for_log, "handshake processing failed: {err}");
            events.publish(
                Event::new(TOPIC_PRE_CONN_PROCESSING_FAILED)
                    .with_fields(serde_json::json!({ "error": err.to_string() })),
            );
        }
        Err(_) => {
            warn!("handshake processing timed out");
            events.publish(Event::new(TOPIC_PRE_CONN_PROCESSING_FAILED).with_fields(
                serde_json::json!({ "error": "handshake timed out" }),
            ));
        }
    }
}

async fn process_raw_conn(raw: RawConn) -> Result<ProcessedConn, crate::error::HandshakeError> {
    match raw {
        RawConn::Java(mut conn) => {
            let listener = conn.listener.clone();
            let mut client_addr = conn.peer_addr;

            if listener.receive_proxy_protocol {
                if let Some(real_addr) = consume_proxy_header(&mut conn.stream).await {
                    client_addr = real_addr;
                }
            }

            let mut tee = TeeReader::new(&mut conn.stream);
            let hs = java::parse_handshake(&mut tee).await?;
            let cleaned = java::clean_server_address(&hs.server_address, listener.receive_real_ip);
            if let Some(ip) = cleaned.forwarded_ip {
                client_addr = std::net::SocketAddr::new(ip, client_addr.port());
            }

            let (intent, username, status_response_json) = if hs.next_state == 1 {
                java::parse_status_request(&mut tee).await?;
                let json = listener
                    .status_response_template
                    .render(hs.protocol_version);
                (ConnIntent::Status, None, Some(json))
            } else {
                let name = java::parse_login_start(&mut tee).await?;
                (ConnIntent::Login, Some(name), None)
            };

            let read_bytes = tee.into_captured();

            Ok(ProcessedConn {
                gateway_id: listener.gateway_id.clone(),
                requested_domain: cleaned.domain,
                requested_virtual_port: hs.server_port,
                username,
                intent,
                client_addr,
                server_not_found_message: listener.server_not_found_message.clone(),
                status_response_json,
                read_bytes,
                protocol_version: hs.protocol_version,
                raw: RawConn::Java(conn),
            })
        }
        RawConn::Bedrock(mut conn) => {
            let listener = conn.listener.clone();
            let client_addr = conn.peer_addr;

            let mut buf = vec![0u8; 4096];
            let n = conn
                .conn
                .recv()
                .await
                .map(|datagram| {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    len
                })
                .map_err(|e| crate::error::HandshakeError::Malformed(format!("{e:?}")))?;

            let login = bedrock::parse_login_datagram(&buf[..n])?;
            let domain = login
                .server_address
                .map(|addr| addr.trim_end_matches('.').to_ascii_lowercase())
                .ok_or_else(|| {
                    crate::error::HandshakeError::Malformed("missing ServerAddress claim".into())
                })?;

            Ok(ProcessedConn {
                gateway_id: listener.gateway_id.clone(),
                requested_domain: domain,
                requested_virtual_port: 0,
                username: None,
                intent: ConnIntent::Login,
                client_addr,
                server_not_found_message: listener.server_not_found_message.clone(),
                status_response_json: None,
                read_bytes: buf[..n].to_vec(),
                protocol_version: login.protocol_version,
                raw: RawConn::Bedrock(conn),
            })
        }
    }
}

/// Peeks the start of a TCP stream for a PROXY protocol v1/v2 header and, if
/// present, consumes it and returns the client address it declares.
async fn consume_proxy_header(stream: &mut tokio::net::TcpStream) -> Option<std::net::SocketAddr> {
    let mut buf = [0u8; PROXY_HEADER_PEEK_LEN];
    let n = stream.peek(&mut buf).await.ok()?;
    let header_result = ppp::HeaderResult::parse(&buf[..n]);

    match header_result {
        ppp::HeaderResult::V1(Ok(header)) => {
            let header_len = header.header.as_ref().len();
            let mut discard = vec![0u8; header_len];
            stream.read_exact(&mut discard).await.ok()?;
            match header.addresses {
                ppp::v1::Addresses::Tcp4(v4) => Some(std::net::SocketAddr::V4(
                    std::net::SocketAddrV4::new(v4.source_address, v4.source_port),
                )),
                ppp::v1::Addresses::Tcp6(v6) => Some(std::net::SocketAddr::V6(
                    std::net::SocketAddrV6::new(v6.source_address, v6.source_port, 0, 0),
                )),
                _ => None,
            }
        }
        ppp::HeaderResult::V2(Ok(header)) => {
            let header_len = header.len();
            let mut discard = vec![0u8; header_len];
            stream.read_exact(&mut discard).await.ok()?;
            match header.addresses {
                ppp::v2::Addresses::IPv4(v4) => Some(std::net::SocketAddr::V4(
                    std::net::SocketAddrV4::new(v4.source_address, v4.source_port),
                )),
                ppp::v2::Addresses::IPv6(v6) => Some(std::net::SocketAddr::V6(
                    std::net::SocketAddrV6::new(v6.source_address, v6.source_port, 0, 0),
                )),
                _ => None,
            }
        }
        _ => None,
    }
}


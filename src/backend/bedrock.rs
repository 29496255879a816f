//! fallbranch/src/backend/bedrock.rs
//! Bedrock Edition backend dialing: establish a fresh RakNet session to the
//! backend server and replay the client's captured Login datagram over it.
//! The client's RakNet session terminates at the proxy; the backend gets its
//! own session, bridged datagram-by-datagram by `ConnPool`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DialError;
use crate::raw_conn::RawConn;
use crate::server_gateway::RoutedConn;
use crate::types::ServerConfig;

use super::{BackendServer, ConnTunnel, DialFailure, TunnelMeta};

pub struct BedrockBackend {
    pub config: Arc<ServerConfig>,
}

#[async_trait]
impl BackendServer for BedrockBackend {
    async fn dial(&self, routed: RoutedConn) -> Result<ConnTunnel, DialFailure> {
        let RoutedConn { processed, server } = routed;
        let client = match processed.raw {
            RawConn::Bedrock(conn) => conn,
            RawConn::Java(_) => unreachable!("BedrockBackend only dials Bedrock-routed connections"),
        };

        macro_rules! fail {
            ($error:expr) => {{
                return Err(DialFailure {
                    error: $error,
                    client: RawConn::Bedrock(client),
                });
            }};
        }

        let mut backend = match tokio::time::timeout(
            server.dial_timeout,
            rak_rs::Client::connect(&server.dial_address),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => fail!(DialError::Refused {
                addr: server.dial_address.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, format!("{source:?}")),
            }),
            Err(_) => fail!(DialError::Timeout {
                addr: server.dial_address.clone(),
                timeout: server.dial_timeout,
            }),
        };

        if server.send_proxy_protocol {
            let backend_addr = server.dial_address.parse::<SocketAddr>().ok();
            if let Some(header) = build_proxy_header(processed.client_addr, backend_addr) {
                if let Err(source) = backend.send(&header).await {
                    fail!(DialError::ProxyHeaderWrite {
                        addr: processed.client_addr,
                        source: std::io::Error::new(std::io::ErrorKind::Other, format!("{source:?}")),
                    });
                }
            }
        }

        if let Err(source) = backend.send(&processed.read_bytes).await {
            fail!(DialError::HandshakeReplay {
                addr: server.dial_address.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, format!("{source:?}")),
            });
        }

        Ok(ConnTunnel::Bedrock {
            meta: TunnelMeta {
                gateway_id: processed.gateway_id,
                server_id: server.id.clone(),
                client_addr: processed.client_addr,
                username: processed.username,
            },
            client: client.conn,
            backend,
        })
    }
}

/// Builds a PROXY protocol v2 header tagged `Datagram`, mirroring the Java
/// backend's `write_proxy_header` but for UDP source/destination pairs.
/// Returns `None` if the builder can't produce a header for the given
/// address family combination (mixed v4/v6 source and destination).
fn build_proxy_header(source_addr: SocketAddr, destination_addr: Option<SocketAddr>) -> Option<Vec<u8>> {
    let destination_addr = destination_addr.unwrap_or(source_addr);
    ppp::v2::Builder::with_addresses(
        ppp::v2::Version::Two | ppp::v2::Command::Proxy,
        ppp::v2::Protocol::Datagram,
        (source_addr, destination_addr),
    )
    .build()
    .ok()
}

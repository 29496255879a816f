//! fallbranch/src/backend/java.rs
//! Java Edition backend dialing: connect, optionally prepend a PROXY
//! protocol v2 header, replay the captured handshake/login bytes, done.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::DialError;
use crate::raw_conn::RawConn;
use crate::server_gateway::RoutedConn;
use crate::types::ServerConfig;

use super::{BackendServer, ConnTunnel, DialFailure, TunnelMeta};

pub struct JavaBackend {
    pub config: Arc<ServerConfig>,
}

#[async_trait]
impl BackendServer for JavaBackend {
    async fn dial(&self, routed: RoutedConn) -> Result<ConnTunnel, DialFailure> {
        let RoutedConn { processed, server } = routed;
        let client = match processed.raw {
            RawConn::Java(conn) => conn,
            RawConn::Bedrock(_) => unreachable!("JavaBackend only dials Java-routed connections"),
        };

        macro_rules! fail {
            ($error:expr) => {{
                return Err(DialFailure {
                    error: $error,
                    client: RawConn::Java(client),
                });
            }};
        }

        let mut backend = match dial_with_timeout(&server.dial_address, server.dial_timeout).await
        {
            Ok(stream) => stream,
            Err(error) => fail!(error),
        };

        if server.send_proxy_protocol {
            let backend_addr = backend.peer_addr().ok();
            if let Err(source) =
                write_proxy_header(&mut backend, processed.client_addr, backend_addr).await
            {
                fail!(DialError::ProxyHeaderWrite {
                    addr: processed.client_addr,
                    source,
                });
            }
        }

        if let Err(source) = backend.write_all(&processed.read_bytes).await {
            fail!(DialError::HandshakeReplay {
                addr: server.dial_address.clone(),
                source,
            });
        }

        Ok(ConnTunnel::Java {
            meta: TunnelMeta {
                gateway_id: processed.gateway_id,
                server_id: server.id.clone(),
                client_addr: processed.client_addr,
                username: processed.username,
            },
            client: client.stream,
            backend,
        })
    }
}

async fn dial_with_timeout(addr: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Refused {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

async fn write_proxy_header(
    backend: &mut TcpStream,
    source_addr: std::net::SocketAddr,
    destination_addr: Option<std::net::SocketAddr>,
) -> std::io::Result<()> {
    let destination_addr = destination_addr.unwrap_or(source_addr);
    let header = ppp::v2::Builder::with_addresses(
        ppp::v2::Version::Two | ppp::v2::Command::Proxy,
        ppp::v2::Protocol::Stream,
        (source_addr, destination_addr),
    )
    .build()
    .unwrap_or_default();
    backend.write_all(&header).await
}

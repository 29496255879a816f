//! fallbranch/src/backend/mod.rs
//! Dialing a backend server: connect with a deadline, optionally prepend a
//! PROXY protocol header, replay the bytes captured while parsing the
//! client's handshake, and hand back a tunnel ready for the relay loop.

pub mod bedrock;
pub mod java;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DialError;
use crate::raw_conn::RawConn;
use crate::server_gateway::RoutedConn;
use crate::types::ServerConfig;

/// Everything the relay loop and its event publication need to know about a
/// tunnel, independent of which transport it rides on.
pub struct TunnelMeta {
    pub gateway_id: String,
    pub server_id: String,
    pub client_addr: SocketAddr,
    pub username: Option<String>,
}

pub enum ConnTunnel {
    Java {
        meta: TunnelMeta,
        client: tokio::net::TcpStream,
        backend: tokio::net::TcpStream,
    },
    Bedrock {
        meta: TunnelMeta,
        client: rak_rs::Conn,
        backend: rak_rs::Conn,
    },
}

impl ConnTunnel {
    pub fn meta(&self) -> &TunnelMeta {
        match self {
            ConnTunnel::Java { meta, .. } => meta,
            ConnTunnel::Bedrock { meta, .. } => meta,
        }
    }
}

/// A failed dial still owns the client's raw connection -- nothing has been
/// written to it yet -- so the caller can answer it with a templated
/// disconnect instead of just dropping it silently.
pub struct DialFailure {
    pub error: DialError,
    pub client: RawConn,
}

/// The capability a routed connection needs from its backend: dial, replay,
/// hand back a tunnel. Implemented once per transport so `ConnPool` never has
/// to branch on protocol when opening a tunnel -- only when relaying one.
#[async_trait]
pub trait BackendServer: Send + Sync {
    async fn dial(&self, routed: RoutedConn) -> Result<ConnTunnel, DialFailure>;
}

pub fn backend_for(server: &Arc<ServerConfig>) -> Box<dyn BackendServer> {
    Box::new(match_protocol(server))
}

fn match_protocol(server: &Arc<ServerConfig>) -> AnyBackend {
    AnyBackend {
        java: java::JavaBackend {
            config: server.clone(),
        },
        bedrock: bedrock::BedrockBackend {
            config: server.clone(),
        },
    }
}

/// Dispatches to the right transport-specific implementation based on which
/// variant of `RawConn` the routed connection actually carries, rather than
/// requiring a separate `BackendServer` per `ServerConfig` protocol field --
/// a `ServerConfig` doesn't declare a protocol; its listener already did.
struct AnyBackend {
    java: java::JavaBackend,
    bedrock: bedrock::BedrockBackend,
}

#[async_trait]
impl BackendServer for AnyBackend {
    async fn dial(&self, routed: RoutedConn) -> Result<ConnTunnel, DialFailure> {
        match &routed.processed.raw {
            RawConn::Java(_) => self.java.dial(routed).await,
            RawConn::Bedrock(_) => self.bedrock.dial(routed).await,
        }
    }
}

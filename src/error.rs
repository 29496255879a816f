//! fallbranch/src/error.rs
//! Error taxonomy for the connection lifecycle pipeline.
//!
//! Each stage of the pipeline has its own error enum so callers can match on
//! cause without downcasting a shared `Box<dyn Error>`. Errors never cross a
//! stage boundary: a `HandshakeError` is handled entirely inside the CPN
//! worker that produced it, a `DialError` entirely inside the connection pool
//! that dialed the backend, and so on.

use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("transient accept error: {0}")]
    AcceptTransient(#[source] io::Error),
    #[error("listener closed")]
    AcceptFatal,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("i/o error while reading handshake: {0}")]
    Io(#[from] io::Error),
    #[error("malformed handshake packet: {0}")]
    Malformed(String),
    #[error("handshake read exceeded the per-connection deadline")]
    Timeout,
    #[error("unsupported next-state {0} in handshake")]
    UnsupportedState(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no server matches domain {domain:?} on gateway {gateway_id:?}")]
    NoServerMatch { gateway_id: String, domain: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial to {addr} timed out after {0:?}", .timeout)]
    Timeout { addr: String, timeout: std::time::Duration },
    #[error("dial to {addr} refused: {source}")]
    Refused {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write PROXY protocol header to {addr}: {source}")]
    ProxyHeaderWrite {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to replay buffered handshake bytes to {addr}: {source}")]
    HandshakeReplay {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("copy loop error: {0}")]
    Copy(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("subscriber {name} queue overflowed, dropping event")]
    Overflow { name: String },
}

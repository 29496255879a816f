//! fallbranch/src/raw_conn.rs
//! Transport-level connection wrappers and the byte-capture adaptor used by
//! the CPN to both parse and replay the handshake prefix.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;

use crate::types::ListenerConfig;

/// Tees every byte read through it into a growable buffer, so a handshake
/// parser can both decode fields and preserve the exact bytes it consumed
/// for later replay to the backend. Reads are always exact-sized in this
/// codebase (VarInt-at-a-time, `read_exact` for fixed fields), so the
/// underlying socket is never over-read past what the parser logically
/// consumed.
pub struct TeeReader<'a, R> {
    inner: &'a mut R,
    captured: Vec<u8>,
}

impl<'a, R> TeeReader<'a, R> {
    pub fn new(inner: &'a mut R) -> Self {
        TeeReader {
            inner,
            captured: Vec::new(),
        }
    }

    pub fn into_captured(self) -> Vec<u8> {
        self.captured
    }
}

impl<'a, R: AsyncRead + Unpin> AsyncRead for TeeReader<'a, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let inner = Pin::new(&mut *this.inner);
        let res = inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        res
    }
}

/// A Java Edition connection, still owning its TCP stream between the CPN
/// handing it off and the backend dial writing the replayed prefix.
pub struct JavaRawConn {
    pub stream: TcpStream,
    pub listener: Arc<ListenerConfig>,
    pub peer_addr: SocketAddr,
}

/// A Bedrock Edition connection. RakNet already frames reliable-ordered game
/// packets as discrete messages, so there is no byte-oriented teeing to do:
/// the Login packet payload itself *is* `read_bytes`.
pub struct BedrockRawConn {
    pub conn: rak_rs::Conn,
    pub listener: Arc<ListenerConfig>,
    pub peer_addr: SocketAddr,
}

pub enum RawConn {
    Java(JavaRawConn),
    Bedrock(BedrockRawConn),
}

impl RawConn {
    pub fn listener(&self) -> &Arc<ListenerConfig> {
        match self {
            RawConn::Java(c) => &c.listener,
            RawConn::Bedrock(c) => &c.listener,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            RawConn::Java(c) => c.peer_addr,
            RawConn::Bedrock(c) => c.peer_addr,
        }
    }
}

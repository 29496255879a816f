//! fallbranch/src/protocol/java.rs
//! Minecraft Java Edition handshake/status/login packet codec.
//!
//! The proxy understands exactly three inbound packets (Handshake, Status
//! Request, Login Start) and emits exactly two (Disconnect, Status Response),
//! all framed as `[VarInt length][VarInt packet id][...]`.

use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::varint::{frame_packet, read_string, read_varint, write_string, write_varint};
use crate::error::HandshakeError;

#[derive(Debug, Clone)]
pub struct HandshakeData {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

pub async fn parse_handshake<R>(stream: &mut R) -> Result<HandshakeData, HandshakeError>
where
    R: AsyncReadExt + Unpin,
{
    let _packet_len = read_varint(stream).await?;
    let packet_id = read_varint(stream).await?;
    if packet_id != 0x00 {
        return Err(HandshakeError::Malformed(format!(
            "expected handshake packet id 0x00, got {packet_id:#x}"
        )));
    }
    let protocol_version = read_varint(stream).await?;
    let server_address = read_string(stream).await?;
    let server_port = stream.read_u16().await?;
    let next_state = read_varint(stream).await?;
    if next_state != 1 && next_state != 2 {
        return Err(HandshakeError::UnsupportedState(next_state));
    }
    Ok(HandshakeData {
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

pub async fn parse_status_request<R>(stream: &mut R) -> Result<(), HandshakeError>
where
    R: AsyncReadExt + Unpin,
{
    let _packet_len = read_varint(stream).await?;
    let packet_id = read_varint(stream).await?;
    if packet_id != 0x00 {
        return Err(HandshakeError::Malformed(format!(
            "expected status request packet id 0x00, got {packet_id:#x}"
        )));
    }
    Ok(())
}

pub async fn parse_login_start<R>(stream: &mut R) -> Result<String, HandshakeError>
where
    R: AsyncReadExt + Unpin,
{
    let _packet_len = read_varint(stream).await?;
    let packet_id = read_varint(stream).await?;
    if packet_id != 0x00 {
        return Err(HandshakeError::Malformed(format!(
            "expected login start packet id 0x00, got {packet_id:#x}"
        )));
    }
    read_string(stream).await.map_err(HandshakeError::from)
}

/// Re-serializes a (possibly host-rewritten) handshake for forwarding. Only
/// used when the CPN itself needs to emit a handshake rather than replay the
/// byte-identical prefix it captured (the common path uses the captured
/// bytes verbatim per the byte-transparency invariant).
pub fn encode_handshake(hs: &HandshakeData) -> Vec<u8> {
    let mut payload = Vec::new();
    write_varint(&mut payload, 0x00);
    write_varint(&mut payload, hs.protocol_version);
    write_string(&mut payload, &hs.server_address);
    payload.extend_from_slice(&hs.server_port.to_be_bytes());
    write_varint(&mut payload, hs.next_state);
    frame_packet(payload)
}

pub async fn write_disconnect<W>(stream: &mut W, message_json: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut payload = Vec::new();
    write_varint(&mut payload, 0x00);
    write_string(&mut payload, message_json);
    stream.write_all(&frame_packet(payload)).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

pub async fn write_status_response<W>(stream: &mut W, json: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut payload = Vec::new();
    write_varint(&mut payload, 0x00);
    write_string(&mut payload, json);
    stream.write_all(&frame_packet(payload)).await
}

pub async fn write_pong<W>(stream: &mut W, payload: u64) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut body = Vec::new();
    write_varint(&mut body, 0x01);
    body.extend_from_slice(&payload.to_be_bytes());
    stream.write_all(&frame_packet(body)).await
}

/// A `server-address` field cleaned of its embedded port and any in-band
/// Forge/BungeeCord suffixes, plus whatever real-IP data (if any) was
/// embedded after the first null byte.
pub struct CleanedAddress {
    pub domain: String,
    pub forwarded_ip: Option<IpAddr>,
}

/// Strips the Forge `\0FML\0`/BungeeCord IP-forwarding suffixes a client may
/// embed in the handshake's `server_address` field, lowercases the result,
/// and (when `receive_real_ip` is set) extracts the client IP BungeeCord-style
/// forwarding encodes as the segment immediately after the hostname.
pub fn clean_server_address(raw: &str, receive_real_ip: bool) -> CleanedAddress {
    let mut parts = raw.split('\0');
    let domain = parts
        .next()
        .unwrap_or(raw)
        .trim_end_matches('.')
        .to_ascii_lowercase();

    let forwarded_ip = if receive_real_ip {
        parts.next().and_then(|s| s.parse::<IpAddr>().ok())
    } else {
        None
    };

    CleanedAddress {
        domain,
        forwarded_ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_test_handshake(addr: &str, next_state: i32) -> Vec<u8> {
        encode_handshake(&HandshakeData {
            protocol_version: 763,
            server_address: addr.to_string(),
            server_port: 25565,
            next_state,
        })
    }

    #[tokio::test]
    async fn parses_well_formed_handshake() {
        let bytes = encode_test_handshake("play.example", 1);
        let mut cursor = Cursor::new(bytes);
        let hs = parse_handshake(&mut cursor).await.unwrap();
        assert_eq!(hs.protocol_version, 763);
        assert_eq!(hs.server_address, "play.example");
        assert_eq!(hs.next_state, 1);
    }

    #[tokio::test]
    async fn rejects_bad_next_state() {
        let bytes = encode_test_handshake("play.example", 9);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            parse_handshake(&mut cursor).await,
            Err(HandshakeError::UnsupportedState(9))
        ));
    }

    #[test]
    fn cleans_plain_domain() {
        let cleaned = clean_server_address("Play.Example.COM", false);
        assert_eq!(cleaned.domain, "play.example.com");
        assert!(cleaned.forwarded_ip.is_none());
    }

    #[test]
    fn cleans_forge_suffix() {
        let cleaned = clean_server_address("play.example\0FML\0", false);
        assert_eq!(cleaned.domain, "play.example");
    }

    #[test]
    fn extracts_forwarded_ip_when_enabled() {
        let cleaned = clean_server_address("play.example\x0010.0.0.5\x00uuid", true);
        assert_eq!(cleaned.domain, "play.example");
        assert_eq!(cleaned.forwarded_ip, Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn ignores_forwarded_ip_when_disabled() {
        let cleaned = clean_server_address("play.example\x0010.0.0.5\x00uuid", false);
        assert!(cleaned.forwarded_ip.is_none());
    }
}

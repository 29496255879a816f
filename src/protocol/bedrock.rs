//! fallbranch/src/protocol/bedrock.rs
//! Minimal Bedrock Edition Login-packet decoding: just enough to recover the
//! domain the client dialed, without validating anything the client claims.
//!
//! Bedrock wraps every post-handshake game packet in a single "wrapper"
//! frame (id `0xFE`) whose body is a zlib/deflate-compressed batch of
//! length-prefixed sub-packets. The first sub-packet of a new connection is
//! always Login (id `0x01`): a protocol version, followed by a length-prefixed
//! JSON blob holding two base64url JWT chains. The proxy does not verify
//! either chain's signature -- it only needs the `ServerAddress` claim
//! carried in the chain's unsigned payload segment.

use std::io::Read;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use serde::Deserialize;

use crate::error::HandshakeError;

const WRAPPER_PACKET_ID: u8 = 0xfe;
const LOGIN_PACKET_ID: u32 = 0x01;

#[derive(Debug, Clone)]
pub struct BedrockLoginData {
    pub protocol_version: i32,
    pub server_address: Option<String>,
}

#[derive(Deserialize)]
struct ConnectionRequest {
    chain: Vec<String>,
}

#[derive(Deserialize)]
struct ChainPayload {
    #[serde(rename = "ServerAddress")]
    server_address: Option<String>,
}

/// `raw` is one complete RakNet datagram payload as handed up by `rak-rs`.
pub fn parse_login_datagram(raw: &[u8]) -> Result<BedrockLoginData, HandshakeError> {
    let (&id, body) = raw
        .split_first()
        .ok_or_else(|| HandshakeError::Malformed("empty datagram".into()))?;
    if id != WRAPPER_PACKET_ID {
        return Err(HandshakeError::Malformed(format!(
            "expected game packet wrapper 0x{WRAPPER_PACKET_ID:02x}, got 0x{id:02x}"
        )));
    }

    let batch = decompress_batch(body)?;
    let login_payload = batch
        .into_iter()
        .find_map(|packet| {
            let (packet_id, rest) = read_unsigned_varint(&packet)?;
            (packet_id == LOGIN_PACKET_ID).then(|| rest.to_vec())
        })
        .ok_or_else(|| HandshakeError::Malformed("no Login packet in batch".into()))?;

    parse_login_body(&login_payload)
}

fn decompress_batch(body: &[u8]) -> Result<Vec<Vec<u8>>, HandshakeError> {
    let mut decoder = DeflateDecoder::new(body);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| HandshakeError::Malformed(format!("batch inflate failed: {e}")))?;

    let mut packets = Vec::new();
    let mut cursor = inflated.as_slice();
    while !cursor.is_empty() {
        let (len, rest) = read_unsigned_varint(cursor)
            .ok_or_else(|| HandshakeError::Malformed("truncated batch length".into()))?;
        let len = len as usize;
        if rest.len() < len {
            return Err(HandshakeError::Malformed("truncated batch entry".into()));
        }
        packets.push(rest[..len].to_vec());
        cursor = &rest[len..];
    }
    Ok(packets)
}

fn parse_login_body(body: &[u8]) -> Result<BedrockLoginData, HandshakeError> {
    if body.len() < 4 {
        return Err(HandshakeError::Malformed("login packet too short".into()));
    }
    let protocol_version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let (conn_request_len, rest) = read_unsigned_varint(&body[4..])
        .ok_or_else(|| HandshakeError::Malformed("missing connection request length".into()))?;
    let conn_request_len = conn_request_len as usize;
    if rest.len() < conn_request_len {
        return Err(HandshakeError::Malformed(
            "truncated connection request".into(),
        ));
    }
    let conn_request_json = &rest[..conn_request_len];

    let server_address = extract_server_address(conn_request_json).ok();

    Ok(BedrockLoginData {
        protocol_version,
        server_address,
    })
}

fn extract_server_address(conn_request_json: &[u8]) -> Result<String, HandshakeError> {
    let request: ConnectionRequest = serde_json::from_slice(conn_request_json)
        .map_err(|e| HandshakeError::Malformed(format!("bad connection request json: {e}")))?;

    for token in &request.chain {
        if let Some(addr) = decode_jwt_server_address(token) {
            return Ok(addr);
        }
    }
    Err(HandshakeError::Malformed(
        "no ServerAddress claim in login chain".into(),
    ))
}

/// Decodes the unsigned payload segment of a `<header>.<payload>.<sig>` JWT
/// and pulls out `ServerAddress` if present. Signature verification is out of
/// scope: the proxy trusts nothing the client claims beyond routing hints.
fn decode_jwt_server_address(token: &str) -> Option<String> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let payload: ChainPayload = serde_json::from_slice(&payload_bytes).ok()?;
    payload.server_address
}

/// Bedrock's "unsigned varint": base-128, little-endian, no zigzag -- used
/// for batch-entry and sub-packet length/id prefixes.
fn read_unsigned_varint(buf: &[u8]) -> Option<(u32, &[u8])> {
    let mut result: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((result, &buf[i + 1..]));
        }
        shift += 7;
        if shift >= 35 {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_unsigned_varint(buf: &mut Vec<u8>, mut value: u32) {
        loop {
            if value & !0x7f == 0 {
                buf.push(value as u8);
                return;
            }
            buf.push(((value & 0x7f) | 0x80) as u8);
            value >>= 7;
        }
    }

    fn make_jwt_with_server_address(addr: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"ServerAddress":"{addr}"}}"#));
        format!("{header}.{payload}.sig")
    }

    fn make_login_datagram(addr: &str, protocol_version: i32) -> Vec<u8> {
        let chain_json = serde_json::json!({
            "chain": [make_jwt_with_server_address(addr)]
        })
        .to_string();

        let mut login_body = Vec::new();
        login_body.extend_from_slice(&protocol_version.to_be_bytes());
        write_unsigned_varint(&mut login_body, chain_json.len() as u32);
        login_body.extend_from_slice(chain_json.as_bytes());

        let mut login_packet = Vec::new();
        write_unsigned_varint(&mut login_packet, LOGIN_PACKET_ID);
        login_packet.extend_from_slice(&login_body);

        let mut batch = Vec::new();
        write_unsigned_varint(&mut batch, login_packet.len() as u32);
        batch.extend_from_slice(&login_packet);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&batch).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut datagram = vec![WRAPPER_PACKET_ID];
        datagram.extend_from_slice(&compressed);
        datagram
    }

    #[test]
    fn extracts_server_address_from_login_datagram() {
        let datagram = make_login_datagram("play.example.com", 649);
        let parsed = parse_login_datagram(&datagram).unwrap();
        assert_eq!(parsed.protocol_version, 649);
        assert_eq!(parsed.server_address.as_deref(), Some("play.example.com"));
    }

    #[test]
    fn rejects_non_wrapper_packet() {
        let err = parse_login_datagram(&[0x01, 0x02]).unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
    }

    #[test]
    fn unsigned_varint_roundtrip() {
        let mut buf = Vec::new();
        write_unsigned_varint(&mut buf, 300);
        let (value, rest) = read_unsigned_varint(&buf).unwrap();
        assert_eq!(value, 300);
        assert!(rest.is_empty());
    }
}

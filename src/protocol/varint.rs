//! fallbranch/src/protocol/varint.rs
//! Minecraft Java Edition VarInt/String framing primitives.

use std::io::{Error, ErrorKind, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// 256 KiB, a generous ceiling for a single handshake-time packet string.
const MAX_STRING_LEN: usize = 262_144;

pub async fn read_varint<R>(stream: &mut R) -> Result<i32>
where
    R: AsyncReadExt + Unpin,
{
    let mut num_read = 0;
    let mut result: i32 = 0;
    loop {
        let byte = stream.read_u8().await?;
        let value = (byte & 0x7F) as i32;
        result |= value << (7 * num_read);
        num_read += 1;
        if num_read > 5 {
            return Err(Error::new(ErrorKind::InvalidData, "VarInt too big"));
        }
        if (byte & 0x80) == 0 {
            break;
        }
    }
    Ok(result)
}

pub fn write_varint(buf: &mut Vec<u8>, mut value: i32) {
    loop {
        if (value & !0x7F) == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push(((value & 0x7F) | 0x80) as u8);
        value = ((value as u32) >> 7) as i32;
    }
}

pub async fn read_string<R>(stream: &mut R) -> Result<String>
where
    R: AsyncReadExt + Unpin,
{
    let len = read_varint(stream).await? as usize;
    if len > MAX_STRING_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "string length exceeds limit",
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| Error::new(ErrorKind::InvalidData, e))
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    write_varint(buf, bytes.len() as i32);
    buf.extend_from_slice(bytes);
}

/// Wraps a payload with its VarInt length prefix, as every Java packet frame
/// requires.
pub fn frame_packet(payload: Vec<u8>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut packet, payload.len() as i32);
    packet.extend(payload);
    packet
}

/// Writes a value via `write_all`, used by callers that already have a
/// complete framed buffer.
pub async fn write_all<W>(stream: &mut W, buf: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    stream.write_all(buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn roundtrips_small_values() {
        for &value in &[0, 1, 127, 128, 255, 25565, i32::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut cursor = Cursor::new(buf);
            let decoded = read_varint(&mut cursor).await.unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[tokio::test]
    async fn rejects_overlong_varint() {
        let buf = vec![0xFF; 6];
        let mut cursor = Cursor::new(buf);
        assert!(read_varint(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn roundtrips_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "play.example.com");
        let mut cursor = Cursor::new(buf);
        let decoded = read_string(&mut cursor).await.unwrap();
        assert_eq!(decoded, "play.example.com");
    }

    #[tokio::test]
    async fn rejects_oversized_string() {
        let mut buf = Vec::new();
        write_varint(&mut buf, (MAX_STRING_LEN + 1) as i32);
        let mut cursor = Cursor::new(buf);
        assert!(read_string(&mut cursor).await.is_err());
    }
}

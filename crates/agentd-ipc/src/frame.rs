//! The framing codec (§4.1): three wire frame kinds sharing a 5-byte header
//! (one type byte, then a big-endian `u32` payload length), plus the
//! authenticated packet construction layered on top of [`agentd_crypto`].

use agentd_crypto::{self as crypto, KEY_SIZE, MAC_SIZE};
use byteorder::{BigEndian, ByteOrder};

use crate::error::{ErrorKind, IpcError, IpcResult};

pub const HEADER_SIZE: usize = 5;

pub const TYPE_RAW_DATA: u8 = 0x20;
pub const TYPE_UINT8: u8 = 0x10;
pub const TYPE_INT64: u8 = 0x11;
pub const TYPE_STRING: u8 = 0x12;
pub const TYPE_AUTHED_PACKET: u8 = 0x30;

pub const MAX_DATA_FRAME_SIZE: usize = 1024 * 1024 * 1024;
pub const MAX_AUTHED_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// A decoded typed primitive frame (§4.1 `0x10`/`0x11`/`0x12`).
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Uint8(u8),
    Int64(i64),
    String(String),
}

/// Encodes a raw data frame: `0x20 | len(4) | payload`.
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(TYPE_RAW_DATA);
    write_len(&mut out, payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

/// Decodes a raw data frame's header out of `buf`, returning the declared
/// payload length if `buf` holds at least a full header and the type byte
/// matches. Fails with `PacketBadSize` if the declared size exceeds the 1
/// GiB data-frame cap (§4.1 `decode_data`).
pub fn peek_data_header(buf: &[u8]) -> IpcResult<Option<(u8, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let kind = buf[0];
    let size = BigEndian::read_u32(&buf[1..5]) as usize;
    if size > MAX_DATA_FRAME_SIZE {
        return Err(IpcError::fatal(ErrorKind::PacketBadSize));
    }
    Ok(Some((kind, size)))
}

/// Decodes a raw data frame payload given the header and a buffer that has
/// been confirmed (via [`peek_data_header`]) to hold `size` more bytes after
/// the header.
pub fn decode_data(buf: &[u8]) -> IpcResult<&[u8]> {
    let (kind, size) = match peek_data_header(buf)? {
        Some(parts) => parts,
        None => return Err(IpcError::Wait),
    };
    if kind != TYPE_RAW_DATA {
        return Err(IpcError::fatal(ErrorKind::UnexpectedDataType));
    }
    let end = HEADER_SIZE + size;
    if buf.len() < end {
        return Err(IpcError::Wait);
    }
    Ok(&buf[HEADER_SIZE..end])
}

pub fn encode_uint8(value: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 1);
    out.push(TYPE_UINT8);
    write_len(&mut out, 1);
    out.push(value);
    out
}

pub fn encode_int64(value: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 8);
    out.push(TYPE_INT64);
    write_len(&mut out, 8);
    let mut body = [0u8; 8];
    BigEndian::write_i64(&mut body, value);
    out.extend_from_slice(&body);
    out
}

pub fn encode_string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(HEADER_SIZE + bytes.len());
    out.push(TYPE_STRING);
    write_len(&mut out, bytes.len() as u32);
    out.extend_from_slice(bytes);
    out
}

/// Decodes a typed primitive frame. Returns `Wait` if the buffer does not
/// yet hold a complete frame, `UnexpectedDataType` if the leading byte is
/// not one of `0x10`/`0x11`/`0x12`.
pub fn decode_primitive(buf: &[u8]) -> IpcResult<(Primitive, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(IpcError::Wait);
    }
    let kind = buf[0];
    let size = BigEndian::read_u32(&buf[1..5]) as usize;
    let end = HEADER_SIZE + size;
    if buf.len() < end {
        return Err(IpcError::Wait);
    }
    let body = &buf[HEADER_SIZE..end];

    let value = match kind {
        TYPE_UINT8 => {
            if size != 1 {
                return Err(IpcError::fatal(ErrorKind::PacketBadSize));
            }
            Primitive::Uint8(body[0])
        }
        TYPE_INT64 => {
            if size != 8 {
                return Err(IpcError::fatal(ErrorKind::PacketBadSize));
            }
            Primitive::Int64(BigEndian::read_i64(body))
        }
        TYPE_STRING => Primitive::String(
            String::from_utf8(body.to_vec())
                .map_err(|_| IpcError::fatal(ErrorKind::MalformedRequest))?,
        ),
        _ => return Err(IpcError::fatal(ErrorKind::UnexpectedDataType)),
    };

    Ok((value, end))
}

fn write_len(out: &mut Vec<u8>, len: u32) {
    let mut body = [0u8; 4];
    BigEndian::write_u32(&mut body, len);
    out.extend_from_slice(&body);
}

/// Encodes an authenticated packet frame under `nonce`/`secret` (§4.1
/// `encode_authed`). `plaintext` becomes the frame's logical payload; the
/// frame's declared type is always [`TYPE_AUTHED_PACKET`].
pub fn encode_authed(nonce: u64, secret: &[u8; KEY_SIZE], plaintext: &[u8]) -> IpcResult<Vec<u8>> {
    if plaintext.len() > MAX_AUTHED_PACKET_SIZE {
        return Err(IpcError::fatal(ErrorKind::PacketBadSize));
    }

    let mut header_and_payload = Vec::with_capacity(HEADER_SIZE + plaintext.len());
    header_and_payload.push(TYPE_AUTHED_PACKET);
    write_len(&mut header_and_payload, plaintext.len() as u32);
    header_and_payload.extend_from_slice(plaintext);

    let encrypted = crypto::stream_encrypt(secret, nonce, &header_and_payload);
    let mac = crypto::authed_mac(secret, nonce, &encrypted);

    let mut frame = Vec::with_capacity(HEADER_SIZE + MAC_SIZE + plaintext.len());
    frame.extend_from_slice(&encrypted[..HEADER_SIZE]);
    frame.extend_from_slice(&mac);
    frame.extend_from_slice(&encrypted[HEADER_SIZE..]);
    Ok(frame)
}

/// Decodes an authenticated packet frame under `nonce`/`secret` (§4.1
/// `decode_authed`). Returns `Wait` if `buf` does not yet hold a complete
/// frame. Every failure path here is a MAC/format failure; nothing from an
/// unverified payload is ever returned.
pub fn decode_authed(nonce: u64, secret: &[u8; KEY_SIZE], buf: &[u8]) -> IpcResult<(Vec<u8>, usize)> {
    if buf.len() < HEADER_SIZE + MAC_SIZE {
        return Err(IpcError::Wait);
    }

    let encrypted_header = &buf[..HEADER_SIZE];
    let decrypted_header = crypto::stream_decrypt(secret, nonce, encrypted_header);

    if decrypted_header[0] != TYPE_AUTHED_PACKET {
        return Err(IpcError::fatal(ErrorKind::UnexpectedDataType));
    }
    let size = BigEndian::read_u32(&decrypted_header[1..5]) as usize;
    if size > MAX_AUTHED_PACKET_SIZE {
        return Err(IpcError::fatal(ErrorKind::PacketBadSize));
    }

    let total = HEADER_SIZE + MAC_SIZE + size;
    if buf.len() < total {
        return Err(IpcError::Wait);
    }

    let mac = &buf[HEADER_SIZE..HEADER_SIZE + MAC_SIZE];
    let ciphertext_payload = &buf[HEADER_SIZE + MAC_SIZE..total];

    let mut authed_bytes = Vec::with_capacity(HEADER_SIZE + size);
    authed_bytes.extend_from_slice(encrypted_header);
    authed_bytes.extend_from_slice(ciphertext_payload);

    let mut mac_fixed = [0u8; MAC_SIZE];
    mac_fixed.copy_from_slice(mac);
    if !crypto::authed_mac_verify(secret, nonce, &authed_bytes, &mac_fixed) {
        return Err(IpcError::fatal(ErrorKind::AuthFailure));
    }

    let decrypted = crypto::stream_decrypt(secret, nonce, &authed_bytes);
    let plaintext = decrypted[HEADER_SIZE..].to_vec();
    Ok((plaintext, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

    #[test]
    fn data_frame_roundtrip() {
        let frame = encode_data(b"hello");
        let payload = decode_data(&frame).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn data_frame_rejects_wrong_type() {
        let mut frame = encode_data(b"hello");
        frame[0] = TYPE_UINT8;
        assert_eq!(
            decode_data(&frame).unwrap_err(),
            IpcError::fatal(ErrorKind::UnexpectedDataType)
        );
    }

    #[test]
    fn primitive_roundtrip() {
        let frame = encode_uint8(7);
        assert_eq!(decode_primitive(&frame).unwrap().0, Primitive::Uint8(7));

        let frame = encode_int64(-42);
        assert_eq!(decode_primitive(&frame).unwrap().0, Primitive::Int64(-42));

        let frame = encode_string("agentd");
        assert_eq!(
            decode_primitive(&frame).unwrap().0,
            Primitive::String("agentd".to_string())
        );
    }

    #[test]
    fn authed_roundtrip() {
        let frame = encode_authed(1, &SECRET, b"command body").unwrap();
        let (plaintext, consumed) = decode_authed(1, &SECRET, &frame).unwrap();
        assert_eq!(plaintext, b"command body");
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn authed_decode_waits_on_partial_frame() {
        let frame = encode_authed(1, &SECRET, b"command body").unwrap();
        assert_eq!(decode_authed(1, &SECRET, &frame[..frame.len() - 1]), Err(IpcError::Wait));
    }

    #[test]
    fn authed_decode_rejects_wrong_nonce() {
        let frame = encode_authed(1, &SECRET, b"command body").unwrap();
        assert!(decode_authed(2, &SECRET, &frame).is_err());
    }

    #[test]
    fn authed_rejects_oversize_plaintext() {
        let huge = vec![0u8; MAX_AUTHED_PACKET_SIZE + 1];
        assert_eq!(
            encode_authed(1, &SECRET, &huge).unwrap_err(),
            IpcError::fatal(ErrorKind::PacketBadSize)
        );
    }

    #[test]
    fn authed_decode_rejects_tampered_mac() {
        let mut frame = encode_authed(1, &SECRET, b"command body").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 1;
        assert_eq!(
            decode_authed(1, &SECRET, &frame).unwrap_err(),
            IpcError::fatal(ErrorKind::AuthFailure)
        );
    }
}

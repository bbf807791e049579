//! Client-facing wire codec (§4.4): the three unencrypted handshake records
//! plus the authed command-phase frame shape. Distinct from
//! `agentd_dataservice::wire` even though the command frame carries the same
//! `DataMethod` ids — here there is never a child-index word, since the
//! protocol service injects that itself once it has created one (§4.4
//! "Correlation").

use agentd_crypto::{NONCE_SIZE, PUBLIC_KEY_SIZE};
use agentd_types::{DataMethod, EntityId, Id, Status};
use byteorder::{BigEndian, ByteOrder};

const WORD: usize = 4;
const SUITE_ID_SIZE: usize = 2;

/// Reserved request-id of handshake message 1 (§4.4).
pub const HANDSHAKE_INITIATE: u32 = 0xffff_ffff;
/// Reserved request-id of handshake message 3 and its response.
pub const HANDSHAKE_ACK: u32 = 0xffff_fffe;

pub const PROTOCOL_VERSION: u32 = 1;

/// Handshake message 1, unencrypted raw frame, client to server.
pub struct HandshakeRequest {
    pub request_id: u32,
    pub request_offset: u32,
    pub protocol_version: u32,
    pub suite_id: u16,
    pub entity_id: EntityId,
    pub client_key_nonce: [u8; NONCE_SIZE],
    pub client_challenge_nonce: [u8; NONCE_SIZE],
}

impl HandshakeRequest {
    pub const SIZE: usize = 4 * WORD + SUITE_ID_SIZE + Id::SIZE + 2 * NONCE_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        write_u32(&mut out, self.request_id);
        write_u32(&mut out, self.request_offset);
        write_u32(&mut out, self.protocol_version);
        write_u16(&mut out, self.suite_id);
        out.extend_from_slice(self.entity_id.as_bytes());
        out.extend_from_slice(&self.client_key_nonce);
        out.extend_from_slice(&self.client_challenge_nonce);
        out
    }

    /// Decodes message 1. Per §4.4 "size must match exactly" — any slack is
    /// itself a malformed request, not just a short one.
    pub fn decode(buf: &[u8]) -> Option<HandshakeRequest> {
        if buf.len() != Self::SIZE {
            return None;
        }
        let mut off = 0;
        let request_id = BigEndian::read_u32(&buf[off..off + WORD]);
        off += WORD;
        let request_offset = BigEndian::read_u32(&buf[off..off + WORD]);
        off += WORD;
        let protocol_version = BigEndian::read_u32(&buf[off..off + WORD]);
        off += WORD;
        let suite_id = BigEndian::read_u16(&buf[off..off + SUITE_ID_SIZE]);
        off += SUITE_ID_SIZE;
        let entity_id = EntityId(Id::from_slice(&buf[off..off + Id::SIZE])?);
        off += Id::SIZE;
        let mut client_key_nonce = [0u8; NONCE_SIZE];
        client_key_nonce.copy_from_slice(&buf[off..off + NONCE_SIZE]);
        off += NONCE_SIZE;
        let mut client_challenge_nonce = [0u8; NONCE_SIZE];
        client_challenge_nonce.copy_from_slice(&buf[off..off + NONCE_SIZE]);

        Some(HandshakeRequest {
            request_id,
            request_offset,
            protocol_version,
            suite_id,
            entity_id,
            client_key_nonce,
            client_challenge_nonce,
        })
    }
}

/// Handshake message 2, unencrypted raw frame, server to client. The MAC
/// covers every field above it concatenated with the client's
/// challenge-nonce (§4.4).
pub struct HandshakeResponse {
    pub request_id: u32,
    pub status: Status,
    pub protocol_version: u32,
    pub suite_id: u16,
    pub server_entity_id: EntityId,
    pub server_public_key: [u8; PUBLIC_KEY_SIZE],
    pub server_key_nonce: [u8; NONCE_SIZE],
    pub server_challenge_nonce: [u8; NONCE_SIZE],
}

impl HandshakeResponse {
    const RECORD_SIZE: usize =
        3 * WORD + SUITE_ID_SIZE + Id::SIZE + PUBLIC_KEY_SIZE + 2 * NONCE_SIZE;

    /// The record as it exists before the MAC is appended; this is exactly
    /// what `agentd_crypto::short_mac` signs, concatenated with the client's
    /// challenge-nonce.
    fn encode_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::RECORD_SIZE);
        write_u32(&mut out, self.request_id);
        write_u32(&mut out, 0);
        write_u32(&mut out, self.status.to_u32());
        write_u32(&mut out, self.protocol_version);
        write_u16(&mut out, self.suite_id);
        out.extend_from_slice(self.server_entity_id.as_bytes());
        out.extend_from_slice(&self.server_public_key);
        out.extend_from_slice(&self.server_key_nonce);
        out.extend_from_slice(&self.server_challenge_nonce);
        out
    }

    pub fn encode(&self, shared_secret: &[u8; agentd_crypto::KEY_SIZE], client_challenge_nonce: &[u8; NONCE_SIZE]) -> Vec<u8> {
        let mut record = self.encode_record();
        let mut mac_input = record.clone();
        mac_input.extend_from_slice(client_challenge_nonce);
        let mac = agentd_crypto::short_mac(shared_secret, &mac_input);
        record.extend_from_slice(&mac);
        record
    }

    pub fn decode(buf: &[u8]) -> Option<(HandshakeResponse, [u8; 32])> {
        if buf.len() != Self::RECORD_SIZE + 32 {
            return None;
        }
        let mut off = 0;
        let request_id = BigEndian::read_u32(&buf[off..off + WORD]);
        off += WORD;
        let _offset = BigEndian::read_u32(&buf[off..off + WORD]);
        off += WORD;
        let status = Status::from_u32(BigEndian::read_u32(&buf[off..off + WORD]))?;
        off += WORD;
        let protocol_version = BigEndian::read_u32(&buf[off..off + WORD]);
        off += WORD;
        let suite_id = BigEndian::read_u16(&buf[off..off + SUITE_ID_SIZE]);
        off += SUITE_ID_SIZE;
        let server_entity_id = EntityId(Id::from_slice(&buf[off..off + Id::SIZE])?);
        off += Id::SIZE;
        let mut server_public_key = [0u8; PUBLIC_KEY_SIZE];
        server_public_key.copy_from_slice(&buf[off..off + PUBLIC_KEY_SIZE]);
        off += PUBLIC_KEY_SIZE;
        let mut server_key_nonce = [0u8; NONCE_SIZE];
        server_key_nonce.copy_from_slice(&buf[off..off + NONCE_SIZE]);
        off += NONCE_SIZE;
        let mut server_challenge_nonce = [0u8; NONCE_SIZE];
        server_challenge_nonce.copy_from_slice(&buf[off..off + NONCE_SIZE]);
        off += NONCE_SIZE;
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&buf[off..off + 32]);

        Some((
            HandshakeResponse {
                request_id,
                status,
                protocol_version,
                suite_id,
                server_entity_id,
                server_public_key,
                server_key_nonce,
                server_challenge_nonce,
            },
            mac,
        ))
    }
}

/// Handshake message 3's plaintext (carried inside an authed frame under
/// nonce 1 on both sides, §4.4) and its authed response.
pub struct HandshakeAck {
    pub request_id: u32,
}

impl HandshakeAck {
    pub fn encode() -> Vec<u8> {
        let mut out = Vec::with_capacity(WORD);
        write_u32(&mut out, HANDSHAKE_ACK);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<HandshakeAck> {
        if buf.len() < WORD {
            return None;
        }
        Some(HandshakeAck {
            request_id: BigEndian::read_u32(&buf[0..WORD]),
        })
    }
}

pub fn encode_handshake_ack_response(status: Status) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 * WORD);
    write_u32(&mut out, HANDSHAKE_ACK);
    write_u32(&mut out, 0);
    write_u32(&mut out, status.to_u32());
    out
}

/// Command-phase request, carried as the plaintext of an authed frame
/// (§4.4 "Command phase"). Body is whatever `DataMethod`-specific encoding
/// the caller expects; the protocol service never looks inside it beyond
/// forwarding it on to the data service with a child-index word spliced in.
pub struct CommandRequest {
    pub method: DataMethod,
    pub offset: u32,
    pub body: Vec<u8>,
}

impl CommandRequest {
    pub fn decode(buf: &[u8]) -> Result<CommandRequest, Status> {
        if buf.len() < 2 * WORD {
            return Err(Status::RequestPacketInvalidSize);
        }
        let method =
            DataMethod::from_u32(BigEndian::read_u32(&buf[0..WORD])).ok_or(Status::MalformedRequest)?;
        let offset = BigEndian::read_u32(&buf[WORD..2 * WORD]);
        Ok(CommandRequest {
            method,
            offset,
            body: buf[2 * WORD..].to_vec(),
        })
    }
}

pub struct CommandResponse {
    pub method: DataMethod,
    pub offset: u32,
    pub status: Status,
    pub body: Vec<u8>,
}

impl CommandResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * WORD + self.body.len());
        write_u32(&mut out, self.method as u32);
        write_u32(&mut out, self.offset);
        write_u32(&mut out, self.status.to_u32());
        out.extend_from_slice(&self.body);
        out
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    let mut body = [0u8; WORD];
    BigEndian::write_u32(&mut body, value);
    out.extend_from_slice(&body);
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    let mut body = [0u8; SUITE_ID_SIZE];
    BigEndian::write_u16(&mut body, value);
    out.extend_from_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_roundtrip() {
        let req = HandshakeRequest {
            request_id: HANDSHAKE_INITIATE,
            request_offset: 0,
            protocol_version: PROTOCOL_VERSION,
            suite_id: agentd_crypto::SUITE_ID,
            entity_id: EntityId::random(),
            client_key_nonce: [1u8; NONCE_SIZE],
            client_challenge_nonce: [2u8; NONCE_SIZE],
        };
        let encoded = req.encode();
        assert_eq!(encoded.len(), HandshakeRequest::SIZE);
        let decoded = HandshakeRequest::decode(&encoded).unwrap();
        assert_eq!(decoded.request_id, HANDSHAKE_INITIATE);
        assert_eq!(decoded.entity_id, req.entity_id);
        assert_eq!(decoded.client_key_nonce, req.client_key_nonce);
    }

    #[test]
    fn handshake_request_rejects_wrong_size() {
        assert!(HandshakeRequest::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn handshake_response_mac_verifies() {
        let secret = [9u8; agentd_crypto::KEY_SIZE];
        let client_challenge = [3u8; NONCE_SIZE];
        let resp = HandshakeResponse {
            request_id: HANDSHAKE_INITIATE,
            status: Status::Success,
            protocol_version: PROTOCOL_VERSION,
            suite_id: agentd_crypto::SUITE_ID,
            server_entity_id: EntityId::random(),
            server_public_key: [4u8; PUBLIC_KEY_SIZE],
            server_key_nonce: [5u8; NONCE_SIZE],
            server_challenge_nonce: [6u8; NONCE_SIZE],
        };
        let encoded = resp.encode(&secret, &client_challenge);
        let (decoded, mac) = HandshakeResponse::decode(&encoded).unwrap();
        assert_eq!(decoded.server_entity_id, resp.server_entity_id);

        let mut mac_input = encoded[..encoded.len() - 32].to_vec();
        mac_input.extend_from_slice(&client_challenge);
        assert!(agentd_crypto::short_mac_verify(&secret, &mac_input, &mac));
    }

    #[test]
    fn command_request_roundtrip() {
        let req = CommandRequest {
            method: DataMethod::ArtifactRead,
            offset: 42,
            body: vec![1, 2, 3],
        };
        let mut raw = Vec::new();
        write_u32(&mut raw, req.method as u32);
        write_u32(&mut raw, req.offset);
        raw.extend_from_slice(&req.body);
        let decoded = CommandRequest::decode(&raw).unwrap();
        assert_eq!(decoded.offset, 42);
        assert_eq!(decoded.body, vec![1, 2, 3]);
    }
}

//! Random-service wire codec (§6): a request is `method-id(4) | offset(4) |
//! length(4)`; a response is `method-id(4) | offset(4) | status(4) |
//! entropy bytes`. The offset has no child-context meaning here (the random
//! service has no child contexts) and is simply echoed back to the caller,
//! matching the correlation pattern used across every service.

use agentd_types::{RandomMethod, Status};
use byteorder::{BigEndian, ByteOrder};

const WORD: usize = 4;

/// Hard cap on a single `get_random_bytes` request, chosen generously above
/// the largest entropy draw the core ever makes (two nonces for a handshake,
/// or one block id for canonization).
pub const MAX_REQUEST_LENGTH: usize = 4096;

pub struct Request {
    pub method: RandomMethod,
    pub offset: u32,
    pub length: usize,
}

impl Request {
    pub fn encode(offset: u32, length: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * WORD);
        write_u32(&mut out, RandomMethod::GetRandomBytes as u32);
        write_u32(&mut out, offset);
        write_u32(&mut out, length as u32);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Request, Status> {
        if buf.len() < 3 * WORD {
            return Err(Status::RequestPacketInvalidSize);
        }
        let method = RandomMethod::from_u32(BigEndian::read_u32(&buf[0..WORD]))
            .ok_or(Status::MalformedRequest)?;
        let offset = BigEndian::read_u32(&buf[WORD..2 * WORD]);
        let length = BigEndian::read_u32(&buf[2 * WORD..3 * WORD]) as usize;
        Ok(Request { method, offset, length })
    }
}

pub struct Response {
    pub method: RandomMethod,
    pub offset: u32,
    pub status: Status,
    pub entropy: Vec<u8>,
}

impl Response {
    pub fn ok(offset: u32, entropy: Vec<u8>) -> Response {
        Response {
            method: RandomMethod::GetRandomBytes,
            offset,
            status: Status::Success,
            entropy,
        }
    }

    pub fn err(offset: u32, status: Status) -> Response {
        Response {
            method: RandomMethod::GetRandomBytes,
            offset,
            status,
            entropy: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * WORD + self.entropy.len());
        write_u32(&mut out, self.method as u32);
        write_u32(&mut out, self.offset);
        write_u32(&mut out, self.status.to_u32());
        out.extend_from_slice(&self.entropy);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Response> {
        if buf.len() < 3 * WORD {
            return None;
        }
        let method = RandomMethod::from_u32(BigEndian::read_u32(&buf[0..WORD]))?;
        let offset = BigEndian::read_u32(&buf[WORD..2 * WORD]);
        let status = Status::from_u32(BigEndian::read_u32(&buf[2 * WORD..3 * WORD]))?;
        Some(Response {
            method,
            offset,
            status,
            entropy: buf[3 * WORD..].to_vec(),
        })
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    let mut body = [0u8; WORD];
    BigEndian::write_u32(&mut body, value);
    out.extend_from_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let encoded = Request::encode(11, 32);
        let decoded = Request::decode(&encoded).unwrap();
        assert_eq!(decoded.offset, 11);
        assert_eq!(decoded.length, 32);
        assert_eq!(decoded.method, RandomMethod::GetRandomBytes);
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response::ok(11, vec![1, 2, 3, 4]);
        let encoded = resp.encode();
        let decoded = Response::decode(&encoded).unwrap();
        assert_eq!(decoded.offset, 11);
        assert!(decoded.status.is_success());
        assert_eq!(decoded.entropy, vec![1, 2, 3, 4]);
    }

    #[test]
    fn short_request_is_invalid_size() {
        assert_eq!(Request::decode(&[0, 0]), Err(Status::RequestPacketInvalidSize));
    }
}

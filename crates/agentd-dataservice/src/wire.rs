//! Data-service request/response codec (§4.3, §6). A request is
//! `method-id(4) | child-index(4) | body` (root-context operations omit the
//! child index); a response is always `method-id(4) | offset(4) | status(4)
//! | body`, even when the request failed to decode at all.

use agentd_types::{ArtifactId, BlockId, CapBitmap, DataMethod, Id, Status, TransactionId, TransactionState};
use byteorder::{BigEndian, ByteOrder};

const WORD: usize = 4;

pub struct Request {
    pub method: DataMethod,
    pub child_index: Option<u32>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: DataMethod, child_index: Option<u32>, body: Vec<u8>) -> Request {
        Request {
            method,
            child_index,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * WORD + self.body.len());
        write_u32(&mut out, self.method as u32);
        if let Some(index) = self.child_index {
            write_u32(&mut out, index);
        }
        out.extend_from_slice(&self.body);
        out
    }

    /// Decodes a request header. On malformed input this returns a
    /// `Status` directly rather than an error type, since §4.3's response
    /// rule is "a response is always emitted, even on parse failure".
    pub fn decode(buf: &[u8]) -> Result<Request, Status> {
        if buf.len() < WORD {
            return Err(Status::RequestPacketInvalidSize);
        }
        let method = DataMethod::from_u32(BigEndian::read_u32(&buf[0..WORD]))
            .ok_or(Status::MalformedRequest)?;

        if method.is_root_context_op() {
            return Ok(Request::new(method, None, buf[WORD..].to_vec()));
        }

        if buf.len() < 2 * WORD {
            return Err(Status::RequestPacketInvalidSize);
        }
        let child_index = BigEndian::read_u32(&buf[WORD..2 * WORD]);
        Ok(Request::new(method, Some(child_index), buf[2 * WORD..].to_vec()))
    }
}

pub struct Response {
    pub method: DataMethod,
    pub offset: u32,
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(method: DataMethod, offset: u32, status: Status, body: Vec<u8>) -> Response {
        Response {
            method,
            offset,
            status,
            body,
        }
    }

    pub fn ok(method: DataMethod, offset: u32, body: Vec<u8>) -> Response {
        Response::new(method, offset, Status::Success, body)
    }

    pub fn err(method: DataMethod, offset: u32, status: Status) -> Response {
        Response::new(method, offset, status, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * WORD + self.body.len());
        write_u32(&mut out, self.method as u32);
        write_u32(&mut out, self.offset);
        write_u32(&mut out, self.status.to_u32());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Response> {
        if buf.len() < 3 * WORD {
            return None;
        }
        let method = DataMethod::from_u32(BigEndian::read_u32(&buf[0..WORD]))?;
        let offset = BigEndian::read_u32(&buf[WORD..2 * WORD]);
        let status = Status::from_u32(BigEndian::read_u32(&buf[2 * WORD..3 * WORD]))?;
        Some(Response::new(method, offset, status, buf[3 * WORD..].to_vec()))
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    let mut body = [0u8; WORD];
    BigEndian::write_u32(&mut body, value);
    out.extend_from_slice(&body);
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    let mut body = [0u8; 8];
    BigEndian::write_u64(&mut body, value);
    out.extend_from_slice(&body);
}

fn write_id(out: &mut Vec<u8>, id: &Id) {
    out.extend_from_slice(id.as_bytes());
}

fn read_id(buf: &[u8], offset: usize) -> Option<Id> {
    Id::from_slice(buf.get(offset..offset + Id::SIZE)?)
}

/// `child_context_create` request body: a caps bitmap (8 bytes).
pub fn encode_child_context_create_req(caps: CapBitmap) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    write_u64(&mut out, caps.0);
    out
}

pub fn decode_child_context_create_req(body: &[u8]) -> Option<CapBitmap> {
    if body.len() < 8 {
        return None;
    }
    Some(CapBitmap::from_bits(BigEndian::read_u64(&body[0..8])))
}

/// `child_context_create` response body: the granted index.
pub fn encode_child_context_create_resp(index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(WORD);
    write_u32(&mut out, index);
    out
}

pub fn decode_child_context_create_resp(body: &[u8]) -> Option<u32> {
    if body.len() < WORD {
        return None;
    }
    Some(BigEndian::read_u32(&body[0..WORD]))
}

/// `artifact_read` request body: the artifact id.
pub fn encode_artifact_read_req(id: ArtifactId) -> Vec<u8> {
    let mut out = Vec::with_capacity(Id::SIZE);
    write_id(&mut out, &id.0);
    out
}

pub fn decode_artifact_read_req(body: &[u8]) -> Option<ArtifactId> {
    read_id(body, 0).map(ArtifactId)
}

pub struct ArtifactReadResp {
    pub id: ArtifactId,
    pub first_transaction_id: TransactionId,
    pub latest_transaction_id: TransactionId,
    pub first_height: u64,
    pub latest_height: u64,
    pub latest_state: TransactionState,
}

pub fn encode_artifact_read_resp(r: &ArtifactReadResp) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 * Id::SIZE + 2 * 8 + WORD);
    write_id(&mut out, &r.id.0);
    write_id(&mut out, &r.first_transaction_id.0);
    write_id(&mut out, &r.latest_transaction_id.0);
    write_u64(&mut out, r.first_height);
    write_u64(&mut out, r.latest_height);
    write_u32(&mut out, r.latest_state.to_u32());
    out
}

pub fn decode_artifact_read_resp(body: &[u8]) -> Option<ArtifactReadResp> {
    if body.len() < 3 * Id::SIZE + 2 * 8 + WORD {
        return None;
    }
    let mut off = 0;
    let id = ArtifactId(read_id(body, off)?);
    off += Id::SIZE;
    let first_transaction_id = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let latest_transaction_id = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let first_height = BigEndian::read_u64(&body[off..off + 8]);
    off += 8;
    let latest_height = BigEndian::read_u64(&body[off..off + 8]);
    off += 8;
    let latest_state = TransactionState::from_u32(BigEndian::read_u32(&body[off..off + WORD]))?;
    Some(ArtifactReadResp {
        id,
        first_transaction_id,
        latest_transaction_id,
        first_height,
        latest_height,
        latest_state,
    })
}

/// `block_id_by_height_read` request body: the height.
pub fn encode_height_req(height: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    write_u64(&mut out, height);
    out
}

pub fn decode_height_req(body: &[u8]) -> Option<u64> {
    if body.len() < 8 {
        return None;
    }
    Some(BigEndian::read_u64(&body[0..8]))
}

/// Shared by `block_id_latest_read` and `block_id_by_height_read` responses.
pub fn encode_block_id_resp(id: BlockId) -> Vec<u8> {
    let mut out = Vec::with_capacity(Id::SIZE);
    write_id(&mut out, &id.0);
    out
}

pub fn decode_block_id_resp(body: &[u8]) -> Option<BlockId> {
    read_id(body, 0).map(BlockId)
}

/// `block_read` request body: the block id.
pub fn encode_block_read_req(id: BlockId) -> Vec<u8> {
    encode_block_id_resp(id)
}

pub fn decode_block_read_req(body: &[u8]) -> Option<BlockId> {
    read_id(body, 0).map(BlockId)
}

pub struct BlockReadResp {
    pub id: BlockId,
    pub prev: BlockId,
    pub next: BlockId,
    pub first_transaction_id: TransactionId,
    pub height: u64,
    pub cert: Vec<u8>,
}

pub fn encode_block_read_resp(r: &BlockReadResp) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 * Id::SIZE + 8 + r.cert.len());
    write_id(&mut out, &r.id.0);
    write_id(&mut out, &r.prev.0);
    write_id(&mut out, &r.next.0);
    write_id(&mut out, &r.first_transaction_id.0);
    write_u64(&mut out, r.height);
    out.extend_from_slice(&r.cert);
    out
}

pub fn decode_block_read_resp(body: &[u8]) -> Option<BlockReadResp> {
    if body.len() < 4 * Id::SIZE + 8 {
        return None;
    }
    let mut off = 0;
    let id = BlockId(read_id(body, off)?);
    off += Id::SIZE;
    let prev = BlockId(read_id(body, off)?);
    off += Id::SIZE;
    let next = BlockId(read_id(body, off)?);
    off += Id::SIZE;
    let first_transaction_id = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let height = BigEndian::read_u64(&body[off..off + 8]);
    off += 8;
    Some(BlockReadResp {
        id,
        prev,
        next,
        first_transaction_id,
        height,
        cert: body[off..].to_vec(),
    })
}

/// `block_make` request body: block id followed by the certificate bytes.
pub fn encode_block_make_req(id: BlockId, cert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(Id::SIZE + cert.len());
    write_id(&mut out, &id.0);
    out.extend_from_slice(cert);
    out
}

pub fn decode_block_make_req(body: &[u8]) -> Option<(BlockId, &[u8])> {
    let id = BlockId(read_id(body, 0)?);
    Some((id, &body[Id::SIZE..]))
}

/// `canonized_transaction_get` request body: the transaction id.
pub fn encode_txn_id_req(id: TransactionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(Id::SIZE);
    write_id(&mut out, &id.0);
    out
}

pub fn decode_txn_id_req(body: &[u8]) -> Option<TransactionId> {
    read_id(body, 0).map(TransactionId)
}

pub struct CanonizedTransactionResp {
    pub key: TransactionId,
    pub prev: TransactionId,
    pub next: TransactionId,
    pub artifact_id: ArtifactId,
    pub block_id: BlockId,
    pub state: TransactionState,
    pub cert: Vec<u8>,
}

pub fn encode_canonized_transaction_resp(r: &CanonizedTransactionResp) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 * Id::SIZE + WORD + r.cert.len());
    write_id(&mut out, &r.key.0);
    write_id(&mut out, &r.prev.0);
    write_id(&mut out, &r.next.0);
    write_id(&mut out, &r.artifact_id.0);
    write_id(&mut out, &r.block_id.0);
    write_u32(&mut out, r.state.to_u32());
    out.extend_from_slice(&r.cert);
    out
}

pub fn decode_canonized_transaction_resp(body: &[u8]) -> Option<CanonizedTransactionResp> {
    if body.len() < 5 * Id::SIZE + WORD {
        return None;
    }
    let mut off = 0;
    let key = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let prev = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let next = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let artifact_id = ArtifactId(read_id(body, off)?);
    off += Id::SIZE;
    let block_id = BlockId(read_id(body, off)?);
    off += Id::SIZE;
    let state = TransactionState::from_u32(BigEndian::read_u32(&body[off..off + WORD]))?;
    off += WORD;
    Some(CanonizedTransactionResp {
        key,
        prev,
        next,
        artifact_id,
        block_id,
        state,
        cert: body[off..].to_vec(),
    })
}

/// `transaction_submit` request body: txn id, artifact id, then cert bytes.
pub fn encode_transaction_submit_req(txn_id: TransactionId, artifact_id: ArtifactId, cert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * Id::SIZE + cert.len());
    write_id(&mut out, &txn_id.0);
    write_id(&mut out, &artifact_id.0);
    out.extend_from_slice(cert);
    out
}

pub fn decode_transaction_submit_req(body: &[u8]) -> Option<(TransactionId, ArtifactId, &[u8])> {
    if body.len() < 2 * Id::SIZE {
        return None;
    }
    let txn_id = TransactionId(read_id(body, 0)?);
    let artifact_id = ArtifactId(read_id(body, Id::SIZE)?);
    Some((txn_id, artifact_id, &body[2 * Id::SIZE..]))
}

pub struct PendingTransactionResp {
    pub key: TransactionId,
    pub prev: TransactionId,
    pub next: TransactionId,
    pub artifact_id: ArtifactId,
    pub state: TransactionState,
    pub cert: Vec<u8>,
}

pub fn encode_pending_transaction_resp(r: &PendingTransactionResp) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 * Id::SIZE + WORD + r.cert.len());
    write_id(&mut out, &r.key.0);
    write_id(&mut out, &r.prev.0);
    write_id(&mut out, &r.next.0);
    write_id(&mut out, &r.artifact_id.0);
    write_u32(&mut out, r.state.to_u32());
    out.extend_from_slice(&r.cert);
    out
}

pub fn decode_pending_transaction_resp(body: &[u8]) -> Option<PendingTransactionResp> {
    if body.len() < 4 * Id::SIZE + WORD {
        return None;
    }
    let mut off = 0;
    let key = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let prev = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let next = TransactionId(read_id(body, off)?);
    off += Id::SIZE;
    let artifact_id = ArtifactId(read_id(body, off)?);
    off += Id::SIZE;
    let state = TransactionState::from_u32(BigEndian::read_u32(&body[off..off + WORD]))?;
    off += WORD;
    Some(PendingTransactionResp {
        key,
        prev,
        next,
        artifact_id,
        state,
        cert: body[off..].to_vec(),
    })
}

/// `global_setting_set`/`global_setting_get` request body: a fixed `u32`
/// key (§6), then (for `set`) the raw value bytes.
pub fn encode_global_setting_set_req(key: u32, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(WORD + value.len());
    write_u32(&mut out, key);
    out.extend_from_slice(value);
    out
}

pub fn decode_global_setting_set_req(body: &[u8]) -> Option<(u32, &[u8])> {
    if body.len() < WORD {
        return None;
    }
    let key = BigEndian::read_u32(&body[0..WORD]);
    Some((key, &body[WORD..]))
}

pub fn encode_global_setting_get_req(key: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(WORD);
    write_u32(&mut out, key);
    out
}

pub fn decode_global_setting_get_req(body: &[u8]) -> Option<u32> {
    decode_global_setting_set_req(body).map(|(key, _)| key)
}

/// `root_context_reduce_caps` request body: the replacement bitmap.
pub fn encode_reduce_caps_req(caps: CapBitmap) -> Vec<u8> {
    encode_child_context_create_req(caps)
}

pub fn decode_reduce_caps_req(body: &[u8]) -> Option<CapBitmap> {
    decode_child_context_create_req(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_roundtrip_with_child_index() {
        let req = Request::new(
            DataMethod::ArtifactRead,
            Some(7),
            encode_artifact_read_req(ArtifactId::random()),
        );
        let encoded = req.encode();
        let decoded = Request::decode(&encoded).unwrap();
        assert_eq!(decoded.child_index, Some(7));
        assert_eq!(decoded.body, req.body);
    }

    #[test]
    fn root_context_request_omits_child_index() {
        let req = Request::new(DataMethod::RootContextInit, None, b"/var/db".to_vec());
        let encoded = req.encode();
        let decoded = Request::decode(&encoded).unwrap();
        assert_eq!(decoded.child_index, None);
        assert_eq!(decoded.body, b"/var/db");
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response::ok(DataMethod::BlockIdLatestGet, 3, encode_block_id_resp(BlockId::root()));
        let encoded = resp.encode();
        let decoded = Response::decode(&encoded).unwrap();
        assert_eq!(decoded.offset, 3);
        assert!(decoded.status.is_success());
        assert_eq!(decode_block_id_resp(&decoded.body).unwrap(), BlockId::root());
    }

    #[test]
    fn short_request_is_invalid_size() {
        assert_eq!(Request::decode(&[0u8, 0, 0]), Err(Status::RequestPacketInvalidSize));
    }

    #[test]
    fn global_setting_set_req_roundtrip() {
        let encoded = encode_global_setting_set_req(0x17, &[1, 2, 3]);
        let (key, value) = decode_global_setting_set_req(&encoded).unwrap();
        assert_eq!(key, 0x17);
        assert_eq!(value, &[1, 2, 3]);
    }

    #[test]
    fn global_setting_get_req_roundtrip() {
        let encoded = encode_global_setting_get_req(0x17);
        let key = decode_global_setting_get_req(&encoded).unwrap();
        assert_eq!(key, 0x17);
    }
}

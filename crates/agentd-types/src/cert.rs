//! Block certificate encoding (§4.5 "Block assembly"). Shared by the data
//! service, which parses a certificate to find the transactions a
//! `block_make` call references, and the canonization pipeline, which
//! assembles certificates before issuing the call.
//!
//! Layout: a fixed header followed by one framed copy of each referenced
//! transaction's certificate, back to back. Each framed copy is the
//! transaction id followed by a length-prefixed blob so the header never
//! needs to know the transaction count up front.

use byteorder::{BigEndian, ByteOrder};

use crate::ids::{BlockId, EntityId, Id, TransactionId};

pub const HASH_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

pub const HEADER_SIZE: usize = 4 // version
    + 8 // timestamp
    + 2 // suite id
    + Id::SIZE // cert type
    + Id::SIZE // block id
    + Id::SIZE // prev block id
    + HASH_SIZE // prev block hash
    + 8 // height
    + Id::SIZE // signer id
    + SIGNATURE_SIZE; // signature

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCertHeader {
    pub version: u32,
    pub timestamp: u64,
    pub suite_id: u16,
    pub cert_type: Id,
    pub block_id: BlockId,
    pub prev_block_id: BlockId,
    pub prev_block_hash: [u8; HASH_SIZE],
    pub height: u64,
    pub signer_id: EntityId,
    pub signature: [u8; SIGNATURE_SIZE],
}

pub fn encode_header(out: &mut Vec<u8>, header: &BlockCertHeader) {
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, header.version);
    out.extend_from_slice(&word);

    let mut qword = [0u8; 8];
    BigEndian::write_u64(&mut qword, header.timestamp);
    out.extend_from_slice(&qword);

    let mut hword = [0u8; 2];
    BigEndian::write_u16(&mut hword, header.suite_id);
    out.extend_from_slice(&hword);

    out.extend_from_slice(header.cert_type.as_bytes());
    out.extend_from_slice(header.block_id.as_bytes());
    out.extend_from_slice(header.prev_block_id.as_bytes());
    out.extend_from_slice(&header.prev_block_hash);

    BigEndian::write_u64(&mut qword, header.height);
    out.extend_from_slice(&qword);

    out.extend_from_slice(header.signer_id.as_bytes());
    out.extend_from_slice(&header.signature);
}

pub fn decode_header(buf: &[u8]) -> Option<BlockCertHeader> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let mut off = 0;
    let version = BigEndian::read_u32(&buf[off..off + 4]);
    off += 4;
    let timestamp = BigEndian::read_u64(&buf[off..off + 8]);
    off += 8;
    let suite_id = BigEndian::read_u16(&buf[off..off + 2]);
    off += 2;
    let cert_type = Id::from_slice(&buf[off..off + Id::SIZE])?;
    off += Id::SIZE;
    let block_id = BlockId::from_slice(&buf[off..off + Id::SIZE])?;
    off += Id::SIZE;
    let prev_block_id = BlockId::from_slice(&buf[off..off + Id::SIZE])?;
    off += Id::SIZE;
    let mut prev_block_hash = [0u8; HASH_SIZE];
    prev_block_hash.copy_from_slice(&buf[off..off + HASH_SIZE]);
    off += HASH_SIZE;
    let height = BigEndian::read_u64(&buf[off..off + 8]);
    off += 8;
    let signer_id = EntityId::from_slice(&buf[off..off + Id::SIZE])?;
    off += Id::SIZE;
    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&buf[off..off + SIGNATURE_SIZE]);

    Some(BlockCertHeader {
        version,
        timestamp,
        suite_id,
        cert_type,
        block_id,
        prev_block_id,
        prev_block_hash,
        height,
        signer_id,
        signature,
    })
}

/// Builds a full block certificate from its header and the ordered list of
/// referenced transaction certificates.
pub fn build(header: &BlockCertHeader, txn_certs: &[(TransactionId, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HEADER_SIZE + txn_certs.iter().map(|(_, c)| Id::SIZE + 4 + c.len()).sum::<usize>(),
    );
    encode_header(&mut out, header);
    for (id, cert) in txn_certs {
        out.extend_from_slice(id.as_bytes());
        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, cert.len() as u32);
        out.extend_from_slice(&word);
        out.extend_from_slice(cert);
    }
    out
}

/// Recovers the ordered list of transaction ids a certificate references,
/// without needing the header fields or the cert bytes themselves.
pub fn transaction_ids(cert: &[u8]) -> Vec<TransactionId> {
    let mut ids = Vec::new();
    if cert.len() < HEADER_SIZE {
        return ids;
    }
    let mut off = HEADER_SIZE;
    while off + Id::SIZE + 4 <= cert.len() {
        let id = match TransactionId::from_slice(&cert[off..off + Id::SIZE]) {
            Some(id) => id,
            None => break,
        };
        off += Id::SIZE;
        let len = BigEndian::read_u32(&cert[off..off + 4]) as usize;
        off += 4;
        if off + len > cert.len() {
            break;
        }
        off += len;
        ids.push(id);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockCertHeader {
        BlockCertHeader {
            version: 1,
            timestamp: 1_700_000_000,
            suite_id: 1,
            cert_type: Id::random(),
            block_id: BlockId::random(),
            prev_block_id: BlockId::root(),
            prev_block_hash: [7u8; HASH_SIZE],
            height: 1,
            signer_id: EntityId::random(),
            signature: [9u8; SIGNATURE_SIZE],
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let mut out = Vec::new();
        encode_header(&mut out, &header);
        assert_eq!(decode_header(&out).unwrap(), header);
    }

    #[test]
    fn transaction_ids_recovers_every_entry_in_order() {
        let header = sample_header();
        let txns = vec![
            (TransactionId::random(), vec![1, 2, 3]),
            (TransactionId::random(), vec![4, 5, 6, 7]),
        ];
        let cert = build(&header, &txns);
        let ids = transaction_ids(&cert);
        assert_eq!(ids, txns.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    }

    #[test]
    fn transaction_ids_on_header_only_cert_is_empty() {
        let header = sample_header();
        let cert = build(&header, &[]);
        assert!(transaction_ids(&cert).is_empty());
    }
}

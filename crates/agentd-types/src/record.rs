use crate::ids::{ArtifactId, BlockId, TransactionId};

/// Lifecycle state of a transaction as it moves from submission through
/// attestation (performed by the out-of-scope attestor collaborator) to
/// canonization.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TransactionState {
    Submitted = 0,
    Attested = 1,
    Canonized = 2,
}

impl TransactionState {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<TransactionState> {
        use TransactionState::*;
        Some(match value {
            0 => Submitted,
            1 => Attested,
            2 => Canonized,
            _ => return None,
        })
    }
}

/// A transaction record threaded into the doubly linked pending queue, or
/// (once canonized) indexed by id with a block back-reference.
#[derive(Clone, Debug)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub prev: TransactionId,
    pub next: TransactionId,
    pub artifact_id: ArtifactId,
    pub state: TransactionState,
    pub block_id: Option<BlockId>,
    pub cert: Vec<u8>,
}

/// A persisted block: part of a doubly linked chain keyed by height.
#[derive(Clone, Debug)]
pub struct BlockRecord {
    pub id: BlockId,
    pub prev: BlockId,
    pub next: Option<BlockId>,
    pub first_transaction_id: TransactionId,
    pub height: u64,
    pub cert: Vec<u8>,
}

/// A persisted artifact summary, updated every time canonization writes a
/// transaction that touches it.
#[derive(Clone, Debug)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub first_transaction_id: TransactionId,
    pub latest_transaction_id: TransactionId,
    pub first_height: u64,
    pub latest_height: u64,
    pub latest_state: TransactionState,
}

/// Maximum size, in bytes, of a transaction certificate accepted by
/// `transaction_submit` (§8 boundary behavior: "≈ 32 KiB").
pub const MAX_TRANSACTION_CERT_SIZE: usize = 32 * 1024;

/// Hard cap on the declared size of an authenticated packet frame (§4.1).
pub const MAX_AUTHED_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Hard cap on the declared size of a raw data frame (§4.1 `decode_data`).
pub const MAX_DATA_FRAME_SIZE: usize = 1024 * 1024 * 1024;

//! The in-memory backing store behind the data-service wire protocol. The
//! real LMDB-backed B-tree layout is out of scope (§1, §6): this is the
//! collaborator that honours the read/write semantics of §4.3 well enough
//! to drive the protocol and canonization pipeline end to end in tests.

use hashbrown::HashMap;

use agentd_types::{
    ArtifactId, ArtifactRecord, BlockId, BlockRecord, CapBitmap, TransactionId, TransactionRecord,
    TransactionState,
};

/// A child context: a capability bitmap bound to an index the caller must
/// present on every subsequent request (§3 "Child context").
struct ChildContext {
    caps: CapBitmap,
    live: bool,
}

/// Arena of child-context slots with stable, recyclable indices (§9 design
/// note: arena with stable indices in place of intrusive linked lists).
pub struct ChildContextArena {
    slots: Vec<ChildContext>,
    free: Vec<u32>,
    max: u32,
}

impl ChildContextArena {
    pub fn new(max: u32) -> ChildContextArena {
        ChildContextArena {
            slots: Vec::new(),
            free: Vec::new(),
            max,
        }
    }

    /// Creates a child context whose caps are the intersection of `parent`
    /// and `requested` (§4.3 `child_context_create`). Returns `None` if the
    /// arena is full.
    pub fn create(&mut self, parent: CapBitmap, requested: CapBitmap) -> Option<u32> {
        let caps = parent.intersect(requested);
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = ChildContext { caps, live: true };
            return Some(index);
        }
        if self.slots.len() as u32 >= self.max {
            return None;
        }
        let index = self.slots.len() as u32;
        self.slots.push(ChildContext { caps, live: true });
        Some(index)
    }

    pub fn close(&mut self, index: u32) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot) if slot.live => {
                slot.live = false;
                self.free.push(index);
                true
            }
            _ => false,
        }
    }

    pub fn caps(&self, index: u32) -> Option<CapBitmap> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.live)
            .map(|slot| slot.caps)
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.slots
            .get(index as usize)
            .map(|slot| slot.live)
            .unwrap_or(false)
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum StoreError {
    NotFound,
    AlreadyExists,
}

/// The doubly linked pending-transaction queue plus the indexed stores for
/// artifacts, canonized transactions and blocks (§3).
pub struct Store {
    pub root_caps: CapBitmap,
    pending: HashMap<TransactionId, TransactionRecord>,
    pending_head: TransactionId,
    canonized: HashMap<TransactionId, TransactionRecord>,
    artifacts: HashMap<ArtifactId, ArtifactRecord>,
    blocks: HashMap<BlockId, BlockRecord>,
    blocks_by_height: HashMap<u64, BlockId>,
    latest_block: BlockId,
    settings: HashMap<u32, Vec<u8>>,
}

impl Store {
    pub fn new() -> Store {
        Store {
            root_caps: CapBitmap::FULL,
            pending: HashMap::new(),
            pending_head: TransactionId::begin_sentinel(),
            canonized: HashMap::new(),
            artifacts: HashMap::new(),
            blocks: HashMap::new(),
            blocks_by_height: HashMap::new(),
            latest_block: BlockId::root(),
            settings: HashMap::new(),
        }
    }

    pub fn set_setting(&mut self, key: u32, value: Vec<u8>) {
        self.settings.insert(key, value);
    }

    pub fn get_setting(&self, key: u32) -> Option<&[u8]> {
        self.settings.get(&key).map(|v| v.as_slice())
    }

    pub fn artifact_read(&self, id: ArtifactId) -> Option<&ArtifactRecord> {
        self.artifacts.get(&id)
    }

    pub fn block_id_latest(&self) -> BlockId {
        self.latest_block
    }

    pub fn block_id_by_height(&self, height: u64) -> Option<BlockId> {
        self.blocks_by_height.get(&height).copied()
    }

    pub fn block_read(&self, id: BlockId) -> Option<&BlockRecord> {
        self.blocks.get(&id)
    }

    pub fn canonized_transaction_get(&self, id: TransactionId) -> Option<&TransactionRecord> {
        self.canonized.get(&id)
    }

    /// Appends a new transaction to the tail of the pending queue with state
    /// `SUBMITTED` (§4.3 `transaction_submit`).
    pub fn transaction_submit(
        &mut self,
        id: TransactionId,
        artifact_id: ArtifactId,
        cert: Vec<u8>,
    ) -> Result<(), StoreError> {
        if self.pending.contains_key(&id) || self.canonized.contains_key(&id) {
            return Err(StoreError::AlreadyExists);
        }

        let prev = self.pending_tail_real();
        if let Some(prev_id) = prev {
            self.pending.get_mut(&prev_id).unwrap().next = id;
        } else {
            self.pending_head = id;
        }

        self.pending.insert(
            id,
            TransactionRecord {
                id,
                prev: prev.unwrap_or_else(TransactionId::begin_sentinel),
                next: TransactionId::end_sentinel(),
                artifact_id,
                state: TransactionState::Submitted,
                block_id: None,
                cert,
            },
        );
        Ok(())
    }

    fn pending_tail_real(&self) -> Option<TransactionId> {
        if self.pending_head.is_begin_sentinel() {
            return None;
        }
        let mut cur = self.pending_head;
        loop {
            let record = self.pending.get(&cur)?;
            if record.next.is_end_sentinel() {
                return Some(cur);
            }
            cur = record.next;
        }
    }

    /// Marks a pending transaction `ATTESTED`. The attestor itself (whatever
    /// decides a submitted transaction is valid) is the out-of-scope
    /// collaborator named in §1; this only records the resulting state
    /// transition so canonization's "not ATTESTED, stop and close" rule has
    /// something to check.
    pub fn mark_attested(&mut self, id: TransactionId) -> Result<(), StoreError> {
        let record = self.pending.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.state = TransactionState::Attested;
        Ok(())
    }

    pub fn transaction_get_first(&self) -> Option<&TransactionRecord> {
        if self.pending_head.is_begin_sentinel() {
            return None;
        }
        self.pending.get(&self.pending_head)
    }

    pub fn transaction_get(&self, id: TransactionId) -> Option<&TransactionRecord> {
        self.pending.get(&id)
    }

    /// Unlinks a transaction from the pending queue, patching both
    /// neighbours atomically (§9: "operations that transfer a node from one
    /// list to the other atomically patch both neighbours"), and returns its
    /// record.
    pub fn transaction_drop(&mut self, id: TransactionId) -> Result<TransactionRecord, StoreError> {
        let record = self.pending.remove(&id).ok_or(StoreError::NotFound)?;
        if record.prev.is_begin_sentinel() {
            self.pending_head = record.next;
        } else {
            self.pending.get_mut(&record.prev).unwrap().next = record.next;
        }
        if !record.next.is_end_sentinel() {
            self.pending.get_mut(&record.next).unwrap().prev = record.prev;
        }
        Ok(record)
    }

    /// `block_make`: within one logical write, moves every transaction in
    /// `txn_ids` from pending into the canonized index, updates each
    /// touched artifact, appends the block, and updates the height and
    /// latest-block indices (§4.3 "Block-make semantics"). Failure of any
    /// sub-step (a referenced transaction is not pending) aborts before any
    /// of them are applied.
    pub fn block_make(
        &mut self,
        id: BlockId,
        height: u64,
        first_transaction_id: TransactionId,
        txn_ids: &[TransactionId],
        cert: Vec<u8>,
    ) -> Result<(), StoreError> {
        for txn_id in txn_ids {
            if !self.pending.contains_key(txn_id) {
                return Err(StoreError::NotFound);
            }
        }

        for &txn_id in txn_ids {
            let record = self.transaction_drop(txn_id).expect("presence checked above");
            self.canonize_transaction(record, id, height);
        }

        self.blocks.insert(
            id,
            BlockRecord {
                id,
                prev: self.latest_block,
                next: None,
                first_transaction_id,
                height,
                cert,
            },
        );
        if let Some(prev_block) = self.blocks.get_mut(&self.latest_block) {
            prev_block.next = Some(id);
        }
        self.blocks_by_height.insert(height, id);
        self.latest_block = id;
        Ok(())
    }

    /// Moves a single already-unlinked transaction record into the
    /// canonized index and updates its artifact's summary.
    fn canonize_transaction(&mut self, mut record: TransactionRecord, block_id: BlockId, height: u64) {
        self.artifacts
            .entry(record.artifact_id)
            .and_modify(|a| {
                a.latest_transaction_id = record.id;
                a.latest_height = height;
                a.latest_state = TransactionState::Canonized;
            })
            .or_insert(ArtifactRecord {
                id: record.artifact_id,
                first_transaction_id: record.id,
                latest_transaction_id: record.id,
                first_height: height,
                latest_height: height,
                latest_state: TransactionState::Canonized,
            });

        record.state = TransactionState::Canonized;
        record.block_id = Some(block_id);
        self.canonized.insert(record.id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_types::Cap;

    #[test]
    fn child_context_caps_are_subset_of_parent() {
        let mut arena = ChildContextArena::new(16);
        let parent = CapBitmap::from(Cap::ArtifactRead);
        let index = arena.create(parent, CapBitmap::FULL).unwrap();
        assert!(index < 16);
        assert_eq!(arena.caps(index).unwrap(), parent);
    }

    #[test]
    fn closed_context_index_is_recycled() {
        let mut arena = ChildContextArena::new(2);
        let a = arena.create(CapBitmap::FULL, CapBitmap::FULL).unwrap();
        arena.close(a);
        let b = arena.create(CapBitmap::FULL, CapBitmap::FULL).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn submit_then_drop_restores_empty_queue() {
        let mut store = Store::new();
        let id = TransactionId::random();
        store
            .transaction_submit(id, ArtifactId::random(), vec![1, 2, 3])
            .unwrap();
        assert!(store.transaction_get_first().is_some());
        store.transaction_drop(id).unwrap();
        assert!(store.transaction_get_first().is_none());
    }

    #[test]
    fn drop_of_missing_transaction_is_not_found() {
        let mut store = Store::new();
        assert_eq!(store.transaction_drop(TransactionId::random()), Err(StoreError::NotFound));
    }
}

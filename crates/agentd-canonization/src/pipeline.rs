//! The canonization state machine (§4.5). Timer-driven: a fire event starts
//! a cycle that draws entropy for a new block id, acquires a child context,
//! resolves the previous block, drains attested transactions off the
//! pending queue, assembles and submits a block certificate, then closes
//! the child context and either redrives immediately (backlog still full)
//! or rearms the timer.

use std::time::{SystemTime, UNIX_EPOCH};

use agentd_crypto::{hash_block, CryptoSuite};
use agentd_dataservice::wire as ds;
use agentd_randomservice::wire as rs;
use agentd_types::cert::{self, BlockCertHeader};
use agentd_types::{BlockId, CapBitmap, DataMethod, EntityId, Id, TransactionId, TransactionState};

use crate::link::Link;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    WaitRandom,
    WaitChildCreate,
    WaitLatestBlockId,
    WaitBlockGet,
    WaitPqFirst,
    WaitPqNext,
    WaitBlockMake,
    WaitChildClose,
}

/// Identity the pipeline signs assembled blocks under. Block-signature
/// verification is consensus machinery and out of scope (§1 "Non-goals":
/// consensus across multiple agents); `signature` is carried structurally in
/// every certificate but left zeroed since nothing in this single-agent
/// system ever checks it.
pub struct Identity {
    pub entity_id: EntityId,
    pub suite: CryptoSuite,
}

pub struct Config {
    pub max_transactions: usize,
    pub cert_version: u32,
}

/// Outcome of feeding one backend response into the pipeline. The caller
/// (the daemon's event loop) uses this to decide whether to keep driving,
/// tear the process down, or rearm the redrive timer.
pub enum Outcome {
    Continue,
    CycleComplete { redrive_immediately: bool },
    Failed,
}

pub struct Pipeline {
    state: State,
    identity: Identity,
    config: Config,
    block_id: Option<BlockId>,
    prev_block_id: BlockId,
    prev_block_hash: [u8; 32],
    height: u64,
    child_index: Option<u32>,
    txns: Vec<(TransactionId, Vec<u8>)>,
    hit_max: bool,
}

impl Pipeline {
    pub fn new(identity: Identity, config: Config) -> Pipeline {
        Pipeline {
            state: State::Idle,
            identity,
            config,
            block_id: None,
            prev_block_id: BlockId::root(),
            prev_block_hash: [0u8; 32],
            height: 0,
            child_index: None,
            txns: Vec::new(),
            hit_max: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// §4.5 "Timer fire": allocate an empty list and request 16 bytes of
    /// entropy to become the new block id.
    pub fn on_timer_fire(&mut self, random_link: &mut Link) {
        self.txns.clear();
        self.hit_max = false;
        random_link.send(&rs::Request::encode(0, 16));
        self.state = State::WaitRandom;
    }

    pub fn on_random_response(&mut self, payload: &[u8], data_link: &mut Link) -> Outcome {
        if self.state != State::WaitRandom {
            return Outcome::Failed;
        }
        let resp = match rs::Response::decode(payload) {
            Some(resp) => resp,
            None => return Outcome::Failed,
        };
        if !resp.status.is_success() || resp.entropy.len() != 16 {
            return Outcome::Failed;
        }
        let block_id = match Id::from_slice(&resp.entropy) {
            Some(id) => BlockId(id),
            None => return Outcome::Failed,
        };
        self.block_id = Some(block_id);

        // §4.5 "Child acquisition": pq read first, pq read, latest block id,
        // block read, block write, close.
        let req = ds::Request::new(
            DataMethod::ChildContextCreate,
            Some(0),
            ds::encode_child_context_create_req(CapBitmap::CANONIZATION),
        );
        data_link.send(&req.encode());
        self.state = State::WaitChildCreate;
        Outcome::Continue
    }

    pub fn on_dataservice_response(&mut self, payload: &[u8], data_link: &mut Link) -> Outcome {
        let resp = match ds::Response::decode(payload) {
            Some(resp) => resp,
            None => return Outcome::Failed,
        };

        match self.state {
            State::WaitChildCreate => self.handle_child_create(&resp, data_link),
            State::WaitLatestBlockId => self.handle_latest_block_id(&resp, data_link),
            State::WaitBlockGet => self.handle_block_get(&resp, data_link),
            State::WaitPqFirst | State::WaitPqNext => self.handle_pq_response(&resp, data_link),
            State::WaitBlockMake => self.handle_block_make(&resp, data_link),
            State::WaitChildClose => self.handle_child_close(&resp),
            State::Idle | State::WaitRandom => Outcome::Failed,
        }
    }

    fn handle_child_create(&mut self, resp: &ds::Response, data_link: &mut Link) -> Outcome {
        if !resp.status.is_success() {
            return Outcome::Failed;
        }
        let index = match ds::decode_child_context_create_resp(&resp.body) {
            Some(index) => index,
            None => return Outcome::Failed,
        };
        self.child_index = Some(index);

        let req = ds::Request::new(DataMethod::BlockIdLatestGet, Some(index), Vec::new());
        data_link.send(&req.encode());
        self.state = State::WaitLatestBlockId;
        Outcome::Continue
    }

    fn handle_latest_block_id(&mut self, resp: &ds::Response, data_link: &mut Link) -> Outcome {
        if !resp.status.is_success() {
            return Outcome::Failed;
        }
        let latest = match ds::decode_block_id_resp(&resp.body) {
            Some(id) => id,
            None => return Outcome::Failed,
        };
        self.prev_block_id = latest;

        if latest.is_root() {
            self.height = 1;
            self.prev_block_hash = [0u8; 32];
            self.request_first_transaction(data_link);
            return Outcome::Continue;
        }

        let req = ds::Request::new(DataMethod::BlockGet, self.child_index, ds::encode_block_read_req(latest));
        data_link.send(&req.encode());
        self.state = State::WaitBlockGet;
        Outcome::Continue
    }

    fn handle_block_get(&mut self, resp: &ds::Response, data_link: &mut Link) -> Outcome {
        if !resp.status.is_success() {
            return Outcome::Failed;
        }
        let block = match ds::decode_block_read_resp(&resp.body) {
            Some(block) => block,
            None => return Outcome::Failed,
        };
        self.height = block.height + 1;
        self.prev_block_hash = hash_block(&block.cert);
        self.request_first_transaction(data_link);
        Outcome::Continue
    }

    fn request_first_transaction(&mut self, data_link: &mut Link) {
        let req = ds::Request::new(DataMethod::TransactionGetFirst, self.child_index, Vec::new());
        data_link.send(&req.encode());
        self.state = State::WaitPqFirst;
    }

    /// §4.5 "Transaction draining".
    fn handle_pq_response(&mut self, resp: &ds::Response, data_link: &mut Link) -> Outcome {
        use agentd_types::Status;

        if resp.status == Status::NotFound {
            self.close_child_context(data_link);
            return Outcome::Continue;
        }
        if !resp.status.is_success() {
            return Outcome::Failed;
        }
        let txn = match ds::decode_pending_transaction_resp(&resp.body) {
            Some(txn) => txn,
            None => return Outcome::Failed,
        };

        if txn.state != TransactionState::Attested {
            self.close_child_context(data_link);
            return Outcome::Continue;
        }

        self.txns.push((txn.key, txn.cert));

        if self.txns.len() == self.config.max_transactions {
            self.hit_max = true;
            self.build_block(data_link);
            return Outcome::Continue;
        }
        if txn.next.is_end_sentinel() {
            self.hit_max = false;
            self.build_block(data_link);
            return Outcome::Continue;
        }

        let req = ds::Request::new(DataMethod::TransactionGet, self.child_index, ds::encode_txn_id_req(txn.next));
        data_link.send(&req.encode());
        self.state = State::WaitPqNext;
        Outcome::Continue
    }

    /// §4.5 "Block assembly".
    fn build_block(&mut self, data_link: &mut Link) {
        let block_id = self.block_id.expect("set on timer fire, before any build");
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let header = BlockCertHeader {
            version: self.config.cert_version,
            timestamp,
            suite_id: self.identity.suite.suite_id,
            cert_type: Id::random(),
            block_id,
            prev_block_id: self.prev_block_id,
            prev_block_hash: self.prev_block_hash,
            height: self.height,
            signer_id: self.identity.entity_id,
            signature: [0u8; cert::SIGNATURE_SIZE],
        };
        let cert_bytes = cert::build(&header, &self.txns);

        let req = ds::Request::new(DataMethod::BlockMake, self.child_index, ds::encode_block_make_req(block_id, &cert_bytes));
        data_link.send(&req.encode());
        self.state = State::WaitBlockMake;
    }

    fn handle_block_make(&mut self, resp: &ds::Response, data_link: &mut Link) -> Outcome {
        if !resp.status.is_success() {
            return Outcome::Failed;
        }
        self.close_child_context(data_link);
        Outcome::Continue
    }

    fn close_child_context(&mut self, data_link: &mut Link) {
        let req = ds::Request::new(DataMethod::ChildContextClose, self.child_index, Vec::new());
        data_link.send(&req.encode());
        self.state = State::WaitChildClose;
    }

    /// §4.5 "Reset": dispose the list, clear the block id, and report
    /// whether to redrive immediately or wait out the configured interval.
    fn handle_child_close(&mut self, resp: &ds::Response) -> Outcome {
        if !resp.status.is_success() {
            return Outcome::Failed;
        }
        self.txns.clear();
        self.block_id = None;
        self.child_index = None;
        let redrive_immediately = self.hit_max;
        self.hit_max = false;
        self.state = State::Idle;
        Outcome::CycleComplete { redrive_immediately }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_types::{ArtifactId, Status};
    use mio::Token;
    use mio_uds::UnixStream;

    fn identity() -> Identity {
        Identity {
            entity_id: EntityId::random(),
            suite: CryptoSuite::current(),
        }
    }

    fn config() -> Config {
        Config {
            max_transactions: 2,
            cert_version: 1,
        }
    }

    fn link_pair() -> (Link, UnixStream) {
        let (local, remote) = UnixStream::pair().unwrap();
        (Link::new(agentd_ipc::SocketContext::new(local, Token(0), 65536, 65536)), remote)
    }

    fn take_sent(peer: &mut UnixStream) -> Vec<u8> {
        use agentd_ipc::frame;
        use std::io::Read;
        let mut buf = [0u8; 65536];
        let n = peer.read(&mut buf).unwrap();
        frame::decode_data(&buf[..n]).unwrap().to_vec()
    }

    fn write_frame(peer: &mut UnixStream, payload: &[u8]) {
        use agentd_ipc::frame;
        use std::io::Write;
        peer.write_all(&frame::encode_data(payload)).unwrap();
    }

    #[test]
    fn timer_fire_requests_entropy() {
        let (mut random_link, mut random_peer) = link_pair();
        let mut pipeline = Pipeline::new(identity(), config());

        pipeline.on_timer_fire(&mut random_link);
        random_link.socket.egress().unwrap();

        let sent = take_sent(&mut random_peer);
        let req = rs::Request::decode(&sent).unwrap();
        assert_eq!(req.length, 16);
        assert_eq!(pipeline.state(), State::WaitRandom);
    }

    #[test]
    fn full_cycle_with_one_attested_transaction_builds_and_closes() {
        let (mut random_link, mut random_peer) = link_pair();
        let (mut data_link, mut data_peer) = link_pair();
        let mut pipeline = Pipeline::new(identity(), config());

        pipeline.on_timer_fire(&mut random_link);
        random_link.socket.egress().unwrap();
        take_sent(&mut random_peer);

        write_frame(&mut random_peer, &rs::Response::ok(0, vec![7u8; 16]).encode());
        random_link.socket.ingress().unwrap();
        let payload = random_link.try_recv().unwrap().unwrap();
        match pipeline.on_random_response(&payload, &mut data_link) {
            Outcome::Continue => {}
            _ => panic!("expected continue"),
        }
        data_link.socket.egress().unwrap();
        take_sent(&mut data_peer); // child_context_create request
        assert_eq!(pipeline.state(), State::WaitChildCreate);

        write_frame(
            &mut data_peer,
            &ds::Response::ok(DataMethod::ChildContextCreate, 0, ds::encode_child_context_create_resp(3)).encode(),
        );
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        pipeline.on_dataservice_response(&payload, &mut data_link);
        data_link.socket.egress().unwrap();
        take_sent(&mut data_peer); // block_id_latest_get request
        assert_eq!(pipeline.state(), State::WaitLatestBlockId);

        write_frame(
            &mut data_peer,
            &ds::Response::ok(DataMethod::BlockIdLatestGet, 3, ds::encode_block_id_resp(BlockId::root())).encode(),
        );
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        pipeline.on_dataservice_response(&payload, &mut data_link);
        data_link.socket.egress().unwrap();
        take_sent(&mut data_peer); // transaction_get_first request
        assert_eq!(pipeline.state(), State::WaitPqFirst);

        let txn_id = TransactionId::random();
        write_frame(
            &mut data_peer,
            &ds::Response::ok(
                DataMethod::TransactionGetFirst,
                3,
                ds::encode_pending_transaction_resp(&ds::PendingTransactionResp {
                    key: txn_id,
                    prev: TransactionId::begin_sentinel(),
                    next: TransactionId::end_sentinel(),
                    artifact_id: ArtifactId::random(),
                    state: TransactionState::Attested,
                    cert: vec![1, 2, 3],
                }),
            )
            .encode(),
        );
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        pipeline.on_dataservice_response(&payload, &mut data_link);
        data_link.socket.egress().unwrap();
        take_sent(&mut data_peer); // block_make request, single txn ends the drain
        assert_eq!(pipeline.state(), State::WaitBlockMake);

        write_frame(&mut data_peer, &ds::Response::ok(DataMethod::BlockMake, 3, Vec::new()).encode());
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        pipeline.on_dataservice_response(&payload, &mut data_link);
        data_link.socket.egress().unwrap();
        take_sent(&mut data_peer); // child_context_close request
        assert_eq!(pipeline.state(), State::WaitChildClose);

        write_frame(&mut data_peer, &ds::Response::ok(DataMethod::ChildContextClose, 3, Vec::new()).encode());
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        match pipeline.on_dataservice_response(&payload, &mut data_link) {
            Outcome::CycleComplete { redrive_immediately } => assert!(!redrive_immediately),
            _ => panic!("expected cycle complete"),
        }
        assert_eq!(pipeline.state(), State::Idle);
    }

    #[test]
    fn empty_queue_closes_without_building_a_block() {
        let (mut data_link, mut data_peer) = link_pair();
        let mut pipeline = Pipeline::new(identity(), config());
        pipeline.child_index = Some(1);
        pipeline.block_id = Some(BlockId::random());
        pipeline.state = State::WaitPqFirst;

        write_frame(&mut data_peer, &ds::Response::err(DataMethod::TransactionGetFirst, 1, Status::NotFound).encode());
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        pipeline.on_dataservice_response(&payload, &mut data_link);
        assert_eq!(pipeline.state(), State::WaitChildClose);
    }

    #[test]
    fn non_attested_transaction_aborts_without_building_a_block() {
        let (mut data_link, mut data_peer) = link_pair();
        let mut pipeline = Pipeline::new(identity(), config());
        pipeline.child_index = Some(1);
        pipeline.block_id = Some(BlockId::random());
        pipeline.state = State::WaitPqFirst;

        write_frame(
            &mut data_peer,
            &ds::Response::ok(
                DataMethod::TransactionGetFirst,
                1,
                ds::encode_pending_transaction_resp(&ds::PendingTransactionResp {
                    key: TransactionId::random(),
                    prev: TransactionId::begin_sentinel(),
                    next: TransactionId::end_sentinel(),
                    artifact_id: ArtifactId::random(),
                    state: TransactionState::Submitted,
                    cert: vec![9],
                }),
            )
            .encode(),
        );
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        pipeline.on_dataservice_response(&payload, &mut data_link);
        assert_eq!(pipeline.state(), State::WaitChildClose);
        assert!(pipeline.txns.is_empty());
    }

    #[test]
    fn unexpected_response_fails() {
        let (mut data_link, mut data_peer) = link_pair();
        let mut pipeline = Pipeline::new(identity(), config());
        assert_eq!(pipeline.state(), State::Idle);

        write_frame(&mut data_peer, &ds::Response::ok(DataMethod::BlockIdLatestGet, 0, Vec::new()).encode());
        data_link.socket.ingress().unwrap();
        let payload = data_link.try_recv().unwrap().unwrap();
        match pipeline.on_dataservice_response(&payload, &mut data_link) {
            Outcome::Failed => {}
            _ => panic!("expected failure on a response while idle"),
        }
    }
}

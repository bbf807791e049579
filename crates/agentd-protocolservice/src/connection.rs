//! Per-connection state machine (§4.4). One `Connection` per accepted client
//! socket, driven by the bin entry point's event loop through the `on_*`
//! hooks below.

use agentd_crypto::{KeyPair, PublicKey, NONCE_SIZE};
use agentd_ipc::frame;
use agentd_ipc::{ErrorUtils, IpcError, SocketContext};
use agentd_types::{CapBitmap, DataMethod, EntityId, Status};

use crate::directory::EntityDirectory;
use crate::outbound::OutboundLink;
use crate::wire::{
    encode_handshake_ack_response, CommandRequest, CommandResponse, HandshakeAck, HandshakeRequest,
    HandshakeResponse, HANDSHAKE_ACK, HANDSHAKE_INITIATE, PROTOCOL_VERSION,
};

/// Client authed frames start at nonce 1; server authed frames start with
/// the high bit set so the two directions never collide under one shared
/// secret (§4.4 scenario 1: client ack at iv=1, server success at
/// iv=0x8000000000000001).
const CLIENT_IV_BASE: u64 = 1;
const SERVER_IV_BASE: u64 = 0x8000_0000_0000_0001;

/// Cert bodies above this are rejected before ever reaching the data service
/// (§8 boundary behaviors); `transaction_submit`'s body is
/// `txn-id(16) | artifact-id(16) | cert`, so the cap adds the two ids on top
/// of the data service's own per-certificate limit.
const MAX_TRANSACTION_SUBMIT_BODY: usize =
    2 * agentd_types::Id::SIZE + agentd_types::record::MAX_TRANSACTION_CERT_SIZE;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnState {
    ReadHsReq,
    GatherEntropy,
    WriteHsResp,
    ReadHsAck,
    WriteHsAck,
    DataserviceChildWait,
    ReadCmd,
    WriteCmdResp,
    Unauthorized,
}

/// The process's own long-term identity: entity id, key pair, and the
/// crypto suite it advertises.
pub struct ServerIdentity {
    pub entity_id: EntityId,
    pub keypair: KeyPair,
    pub suite: agentd_crypto::CryptoSuite,
}

impl ServerIdentity {
    pub fn generate(entity_id: EntityId) -> ServerIdentity {
        ServerIdentity {
            entity_id,
            keypair: agentd_crypto::generate_keypair(),
            suite: agentd_crypto::CryptoSuite::current(),
        }
    }
}

/// Capability set granted to a protocol-service connection's child context.
/// The protocol service proxies whatever its own root context was granted
/// rather than layering a narrower per-client policy on top (see DESIGN.md).
pub fn connection_caps() -> CapBitmap {
    CapBitmap::FULL
}

pub struct Connection {
    pub socket: SocketContext,
    state: ConnState,
    client_public_key: Option<PublicKey>,
    client_key_nonce: [u8; NONCE_SIZE],
    client_challenge_nonce: [u8; NONCE_SIZE],
    shared_secret: Option<[u8; agentd_crypto::KEY_SIZE]>,
    client_iv: u64,
    server_iv: u64,
    child_index: Option<u32>,
    current_request_offset: u32,
    cmd_in_flight: bool,
    close_after_write: bool,
    arena_index: usize,
}

impl Connection {
    pub fn new(socket: SocketContext, arena_index: usize) -> Connection {
        Connection {
            socket,
            state: ConnState::ReadHsReq,
            client_public_key: None,
            client_key_nonce: [0u8; NONCE_SIZE],
            client_challenge_nonce: [0u8; NONCE_SIZE],
            shared_secret: None,
            client_iv: CLIENT_IV_BASE,
            server_iv: SERVER_IV_BASE,
            child_index: None,
            current_request_offset: 0,
            cmd_in_flight: false,
            close_after_write: false,
            arena_index,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn should_close(&self) -> bool {
        self.close_after_write && self.socket.write_buf().is_empty()
    }

    fn queue_raw(&mut self, payload: &[u8]) {
        self.socket.write_buf().push(&frame::encode_data(payload));
    }

    fn queue_authed(&mut self, plaintext: &[u8]) {
        let secret = self.shared_secret.expect("authed frame queued before handshake completed");
        if let Ok(frame) = frame::encode_authed(self.server_iv, &secret, plaintext) {
            self.socket.write_buf().push(&frame);
        }
        self.server_iv += 1;
    }

    fn fail_handshake(&mut self, request_id: u32, status: Status) {
        let dummy_secret = [0u8; agentd_crypto::KEY_SIZE];
        let resp = HandshakeResponse {
            request_id,
            status,
            protocol_version: PROTOCOL_VERSION,
            suite_id: agentd_crypto::SUITE_ID,
            server_entity_id: EntityId::random(),
            server_public_key: [0u8; agentd_crypto::PUBLIC_KEY_SIZE],
            server_key_nonce: [0u8; NONCE_SIZE],
            server_challenge_nonce: [0u8; NONCE_SIZE],
        };
        let encoded = resp.encode(&dummy_secret, &self.client_challenge_nonce);
        self.queue_raw(&encoded);
        self.state = ConnState::Unauthorized;
        self.close_after_write = true;
    }

    fn fail_command(&mut self, method: DataMethod, status: Status) {
        let resp = CommandResponse {
            method,
            offset: self.current_request_offset,
            status,
            body: Vec::new(),
        };
        self.queue_authed(&resp.encode());
        self.state = ConnState::Unauthorized;
        self.close_after_write = true;
    }

    /// Pulls bytes off the client socket and advances the state machine as
    /// far as it can without waiting on a backing service. Returns `false`
    /// if the connection died (EOF, a fatal IO error, or a framing error —
    /// the last of which gets no response at all, per §4.4's distinction
    /// between a bad frame and a well-framed but semantically wrong one).
    pub fn on_client_readable(
        &mut self,
        directory: &EntityDirectory,
        identity: &ServerIdentity,
        random_link: &mut OutboundLink,
    ) -> bool {
        if self.socket.ingress().has_failed() {
            return false;
        }

        match self.state {
            ConnState::ReadHsReq => self.read_handshake_request(directory, identity, random_link),
            ConnState::ReadHsAck => self.read_handshake_ack(),
            _ => true,
        }
    }

    fn read_handshake_request(
        &mut self,
        directory: &EntityDirectory,
        identity: &ServerIdentity,
        random_link: &mut OutboundLink,
    ) -> bool {
        let buf = self.socket.read_buf().read_slice();
        let (_, size) = match frame::peek_data_header(buf) {
            Ok(Some(header)) => header,
            Ok(None) => return true,
            Err(_) => return false,
        };
        let total = frame::HEADER_SIZE + size;
        if buf.len() < total {
            return true;
        }
        let payload = match frame::decode_data(buf) {
            Ok(payload) => payload.to_vec(),
            Err(_) => return false,
        };
        self.socket.read_buf().drain(total);
        self.handle_handshake_request(&payload, directory, identity, random_link)
    }

    fn handle_handshake_request(
        &mut self,
        payload: &[u8],
        directory: &EntityDirectory,
        identity: &ServerIdentity,
        random_link: &mut OutboundLink,
    ) -> bool {
        let request = match HandshakeRequest::decode(payload) {
            Some(request) => request,
            None => {
                self.fail_handshake(HANDSHAKE_INITIATE, Status::MalformedRequest);
                return true;
            }
        };

        if request.request_id != HANDSHAKE_INITIATE || request.request_offset != 0 {
            self.fail_handshake(request.request_id, Status::MalformedRequest);
            return true;
        }
        if request.protocol_version != PROTOCOL_VERSION || !identity.suite.matches(request.suite_id) {
            self.fail_handshake(request.request_id, Status::MalformedRequest);
            return true;
        }

        let public_key = match directory.lookup(request.entity_id) {
            Some(key) => *key,
            None => {
                self.fail_handshake(request.request_id, Status::Unauthorized);
                return true;
            }
        };

        self.client_public_key = Some(public_key);
        self.client_key_nonce = request.client_key_nonce;
        self.client_challenge_nonce = request.client_challenge_nonce;
        self.state = ConnState::GatherEntropy;

        let entropy_request = agentd_randomservice::wire::Request::encode(0, 2 * NONCE_SIZE);
        random_link.send(self.arena_index, &entropy_request);
        true
    }

    fn read_handshake_ack(&mut self) -> bool {
        let secret = self.shared_secret.expect("handshake ack read before secret derived");
        let buf = self.socket.read_buf().read_slice();
        let (plaintext, consumed) = match frame::decode_authed(self.client_iv, &secret, buf) {
            Ok(parts) => parts,
            Err(IpcError::Wait) => return true,
            Err(_) => return false,
        };
        self.client_iv += 1;
        self.socket.read_buf().drain(consumed);

        match HandshakeAck::decode(&plaintext) {
            Some(ack) if ack.request_id == HANDSHAKE_ACK => {
                self.queue_authed(&encode_handshake_ack_response(Status::Success));
                self.state = ConnState::WriteHsAck;
            }
            _ => self.fail_command(DataMethod::RootContextInit, Status::MalformedRequest),
        }
        true
    }

    pub fn on_random_response(&mut self, payload: &[u8], identity: &ServerIdentity) {
        if self.state != ConnState::GatherEntropy {
            return;
        }
        let response = match agentd_randomservice::wire::Response::decode(payload) {
            Some(response) if response.status.is_success() && response.entropy.len() == 2 * NONCE_SIZE => response,
            _ => {
                self.fail_handshake(HANDSHAKE_INITIATE, Status::Internal);
                return;
            }
        };

        let mut server_key_nonce = [0u8; NONCE_SIZE];
        server_key_nonce.copy_from_slice(&response.entropy[..NONCE_SIZE]);
        let mut server_challenge_nonce = [0u8; NONCE_SIZE];
        server_challenge_nonce.copy_from_slice(&response.entropy[NONCE_SIZE..]);

        let client_public_key = self.client_public_key.unwrap();
        let secret = match agentd_crypto::derive_shared_secret(
            &identity.keypair.private,
            &client_public_key,
            &self.client_key_nonce,
            &server_key_nonce,
        ) {
            Some(secret) => secret,
            None => {
                self.fail_handshake(HANDSHAKE_INITIATE, Status::CryptoFailure);
                return;
            }
        };
        self.shared_secret = Some(secret);

        let resp = HandshakeResponse {
            request_id: HANDSHAKE_INITIATE,
            status: Status::Success,
            protocol_version: PROTOCOL_VERSION,
            suite_id: identity.suite.suite_id,
            server_entity_id: identity.entity_id,
            server_public_key: identity.keypair.public.0,
            server_key_nonce,
            server_challenge_nonce,
        };
        let encoded = resp.encode(&secret, &self.client_challenge_nonce);
        self.queue_raw(&encoded);
        self.state = ConnState::WriteHsResp;
    }

    pub fn on_dataservice_response(&mut self, payload: &[u8]) {
        match self.state {
            ConnState::DataserviceChildWait => {
                let response = match agentd_dataservice::wire::Response::decode(payload) {
                    Some(response) => response,
                    None => {
                        self.fail_command(DataMethod::ChildContextCreate, Status::Internal);
                        return;
                    }
                };
                if !response.status.is_success() {
                    self.fail_command(DataMethod::ChildContextCreate, response.status);
                    return;
                }
                match agentd_dataservice::wire::decode_child_context_create_resp(&response.body) {
                    Some(index) => {
                        self.child_index = Some(index);
                        self.state = ConnState::ReadCmd;
                    }
                    None => self.fail_command(DataMethod::ChildContextCreate, Status::Internal),
                }
            }
            ConnState::ReadCmd if self.cmd_in_flight => {
                let response = match agentd_dataservice::wire::Response::decode(payload) {
                    Some(response) => response,
                    None => {
                        self.fail_command(DataMethod::RootContextInit, Status::Internal);
                        return;
                    }
                };
                let reply = CommandResponse {
                    method: response.method,
                    offset: self.current_request_offset,
                    status: response.status,
                    body: response.body,
                };
                self.queue_authed(&reply.encode());
                self.cmd_in_flight = false;
                self.state = ConnState::WriteCmdResp;
            }
            _ => {}
        }
    }

    /// Advances write-bound states once the write buffer has fully drained,
    /// kicking off whatever comes next (a child-context create once the
    /// handshake ack response has gone out).
    pub fn on_client_writable(&mut self, data_link: &mut OutboundLink) {
        if self.socket.egress().is_err() {
            self.close_after_write = true;
            return;
        }
        if !self.socket.write_buf().is_empty() {
            return;
        }

        match self.state {
            ConnState::WriteHsResp => self.state = ConnState::ReadHsAck,
            ConnState::WriteHsAck => {
                self.state = ConnState::DataserviceChildWait;
                let req = agentd_dataservice::wire::Request::new(
                    DataMethod::ChildContextCreate,
                    Some(0),
                    agentd_dataservice::wire::encode_child_context_create_req(connection_caps()),
                );
                data_link.send(self.arena_index, &req.encode());
            }
            ConnState::WriteCmdResp => self.state = ConnState::ReadCmd,
            _ => {}
        }
    }

    /// Called once the connection is in `ReadCmd` and idle; decodes a
    /// buffered authed command frame (if any) and forwards it to the data
    /// service. Returns `false` if the connection died.
    pub fn drive_command(&mut self, data_link: &mut OutboundLink) -> bool {
        if self.state != ConnState::ReadCmd || self.cmd_in_flight {
            return true;
        }
        let secret = match self.shared_secret {
            Some(secret) => secret,
            None => return true,
        };

        let buf = self.socket.read_buf().read_slice();
        let (plaintext, consumed) = match frame::decode_authed(self.client_iv, &secret, buf) {
            Ok(parts) => parts,
            Err(IpcError::Wait) => return true,
            Err(_) => return false,
        };
        self.client_iv += 1;
        self.socket.read_buf().drain(consumed);

        let request = match CommandRequest::decode(&plaintext) {
            Ok(request) => request,
            Err(status) => {
                self.fail_command(DataMethod::RootContextInit, status);
                return true;
            }
        };
        self.current_request_offset = request.offset;

        // Child-context creation and root-context ops are reserved for the
        // handshake and the canonization pipeline's own data-service link;
        // a client's command phase only ever operates within the single
        // child context this connection was granted on handshake completion.
        if request.method.is_root_context_op() || request.method == DataMethod::ChildContextCreate {
            self.fail_command(request.method, Status::Unauthorized);
            return true;
        }

        if request.method == DataMethod::TransactionSubmit && request.body.len() > MAX_TRANSACTION_SUBMIT_BODY {
            self.fail_command(request.method, Status::TransactionVerification);
            return true;
        }

        let child_index = match self.child_index {
            Some(index) => index,
            None => {
                self.fail_command(request.method, Status::ChildContextInvalid);
                return true;
            }
        };

        let ds_request = agentd_dataservice::wire::Request::new(request.method, Some(child_index), request.body);
        data_link.send(self.arena_index, &ds_request.encode());
        self.cmd_in_flight = true;
        true
    }

    /// Best-effort child-context teardown: failure of this send is never
    /// treated as fatal, since the connection is being discarded either way.
    pub fn close_child_context(&self, data_link: &mut OutboundLink) {
        if let Some(child_index) = self.child_index {
            let req = agentd_dataservice::wire::Request::new(DataMethod::ChildContextClose, Some(child_index), Vec::new());
            data_link.send(self.arena_index, &req.encode());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    use mio::Token;
    use mio_uds::UnixStream;

    fn ctx(stream: UnixStream) -> SocketContext {
        SocketContext::new(stream, Token(0), 65536, 65536)
    }

    #[test]
    fn handshake_request_from_known_entity_starts_gathering_entropy() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(ctx(server), 0);
        let (random_a, random_b) = UnixStream::pair().unwrap();
        let mut random_link = OutboundLink::new(ctx(random_a));
        let mut random_peer = random_b;

        let keypair = agentd_crypto::generate_keypair();
        let entity_id = EntityId::random();
        let mut directory = EntityDirectory::new();
        directory.register(entity_id, keypair.public);
        let identity = ServerIdentity::generate(EntityId::random());

        let request = HandshakeRequest {
            request_id: HANDSHAKE_INITIATE,
            request_offset: 0,
            protocol_version: PROTOCOL_VERSION,
            suite_id: agentd_crypto::SUITE_ID,
            entity_id,
            client_key_nonce: [7u8; NONCE_SIZE],
            client_challenge_nonce: [8u8; NONCE_SIZE],
        };
        client.write_all(&frame::encode_data(&request.encode())).unwrap();

        assert!(conn.on_client_readable(&directory, &identity, &mut random_link));
        assert_eq!(conn.state(), ConnState::GatherEntropy);

        let mut raw = vec![0u8; 256];
        let n = random_peer.read(&mut raw).unwrap();
        let payload = frame::decode_data(&raw[..n]).unwrap();
        let entropy_req = agentd_randomservice::wire::Request::decode(payload).unwrap();
        assert_eq!(entropy_req.length, 2 * NONCE_SIZE);
    }

    #[test]
    fn handshake_request_from_unknown_entity_is_rejected() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(ctx(server), 0);
        let (random_a, _random_b) = UnixStream::pair().unwrap();
        let mut random_link = OutboundLink::new(ctx(random_a));

        let directory = EntityDirectory::new();
        let identity = ServerIdentity::generate(EntityId::random());

        let request = HandshakeRequest {
            request_id: HANDSHAKE_INITIATE,
            request_offset: 0,
            protocol_version: PROTOCOL_VERSION,
            suite_id: agentd_crypto::SUITE_ID,
            entity_id: EntityId::random(),
            client_key_nonce: [1u8; NONCE_SIZE],
            client_challenge_nonce: [2u8; NONCE_SIZE],
        };
        client.write_all(&frame::encode_data(&request.encode())).unwrap();

        assert!(conn.on_client_readable(&directory, &identity, &mut random_link));
        assert_eq!(conn.state(), ConnState::Unauthorized);
        assert!(!conn.should_close()); // write not yet flushed

        conn.socket.egress().unwrap();
        assert!(conn.should_close());

        let mut raw = vec![0u8; 256];
        let n = client.read(&mut raw).unwrap();
        let payload = frame::decode_data(&raw[..n]).unwrap();
        let (resp, _mac) = HandshakeResponse::decode(payload).unwrap();
        assert_eq!(resp.status, Status::Unauthorized);
    }

    #[test]
    fn wrong_frame_type_closes_connection_with_no_response() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(ctx(server), 0);
        let (random_a, _random_b) = UnixStream::pair().unwrap();
        let mut random_link = OutboundLink::new(ctx(random_a));

        let directory = EntityDirectory::new();
        let identity = ServerIdentity::generate(EntityId::random());

        let mut bad_frame = frame::encode_data(&[0u8; 8]);
        bad_frame[0] = frame::TYPE_UINT8;
        client.write_all(&bad_frame).unwrap();

        assert!(!conn.on_client_readable(&directory, &identity, &mut random_link));
        assert!(conn.socket.write_buf().is_empty());
    }

    #[test]
    fn command_requesting_child_context_create_is_rejected() {
        use byteorder::{BigEndian, ByteOrder};

        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(ctx(server), 0);
        let secret = [9u8; agentd_crypto::KEY_SIZE];
        conn.state = ConnState::ReadCmd;
        conn.shared_secret = Some(secret);
        conn.child_index = Some(3);

        let mut body = Vec::new();
        body.extend_from_slice(&(DataMethod::ChildContextCreate as u32).to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        let frame = frame::encode_authed(conn.client_iv, &secret, &body).unwrap();
        client.write_all(&frame).unwrap();
        conn.socket.ingress().unwrap();

        let (data_a, _data_b) = UnixStream::pair().unwrap();
        let mut data_link = OutboundLink::new(ctx(data_a));

        assert!(conn.drive_command(&mut data_link));
        assert_eq!(conn.state(), ConnState::Unauthorized);
        assert!(!conn.cmd_in_flight);

        conn.socket.egress().unwrap();
        let mut raw = vec![0u8; 256];
        let n = client.read(&mut raw).unwrap();
        let (plaintext, _) = frame::decode_authed(SERVER_IV_BASE, &secret, &raw[..n]).unwrap();
        let status = BigEndian::read_u32(&plaintext[2 * 4..3 * 4]);
        assert_eq!(status, Status::Unauthorized.to_u32());
    }
}

//! Dispatches decoded data-service requests against the [`Store`] and the
//! [`ChildContextArena`], enforcing the capability bitmap before any
//! storage access and always producing a response, even on failure (§4.3).

use agentd_types::{BlockId, Cap, CapBitmap, DataMethod, Status, TransactionId};

use crate::store::{ChildContextArena, Store, StoreError};
use crate::wire::*;

pub struct DataService {
    pub store: Store,
    pub children: ChildContextArena,
}

impl DataService {
    pub fn new(max_children: u32) -> DataService {
        DataService {
            store: Store::new(),
            children: ChildContextArena::new(max_children),
        }
    }

    /// Decodes, authorizes and dispatches one request, always returning a
    /// fully formed `Response` (§4.3 "Response rules").
    pub fn handle(&mut self, raw: &[u8]) -> Response {
        let request = match Request::decode(raw) {
            Ok(req) => req,
            Err(status) => {
                // The method id itself may not even be decodable; echo a
                // best-effort method/offset of zero, since the only thing
                // that matters to the client here is the status.
                return Response::err(DataMethod::RootContextInit, 0, status);
            }
        };

        let method = request.method;
        let offset = request.child_index.unwrap_or(0);

        if method.is_root_context_op() {
            return self.dispatch_root(method, &request.body);
        }

        let child_index = match request.child_index {
            Some(index) => index,
            None => return Response::err(method, offset, Status::ChildContextBadIndex),
        };

        if method == DataMethod::ChildContextCreate {
            return self.dispatch_child_context_create(child_index, &request.body);
        }

        let caps = match self.children.caps(child_index) {
            Some(caps) => caps,
            None => return Response::err(method, child_index, Status::ChildContextInvalid),
        };

        let required = match required_cap(method) {
            Some(cap) => cap,
            None => return Response::err(method, child_index, Status::MalformedRequest),
        };
        if !caps.contains(required) {
            return Response::err(method, child_index, Status::Unauthorized);
        }

        self.dispatch_authorized(method, child_index, &request.body)
    }

    fn dispatch_root(&mut self, method: DataMethod, body: &[u8]) -> Response {
        match method {
            DataMethod::RootContextInit => {
                // The database path is accepted and ignored: persistence
                // itself is out of scope (§6).
                let _ = body;
                Response::ok(method, 0, Vec::new())
            }
            DataMethod::RootContextReduceCaps => match decode_reduce_caps_req(body) {
                Some(requested) => {
                    self.store.root_caps = self.store.root_caps.intersect(requested);
                    Response::ok(method, 0, Vec::new())
                }
                None => Response::err(method, 0, Status::RequestPacketInvalidSize),
            },
            _ => Response::err(method, 0, Status::MalformedRequest),
        }
    }

    fn dispatch_child_context_create(&mut self, _offset: u32, body: &[u8]) -> Response {
        let requested = match decode_child_context_create_req(body) {
            Some(caps) => caps,
            None => {
                return Response::err(DataMethod::ChildContextCreate, 0, Status::RequestPacketInvalidSize)
            }
        };

        match self.children.create(self.store.root_caps, requested) {
            Some(index) => Response::ok(
                DataMethod::ChildContextCreate,
                index,
                encode_child_context_create_resp(index),
            ),
            None => Response::err(DataMethod::ChildContextCreate, 0, Status::OutOfMemory),
        }
    }

    fn dispatch_authorized(&mut self, method: DataMethod, child_index: u32, body: &[u8]) -> Response {
        match method {
            DataMethod::ChildContextClose => {
                if self.children.close(child_index) {
                    Response::ok(method, child_index, Vec::new())
                } else {
                    Response::err(method, child_index, Status::ChildContextInvalid)
                }
            }
            DataMethod::GlobalSettingSet => match decode_global_setting_set_req(body) {
                Some((key, value)) => {
                    self.store.set_setting(key, value.to_vec());
                    Response::ok(method, child_index, Vec::new())
                }
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::GlobalSettingGet => match decode_global_setting_get_req(body) {
                Some(key) => match self.store.get_setting(key) {
                    Some(value) => Response::ok(method, child_index, value.to_vec()),
                    None => Response::err(method, child_index, Status::NotFound),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::ArtifactRead => match decode_artifact_read_req(body) {
                Some(id) => match self.store.artifact_read(id) {
                    Some(record) => Response::ok(
                        method,
                        child_index,
                        encode_artifact_read_resp(&ArtifactReadResp {
                            id: record.id,
                            first_transaction_id: record.first_transaction_id,
                            latest_transaction_id: record.latest_transaction_id,
                            first_height: record.first_height,
                            latest_height: record.latest_height,
                            latest_state: record.latest_state,
                        }),
                    ),
                    None => Response::err(method, child_index, Status::NotFound),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::BlockIdLatestGet => {
                Response::ok(method, child_index, encode_block_id_resp(self.store.block_id_latest()))
            }
            DataMethod::BlockIdByHeightGet => match decode_height_req(body) {
                Some(height) => match self.store.block_id_by_height(height) {
                    Some(id) => Response::ok(method, child_index, encode_block_id_resp(id)),
                    None => Response::err(method, child_index, Status::NotFound),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::BlockGet => match decode_block_read_req(body) {
                Some(id) => match self.store.block_read(id) {
                    Some(record) => Response::ok(
                        method,
                        child_index,
                        encode_block_read_resp(&BlockReadResp {
                            id: record.id,
                            prev: record.prev,
                            next: record.next.unwrap_or_else(agentd_types::BlockId::root),
                            first_transaction_id: record.first_transaction_id,
                            height: record.height,
                            cert: record.cert.clone(),
                        }),
                    ),
                    None => Response::err(method, child_index, Status::NotFound),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::BlockMake => match decode_block_make_req(body) {
                Some((block_id, cert)) => self.handle_block_make(child_index, block_id, cert),
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::CanonizedTransactionGet => match decode_txn_id_req(body) {
                Some(id) => match self.store.canonized_transaction_get(id) {
                    Some(record) => Response::ok(
                        method,
                        child_index,
                        encode_canonized_transaction_resp(&CanonizedTransactionResp {
                            key: record.id,
                            prev: record.prev,
                            next: record.next,
                            artifact_id: record.artifact_id,
                            block_id: record.block_id.unwrap_or_else(agentd_types::BlockId::root),
                            state: record.state,
                            cert: record.cert.clone(),
                        }),
                    ),
                    None => Response::err(method, child_index, Status::NotFound),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::TransactionSubmit => match decode_transaction_submit_req(body) {
                Some((txn_id, artifact_id, cert)) => {
                    if cert.len() > agentd_types::record::MAX_TRANSACTION_CERT_SIZE {
                        return Response::err(method, child_index, Status::TransactionVerification);
                    }
                    match self.store.transaction_submit(txn_id, artifact_id, cert.to_vec()) {
                        Ok(()) => Response::ok(method, child_index, Vec::new()),
                        Err(StoreError::AlreadyExists) => {
                            Response::err(method, child_index, Status::MalformedRequest)
                        }
                        Err(StoreError::NotFound) => unreachable!(),
                    }
                }
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::TransactionGetFirst => match self.store.transaction_get_first() {
                Some(record) => Response::ok(
                    method,
                    child_index,
                    encode_pending_transaction_resp(&PendingTransactionResp {
                        key: record.id,
                        prev: record.prev,
                        next: record.next,
                        artifact_id: record.artifact_id,
                        state: record.state,
                        cert: record.cert.clone(),
                    }),
                ),
                None => Response::err(method, child_index, Status::NotFound),
            },
            DataMethod::TransactionGet => match decode_txn_id_req(body) {
                Some(id) => match self.store.transaction_get(id) {
                    Some(record) => Response::ok(
                        method,
                        child_index,
                        encode_pending_transaction_resp(&PendingTransactionResp {
                            key: record.id,
                            prev: record.prev,
                            next: record.next,
                            artifact_id: record.artifact_id,
                            state: record.state,
                            cert: record.cert.clone(),
                        }),
                    ),
                    None => Response::err(method, child_index, Status::NotFound),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::TransactionDrop => match decode_txn_id_req(body) {
                Some(id) => match self.store.transaction_drop(id) {
                    Ok(_) => Response::ok(method, child_index, Vec::new()),
                    Err(StoreError::NotFound) => Response::err(method, child_index, Status::NotFound),
                    Err(StoreError::AlreadyExists) => unreachable!(),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::TransactionAttest => match decode_txn_id_req(body) {
                Some(id) => match self.store.mark_attested(id) {
                    Ok(()) => Response::ok(method, child_index, Vec::new()),
                    Err(StoreError::NotFound) => Response::err(method, child_index, Status::NotFound),
                    Err(StoreError::AlreadyExists) => unreachable!(),
                },
                None => Response::err(method, child_index, Status::RequestPacketInvalidSize),
            },
            DataMethod::RootContextInit | DataMethod::RootContextReduceCaps | DataMethod::ChildContextCreate => {
                unreachable!("handled before dispatch_authorized")
            }
        }
    }

    fn handle_block_make(&mut self, child_index: u32, block_id: BlockId, cert: &[u8]) -> Response {
        let method = DataMethod::BlockMake;
        let height = if self.store.block_id_latest().is_root() {
            1
        } else {
            match self.store.block_read(self.store.block_id_latest()) {
                Some(prev) => prev.height + 1,
                None => return Response::err(method, child_index, Status::Internal),
            }
        };

        let txn_ids = collect_txn_ids_from_cert(cert);
        let first_transaction_id = txn_ids.first().copied().unwrap_or_else(TransactionId::end_sentinel);

        match self
            .store
            .block_make(block_id, height, first_transaction_id, &txn_ids, cert.to_vec())
        {
            Ok(()) => Response::ok(method, child_index, Vec::new()),
            Err(StoreError::NotFound) => Response::err(method, child_index, Status::NotFound),
            Err(StoreError::AlreadyExists) => Response::err(method, child_index, Status::MalformedRequest),
        }
    }
}

/// The block certificate format embeds each referenced transaction's id as a
/// framed copy (§4.5 "Block assembly"). This walks those frames to recover
/// the id list `block_make` needs.
fn collect_txn_ids_from_cert(cert: &[u8]) -> Vec<TransactionId> {
    agentd_types::cert::transaction_ids(cert)
}

fn required_cap(method: DataMethod) -> Option<Cap> {
    use DataMethod::*;
    Some(match method {
        ChildContextClose => Cap::ChildContextClose,
        GlobalSettingSet => Cap::GlobalSettingWrite,
        GlobalSettingGet => Cap::GlobalSettingRead,
        ArtifactRead => Cap::ArtifactRead,
        BlockIdLatestGet => Cap::BlockIdLatestRead,
        BlockIdByHeightGet => Cap::BlockIdByHeightRead,
        BlockGet => Cap::BlockRead,
        BlockMake => Cap::BlockWrite,
        CanonizedTransactionGet => Cap::CanonizedTransactionGet,
        TransactionSubmit => Cap::TransactionSubmit,
        TransactionGetFirst => Cap::TransactionGetFirst,
        TransactionGet => Cap::TransactionGet,
        TransactionDrop => Cap::TransactionDrop,
        TransactionAttest => Cap::TransactionAttest,
        RootContextInit | RootContextReduceCaps | ChildContextCreate => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_types::ArtifactId;

    fn new_child(service: &mut DataService, caps: CapBitmap) -> u32 {
        let req = Request::new(DataMethod::ChildContextCreate, Some(0), encode_child_context_create_req(caps));
        let resp = service.handle(&req.encode());
        assert!(resp.status.is_success());
        decode_child_context_create_resp(&resp.body).unwrap()
    }

    #[test]
    fn unauthorized_operation_is_rejected_without_side_effects() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::from(Cap::ArtifactRead));

        let req = Request::new(
            DataMethod::TransactionSubmit,
            Some(child),
            encode_transaction_submit_req(TransactionId::random(), ArtifactId::random(), b"cert"),
        );
        let resp = service.handle(&req.encode());
        assert_eq!(resp.status, Status::Unauthorized);
        assert!(service.store.transaction_get_first().is_none());
    }

    #[test]
    fn global_setting_write_then_read_returns_same_bytes() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::FULL);
        let value = vec![0x17, 0x23, 0x6e];

        let req = Request::new(
            DataMethod::GlobalSettingSet,
            Some(child),
            encode_global_setting_set_req(0x01, &value),
        );
        assert!(service.handle(&req.encode()).status.is_success());

        let req = Request::new(DataMethod::GlobalSettingGet, Some(child), encode_global_setting_get_req(0x01));
        let resp = service.handle(&req.encode());
        assert!(resp.status.is_success());
        assert_eq!(resp.body, value);
    }

    #[test]
    fn artifact_read_is_idempotent() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::FULL);
        let artifact_id = ArtifactId::random();

        let req = Request::new(DataMethod::ArtifactRead, Some(child), encode_artifact_read_req(artifact_id));
        let first = service.handle(&req.encode());
        let second = service.handle(&req.encode());
        assert_eq!(first.status, second.status);
        assert_eq!(first.body, second.body);
    }

    #[test]
    fn artifact_not_found_on_fresh_database() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::FULL);

        let req = Request::new(DataMethod::ArtifactRead, Some(child), encode_artifact_read_req(ArtifactId::random()));
        let resp = service.handle(&req.encode());
        assert_eq!(resp.status, Status::NotFound);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn transaction_drop_of_missing_id_is_not_found_and_queue_unchanged() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::FULL);

        let req = Request::new(DataMethod::TransactionDrop, Some(child), encode_txn_id_req(TransactionId::random()));
        let resp = service.handle(&req.encode());
        assert_eq!(resp.status, Status::NotFound);
    }

    #[test]
    fn transaction_attest_moves_submitted_into_attested_state() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::FULL);
        let txn_id = TransactionId::random();

        let req = Request::new(
            DataMethod::TransactionSubmit,
            Some(child),
            encode_transaction_submit_req(txn_id, ArtifactId::random(), b"cert"),
        );
        assert!(service.handle(&req.encode()).status.is_success());

        let req = Request::new(DataMethod::TransactionAttest, Some(child), encode_txn_id_req(txn_id));
        let resp = service.handle(&req.encode());
        assert!(resp.status.is_success());

        let req = Request::new(DataMethod::TransactionGet, Some(child), encode_txn_id_req(txn_id));
        let resp = service.handle(&req.encode());
        let decoded = decode_pending_transaction_resp(&resp.body).unwrap();
        assert_eq!(decoded.state, agentd_types::record::TransactionState::Attested);
    }

    #[test]
    fn transaction_attest_of_missing_id_is_not_found() {
        let mut service = DataService::new(64);
        let child = new_child(&mut service, CapBitmap::FULL);

        let req = Request::new(DataMethod::TransactionAttest, Some(child), encode_txn_id_req(TransactionId::random()));
        let resp = service.handle(&req.encode());
        assert_eq!(resp.status, Status::NotFound);
    }
}

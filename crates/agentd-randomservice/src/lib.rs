//! The random service (§6): a single operation, `get_random_bytes`, backed
//! directly by `agentd_crypto::random_bytes`. No child contexts, no state —
//! every request is answered independently of every other.

pub mod wire;

use agentd_types::Status;
use wire::{Request, Response, MAX_REQUEST_LENGTH};

pub struct RandomService;

impl RandomService {
    pub fn new() -> RandomService {
        RandomService
    }

    pub fn handle(&self, raw: &[u8]) -> Response {
        let request = match Request::decode(raw) {
            Ok(request) => request,
            Err(status) => return Response::err(0, status),
        };

        if request.length > MAX_REQUEST_LENGTH {
            return Response::err(request.offset, Status::RequestPacketInvalidSize);
        }

        let mut entropy = vec![0u8; request.length];
        agentd_crypto::random_bytes(&mut entropy);
        Response::ok(request.offset, entropy)
    }
}

impl Default for RandomService {
    fn default() -> RandomService {
        RandomService::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_requested_length_and_echoes_offset() {
        let service = RandomService::new();
        let req = wire::Request::encode(42, 32);
        let resp = service.handle(&req);
        assert!(resp.status.is_success());
        assert_eq!(resp.offset, 42);
        assert_eq!(resp.entropy.len(), 32);
    }

    #[test]
    fn two_draws_are_not_equal() {
        let service = RandomService::new();
        let a = service.handle(&wire::Request::encode(0, 32));
        let b = service.handle(&wire::Request::encode(0, 32));
        assert_ne!(a.entropy, b.entropy);
    }

    #[test]
    fn oversize_request_is_rejected() {
        let service = RandomService::new();
        let req = wire::Request::encode(0, MAX_REQUEST_LENGTH + 1);
        let resp = service.handle(&req);
        assert_eq!(resp.status, Status::RequestPacketInvalidSize);
    }
}

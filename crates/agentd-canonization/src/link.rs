//! A single outstanding-request connection to one backing service (data
//! service or random service). Unlike the protocol service's
//! `OutboundLink`, the canonization pipeline never has more than one request
//! in flight at a time (§4.5 is a strictly sequential state machine), so no
//! correlation bookkeeping beyond the raw framing is needed here.

use agentd_ipc::frame;
use agentd_ipc::{ErrorUtils, SocketContext};

pub struct Link {
    pub socket: SocketContext,
}

impl Link {
    pub fn new(socket: SocketContext) -> Link {
        Link { socket }
    }

    pub fn send(&mut self, payload: &[u8]) {
        let encoded = frame::encode_data(payload);
        self.socket.write_buf().push(&encoded);
    }

    /// Drains at most one complete response frame. Returns `Some(None)` if
    /// nothing complete is buffered yet, `Some(Some(payload))` on a frame,
    /// and `None` if the link itself died (peer EOF or a framing error),
    /// which is a process-wide fault for this single-purpose daemon (§5,
    /// §7).
    pub fn try_recv(&mut self) -> Option<Option<Vec<u8>>> {
        let ingress = self.socket.ingress();
        if ingress.has_failed() {
            return None;
        }

        let buf = self.socket.read_buf().read_slice();
        let (_, size) = match frame::peek_data_header(buf) {
            Ok(Some(header)) => header,
            Ok(None) => return Some(None),
            Err(_) => return None,
        };
        let total = frame::HEADER_SIZE + size;
        if buf.len() < total {
            return Some(None);
        }
        let payload = match frame::decode_data(buf) {
            Ok(payload) => payload.to_vec(),
            Err(_) => return None,
        };
        self.socket.read_buf().drain(total);
        Some(Some(payload))
    }
}

//! A client connection to one backing service (data service or random
//! service). The protocol service is itself a single-threaded event-loop
//! process (§5), so every request it sends downstream is answered in the
//! order it was sent; a `VecDeque` of connection-arena indices is enough to
//! route each response back to the session that asked for it, with no
//! explicit offset bookkeeping needed on this side of the wire (§4.4
//! "Correlation" describes the client-facing half; this is the
//! protocol-service-to-data-service half, which needs no id beyond FIFO
//! order since the data service itself never reorders responses).

use std::collections::VecDeque;

use agentd_ipc::frame;
use agentd_ipc::{ErrorUtils, SocketContext};

pub struct OutboundLink {
    pub socket: SocketContext,
    correlation: VecDeque<usize>,
}

impl OutboundLink {
    pub fn new(socket: SocketContext) -> OutboundLink {
        OutboundLink {
            socket,
            correlation: VecDeque::new(),
        }
    }

    /// Queues `payload` as a raw data frame and remembers which connection
    /// arena slot is waiting on the reply.
    pub fn send(&mut self, connection_index: usize, payload: &[u8]) {
        let encoded = frame::encode_data(payload);
        self.socket.write_buf().push(&encoded);
        self.correlation.push_back(connection_index);
    }

    /// Drains every complete frame currently buffered, pairing each with the
    /// connection index that sent the matching request. Returns `None` (and
    /// stops) on framing errors or peer EOF, signalling the link itself is
    /// dead: a backing-service socket dying is a process-wide fault (§7), not
    /// a per-connection one.
    pub fn drain_responses(&mut self) -> Option<Vec<(usize, Vec<u8>)>> {
        let ingress = self.socket.ingress();
        if ingress.has_failed() {
            return None;
        }

        let mut out = Vec::new();
        loop {
            let buf = self.socket.read_buf().read_slice();
            let (_, size) = match frame::peek_data_header(buf) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(_) => return None,
            };
            let total = frame::HEADER_SIZE + size;
            if buf.len() < total {
                break;
            }
            let payload = match frame::decode_data(buf) {
                Ok(payload) => payload.to_vec(),
                Err(_) => return None,
            };
            self.socket.read_buf().drain(total);

            match self.correlation.pop_front() {
                Some(connection_index) => out.push((connection_index, payload)),
                None => return None,
            }
        }
        Some(out)
    }
}

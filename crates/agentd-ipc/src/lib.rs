//! The framed IPC transport: buffering, wire framing, nonblocking socket
//! contexts and the cooperative event loop shared by every agentd service
//! process (§4.1, §4.2).

pub mod buffer;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod socket;

pub use buffer::Buffer;
pub use error::{ErrorKind, ErrorUtils, IpcError, IpcResult};
pub use event_loop::{EventLoop, ForceExit, SignalGuard, TimerId, Timers};
pub use socket::{drain_until_wait, SocketContext};

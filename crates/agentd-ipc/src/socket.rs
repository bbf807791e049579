use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::{Poll, PollOpt, Ready, Token};
use mio_uds::UnixStream;

use crate::buffer::Buffer;
use crate::error::{IpcError, IpcResult};

/// A nonblocking socket context: an fd, a read buffer, a write buffer, and
/// the set of readiness edges currently registered for it (§4.2). There is
/// no callback/user-pointer pair here the way the source models it — the
/// owning connection or service instance is itself the handler, dispatched
/// to by whichever loop drives it, which is the ownership-native
/// replacement the redesign notes call for (§9).
pub struct SocketContext {
    stream: UnixStream,
    token: Token,
    read_buf: Buffer,
    write_buf: Buffer,
    interest: Ready,
    registered: bool,
}

impl SocketContext {
    pub fn new(stream: UnixStream, token: Token, read_buf_size: usize, write_buf_size: usize) -> SocketContext {
        SocketContext {
            stream,
            token,
            read_buf: Buffer::new(read_buf_size),
            write_buf: Buffer::new(write_buf_size),
            interest: Ready::empty(),
            registered: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn read_buf(&mut self) -> &mut Buffer {
        &mut self.read_buf
    }

    pub fn write_buf(&mut self) -> &mut Buffer {
        &mut self.write_buf
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Drains as many bytes as the kernel currently has for this socket
    /// into the read buffer.
    pub fn ingress(&mut self) -> IpcResult<usize> {
        Ok(self.read_buf.ingress(&self.stream)?)
    }

    /// Flushes as much of the write buffer as the kernel will currently
    /// accept.
    pub fn egress(&mut self) -> IpcResult<usize> {
        Ok(self.write_buf.egress(&self.stream)?)
    }

    /// Registers (or updates) this socket's readiness interest. Passing
    /// `read = false, write = false` fully deregisters the edge, mirroring
    /// "setting a read or write callback to null deregisters that edge"
    /// (§4.2).
    pub fn set_interest(&mut self, poll: &Poll, read: bool, write: bool) -> io::Result<()> {
        let mut ready = Ready::empty();
        if read {
            ready |= Ready::readable();
        }
        if write {
            ready |= Ready::writable();
        }

        if ready == self.interest && self.registered {
            return Ok(());
        }

        if ready.is_empty() {
            if self.registered {
                poll.deregister(&self.stream)?;
                self.registered = false;
            }
        } else if self.registered {
            poll.reregister(&self.stream, self.token, ready, PollOpt::edge())?;
        } else {
            poll.register(&self.stream, self.token, ready, PollOpt::edge())?;
            self.registered = true;
        }

        self.interest = ready;
        Ok(())
    }

    pub fn deregister(&mut self, poll: &Poll) -> io::Result<()> {
        if self.registered {
            poll.deregister(&self.stream)?;
            self.registered = false;
            self.interest = Ready::empty();
        }
        Ok(())
    }
}

/// Repeatedly invokes `op` until it returns `IpcError::Wait` or a fatal
/// error, matching the teacher's `ready_op` drain-to-exhaustion pattern for
/// edge-triggered readiness (an edge fires once, so every callback must
/// drain until the kernel would truly block).
pub fn drain_until_wait<F>(mut op: F) -> IpcResult<()>
where
    F: FnMut() -> IpcResult<()>,
{
    loop {
        match op() {
            Ok(()) => continue,
            Err(IpcError::Wait) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

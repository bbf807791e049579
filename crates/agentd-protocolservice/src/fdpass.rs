//! SCM_RIGHTS file-descriptor handoff between the listener process and the
//! protocol service (§6 "Socket topology": a listener accepts client
//! connections and hands each accepted socket's fd to the protocol service
//! over a control datagram socket, rather than the protocol service binding
//! the public listener itself).
//!
//! `mio`/`mio-uds` have no notion of passing an fd as ancillary data, so
//! this goes through `nix`'s `sendmsg`/`recvmsg` wrappers directly against
//! the raw fd of whatever socket type the caller is using.

use std::io;
use std::os::unix::io::RawFd;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;

/// A tiny tag byte is enough payload; the fd is the whole point of the
/// message and the listener has nothing else to say.
pub const HANDOFF_TAG: u8 = 0x01;

fn nix_to_io(err: nix::Error) -> io::Error {
    match err.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, "nix error without errno"),
    }
}

/// Sends `fd` as SCM_RIGHTS ancillary data over `control_fd`, the raw fd of
/// the listener's control socket.
pub fn send_fd(control_fd: RawFd, fd: RawFd) -> io::Result<()> {
    let payload = [HANDOFF_TAG];
    let iov = [IoVec::from_slice(&payload)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(control_fd, &iov, &cmsg, MsgFlags::empty(), None)
        .map(|_| ())
        .map_err(nix_to_io)
}

/// Receives one fd handed off over `control_fd`, the raw fd of the protocol
/// service's control socket. Returns `Ok(None)` if a datagram arrived with
/// no attached fd (a malformed or foreign sender); that datagram is still
/// consumed.
pub fn recv_fd(control_fd: RawFd) -> io::Result<Option<RawFd>> {
    let mut buf = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut space = cmsg_space!([RawFd; 1]);
    let msg = recvmsg(control_fd, &iov, Some(&mut space), MsgFlags::empty()).map_err(nix_to_io)?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(Some(fd));
            }
        }
    }
    Ok(None)
}

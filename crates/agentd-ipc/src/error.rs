use std::io;

/// The fixed error taxonomy the core must distinguish (§7). `WOULD_BLOCK` is
/// benign and handled separately via [`IpcError::Wait`]; every other kind is
/// fatal to the operation that raised it.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ErrorKind {
    Eof,
    PacketBadSize,
    UnexpectedDataType,
    OutOfMemory,
    AuthFailure,
    Unauthorized,
    MalformedRequest,
    NotFound,
    CryptoFailure,
    IpcWriteFailure,
    Io(io::ErrorKind),
}

pub type IpcResult<T> = Result<T, IpcError>;

/// Mirrors the `Wait` / `Fatal` split used throughout the event loop: a
/// `Wait` means "try again on the next readiness edge", never a real error.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum IpcError {
    Wait,
    Fatal(ErrorKind),
}

impl IpcError {
    pub fn fatal(kind: ErrorKind) -> IpcError {
        IpcError::Fatal(kind)
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> IpcError {
        match err.kind() {
            io::ErrorKind::WouldBlock => IpcError::Wait,
            io::ErrorKind::UnexpectedEof => IpcError::Fatal(ErrorKind::Eof),
            kind => IpcError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

/// Analogous to the teacher's `ErrorUtils`: distinguishes a benign wait from
/// anything that should short-circuit to a cleanup path (§7 propagation
/// policy).
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
    fn is_wait(&self) -> bool;
}

impl<T> ErrorUtils for IpcResult<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(IpcError::Wait))
    }

    fn is_wait(&self) -> bool {
        matches!(self, Err(IpcError::Wait))
    }
}

/// Data/random-service response status codes. `Success` is always zero
/// (§6); everything else names a precise reason a request was not honored.
/// A response is always emitted, even on a decode failure, carrying the
/// status that best describes why (§4.3 "Response rules").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    RequestPacketInvalidSize = 1,
    ChildContextBadIndex = 2,
    ChildContextInvalid = 3,
    Unauthorized = 4,
    NotFound = 5,
    MalformedRequest = 6,
    OutOfMemory = 7,
    CryptoFailure = 8,
    TransactionVerification = 9,
    Internal = 10,
}

impl Status {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Status> {
        use Status::*;
        Some(match value {
            0 => Success,
            1 => RequestPacketInvalidSize,
            2 => ChildContextBadIndex,
            3 => ChildContextInvalid,
            4 => Unauthorized,
            5 => NotFound,
            6 => MalformedRequest,
            7 => OutOfMemory,
            8 => CryptoFailure,
            9 => TransactionVerification,
            10 => Internal,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

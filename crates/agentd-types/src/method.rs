/// Data-service method identifiers. These are the first 32-bit big-endian
/// word of every data-service request and response (§6).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum DataMethod {
    RootContextInit = 0x0000_0000,
    RootContextReduceCaps = 0x0000_0001,
    ChildContextCreate = 0x0000_0002,
    ChildContextClose = 0x0000_0003,
    GlobalSettingSet = 0x0000_0010,
    GlobalSettingGet = 0x0000_0011,
    ArtifactRead = 0x0000_0020,
    TransactionSubmit = 0x0000_0030,
    TransactionGetFirst = 0x0000_0031,
    TransactionGet = 0x0000_0032,
    TransactionDrop = 0x0000_0033,
    TransactionAttest = 0x0000_0034,
    CanonizedTransactionGet = 0x0000_0040,
    BlockMake = 0x0000_0050,
    BlockGet = 0x0000_0051,
    BlockIdLatestGet = 0x0000_0052,
    BlockIdByHeightGet = 0x0000_0053,
}

impl DataMethod {
    pub fn from_u32(value: u32) -> Option<DataMethod> {
        use DataMethod::*;
        Some(match value {
            0x0000_0000 => RootContextInit,
            0x0000_0001 => RootContextReduceCaps,
            0x0000_0002 => ChildContextCreate,
            0x0000_0003 => ChildContextClose,
            0x0000_0010 => GlobalSettingSet,
            0x0000_0011 => GlobalSettingGet,
            0x0000_0020 => ArtifactRead,
            0x0000_0030 => TransactionSubmit,
            0x0000_0031 => TransactionGetFirst,
            0x0000_0032 => TransactionGet,
            0x0000_0033 => TransactionDrop,
            0x0000_0034 => TransactionAttest,
            0x0000_0040 => CanonizedTransactionGet,
            0x0000_0050 => BlockMake,
            0x0000_0051 => BlockGet,
            0x0000_0052 => BlockIdLatestGet,
            0x0000_0053 => BlockIdByHeightGet,
            _ => return None,
        })
    }

    /// Whether this method omits the child-index header word (root-context
    /// operations act on the implicit root context).
    pub fn is_root_context_op(self) -> bool {
        matches!(
            self,
            DataMethod::RootContextInit | DataMethod::RootContextReduceCaps
        )
    }
}

/// Random-service method identifiers (§6). There is exactly one operation
/// today; the id still travels on the wire so the response can be routed the
/// same way data-service responses are.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum RandomMethod {
    GetRandomBytes = 0x0000_0000,
}

impl RandomMethod {
    pub fn from_u32(value: u32) -> Option<RandomMethod> {
        match value {
            0x0000_0000 => Some(RandomMethod::GetRandomBytes),
            _ => None,
        }
    }
}

use std::ops;

/// A single capability bit granted to a data-service child context. The
/// fixed enumeration is small enough to fit in a `u64` bitmap, mirroring the
/// composite-key pattern used elsewhere in this codebase for compact
/// membership tests over small closed sets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Cap {
    RootContextReduceCaps = 0,
    ChildContextCreate = 1,
    ChildContextClose = 2,
    GlobalSettingRead = 3,
    GlobalSettingWrite = 4,
    ArtifactRead = 5,
    BlockRead = 6,
    BlockIdLatestRead = 7,
    BlockIdByHeightRead = 8,
    BlockWrite = 9,
    TransactionSubmit = 10,
    TransactionGetFirst = 11,
    TransactionGet = 12,
    TransactionDrop = 13,
    CanonizedTransactionGet = 14,
    TransactionAttest = 15,
}

impl Cap {
    const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

/// A bitmap of granted [`Cap`] values. Requests against a child context are
/// authorized by intersecting this bitmap against the operation's required
/// bit; an unset bit fails the request before any storage access happens.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct CapBitmap(pub u64);

impl CapBitmap {
    pub const EMPTY: CapBitmap = CapBitmap(0);

    /// Every capability a root context may grant to its children.
    pub const FULL: CapBitmap = CapBitmap(
        Cap::RootContextReduceCaps.bit()
            | Cap::ChildContextCreate.bit()
            | Cap::ChildContextClose.bit()
            | Cap::GlobalSettingRead.bit()
            | Cap::GlobalSettingWrite.bit()
            | Cap::ArtifactRead.bit()
            | Cap::BlockRead.bit()
            | Cap::BlockIdLatestRead.bit()
            | Cap::BlockIdByHeightRead.bit()
            | Cap::BlockWrite.bit()
            | Cap::TransactionSubmit.bit()
            | Cap::TransactionGetFirst.bit()
            | Cap::TransactionGet.bit()
            | Cap::TransactionDrop.bit()
            | Cap::CanonizedTransactionGet.bit()
            | Cap::TransactionAttest.bit(),
    );

    /// The capability set the canonization pipeline requests for its child
    /// context: pq read first, pq read, latest block id, block read, block
    /// write, close.
    pub const CANONIZATION: CapBitmap = CapBitmap(
        Cap::TransactionGetFirst.bit()
            | Cap::TransactionGet.bit()
            | Cap::BlockIdLatestRead.bit()
            | Cap::BlockRead.bit()
            | Cap::BlockWrite.bit()
            | Cap::ChildContextClose.bit(),
    );

    pub fn from_bits(bits: u64) -> CapBitmap {
        CapBitmap(bits)
    }

    pub fn contains(&self, cap: Cap) -> bool {
        (self.0 & cap.bit()) == cap.bit()
    }

    /// Replaces this bitmap with the intersection of `self` and `requested`,
    /// the rule used both by `root_context_reduce_caps` and by
    /// `child_context_create`.
    pub fn intersect(&self, requested: CapBitmap) -> CapBitmap {
        CapBitmap(self.0 & requested.0)
    }

    pub fn is_subset_of(&self, parent: CapBitmap) -> bool {
        (self.0 & parent.0) == self.0
    }
}

impl ops::BitOr for Cap {
    type Output = CapBitmap;

    fn bitor(self, rhs: Cap) -> CapBitmap {
        CapBitmap(self.bit() | rhs.bit())
    }
}

impl ops::BitOr for CapBitmap {
    type Output = CapBitmap;

    fn bitor(self, rhs: CapBitmap) -> CapBitmap {
        CapBitmap(self.0 | rhs.0)
    }
}

impl From<Cap> for CapBitmap {
    fn from(cap: Cap) -> CapBitmap {
        CapBitmap(cap.bit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_never_grants_beyond_parent() {
        let parent = CapBitmap::from(Cap::ArtifactRead) | Cap::BlockRead.into();
        let requested = CapBitmap::FULL;
        let granted = parent.intersect(requested);
        assert!(granted.is_subset_of(parent));
        assert!(granted.contains(Cap::ArtifactRead));
        assert!(!granted.contains(Cap::BlockWrite));
    }

    #[test]
    fn canonization_set_excludes_submit() {
        assert!(!CapBitmap::CANONIZATION.contains(Cap::TransactionSubmit));
        assert!(CapBitmap::CANONIZATION.contains(Cap::BlockWrite));
    }
}

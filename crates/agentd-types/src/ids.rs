use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

/// A 128-bit opaque identifier shared by every entity, transaction, artifact and
/// block in the system. Distinct roles are distinguished by the newtypes below,
/// not by any structural difference in the bytes themselves.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Id(pub [u8; 16]);

impl Id {
    pub const SIZE: usize = 16;

    pub const fn zero() -> Id {
        Id([0u8; 16])
    }

    pub const fn all_ones() -> Id {
        Id([0xffu8; 16])
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Id> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        Some(Id(buf))
    }

    pub fn random() -> Id {
        Id(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn is_all_ones(&self) -> bool {
        self.0.iter().all(|b| *b == 0xff)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl From<Uuid> for Id {
    fn from(u: Uuid) -> Id {
        Id(*u.as_bytes())
    }
}

impl From<Id> for Uuid {
    fn from(id: Id) -> Uuid {
        Uuid::from_bytes(id.0)
    }
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[repr(transparent)]
        pub struct $name(pub Id);

        impl $name {
            pub fn from_slice(bytes: &[u8]) -> Option<$name> {
                Id::from_slice(bytes).map($name)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn random() -> $name {
                $name(Id::random())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Id> for $name {
            fn from(id: Id) -> $name {
                $name(id)
            }
        }

        impl From<$name> for Id {
            fn from(v: $name) -> Id {
                v.0
            }
        }
    };
}

id_newtype!(EntityId);
id_newtype!(TransactionId);
id_newtype!(ArtifactId);
id_newtype!(BlockId);

impl TransactionId {
    /// The "begin" sentinel of the pending transaction queue: an all-zero id.
    pub const fn begin_sentinel() -> TransactionId {
        TransactionId(Id::zero())
    }

    /// The "end" sentinel of the pending transaction queue: an all-ones id.
    pub const fn end_sentinel() -> TransactionId {
        TransactionId(Id::all_ones())
    }

    pub fn is_begin_sentinel(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_end_sentinel(&self) -> bool {
        self.0.is_all_ones()
    }
}

impl BlockId {
    /// Well-known identifier of the root block. Height 0 is implicit and never
    /// persisted; the first real block built on top of it has height 1.
    pub const fn root() -> BlockId {
        BlockId(Id::zero())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_zero()
    }
}

/// Reads a big-endian `u64` out of `bytes[offset..offset + 8]`.
pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&bytes[offset..offset + 8])
}

/// Writes `value` as a big-endian `u64` into `bytes[offset..offset + 8]`.
pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    BigEndian::write_u64(&mut bytes[offset..offset + 8], value);
}

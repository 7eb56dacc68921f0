//! 256-bit identifiers and the XOR distance metric.
//!
//! Identifiers name both peers and document keys. Distance between two
//! identifiers is their bitwise XOR, compared as a 256-bit big-endian
//! integer; the routing table's split operation additionally needs MSB-first
//! bit addressing into the identifier space.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bytes in an identifier.
pub const ID_LENGTH: usize = 32;

/// Number of addressable bits in an identifier.
pub const ID_BITS: usize = ID_LENGTH * 8;

/// A 256-bit identifier, ordered as an unsigned big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; ID_LENGTH]);

impl Id {
    pub const MIN: Id = Id([0u8; ID_LENGTH]);
    pub const MAX: Id = Id([0xff; ID_LENGTH]);

    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Bit `i` of the identifier, MSB-first: bit 0 is the high bit of byte 0.
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < ID_BITS);
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// Copy of the identifier with bit `i` (MSB-first) set to 1.
    pub fn with_bit_set(&self, i: usize) -> Id {
        debug_assert!(i < ID_BITS);
        let mut out = self.0;
        out[i / 8] |= 0x80 >> (i % 8);
        Id(out)
    }

    /// Truncated hex form used in log fields.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}..)", self.short_hex())
    }
}

/// XOR distance between two identifiers, compared as a 256-bit integer.
///
/// The derived ordering on the byte array is lexicographic, which for
/// big-endian bytes is exactly numeric ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; ID_LENGTH]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LENGTH]);
    pub const MAX: Distance = Distance([0xff; ID_LENGTH]);
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({}..)", hex::encode(&self.0[..8]))
    }
}

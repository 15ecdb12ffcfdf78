//! Identity types for the Arbor substrate
//!
//! Every store entry, event loop and membrane is named by a 64-bit key drawn
//! from the object store's ordered pool. Uniqueness among live entries is the
//! only property relied upon; the numeric value carries no meaning.

use std::fmt;

/// Store key - unique among live entries
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(pub u64);

impl Key {
    pub const ZERO: Key = Key(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        Key(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Key(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:016x})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Exact reference to a store entry: the key plus the generation it was
/// issued under. A recycled key gets a new generation, so a handle kept
/// past `release` can never reach the entry that reuses its key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    pub key: Key,
    pub generation: u32,
}

impl Handle {
    #[inline]
    pub fn new(key: Key, generation: u32) -> Self {
        Handle { key, generation }
    }

    #[inline]
    pub fn key(self) -> Key {
        self.key
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:016x}@{})", self.key.0, self.generation)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.generation)
    }
}

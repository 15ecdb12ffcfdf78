//! Store entries and links

use arbor_core::Handle;

/// Relation carried by a link
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelationKind {
    /// Concurrent aggregation
    Aggregate = 2,
    /// Composition (parent/child structure)
    Compose = 3,
    /// Repeated application
    Iterate = 5,
}

impl RelationKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            2 => Some(RelationKind::Aggregate),
            3 => Some(RelationKind::Compose),
            5 => Some(RelationKind::Iterate),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Directed, weighted edge from one entry to another. Links are not
/// de-duplicated; adding the same edge twice stores it twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub target: Handle,
    pub weight_tag: u64,
    pub weight_magnitude: u32,
    pub kind: RelationKind,
}

/// Buffer supplied by an external compute backend. The store keeps the
/// address and length only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalBuffer {
    pub backend: String,
    pub address: u64,
    pub len: usize,
}

/// Backing memory of an entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Local(Vec<u8>),
    External(ExternalBuffer),
}

impl Payload {
    pub fn zeroed(size: usize) -> Self {
        Payload::Local(vec![0u8; size])
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Local(data) => data.len(),
            Payload::External(buffer) => buffer.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Payload::External(_))
    }
}

/// A live entry in the store
#[derive(Clone, Debug)]
pub struct StoreEntry {
    pub handle: Handle,
    /// Hierarchy depth the entry was allocated for
    pub depth: u32,
    pub payload: Payload,
    pub links: Vec<Link>,
}

impl StoreEntry {
    pub fn new(handle: Handle, depth: u32, size: usize) -> Self {
        StoreEntry {
            handle,
            depth,
            payload: Payload::zeroed(size),
            links: Vec::new(),
        }
    }

    /// Size tracked for reallocation
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

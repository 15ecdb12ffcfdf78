//! Event definitions
//!
//! Events are the only way work reaches a loop. Each carries its kind, the
//! key of the unit that raised it, an optional addressee, a payload whose
//! ownership is part of its type, and the time it was raised.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::{Key, Multiset, Timestamp};

/// Event kind - dispatch is an exhaustive match on this
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Run the paired membrane's rule engine
    Evolve = 0,
    /// Deliver a payload and fan out to child loops
    Propagate = 1,
    TimerExpire = 2,
    IoReady = 3,
    Interrupt = 4,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Evolve,
        EventKind::Propagate,
        EventKind::TimerExpire,
        EventKind::IoReady,
        EventKind::Interrupt,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Evolve => "evolve",
            EventKind::Propagate => "propagate",
            EventKind::TimerExpire => "timer_expire",
            EventKind::IoReady => "io_ready",
            EventKind::Interrupt => "interrupt",
        }
    }

    /// Kinds handled by externally owned stage handlers
    pub fn is_external(self) -> bool {
        matches!(
            self,
            EventKind::TimerExpire | EventKind::IoReady | EventKind::Interrupt
        )
    }
}

/// Reference to an object owned outside the substrate. Cloning shares the
/// reference; the substrate never interprets or frees what it points to.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Opaque(Arc::new(value))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Opaque(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Opaque(..)")
    }
}

/// Event payload, tagged by who owns it
#[derive(Clone, Debug, Default)]
pub enum EventPayload {
    #[default]
    None,
    /// Bytes owned by the event; freed with it
    Owned(Bytes),
    /// Object parcel moving between membranes; owned by the event
    Objects(Multiset),
    /// Externally owned; never freed by the loop, handed back on teardown
    Borrowed(Opaque),
}

impl EventPayload {
    pub fn is_none(&self) -> bool {
        matches!(self, EventPayload::None)
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, EventPayload::Borrowed(_))
    }

    /// Owned payloads are released by whoever drops the event
    pub fn is_owned(&self) -> bool {
        matches!(self, EventPayload::Owned(_) | EventPayload::Objects(_))
    }

    /// Byte size for owned bytes, object count for parcels
    pub fn len(&self) -> usize {
        match self {
            EventPayload::None | EventPayload::Borrowed(_) => 0,
            EventPayload::Owned(bytes) => bytes.len(),
            EventPayload::Objects(objects) => objects.total() as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An event queued on a loop
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    /// Unit that raised the event
    pub source: Key,
    /// Addressee; `None` means the event may fan out
    pub target: Option<Key>,
    pub payload: EventPayload,
    pub timestamp: Timestamp,
    /// Position in the receiving loop's queue, assigned on post
    pub seq: u64,
}

impl Event {
    pub fn new(kind: EventKind, source: Key) -> Self {
        Event {
            kind,
            source,
            target: None,
            payload: EventPayload::None,
            timestamp: Timestamp::now(),
            seq: 0,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_bytes(self, data: impl Into<Bytes>) -> Self {
        self.with_payload(EventPayload::Owned(data.into()))
    }

    pub fn addressed_to(mut self, target: Key) -> Self {
        self.target = Some(target);
        self
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Broadcast, or addressed to `key`
    #[inline]
    pub fn is_for(&self, key: Key) -> bool {
        self.target.map_or(true, |t| t == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectType;

    #[test]
    fn test_kind_indices_are_dense() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert!(EventKind::Interrupt.is_external());
        assert!(!EventKind::Propagate.is_external());
    }

    #[test]
    fn test_payload_ownership_tags() {
        assert!(EventPayload::Owned(Bytes::from_static(b"x")).is_owned());
        assert!(EventPayload::Objects(Multiset::from_pairs([(ObjectType(1), 2)])).is_owned());

        let external = Opaque::new(42u32);
        let payload = EventPayload::Borrowed(external.clone());
        assert!(payload.is_borrowed());
        assert!(!payload.is_owned());
        assert_eq!(payload.len(), 0);
        if let EventPayload::Borrowed(inner) = payload {
            assert!(inner.ptr_eq(&external));
            assert_eq!(inner.downcast_ref::<u32>(), Some(&42));
        }
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventKind::Propagate, Key::new(2))
            .with_bytes(&b"hello"[..])
            .addressed_to(Key::new(3))
            .at(Timestamp::from_micros(7));
        assert_eq!(event.payload.len(), 5);
        assert!(event.is_for(Key::new(3)));
        assert!(!event.is_for(Key::new(5)));
        assert_eq!(event.timestamp.as_micros(), 7);
    }
}

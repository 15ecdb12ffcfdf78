//! Typed-object multisets
//!
//! A membrane's contents are counts per object type. Multisets here are
//! ordered by type so iteration, equality and debug output are deterministic.

use std::collections::BTreeMap;
use std::fmt;

use crate::{KernelError, KernelResult};

/// Object type tag
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectType(pub u32);

impl ObjectType {
    #[inline]
    pub fn new(id: u32) -> Self {
        ObjectType(id)
    }
}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Multiset of typed objects; zero counts are never stored
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Multiset {
    counts: BTreeMap<ObjectType, u64>,
}

impl Multiset {
    pub fn new() -> Self {
        Multiset::default()
    }

    /// Build from `(type, count)` pairs, summing repeated types
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (ObjectType, u64)>,
    {
        let mut set = Multiset::new();
        for (object, count) in pairs {
            set.add(object, count);
        }
        set
    }

    pub fn count(&self, object: ObjectType) -> u64 {
        self.counts.get(&object).copied().unwrap_or(0)
    }

    pub fn add(&mut self, object: ObjectType, count: u64) {
        if count == 0 {
            return;
        }
        let slot = self.counts.entry(object).or_insert(0);
        *slot = slot.saturating_add(count);
    }

    /// Remove `count` copies; fails without changing anything when short
    pub fn remove(&mut self, object: ObjectType, count: u64) -> KernelResult<()> {
        let available = self.count(object);
        if count > available {
            return Err(KernelError::InsufficientStock {
                object,
                requested: count,
                available,
            });
        }
        if count == available {
            self.counts.remove(&object);
        } else if count > 0 {
            self.counts.insert(object, available - count);
        }
        Ok(())
    }

    /// Every type in `other` is present here at least as many times
    pub fn covers(&self, other: &Multiset) -> bool {
        other
            .counts
            .iter()
            .all(|(object, &needed)| self.count(*object) >= needed)
    }

    /// First type of `other` this set cannot supply, with the shortfall
    pub fn shortfall(&self, other: &Multiset) -> Option<KernelError> {
        other.counts.iter().find_map(|(object, &needed)| {
            let available = self.count(*object);
            (available < needed).then_some(KernelError::InsufficientStock {
                object: *object,
                requested: needed,
                available,
            })
        })
    }

    /// Remove all of `other`, all-or-nothing
    pub fn subtract(&mut self, other: &Multiset) -> KernelResult<()> {
        if let Some(err) = self.shortfall(other) {
            return Err(err);
        }
        for (object, &count) in &other.counts {
            self.remove(*object, count)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &Multiset) {
        for (object, &count) in &other.counts {
            self.add(*object, count);
        }
    }

    /// Split into two halves, the first taking the odd remainder
    pub fn halve(&self) -> (Multiset, Multiset) {
        let mut first = Multiset::new();
        let mut second = Multiset::new();
        for (object, &count) in &self.counts {
            first.add(*object, count - count / 2);
            second.add(*object, count / 2);
        }
        (first, second)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of distinct types
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Total number of objects
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectType, u64)> + '_ {
        self.counts.iter().map(|(o, c)| (*o, *c))
    }
}

impl FromIterator<(ObjectType, u64)> for Multiset {
    fn from_iter<T: IntoIterator<Item = (ObjectType, u64)>>(iter: T) -> Self {
        Multiset::from_pairs(iter)
    }
}

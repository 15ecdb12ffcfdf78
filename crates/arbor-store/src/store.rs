//! Object store - keyed entries, allocation pool and link graph

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use arbor_core::{Handle, Key, KernelError, KernelResult};

use crate::{ExternalBuffer, KeyPool, Link, Payload, RelationKind, StoreEntry};

/// Object store configuration
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Keys in the ordered pool
    pub key_pool_size: usize,
    /// Largest payload a single entry may hold
    pub max_payload: usize,
    /// Reissue released keys once the ordered pool is spent
    pub recycle_keys: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            key_pool_size: 10_000,
            max_payload: 1 << 20,
            recycle_keys: true,
        }
    }
}

/// Store counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: u64,
    pub links: u64,
    pub allocs: u64,
    pub frees: u64,
    pub keys_issued: u64,
    pub keys_recycled: u64,
}

struct StoreInner {
    entries: HashMap<Key, StoreEntry>,
    pool: KeyPool,
    stats: StoreStats,
}

impl StoreInner {
    fn entry(&self, handle: Handle) -> KernelResult<&StoreEntry> {
        match self.entries.get(&handle.key) {
            Some(entry) if entry.handle.generation == handle.generation => Ok(entry),
            _ => Err(KernelError::invalid(format!("stale or unknown handle {}", handle))),
        }
    }

    fn entry_mut(&mut self, handle: Handle) -> KernelResult<&mut StoreEntry> {
        match self.entries.get_mut(&handle.key) {
            Some(entry) if entry.handle.generation == handle.generation => Ok(entry),
            _ => Err(KernelError::invalid(format!("stale or unknown handle {}", handle))),
        }
    }

    fn allocate(&mut self, size: usize, depth: u32, max_payload: usize) -> KernelResult<Handle> {
        if size == 0 {
            return Err(KernelError::invalid("zero-sized allocation"));
        }
        if size > max_payload {
            return Err(KernelError::capacity("payload bytes", max_payload));
        }
        let (key, generation) = self
            .pool
            .next()
            .ok_or_else(|| KernelError::capacity("key pool", self.pool.size()))?;

        if self.entries.contains_key(&key) {
            // A recycled key can only come back after its entry is gone
            self.pool.unget(key, generation);
            return Err(KernelError::invalid(format!("key {} still live", key)));
        }

        let handle = Handle::new(key, generation);
        self.entries.insert(key, StoreEntry::new(handle, depth, size));
        self.stats.entries += 1;
        self.stats.allocs += 1;
        if generation == 0 {
            self.stats.keys_issued += 1;
        } else {
            self.stats.keys_recycled += 1;
        }
        Ok(handle)
    }

    fn release(&mut self, handle: Handle) -> KernelResult<StoreEntry> {
        self.entry(handle)?;
        let entry = self
            .entries
            .remove(&handle.key)
            .ok_or_else(|| KernelError::invalid(format!("unknown handle {}", handle)))?;
        self.stats.entries -= 1;
        self.stats.frees += 1;
        self.stats.links -= entry.links.len() as u64;
        self.pool.give_back(handle.key, handle.generation);
        Ok(entry)
    }
}

/// Object store - shared by every loop and membrane, internally locked
pub struct ObjectStore {
    config: StoreConfig,
    inner: Mutex<StoreInner>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let pool = KeyPool::new(config.key_pool_size, config.recycle_keys);
        debug!(
            pool = pool.size(),
            max_payload = config.max_payload,
            "object store initialised"
        );
        ObjectStore {
            inner: Mutex::new(StoreInner {
                entries: HashMap::with_capacity(config.key_pool_size.min(4096)),
                pool,
                stats: StoreStats::default(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Allocate a zero-initialised entry of `size` bytes
    pub fn allocate(&self, size: usize, depth: u32) -> KernelResult<Handle> {
        let handle = self
            .inner
            .lock()
            .allocate(size, depth, self.config.max_payload)?;
        trace!(%handle, size, depth, "allocate");
        Ok(handle)
    }

    /// Remove an entry and its outgoing links
    pub fn release(&self, handle: Handle) -> KernelResult<()> {
        match self.inner.lock().release(handle) {
            Ok(entry) => {
                trace!(%handle, size = entry.size(), "release");
                Ok(())
            }
            Err(err) => {
                warn!(%handle, "release of stale or unknown handle");
                Err(err)
            }
        }
    }

    /// Move an entry to a fresh key with a payload of `new_size` bytes,
    /// keeping the common prefix. The old entry and its links are released.
    pub fn reallocate(&self, handle: Handle, new_size: usize) -> KernelResult<Handle> {
        if new_size == 0 {
            return Err(KernelError::invalid("reallocate to zero bytes"));
        }
        let mut inner = self.inner.lock();
        let old = inner.entry(handle)?;
        let depth = old.depth;
        let prefix = match &old.payload {
            Payload::Local(data) => data[..data.len().min(new_size)].to_vec(),
            Payload::External(_) => {
                return Err(KernelError::Unimplemented("reallocate externally backed entry"))
            }
        };

        let fresh = inner.allocate(new_size, depth, self.config.max_payload)?;
        if let Payload::Local(data) = &mut inner.entry_mut(fresh)?.payload {
            data[..prefix.len()].copy_from_slice(&prefix);
        }
        inner.release(handle)?;
        trace!(from = %handle, to = %fresh, new_size, "reallocate");
        Ok(fresh)
    }

    /// Append a link to `from`'s edge list
    pub fn link(
        &self,
        from: Handle,
        to: Handle,
        weight_tag: u64,
        weight_magnitude: u32,
        kind: RelationKind,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        inner.entry(to)?;
        inner.entry_mut(from)?.links.push(Link {
            target: to,
            weight_tag,
            weight_magnitude,
            kind,
        });
        inner.stats.links += 1;
        Ok(())
    }

    /// Outgoing links of an entry
    pub fn links(&self, handle: Handle) -> KernelResult<Vec<Link>> {
        Ok(self.inner.lock().entry(handle)?.links.clone())
    }

    /// Current handle for a key, if it is live
    pub fn find(&self, key: Key) -> Option<Handle> {
        self.inner.lock().entries.get(&key).map(|e| e.handle)
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.inner.lock().entry(handle).is_ok()
    }

    pub fn size_of(&self, handle: Handle) -> KernelResult<usize> {
        Ok(self.inner.lock().entry(handle)?.size())
    }

    pub fn depth_of(&self, handle: Handle) -> KernelResult<u32> {
        Ok(self.inner.lock().entry(handle)?.depth)
    }

    /// Copy of an entry's local payload
    pub fn read(&self, handle: Handle) -> KernelResult<Vec<u8>> {
        self.with_payload(handle, |data| data.to_vec())
    }

    /// Run `f` over an entry's local payload without copying it out
    pub fn with_payload<R>(&self, handle: Handle, f: impl FnOnce(&[u8]) -> R) -> KernelResult<R> {
        let inner = self.inner.lock();
        match &inner.entry(handle)?.payload {
            Payload::Local(data) => Ok(f(data)),
            Payload::External(_) => Err(KernelError::Unimplemented("read externally backed entry")),
        }
    }

    /// Write `bytes` at `offset` into an entry's local payload
    pub fn write(&self, handle: Handle, offset: usize, bytes: &[u8]) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(handle)?;
        let data = match &mut entry.payload {
            Payload::Local(data) => data,
            Payload::External(_) => {
                return Err(KernelError::Unimplemented("write externally backed entry"))
            }
        };
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                KernelError::invalid(format!(
                    "write of {} bytes at {} overruns {}-byte entry",
                    bytes.len(),
                    offset,
                    data.len()
                ))
            })?;
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Back an entry with a buffer owned by an external compute backend.
    /// The local payload is dropped; only the address and length are kept.
    pub fn attach_external(&self, handle: Handle, buffer: ExternalBuffer) -> KernelResult<()> {
        if buffer.len == 0 {
            return Err(KernelError::invalid("empty external buffer"));
        }
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(handle)?;
        debug!(%handle, backend = %buffer.backend, len = buffer.len, "external buffer attached");
        entry.payload = Payload::External(buffer);
        Ok(())
    }

    pub fn external_buffer(&self, handle: Handle) -> KernelResult<Option<ExternalBuffer>> {
        let inner = self.inner.lock();
        Ok(match &inner.entry(handle)?.payload {
            Payload::External(buffer) => Some(buffer.clone()),
            Payload::Local(_) => None,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.lock().stats.entries
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats.clone()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

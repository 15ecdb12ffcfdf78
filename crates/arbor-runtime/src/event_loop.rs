//! Event loop tree
//!
//! A loop owns a bounded FIFO of events and dispatches them one at a time.
//! Loops form a tree: a parent holds its children, a child refers back to
//! its parent without owning it. `Propagate` events fan out down the tree,
//! `Evolve` ticks the membrane paired with the loop, and the external kinds
//! go to an installed [`StageHandler`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use arbor_core::{
    Deadline, Event, EventKind, EventPayload, Handle, Key, KernelError, KernelResult, Topology,
    CANONICAL_MAX_DEPTH,
};
use arbor_store::ObjectStore;

use crate::{EventSink, LoopStats, StageHandler};

/// Bytes each loop reserves in the store for its queue record
pub const LOOP_RECORD_SIZE: usize = 64;

/// Event loop configuration
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Longest a single dispatch may take before it reports a timeout
    pub process_budget: Duration,
    /// Queued events beyond which `post` is refused
    pub queue_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            process_budget: Duration::from_millis(1),
            queue_capacity: 4096,
        }
    }
}

/// What a teardown released
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub loops: usize,
    pub membranes: usize,
    /// Queued events dropped together with any payload they owned
    pub freed: usize,
    /// Queued events whose payload is externally owned
    pub handed_back: Vec<Event>,
    /// Children still attached to a loop when it was destroyed
    pub orphaned: usize,
}

impl TeardownReport {
    pub fn absorb(&mut self, other: TeardownReport) {
        self.loops += other.loops;
        self.membranes += other.membranes;
        self.freed += other.freed;
        self.handed_back.extend(other.handed_back);
        self.orphaned += other.orphaned;
    }
}

struct LoopQueue {
    events: VecDeque<Event>,
    next_seq: u64,
    destroyed: bool,
}

struct LoopShared {
    id: Key,
    depth: u32,
    record: Handle,
    store: Arc<ObjectStore>,
    topology: Arc<Topology>,
    config: LoopConfig,
    queue: Mutex<LoopQueue>,
    ready: Condvar,
    running: AtomicBool,
    parent: Mutex<Weak<LoopShared>>,
    children: RwLock<Vec<EventLoop>>,
    sink: RwLock<Option<Weak<dyn EventSink>>>,
    handler: RwLock<Option<Arc<dyn StageHandler>>>,
    stats: Mutex<LoopStats>,
    last_fault: Mutex<Option<KernelError>>,
}

/// Handle to an event loop; clones share the same loop
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Create a detached loop at `depth` with default configuration
    pub fn create(
        store: Arc<ObjectStore>,
        topology: Arc<Topology>,
        identity: Key,
        depth: u32,
    ) -> KernelResult<Self> {
        Self::build(store, topology, Some(identity), depth, LoopConfig::default())
    }

    pub fn create_with_config(
        store: Arc<ObjectStore>,
        topology: Arc<Topology>,
        identity: Key,
        depth: u32,
        config: LoopConfig,
    ) -> KernelResult<Self> {
        Self::build(store, topology, Some(identity), depth, config)
    }

    /// Create a loop identified by the key of its own queue record
    pub fn create_anonymous(
        store: Arc<ObjectStore>,
        topology: Arc<Topology>,
        depth: u32,
        config: LoopConfig,
    ) -> KernelResult<Self> {
        Self::build(store, topology, None, depth, config)
    }

    fn build(
        store: Arc<ObjectStore>,
        topology: Arc<Topology>,
        identity: Option<Key>,
        depth: u32,
        config: LoopConfig,
    ) -> KernelResult<Self> {
        if !topology.admits_depth(depth) {
            return Err(KernelError::capacity(
                "loop depth",
                topology.max_depth() as usize,
            ));
        }
        if config.queue_capacity == 0 {
            return Err(KernelError::invalid("loop queue capacity must be non-zero"));
        }

        let record = store.allocate(LOOP_RECORD_SIZE, depth)?;
        let id = identity.unwrap_or(record.key);
        debug!(loop_id = %id, depth, "event loop created");

        Ok(EventLoop {
            shared: Arc::new(LoopShared {
                id,
                depth,
                record,
                store,
                topology,
                config,
                queue: Mutex::new(LoopQueue {
                    events: VecDeque::new(),
                    next_seq: 0,
                    destroyed: false,
                }),
                ready: Condvar::new(),
                running: AtomicBool::new(false),
                parent: Mutex::new(Weak::new()),
                children: RwLock::new(Vec::new()),
                sink: RwLock::new(None),
                handler: RwLock::new(None),
                stats: Mutex::new(LoopStats::default()),
                last_fault: Mutex::new(None),
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> Key {
        self.shared.id
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.shared.depth
    }

    /// Store entry backing the queue
    #[inline]
    pub fn record(&self) -> Handle {
        self.shared.record
    }

    pub fn config(&self) -> &LoopConfig {
        &self.shared.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.shared.topology
    }

    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn parent(&self) -> Option<EventLoop> {
        self.shared
            .parent
            .lock()
            .upgrade()
            .map(|shared| EventLoop { shared })
    }

    pub fn children(&self) -> Vec<EventLoop> {
        self.shared.children.read().clone()
    }

    pub fn child_count(&self) -> usize {
        self.shared.children.read().len()
    }

    /// This loop and every descendant, parents before children
    pub fn subtree(&self) -> Vec<EventLoop> {
        let mut loops = vec![self.clone()];
        let mut next = 0;
        while next < loops.len() {
            let children = loops[next].children();
            loops.extend(children);
            next += 1;
        }
        loops
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().events.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.queue.lock().destroyed
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats.lock().clone()
    }

    pub fn last_fault(&self) -> Option<KernelError> {
        self.shared.last_fault.lock().clone()
    }

    /// Pair this loop with the unit that receives its `Evolve` ticks and
    /// delivered payloads. The loop does not keep the unit alive.
    pub fn attach_sink(&self, sink: Weak<dyn EventSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    /// Install the handler for timer, I/O and interrupt events
    pub fn set_handler(&self, handler: Arc<dyn StageHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.shared.handler.write() = None;
    }

    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.shared.sink.read().as_ref().and_then(Weak::upgrade)
    }

    /// Attach `child` below this loop
    ///
    /// The child must sit strictly deeper, have no parent yet, and fit the
    /// topology's bound for its depth.
    pub fn add_child(&self, child: &EventLoop) -> KernelResult<()> {
        if self.ptr_eq(child) {
            return Err(KernelError::invalid("a loop cannot adopt itself"));
        }
        if self.is_destroyed() || child.is_destroyed() {
            return Err(KernelError::invalid("cannot link a destroyed loop"));
        }
        if child.depth() <= self.depth() {
            return Err(KernelError::invalid(format!(
                "child depth {} is not below parent depth {}",
                child.depth(),
                self.depth()
            )));
        }
        let topology = &self.shared.topology;
        if !topology.admits_depth(child.depth()) {
            return Err(KernelError::capacity(
                "loop depth",
                topology.max_depth() as usize,
            ));
        }

        let limit = topology.max_children(child.depth()) as usize;
        let mut children = self.shared.children.write();
        if children.len() >= limit {
            return Err(KernelError::capacity("loop children", limit));
        }
        {
            let mut parent = child.shared.parent.lock();
            if parent.upgrade().is_some() {
                return Err(KernelError::invalid(format!(
                    "loop {} already has a parent",
                    child.id()
                )));
            }
            *parent = Arc::downgrade(&self.shared);
        }
        children.push(child.clone());

        trace!(parent = %self.id(), child = %child.id(), "loop attached");
        Ok(())
    }

    /// Queue an event; returns its sequence number
    pub fn post(&self, kind: EventKind, source: Key, payload: EventPayload) -> KernelResult<u64> {
        self.post_event(Event::new(kind, source).with_payload(payload))
    }

    /// Queue a prepared event
    ///
    /// Object parcels must be addressed: a broadcast would copy them into
    /// every membrane below this loop.
    pub fn post_event(&self, mut event: Event) -> KernelResult<u64> {
        if event.target.is_none() && matches!(event.payload, EventPayload::Objects(_)) {
            return Err(KernelError::invalid("object parcels must be addressed"));
        }
        let mut queue = self.shared.queue.lock();
        if queue.destroyed {
            return Err(KernelError::invalid(format!(
                "loop {} is destroyed",
                self.id()
            )));
        }

        let capacity = self.shared.config.queue_capacity;
        if queue.events.len() >= capacity {
            self.shared.stats.lock().dropped += 1;
            warn!(loop_id = %self.id(), kind = event.kind.name(), "queue full, event dropped");
            return Err(KernelError::capacity("loop queue", capacity));
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        event.seq = seq;
        queue.events.push_back(event);
        self.shared.stats.lock().observe_depth(queue.events.len());
        drop(queue);

        self.shared.ready.notify_one();
        Ok(seq)
    }

    fn pop(&self) -> Option<Event> {
        let mut queue = self.shared.queue.lock();
        let event = queue.events.pop_front()?;
        self.shared.stats.lock().observe_depth(queue.events.len());
        Some(event)
    }

    /// Dispatch the oldest queued event without blocking
    ///
    /// Returns `Ok(None)` when the queue is empty. A failed dispatch still
    /// consumes its event.
    pub fn process_one(&self) -> KernelResult<Option<EventKind>> {
        match self.pop() {
            Some(event) => self.handle(event).map(Some),
            None => Ok(None),
        }
    }

    /// Process every queued event without blocking; returns how many
    pub fn drain(&self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.pop() {
            // Faults land in stats and last_fault
            let _ = self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Drain this loop and its descendants until none has work left
    pub fn drain_tree(&self) -> usize {
        let mut total = 0;
        loop {
            let pass: usize = self.subtree().iter().map(EventLoop::drain).sum();
            if pass == 0 {
                return total;
            }
            total += pass;
        }
    }

    fn handle(&self, event: Event) -> KernelResult<EventKind> {
        let kind = event.kind;
        let seq = event.seq;
        let deadline = Deadline::after(self.shared.config.process_budget);

        let result = self.dispatch(event).and_then(|()| {
            if deadline.expired() {
                Err(KernelError::Timeout {
                    operation: "process",
                    budget: deadline.budget(),
                })
            } else {
                Ok(())
            }
        });

        {
            let mut stats = self.shared.stats.lock();
            stats.record(kind, deadline.elapsed());
            match &result {
                Ok(()) => {}
                Err(KernelError::Timeout { .. }) => stats.timeouts += 1,
                Err(_) => stats.failed += 1,
            }
        }

        if let Err(err) = &result {
            warn!(loop_id = %self.id(), kind = kind.name(), seq, error = %err, "dispatch failed");
            *self.shared.last_fault.lock() = Some(err.clone());
        }
        result.map(|()| kind)
    }

    fn dispatch(&self, event: Event) -> KernelResult<()> {
        trace!(loop_id = %self.id(), kind = event.kind.name(), seq = event.seq, "dispatch");

        match event.kind {
            EventKind::Evolve => match self.sink() {
                Some(sink) => sink.evolve_at(event.timestamp),
                None => Ok(()),
            },
            EventKind::Propagate => self.propagate(event),
            EventKind::TimerExpire | EventKind::IoReady | EventKind::Interrupt => {
                let handler = self.shared.handler.read().clone();
                let Some(handler) = handler else {
                    self.shared.stats.lock().unhandled += 1;
                    return Ok(());
                };
                match event.kind {
                    EventKind::TimerExpire => handler.on_timer(self.id(), &event),
                    EventKind::IoReady => handler.on_io_ready(self.id(), &event),
                    _ => handler.on_interrupt(self.id(), &event),
                }
            }
        }
    }

    fn propagate(&self, event: Event) -> KernelResult<()> {
        if let Some(target) = event.target {
            if target != self.id() {
                return Err(KernelError::invalid(format!(
                    "event for {} reached loop {}",
                    target,
                    self.id()
                )));
            }
            return self.deliver(&event);
        }

        // Broadcast: deliver here, then one copy per child in child order.
        // A failing child does not stop delivery to its siblings.
        let mut first_err = self.deliver(&event).err();
        let mut copies = 0;
        for child in self.children() {
            match child.post_event(event.clone()) {
                Ok(_) => copies += 1,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        self.shared.stats.lock().propagated += copies;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn deliver(&self, event: &Event) -> KernelResult<()> {
        if event.payload.is_none() {
            return Ok(());
        }
        match self.sink() {
            Some(sink) => sink.deliver(event),
            None => Ok(()),
        }
    }

    /// Run on the calling thread until [`stop`](Self::stop) or destroy,
    /// blocking while the queue is empty
    pub fn run(&self) -> KernelResult<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(KernelError::invalid(format!(
                "loop {} is already running",
                self.id()
            )));
        }
        self.drive();
        Ok(())
    }

    fn drive(&self) {
        debug!(loop_id = %self.id(), "loop running");
        while let Some(event) = self.wait_next() {
            let _ = self.handle(event);
        }
        self.shared.running.store(false, Ordering::Release);
        debug!(loop_id = %self.id(), "loop stopped");
    }

    fn wait_next(&self) -> Option<Event> {
        let mut queue = self.shared.queue.lock();
        loop {
            if queue.destroyed || !self.shared.running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(event) = queue.events.pop_front() {
                self.shared.stats.lock().observe_depth(queue.events.len());
                return Some(event);
            }
            self.shared.ready.wait(&mut queue);
        }
    }

    /// Ask a running loop to return once its current dispatch finishes
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _queue = self.shared.queue.lock();
        self.shared.ready.notify_all();
    }

    /// Run this loop on a dedicated OS thread
    pub fn spawn(&self) -> KernelResult<LoopThread> {
        if self.is_destroyed() {
            return Err(KernelError::invalid(format!(
                "loop {} is destroyed",
                self.id()
            )));
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(KernelError::invalid(format!(
                "loop {} is already running",
                self.id()
            )));
        }

        let this = self.clone();
        let handle = thread::Builder::new()
            .name(format!("arbor-loop-{}", self.id()))
            .spawn(move || this.drive())
            .map_err(|err| {
                self.shared.running.store(false, Ordering::Release);
                warn!(loop_id = %self.id(), error = %err, "failed to spawn loop thread");
                KernelError::capacity("loop threads", 0)
            })?;

        Ok(LoopThread {
            looper: self.clone(),
            handle,
        })
    }

    /// Spawn this loop and every descendant
    pub fn spawn_tree(&self) -> KernelResult<Vec<LoopThread>> {
        let mut threads = Vec::new();
        for looper in self.subtree() {
            match looper.spawn() {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(err);
                }
            }
        }
        Ok(threads)
    }

    /// Grow the subtree below this loop to full fan-out
    ///
    /// Creates `max_children(depth)` loops at `depth`, then recurses one
    /// level deeper under each, stopping past the topology's last depth (and
    /// never beyond depth 8). Returns the number of loops created.
    pub fn spawn_children(&self, depth: u32) -> KernelResult<usize> {
        let topology = &self.shared.topology;
        if depth > CANONICAL_MAX_DEPTH || !topology.admits_depth(depth) {
            return Ok(0);
        }

        let mut created = 0;
        for _ in 0..topology.max_children(depth) {
            let child = EventLoop::create_anonymous(
                self.shared.store.clone(),
                topology.clone(),
                depth,
                self.shared.config.clone(),
            )?;
            if let Err(err) = self.add_child(&child) {
                let _ = child.destroy();
                return Err(err);
            }
            created += 1 + child.spawn_children(depth + 1)?;
        }
        Ok(created)
    }

    /// Tear down this loop
    ///
    /// Queued events are dropped, except that those carrying a borrowed
    /// payload are handed back in the report. The loop leaves its parent and
    /// releases its queue record. Children are not destroyed: trees are torn
    /// down bottom-up, and any child still attached is orphaned.
    pub fn destroy(&self) -> KernelResult<TeardownReport> {
        let mut report = TeardownReport {
            loops: 1,
            ..Default::default()
        };

        {
            let mut queue = self.shared.queue.lock();
            if queue.destroyed {
                return Err(KernelError::invalid(format!(
                    "loop {} is already destroyed",
                    self.id()
                )));
            }
            queue.destroyed = true;
            for event in queue.events.drain(..) {
                if event.payload.is_borrowed() {
                    report.handed_back.push(event);
                } else {
                    report.freed += 1;
                }
            }
            self.shared.stats.lock().observe_depth(0);
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.ready.notify_all();

        if let Some(parent) = self.parent() {
            parent.shared.children.write().retain(|c| !c.ptr_eq(self));
        }
        *self.shared.parent.lock() = Weak::new();

        let orphans = std::mem::take(&mut *self.shared.children.write());
        for orphan in &orphans {
            *orphan.shared.parent.lock() = Weak::new();
        }
        if !orphans.is_empty() {
            warn!(loop_id = %self.id(), orphaned = orphans.len(), "destroyed loop with attached children");
        }
        report.orphaned = orphans.len();

        *self.shared.sink.write() = None;
        *self.shared.handler.write() = None;

        if let Err(err) = self.shared.store.release(self.shared.record) {
            warn!(loop_id = %self.id(), error = %err, "queue record already gone");
        }

        debug!(
            loop_id = %self.id(),
            freed = report.freed,
            handed_back = report.handed_back.len(),
            "event loop destroyed"
        );
        Ok(report)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id())
            .field("depth", &self.depth())
            .field("children", &self.child_count())
            .field("queued", &self.queue_len())
            .finish()
    }
}

/// A loop running on its own thread
#[derive(Debug)]
pub struct LoopThread {
    looper: EventLoop,
    handle: JoinHandle<()>,
}

impl LoopThread {
    pub fn event_loop(&self) -> &EventLoop {
        &self.looper
    }

    /// Stop the loop and wait for its thread to exit
    pub fn join(self) -> KernelResult<()> {
        self.looper.stop();
        self.handle.join().map_err(|_| {
            KernelError::invalid(format!("loop {} thread panicked", self.looper.id()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use arbor_core::{Multiset, ObjectType, Opaque, Timestamp};
    use bytes::Bytes;
    use proptest::prelude::*;

    struct Recorder {
        key: Key,
        delivered: Mutex<Vec<Event>>,
        evolves: AtomicUsize,
    }

    impl Recorder {
        fn attach(looper: &EventLoop) -> Arc<Recorder> {
            let recorder = Arc::new(Recorder {
                key: looper.id(),
                delivered: Mutex::new(Vec::new()),
                evolves: AtomicUsize::new(0),
            });
            let sink: Weak<dyn EventSink> = Arc::downgrade(&recorder) as Weak<dyn EventSink>;
            looper.attach_sink(sink);
            recorder
        }

        fn delivered(&self) -> Vec<Event> {
            self.delivered.lock().clone()
        }
    }

    impl EventSink for Recorder {
        fn sink_key(&self) -> Key {
            self.key
        }

        fn evolve_at(&self, _timestamp: Timestamp) -> KernelResult<()> {
            self.evolves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn deliver(&self, event: &Event) -> KernelResult<()> {
            self.delivered.lock().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        timers: AtomicUsize,
        interrupts: AtomicUsize,
    }

    impl StageHandler for CountingHandler {
        fn on_timer(&self, _loop_id: Key, _event: &Event) -> KernelResult<()> {
            self.timers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_interrupt(&self, _loop_id: Key, _event: &Event) -> KernelResult<()> {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            Err(KernelError::Unimplemented("interrupt routing"))
        }
    }

    fn env(table: &[u32]) -> (Arc<ObjectStore>, Arc<Topology>) {
        (
            Arc::new(ObjectStore::new()),
            Arc::new(Topology::from_table(table)),
        )
    }

    fn root(store: &Arc<ObjectStore>, topology: &Arc<Topology>) -> EventLoop {
        EventLoop::create(store.clone(), topology.clone(), Key(1), 0).unwrap()
    }

    fn child(store: &Arc<ObjectStore>, topology: &Arc<Topology>, depth: u32) -> EventLoop {
        EventLoop::create_anonymous(store.clone(), topology.clone(), depth, LoopConfig::default())
            .unwrap()
    }

    #[test]
    fn test_create_allocates_record() {
        let (store, topology) = env(&[0, 1, 1, 2]);
        let looper = root(&store, &topology);

        assert_eq!(looper.id(), Key(1));
        assert!(store.is_live(looper.record()));
        assert_eq!(store.depth_of(looper.record()).unwrap(), 0);
        assert_eq!(looper.queue_len(), 0);
        assert!(looper.parent().is_none());
    }

    #[test]
    fn test_create_beyond_max_depth() {
        let (store, topology) = env(&[0, 1]);
        let err = EventLoop::create(store, topology, Key(9), 2).unwrap_err();
        assert!(matches!(err, KernelError::OutOfCapacity { .. }));
    }

    #[test]
    fn test_add_child_bounded_by_topology() {
        let (store, topology) = env(&[0, 1, 1, 2]);
        let root = root(&store, &topology);

        let first = child(&store, &topology, 1);
        root.add_child(&first).unwrap();
        let second = child(&store, &topology, 1);
        let err = root.add_child(&second).unwrap_err();
        assert_eq!(err, KernelError::capacity("loop children", 1));

        let mid = child(&store, &topology, 2);
        first.add_child(&mid).unwrap();
        for _ in 0..2 {
            mid.add_child(&child(&store, &topology, 3)).unwrap();
        }
        assert!(mid.add_child(&child(&store, &topology, 3)).is_err());
        assert_eq!(root.subtree().len(), 5);
        assert!(mid.parent().unwrap().ptr_eq(&first));
    }

    #[test]
    fn test_add_child_rejects_bad_edges() {
        let (store, topology) = env(&[0, 2, 2]);
        let root = root(&store, &topology);
        let peer = child(&store, &topology, 0);
        let leaf = child(&store, &topology, 1);

        assert!(root.add_child(&root).is_err());
        assert!(root.add_child(&peer).is_err());

        root.add_child(&leaf).unwrap();
        let other = child(&store, &topology, 0);
        assert!(other.add_child(&leaf).is_err());
    }

    #[test]
    fn test_fifo_dispatch() {
        let (store, topology) = env(&[0, 1]);
        let looper = root(&store, &topology);
        let recorder = Recorder::attach(&looper);

        for i in 0..5u8 {
            let seq = looper
                .post_event(
                    Event::new(EventKind::Propagate, Key(7))
                        .addressed_to(looper.id())
                        .with_bytes(vec![i]),
                )
                .unwrap();
            assert_eq!(seq, i as u64);
        }
        assert_eq!(looper.drain(), 5);

        let order: Vec<u8> = recorder
            .delivered()
            .iter()
            .map(|e| match &e.payload {
                EventPayload::Owned(b) => b[0],
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(looper.stats().processed, 5);
        assert_eq!(looper.process_one().unwrap(), None);
    }

    #[test]
    fn test_propagate_copies_to_each_child() {
        let (store, topology) = env(&[0, 3, 1]);
        let root = root(&store, &topology);
        let root_rec = Recorder::attach(&root);
        let mut recorders = Vec::new();
        for _ in 0..3 {
            let c = child(&store, &topology, 1);
            root.add_child(&c).unwrap();
            recorders.push(Recorder::attach(&c));
        }

        root.post(
            EventKind::Propagate,
            root.id(),
            EventPayload::Owned(Bytes::from_static(b"hello")),
        )
        .unwrap();
        assert_eq!(root.drain_tree(), 4);

        assert_eq!(root_rec.delivered().len(), 1);
        for rec in &recorders {
            assert_eq!(rec.delivered().len(), 1);
        }
        assert_eq!(root.stats().propagated, 3);
    }

    #[test]
    fn test_propagated_copies_keep_child_order() {
        let (store, topology) = env(&[0, 1]);
        let root = root(&store, &topology);
        let c = child(&store, &topology, 1);
        root.add_child(&c).unwrap();
        let rec = Recorder::attach(&c);

        let direct = |tag: &'static [u8]| {
            c.post_event(
                Event::new(EventKind::Propagate, Key(7))
                    .addressed_to(c.id())
                    .with_bytes(tag),
            )
            .unwrap();
        };
        let broadcast = |tag: &'static [u8]| {
            root.post(EventKind::Propagate, root.id(), EventPayload::Owned(Bytes::from_static(tag)))
                .unwrap();
            root.process_one().unwrap();
        };

        direct(b"d0");
        broadcast(b"b0");
        direct(b"d1");
        broadcast(b"b1");
        direct(b"d2");
        root.drain_tree();

        let delivered = rec.delivered();
        let tags: Vec<&[u8]> = delivered
            .iter()
            .map(|e| match &e.payload {
                EventPayload::Owned(b) => &b[..],
                _ => unreachable!(),
            })
            .collect();
        let expected: Vec<&[u8]> = vec![b"d0", b"b0", b"d1", b"b1", b"d2"];
        assert_eq!(tags, expected);
        let seqs: Vec<u64> = delivered.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_broadcast_object_parcel_refused() {
        let (store, topology) = env(&[0, 2]);
        let root = root(&store, &topology);
        let parcel = Multiset::from_pairs([(ObjectType(1), 3)]);

        let err = root
            .post(EventKind::Propagate, root.id(), EventPayload::Objects(parcel.clone()))
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidArgument(_)));
        assert_eq!(root.queue_len(), 0);

        root.post_event(
            Event::new(EventKind::Propagate, Key(5))
                .addressed_to(root.id())
                .with_payload(EventPayload::Objects(parcel)),
        )
        .unwrap();
        assert_eq!(root.queue_len(), 1);
    }

    #[test]
    fn test_addressed_propagate_does_not_fan_out() {
        let (store, topology) = env(&[0, 2]);
        let root = root(&store, &topology);
        let c = child(&store, &topology, 1);
        root.add_child(&c).unwrap();
        let rec = Recorder::attach(&c);

        root.post_event(
            Event::new(EventKind::Propagate, Key(3))
                .addressed_to(root.id())
                .with_bytes(&b"x"[..]),
        )
        .unwrap();
        root.drain();
        assert_eq!(c.queue_len(), 0);
        assert!(rec.delivered().is_empty());

        // Addressed elsewhere is a routing fault
        root.post_event(Event::new(EventKind::Propagate, Key(3)).addressed_to(Key(99)))
            .unwrap();
        assert!(root.process_one().is_err());
        assert_eq!(root.stats().failed, 1);
        assert!(root.last_fault().is_some());
    }

    #[test]
    fn test_evolve_reaches_sink() {
        let (store, topology) = env(&[0, 1]);
        let looper = root(&store, &topology);
        let rec = Recorder::attach(&looper);

        looper.post(EventKind::Evolve, looper.id(), EventPayload::None).unwrap();
        looper.post(EventKind::Evolve, looper.id(), EventPayload::None).unwrap();
        looper.drain();
        assert_eq!(rec.evolves.load(Ordering::SeqCst), 2);
        assert_eq!(looper.stats().kind(EventKind::Evolve).count, 2);

        // Sink dropped: ticks become no-ops
        drop(rec);
        looper.post(EventKind::Evolve, looper.id(), EventPayload::None).unwrap();
        assert_eq!(looper.process_one().unwrap(), Some(EventKind::Evolve));
    }

    #[test]
    fn test_external_events_use_handler() {
        let (store, topology) = env(&[0, 1]);
        let looper = root(&store, &topology);

        looper.post(EventKind::TimerExpire, Key(1), EventPayload::None).unwrap();
        looper.drain();
        assert_eq!(looper.stats().unhandled, 1);

        let handler = Arc::new(CountingHandler::default());
        looper.set_handler(handler.clone());
        looper.post(EventKind::TimerExpire, Key(1), EventPayload::None).unwrap();
        looper.post(EventKind::IoReady, Key(1), EventPayload::None).unwrap();
        looper.post(EventKind::Interrupt, Key(1), EventPayload::None).unwrap();
        looper.drain();

        assert_eq!(handler.timers.load(Ordering::SeqCst), 1);
        assert_eq!(handler.interrupts.load(Ordering::SeqCst), 1);
        let stats = looper.stats();
        assert_eq!(stats.unhandled, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            looper.last_fault(),
            Some(KernelError::Unimplemented("interrupt routing"))
        );
    }

    #[test]
    fn test_queue_full_drops() {
        let (store, topology) = env(&[0, 1]);
        let looper = EventLoop::create_with_config(
            store,
            topology,
            Key(1),
            0,
            LoopConfig {
                queue_capacity: 2,
                ..Default::default()
            },
        )
        .unwrap();

        looper.post(EventKind::Evolve, Key(1), EventPayload::None).unwrap();
        looper.post(EventKind::Evolve, Key(1), EventPayload::None).unwrap();
        let err = looper
            .post(EventKind::Evolve, Key(1), EventPayload::None)
            .unwrap_err();
        assert_eq!(err, KernelError::capacity("loop queue", 2));

        let stats = looper.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.max_queue_depth, 2);
    }

    #[test]
    fn test_zero_budget_times_out() {
        let (store, topology) = env(&[0, 1]);
        let looper = EventLoop::create_with_config(
            store,
            topology,
            Key(1),
            0,
            LoopConfig {
                process_budget: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();

        looper.post(EventKind::Evolve, Key(1), EventPayload::None).unwrap();
        let err = looper.process_one().unwrap_err();
        assert!(matches!(err, KernelError::Timeout { operation: "process", .. }));
        assert_eq!(looper.stats().timeouts, 1);
        assert_eq!(looper.queue_len(), 0);
    }

    #[test]
    fn test_destroy_hands_back_borrowed() {
        let (store, topology) = env(&[0, 2]);
        let root = root(&store, &topology);
        let c = child(&store, &topology, 1);
        root.add_child(&c).unwrap();
        let before = store.entry_count();

        let shared = Opaque::new(42u32);
        c.post(EventKind::IoReady, Key(1), EventPayload::Borrowed(shared.clone()))
            .unwrap();
        c.post(EventKind::Propagate, Key(1), EventPayload::Owned(Bytes::from_static(b"x")))
            .unwrap();

        let report = c.destroy().unwrap();
        assert_eq!(report.freed, 1);
        assert_eq!(report.handed_back.len(), 1);
        match &report.handed_back[0].payload {
            EventPayload::Borrowed(opaque) => assert!(opaque.ptr_eq(&shared)),
            _ => panic!("expected borrowed payload"),
        }

        assert_eq!(root.child_count(), 0);
        assert_eq!(store.entry_count(), before - 1);
        assert!(c.post(EventKind::Evolve, Key(1), EventPayload::None).is_err());
        assert!(c.destroy().is_err());
    }

    #[test]
    fn test_destroy_orphans_attached_children() {
        let (store, topology) = env(&[0, 2]);
        let root = root(&store, &topology);
        let c = child(&store, &topology, 1);
        root.add_child(&c).unwrap();

        let report = root.destroy().unwrap();
        assert_eq!(report.orphaned, 1);
        assert!(c.parent().is_none());
        assert!(!c.is_destroyed());
    }

    #[test]
    fn test_spawn_children_fills_topology() {
        let (store, topology) = env(&[0, 1, 1, 2]);
        let root = root(&store, &topology);

        let created = root.spawn_children(1).unwrap();
        assert_eq!(created, 4);
        assert_eq!(root.subtree().len(), 5);
        assert_eq!(topology.full_tree_size(), 5);

        let depths: Vec<u32> = root.subtree().iter().map(EventLoop::depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 3, 3]);
    }

    #[test]
    fn test_thread_blocks_until_posted() {
        let (store, topology) = env(&[0, 2]);
        let looper = root(&store, &topology);
        let rec = Recorder::attach(&looper);

        let worker = looper.spawn().unwrap();
        assert!(looper.is_running());
        assert!(looper.spawn().is_err());

        for _ in 0..10 {
            looper.post(EventKind::Evolve, Key(1), EventPayload::None).unwrap();
        }

        let started = Instant::now();
        while rec.evolves.load(Ordering::SeqCst) < 10 {
            assert!(started.elapsed() < Duration::from_secs(5), "loop thread stalled");
            thread::sleep(Duration::from_millis(1));
        }

        worker.join().unwrap();
        assert!(!looper.is_running());
    }

    #[test]
    fn test_spawn_tree_and_propagate() {
        let (store, topology) = env(&[0, 2]);
        let root = root(&store, &topology);
        root.spawn_children(1).unwrap();
        let recorders: Vec<_> = root.children().iter().map(Recorder::attach).collect();

        let workers = root.spawn_tree().unwrap();
        assert_eq!(workers.len(), 3);

        root.post(EventKind::Propagate, root.id(), EventPayload::Owned(Bytes::from_static(b"p")))
            .unwrap();

        let started = Instant::now();
        while recorders.iter().any(|r| r.delivered().is_empty()) {
            assert!(started.elapsed() < Duration::from_secs(5), "propagation stalled");
            thread::sleep(Duration::from_millis(1));
        }

        for worker in workers {
            worker.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_dispatch_preserves_post_order(payloads in prop::collection::vec(any::<u8>(), 1..64)) {
            let (store, topology) = env(&[0, 1]);
            let looper = root(&store, &topology);
            let rec = Recorder::attach(&looper);

            for p in &payloads {
                looper
                    .post_event(
                        Event::new(EventKind::Propagate, Key(2))
                            .addressed_to(looper.id())
                            .with_bytes(vec![*p]),
                    )
                    .unwrap();
            }
            looper.drain();

            let delivered = rec.delivered();
            let seen: Vec<u8> = delivered
                .iter()
                .filter_map(|e| match &e.payload {
                    EventPayload::Owned(b) => Some(b[0]),
                    _ => None,
                })
                .collect();
            prop_assert_eq!(seen, payloads);
            prop_assert!(delivered.windows(2).all(|w| w[0].seq < w[1].seq));
        }
    }
}

//! Membranes - rule-driven compartments paired with event loops
//!
//! A membrane holds a multiset of objects and an ordered rule list. Each
//! `Evolve` tick runs one step: rules are visited highest priority first,
//! each fires at most once if the stock still covers its left-hand side,
//! and products become visible when the step ends. A rule either fires
//! completely or not at all.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use arbor_core::{
    Deadline, Event, EventKind, EventPayload, Handle, Key, KernelError, KernelResult, Multiset,
    ObjectType, Timestamp, Topology, CANONICAL_MAX_DEPTH,
};
use arbor_store::{ObjectStore, RelationKind};

use crate::{EventLoop, EventSink, LoopConfig, LoopThread, Rule, StructuralAction, TeardownReport};

/// Membrane configuration
#[derive(Clone, Debug)]
pub struct MembraneConfig {
    /// Configuration of the paired loop
    pub loop_config: LoopConfig,
    /// Longest one evolution step may run
    pub evolve_budget: Duration,
    /// Bytes reserved in the store for a membrane's identity entry
    pub record_size: usize,
}

impl Default for MembraneConfig {
    fn default() -> Self {
        MembraneConfig {
            loop_config: LoopConfig::default(),
            evolve_budget: Duration::from_millis(1),
            record_size: 64,
        }
    }
}

/// Shared environment membranes are built in
#[derive(Debug)]
pub struct Substrate {
    pub store: Arc<ObjectStore>,
    pub topology: Arc<Topology>,
    pub config: MembraneConfig,
    /// Threads of every spawned loop, including membranes created while running
    threads: Mutex<Vec<LoopThread>>,
}

impl Substrate {
    pub fn new(store: Arc<ObjectStore>, topology: Arc<Topology>, config: MembraneConfig) -> Arc<Self> {
        Arc::new(Substrate {
            store,
            topology,
            config,
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn register_thread(&self, thread: LoopThread) {
        self.threads.lock().push(thread);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Stop and join every registered loop thread; returns how many
    ///
    /// Threads registered while joining are picked up too.
    pub fn join_threads(&self) -> usize {
        let mut joined = 0;
        loop {
            let batch = std::mem::take(&mut *self.threads.lock());
            if batch.is_empty() {
                return joined;
            }
            for thread in batch {
                let id = thread.event_loop().id();
                if let Err(err) = thread.join() {
                    warn!(loop_id = %id, error = %err, "loop thread did not exit cleanly");
                }
                joined += 1;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MembraneState {
    Active,
    /// Skipped by evolve until woken
    Dormant,
    /// Terminal: no further evolution or object mutation
    Dissolved,
}

/// Byte message delivered into a membrane's inbox
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub source: Key,
    pub data: Bytes,
}

/// Report of one evolution step
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvolveOutcome {
    /// Rules that fired
    pub fired: usize,
    /// Rules whose left-hand side or structural precondition was not met
    pub skipped: usize,
    /// Objects added to the local stock at the end of the step
    pub products: Multiset,
    /// Parcels handed to the parent or a child
    pub sent: usize,
    pub divided: bool,
    pub state: Option<MembraneState>,
    /// Rules that met their preconditions but could not be applied
    pub failures: Vec<KernelError>,
}

impl EvolveOutcome {
    fn idle(state: MembraneState) -> Self {
        EvolveOutcome {
            state: Some(state),
            ..Default::default()
        }
    }
}

struct MembraneCore {
    stock: Multiset,
    rules: Vec<Rule>,
    state: MembraneState,
    inbox: VecDeque<Message>,
}

struct MembraneNode {
    this: Weak<MembraneNode>,
    key: Key,
    record: Handle,
    depth: u32,
    substrate: Arc<Substrate>,
    looper: EventLoop,
    parent: Mutex<Weak<MembraneNode>>,
    children: Mutex<Vec<Membrane>>,
    core: Mutex<MembraneCore>,
    destroyed: AtomicBool,
    faults: AtomicU64,
    last_fault: Mutex<Option<KernelError>>,
}

/// Handle to a membrane; clones share the same membrane
#[derive(Clone)]
pub struct Membrane {
    node: Arc<MembraneNode>,
}

enum Parcel {
    ToParent(Membrane, Multiset),
    ToChild(Membrane, Multiset),
}

impl Membrane {
    /// Build a membrane around an existing store entry
    ///
    /// The membrane takes ownership of `identity` and releases it on
    /// destroy. Only depth 0 may go without a parent. With a parent, `depth`
    /// must lie below the parent's and the parent must have room at that
    /// depth. If the parent's loop runs on a thread, so does the new one.
    pub fn create(
        substrate: &Arc<Substrate>,
        parent: Option<&Membrane>,
        identity: Handle,
        depth: u32,
    ) -> KernelResult<Membrane> {
        let store = &substrate.store;
        let topology = &substrate.topology;

        if !store.is_live(identity) {
            return Err(KernelError::invalid(format!(
                "identity {} is not a live store entry",
                identity
            )));
        }
        if !topology.admits_depth(depth) {
            return Err(KernelError::capacity(
                "membrane depth",
                topology.max_depth() as usize,
            ));
        }
        match parent {
            Some(parent) => parent.check_can_adopt(depth)?,
            None if depth > 0 => {
                return Err(KernelError::invalid(format!(
                    "membrane at depth {} needs a parent",
                    depth
                )))
            }
            None => {}
        }

        let looper = EventLoop::create_with_config(
            store.clone(),
            topology.clone(),
            identity.key,
            depth,
            substrate.config.loop_config.clone(),
        )?;

        let node = Arc::new_cyclic(|this| MembraneNode {
            this: this.clone(),
            key: identity.key,
            record: identity,
            depth,
            substrate: substrate.clone(),
            looper: looper.clone(),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            core: Mutex::new(MembraneCore {
                stock: Multiset::new(),
                rules: Vec::new(),
                state: MembraneState::Active,
                inbox: VecDeque::new(),
            }),
            destroyed: AtomicBool::new(false),
            faults: AtomicU64::new(0),
            last_fault: Mutex::new(None),
        });
        let sink: Weak<dyn EventSink> = Arc::downgrade(&node) as Weak<dyn EventSink>;
        looper.attach_sink(sink);
        let membrane = Membrane { node };

        if let Some(parent) = parent {
            if let Err(err) = parent.adopt(&membrane) {
                let _ = looper.destroy();
                return Err(err);
            }
            if parent.event_loop().is_running() {
                match looper.spawn() {
                    Ok(thread) => substrate.register_thread(thread),
                    Err(err) => {
                        warn!(membrane = %membrane.key(), error = %err, "loop left undriven")
                    }
                }
            }
        }

        debug!(membrane = %membrane.key(), depth, "membrane created");
        Ok(membrane)
    }

    /// Allocate a fresh identity entry and build a membrane around it
    pub fn create_fresh(
        substrate: &Arc<Substrate>,
        parent: Option<&Membrane>,
        depth: u32,
    ) -> KernelResult<Membrane> {
        let identity = substrate
            .store
            .allocate(substrate.config.record_size, depth)?;
        Membrane::create(substrate, parent, identity, depth).map_err(|err| {
            let _ = substrate.store.release(identity);
            err
        })
    }

    /// Root membrane at depth 0
    pub fn create_root(substrate: &Arc<Substrate>) -> KernelResult<Membrane> {
        Membrane::create_fresh(substrate, None, 0)
    }

    fn check_can_adopt(&self, depth: u32) -> KernelResult<()> {
        if self.is_destroyed() {
            return Err(KernelError::invalid(format!(
                "membrane {} is destroyed",
                self.key()
            )));
        }
        if self.state() == MembraneState::Dissolved {
            return Err(KernelError::Dissolved(self.key()));
        }
        if depth <= self.depth() {
            return Err(KernelError::invalid(format!(
                "child depth {} is not below parent depth {}",
                depth,
                self.depth()
            )));
        }
        let topology = &self.node.substrate.topology;
        if !topology.admits_depth(depth) {
            return Err(KernelError::capacity(
                "membrane depth",
                topology.max_depth() as usize,
            ));
        }
        let limit = topology.max_children(depth) as usize;
        if self.node.children.lock().len() >= limit {
            return Err(KernelError::capacity("membrane children", limit));
        }
        Ok(())
    }

    fn adopt(&self, child: &Membrane) -> KernelResult<()> {
        let limit = self.node.substrate.topology.max_children(child.depth()) as usize;
        let mut children = self.node.children.lock();
        if children.len() >= limit {
            return Err(KernelError::capacity("membrane children", limit));
        }
        self.node.looper.add_child(&child.node.looper)?;
        children.push(child.clone());
        *child.node.parent.lock() = Arc::downgrade(&self.node);

        if let Err(err) = self.node.substrate.store.link(
            self.node.record,
            child.node.record,
            child.depth() as u64,
            1,
            RelationKind::Compose,
        ) {
            warn!(parent = %self.key(), child = %child.key(), error = %err, "compose link not recorded");
        }
        Ok(())
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.node.key
    }

    /// Store entry that identifies this membrane
    #[inline]
    pub fn record(&self) -> Handle {
        self.node.record
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.node.depth
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.node.looper
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.node.substrate
    }

    pub fn ptr_eq(&self, other: &Membrane) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn state(&self) -> MembraneState {
        self.node.core.lock().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.node.destroyed.load(Ordering::Acquire)
    }

    pub fn parent(&self) -> Option<Membrane> {
        self.node
            .parent
            .lock()
            .upgrade()
            .map(|node| Membrane { node })
    }

    pub fn children(&self) -> Vec<Membrane> {
        self.node.children.lock().clone()
    }

    /// This membrane and every descendant, parents before children
    pub fn subtree(&self) -> Vec<Membrane> {
        let mut membranes = vec![self.clone()];
        let mut next = 0;
        while next < membranes.len() {
            let children = membranes[next].children();
            membranes.extend(children);
            next += 1;
        }
        membranes
    }

    pub fn stock(&self) -> Multiset {
        self.node.core.lock().stock.clone()
    }

    pub fn count(&self, object: ObjectType) -> u64 {
        self.node.core.lock().stock.count(object)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.node.core.lock().rules.clone()
    }

    pub fn fault_count(&self) -> u64 {
        self.node.faults.load(Ordering::Relaxed)
    }

    pub fn last_fault(&self) -> Option<KernelError> {
        self.node.last_fault.lock().clone()
    }

    fn record_fault(&self, err: &KernelError) {
        self.node.record_fault(err);
    }

    pub fn add_object(&self, object: ObjectType, count: u64) -> KernelResult<()> {
        if count == 0 {
            return Err(KernelError::invalid("object count must be non-zero"));
        }
        let mut core = self.node.core.lock();
        if core.state == MembraneState::Dissolved {
            return Err(KernelError::Dissolved(self.key()));
        }
        core.stock.add(object, count);
        Ok(())
    }

    /// Remove `count` of `object`; the stock is unchanged on error
    pub fn remove_object(&self, object: ObjectType, count: u64) -> KernelResult<()> {
        if count == 0 {
            return Err(KernelError::invalid("object count must be non-zero"));
        }
        let mut core = self.node.core.lock();
        if core.state == MembraneState::Dissolved {
            return Err(KernelError::Dissolved(self.key()));
        }
        core.stock.remove(object, count)
    }

    /// Insert a rule after every rule of equal or higher priority
    pub fn add_rule(&self, rule: Rule) -> KernelResult<()> {
        rule.validate()?;
        let mut core = self.node.core.lock();
        if core.state == MembraneState::Dissolved {
            return Err(KernelError::Dissolved(self.key()));
        }
        let at = core.rules.partition_point(|r| r.priority >= rule.priority);
        core.rules.insert(at, rule);
        Ok(())
    }

    pub fn set_dormant(&self) -> KernelResult<()> {
        self.transition(MembraneState::Active, MembraneState::Dormant)
    }

    pub fn wake(&self) -> KernelResult<()> {
        self.transition(MembraneState::Dormant, MembraneState::Active)
    }

    fn transition(&self, from: MembraneState, to: MembraneState) -> KernelResult<()> {
        let mut core = self.node.core.lock();
        match core.state {
            MembraneState::Dissolved => Err(KernelError::Dissolved(self.key())),
            state if state == from => {
                core.state = to;
                trace!(membrane = %self.key(), ?from, ?to, "state change");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Queue an `Evolve` tick on the paired loop
    pub fn tick(&self) -> KernelResult<u64> {
        self.node
            .looper
            .post(EventKind::Evolve, self.key(), EventPayload::None)
    }

    /// Run one evolution step now
    ///
    /// Non-active membranes are skipped. If the budget runs out, rules
    /// already fired stay committed and a `Timeout` is returned.
    pub fn evolve(&self, timestamp: Timestamp) -> KernelResult<EvolveOutcome> {
        let budget = self.node.substrate.config.evolve_budget;
        let deadline = Deadline::after(budget);

        let mut outcome = EvolveOutcome::default();
        let mut parcels = Vec::new();
        let mut daughters: Option<(Multiset, Multiset, Vec<Rule>)> = None;
        let mut timed_out = false;

        // Parent state is read before our own core is locked
        let outlet = self
            .parent()
            .filter(|p| !p.is_destroyed() && p.state() != MembraneState::Dissolved);

        {
            let mut core = self.node.core.lock();
            if core.state != MembraneState::Active {
                return Ok(EvolveOutcome::idle(core.state));
            }

            let rules = core.rules.clone();
            let mut produced = Multiset::new();
            let mut dissolve = false;
            let mut divide = false;

            for rule in &rules {
                if deadline.expired() {
                    timed_out = true;
                    break;
                }
                if !core.stock.covers(&rule.lhs) {
                    outcome.skipped += 1;
                    continue;
                }

                // Structural preconditions are checked before any stock moves
                let destination = match rule.action {
                    StructuralAction::SendOut => match &outlet {
                        Some(parent) => Some(Parcel::ToParent(parent.clone(), rule.rhs.clone())),
                        None => {
                            outcome.skipped += 1;
                            continue;
                        }
                    },
                    StructuralAction::SendIn => match self.first_active_child() {
                        Some(child) => Some(Parcel::ToChild(child, rule.rhs.clone())),
                        None => {
                            outcome.skipped += 1;
                            continue;
                        }
                    },
                    StructuralAction::Divide => {
                        if let Err(err) = self.division_room() {
                            outcome.failures.push(err);
                            continue;
                        }
                        None
                    }
                    StructuralAction::None | StructuralAction::Dissolve => None,
                };

                core.stock.subtract(&rule.lhs)?;
                outcome.fired += 1;

                match destination {
                    Some(parcel) => parcels.push(parcel),
                    None => produced.merge(&rule.rhs),
                }
                match rule.action {
                    StructuralAction::Dissolve => dissolve = true,
                    StructuralAction::Divide => divide = true,
                    _ => {}
                }
                // Dissolve and Divide both end the step
                if dissolve || divide {
                    break;
                }
            }

            core.stock.merge(&produced);
            outcome.products = produced;

            if divide {
                let (first, second) = core.stock.halve();
                core.stock.clear();
                daughters = Some((first, second, core.rules.clone()));
            }
            if dissolve {
                core.state = MembraneState::Dissolved;
            }
            outcome.state = Some(core.state);
        }

        for parcel in parcels {
            match self.dispatch_parcel(parcel) {
                Ok(()) => outcome.sent += 1,
                Err(err) => outcome.failures.push(err),
            }
        }

        if let Some((first, second, rules)) = daughters {
            match self.divide(first, second, rules) {
                Ok(()) => outcome.divided = true,
                Err(err) => outcome.failures.push(err),
            }
        }

        for err in &outcome.failures {
            self.record_fault(err);
        }

        trace!(
            membrane = %self.key(),
            at = timestamp.as_micros(),
            fired = outcome.fired,
            skipped = outcome.skipped,
            "evolve step"
        );

        if timed_out {
            let err = KernelError::Timeout {
                operation: "evolve",
                budget,
            };
            self.record_fault(&err);
            return Err(err);
        }
        Ok(outcome)
    }

    /// Room for two daughters one level down; must not touch `core`
    fn division_room(&self) -> KernelResult<()> {
        let topology = &self.node.substrate.topology;
        let depth = self.depth() + 1;
        if !topology.admits_depth(depth) {
            return Err(KernelError::capacity(
                "membrane depth",
                topology.max_depth() as usize,
            ));
        }
        let limit = topology.max_children(depth) as usize;
        if self.node.children.lock().len() + 2 > limit {
            return Err(KernelError::capacity("membrane children", limit));
        }
        Ok(())
    }

    fn first_active_child(&self) -> Option<Membrane> {
        self.node
            .children
            .lock()
            .iter()
            .find(|c| !c.is_destroyed() && c.state() == MembraneState::Active)
            .cloned()
    }

    /// Post an object parcel to its destination; on failure the objects
    /// return to this membrane's stock
    fn dispatch_parcel(&self, parcel: Parcel) -> KernelResult<()> {
        let (dst, objects) = match parcel {
            Parcel::ToParent(dst, objects) | Parcel::ToChild(dst, objects) => (dst, objects),
        };
        let event = Event::new(EventKind::Propagate, self.key())
            .addressed_to(dst.key())
            .with_payload(EventPayload::Objects(objects.clone()));

        dst.node.looper.post_event(event).map(|_| ()).map_err(|err| {
            self.node.core.lock().stock.merge(&objects);
            err
        })
    }

    fn divide(&self, first: Multiset, second: Multiset, rules: Vec<Rule>) -> KernelResult<()> {
        let substrate = self.node.substrate.clone();
        let depth = self.depth() + 1;

        let a = match Membrane::create_fresh(&substrate, Some(self), depth) {
            Ok(a) => a,
            Err(err) => {
                self.restore_stock(&first, &second);
                return Err(err);
            }
        };
        let b = match Membrane::create_fresh(&substrate, Some(self), depth) {
            Ok(b) => b,
            Err(err) => {
                let _ = a.destroy();
                self.restore_stock(&first, &second);
                return Err(err);
            }
        };

        for (daughter, stock) in [(&a, first), (&b, second)] {
            let mut core = daughter.node.core.lock();
            core.stock = stock;
            core.rules = rules.clone();
        }

        debug!(membrane = %self.key(), first = %a.key(), second = %b.key(), "membrane divided");
        Ok(())
    }

    fn restore_stock(&self, first: &Multiset, second: &Multiset) {
        let mut core = self.node.core.lock();
        core.stock.merge(first);
        core.stock.merge(second);
    }

    /// Send bytes to `dst` through its loop
    pub fn send(&self, dst: &Membrane, data: impl Into<Bytes>) -> KernelResult<()> {
        let data = data.into();
        if data.is_empty() {
            return Err(KernelError::invalid("empty message"));
        }
        if self.state() == MembraneState::Dissolved {
            return Err(KernelError::Dissolved(self.key()));
        }
        let event = Event::new(EventKind::Propagate, self.key())
            .addressed_to(dst.key())
            .with_bytes(data);
        dst.node.looper.post_event(event)?;
        Ok(())
    }

    /// Oldest delivered message, if any
    pub fn receive(&self) -> Option<Message> {
        self.node.core.lock().inbox.pop_front()
    }

    pub fn inbox_len(&self) -> usize {
        self.node.core.lock().inbox.len()
    }

    /// Grow the membrane tree below this one to full fan-out
    ///
    /// Each new membrane comes with its own loop, attached below this
    /// membrane's loop. Returns the number of membranes created.
    pub fn spawn_children(&self, depth: u32) -> KernelResult<usize> {
        let topology = &self.node.substrate.topology;
        if depth > CANONICAL_MAX_DEPTH || !topology.admits_depth(depth) {
            return Ok(0);
        }

        let substrate = self.node.substrate.clone();
        let mut created = 0;
        for _ in 0..topology.max_children(depth) {
            let child = Membrane::create_fresh(&substrate, Some(self), depth)?;
            created += 1 + child.spawn_children(depth + 1)?;
        }
        Ok(created)
    }

    /// Tear down this membrane and everything below it, deepest first
    ///
    /// Stock, rules and inbox are dropped, the paired loop is destroyed and
    /// the identity entry goes back to the store.
    pub fn destroy(&self) -> KernelResult<TeardownReport> {
        if self.node.destroyed.swap(true, Ordering::AcqRel) {
            return Err(KernelError::invalid(format!(
                "membrane {} is already destroyed",
                self.key()
            )));
        }

        let mut report = TeardownReport::default();
        let children = std::mem::take(&mut *self.node.children.lock());
        for child in children.iter().rev() {
            match child.destroy() {
                Ok(child_report) => report.absorb(child_report),
                Err(err) => warn!(membrane = %child.key(), error = %err, "child teardown failed"),
            }
        }

        {
            let mut core = self.node.core.lock();
            report.freed += core.inbox.len();
            core.inbox.clear();
            core.stock.clear();
            core.rules.clear();
            core.state = MembraneState::Dissolved;
        }

        match self.node.looper.destroy() {
            Ok(loop_report) => report.absorb(loop_report),
            Err(err) => warn!(membrane = %self.key(), error = %err, "paired loop already destroyed"),
        }

        if let Some(parent) = self.parent() {
            parent.node.children.lock().retain(|c| !c.ptr_eq(self));
        }
        *self.node.parent.lock() = Weak::new();

        if let Err(err) = self.node.substrate.store.release(self.node.record) {
            warn!(membrane = %self.key(), error = %err, "identity entry already gone");
        }

        report.membranes += 1;
        debug!(membrane = %self.key(), "membrane destroyed");
        Ok(report)
    }
}

impl MembraneNode {
    fn record_fault(&self, err: &KernelError) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        *self.last_fault.lock() = Some(err.clone());
        warn!(membrane = %self.key, error = %err, "membrane fault");
    }

    /// Return a refused parcel to the neighbour that sent it
    fn bounce(&self, source: Key, objects: &Multiset) {
        let parent = self.parent.lock().upgrade().map(|node| Membrane { node });
        let children = self.children.lock().clone();
        let sender = parent
            .into_iter()
            .chain(children)
            .find(|m| m.key() == source)
            .filter(|m| !m.is_destroyed() && m.state() != MembraneState::Dissolved);

        let Some(sender) = sender else {
            warn!(membrane = %self.key, source = %source, objects = objects.total(), "refused parcel lost");
            return;
        };
        let event = Event::new(EventKind::Propagate, self.key)
            .addressed_to(sender.key())
            .with_payload(EventPayload::Objects(objects.clone()));
        match sender.node.looper.post_event(event) {
            Ok(_) => debug!(membrane = %self.key, to = %source, "refused parcel returned"),
            Err(err) => {
                warn!(membrane = %self.key, source = %source, error = %err, "refused parcel lost")
            }
        }
    }
}

impl EventSink for MembraneNode {
    fn sink_key(&self) -> Key {
        self.key
    }

    fn evolve_at(&self, timestamp: Timestamp) -> KernelResult<()> {
        let node = self
            .this
            .upgrade()
            .ok_or_else(|| KernelError::invalid(format!("membrane {} is gone", self.key)))?;
        let outcome = Membrane { node }.evolve(timestamp)?;
        match outcome.failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn deliver(&self, event: &Event) -> KernelResult<()> {
        let mut core = self.core.lock();
        let result = match &event.payload {
            EventPayload::Owned(data) => {
                core.inbox.push_back(Message {
                    source: event.source,
                    data: data.clone(),
                });
                Ok(())
            }
            EventPayload::Objects(objects) => {
                if core.state == MembraneState::Dissolved {
                    Err(KernelError::Dissolved(self.key))
                } else {
                    core.stock.merge(objects);
                    Ok(())
                }
            }
            EventPayload::Borrowed(_) | EventPayload::None => Ok(()),
        };
        drop(core);

        if let Err(err) = &result {
            self.record_fault(err);
            if let EventPayload::Objects(objects) = &event.payload {
                self.bounce(event.source, objects);
            }
        }
        result
    }
}

impl fmt::Debug for Membrane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membrane")
            .field("key", &self.key())
            .field("depth", &self.depth())
            .field("state", &self.state())
            .finish()
    }
}

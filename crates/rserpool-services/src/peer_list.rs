//! Peer list: the registrars this registrar knows about.
//!
//! Nodes live in an arena and are referenced by [`PeerHandle`]. Two ordered
//! indices point into the arena:
//!
//! - the identifier index, ordered by registrar identifier. Peers whose
//!   identifier is still unknown (static placeholders) sort first and are
//!   told apart by their address block.
//! - the timer index, ordered by deadline and then like the identifier index.
//!   Only nodes with an active timer are in it.
//!
//! Every structural change goes through this type so both indices always
//! cover the same nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

use rand::Rng;
use rserpool_core::checksum::{ChecksumAccumulator, HandlespaceChecksum};
use rserpool_core::wire::UNDEFINED_REGISTRAR_IDENTIFIER;
use rserpool_core::{RegistrarIdentifier, RspError, TransportAddressBlock};

use crate::takeover::TakeoverProcess;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Configured by the operator. This is the absence of [`PLNF_DYNAMIC`].
pub const PLNF_STATIC: u16 = 0;
/// Learned at runtime.
pub const PLNF_DYNAMIC: u16 = 1 << 0;
/// Learned from another peer's List Response.
pub const PLNF_FROM_PEER: u16 = 1 << 1;
/// Inserted, or had its identifier resolved, by the last registration.
pub const PLNF_NEW: u16 = 1 << 15;

pub const PLNS_LISTSYNC: u16 = 1 << 0;
pub const PLNS_HTSYNC: u16 = 1 << 1;
pub const PLNS_MENTOR: u16 = 1 << 2;

pub type TimerCode = u32;

pub const PLNT_MAX_TIME_LAST_HEARD: TimerCode = 3000;
pub const PLNT_MAX_TIME_NO_RESPONSE: TimerCode = 3001;
pub const PLNT_TAKEOVER_EXPIRY: TimerCode = 3002;

// ── Node ──────────────────────────────────────────────────────────────────────

/// Stable reference to a node. Stale handles resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle {
    slot: usize,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    identifier: RegistrarIdentifier,
    /// Only set for placeholders.
    address: Option<TransportAddressBlock>,
}

impl IndexKey {
    fn new(identifier: RegistrarIdentifier, address_block: &TransportAddressBlock) -> Self {
        Self {
            identifier,
            address: (identifier == UNDEFINED_REGISTRAR_IDENTIFIER).then(|| address_block.clone()),
        }
    }
}

#[derive(Debug)]
pub struct PeerListNode<U> {
    pub(crate) identifier: RegistrarIdentifier,
    pub(crate) flags: u16,
    pub(crate) address_block: TransportAddressBlock,
    pub(crate) last_update: u64,
    pub(crate) timer_code: TimerCode,
    pub(crate) timer: Option<u64>,
    pub(crate) ownership_checksum: ChecksumAccumulator,
    /// `PLNS_*` synchronisation state.
    pub status: u16,
    /// Another registrar announced it is taking this peer over.
    pub takeover_registrar: RegistrarIdentifier,
    /// Our own takeover of this peer, if one is running.
    pub takeover: Option<TakeoverProcess>,
    pub user_data: Option<U>,
}

impl<U> PeerListNode<U> {
    fn new(identifier: RegistrarIdentifier, flags: u16, address_block: &TransportAddressBlock, now: u64) -> Self {
        Self {
            identifier,
            flags,
            address_block: address_block.clone(),
            last_update: now,
            timer_code: 0,
            timer: None,
            ownership_checksum: ChecksumAccumulator::INITIAL,
            status: 0,
            takeover_registrar: UNDEFINED_REGISTRAR_IDENTIFIER,
            takeover: None,
            user_data: None,
        }
    }

    fn key(&self) -> IndexKey {
        IndexKey::new(self.identifier, &self.address_block)
    }

    pub fn identifier(&self) -> RegistrarIdentifier {
        self.identifier
    }

    pub fn has_identifier(&self) -> bool {
        self.identifier != UNDEFINED_REGISTRAR_IDENTIFIER
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags & PLNF_DYNAMIC != 0
    }

    pub fn is_new(&self) -> bool {
        self.flags & PLNF_NEW != 0
    }

    pub fn address_block(&self) -> &TransportAddressBlock {
        &self.address_block
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn timer_code(&self) -> TimerCode {
        self.timer_code
    }

    /// Deadline of the active timer.
    pub fn timer(&self) -> Option<u64> {
        self.timer
    }

    /// Finished ownership checksum, as sent in Presence messages.
    pub fn ownership_checksum(&self) -> HandlespaceChecksum {
        self.ownership_checksum.finish()
    }

    pub fn ownership_accumulator(&self) -> ChecksumAccumulator {
        self.ownership_checksum
    }
}

impl<U> fmt::Display for PeerListNode<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "${:08x} upd={} chsum=${:04x} flags=",
            self.identifier,
            self.last_update,
            self.ownership_checksum()
        )?;
        if self.is_new() {
            f.write_str("[new]")?;
        }
        f.write_str(if self.is_dynamic() { "[dynamic]" } else { "(static)" })?;
        if self.flags & PLNF_FROM_PEER != 0 {
            f.write_str("[fromPeer]")?;
        }
        for (bit, name) in [
            (PLNS_LISTSYNC, " LISTSYNC"),
            (PLNS_HTSYNC, " HTSYNC"),
            (PLNS_MENTOR, " MENTOR"),
        ] {
            if self.status & bit != 0 {
                f.write_str(name)?;
            }
        }
        if self.takeover.is_some() {
            f.write_str(" TAKEOVER(own)")?;
        }
        if self.takeover_registrar != UNDEFINED_REGISTRAR_IDENTIFIER {
            f.write_str(" TAKEOVER(other)")?;
        }
        write!(f, " addrs: {}", self.address_block)
    }
}

// ── List ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<U> {
    generation: u32,
    node: Option<PeerListNode<U>>,
}

#[derive(Debug)]
pub struct PeerList<U> {
    own_identifier: RegistrarIdentifier,
    slots: Vec<Slot<U>>,
    free: Vec<usize>,
    index: BTreeMap<IndexKey, usize>,
    timers: BTreeSet<(u64, IndexKey)>,
}

impl<U> PeerList<U> {
    pub fn new(own_identifier: RegistrarIdentifier) -> Self {
        Self {
            own_identifier,
            slots: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            timers: BTreeSet::new(),
        }
    }

    pub fn own_identifier(&self) -> RegistrarIdentifier {
        self.own_identifier
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&PeerListNode<U>> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerListNode<U>> {
        self.slots
            .get_mut(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn handle(&self, slot: usize) -> PeerHandle {
        PeerHandle {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    fn node(&self, slot: usize) -> &PeerListNode<U> {
        match self.slots[slot].node.as_ref() {
            Some(node) => node,
            None => unreachable!("index refers to empty slot {slot}"),
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut PeerListNode<U> {
        match self.slots[slot].node.as_mut() {
            Some(node) => node,
            None => unreachable!("index refers to empty slot {slot}"),
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    /// Exact lookup. A defined identifier is matched on its own; the
    /// undefined identifier matches the first node whose address block
    /// overlaps `address_block`.
    pub fn find(
        &self,
        identifier: RegistrarIdentifier,
        address_block: Option<&TransportAddressBlock>,
    ) -> Option<PeerHandle> {
        if identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
            let key = IndexKey {
                identifier,
                address: None,
            };
            return self.index.get(&key).map(|slot| self.handle(*slot));
        }
        let address_block = address_block?;
        self.index
            .values()
            .find(|slot| {
                self.node(**slot).address_block.overlap_cmp(address_block) == std::cmp::Ordering::Equal
            })
            .map(|slot| self.handle(*slot))
    }

    /// The node sorting immediately before `(identifier, address_block)`.
    pub fn find_nearest_prev(
        &self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Option<PeerHandle> {
        let key = IndexKey::new(identifier, address_block);
        self.index
            .range(..key)
            .next_back()
            .map(|(_, slot)| self.handle(*slot))
    }

    /// The node sorting immediately after `(identifier, address_block)`.
    pub fn find_nearest_next(
        &self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Option<PeerHandle> {
        let key = IndexKey::new(identifier, address_block);
        self.index
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, slot)| self.handle(*slot))
    }

    pub fn first(&self) -> Option<PeerHandle> {
        self.index.values().next().map(|slot| self.handle(*slot))
    }

    pub fn last(&self) -> Option<PeerHandle> {
        self.index.values().next_back().map(|slot| self.handle(*slot))
    }

    pub fn next(&self, handle: PeerHandle) -> Option<PeerHandle> {
        let key = self.get(handle)?.key();
        self.index
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, slot)| self.handle(*slot))
    }

    pub fn prev(&self, handle: PeerHandle) -> Option<PeerHandle> {
        let key = self.get(handle)?.key();
        self.index
            .range(..key)
            .next_back()
            .map(|(_, slot)| self.handle(*slot))
    }

    /// Nodes in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &PeerListNode<U>)> + '_ {
        self.index
            .values()
            .map(move |slot| (self.handle(*slot), self.node(*slot)))
    }

    /// Nodes with an active timer, soonest deadline first.
    pub fn timers(&self) -> impl Iterator<Item = (PeerHandle, &PeerListNode<U>)> + '_ {
        self.timers.iter().filter_map(move |(_, key)| {
            let slot = *self.index.get(key)?;
            Some((self.handle(slot), self.node(slot)))
        })
    }

    pub fn first_timer(&self) -> Option<PeerHandle> {
        self.timers().next().map(|(handle, _)| handle)
    }

    pub fn next_timer_timestamp(&self) -> Option<u64> {
        self.timers.first().map(|(at, _)| *at)
    }

    /// Uniformly random node.
    pub fn random(&self, rng: &mut impl Rng) -> Option<PeerHandle> {
        if self.index.is_empty() {
            return None;
        }
        let position = rng.gen_range(0..self.index.len());
        self.index.values().nth(position).map(|slot| self.handle(*slot))
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Arm the node's timer, replacing any active one.
    pub fn activate_timer(&mut self, handle: PeerHandle, code: TimerCode, at: u64) {
        self.deactivate_timer(handle);
        if let Some(node) = self.get_mut(handle) {
            node.timer_code = code;
            node.timer = Some(at);
            let key = node.key();
            self.timers.insert((at, key));
        }
    }

    /// Disarm the node's timer. Does nothing if none is active.
    pub fn deactivate_timer(&mut self, handle: PeerHandle) {
        if let Some(node) = self.get_mut(handle) {
            if let Some(at) = node.timer.take() {
                let key = node.key();
                self.timers.remove(&(at, key));
            }
        }
    }

    // ── Structure ────────────────────────────────────────────────────────────

    /// Insert a node, or update the one already indexed under the same key.
    ///
    /// An inserted node gets [`PLNF_NEW`]; an updated one takes the given
    /// flags without it. Either way the node takes a copy of
    /// `address_block` and `now` as its last update.
    pub fn add_or_update(
        &mut self,
        identifier: RegistrarIdentifier,
        flags: u16,
        address_block: &TransportAddressBlock,
        now: u64,
    ) -> Result<PeerHandle, RspError> {
        self.check_identifier(identifier)?;
        let key = IndexKey::new(identifier, address_block);
        if let Some(slot) = self.index.get(&key).copied() {
            let node = self.node_mut(slot);
            node.flags = flags & !PLNF_NEW;
            node.address_block = address_block.clone();
            node.last_update = now;
            return Ok(self.handle(slot));
        }

        let node = PeerListNode::new(identifier, flags | PLNF_NEW, address_block, now);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].node = Some(node);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        Ok(self.handle(slot))
    }

    /// Change a node's identifier, moving it within both indices.
    pub fn set_identifier(&mut self, handle: PeerHandle, identifier: RegistrarIdentifier) -> Result<(), RspError> {
        self.check_identifier(identifier)?;
        let node = self.get(handle).ok_or(RspError::NotFound)?;
        let old_key = node.key();
        let new_key = IndexKey::new(identifier, &node.address_block);
        if old_key == new_key {
            return Ok(());
        }
        if self.index.contains_key(&new_key) {
            return Err(RspError::DuplicateId);
        }

        let timer = node.timer;
        if let Some(slot) = self.index.remove(&old_key) {
            self.index.insert(new_key.clone(), slot);
        }
        if let Some(at) = timer {
            self.timers.remove(&(at, old_key));
            self.timers.insert((at, new_key));
        }
        if let Some(node) = self.get_mut(handle) {
            node.identifier = identifier;
        }
        Ok(())
    }

    /// Take a node out of the list.
    pub fn remove(&mut self, handle: PeerHandle) -> Option<PeerListNode<U>> {
        let node = self.get(handle)?;
        let key = node.key();
        if let Some(at) = node.timer {
            self.timers.remove(&(at, key.clone()));
        }
        self.index.remove(&key);
        let slot = &mut self.slots[handle.slot];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);
        slot.node.take()
    }

    /// Remove every node, returning them in identifier order.
    pub fn drain(&mut self) -> Vec<PeerListNode<U>> {
        let handles: Vec<PeerHandle> = self.iter().map(|(handle, _)| handle).collect();
        handles.into_iter().filter_map(|handle| self.remove(handle)).collect()
    }

    fn check_identifier(&self, identifier: RegistrarIdentifier) -> Result<(), RspError> {
        if self.own_identifier != UNDEFINED_REGISTRAR_IDENTIFIER && identifier == self.own_identifier {
            return Err(RspError::OwnId);
        }
        Ok(())
    }

    /// Whether both indices describe the same live nodes.
    pub fn is_consistent(&self) -> bool {
        let live = self.slots.iter().filter(|slot| slot.node.is_some()).count();
        let indexed = self.index.iter().all(|(key, slot)| {
            self.slots[*slot]
                .node
                .as_ref()
                .is_some_and(|node| node.key() == *key)
        });
        let timed = self
            .slots
            .iter()
            .filter_map(|slot| slot.node.as_ref())
            .filter_map(|node| node.timer.map(|at| (at, node.key())))
            .all(|entry| self.timers.contains(&entry));
        let armed = self
            .slots
            .iter()
            .filter_map(|slot| slot.node.as_ref())
            .filter(|node| node.timer.is_some())
            .count();
        live == self.index.len() && indexed && timed && armed == self.timers.len()
    }
}

impl<U> fmt::Display for PeerList<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Peer List: (own ${:08x}, {} peers)", self.own_identifier, self.len())?;
        for (position, (_, node)) in self.iter().enumerate() {
            writeln!(f, " - {position:03}: {node}")?;
        }
        Ok(())
    }
}

//! Tiered LRU eviction
//!
//! Parts live in [`TIER_COUNT`] LRU lists of equal capacity. New parts enter
//! the front of the coldest tier; cache hits move a part one tier warmer,
//! swapping out the least recently promoted part of the warmer tier when it is
//! full. When the coldest tier is full on insert, front entries are shifted up
//! into the first tier with spare room, and only when every tier is full is the
//! back of the coldest tier evicted.
//!
//! The lists are intrusive doubly linked lists over a slab of nodes so every
//! move is O(1).

use super::{AlgorithmStats, CacheAlgorithm};
use crate::config::TIER_COUNT;
use crate::error::{CacheError, Result};
use crate::models::{ObjectId, ObjectIndex};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const COLDEST: usize = TIER_COUNT - 1;

struct Node {
    index: ObjectIndex,
    tier: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tier {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// State guarded by the algorithm mutex
struct Tiers {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    tiers: [Tier; TIER_COUNT],
    lookup: HashMap<ObjectIndex, usize>,
    hits: u64,
    requests: u64,
}

impl Tiers {
    fn new() -> Self {
        Tiers {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            tiers: [Tier::default(); TIER_COUNT],
            lookup: HashMap::new(),
            hits: 0,
            requests: 0,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn alloc(&mut self, index: ObjectIndex) -> usize {
        let node = Node {
            index,
            tier: COLDEST,
            prev: None,
            next: None,
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Option<ObjectIndex> {
        let node = self.nodes.get_mut(slot)?.take()?;
        self.free_slots.push(slot);
        Some(node.index)
    }

    fn unlink(&mut self, slot: usize) {
        let (tier, prev, next) = match self.node(slot) {
            Some(node) => (node.tier, node.prev, node.next),
            None => return,
        };

        match prev.and_then(|p| self.node_mut(p)) {
            Some(prev_node) => prev_node.next = next,
            None => self.tiers[tier].head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(next_node) => next_node.prev = prev,
            None => self.tiers[tier].tail = prev,
        }
        self.tiers[tier].len = self.tiers[tier].len.saturating_sub(1);

        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, tier: usize, slot: usize) {
        let old_head = self.tiers[tier].head;
        if let Some(node) = self.node_mut(slot) {
            node.tier = tier;
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|h| self.node_mut(h)) {
            Some(head) => head.prev = Some(slot),
            None => self.tiers[tier].tail = Some(slot),
        }
        self.tiers[tier].head = Some(slot);
        self.tiers[tier].len += 1;
    }

    fn push_back(&mut self, tier: usize, slot: usize) {
        let old_tail = self.tiers[tier].tail;
        if let Some(node) = self.node_mut(slot) {
            node.tier = tier;
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail.and_then(|t| self.node_mut(t)) {
            Some(tail) => tail.next = Some(slot),
            None => self.tiers[tier].head = Some(slot),
        }
        self.tiers[tier].tail = Some(slot);
        self.tiers[tier].len += 1;
    }

    fn total_len(&self) -> usize {
        self.tiers.iter().map(|t| t.len).sum()
    }
}

/// Tiered LRU cache algorithm
pub struct TieredLru {
    part_size: u64,
    tier_list_size: usize,
    state: Mutex<Tiers>,
    evictions: mpsc::UnboundedSender<ObjectIndex>,
}

impl TieredLru {
    /// Create a new tiered LRU
    ///
    /// # Arguments
    /// * `part_size` - Size of one part, used for size accounting
    /// * `total_capacity` - Maximum number of tracked parts, rounded down to a
    ///   multiple of [`TIER_COUNT`]; every tier holds at least one part
    /// * `evictions` - Receives every index evicted to make room
    pub fn new(
        part_size: u64,
        total_capacity: u64,
        evictions: mpsc::UnboundedSender<ObjectIndex>,
    ) -> Self {
        let tier_list_size = ((total_capacity / TIER_COUNT as u64) as usize).max(1);
        debug!(
            "Creating tiered LRU: tiers={}, tier_list_size={}, part_size={}",
            TIER_COUNT, tier_list_size, part_size
        );

        TieredLru {
            part_size,
            tier_list_size,
            state: Mutex::new(Tiers::new()),
            evictions,
        }
    }

    /// Maximum number of parts per tier
    pub fn tier_list_size(&self) -> usize {
        self.tier_list_size
    }

    fn lock(&self) -> MutexGuard<'_, Tiers> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_locked(&self, state: &mut Tiers, idx: &ObjectIndex) -> Result<()> {
        if state.lookup.contains_key(idx) {
            return Err(CacheError::AlreadyInCache);
        }

        self.free_space_in_coldest(state);

        let slot = state.alloc(idx.clone());
        state.push_front(COLDEST, slot);
        state.lookup.insert(idx.clone(), slot);
        Ok(())
    }

    /// Make room for one entry in the coldest tier
    fn free_space_in_coldest(&self, state: &mut Tiers) {
        if state.tiers[COLDEST].len < self.tier_list_size {
            return;
        }

        let first_with_room = (0..COLDEST).find(|&t| state.tiers[t].len < self.tier_list_size);
        if let Some(first) = first_with_room {
            // Shift front entries one tier up, from the free tier down to the coldest
            for tier in first..COLDEST {
                if state.tiers[tier].len >= self.tier_list_size {
                    continue;
                }
                if let Some(front) = state.tiers[tier + 1].head {
                    state.unlink(front);
                    state.push_back(tier, front);
                }
            }
            if state.tiers[COLDEST].len < self.tier_list_size {
                return;
            }
        }

        let Some(back) = state.tiers[COLDEST].tail else {
            error!("Coldest tier is full but has no tail entry");
            return;
        };
        state.unlink(back);
        match state.release(back) {
            Some(evicted) => {
                state.lookup.remove(&evicted);
                debug!("Evicting {}", evicted);
                if self.evictions.send(evicted).is_err() {
                    warn!("Eviction channel closed, evicted part stays on disk");
                }
            }
            None => error!("Tier list references empty slot {}", back),
        }
    }

    fn remove_locked(state: &mut Tiers, idx: &ObjectIndex) -> bool {
        let Some(slot) = state.lookup.remove(idx) else {
            return false;
        };
        if state.node(slot).is_none() {
            error!("Lookup entry for {} points to empty slot {}", idx, slot);
            return false;
        }
        state.unlink(slot);
        state.release(slot);
        true
    }

    /// Tier currently holding `idx`
    pub fn tier_of(&self, idx: &ObjectIndex) -> Option<usize> {
        let state = self.lock();
        let slot = *state.lookup.get(idx)?;
        state.node(slot).map(|n| n.tier)
    }

    /// Lengths of every tier, hottest first
    pub fn tier_lens(&self) -> [usize; TIER_COUNT] {
        let state = self.lock();
        let mut lens = [0; TIER_COUNT];
        for (len, tier) in lens.iter_mut().zip(state.tiers.iter()) {
            *len = tier.len;
        }
        lens
    }
}

impl CacheAlgorithm for TieredLru {
    fn lookup(&self, idx: &ObjectIndex) -> bool {
        let mut state = self.lock();
        state.requests += 1;
        let found = state.lookup.contains_key(idx);
        if found {
            state.hits += 1;
        }
        found
    }

    fn contains(&self, idx: &ObjectIndex) -> bool {
        self.lock().lookup.contains_key(idx)
    }

    fn should_keep(&self, _idx: &ObjectIndex) -> bool {
        true
    }

    fn add_object(&self, idx: &ObjectIndex) -> Result<()> {
        let mut state = self.lock();
        self.add_locked(&mut state, idx)
    }

    fn promote_object(&self, idx: &ObjectIndex) {
        let mut state = self.lock();

        let Some(slot) = state.lookup.get(idx).copied() else {
            if let Err(e) = self.add_locked(&mut state, idx) {
                error!("Failed to add promoted part {}: {}", idx, e);
            }
            return;
        };

        let Some(tier) = state.node(slot).map(|n| n.tier) else {
            error!(
                "{}",
                CacheError::InconsistentState(format!("{} is in lookup but not in any tier", idx))
            );
            state.lookup.remove(idx);
            return;
        };
        let at_front = state.tiers[tier].head == Some(slot);

        if tier == 0 {
            if !at_front {
                state.unlink(slot);
                state.push_front(0, slot);
            }
            return;
        }

        if at_front {
            return;
        }

        let upper = tier - 1;
        if state.tiers[upper].len < self.tier_list_size {
            state.unlink(slot);
            state.push_front(upper, slot);
            return;
        }

        // Warmer tier is full: its least recently promoted entry trades places
        let Some(upper_back) = state.tiers[upper].tail else {
            error!("Tier {} is full but has no tail entry", upper);
            return;
        };
        state.unlink(upper_back);
        state.unlink(slot);
        state.push_front(tier, upper_back);
        state.push_front(upper, slot);
    }

    fn remove(&self, idx: &ObjectIndex) -> bool {
        let mut state = self.lock();
        Self::remove_locked(&mut state, idx)
    }

    fn remove_object(&self, id: &ObjectId) -> bool {
        let mut state = self.lock();
        let parts: Vec<ObjectIndex> = state
            .lookup
            .keys()
            .filter(|idx| &idx.object_id == id)
            .cloned()
            .collect();

        let mut removed = false;
        for idx in &parts {
            removed |= Self::remove_locked(&mut state, idx);
        }
        removed
    }

    fn consumed_size(&self) -> u64 {
        self.part_size * self.lock().total_len() as u64
    }

    fn stats(&self) -> AlgorithmStats {
        let state = self.lock();
        let objects = state.total_len() as u64;
        AlgorithmStats {
            hits: state.hits,
            requests: state.requests,
            objects,
            size: objects * self.part_size,
        }
    }
}

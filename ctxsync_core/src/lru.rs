//! Communicator LRU table
//!
//! Many logical communicators share a handful of hardware
//! communicator-descriptor slots. [`CommLru`] maps communicator ids onto
//! those slots and evicts the least recently used communicator when every
//! slot is taken.
//!
//! # Layout
//!
//! ```text
//! entries: [ e0 | e1 | e2 | ... ]      arena indexed by CommId, grows in steps
//!             ^    |
//!   head(MRU) +----+--> prev/next links by index --> tail(LRU)
//! ```
//!
//! The recency list is intrusive: links are arena indices, so growing the
//! arena never invalidates them and needs no rebuild.

use crate::error::{SyncError, SyncResult};
use crate::sync_invariant;
use ctxsync_types::{CommId, HardwareParams};

/// Link sentinel
const NIL: u32 = u32::MAX;

/// Largest communicator id the table accepts
pub const MAX_COMM_ID: u32 = (1 << 20) - 1;

/// Whether a communicator currently owns a hardware slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy)]
struct LruEntry {
    state: EntryState,
    /// Hardware slot, meaningful only while active
    slot: u32,
    prev: u32,
    next: u32,
}

impl LruEntry {
    const fn inactive() -> Self {
        Self {
            state: EntryState::Inactive,
            slot: NIL,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Result of [`CommLru::use_comm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruOutcome {
    /// Hardware slot now owned by the communicator
    pub slot: u32,
    /// The communicator already owned that slot
    pub hit: bool,
    /// Communicator that lost its slot to make room
    pub evicted: Option<CommId>,
}

/// Counters for the table's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub growths: u64,
}

/// Fixed-capacity communicator to hardware-slot table with LRU eviction
#[derive(Debug)]
pub struct CommLru {
    entries: Vec<LruEntry>,
    head: u32,
    tail: u32,
    len: u32,
    capacity: u32,
    next_unused_slot: u32,
    free_slots: Vec<u32>,
    growth_increment: u32,
    stats: LruStats,
}

impl CommLru {
    /// Create a table with `capacity` hardware slots.
    ///
    /// The entry arena starts with `growth_increment` entries and grows by
    /// the same amount whenever a larger communicator id shows up.
    pub fn new(capacity: u32, growth_increment: u32) -> SyncResult<Self> {
        if capacity == 0 {
            return Err(SyncError::config("LRU capacity must be at least 1"));
        }
        if growth_increment == 0 {
            return Err(SyncError::config("LRU growth increment must be at least 1"));
        }
        Ok(Self {
            entries: vec![LruEntry::inactive(); growth_increment as usize],
            head: NIL,
            tail: NIL,
            len: 0,
            capacity,
            next_unused_slot: 0,
            free_slots: Vec::new(),
            growth_increment,
            stats: LruStats::default(),
        })
    }

    pub fn from_params(params: &HardwareParams) -> SyncResult<Self> {
        Self::new(params.context_slot_capacity, params.lru_growth_increment)
    }

    /// Number of hardware slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of occupied slots (length of the recency list)
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Current length of the entry arena
    pub fn table_len(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> LruStats {
        self.stats
    }

    /// Whether `id` owns a slot. Ids beyond the table are inactive; the
    /// table is not grown by this query.
    pub fn is_active(&self, id: CommId) -> bool {
        self.entries
            .get(id.index())
            .map_or(false, |e| e.state == EntryState::Active)
    }

    /// Slot owned by `id`, if active
    pub fn slot_of(&self, id: CommId) -> Option<u32> {
        self.entries
            .get(id.index())
            .filter(|e| e.state == EntryState::Active)
            .map(|e| e.slot)
    }

    /// Grow the entry arena until it covers `id`. Returns whether it grew.
    ///
    /// Existing entries, their state, slots and links are untouched. Ids
    /// above [`MAX_COMM_ID`] are rejected.
    pub fn resize_db(&mut self, id: CommId) -> SyncResult<bool> {
        check_id(id)?;
        let needed = id.index() + 1;
        if needed <= self.entries.len() {
            return Ok(false);
        }
        let old_len = self.entries.len();
        let step = self.growth_increment as usize;
        let new_len = needed.div_ceil(step) * step;
        self.entries.resize(new_len, LruEntry::inactive());
        self.stats.growths += 1;
        log::info!(
            "Communicator table grown from {} to {} entries for {}",
            old_len,
            new_len,
            id
        );
        Ok(true)
    }

    /// What [`use_comm`](Self::use_comm) would return for `id`, without
    /// touching the table
    pub fn peek(&self, id: CommId) -> SyncResult<LruOutcome> {
        check_id(id)?;
        if let Some(slot) = self.slot_of(id) {
            return Ok(LruOutcome {
                slot,
                hit: true,
                evicted: None,
            });
        }
        if let Some(&slot) = self.free_slots.last() {
            return Ok(LruOutcome {
                slot,
                hit: false,
                evicted: None,
            });
        }
        if self.next_unused_slot < self.capacity {
            return Ok(LruOutcome {
                slot: self.next_unused_slot,
                hit: false,
                evicted: None,
            });
        }
        if self.tail == NIL {
            return Err(sync_invariant!(
                "LRU full ({} of {}) but recency list is empty",
                self.len,
                self.capacity
            ));
        }
        Ok(LruOutcome {
            slot: self.entries[self.tail as usize].slot,
            hit: false,
            evicted: Some(CommId(self.tail)),
        })
    }

    /// Mark `id` as most recently used and return its hardware slot,
    /// assigning or evicting as needed.
    pub fn use_comm(&mut self, id: CommId) -> SyncResult<LruOutcome> {
        self.resize_db(id)?;
        let idx = id.0;

        if self.entries[id.index()].state == EntryState::Active {
            self.unlink(idx);
            self.push_front(idx);
            self.stats.hits += 1;
            return Ok(LruOutcome {
                slot: self.entries[id.index()].slot,
                hit: true,
                evicted: None,
            });
        }

        self.stats.misses += 1;
        let (slot, evicted) = if let Some(slot) = self.take_free_slot() {
            self.len += 1;
            (slot, None)
        } else {
            let victim = self.tail;
            if victim == NIL {
                return Err(sync_invariant!(
                    "LRU full ({} of {}) but recency list is empty",
                    self.len,
                    self.capacity
                ));
            }
            self.unlink(victim);
            let entry = &mut self.entries[victim as usize];
            let slot = entry.slot;
            entry.state = EntryState::Inactive;
            entry.slot = NIL;
            self.stats.evictions += 1;
            log::debug!(
                "Evicted {} from hardware slot {} for {}",
                CommId(victim),
                slot,
                id
            );
            (slot, Some(CommId(victim)))
        };

        let entry = &mut self.entries[id.index()];
        entry.state = EntryState::Active;
        entry.slot = slot;
        self.push_front(idx);

        debug_assert!(self.len <= self.capacity);
        Ok(LruOutcome {
            slot,
            hit: false,
            evicted,
        })
    }

    /// Drop `id` from the table and return its slot to the free pool
    pub fn release(&mut self, id: CommId) -> Option<u32> {
        let entry = *self.entries.get(id.index())?;
        if entry.state != EntryState::Active {
            return None;
        }
        self.unlink(id.0);
        let released = &mut self.entries[id.index()];
        released.state = EntryState::Inactive;
        released.slot = NIL;
        self.len -= 1;
        self.free_slots.push(entry.slot);
        log::debug!("Released hardware slot {} held by {}", entry.slot, id);
        Some(entry.slot)
    }

    /// Active communicators from most to least recently used
    pub fn recency_order(&self) -> Vec<CommId> {
        let mut order = Vec::with_capacity(self.len as usize);
        let mut cursor = self.head;
        while cursor != NIL {
            order.push(CommId(cursor));
            cursor = self.entries[cursor as usize].next;
        }
        order
    }

    /// Least recently used communicator, the next eviction victim
    pub fn lru_victim(&self) -> Option<CommId> {
        (self.tail != NIL).then_some(CommId(self.tail))
    }

    /// Verify list length, link symmetry and slot uniqueness
    pub fn check_invariants(&self) -> SyncResult<()> {
        if self.len > self.capacity {
            return Err(sync_invariant!(
                "recency list holds {} entries, capacity {}",
                self.len,
                self.capacity
            ));
        }
        let mut seen = vec![false; self.capacity as usize];
        let mut count = 0u32;
        let mut prev = NIL;
        let mut cursor = self.head;
        while cursor != NIL {
            let entry = &self.entries[cursor as usize];
            if entry.state != EntryState::Active || entry.prev != prev {
                return Err(sync_invariant!("broken recency link at {}", CommId(cursor)));
            }
            let slot = entry.slot as usize;
            if slot >= seen.len() || seen[slot] {
                return Err(sync_invariant!(
                    "hardware slot {} owned twice or out of range",
                    entry.slot
                ));
            }
            seen[slot] = true;
            count += 1;
            if count > self.len {
                return Err(sync_invariant!("recency list longer than recorded length"));
            }
            prev = cursor;
            cursor = entry.next;
        }
        let active = self
            .entries
            .iter()
            .filter(|e| e.state == EntryState::Active)
            .count() as u32;
        if count != self.len || active != self.len || prev != self.tail {
            return Err(sync_invariant!(
                "recency list has {} nodes, {} active entries, length {}",
                count,
                active,
                self.len
            ));
        }
        Ok(())
    }

    fn take_free_slot(&mut self) -> Option<u32> {
        if let Some(slot) = self.free_slots.pop() {
            return Some(slot);
        }
        if self.next_unused_slot < self.capacity {
            let slot = self.next_unused_slot;
            self.next_unused_slot += 1;
            return Some(slot);
        }
        None
    }

    fn unlink(&mut self, idx: u32) {
        let LruEntry { prev, next, .. } = self.entries[idx as usize];
        if prev != NIL {
            self.entries[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entries[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let entry = &mut self.entries[idx as usize];
        entry.prev = NIL;
        entry.next = NIL;
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let entry = &mut self.entries[idx as usize];
            entry.prev = NIL;
            entry.next = old_head;
        }
        if old_head != NIL {
            self.entries[old_head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }
}

fn check_id(id: CommId) -> SyncResult<()> {
    if id.0 > MAX_COMM_ID {
        return Err(SyncError::invalid_input(format!(
            "{} exceeds the largest communicator id {}",
            id, MAX_COMM_ID
        )));
    }
    Ok(())
}

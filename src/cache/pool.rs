// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The record pool and its recency (LRU) list.
//!
//! All record storage is one `Vec` of [`Slot`]s allocated when the
//! cache is created; it never grows or shrinks afterwards. Slots carry
//! their own intrusive links: `chain_next` threads a slot into a hash
//! bucket's chain (or into the insertion transaction's staging list),
//! and `lru_prev`/`lru_next` thread reusable slots into one doubly
//! linked recency list ordered newest (head) to oldest (tail).
//!
//! At start-up every slot is free and on the recency list. A slot
//! leaves the list when it is drawn for reuse or held by a static
//! record, and rejoins it at the head when a dynamic record is
//! committed or touched, or at the tail when its storage is freed.
//! Every recycle of a slot's storage bumps its generation tag, which
//! is what invalidates stale [`RecordHandle`]s.

use super::record::{CacheRecord, RecordHandle};

////////////////////////////////////////////////////////////////////////
// SLOTS                                                              //
////////////////////////////////////////////////////////////////////////

/// One unit of record storage.
pub(super) struct Slot {
    /// Bumped every time the slot's storage is recycled.
    pub generation: u64,

    /// The record currently occupying the slot, or `None` if free.
    pub record: Option<CacheRecord>,

    /// Singly linked successor in the slot's hash chain, or — while
    /// the slot is staged in an insertion transaction — in the staging
    /// list. A slot is never in both at once.
    pub chain_next: Option<u32>,

    /// The hash bucket the slot is currently linked into, if any.
    pub bucket: Option<u32>,

    pub lru_prev: Option<u32>,
    pub lru_next: Option<u32>,
    pub on_lru: bool,
}

////////////////////////////////////////////////////////////////////////
// THE POOL                                                           //
////////////////////////////////////////////////////////////////////////

/// The fixed-capacity record pool.
pub(super) struct Pool {
    slots: Vec<Slot>,

    /// Newest end of the recency list.
    lru_head: Option<u32>,

    /// Oldest end of the recency list.
    lru_tail: Option<u32>,
}

impl Pool {
    /// Creates a pool of `capacity` free slots, all on the recency
    /// list.
    pub fn new(capacity: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(capacity),
            lru_head: None,
            lru_tail: None,
        };
        for _ in 0..capacity {
            pool.slots.push(Slot {
                generation: 0,
                record: None,
                chain_next: None,
                bucket: None,
                lru_prev: None,
                lru_next: None,
                on_lru: false,
            });
        }
        for idx in 0..capacity as u32 {
            pool.link_oldest(idx);
        }
        pool
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: u32) -> &Slot {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut Slot {
        &mut self.slots[idx as usize]
    }

    /// Returns a generation-checked handle to the slot's current
    /// occupant.
    pub fn handle(&self, idx: u32) -> RecordHandle {
        RecordHandle {
            index: idx,
            generation: self.slot(idx).generation,
        }
    }

    /// Dereferences a handle, returning `None` if the slot's storage
    /// has been recycled since the handle was created.
    pub fn get(&self, handle: RecordHandle) -> Option<&CacheRecord> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation == handle.generation {
            slot.record.as_ref()
        } else {
            None
        }
    }

    /// Takes the slot's record and bumps its generation tag, turning
    /// every outstanding handle to it stale. This is the single point
    /// through which storage is recycled.
    pub fn recycle(&mut self, idx: u32) -> Option<CacheRecord> {
        let slot = self.slot_mut(idx);
        slot.generation += 1;
        slot.record.take()
    }

    ////////////////////////////////////////////////////////////////////
    // RECENCY LIST                                                   //
    ////////////////////////////////////////////////////////////////////

    /// Returns the oldest slot on the recency list, if any.
    pub fn oldest(&self) -> Option<u32> {
        self.lru_tail
    }

    /// Pushes a slot onto the newest end of the recency list. The slot
    /// must not already be on it.
    pub fn link_newest(&mut self, idx: u32) {
        debug_assert!(!self.slot(idx).on_lru);
        let old_head = self.lru_head;
        {
            let slot = self.slot_mut(idx);
            slot.lru_prev = None;
            slot.lru_next = old_head;
            slot.on_lru = true;
        }
        match old_head {
            Some(head) => self.slot_mut(head).lru_prev = Some(idx),
            None => self.lru_tail = Some(idx),
        }
        self.lru_head = Some(idx);
    }

    /// Pushes a slot onto the oldest end of the recency list, making
    /// it the next candidate for reuse. The slot must not already be
    /// on the list.
    pub fn link_oldest(&mut self, idx: u32) {
        debug_assert!(!self.slot(idx).on_lru);
        let old_tail = self.lru_tail;
        {
            let slot = self.slot_mut(idx);
            slot.lru_next = None;
            slot.lru_prev = old_tail;
            slot.on_lru = true;
        }
        match old_tail {
            Some(tail) => self.slot_mut(tail).lru_next = Some(idx),
            None => self.lru_head = Some(idx),
        }
        self.lru_tail = Some(idx);
    }

    /// Detaches a slot from the recency list. No-op if the slot is not
    /// on it.
    pub fn unlink_lru(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = self.slot_mut(idx);
            if !slot.on_lru {
                return;
            }
            slot.on_lru = false;
            (slot.lru_prev.take(), slot.lru_next.take())
        };
        match prev {
            Some(prev) => self.slot_mut(prev).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(next) => self.slot_mut(next).lru_prev = prev,
            None => self.lru_tail = prev,
        }
    }

    /// Moves a slot to the newest end of the recency list.
    pub fn touch(&mut self, idx: u32) {
        if self.slot(idx).on_lru {
            self.unlink_lru(idx);
            self.link_newest(idx);
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::Pool;

    /// Collects the recency list oldest-first.
    fn oldest_first(pool: &Pool) -> Vec<u32> {
        let mut order = Vec::new();
        let mut cur = pool.oldest();
        while let Some(idx) = cur {
            order.push(idx);
            cur = pool.slot(idx).lru_prev;
        }
        order
    }

    #[test]
    fn new_pool_has_every_slot_reusable() {
        let pool = Pool::new(4);
        assert_eq!(oldest_first(&pool).len(), 4);
    }

    #[test]
    fn touch_moves_a_slot_to_the_newest_end() {
        let mut pool = Pool::new(3);
        let oldest = pool.oldest().unwrap();
        pool.touch(oldest);
        assert_ne!(pool.oldest().unwrap(), oldest);
        assert_eq!(oldest_first(&pool).last().copied(), Some(oldest));
    }

    #[test]
    fn unlink_and_relink_preserve_list_integrity() {
        let mut pool = Pool::new(3);
        let middle = oldest_first(&pool)[1];
        pool.unlink_lru(middle);
        assert_eq!(oldest_first(&pool).len(), 2);
        pool.link_oldest(middle);
        assert_eq!(oldest_first(&pool)[0], middle);
    }

    #[test]
    fn recycle_bumps_the_generation_tag() {
        let mut pool = Pool::new(1);
        let handle = pool.handle(0);
        assert_eq!(pool.slot(0).generation, 0);
        pool.recycle(0);
        assert_eq!(pool.slot(0).generation, 1);
        assert!(pool.get(handle).is_none());
    }
}

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

//! The hash index: a power-of-two array of chain heads over the record
//! pool.
//!
//! Every chain obeys one ordering invariant that the rest of the
//! engine depends on for early exit: all reverse-mapping records come
//! first, then mortal non-reverse records, then immortal non-reverse
//! records. Address lookups scan only the reverse prefix of each
//! chain, and expiry-minded walks can stop once they reach the
//! immortal tail. All chain mutation goes through [`HashIndex::link`],
//! [`HashIndex::unlink`], and [`HashIndex::promote`] so that no call
//! site can splice links in a way that breaks the ordering.

use lazy_static::lazy_static;

use super::pool::Pool;
use super::record::Flags;

/// The smallest bucket array the index will use.
const MIN_BUCKETS: usize = 64;

////////////////////////////////////////////////////////////////////////
// NAME HASHING                                                       //
////////////////////////////////////////////////////////////////////////

lazy_static! {
    /// A 64-entry mixing table generated from a fixed xorshift seed.
    /// The exact constants carry no external contract; the table only
    /// has to be well distributed and stable for the process lifetime.
    static ref MIX_TABLE: [u32; 64] = {
        let mut state: u32 = 0x9e37_79b9;
        let mut table = [0u32; 64];
        for entry in table.iter_mut() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *entry = state;
        }
        table
    };
}

/// Hashes a name, folding ASCII case so that `WWW.Example.COM` and
/// `www.example.com` land in the same bucket.
pub(super) fn hash_name(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        let byte = byte.to_ascii_lowercase();
        hash ^= MIX_TABLE[(hash as usize ^ byte as usize) & 63];
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

////////////////////////////////////////////////////////////////////////
// CHAIN REGIONS                                                      //
////////////////////////////////////////////////////////////////////////

/// A record's position class within its chain: reverse records first
/// (0), then mortal non-reverse (1), then immortal non-reverse (2).
fn region(flags: Flags) -> u8 {
    if flags.contains(Flags::REVERSE) {
        0
    } else if flags.contains(Flags::IMMORTAL) {
        2
    } else {
        1
    }
}

fn slot_region(pool: &Pool, idx: u32) -> u8 {
    match pool.slot(idx).record.as_ref() {
        Some(record) => region(record.flags()),
        None => 1,
    }
}

////////////////////////////////////////////////////////////////////////
// THE INDEX                                                          //
////////////////////////////////////////////////////////////////////////

pub(super) struct HashIndex {
    buckets: Vec<Option<u32>>,
}

impl HashIndex {
    /// Creates an index with at least `buckets` chain heads, rounded
    /// up to a power of two and clamped to [`MIN_BUCKETS`].
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: vec![None; buckets.next_power_of_two().max(MIN_BUCKETS)],
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the bucket a name belongs to.
    pub fn bucket_for(&self, name: &str) -> u32 {
        hash_name(name) & (self.buckets.len() as u32 - 1)
    }

    /// Returns the head of a bucket's chain.
    pub fn head(&self, bucket: u32) -> Option<u32> {
        self.buckets[bucket as usize]
    }

    /// Discards all chains and resizes the bucket array. Used by the
    /// rehash path, which relinks every record afterwards.
    pub fn reset(&mut self, buckets: usize) {
        self.buckets.clear();
        self.buckets
            .resize(buckets.next_power_of_two().max(MIN_BUCKETS), None);
    }

    /// Picks the bucket count to use for an expected occupancy of
    /// `target` records.
    pub fn size_for(target: usize) -> usize {
        (target / 4).next_power_of_two().max(MIN_BUCKETS)
    }

    /// Inserts a slot into a bucket's chain at the head of its region:
    /// reverse records go to the chain head, mortal non-reverse records
    /// go after the reverse prefix, and immortal non-reverse records
    /// are appended at the tail.
    pub fn link(&mut self, pool: &mut Pool, idx: u32, bucket: u32) {
        debug_assert!(pool.slot(idx).bucket.is_none());
        let own_region = slot_region(pool, idx);
        let mut prev = None;
        let mut cur = self.buckets[bucket as usize];
        while let Some(at) = cur {
            let at_region = slot_region(pool, at);
            let insert_here = match own_region {
                0 => true,
                1 => at_region >= 1,
                _ => false,
            };
            if insert_here {
                break;
            }
            prev = Some(at);
            cur = pool.slot(at).chain_next;
        }
        {
            let slot = pool.slot_mut(idx);
            slot.chain_next = cur;
            slot.bucket = Some(bucket);
        }
        match prev {
            Some(prev) => pool.slot_mut(prev).chain_next = Some(idx),
            None => self.buckets[bucket as usize] = Some(idx),
        }
    }

    /// Removes a slot from its chain. No-op if the slot is not linked.
    pub fn unlink(&mut self, pool: &mut Pool, idx: u32) {
        let Some(bucket) = pool.slot(idx).bucket else {
            return;
        };
        let next = pool.slot(idx).chain_next;
        let mut prev = None;
        let mut cur = self.buckets[bucket as usize];
        while let Some(at) = cur {
            if at == idx {
                match prev {
                    Some(prev) => pool.slot_mut(prev).chain_next = next,
                    None => self.buckets[bucket as usize] = next,
                }
                break;
            }
            prev = Some(at);
            cur = pool.slot(at).chain_next;
        }
        let slot = pool.slot_mut(idx);
        slot.bucket = None;
        slot.chain_next = None;
    }

    /// Splices a just-matched slot to the most preferred position in
    /// its chain — the head of its region — so that repeated identical
    /// queries rotate through equivalent records. Immortal non-reverse
    /// records keep their position: the chain tail has no preferred
    /// slot.
    pub fn promote(&mut self, pool: &mut Pool, idx: u32) {
        let Some(bucket) = pool.slot(idx).bucket else {
            return;
        };
        if slot_region(pool, idx) == 2 {
            return;
        }
        self.unlink(pool, idx);
        self.link(pool, idx, bucket);
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use arrayvec::ArrayString;

    use super::super::pool::Pool;
    use super::super::record::{CacheRecord, Expiry, Flags, NameBuf, Payload};
    use super::{slot_region, HashIndex};
    use crate::time::Timestamp;

    /// Fills the next free pool slot with a minimal record carrying
    /// `flags` and returns its index.
    fn place(pool: &mut Pool, idx: u32, flags: Flags) -> u32 {
        pool.slot_mut(idx).record = Some(CacheRecord {
            name: NameBuf::Inline(ArrayString::new()),
            payload: Payload::Negative,
            flags,
            expiry: Expiry::At(Timestamp::from(0)),
            source: None,
        });
        pool.unlink_lru(idx);
        idx
    }

    fn chain_regions(index: &HashIndex, pool: &Pool, bucket: u32) -> Vec<u8> {
        let mut regions = Vec::new();
        let mut cur = index.head(bucket);
        while let Some(idx) = cur {
            regions.push(slot_region(pool, idx));
            cur = pool.slot(idx).chain_next;
        }
        regions
    }

    #[test]
    fn link_keeps_chains_ordered_by_region() {
        let mut pool = Pool::new(6);
        let mut index = HashIndex::new(1);
        let records = [
            Flags::FORWARD | Flags::IPV4,
            Flags::REVERSE | Flags::IPV4,
            Flags::FORWARD | Flags::IMMORTAL,
            Flags::FORWARD | Flags::IPV6,
            Flags::REVERSE | Flags::FORWARD | Flags::IMMORTAL,
            Flags::FORWARD | Flags::IMMORTAL,
        ];
        for (idx, &flags) in records.iter().enumerate() {
            let idx = place(&mut pool, idx as u32, flags);
            index.link(&mut pool, idx, 0);
        }
        assert_eq!(chain_regions(&index, &pool, 0), vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn unlink_removes_from_any_position() {
        let mut pool = Pool::new(3);
        let mut index = HashIndex::new(1);
        for idx in 0..3 {
            let idx = place(&mut pool, idx, Flags::FORWARD | Flags::IPV4);
            index.link(&mut pool, idx, 0);
        }
        index.unlink(&mut pool, 1);
        assert_eq!(chain_regions(&index, &pool, 0).len(), 2);
        assert!(pool.slot(1).bucket.is_none());
        index.unlink(&mut pool, 1); // second unlink is a no-op
        assert_eq!(chain_regions(&index, &pool, 0).len(), 2);
    }

    #[test]
    fn promote_moves_to_region_head_without_breaking_order() {
        let mut pool = Pool::new(4);
        let mut index = HashIndex::new(1);
        let reverse = place(&mut pool, 0, Flags::REVERSE | Flags::IPV4);
        index.link(&mut pool, reverse, 0);
        for idx in 1..4 {
            let idx = place(&mut pool, idx, Flags::FORWARD | Flags::IPV4);
            index.link(&mut pool, idx, 0);
        }
        // The last mortal record in the chain is promoted to the head
        // of the mortal region, leaving the reverse prefix alone.
        let mut cur = index.head(0).unwrap();
        while let Some(next) = pool.slot(cur).chain_next {
            cur = next;
        }
        let last = cur;
        index.promote(&mut pool, last);
        assert_eq!(index.head(0), Some(reverse));
        assert_eq!(pool.slot(reverse).chain_next, Some(last));
        assert_eq!(chain_regions(&index, &pool, 0), vec![0, 1, 1, 1]);
    }

    #[test]
    fn hashing_folds_ascii_case() {
        assert_eq!(
            super::hash_name("WWW.Example.COM"),
            super::hash_name("www.example.com")
        );
        assert_ne!(
            super::hash_name("www.example.com"),
            super::hash_name("www.example.org")
        );
    }
}

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

//! The overflow name arena ("bigname" pool).
//!
//! Names too long for a record's inline buffer are stored here in
//! fixed-size blocks. Blocks are held in a [`Slab`] whose values are
//! inline [`ArrayString`]s: freeing a block vacates the slab entry
//! without returning anything to the system allocator, and the next
//! allocation reuses it in place. Growth is bounded by a budget derived
//! from the overall cache capacity; once the budget is reached, further
//! long names fail allocation, which the insertion path reports as
//! [`InsertError::NoMemory`](super::InsertError::NoMemory).

use arrayvec::ArrayString;
use slab::Slab;

use super::record::MAX_NAME_LEN;

/// The overflow name arena.
pub(super) struct BignamePool {
    blocks: Slab<ArrayString<MAX_NAME_LEN>>,
    budget: usize,
}

impl BignamePool {
    /// Creates a pool permitting at most `budget` blocks in use at
    /// once. No blocks are allocated up front; the slab grows on demand
    /// up to the budget and is never shrunk.
    pub fn new(budget: usize) -> Self {
        Self {
            blocks: Slab::new(),
            budget,
        }
    }

    /// Stores `name` in a block, reusing a free one if possible.
    /// Returns `None` if the budget is exhausted or the name does not
    /// fit in a block.
    pub fn alloc(&mut self, name: &str) -> Option<usize> {
        if self.blocks.len() >= self.budget {
            return None;
        }
        let block = ArrayString::from(name).ok()?;
        Some(self.blocks.insert(block))
    }

    /// Returns a block to the free list. The storage stays with the
    /// pool for reuse.
    pub fn free(&mut self, key: usize) {
        self.blocks.remove(key);
    }

    /// Returns the name stored in a block.
    pub fn get(&self, key: usize) -> &str {
        &self.blocks[key]
    }

    /// Returns the number of blocks currently in use.
    pub fn in_use(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the pool's block budget.
    pub fn budget(&self) -> usize {
        self.budget
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

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

//! Implementation of the [`InsertError`] type for insertion failures.

use std::fmt;

/// Errors that arise while staging a record into the cache.
///
/// All variants are local, recoverable conditions. The engine never
/// terminates the process on any of them, and none of them leaves the
/// table in an inconsistent state. [`NoSpace`](Self::NoSpace) and
/// [`NoMemory`](Self::NoMemory) poison the in-progress insertion batch:
/// subsequent [`insert`](super::Cache::insert) calls fail immediately
/// and [`commit_insert`](super::Cache::commit_insert) discards every
/// staged record. [`Conflict`](Self::Conflict) fails only the specific
/// record; the caller may continue the rest of the batch.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InsertError {
    /// The record pool is exhausted and no evictable or expired victim
    /// could be found, even after a full expiry sweep.
    NoSpace,

    /// The overflow name arena could not store the record's name,
    /// either because its budget is exhausted or because the name is
    /// too long to store at all.
    NoMemory,

    /// The insertion would overwrite a statically configured
    /// (non-evictable) record with different data. Static data is never
    /// overwritten by dynamic answers.
    Conflict,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NoSpace => f.write_str("the record pool has no reusable entry"),
            Self::NoMemory => f.write_str("the overflow name arena could not store the name"),
            Self::Conflict => {
                f.write_str("the record would overwrite static data with different values")
            }
        }
    }
}

impl std::error::Error for InsertError {}

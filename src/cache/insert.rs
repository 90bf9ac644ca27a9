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

//! The insertion transaction: staging, scavenging, slot acquisition,
//! and commit.
//!
//! The records of one inbound DNS answer — including a CNAME chain —
//! are staged on a singly linked buffer, invisible to lookups, and
//! become visible all at once at commit. An aborted or abandoned batch
//! is unwound by the next [`Cache::begin_insert`], so a crashed caller
//! can never leave half an answer in the table.

use std::net::IpAddr;

use log::{debug, warn};

use super::record::NameBuf;
use super::{Cache, CacheRecord, Expiry, Flags, InsertError, Payload, RecordHandle, MAX_NAME_LEN};
use crate::time::{Timestamp, Ttl};
use crate::util::Caseless;

/// An upper bound on slot-acquisition retries. The acquisition loop
/// terminates after at most one full expiry sweep plus one forced
/// eviction; more iterations than that means freed storage is not
/// being recovered, and we fail the insertion rather than spin.
const MAX_ACQUIRE_ATTEMPTS: u32 = 4;

impl Cache {
    /// Starts an insertion batch, unwinding any records left staged by
    /// an incomplete prior batch. A correct caller always commits what
    /// it starts; the engine tolerates one that did not.
    pub fn begin_insert(&mut self) {
        let mut unwound = 0;
        let mut cur = self.staged_head.take();
        self.staged_tail = None;
        while let Some(idx) = cur {
            cur = self.pool.slot_mut(idx).chain_next.take();
            self.free_slot(idx);
            unwound += 1;
        }
        if unwound > 0 {
            debug!("unwound {} records staged by an unfinished batch", unwound);
            self.counters.txn_aborts += 1;
        }
        self.txn_error = None;
    }

    /// Stages one record for insertion. The record is invisible to
    /// lookups until [`commit_insert`](Self::commit_insert).
    ///
    /// Flags describing the payload (address family, CNAME, key,
    /// negative) are derived from the payload itself; the caller
    /// supplies direction, provenance-free lifecycle flags
    /// ([`Flags::IMMORTAL`], [`Flags::NXDOMAIN`]), and for negative
    /// records the family being negated. The TTL is stored as an
    /// absolute expiry against `now`, except for immortal records,
    /// which keep it as a re-advertisement TTL.
    ///
    /// On [`InsertError::NoSpace`] or [`InsertError::NoMemory`] the
    /// whole batch is poisoned: further calls fail immediately and
    /// commit discards everything staged so far.
    /// [`InsertError::Conflict`] fails only this record.
    pub fn insert(
        &mut self,
        name: &str,
        payload: Payload,
        now: Timestamp,
        ttl: Ttl,
        flags: Flags,
    ) -> Result<RecordHandle, InsertError> {
        if let Some(error) = self.txn_error {
            return Err(error);
        }
        let mut flags = flags;
        match payload {
            Payload::Addr(IpAddr::V4(_)) => flags |= Flags::IPV4,
            Payload::Addr(IpAddr::V6(_)) => flags |= Flags::IPV6,
            Payload::Alias(_) | Payload::InterfaceName(_) => flags |= Flags::CNAME,
            Payload::Key(_) => flags |= Flags::KEY,
            Payload::Negative => flags |= Flags::NEG,
        }
        if !flags.intersects(Flags::FORWARD | Flags::REVERSE) {
            flags |= Flags::FORWARD;
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            self.txn_error = Some(InsertError::NoMemory);
            return Err(InsertError::NoMemory);
        }

        let bucket = self.bucket_for(name);
        if let Some(existing) = self.scavenge(bucket, name, &payload, flags, now)? {
            // Identical static data already present: no-op success.
            return Ok(existing);
        }
        let idx = match self.acquire_slot(now) {
            Ok(idx) => idx,
            Err(error) => {
                self.txn_error = Some(error);
                return Err(error);
            }
        };
        let name_buf = match self.store_name(name) {
            Some(buf) => buf,
            None => {
                // The slot was only detached from the recency list;
                // give it back.
                self.pool.link_oldest(idx);
                self.counters.alloc_failures += 1;
                self.txn_error = Some(InsertError::NoMemory);
                return Err(InsertError::NoMemory);
            }
        };
        let expiry = if flags.contains(Flags::IMMORTAL) {
            Expiry::Never(ttl)
        } else {
            Expiry::At(now + ttl)
        };
        self.pool.slot_mut(idx).record = Some(CacheRecord {
            name: name_buf,
            payload,
            flags,
            expiry,
            source: None,
        });
        self.stage_push(idx);
        self.counters.insertions += 1;
        Ok(self.pool.handle(idx))
    }

    /// Points a staged alias record at its target, which may itself be
    /// a record staged in the same batch. Returns `false` if either
    /// handle has gone stale or the alias is not an alias. An alias
    /// whose target is never resolved is discarded silently at commit.
    pub fn resolve_alias(&mut self, alias: RecordHandle, target: RecordHandle) -> bool {
        if self.pool.get(target).is_none() {
            return false;
        }
        if self.pool.slot(alias.index).generation != alias.generation {
            return false;
        }
        match self.pool.slot_mut(alias.index).record.as_mut() {
            Some(record) => match &mut record.payload {
                Payload::Alias(slot) => {
                    *slot = Some(target);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Commits the staged batch, making its records visible to
    /// lookups. Aliases whose target was never resolved within the
    /// batch (a dangling forward reference — normal when an upstream
    /// chain lookup failed) are discarded silently. If the batch was
    /// poisoned by `NoSpace`/`NoMemory`, every staged record is
    /// discarded instead.
    pub fn commit_insert(&mut self) {
        let poisoned = self.txn_error.take().is_some();
        let mut cur = self.staged_head.take();
        self.staged_tail = None;
        let mut dropped = 0;
        while let Some(idx) = cur {
            cur = self.pool.slot_mut(idx).chain_next.take();
            let keep = !poisoned
                && match self.pool.slot(idx).record.as_ref() {
                    Some(record) => match &record.payload {
                        Payload::Alias(None) => false,
                        Payload::Alias(Some(target)) => self.pool.get(*target).is_some(),
                        Payload::InterfaceName(weak) => weak.strong_count() > 0,
                        _ => true,
                    },
                    None => false,
                };
            if !keep {
                self.free_slot(idx);
                dropped += 1;
                continue;
            }
            let bucket = self.bucket_for(self.name_of_slot(idx));
            let evictable = !self
                .pool
                .slot(idx)
                .record
                .as_ref()
                .is_some_and(|r| r.flags.is_static());
            self.commit_slot(idx, bucket, evictable);
        }
        if poisoned {
            self.counters.txn_aborts += 1;
            debug!("discarded {} staged records from a failed batch", dropped);
        }
        self.maybe_grow();
    }

    ////////////////////////////////////////////////////////////////////
    // SCAVENGING                                                     //
    ////////////////////////////////////////////////////////////////////

    /// The pre-insertion pass: purges dead records and frees records
    /// the new data supersedes. Forward data supersedes by name within
    /// the target bucket; reverse data supersedes by address, which
    /// requires a sweep of every bucket's reverse prefix so that one
    /// address maps back to one name. Returns `Ok(Some(handle))` if an
    /// identical static record makes the insertion a no-op,
    /// `Err(Conflict)` if the insertion would contradict static data,
    /// and `Ok(None)` to proceed.
    fn scavenge(
        &mut self,
        bucket: u32,
        name: &str,
        payload: &Payload,
        flags: Flags,
        now: Timestamp,
    ) -> Result<Option<RecordHandle>, InsertError> {
        let mut existing = None;
        let mut conflict = false;
        if flags.contains(Flags::REVERSE) {
            if let Some(addr) = payload.addr() {
                self.scavenge_reverse(addr, name, now, &mut existing, &mut conflict);
            }
        }
        let mut cur = self.index.head(bucket);
        while let Some(idx) = cur {
            let next = self.pool.slot(idx).chain_next;
            if self.record_is_dead(idx, now) {
                self.counters.expired_purged += 1;
                self.free_slot(idx);
                cur = next;
                continue;
            }
            let (superseded, is_static, identical) = match self.pool.slot(idx).record.as_ref() {
                Some(record) => (
                    flags.contains(Flags::FORWARD)
                        && Caseless(self.name_of_slot(idx)) == Caseless(name)
                        && supersedes(record.flags, flags),
                    record.flags.is_static(),
                    payload_equal(&record.payload, payload),
                ),
                None => (false, false, false),
            };
            if superseded {
                if is_static {
                    if identical {
                        existing = Some(self.pool.handle(idx));
                    } else {
                        conflict = true;
                    }
                } else {
                    // Old dynamic data for the same name and kind is
                    // replaced by the incoming record.
                    self.free_slot(idx);
                }
            }
            cur = next;
        }
        if let Some(handle) = existing {
            // Re-inserting data a static record already provides is a
            // no-op even if another static record conflicts.
            return Ok(Some(handle));
        }
        if conflict {
            self.counters.conflicts += 1;
            return Err(InsertError::Conflict);
        }
        Ok(None)
    }

    /// The address half of the scavenge pass: walks the reverse prefix
    /// of every chain and frees non-static records mapping `addr`. A
    /// static record for the address is a no-op if it carries the same
    /// name and a conflict otherwise, mirroring the forward path.
    fn scavenge_reverse(
        &mut self,
        addr: IpAddr,
        name: &str,
        now: Timestamp,
        existing: &mut Option<RecordHandle>,
        conflict: &mut bool,
    ) {
        for bucket in 0..self.index.bucket_count() as u32 {
            let mut cur = self.index.head(bucket);
            while let Some(idx) = cur {
                let next = self.pool.slot(idx).chain_next;
                let reverse = self
                    .pool
                    .slot(idx)
                    .record
                    .as_ref()
                    .is_some_and(|r| r.flags.contains(Flags::REVERSE));
                if !reverse {
                    break;
                }
                if self.record_is_dead(idx, now) {
                    self.counters.expired_purged += 1;
                    self.free_slot(idx);
                    cur = next;
                    continue;
                }
                let (same_addr, is_static, same_name) =
                    match self.pool.slot(idx).record.as_ref() {
                        Some(record) => (
                            record.payload.addr() == Some(addr),
                            record.flags.is_static(),
                            Caseless(self.name_of_slot(idx)) == Caseless(name),
                        ),
                        None => (false, false, false),
                    };
                if same_addr {
                    if is_static {
                        if same_name {
                            *existing = Some(self.pool.handle(idx));
                        } else {
                            *conflict = true;
                        }
                    } else {
                        self.free_slot(idx);
                    }
                }
                cur = next;
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // SLOT ACQUISITION                                               //
    ////////////////////////////////////////////////////////////////////

    /// Draws a reusable slot, oldest first. Prefers free or expired
    /// storage: if the oldest slot is a live unexpired record, one
    /// table-wide expiry sweep is tried before falling back to evicting
    /// the least recently used record outright. Fails with `NoSpace`
    /// when nothing is reusable (everything in use is static or staged)
    /// or — defensively — when freed storage repeatedly fails to turn
    /// up at the old end of the recency list.
    pub(super) fn acquire_slot(&mut self, now: Timestamp) -> Result<u32, InsertError> {
        let mut swept = false;
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let Some(oldest) = self.pool.oldest() else {
                self.counters.alloc_failures += 1;
                return Err(InsertError::NoSpace);
            };
            if self.pool.slot(oldest).record.is_none() {
                self.pool.unlink_lru(oldest);
                return Ok(oldest);
            }
            if self.record_is_dead(oldest, now) {
                self.counters.expired_purged += 1;
                self.free_slot(oldest);
                continue;
            }
            if !swept {
                self.purge_expired_all(now);
                swept = true;
                continue;
            }
            // Nothing expired anywhere: evict the least recently used
            // live record.
            if !self.pressure_warned {
                warn!("cache is full; evicting unexpired entries (consider a larger capacity)");
                self.pressure_warned = true;
            }
            self.counters.live_evictions += 1;
            self.free_slot(oldest);
        }
        warn!("cache slot recovery failed after a full sweep; rejecting insertion");
        self.counters.alloc_failures += 1;
        Err(InsertError::NoSpace)
    }

    fn stage_push(&mut self, idx: u32) {
        self.pool.slot_mut(idx).chain_next = None;
        match self.staged_tail {
            Some(tail) => self.pool.slot_mut(tail).chain_next = Some(idx),
            None => self.staged_head = Some(idx),
        }
        self.staged_tail = Some(idx);
    }
}

/// Returns whether an existing record covers the same ground as an
/// incoming one with flags `new`: they serve the same direction and
/// either share an address family or key kind, or one of them is an
/// alias (which redirects the whole name).
fn supersedes(existing: Flags, new: Flags) -> bool {
    if !(existing & new).intersects(Flags::FORWARD | Flags::REVERSE) {
        return false;
    }
    if (existing & new).intersects(Flags::IPV4 | Flags::IPV6 | Flags::KEY) {
        return true;
    }
    new.contains(Flags::FORWARD)
        && (existing.contains(Flags::CNAME) || new.contains(Flags::CNAME))
}

/// Functional equality for the static no-op check: only address
/// payloads compare equal, since static records are address records.
fn payload_equal(a: &Payload, b: &Payload) -> bool {
    match (a, b) {
        (Payload::Addr(a), Payload::Addr(b)) => a == b,
        _ => false,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;

    use super::super::{Cache, CacheConfig, Flags, InsertError, Payload, SourceKind, StaticEntry};
    use crate::time::{Timestamp, Ttl};

    fn cache(capacity: usize) -> Cache {
        Cache::new(CacheConfig {
            capacity,
            ..Default::default()
        })
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn entry(name: &str, a: &str) -> StaticEntry {
        StaticEntry {
            name: Arc::from(name),
            addr: addr(a),
            ttl: Ttl::from(0),
        }
    }

    fn first_addr(cache: &mut Cache, name: &str, now: Timestamp) -> Option<IpAddr> {
        cache
            .lookup_by_name(name, now, Flags::FORWARD | Flags::IPV4 | Flags::IPV6)
            .next()
            .and_then(|found| found.record.payload().addr())
    }

    #[test]
    fn conflict_with_static_data_fails_only_that_record() {
        let mut cache = cache(16);
        let now = Timestamp::from(1000);
        let source = cache.register_source(SourceKind::HostsFile, "/etc/hosts");
        cache
            .bulk_load(source, now, vec![entry("pinned.example.com", "192.0.2.1")])
            .unwrap();

        cache.begin_insert();
        let conflict = cache.insert(
            "pinned.example.com",
            Payload::Addr(addr("192.0.2.99")),
            now,
            Ttl::from(60),
            Flags::FORWARD,
        );
        assert_eq!(conflict, Err(InsertError::Conflict));
        // The batch is not poisoned: an unrelated record still goes in.
        cache
            .insert(
                "other.example.com",
                Payload::Addr(addr("192.0.2.2")),
                now,
                Ttl::from(60),
                Flags::FORWARD,
            )
            .unwrap();
        cache.commit_insert();

        assert_eq!(
            first_addr(&mut cache, "other.example.com", now),
            Some(addr("192.0.2.2"))
        );
        // Static data survives with its original address.
        assert_eq!(
            first_addr(&mut cache, "pinned.example.com", now),
            Some(addr("192.0.2.1"))
        );
    }

    #[test]
    fn reinserting_identical_static_data_is_a_noop_success() {
        let mut cache = cache(16);
        let now = Timestamp::from(0);
        let source = cache.register_source(SourceKind::HostsFile, "/etc/hosts");
        cache
            .bulk_load(source, now, vec![entry("pinned.example.com", "192.0.2.1")])
            .unwrap();
        let live_before = cache.live();

        cache.begin_insert();
        let handle = cache
            .insert(
                "pinned.example.com",
                Payload::Addr(addr("192.0.2.1")),
                now,
                Ttl::from(60),
                Flags::FORWARD,
            )
            .unwrap();
        cache.commit_insert();

        // No new record was created; the handle names the static one.
        assert_eq!(cache.live(), live_before);
        assert!(cache.record(handle).unwrap().flags().is_static());
    }

    #[test]
    fn no_memory_poisons_the_rest_of_the_batch() {
        let mut cache = Cache::new(CacheConfig {
            capacity: 16,
            bigname_budget: Some(1),
            ..Default::default()
        });
        let now = Timestamp::from(0);
        let long_a = format!("{}.example.com", "a".repeat(80));
        let long_b = format!("{}.example.com", "b".repeat(80));

        cache.begin_insert();
        cache
            .insert(
                &long_a,
                Payload::Addr(addr("192.0.2.1")),
                now,
                Ttl::from(60),
                Flags::FORWARD,
            )
            .unwrap();
        assert_eq!(
            cache.insert(
                &long_b,
                Payload::Addr(addr("192.0.2.2")),
                now,
                Ttl::from(60),
                Flags::FORWARD,
            ),
            Err(InsertError::NoMemory)
        );
        // Poisoned: even a short name is now rejected.
        assert_eq!(
            cache.insert(
                "short.example.com",
                Payload::Addr(addr("192.0.2.3")),
                now,
                Ttl::from(60),
                Flags::FORWARD,
            ),
            Err(InsertError::NoMemory)
        );
        cache.commit_insert();

        // The failed batch committed nothing, including the record
        // staged before the failure.
        assert_eq!(first_addr(&mut cache, &long_a, now), None);
        assert_eq!(cache.live(), 0);

        // A fresh batch works again, reusing the freed bigname block.
        cache.begin_insert();
        cache
            .insert(
                &long_b,
                Payload::Addr(addr("192.0.2.2")),
                now,
                Ttl::from(60),
                Flags::FORWARD,
            )
            .unwrap();
        cache.commit_insert();
        assert_eq!(first_addr(&mut cache, &long_b, now), Some(addr("192.0.2.2")));
    }

    #[test]
    fn a_reverse_insert_replaces_the_old_name_for_its_address() {
        let mut cache = cache(16);
        let now = Timestamp::from(0);
        cache.begin_insert();
        cache
            .insert(
                "old-name.example.com",
                Payload::Addr(addr("192.0.2.7")),
                now,
                Ttl::from(300),
                Flags::REVERSE,
            )
            .unwrap();
        cache.commit_insert();

        cache.begin_insert();
        cache
            .insert(
                "new-name.example.com",
                Payload::Addr(addr("192.0.2.7")),
                now,
                Ttl::from(300),
                Flags::REVERSE,
            )
            .unwrap();
        cache.commit_insert();

        // The old mapping was superseded table-wide; the address
        // resolves to exactly one name.
        let names: Vec<String> = cache
            .lookup_by_addr(addr("192.0.2.7"), now, Flags::empty())
            .map(|found| found.name.to_owned())
            .collect();
        assert_eq!(names, vec!["new-name.example.com"]);
    }

    #[test]
    fn reverse_inserts_never_displace_static_address_mappings() {
        let mut cache = cache(16);
        let now = Timestamp::from(0);
        let source = cache.register_source(SourceKind::DhcpLeases, "lease table");
        cache
            .bulk_load(source, now, vec![entry("printer.lan", "10.0.0.2")])
            .unwrap();

        cache.begin_insert();
        assert_eq!(
            cache.insert(
                "imposter.lan",
                Payload::Addr(addr("10.0.0.2")),
                now,
                Ttl::from(60),
                Flags::REVERSE,
            ),
            Err(InsertError::Conflict)
        );
        cache.commit_insert();

        let names: Vec<String> = cache
            .lookup_by_addr(addr("10.0.0.2"), now, Flags::empty())
            .map(|found| found.name.to_owned())
            .collect();
        assert_eq!(names, vec!["printer.lan"]);
    }

    #[test]
    fn superseded_dynamic_data_is_replaced() {
        let mut cache = cache(16);
        let now = Timestamp::from(0);
        cache.begin_insert();
        cache
            .insert(
                "www.example.com",
                Payload::Addr(addr("192.0.2.1")),
                now,
                Ttl::from(300),
                Flags::FORWARD,
            )
            .unwrap();
        cache.commit_insert();

        cache.begin_insert();
        cache
            .insert(
                "www.example.com",
                Payload::Addr(addr("192.0.2.2")),
                now,
                Ttl::from(300),
                Flags::FORWARD,
            )
            .unwrap();
        cache.commit_insert();

        let mut matches = cache.lookup_by_name(
            "www.example.com",
            now,
            Flags::FORWARD | Flags::IPV4,
        );
        assert_eq!(
            matches.next().unwrap().record.payload().addr(),
            Some(addr("192.0.2.2"))
        );
        assert!(matches.next().is_none());
    }
}

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

//! The lookup/promotion engine: the cache's read path.
//!
//! A lookup walks the relevant chain(s) once, opportunistically
//! returning dead records (expired, or holding a stale alias
//! reference) to the pool along the way, and collects the usable
//! matches into a cursor. Dynamic hits are promoted: every hit moves
//! to the newest end of the recency list, and the last-swept hit is
//! spliced to the preferred position in its bucket, which rotates
//! equivalent records across repeated identical queries.

use std::iter::FusedIterator;
use std::net::IpAddr;

use super::{Cache, CacheRecord, Flags, RecordHandle};
use crate::time::Timestamp;
use crate::util::Caseless;

////////////////////////////////////////////////////////////////////////
// MATCH CURSORS                                                      //
////////////////////////////////////////////////////////////////////////

/// One record returned by a lookup.
pub struct Found<'a> {
    pub handle: RecordHandle,
    pub name: &'a str,
    pub record: &'a CacheRecord,
}

/// A cursor over the records matched by one lookup. The sweep happened
/// when the cursor was created; advancing it only dereferences the
/// collected handles, in an order that is stable for the lifetime of
/// the cursor.
pub struct Matches<'a> {
    cache: &'a Cache,
    handles: Vec<RecordHandle>,
    pos: usize,
}

impl<'a> Iterator for Matches<'a> {
    type Item = Found<'a>;

    fn next(&mut self) -> Option<Found<'a>> {
        while self.pos < self.handles.len() {
            let handle = self.handles[self.pos];
            self.pos += 1;
            if let Some(record) = self.cache.record(handle) {
                return Some(Found {
                    handle,
                    name: self.cache.name_of_slot(handle.index),
                    record,
                });
            }
        }
        None
    }
}

impl FusedIterator for Matches<'_> {}

////////////////////////////////////////////////////////////////////////
// LOOKUPS                                                            //
////////////////////////////////////////////////////////////////////////

impl Cache {
    /// Finds all usable records for `name` matching the required-flags
    /// mask: the direction bit(s), the address families or record
    /// kinds wanted, and [`Flags::NEG`] if negative results are
    /// acceptable. CNAME records match any forward query, since an
    /// alias redirects the whole name; follow them with
    /// [`cname_target`](Self::cname_target).
    ///
    /// Expired records and records holding stale alias references are
    /// purged from the walked chain as a side effect; a dangling alias
    /// is never returned as a match.
    pub fn lookup_by_name(&mut self, name: &str, now: Timestamp, flags: Flags) -> Matches<'_> {
        self.counters.name_lookups += 1;
        let bucket = self.bucket_for(name);
        let mut handles = Vec::new();
        let mut cur = self.index.head(bucket);
        while let Some(idx) = cur {
            let next = self.pool.slot(idx).chain_next;
            if self.record_is_dead(idx, now) {
                self.counters.expired_purged += 1;
                self.free_slot(idx);
                cur = next;
                continue;
            }
            let matched = match self.pool.slot(idx).record.as_ref() {
                Some(record) => {
                    flags_match(record.flags(), flags)
                        && !self.alias_is_stale(record)
                        && Caseless(self.name_of_slot(idx)) == Caseless(name)
                }
                None => false,
            };
            if matched {
                handles.push(self.pool.handle(idx));
            }
            cur = next;
        }
        if !handles.is_empty() {
            self.counters.hits += 1;
        }
        self.promote_hits(&handles, true);
        Matches {
            cache: self,
            handles,
            pos: 0,
        }
    }

    /// Finds all usable reverse-mapping records for `addr`. The chain
    /// ordering invariant keeps reverse records in a prefix of every
    /// chain, so this scans only those prefixes, sweeping dead records
    /// as it goes. Pass [`Flags::NEG`] in the mask to accept negative
    /// results.
    pub fn lookup_by_addr(&mut self, addr: IpAddr, now: Timestamp, flags: Flags) -> Matches<'_> {
        self.counters.addr_lookups += 1;
        let family = match addr {
            IpAddr::V4(_) => Flags::IPV4,
            IpAddr::V6(_) => Flags::IPV6,
        };
        let query = flags | Flags::REVERSE | family;
        let mut handles = Vec::new();
        for bucket in 0..self.index.bucket_count() as u32 {
            let mut cur = self.index.head(bucket);
            while let Some(idx) = cur {
                let next = self.pool.slot(idx).chain_next;
                let reverse = self
                    .pool
                    .slot(idx)
                    .record
                    .as_ref()
                    .is_some_and(|r| r.flags().contains(Flags::REVERSE));
                if !reverse {
                    // End of this chain's reverse prefix.
                    break;
                }
                if self.record_is_dead(idx, now) {
                    self.counters.expired_purged += 1;
                    self.free_slot(idx);
                    cur = next;
                    continue;
                }
                let matched = self.pool.slot(idx).record.as_ref().is_some_and(|record| {
                    flags_match(record.flags(), query)
                        && record.payload().addr() == Some(addr)
                });
                if matched {
                    handles.push(self.pool.handle(idx));
                }
                cur = next;
            }
        }
        if !handles.is_empty() {
            self.counters.hits += 1;
        }
        // Addresses are not subject to round-robin load spreading, so
        // hits get the recency touch but keep their chain position.
        self.promote_hits(&handles, false);
        Matches {
            cache: self,
            handles,
            pos: 0,
        }
    }

    /// Promotes matched dynamic records: every hit moves to the newest
    /// end of the recency list, and — when splicing is requested — the
    /// last hit in sweep order moves to the preferred position in its
    /// bucket. Splicing exactly one record per sweep is what makes
    /// repeated identical queries cycle through equivalent records;
    /// splicing them all would merely reverse the set each time.
    /// Static records stay where they are.
    fn promote_hits(&mut self, handles: &[RecordHandle], splice: bool) {
        let mut last_dynamic = None;
        for &handle in handles {
            let idx = handle.index;
            let is_static = self
                .pool
                .slot(idx)
                .record
                .as_ref()
                .is_some_and(|r| r.flags().is_static());
            if is_static {
                continue;
            }
            self.pool.touch(idx);
            last_dynamic = Some(idx);
        }
        if splice {
            if let Some(idx) = last_dynamic {
                self.index.promote(&mut self.pool, idx);
            }
        }
    }
}

/// Matches a record's flags against a lookup's required-flags mask.
fn flags_match(record: Flags, query: Flags) -> bool {
    if !(record & query).intersects(Flags::FORWARD | Flags::REVERSE) {
        return false;
    }
    if record.contains(Flags::NEG) && !query.contains(Flags::NEG) {
        return false;
    }
    if record.contains(Flags::CNAME) {
        return query.intersects(Flags::IPV4 | Flags::IPV6 | Flags::CNAME | Flags::KEY);
    }
    (record & query).intersects(Flags::IPV4 | Flags::IPV6 | Flags::KEY)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::super::{Cache, CacheConfig, Flags, Payload};
    use super::flags_match;
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

    fn insert_one(cache: &mut Cache, name: &str, payload: Payload, now: u64, ttl: u32, flags: Flags) {
        cache.begin_insert();
        cache
            .insert(name, payload, Timestamp::from(now), Ttl::from(ttl), flags)
            .unwrap();
        cache.commit_insert();
    }

    #[test]
    fn flag_matching_honors_direction_family_and_negativity() {
        let a_record = Flags::FORWARD | Flags::IPV4;
        assert!(flags_match(a_record, Flags::FORWARD | Flags::IPV4));
        assert!(!flags_match(a_record, Flags::FORWARD | Flags::IPV6));
        assert!(!flags_match(a_record, Flags::REVERSE | Flags::IPV4));

        let neg = Flags::FORWARD | Flags::IPV4 | Flags::NEG;
        assert!(!flags_match(neg, Flags::FORWARD | Flags::IPV4));
        assert!(flags_match(neg, Flags::FORWARD | Flags::IPV4 | Flags::NEG));

        // An alias redirects the whole name, regardless of family.
        let alias = Flags::FORWARD | Flags::CNAME;
        assert!(flags_match(alias, Flags::FORWARD | Flags::IPV6));
    }

    #[test]
    fn negative_records_need_explicit_opt_in() {
        let mut cache = cache(16);
        insert_one(
            &mut cache,
            "missing.example.com",
            Payload::Negative,
            0,
            60,
            Flags::FORWARD | Flags::IPV4 | Flags::NXDOMAIN,
        );
        let now = Timestamp::from(0);
        assert!(cache
            .lookup_by_name("missing.example.com", now, Flags::FORWARD | Flags::IPV4)
            .next()
            .is_none());
        let found = cache
            .lookup_by_name(
                "missing.example.com",
                now,
                Flags::FORWARD | Flags::IPV4 | Flags::NEG,
            )
            .next()
            .unwrap();
        assert!(found.record.flags().contains(Flags::NEG | Flags::NXDOMAIN));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut cache = cache(16);
        insert_one(
            &mut cache,
            "WWW.Example.COM",
            Payload::Addr(addr("192.0.2.1")),
            0,
            300,
            Flags::FORWARD,
        );
        let found = cache
            .lookup_by_name(
                "www.example.com",
                Timestamp::from(0),
                Flags::FORWARD | Flags::IPV4,
            )
            .next()
            .unwrap();
        assert_eq!(found.name, "WWW.Example.COM");
    }

    #[test]
    fn reverse_lookup_finds_the_name_for_an_address() {
        let mut cache = cache(16);
        insert_one(
            &mut cache,
            "host.example.com",
            Payload::Addr(addr("192.0.2.7")),
            0,
            300,
            Flags::REVERSE,
        );
        insert_one(
            &mut cache,
            "other.example.com",
            Payload::Addr(addr("192.0.2.8")),
            0,
            300,
            Flags::REVERSE,
        );
        let now = Timestamp::from(0);
        let mut matches = cache.lookup_by_addr(addr("192.0.2.7"), now, Flags::empty());
        assert_eq!(matches.next().unwrap().name, "host.example.com");
        assert!(matches.next().is_none());
        assert!(cache
            .lookup_by_addr(addr("192.0.2.9"), now, Flags::empty())
            .next()
            .is_none());
    }

    #[test]
    fn repeated_lookups_rotate_equivalent_records() {
        let mut cache = cache(16);
        let addrs = ["192.0.2.1", "192.0.2.2", "192.0.2.3"];
        // Three records for one name in a single batch: the supersede
        // pass only runs against committed records, so they coexist
        // like the multiple A records of one answer.
        cache.begin_insert();
        for a in addrs {
            cache
                .insert(
                    "multi.example.com",
                    Payload::Addr(addr(a)),
                    Timestamp::from(0),
                    Ttl::from(300),
                    Flags::FORWARD,
                )
                .unwrap();
        }
        cache.commit_insert();

        // One record is spliced to the preferred slot per sweep, so
        // three identical queries cycle every record through the front.
        let mut firsts = Vec::new();
        for _ in 0..3 {
            let order: Vec<_> = cache
                .lookup_by_name(
                    "multi.example.com",
                    Timestamp::from(0),
                    Flags::FORWARD | Flags::IPV4,
                )
                .map(|found| found.record.payload().addr().unwrap())
                .collect();
            assert_eq!(order.len(), 3);
            firsts.push(order[0]);
        }
        firsts.sort();
        firsts.dedup();
        assert_eq!(firsts.len(), 3);
    }
}

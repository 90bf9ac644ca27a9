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

//! Diagnostics: statistics counters and the cache dump.

use std::fmt::Write;

use super::record::Expiry;
use super::{Cache, Payload};
use crate::time::Timestamp;

/// The cache's internal event counters.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct Counters {
    pub insertions: u64,
    pub live_evictions: u64,
    pub expired_purged: u64,
    pub alloc_failures: u64,
    pub conflicts: u64,
    pub name_lookups: u64,
    pub addr_lookups: u64,
    pub hits: u64,
    pub txn_aborts: u64,
    pub rehashes: u64,
}

/// A point-in-time snapshot of cache statistics, for operator tooling
/// and periodic logging by the surrounding daemon.
#[derive(Clone, Copy, Debug)]
pub struct CacheStats {
    /// Configured record capacity.
    pub capacity: usize,
    /// Records currently visible to lookups.
    pub live: usize,
    /// Current hash bucket count.
    pub buckets: usize,
    /// Records staged by `insert` over the process lifetime.
    pub insertions: u64,
    /// Unexpired records evicted to make room for new ones. A steadily
    /// climbing value suggests the capacity is too small.
    pub live_evictions: u64,
    /// Dead records (expired, or stale alias references) returned to
    /// the pool by sweeps.
    pub expired_purged: u64,
    /// Insertions rejected for lack of a reusable slot or name block.
    pub alloc_failures: u64,
    /// Insertions rejected because they contradicted static data.
    pub conflicts: u64,
    pub name_lookups: u64,
    pub addr_lookups: u64,
    /// Lookups that returned at least one match.
    pub hits: u64,
    /// Insertion batches discarded uncommitted.
    pub txn_aborts: u64,
    /// Hash index rebuilds.
    pub rehashes: u64,
    /// Overflow name blocks in use.
    pub bignames_in_use: usize,
    /// Overflow name block budget.
    pub bigname_budget: usize,
}

impl Cache {
    /// Returns a snapshot of the engine's statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.pool.capacity(),
            live: self.live,
            buckets: self.index.bucket_count(),
            insertions: self.counters.insertions,
            live_evictions: self.counters.live_evictions,
            expired_purged: self.counters.expired_purged,
            alloc_failures: self.counters.alloc_failures,
            conflicts: self.counters.conflicts,
            name_lookups: self.counters.name_lookups,
            addr_lookups: self.counters.addr_lookups,
            hits: self.counters.hits,
            txn_aborts: self.counters.txn_aborts,
            rehashes: self.counters.rehashes,
            bignames_in_use: self.bignames.in_use(),
            bigname_budget: self.bignames.budget(),
        }
    }

    /// Renders every live record as text for operator tooling. Not
    /// performance-sensitive; walks the whole table without mutating
    /// it (expired records are annotated, not purged).
    pub fn dump_snapshot(&self, now: Timestamp) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "cache capacity {}, {} live records, {} hash buckets",
            stats.capacity, stats.live, stats.buckets
        );
        let _ = writeln!(
            out,
            "{} insertions, {} freed unexpired, {} expired purges, {} allocation failures",
            stats.insertions, stats.live_evictions, stats.expired_purged, stats.alloc_failures
        );
        let _ = writeln!(
            out,
            "{}/{} name lookups hit, {} reverse lookups, bignames {}/{}",
            stats.hits,
            stats.name_lookups,
            stats.addr_lookups,
            stats.bignames_in_use,
            stats.bigname_budget
        );
        let _ = writeln!(
            out,
            "{:<34} {:<30} {:>10} {:>12}",
            "name", "data", "flags", "expires"
        );
        for bucket in 0..self.index.bucket_count() as u32 {
            let mut cur = self.index.head(bucket);
            while let Some(idx) = cur {
                cur = self.pool.slot(idx).chain_next;
                let Some(record) = self.pool.slot(idx).record.as_ref() else {
                    continue;
                };
                let data = match record.payload() {
                    Payload::Addr(addr) => addr.to_string(),
                    Payload::Alias(Some(target)) => match self.pool.get(*target) {
                        Some(_) => format!("alias to {}", self.name_of_slot(target.index)),
                        None => String::from("alias (stale)"),
                    },
                    Payload::Alias(None) => String::from("alias (unresolved)"),
                    Payload::InterfaceName(weak) => match weak.upgrade() {
                        Some(name) => format!("interface {}", name),
                        None => String::from("interface (gone)"),
                    },
                    Payload::Key(blob) => format!("key material, {} octets", blob.len()),
                    Payload::Negative => String::from("no data"),
                };
                let expires = match record.expiry() {
                    Expiry::At(_) if record.is_expired(now) => String::from("expired"),
                    Expiry::At(at) => format!("+{}s", at.seconds_after(now)),
                    Expiry::Never(ttl) => format!("never/{}", ttl),
                };
                let _ = writeln!(
                    out,
                    "{:<34} {:<30} {:>10} {:>12}",
                    self.name_of_slot(idx),
                    data,
                    record.flags().to_string(),
                    expires
                );
            }
        }
        out
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::super::{Cache, CacheConfig, Flags, Payload};
    use crate::time::{Timestamp, Ttl};

    #[test]
    fn dump_lists_records_with_flags_and_expiry() {
        let mut cache = Cache::new(CacheConfig {
            capacity: 16,
            ..Default::default()
        });
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        cache.begin_insert();
        cache
            .insert(
                "www.example.com",
                Payload::Addr(addr),
                Timestamp::from(1000),
                Ttl::from(300),
                Flags::FORWARD,
            )
            .unwrap();
        cache.commit_insert();

        let dump = cache.dump_snapshot(Timestamp::from(1100));
        assert!(dump.contains("www.example.com"));
        assert!(dump.contains("192.0.2.1"));
        assert!(dump.contains("4F"));
        assert!(dump.contains("+200s"));
        assert!(dump.contains("1 live records"));
    }
}

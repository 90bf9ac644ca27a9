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

//! The name/address cache engine.
//!
//! A [`Cache`] is one shared table storing every record the resolver
//! knows about: forward A/AAAA answers, reverse PTR mappings, CNAME
//! chains, negative/NXDOMAIN results, and statically configured
//! hosts-file and DHCP-lease names. It is built from four pieces that
//! share one fixed allocation:
//!
//! * the record pool, a preallocated arena of record slots threaded
//!   into a recency (LRU) list for eviction;
//! * the hash index, a resizable power-of-two array of chains over the
//!   pool;
//! * the overflow name arena, fixed-size blocks for names too long for
//!   a record's inline buffer; and
//! * the insertion transaction buffer, a staging list that makes each
//!   inbound answer's records visible all at once or not at all.
//!
//! A record slot is drawn from the oldest end of the recency list,
//! written with new identity and payload, and — on commit — hashed
//! into the index and relinked at the newest end. It returns to the
//! reusable state when it expires, is evicted, or its static source is
//! reloaded; its generation tag is bumped at that point, which is what
//! invalidates any [`RecordHandle`] (including CNAME back-references)
//! still naming it.
//!
//! The engine is single-threaded and performs no I/O; every operation
//! takes the current time as a [`Timestamp`] argument.

use std::net::IpAddr;
use std::sync::Arc;

use arrayvec::ArrayString;
use log::{debug, warn};

use crate::time::{Timestamp, Ttl};
use crate::util::Caseless;

mod bigname;
mod dump;
mod error;
mod index;
mod insert;
mod lookup;
mod pool;
mod record;

pub use dump::CacheStats;
pub use error::InsertError;
pub use lookup::{Found, Matches};
pub use record::{
    CacheRecord, Expiry, Flags, Payload, RecordHandle, SourceId, SourceKind, MAX_NAME_LEN,
};

use bigname::BignamePool;
use dump::Counters;
use index::HashIndex;
use pool::Pool;
use record::NameBuf;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION                                                      //
////////////////////////////////////////////////////////////////////////

/// Sizing parameters for a [`Cache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// The number of record slots to preallocate. The cache never
    /// holds more records than this, and never allocates more slots at
    /// runtime.
    pub capacity: usize,

    /// The number of overflow name blocks permitted, for names too
    /// long to store inline. Defaults to `capacity / 10 + 5`.
    pub bigname_budget: Option<usize>,

    /// The initial hash bucket count. The index grows by rehash as the
    /// working set grows, so this only matters for start-up.
    pub initial_buckets: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 150,
            bigname_budget: None,
            initial_buckets: 64,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// STATIC ENTRIES                                                     //
////////////////////////////////////////////////////////////////////////

/// One name-to-address mapping from a static source (hosts file, DHCP
/// lease table, or daemon configuration), fed to
/// [`Cache::bulk_load`]/[`Cache::reload_static`].
///
/// The name is shared with the loader rather than copied into the
/// cache's name storage. The resulting record serves both forward and
/// reverse lookups, never expires, and is never evicted while its
/// source remains loaded.
#[derive(Clone, Debug)]
pub struct StaticEntry {
    pub name: Arc<str>,
    pub addr: IpAddr,

    /// The TTL to advertise in answers built from this record. The
    /// record itself does not expire.
    pub ttl: Ttl,
}

struct SourceInfo {
    kind: SourceKind,
    descriptor: Box<str>,
}

////////////////////////////////////////////////////////////////////////
// THE CACHE                                                          //
////////////////////////////////////////////////////////////////////////

/// The cache engine. See the [module documentation](self) for an
/// overview.
pub struct Cache {
    pool: Pool,
    index: HashIndex,
    bignames: BignamePool,
    sources: Vec<SourceInfo>,

    /// Head and tail of the insertion transaction's staging list,
    /// threaded through `Slot::chain_next`.
    staged_head: Option<u32>,
    staged_tail: Option<u32>,

    /// Set when an insertion batch fails with `NoSpace`/`NoMemory`;
    /// poisons the rest of the batch until the next `begin_insert`.
    txn_error: Option<InsertError>,

    /// Latched after the first forced eviction of a live record, so
    /// the "cache is too small" advisory is logged only once.
    pressure_warned: bool,

    /// The number of records currently reachable from the hash index.
    live: usize,

    counters: Counters,
}

impl Cache {
    /// Creates a cache with the given sizing. All record storage is
    /// allocated here; the engine allocates nothing per record
    /// afterwards except overflow name blocks, up to their budget.
    pub fn new(config: CacheConfig) -> Self {
        let bigname_budget = config
            .bigname_budget
            .unwrap_or(config.capacity / 10 + 5);
        Self {
            pool: Pool::new(config.capacity),
            index: HashIndex::new(config.initial_buckets),
            bignames: BignamePool::new(bigname_budget),
            sources: Vec::new(),
            staged_head: None,
            staged_tail: None,
            txn_error: None,
            pressure_warned: false,
            live: 0,
            counters: Counters::default(),
        }
    }

    /// Returns the configured record capacity.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Returns the number of records currently visible to lookups.
    pub fn live(&self) -> usize {
        self.live
    }

    ////////////////////////////////////////////////////////////////////
    // HANDLES                                                        //
    ////////////////////////////////////////////////////////////////////

    /// Dereferences a handle. Returns `None` if the record's storage
    /// has been recycled since the handle was created.
    pub fn record(&self, handle: RecordHandle) -> Option<&CacheRecord> {
        self.pool.get(handle)
    }

    /// Returns the name of the record a handle refers to, if the
    /// handle is still valid.
    pub fn record_name(&self, handle: RecordHandle) -> Option<&str> {
        self.pool.get(handle)?;
        Some(self.name_of_slot(handle.index))
    }

    /// Follows a CNAME record one step, returning its target's handle
    /// only if both the alias and the target are still valid. Chains
    /// are followed by calling this repeatedly; callers should bound
    /// the number of steps to guard against alias loops in upstream
    /// data.
    pub fn cname_target(&self, handle: RecordHandle) -> Option<RecordHandle> {
        let record = self.pool.get(handle)?;
        match record.payload {
            Payload::Alias(Some(target)) => {
                self.pool.get(target)?;
                Some(target)
            }
            _ => None,
        }
    }

    /// Returns the interface name an alias record points at, if the
    /// external object is still alive.
    pub fn interface_name(&self, handle: RecordHandle) -> Option<Arc<str>> {
        match &self.pool.get(handle)?.payload {
            Payload::InterfaceName(weak) => weak.upgrade(),
            _ => None,
        }
    }

    ////////////////////////////////////////////////////////////////////
    // PROVENANCE                                                     //
    ////////////////////////////////////////////////////////////////////

    /// Registers a record source for provenance tracking and returns
    /// its identifier. The descriptor is a human-readable origin, e.g.
    /// a hosts-file path, used only for diagnostics.
    pub fn register_source(&mut self, kind: SourceKind, descriptor: &str) -> SourceId {
        self.sources.push(SourceInfo {
            kind,
            descriptor: descriptor.into(),
        });
        SourceId(self.sources.len() as u32 - 1)
    }

    /// Returns the human-readable descriptor of a registered source.
    pub fn record_source(&self, id: SourceId) -> Option<&str> {
        self.sources.get(id.0 as usize).map(|s| &*s.descriptor)
    }

    ////////////////////////////////////////////////////////////////////
    // STATIC LOADING                                                 //
    ////////////////////////////////////////////////////////////////////

    /// Loads static entries from a registered source. The resulting
    /// records are immortal and non-evictable; they leave the cache
    /// only through [`reload_static`](Self::reload_static). Entries
    /// whose name and address duplicate an already-loaded static
    /// record are skipped; dynamically cached records superseded by a
    /// static entry are dropped.
    ///
    /// Returns the number of records created. If the pool fills up
    /// mid-load, loading stops and `NoSpace` is returned; entries
    /// loaded before that point stay loaded.
    pub fn bulk_load<I>(
        &mut self,
        source: SourceId,
        now: Timestamp,
        entries: I,
    ) -> Result<usize, InsertError>
    where
        I: IntoIterator<Item = StaticEntry>,
    {
        let kind_flag = match self.sources.get(source.0 as usize).map(|s| s.kind) {
            Some(SourceKind::HostsFile) => Flags::HOSTS,
            Some(SourceKind::DhcpLeases) => Flags::DHCP,
            Some(SourceKind::Config) | None => Flags::CONFIG,
        };
        let mut loaded = 0;
        for entry in entries {
            if entry.name.is_empty() || entry.name.len() > MAX_NAME_LEN {
                warn!(
                    "ignoring unusable name ({} octets) from {}",
                    entry.name.len(),
                    self.record_source(source).unwrap_or("?")
                );
                continue;
            }
            let family = match entry.addr {
                IpAddr::V4(_) => Flags::IPV4,
                IpAddr::V6(_) => Flags::IPV6,
            };
            let flags = Flags::FORWARD | Flags::REVERSE | Flags::IMMORTAL | family | kind_flag;
            let bucket = self.bucket_for(&entry.name);
            if self.scavenge_for_static(bucket, &entry, family, now) {
                continue; // identical record already loaded
            }
            let idx = match self.acquire_slot(now) {
                Ok(idx) => idx,
                Err(error) => {
                    warn!(
                        "cache full while loading {}; remaining entries not loaded",
                        self.record_source(source).unwrap_or("?")
                    );
                    return Err(error);
                }
            };
            self.pool.slot_mut(idx).record = Some(CacheRecord {
                name: NameBuf::Shared(entry.name),
                payload: Payload::Addr(entry.addr),
                flags,
                expiry: Expiry::Never(entry.ttl),
                source: Some(source),
            });
            self.commit_slot(idx, bucket, false);
            loaded += 1;
            self.maybe_grow();
        }
        debug!(
            "loaded {} records from {}",
            loaded,
            self.record_source(source).unwrap_or("?")
        );
        Ok(loaded)
    }

    /// Atomically swaps a source's records for a freshly parsed set:
    /// every record previously loaded from `source` is dropped (its
    /// storage recycled), then `entries` are loaded in its place.
    /// Dynamically cached records are untouched.
    pub fn reload_static<I>(
        &mut self,
        source: SourceId,
        now: Timestamp,
        entries: I,
    ) -> Result<usize, InsertError>
    where
        I: IntoIterator<Item = StaticEntry>,
    {
        let removed = self.clear_source(source);
        if removed > 0 {
            debug!(
                "dropped {} stale records from {}",
                removed,
                self.record_source(source).unwrap_or("?")
            );
        }
        self.bulk_load(source, now, entries)
    }

    /// Drops every record loaded from a source. Returns the number
    /// dropped.
    fn clear_source(&mut self, source: SourceId) -> usize {
        let mut removed = 0;
        for idx in 0..self.pool.capacity() as u32 {
            let from_source = self
                .pool
                .slot(idx)
                .record
                .as_ref()
                .is_some_and(|r| r.source == Some(source));
            if from_source {
                self.free_slot(idx);
                removed += 1;
            }
        }
        removed
    }

    /// The dedup/supersede pass run before loading one static entry.
    /// Returns `true` if an identical static record already exists (so
    /// the entry should be skipped). Dynamic records the entry
    /// supersedes are freed along the way.
    fn scavenge_for_static(
        &mut self,
        bucket: u32,
        entry: &StaticEntry,
        family: Flags,
        now: Timestamp,
    ) -> bool {
        let mut duplicate = false;
        let mut cur = self.index.head(bucket);
        while let Some(idx) = cur {
            let next = self.pool.slot(idx).chain_next;
            if self.record_is_dead(idx, now) {
                self.counters.expired_purged += 1;
                self.free_slot(idx);
                cur = next;
                continue;
            }
            let (same_name, is_static, same_data, dynamic_superseded) = {
                match self.pool.slot(idx).record.as_ref() {
                    Some(existing) => {
                        let same_name =
                            Caseless(self.name_of_slot(idx)) == Caseless(&entry.name);
                        let kind_overlap = existing.flags.intersects(family | Flags::CNAME);
                        (
                            same_name,
                            existing.flags.is_static(),
                            existing.payload.addr() == Some(entry.addr),
                            kind_overlap,
                        )
                    }
                    None => (false, false, false, false),
                }
            };
            if same_name {
                if is_static {
                    if same_data {
                        duplicate = true;
                    }
                    // A static record with different data for the same
                    // name is a legitimate additional address; keep it.
                } else if dynamic_superseded {
                    self.free_slot(idx);
                }
            }
            cur = next;
        }
        duplicate
    }

    ////////////////////////////////////////////////////////////////////
    // INTERNAL HELPERS                                               //
    ////////////////////////////////////////////////////////////////////

    /// Resolves the name of an occupied slot. Returns the empty string
    /// for a free slot.
    fn name_of_slot(&self, idx: u32) -> &str {
        match self.pool.slot(idx).record.as_ref() {
            Some(record) => match &record.name {
                NameBuf::Inline(name) => name.as_str(),
                NameBuf::Big(key) => self.bignames.get(*key),
                NameBuf::Shared(name) => name,
            },
            None => "",
        }
    }

    fn bucket_for(&self, name: &str) -> u32 {
        self.index.bucket_for(name)
    }

    /// Stores a name, inline if it fits and through the overflow arena
    /// otherwise. Returns `None` if the arena cannot take it.
    fn store_name(&mut self, name: &str) -> Option<NameBuf> {
        match ArrayString::from(name) {
            Ok(inline) => Some(NameBuf::Inline(inline)),
            Err(_) => self.bignames.alloc(name).map(NameBuf::Big),
        }
    }

    /// Returns a slot's storage to the reusable pool: unlinks it from
    /// the hash index and recency list, recycles it (bumping the
    /// generation tag, so outstanding handles go stale), frees any
    /// overflow name block, and relinks the slot at the oldest end of
    /// the recency list for prompt reuse.
    fn free_slot(&mut self, idx: u32) {
        if self.pool.slot(idx).bucket.is_some() {
            self.index.unlink(&mut self.pool, idx);
            self.live -= 1;
        }
        self.pool.unlink_lru(idx);
        if let Some(record) = self.pool.recycle(idx) {
            if let NameBuf::Big(key) = record.name {
                self.bignames.free(key);
            }
        }
        self.pool.link_oldest(idx);
    }

    /// Links a filled slot into the hash index (and, for evictable
    /// records, the newest end of the recency list), making it visible
    /// to lookups.
    fn commit_slot(&mut self, idx: u32, bucket: u32, evictable: bool) {
        self.index.link(&mut self.pool, idx, bucket);
        self.live += 1;
        if evictable {
            self.pool.link_newest(idx);
        }
    }

    /// Returns whether a slot holds a record that any sweep should
    /// remove: an expired mortal record, or a dynamic record whose
    /// alias reference has gone stale. Static records are never
    /// removed by sweeps, only by reload.
    fn record_is_dead(&self, idx: u32, now: Timestamp) -> bool {
        let Some(record) = self.pool.slot(idx).record.as_ref() else {
            return false;
        };
        if record.flags.is_static() {
            return false;
        }
        record.is_expired(now) || self.alias_is_stale(record)
    }

    /// Returns whether a record's alias reference no longer points at
    /// live data: the target's storage was recycled for something
    /// else, or the external interface-name object was dropped.
    fn alias_is_stale(&self, record: &CacheRecord) -> bool {
        match &record.payload {
            Payload::Alias(Some(target)) => self.pool.get(*target).is_none(),
            Payload::Alias(None) => true,
            Payload::InterfaceName(weak) => weak.strong_count() == 0,
            _ => false,
        }
    }

    /// Sweeps every chain for dead records, returning their slots to
    /// the reusable pool.
    fn purge_expired_all(&mut self, now: Timestamp) {
        for bucket in 0..self.index.bucket_count() as u32 {
            let mut cur = self.index.head(bucket);
            while let Some(idx) = cur {
                let next = self.pool.slot(idx).chain_next;
                if self.record_is_dead(idx, now) {
                    self.counters.expired_purged += 1;
                    self.free_slot(idx);
                }
                cur = next;
            }
        }
    }

    /// Grows the hash index when the working set has outgrown it.
    fn maybe_grow(&mut self) {
        if self.live > self.index.bucket_count() * 4 {
            self.rehash(self.live * 8);
        }
    }

    /// Rebuilds the hash index sized for `target` records, relinking
    /// every record under the chain-ordering invariant. Safe to call
    /// repeatedly (e.g. while incrementally loading a large hosts
    /// file); no record is lost. The index never shrinks.
    fn rehash(&mut self, target: usize) {
        let new_size = HashIndex::size_for(target);
        if new_size <= self.index.bucket_count() {
            return;
        }
        let mask = new_size as u32 - 1;
        let mut moves = Vec::with_capacity(self.live);
        for idx in 0..self.pool.capacity() as u32 {
            if self.pool.slot(idx).bucket.is_some() {
                let bucket = index::hash_name(self.name_of_slot(idx)) & mask;
                moves.push((idx, bucket));
            }
        }
        self.index.reset(new_size);
        for &(idx, _) in &moves {
            let slot = self.pool.slot_mut(idx);
            slot.bucket = None;
            slot.chain_next = None;
        }
        for &(idx, bucket) in &moves {
            self.index.link(&mut self.pool, idx, bucket);
        }
        self.counters.rehashes += 1;
        debug!(
            "rehashed cache index to {} buckets for {} records",
            new_size,
            moves.len()
        );
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

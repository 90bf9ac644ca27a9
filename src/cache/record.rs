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

//! The cache data model: records, flags, payloads, and provenance.

use std::fmt;
use std::net::IpAddr;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::{Arc, Weak};

use arrayvec::ArrayString;

use crate::time::{Timestamp, Ttl};

/// The longest name stored inline in a record. Longer names go through
/// the overflow name arena.
pub(super) const SMALL_NAME_LEN: usize = 50;

/// The longest name the cache will store at all, in octets.
pub const MAX_NAME_LEN: usize = 255;

////////////////////////////////////////////////////////////////////////
// RECORD FLAGS                                                       //
////////////////////////////////////////////////////////////////////////

/// A bit set recording a record's class and lifecycle state.
///
/// Flags serve two roles: they describe what a record *is* (direction,
/// address family, payload kind, provenance) and they drive lookup
/// matching — [`Cache::lookup_by_name`](super::Cache::lookup_by_name)
/// and [`Cache::lookup_by_addr`](super::Cache::lookup_by_addr) take a
/// required-flags mask built from the same constants.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Flags(u16);

impl Flags {
    /// The record maps a name to data (an address, alias, or key).
    pub const FORWARD: Flags = Flags(0x0001);

    /// The record maps an address back to a name.
    pub const REVERSE: Flags = Flags(0x0002);

    /// The record concerns an IPv4 address.
    pub const IPV4: Flags = Flags(0x0004);

    /// The record concerns an IPv6 address.
    pub const IPV6: Flags = Flags(0x0008);

    /// The record is a CNAME alias.
    pub const CNAME: Flags = Flags(0x0010);

    /// The record holds opaque key material.
    pub const KEY: Flags = Flags(0x0020);

    /// The record is a negative (no-data) result.
    pub const NEG: Flags = Flags(0x0040);

    /// The record is an NXDOMAIN result. Always set together with
    /// [`NEG`](Self::NEG).
    pub const NXDOMAIN: Flags = Flags(0x0080);

    /// The record does not expire by TTL. For records carrying a
    /// static-provenance flag this also means "never evicted"; a
    /// dynamically cached immortal record is still subject to normal
    /// eviction pressure.
    pub const IMMORTAL: Flags = Flags(0x0100);

    /// The record was loaded from a hosts file.
    pub const HOSTS: Flags = Flags(0x0200);

    /// The record was derived from a DHCP lease.
    pub const DHCP: Flags = Flags(0x0400);

    /// The record came from static daemon configuration.
    pub const CONFIG: Flags = Flags(0x0800);

    /// Returns the empty flag set.
    pub const fn empty() -> Flags {
        Flags(0)
    }

    /// Returns whether every flag in `other` is set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether `self` and `other` have any flag in common.
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns whether the record carries any static-provenance flag.
    /// Such records are never chosen for LRU eviction and are removed
    /// from storage only by an explicit reload of their source.
    pub fn is_static(self) -> bool {
        self.intersects(Self::HOSTS | Self::DHCP | Self::CONFIG)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flags({})", self)
    }
}

/// Displays the flag letters used in cache dumps: `4`/`6` for the
/// address family, then `F`orward, `R`everse, `C`NAME, `N`egative,
/// `X` for NXDOMAIN, `K`ey material, `H`osts file, `D`HCP lease,
/// `S`tatic configuration, and `I`mmortal.
impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let letters = [
            (Self::IPV4, '4'),
            (Self::IPV6, '6'),
            (Self::FORWARD, 'F'),
            (Self::REVERSE, 'R'),
            (Self::CNAME, 'C'),
            (Self::NEG, 'N'),
            (Self::NXDOMAIN, 'X'),
            (Self::KEY, 'K'),
            (Self::HOSTS, 'H'),
            (Self::DHCP, 'D'),
            (Self::CONFIG, 'S'),
            (Self::IMMORTAL, 'I'),
        ];
        for (flag, letter) in letters {
            if self.contains(flag) {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// RECORD HANDLES                                                     //
////////////////////////////////////////////////////////////////////////

/// A weak, generation-checked reference to a cache record.
///
/// A handle names a slot in the record pool together with the slot's
/// generation tag at the time the handle was created. The pool bumps a
/// slot's generation whenever its storage is recycled, so a handle
/// whose generation no longer matches refers to storage that has since
/// been reused for unrelated data. Every dereference re-checks the tag
/// (see [`Cache::record`](super::Cache::record)); a handle never keeps
/// its target alive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RecordHandle {
    pub(super) index: u32,
    pub(super) generation: u64,
}

////////////////////////////////////////////////////////////////////////
// RECORD PAYLOADS                                                    //
////////////////////////////////////////////////////////////////////////

/// The data a cache record carries.
#[derive(Clone, Debug)]
pub enum Payload {
    /// An IPv4 or IPv6 address.
    Addr(IpAddr),

    /// A CNAME alias to another cache record. The target handle is
    /// `None` while the alias is staged in a transaction and its
    /// target has not yet been resolved; such aliases are discarded
    /// silently at commit. A committed alias whose handle has gone
    /// stale (the target's storage was recycled) is purged on first
    /// encounter and never returned as a match.
    Alias(Option<RecordHandle>),

    /// A CNAME alias to an externally owned interface name. The
    /// external object's lifetime is independent of the cache; a dead
    /// reference invalidates the record exactly like a stale alias.
    InterfaceName(Weak<str>),

    /// Opaque key or signature material, owned by an external blob
    /// allocator. The cache only stores and returns it.
    Key(Arc<[u8]>),

    /// No data: a negative or NXDOMAIN result.
    Negative,
}

impl Payload {
    /// Returns the address carried by the payload, if any.
    pub fn addr(&self) -> Option<IpAddr> {
        match *self {
            Payload::Addr(addr) => Some(addr),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// NAME STORAGE                                                       //
////////////////////////////////////////////////////////////////////////

/// Where a record's name lives.
///
/// Most names fit in the inline buffer. Longer ones are stored in the
/// overflow name arena and referenced by block key. Names of statically
/// loaded records are shared with the loader rather than copied.
#[derive(Clone, Debug)]
pub(super) enum NameBuf {
    Inline(ArrayString<SMALL_NAME_LEN>),
    Big(usize),
    Shared(Arc<str>),
}

////////////////////////////////////////////////////////////////////////
// EXPIRY                                                             //
////////////////////////////////////////////////////////////////////////

/// A record's expiry state: an absolute time to die, or — for immortal
/// records — a TTL value reused for re-advertisement rather than
/// expiry.
#[derive(Clone, Copy, Debug)]
pub enum Expiry {
    At(Timestamp),
    Never(Ttl),
}

////////////////////////////////////////////////////////////////////////
// PROVENANCE                                                         //
////////////////////////////////////////////////////////////////////////

/// The kind of external source a static record came from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SourceKind {
    HostsFile,
    DhcpLeases,
    Config,
}

/// An identifier for a registered record source. Obtained from
/// [`Cache::register_source`](super::Cache::register_source) and stored
/// in every record loaded from that source.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SourceId(pub(super) u32);

////////////////////////////////////////////////////////////////////////
// CACHE RECORDS                                                      //
////////////////////////////////////////////////////////////////////////

/// A single cache entry.
///
/// Records are never allocated individually: their storage belongs to
/// the record pool for the entire process lifetime, and "creation" and
/// "destruction" are transitions of a pool slot between the hash index
/// and the free portion of the recency list. The only heap the engine
/// touches per record is the overflow name arena (for long names) and
/// externally owned key blobs.
#[derive(Clone, Debug)]
pub struct CacheRecord {
    pub(super) name: NameBuf,
    pub(super) payload: Payload,
    pub(super) flags: Flags,
    pub(super) expiry: Expiry,
    pub(super) source: Option<SourceId>,
}

impl CacheRecord {
    /// Returns the record's flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Returns the record's payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the record's expiry state.
    pub fn expiry(&self) -> Expiry {
        self.expiry
    }

    /// Returns the source the record was loaded from, if it is a
    /// static record.
    pub fn source(&self) -> Option<SourceId> {
        self.source
    }

    /// Returns whether the record's TTL has run out at `now`. Immortal
    /// records never expire; other records are valid through their
    /// expiry second.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.expiry {
            Expiry::At(at) => at < now,
            Expiry::Never(_) => false,
        }
    }

    /// Returns the TTL to advertise for this record at `now`: the
    /// remaining lifetime for mortal records, or the stored
    /// re-advertisement TTL for immortal ones.
    pub fn advertised_ttl(&self, now: Timestamp) -> Ttl {
        match self.expiry {
            Expiry::At(at) => Ttl::from(at.seconds_after(now).min(i32::MAX as u64) as u32),
            Expiry::Never(ttl) => ttl,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_operations_work() {
        let flags = Flags::FORWARD | Flags::IPV4 | Flags::HOSTS;
        assert!(flags.contains(Flags::FORWARD | Flags::IPV4));
        assert!(!flags.contains(Flags::FORWARD | Flags::IPV6));
        assert!(flags.intersects(Flags::IPV6 | Flags::HOSTS));
        assert!(flags.is_static());
        assert!(!(Flags::FORWARD | Flags::IMMORTAL).is_static());
    }

    #[test]
    fn flag_letters_render_in_dump_order() {
        let flags = Flags::IPV4 | Flags::FORWARD | Flags::REVERSE | Flags::HOSTS | Flags::IMMORTAL;
        assert_eq!(flags.to_string(), "4FRHI");
    }

    #[test]
    fn expiry_is_valid_through_its_last_second() {
        let record = CacheRecord {
            name: NameBuf::Inline(ArrayString::new()),
            payload: Payload::Negative,
            flags: Flags::FORWARD | Flags::IPV4 | Flags::NEG,
            expiry: Expiry::At(Timestamp::from(1300)),
            source: None,
        };
        assert!(!record.is_expired(Timestamp::from(1300)));
        assert!(record.is_expired(Timestamp::from(1301)));
        assert_eq!(
            record.advertised_ttl(Timestamp::from(1000)),
            Ttl::from(300)
        );
    }
}

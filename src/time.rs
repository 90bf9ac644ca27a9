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

//! Time-to-live and timestamp types used by the cache engine.

use std::fmt;
use std::ops::Add;

////////////////////////////////////////////////////////////////////////
// TTLS                                                               //
////////////////////////////////////////////////////////////////////////

/// The time to live (TTL) of a cached record.
///
/// There are contradictory definitions of the TTL field in [RFC 1035]
/// (see [erratum 2130]), so [RFC 2181 § 8] clarified that TTL values
/// are unsigned integers between 0 and 2³¹ - 1, inclusive. Because the
/// TTL field is 32 bits wide, the most significant bit is zero. A TTL
/// value received with the most significant bit set is interpreted as
/// zero.
///
/// This type wraps `u32` to implement [RFC 2181 § 8]: `Ttl::from(u32)`
/// treats values with the most significant bit set as zero.
///
/// [Erratum 2130]: https://www.rfc-editor.org/errata/eid2130
/// [RFC 1035]: https://datatracker.ietf.org/doc/html/rfc1035
/// [RFC 2181 § 8]: https://datatracker.ietf.org/doc/html/rfc2181#section-8
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Ttl(u32);

impl From<u32> for Ttl {
    fn from(raw: u32) -> Self {
        if raw > i32::MAX as u32 {
            Self(0)
        } else {
            Self(raw)
        }
    }
}

impl From<Ttl> for u32 {
    fn from(ttl: Ttl) -> Self {
        ttl.0
    }
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ttl({})", self.0)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

////////////////////////////////////////////////////////////////////////
// TIMESTAMPS                                                         //
////////////////////////////////////////////////////////////////////////

/// An absolute point in time, measured in whole seconds.
///
/// The engine never reads a clock. Every lookup and insertion takes a
/// `Timestamp` supplied by the caller and compares it against stored
/// expiry times, which makes expiry behavior trivially testable with
/// synthetic time. The epoch is whatever the caller says it is; only
/// ordering and differences matter.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the number of seconds remaining until `self`, or zero if
    /// `self` is not after `now`.
    pub fn seconds_after(self, now: Timestamp) -> u64 {
        self.0.saturating_sub(now.0)
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Self(secs)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl Add<Ttl> for Timestamp {
    type Output = Timestamp;

    fn add(self, ttl: Ttl) -> Timestamp {
        Timestamp(self.0.saturating_add(u64::from(u32::from(ttl))))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{Timestamp, Ttl};

    #[test]
    fn ttl_clamps_high_bit_to_zero() {
        assert_eq!(Ttl::from(0x8000_0000), Ttl::from(0));
        assert_eq!(Ttl::from(u32::MAX), Ttl::from(0));
        assert_eq!(u32::from(Ttl::from(i32::MAX as u32)), i32::MAX as u32);
    }

    #[test]
    fn timestamp_addition_saturates() {
        let far = Timestamp::from(u64::MAX - 1);
        assert_eq!(far + Ttl::from(300), Timestamp::from(u64::MAX));
    }

    #[test]
    fn seconds_after_never_underflows() {
        let early = Timestamp::from(100);
        let late = Timestamp::from(400);
        assert_eq!(late.seconds_after(early), 300);
        assert_eq!(early.seconds_after(late), 0);
    }
}

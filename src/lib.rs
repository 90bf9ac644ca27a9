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

//! The name/address cache engine of the Redstart DNS/DHCP daemon.
//!
//! Redstart terminates DNS queries, forwards unresolved ones upstream,
//! and serves DHCP/DHCPv6 leases. This crate implements the single
//! shared table at the heart of its resolver: the cache that stores
//! resolved records (forward A/AAAA, reverse PTR, CNAME chains,
//! negative/NXDOMAIN results, and statically configured hosts/lease
//! names) and answers lookups for the rest of the daemon.
//!
//! The engine operates under a fixed memory budget: all record storage
//! is preallocated at start-up and recycled under least-recently-used
//! pressure, never allocated per record. See [`cache::Cache`] for the
//! entry point and a description of the record lifecycle.
//!
//! The surrounding daemon — wire-format parsing, option codecs, lease
//! persistence, and socket plumbing — lives elsewhere. This crate
//! performs no I/O and never reads a clock; callers supply the current
//! time on every operation, which keeps the engine deterministic and
//! easy to test.

pub mod cache;
pub mod time;

mod util;

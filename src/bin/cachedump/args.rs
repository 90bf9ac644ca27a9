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

//! Implements command-line argument parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// The Redstart cache inspection tool
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Args {
    /// Load name/address pairs from a hosts-format file
    #[clap(long, value_name = "FILE")]
    pub hosts: Vec<PathBuf>,

    /// Set the cache capacity in records
    #[clap(long, default_value_t = 150, value_name = "N")]
    pub cache_size: usize,

    /// Set the clock (in seconds) the dump is rendered against
    #[clap(long, default_value_t = 0, value_name = "SECONDS")]
    pub now: u64,

    /// Resolve a name against the loaded data before dumping
    #[clap(long, value_name = "NAME")]
    pub query: Vec<String>,

    /// Resolve an address against the loaded data before dumping
    #[clap(long, value_name = "ADDR")]
    pub query_addr: Vec<IpAddr>,
}

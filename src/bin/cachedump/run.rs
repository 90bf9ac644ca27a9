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

//! Implements loading, querying, and dumping the cache.

use std::fmt::Write;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info};

use redstart::cache::{Cache, CacheConfig, Flags, SourceKind, StaticEntry};
use redstart::time::{Timestamp, Ttl};

use crate::args::Args;

/// Runs the tool.
pub fn run(args: Args) {
    env_logger::init_from_env(Env::new().default_filter_or("warn"));

    if let Err(e) = try_running(args) {
        let mut message = String::from("Failed to run:");
        for (i, cause) in e.chain().enumerate() {
            write!(message, "\n[{}] {}", i + 1, cause).unwrap();
        }
        message.push_str("\nExiting with failure.");
        error!("{}", message);
        process::exit(1);
    }
}

fn try_running(args: Args) -> Result<()> {
    let mut cache = Cache::new(CacheConfig {
        capacity: args.cache_size,
        ..Default::default()
    });
    let now = Timestamp::from(args.now);

    for path in &args.hosts {
        let source = cache.register_source(SourceKind::HostsFile, &path.display().to_string());
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let entries = parse_hosts(path, &text)?;
        let loaded = cache
            .bulk_load(source, now, entries)
            .with_context(|| format!("failed to load {}", path.display()))?;
        info!("Loaded {} records from {}.", loaded, path.display());
    }

    for name in &args.query {
        let answers: Vec<IpAddr> = cache
            .lookup_by_name(name, now, Flags::FORWARD | Flags::IPV4 | Flags::IPV6)
            .filter_map(|found| found.record.payload().addr())
            .collect();
        if answers.is_empty() {
            println!("{}: no match", name);
        } else {
            for answer in answers {
                println!("{}: {}", name, answer);
            }
        }
    }
    for addr in &args.query_addr {
        let names: Vec<String> = cache
            .lookup_by_addr(*addr, now, Flags::empty())
            .map(|found| found.name.to_owned())
            .collect();
        if names.is_empty() {
            println!("{}: no match", addr);
        } else {
            for name in names {
                println!("{}: {}", addr, name);
            }
        }
    }

    print!("{}", cache.dump_snapshot(now));
    Ok(())
}

/// Parses hosts-format text: one address followed by one or more names
/// per line, with `#` comments.
fn parse_hosts(path: &Path, text: &str) -> Result<Vec<StaticEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let Some(addr_field) = fields.next() else {
            continue;
        };
        let addr: IpAddr = addr_field.parse().with_context(|| {
            format!(
                "{}:{}: invalid address {:?}",
                path.display(),
                lineno + 1,
                addr_field
            )
        })?;
        for name in fields {
            entries.push(StaticEntry {
                name: Arc::from(name),
                addr,
                ttl: Ttl::from(0),
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::parse_hosts;

    #[test]
    fn hosts_parsing_handles_comments_and_multiple_names() {
        let text = "\
            # header comment\n\
            \n\
            192.0.2.1 www.example.com example.com # trailing comment\n\
            2001:db8::1 six.example.com\n";
        let entries = parse_hosts(Path::new("test-hosts"), text).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(&*entries[0].name, "www.example.com");
        assert_eq!(&*entries[1].name, "example.com");
        assert_eq!(entries[0].addr, entries[1].addr);
        assert_eq!(&*entries[2].name, "six.example.com");
        assert!(entries[2].addr.is_ipv6());
    }

    #[test]
    fn hosts_parsing_rejects_bad_addresses() {
        assert!(parse_hosts(Path::new("test-hosts"), "not-an-address host\n").is_err());
    }
}

// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Peers refused by the daemon for lacking a client-config-dir entry, as
//! recorded in its log.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use ovpnward_types::RejectedClient;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::status::parse_timestamp;

const MARKER: &str = "client-config-dir authentication failed";
const NAME_PREFIX: &str = "common name '";
/// Upper bound on bytes read per requested line.
const BYTES_PER_LINE: u64 = 512;

fn rejected_name(line: &str) -> Option<&str> {
    if !line.contains(MARKER) {
        return None;
    }
    let start = line.find(NAME_PREFIX)? + NAME_PREFIX.len();
    let rest = &line[start..];
    let end = rest.find('\'')?;
    Some(&rest[..end]).filter(|n| !n.is_empty())
}

/// Log lines start with either a ctime stamp (`Thu Jun 18 04:23:03 2015`) or
/// an ISO one (`2024-03-01 09:00:00`).
fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let words: Vec<&str> = line.split_whitespace().take(5).collect();
    if words.len() == 5 {
        if let Some(ts) = parse_timestamp(&words.join(" ")) {
            return Some(ts);
        }
    }
    if words.len() >= 2 {
        return parse_timestamp(&words[..2].join(" "));
    }
    None
}

fn peer_address(line: &str) -> Option<String> {
    line.split_whitespace().find_map(|word| {
        let word = word.rsplit('/').next()?;
        let word = word.strip_prefix("[AF_INET]").unwrap_or(word);
        let (host, port) = word.rsplit_once(':')?;
        port.parse::<u16>().ok()?;
        host.parse::<Ipv4Addr>().ok().map(|ip| ip.to_string())
    })
}

/// Aggregate rejection events per common name, ordered by name.
pub fn scan(text: &str) -> Vec<RejectedClient> {
    let mut seen: BTreeMap<&str, RejectedClient> = BTreeMap::new();
    for line in text.lines() {
        let Some(name) = rejected_name(line) else {
            continue;
        };
        let at = line_timestamp(line);
        let ip = peer_address(line);
        let entry = seen.entry(name).or_insert_with(|| RejectedClient {
            name: name.to_string(),
            real_ip: None,
            last_attempt: None,
            attempts: 0,
        });
        entry.attempts += 1;
        let newer = match (at, entry.last_attempt) {
            (Some(at), Some(prev)) => at >= prev,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => true,
        };
        if newer {
            entry.last_attempt = at.or(entry.last_attempt);
            if ip.is_some() {
                entry.real_ip = ip;
            }
        }
    }
    seen.into_values().collect()
}

/// Read roughly the last `lines` lines of `path`.
pub async fn tail(path: &Path, lines: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let budget = (lines as u64).saturating_mul(BYTES_PER_LINE);
    let offset = len.saturating_sub(budget);
    file.seek(SeekFrom::Start(offset)).await?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    let text = String::from_utf8_lossy(&bytes);
    let mut text: &str = &text;

    // Drop the partial first line when reading from the middle of the file.
    if offset > 0 {
        text = text.split_once('\n').map_or("", |(_, rest)| rest);
    }
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].join("\n"))
}

/// Scan the tail of the daemon log. A missing or unreadable log yields an
/// empty list.
pub async fn rejected_clients(path: Option<&Path>, lines: usize) -> Vec<RejectedClient> {
    let Some(path) = path else {
        return Vec::new();
    };
    match tail(path, lines).await {
        Ok(text) => scan(&text),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "daemon log not readable");
            Vec::new()
        }
    }
}

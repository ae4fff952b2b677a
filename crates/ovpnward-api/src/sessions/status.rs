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

//! Parser for the OpenVPN status report, both the v1 CSV layout and the
//! v2/v3 keyed rows emitted by `status 2` / `status 3`.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDateTime, Utc};
use ovpnward_types::session::{LiveSession, VpnAddress};
use tracing::debug;

const UNDEF: &str = "UNDEF";
const TIME_FORMATS: [&str; 2] = ["%a %b %e %H:%M:%S %Y", "%Y-%m-%d %H:%M:%S"];

#[derive(Debug, thiserror::Error)]
pub enum StatusParseError {
    #[error("unrecognised status format")]
    UnknownFormat,
}

/// Parse a timestamp as printed by the daemon. The daemon prints local time
/// without a zone; it is taken to be UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_time_t(s: &str) -> Option<DateTime<Utc>> {
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Strip the protocol prefix (`udp4:`, `tcp4-server:`) and port from a
/// real address.
pub fn host_of(real: &str) -> String {
    let mut s = real.trim();
    if let Some((proto, rest)) = s.split_once(':') {
        let is_proto = proto.starts_with(|c: char| c.is_ascii_alphabetic())
            && proto.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !proto.chars().all(|c| c.is_ascii_hexdigit());
        if is_proto {
            s = rest;
        }
    }
    if let Some(inner) = s.strip_prefix('[') {
        return inner.split(']').next().unwrap_or(inner).to_string();
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host.to_string(),
        _ => s.to_string(),
    }
}

/// Routing-table entries are either a host address or an iroute subnet;
/// only the former identifies the peer.
fn routed_address(s: &str) -> Option<Ipv4Addr> {
    s.trim().parse().ok()
}

#[derive(Debug, Default)]
struct Partial {
    name: String,
    real: String,
    virtual_address: Option<Ipv4Addr>,
    bytes_received: u64,
    bytes_sent: u64,
    connected_since: Option<DateTime<Utc>>,
}

impl Partial {
    fn finish(self, routes: &HashMap<(String, String), Ipv4Addr>) -> LiveSession {
        let assigned = self
            .virtual_address
            .or_else(|| routes.get(&(self.name.clone(), self.real.clone())).copied())
            .map_or(VpnAddress::Dynamic, VpnAddress::Static);
        LiveSession {
            real_address: host_of(&self.real),
            name: self.name,
            assigned,
            connected_since: self.connected_since,
            bytes_received: self.bytes_received,
            bytes_sent: self.bytes_sent,
        }
    }
}

/// Column positions taken from a header row.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn new(names: &[&str]) -> Self {
        Self(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.trim().to_string(), i))
                .collect(),
        )
    }

    fn get<'a>(&self, row: &[&'a str], name: &str) -> Option<&'a str> {
        self.0.get(name).and_then(|&i| row.get(i)).map(|s| (*s).trim())
    }
}

fn client_row(cols: &Columns, row: &[&str]) -> Option<Partial> {
    let name = cols.get(row, "Common Name")?;
    if name.is_empty() || name == UNDEF {
        return None;
    }
    let real = cols.get(row, "Real Address")?;
    let bytes_received = cols.get(row, "Bytes Received")?.parse().ok()?;
    let bytes_sent = cols.get(row, "Bytes Sent")?.parse().ok()?;
    let connected_since = cols
        .get(row, "Connected Since (time_t)")
        .and_then(parse_time_t)
        .or_else(|| cols.get(row, "Connected Since").and_then(parse_timestamp));
    let virtual_address = cols.get(row, "Virtual Address").and_then(routed_address);
    Some(Partial {
        name: name.to_string(),
        real: real.to_string(),
        virtual_address,
        bytes_received,
        bytes_sent,
        connected_since,
    })
}

fn route_row(cols: &Columns, row: &[&str], routes: &mut HashMap<(String, String), Ipv4Addr>) {
    let (Some(virt), Some(name), Some(real)) = (
        cols.get(row, "Virtual Address"),
        cols.get(row, "Common Name"),
        cols.get(row, "Real Address"),
    ) else {
        return;
    };
    if let Some(ip) = routed_address(virt) {
        routes
            .entry((name.to_string(), real.to_string()))
            .or_insert(ip);
    }
}

fn parse_v1(text: &str) -> Vec<LiveSession> {
    enum Section {
        Preamble,
        Clients,
        Routes,
        Done,
    }

    let mut section = Section::Preamble;
    let mut client_cols: Option<Columns> = None;
    let mut route_cols: Option<Columns> = None;
    let mut partials = Vec::new();
    let mut routes = HashMap::new();

    for line in text.lines().map(str::trim_end) {
        match line {
            "OpenVPN CLIENT LIST" => {
                section = Section::Clients;
                continue;
            }
            "ROUTING TABLE" => {
                section = Section::Routes;
                continue;
            }
            "GLOBAL STATS" | "END" => {
                section = Section::Done;
                continue;
            }
            _ => {}
        }
        let row: Vec<&str> = line.split(',').collect();
        match section {
            Section::Clients if line.starts_with("Updated,") => {}
            Section::Clients if line.starts_with("Common Name,") => {
                client_cols = Some(Columns::new(&row));
            }
            Section::Clients => {
                if let Some(p) = client_cols.as_ref().and_then(|c| client_row(c, &row)) {
                    partials.push(p);
                }
            }
            Section::Routes if line.starts_with("Virtual Address,") => {
                route_cols = Some(Columns::new(&row));
            }
            Section::Routes => {
                if let Some(cols) = &route_cols {
                    route_row(cols, &row, &mut routes);
                }
            }
            Section::Preamble | Section::Done => {}
        }
    }

    partials.into_iter().map(|p| p.finish(&routes)).collect()
}

fn parse_keyed(text: &str, sep: char) -> Vec<LiveSession> {
    let default_clients = default_client_columns();
    let default_routes = default_route_columns();
    let mut headers: HashMap<String, Columns> = HashMap::new();
    let mut partials = Vec::new();
    let mut routes = HashMap::new();

    for line in text.lines().map(str::trim_end) {
        let row: Vec<&str> = line.split(sep).collect();
        match row.first().copied() {
            Some("HEADER") if row.len() > 1 => {
                // Columns are indexed from the row tag, which sits where the
                // HEADER keyword is.
                headers.insert(row[1].to_string(), Columns::new(&row[1..]));
            }
            Some("CLIENT_LIST") => {
                let cols = headers.get("CLIENT_LIST").unwrap_or(&default_clients);
                if let Some(p) = client_row(cols, &row) {
                    partials.push(p);
                }
            }
            Some("ROUTING_TABLE") => {
                let cols = headers.get("ROUTING_TABLE").unwrap_or(&default_routes);
                route_row(cols, &row, &mut routes);
            }
            _ => {}
        }
    }

    partials.into_iter().map(|p| p.finish(&routes)).collect()
}

fn default_client_columns() -> Columns {
    Columns::new(&[
        "CLIENT_LIST",
        "Common Name",
        "Real Address",
        "Virtual Address",
        "Virtual IPv6 Address",
        "Bytes Received",
        "Bytes Sent",
        "Connected Since",
        "Connected Since (time_t)",
    ])
}

fn default_route_columns() -> Columns {
    Columns::new(&["ROUTING_TABLE", "Virtual Address", "Common Name", "Real Address"])
}

/// Parse a full status report into live sessions, in report order.
pub fn parse_status(text: &str) -> Result<Vec<LiveSession>, StatusParseError> {
    let sessions = if text.lines().any(|l| l.trim_end() == "OpenVPN CLIENT LIST") {
        parse_v1(text)
    } else if text.lines().any(|l| l.starts_with("TITLE\t") || l.starts_with("HEADER\t")) {
        parse_keyed(text, '\t')
    } else if text
        .lines()
        .any(|l| l.starts_with("TITLE,") || l.starts_with("HEADER,") || l.starts_with("CLIENT_LIST,"))
    {
        parse_keyed(text, ',')
    } else {
        return Err(StatusParseError::UnknownFormat);
    };
    debug!(sessions = sessions.len(), "parsed status report");
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const V1: &str = "\
OpenVPN CLIENT LIST
Updated,Thu Jun 18 08:12:15 2015
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since
alice,203.0.113.7:51234,1200,3400,Thu Jun 18 04:23:03 2015
UNDEF,198.51.100.2:40000,10,0,Thu Jun 18 08:12:01 2015
bob,198.51.100.9:1194,5,6,Thu Jun 18 07:00:00 2015
ROUTING TABLE
Virtual Address,Common Name,Real Address,Last Ref
10.8.0.0/24,alice,203.0.113.7:51234,Thu Jun 18 08:12:09 2015
10.8.1.2,alice,203.0.113.7:51234,Thu Jun 18 08:12:09 2015
GLOBAL STATS
Max bcast/mcast queue length,0
END
";

    const V2: &str = "\
TITLE,OpenVPN 2.6.8 x86_64-pc-linux-gnu
TIME,2024-03-01 10:00:00,1709287200
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),Username,Client ID,Peer ID,Data Channel Cipher
CLIENT_LIST,alice,udp4:203.0.113.7:51234,10.8.1.2,,1200,3400,2024-03-01 09:00:00,1709283600,UNDEF,0,0,AES-256-GCM
CLIENT_LIST,UNDEF,198.51.100.2:40000,,,10,0,2024-03-01 09:59:00,1709287140,UNDEF,1,1,none
HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)
ROUTING_TABLE,10.8.1.2,alice,udp4:203.0.113.7:51234,2024-03-01 10:00:00,1709287200
GLOBAL_STATS,Max bcast/mcast queue length,0
END
";

    #[test]
    fn parses_v1() {
        let sessions = parse_status(V1).unwrap();
        assert_eq!(sessions.len(), 2);

        let alice = &sessions[0];
        assert_eq!(alice.name, "alice");
        assert_eq!(alice.real_address, "203.0.113.7");
        assert_eq!(alice.assigned, VpnAddress::Static(Ipv4Addr::new(10, 8, 1, 2)));
        assert_eq!(alice.bytes_received, 1200);
        assert_eq!(alice.bytes_sent, 3400);
        assert_eq!(
            alice.connected_since.unwrap().to_rfc3339(),
            "2015-06-18T04:23:03+00:00"
        );

        assert_eq!(sessions[1].name, "bob");
        assert_eq!(sessions[1].assigned, VpnAddress::Dynamic);
    }

    #[test]
    fn parses_v2() {
        let sessions = parse_status(V2).unwrap();
        assert_eq!(sessions.len(), 1);
        let alice = &sessions[0];
        assert_eq!(alice.real_address, "203.0.113.7");
        assert_eq!(alice.assigned, VpnAddress::Static(Ipv4Addr::new(10, 8, 1, 2)));
        assert_eq!(alice.connected_since.unwrap().timestamp(), 1_709_283_600);
    }

    #[test]
    fn parses_v3_tabs() {
        let v3 = V2.replace(',', "\t");
        let sessions = parse_status(&v3).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].bytes_sent, 3400);
    }

    #[test]
    fn empty_client_list_is_valid() {
        let text = "OpenVPN CLIENT LIST\nUpdated,Thu Jun 18 08:12:15 2015\nCommon Name,Real Address,Bytes Received,Bytes Sent,Connected Since\nROUTING TABLE\nGLOBAL STATS\nEND\n";
        assert!(parse_status(text).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_status("hello\nworld\n").is_err());
    }

    #[test_case("203.0.113.7:51234", "203.0.113.7" ; "v4 with port")]
    #[test_case("udp4:203.0.113.7:51234", "203.0.113.7" ; "protocol prefix")]
    #[test_case("tcp4-server:203.0.113.7:443", "203.0.113.7" ; "tcp server prefix")]
    #[test_case("[2001:db8::1]:1194", "2001:db8::1" ; "bracketed v6")]
    #[test_case("udp6:[2001:db8::1]:1194", "2001:db8::1" ; "v6 with prefix")]
    #[test_case("203.0.113.7", "203.0.113.7" ; "bare")]
    fn strips_real_address(input: &str, expected: &str) {
        assert_eq!(host_of(input), expected);
    }

    #[test_case("Thu Jun 18 04:23:03 2015", 1_434_601_383 ; "ctime")]
    #[test_case("2024-03-01 09:00:00", 1_709_283_600 ; "iso")]
    fn timestamps(input: &str, expected: i64) {
        assert_eq!(parse_timestamp(input).unwrap().timestamp(), expected);
    }
}

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

//! Live connection state reported by the VPN daemon and the merged status view.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Address the daemon reports for a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnAddress {
    /// The peer holds a fixed address.
    Static(Ipv4Addr),
    /// The daemon's routing table has no entry for the peer yet.
    Dynamic,
}

impl fmt::Display for VpnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(ip) => write!(f, "{ip}"),
            Self::Dynamic => f.write_str("dynamic"),
        }
    }
}

impl FromStr for VpnAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("dynamic") {
            return Ok(Self::Dynamic);
        }
        s.parse().map(Self::Static)
    }
}

impl Serialize for VpnAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VpnAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One entry of the daemon's live connection table. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    /// Certificate common name of the peer.
    pub name: String,
    /// Public source address, without the port.
    pub real_address: String,
    /// VPN address from the daemon's routing table.
    pub assigned: VpnAddress,
    /// When the connection was established, if the daemon reported a
    /// parseable timestamp.
    pub connected_since: Option<DateTime<Utc>>,
    /// Bytes received from the peer.
    pub bytes_received: u64,
    /// Bytes sent to the peer.
    pub bytes_sent: u64,
}

/// A configured client in the merged view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    /// Client name.
    pub name: String,
    /// Reserved VPN address.
    pub ip: String,
    /// Whether a live session exists for this client.
    pub online: bool,
    /// Live fields, present only when online.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDetails>,
}

/// Live fields of an online client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetails {
    /// Public source address.
    pub real_ip: String,
    /// Address the daemon routes to the peer.
    pub vpn_ip: VpnAddress,
    /// When the connection was established.
    pub connected_since: Option<DateTime<Utc>>,
    /// Bytes received from the peer.
    pub bytes_recv: u64,
    /// Bytes sent to the peer.
    pub bytes_sent: u64,
}

/// One group of the merged view with its clients ordered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// Group id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Icon.
    pub icon: String,
    /// Whether this is the administrative group.
    pub is_system: bool,
    /// Active clients of the group.
    pub clients: Vec<ClientStatus>,
}

/// Response of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Time of the last successful refresh.
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Error of the last refresh attempt if it failed.
    pub last_error: Option<String>,
    /// Groups in listing order.
    pub groups: Vec<GroupStatus>,
}

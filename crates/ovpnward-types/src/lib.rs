//! ovpnward-types: Shared API type definitions for the ovpnward admin service.
//!
//! This crate contains the request/response bodies exchanged over the HTTP
//! surface, so the server and any client of it agree on field names.

#![warn(missing_docs)]

pub mod session;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Envelope returned by mutating endpoints that carry no further payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Whether the operation took effect.
    pub success: bool,
    /// Human-readable failure reason, present only when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    /// A successful response with no error.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed response carrying `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// A client group as shown in the admin UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    /// Display name.
    pub name: String,
    /// Short opaque icon string (usually a single emoji).
    pub icon: String,
    /// First address of the group's range, as a host-order integer.
    pub range_start: u32,
    /// Last address of the group's range (inclusive).
    pub range_end: u32,
    /// Next never-issued address; `range_end + 1` when the cursor is exhausted.
    pub next_ip: u64,
    /// Dotted form of `range_start`.
    pub start_ip: String,
    /// Dotted form of `range_end`.
    pub end_ip: String,
    /// Number of addresses in the range.
    pub capacity: u32,
    /// Number of active (non-revoked) clients in the group.
    pub client_count: usize,
    /// Whether this is the protected administrative group.
    pub is_system: bool,
    /// Whether members of this group see every other group.
    pub can_see_all: bool,
}

/// Groups keyed by id, serialized as a JSON object whose key order follows
/// the registry's listing order (system group first, then by name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedGroups(pub Vec<(String, GroupView)>);

impl OrderedGroups {
    /// Ids in listing order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(id, _)| id.as_str())
    }

    /// Look up a group by id.
    pub fn get(&self, id: &str) -> Option<&GroupView> {
        self.0.iter().find(|(gid, _)| gid == id).map(|(_, g)| g)
    }
}

impl Serialize for OrderedGroups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, group) in &self.0 {
            map.serialize_entry(id, group)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedGroups {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedGroups;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of group id to group")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((id, group)) = access.next_entry::<String, GroupView>()? {
                    entries.push((id, group));
                }
                Ok(OrderedGroups(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Response of `GET /api/groups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsResponse {
    /// Every group, in listing order.
    pub groups: OrderedGroups,
}

/// Body of `POST /api/groups` and `PUT /api/groups/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRequest {
    /// Display name; trimmed, 1 to 50 characters.
    pub name: String,
    /// Icon; the server picks a default when omitted.
    #[serde(default)]
    pub icon: Option<String>,
}

/// Response of `POST /api/groups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupResponse {
    /// Always true; failures use [`ActionResponse`].
    pub success: bool,
    /// Id assigned to the new group.
    pub group_id: String,
    /// The group as created.
    pub group: GroupView,
}

/// Response of `GET /api/next-group-range`: an advisory preview of the range
/// the next created group would receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextRangeResponse {
    /// Whether a block of the configured size is still free.
    pub available: bool,
    /// First address of the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ip: Option<String>,
    /// Last address of the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ip: Option<String>,
    /// Size of the block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

/// Per-group outcome of `POST /api/recalculate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCounters {
    /// Cursor after compaction.
    pub next_ip: u64,
    /// Addresses waiting in the reclaim set.
    pub reclaimed: usize,
    /// Active clients holding an address.
    pub active: usize,
}

/// Response of `POST /api/recalculate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculateResponse {
    /// Always true.
    pub success: bool,
    /// Counters keyed by group id.
    pub groups: std::collections::BTreeMap<String, GroupCounters>,
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// One active client in `GET /api/clients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    /// Unique client name (certificate common name).
    pub name: String,
    /// Owning group id.
    pub group: String,
    /// Reserved VPN address.
    pub ip: String,
}

/// Response of `GET /api/clients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientsResponse {
    /// Active clients ordered by group listing order, then by name.
    pub clients: Vec<ClientSummary>,
}

/// Body of `POST /api/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientRequest {
    /// Client name: ASCII letters, digits, `-` and `_`, at most 64 characters.
    pub name: String,
    /// CA unlock passphrase.
    pub password: String,
    /// Target group id.
    pub group: String,
}

/// Response of `POST /api/create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClientResponse {
    /// Always true; failures use [`ActionResponse`].
    pub success: bool,
    /// Name of the created client.
    pub name: String,
    /// Address reserved for the client.
    pub ip: String,
    /// Owning group id.
    pub group: String,
}

/// Body of `POST /api/revoke`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeClientRequest {
    /// Client to revoke.
    pub name: String,
    /// CA unlock passphrase.
    pub password: String,
}

/// Body of `POST /api/auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Administrator password.
    pub password: String,
}

// ---------------------------------------------------------------------------
// Live status
// ---------------------------------------------------------------------------

/// One connected client in `GET /api/connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedClient {
    /// Client name.
    pub name: String,
    /// Display name of the owning group.
    pub group_name: String,
    /// Icon of the owning group.
    pub group_icon: String,
    /// VPN address of the client.
    pub vpn_ip: String,
    /// Public source address the client connected from.
    pub real_ip: String,
    /// When the current connection was established.
    pub connected_since: Option<DateTime<Utc>>,
    /// Bytes received from the client.
    pub bytes_recv: u64,
    /// Bytes sent to the client.
    pub bytes_sent: u64,
}

/// Response of `GET /api/connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedResponse {
    /// Online clients in merged-view order.
    pub clients: Vec<ConnectedClient>,
}

/// A client that the daemon refused because it has no client-config-dir
/// entry, as found in the daemon's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedClient {
    /// Common name presented by the peer.
    pub name: String,
    /// Source address of the latest attempt, if logged.
    pub real_ip: Option<String>,
    /// Time of the latest attempt, when the log line carried a timestamp.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Number of attempts seen in the scanned window.
    pub attempts: usize,
}

/// Response of `GET /api/rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedResponse {
    /// Rejected peers ordered by name.
    pub clients: Vec<RejectedClient>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str) -> GroupView {
        GroupView {
            name: name.to_string(),
            icon: "x".to_string(),
            range_start: 1,
            range_end: 4,
            next_ip: 1,
            start_ip: "0.0.0.1".to_string(),
            end_ip: "0.0.0.4".to_string(),
            capacity: 4,
            client_count: 0,
            is_system: false,
            can_see_all: false,
        }
    }

    #[test]
    fn ordered_groups_keep_insertion_order() {
        let groups = OrderedGroups(vec![
            ("zeta".to_string(), view("Zeta")),
            ("alpha".to_string(), view("Alpha")),
        ]);
        let json = serde_json::to_string(&groups).unwrap();
        assert!(json.find("\"zeta\"").unwrap() < json.find("\"alpha\"").unwrap());

        let parsed: OrderedGroups = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ids().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn action_response_omits_absent_error() {
        let json = serde_json::to_value(ActionResponse::ok()).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true }));

        let json = serde_json::to_value(ActionResponse::failed("nope")).unwrap();
        assert_eq!(json, serde_json::json!({ "success": false, "error": "nope" }));
    }
}

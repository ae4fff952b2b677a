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

//! Live session telemetry and its merge with the configured clients.

pub mod rejected;
pub mod source;
pub mod status;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ovpnward_types::ConnectedClient;
use ovpnward_types::session::{ClientStatus, GroupStatus, LiveSession, SessionDetails, StatusResponse};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::store::groups::listing_order;
use crate::store::{Client, Group, GroupRegistry, IdentityLedger};

pub use source::{ConfiguredSource, ManagementSource, SourceConfig, SourceError, StatusFileSource, StatusSource};
pub use status::parse_status;

/// Id of the trailing group holding clients whose group no longer exists.
pub const UNGROUPED_ID: &str = "ungrouped";

/// The last known session set. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    pub sessions: Vec<LiveSession>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

fn details(session: &LiveSession) -> SessionDetails {
    SessionDetails {
        real_ip: session.real_address.clone(),
        vpn_ip: session.assigned,
        connected_since: session.connected_since,
        bytes_recv: session.bytes_received,
        bytes_sent: session.bytes_sent,
    }
}

fn status_of(client: &Client, sessions: &HashMap<&str, &LiveSession>) -> ClientStatus {
    let session = sessions.get(client.name.as_str()).map(|s| details(s));
    ClientStatus {
        name: client.name.clone(),
        ip: client.ip.to_string(),
        online: session.is_some(),
        session,
    }
}

/// Group the active `clients` by group in listing order, marking each
/// online or offline. Clients within a group are ordered by the byte order
/// of their names. Sessions without a matching active client are dropped;
/// when the daemon reports a name twice the first entry wins. Clients whose
/// group is unknown land in a trailing [`UNGROUPED_ID`] group.
pub fn merge(sessions: &[LiveSession], clients: &[Client], groups: &[Group]) -> Vec<GroupStatus> {
    let mut by_name: HashMap<&str, &LiveSession> = HashMap::new();
    for session in sessions {
        by_name.entry(session.name.as_str()).or_insert(session);
    }

    let mut active: Vec<&Client> = clients.iter().filter(|c| !c.is_revoked()).collect();
    active.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let mut ordered: Vec<&Group> = groups.iter().collect();
    ordered.sort_by(|a, b| listing_order(a, b));

    let mut view: Vec<GroupStatus> = ordered
        .iter()
        .map(|g| GroupStatus {
            id: g.id.clone(),
            name: g.name.clone(),
            icon: g.icon.clone(),
            is_system: g.is_system,
            clients: active
                .iter()
                .filter(|c| c.group_id == g.id)
                .map(|c| status_of(c, &by_name))
                .collect(),
        })
        .collect();

    let orphans: Vec<ClientStatus> = active
        .iter()
        .filter(|c| !ordered.iter().any(|g| g.id == c.group_id))
        .map(|c| status_of(c, &by_name))
        .collect();
    if !orphans.is_empty() {
        view.push(GroupStatus {
            id: UNGROUPED_ID.to_string(),
            name: "Ungrouped".to_string(),
            icon: String::new(),
            is_system: false,
            clients: orphans,
        });
    }
    view
}

/// The online subset of a merged view, in view order.
pub fn connected(view: &[GroupStatus]) -> Vec<ConnectedClient> {
    view.iter()
        .flat_map(|group| {
            group.clients.iter().filter_map(move |client| {
                let session = client.session.as_ref()?;
                Some(ConnectedClient {
                    name: client.name.clone(),
                    group_name: group.name.clone(),
                    group_icon: group.icon.clone(),
                    vpn_ip: client.ip.clone(),
                    real_ip: session.real_ip.clone(),
                    connected_since: session.connected_since,
                    bytes_recv: session.bytes_recv,
                    bytes_sent: session.bytes_sent,
                })
            })
        })
        .collect()
}

/// Polls the daemon and keeps the last good session set. Never mutates the
/// ledger or the allocator.
pub struct SessionReconciler<S> {
    source: S,
    ledger: Arc<IdentityLedger>,
    groups: Arc<GroupRegistry>,
    timeout: Duration,
    cache: RwLock<Arc<SessionCache>>,
}

impl<S: StatusSource> SessionReconciler<S> {
    pub fn new(
        source: S,
        ledger: Arc<IdentityLedger>,
        groups: Arc<GroupRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            ledger,
            groups,
            timeout,
            cache: RwLock::new(Arc::new(SessionCache::default())),
        }
    }

    pub fn cache(&self) -> Arc<SessionCache> {
        Arc::clone(&self.cache.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn swap(&self, next: SessionCache) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    async fn query(&self) -> Result<Vec<LiveSession>, SourceError> {
        let text = tokio::time::timeout(self.timeout, self.source.fetch())
            .await
            .map_err(|_| SourceError::Timeout)??;
        Ok(parse_status(&text)?)
    }

    /// Query the daemon and replace the cached session set. On failure the
    /// previous sessions are kept and only the error is recorded.
    pub async fn refresh(&self) -> Result<Vec<LiveSession>, SourceError> {
        match self.query().await {
            Ok(sessions) => {
                let total = sessions.len();
                let sessions: Vec<LiveSession> = sessions
                    .into_iter()
                    .filter(|s| self.ledger.is_active(&s.name))
                    .collect();
                debug!(total, matched = sessions.len(), "session refresh");
                self.swap(SessionCache {
                    sessions: sessions.clone(),
                    refreshed_at: Some(Utc::now()),
                    last_error: None,
                });
                Ok(sessions)
            }
            Err(e) => {
                warn!(error = %e, "session refresh failed, keeping previous sessions");
                let prev = self.cache();
                self.swap(SessionCache {
                    sessions: prev.sessions.clone(),
                    refreshed_at: prev.refreshed_at,
                    last_error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn view(&self) -> (Arc<SessionCache>, Vec<GroupStatus>) {
        let cache = self.cache();
        let clients = self.ledger.list_clients(false);
        let groups = self.groups.list_groups();
        let view = merge(&cache.sessions, &clients, &groups);
        (cache, view)
    }

    pub fn status(&self) -> StatusResponse {
        let (cache, groups) = self.view();
        StatusResponse {
            refreshed_at: cache.refreshed_at,
            last_error: cache.last_error.clone(),
            groups,
        }
    }

    pub fn connected(&self) -> Vec<ConnectedClient> {
        let (_, view) = self.view();
        connected(&view)
    }

    /// Refresh every `interval` until the task is dropped.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // failures are logged and absorbed by refresh
            let _ = self.refresh().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::SealedKey;
    use crate::store::AddressRange;
    use crate::store::ledger::StoredCredential;
    use ovpnward_types::session::VpnAddress;

    fn group(id: &str, name: &str, system: bool) -> Group {
        Group {
            id: id.into(),
            name: name.into(),
            icon: "i".into(),
            range: AddressRange::new(1, 2).unwrap(),
            is_system: system,
            can_see_all: system,
            created_at: Utc::now(),
        }
    }

    fn client(name: &str, group_id: &str, ip: [u8; 4]) -> Client {
        Client {
            name: name.into(),
            group_id: group_id.into(),
            ip: ip.into(),
            serial: "1".into(),
            created_at: Utc::now(),
            not_after: Utc::now(),
            revoked_at: None,
            credential: StoredCredential {
                certificate_pem: String::new(),
                key: SealedKey {
                    ciphertext: String::new(),
                    nonce: String::new(),
                },
            },
        }
    }

    fn session(name: &str, real: &str) -> LiveSession {
        LiveSession {
            name: name.into(),
            real_address: real.into(),
            assigned: VpnAddress::Dynamic,
            connected_since: None,
            bytes_received: 10,
            bytes_sent: 20,
        }
    }

    #[test]
    fn offline_client_has_no_live_fields() {
        let view = merge(&[], &[client("alice", "eng", [10, 8, 0, 2])], &[group("eng", "eng", false)]);
        let alice = &view[0].clients[0];
        assert!(!alice.online);
        assert!(alice.session.is_none());
    }

    #[test]
    fn ghost_sessions_are_excluded() {
        let view = merge(
            &[session("ghost", "1.1.1.1"), session("alice", "2.2.2.2")],
            &[client("alice", "eng", [10, 8, 0, 2])],
            &[group("eng", "eng", false)],
        );
        let names: Vec<&str> = view
            .iter()
            .flat_map(|g| g.clients.iter().map(|c| c.name.as_str()))
            .collect();
        assert_eq!(names, ["alice"]);
        let alice = &view[0].clients[0];
        assert!(alice.online);
        assert_eq!(alice.session.as_ref().unwrap().bytes_sent, 20);
    }

    #[test]
    fn first_duplicate_session_wins() {
        let view = merge(
            &[session("alice", "1.1.1.1"), session("alice", "2.2.2.2")],
            &[client("alice", "eng", [10, 8, 0, 2])],
            &[group("eng", "eng", false)],
        );
        assert_eq!(view[0].clients[0].session.as_ref().unwrap().real_ip, "1.1.1.1");
    }

    #[test]
    fn view_follows_listing_order() {
        let groups = [
            group("zulu", "zulu", false),
            group("admins", "Administrators", true),
            group("alpha", "Alpha", false),
        ];
        let clients = [
            client("bob", "alpha", [10, 8, 0, 3]),
            client("Zed", "alpha", [10, 8, 0, 4]),
            client("amy", "alpha", [10, 8, 0, 2]),
            client("lost", "deleted", [10, 8, 9, 9]),
        ];
        let view = merge(&[], &clients, &groups);

        let ids: Vec<&str> = view.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, ["admins", "alpha", "zulu", UNGROUPED_ID]);

        let alpha: Vec<&str> = view[1].clients.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(alpha, ["Zed", "amy", "bob"]);
        assert_eq!(view[3].clients[0].name, "lost");
    }

    #[test]
    fn revoked_clients_are_not_listed() {
        let mut gone = client("gone", "eng", [10, 8, 0, 3]);
        gone.revoked_at = Some(Utc::now());
        let view = merge(&[session("gone", "1.1.1.1")], &[gone], &[group("eng", "eng", false)]);
        assert!(view[0].clients.is_empty());
    }

    #[test]
    fn connected_lists_online_in_view_order() {
        let groups = [group("b", "beta", false), group("a", "Admins", true)];
        let clients = [
            client("carol", "b", [10, 8, 0, 5]),
            client("dave", "a", [10, 8, 0, 2]),
            client("erin", "b", [10, 8, 0, 6]),
        ];
        let sessions = [session("erin", "3.3.3.3"), session("dave", "4.4.4.4")];
        let online = connected(&merge(&sessions, &clients, &groups));
        let names: Vec<&str> = online.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["dave", "erin"]);
        assert_eq!(online[0].group_name, "Admins");
        assert_eq!(online[1].vpn_ip, "10.8.0.6");
        assert_eq!(online[1].real_ip, "3.3.3.3");
    }
}

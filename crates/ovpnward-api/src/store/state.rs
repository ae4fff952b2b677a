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

//! Durable state: a single JSON document rewritten atomically on every
//! mutation, and an append-only JSON-lines audit trail next to it.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::alloc::RangeAllocator;
use super::ledger::Client;

const STATE_FILE: &str = "state.json";
const AUDIT_FILE: &str = "audit.log";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub next_ip: u64,
    pub is_system: bool,
    pub can_see_all: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub serial: String,
    pub name: String,
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDoc {
    #[serde(default)]
    pub groups: Vec<GroupRecord>,
    /// Every client ever issued, revoked ones included.
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub revocations: Vec<Revocation>,
}

impl StateDoc {
    pub fn upsert_group(&mut self, record: GroupRecord) {
        match self.groups.iter_mut().find(|g| g.id == record.id) {
            Some(existing) => *existing = record,
            None => self.groups.push(record),
        }
    }

    /// Copy the allocator's current cursors into the group records.
    pub fn sync_cursors(&mut self, allocator: &RangeAllocator) {
        for group in &mut self.groups {
            if let Some(state) = allocator.state(&group.id) {
                group.next_ip = state.next;
            }
        }
    }

    pub fn push_client(&mut self, client: Client) {
        self.clients.push(client);
    }

    /// Mark the active record `name`/`serial` revoked and append the serial to
    /// the revocation list. Returns false if no such active record exists.
    pub fn mark_revoked(&mut self, name: &str, serial: &str, at: DateTime<Utc>) -> bool {
        let Some(client) = self
            .clients
            .iter_mut()
            .find(|c| c.name == name && c.serial == serial && c.revoked_at.is_none())
        else {
            return false;
        };
        client.revoked_at = Some(at);
        self.revocations.push(Revocation {
            serial: serial.to_string(),
            name: name.to_string(),
            revoked_at: at,
        });
        true
    }

    /// Addresses held by active clients, per group id.
    pub fn active_addresses(&self) -> HashMap<&str, BTreeSet<u32>> {
        let mut map: HashMap<&str, BTreeSet<u32>> = HashMap::new();
        for client in self.clients.iter().filter(|c| c.revoked_at.is_none()) {
            map.entry(client.group_id.as_str())
                .or_default()
                .insert(u32::from(client.ip));
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    GroupCreated {
        group_id: String,
        name: String,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
    },
    GroupUpdated {
        group_id: String,
        name: String,
        icon: String,
    },
    ClientIssued {
        name: String,
        group_id: String,
        ip: Ipv4Addr,
        serial: String,
    },
    ClientRevoked {
        name: String,
        group_id: String,
        ip: Ipv4Addr,
        serial: String,
    },
}

#[derive(Serialize)]
struct AuditLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

// ---------------------------------------------------------------------------
// StateFile
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    audit_path: PathBuf,
    doc: Mutex<StateDoc>,
}

impl StateFile {
    /// Open (or start) the state kept in `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(STATE_FILE);

        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: StateDoc = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    groups = doc.groups.len(),
                    clients = doc.clients.len(),
                    "loaded state"
                );
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "state file not found, starting empty");
                StateDoc::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            audit_path: dir.join(AUDIT_FILE),
            doc: Mutex::new(doc),
        })
    }

    pub async fn snapshot(&self) -> StateDoc {
        self.doc.lock().await.clone()
    }

    /// Apply `f` to a copy of the document and write it out. The in-memory
    /// copy only changes once the write has landed.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StateDoc),
    {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        f(&mut next);
        self.write(&next).await?;
        *doc = next;
        Ok(())
    }

    async fn write(&self, doc: &StateDoc) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "state written");
        Ok(())
    }

    pub async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        let line = AuditLine {
            at: Utc::now(),
            event,
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

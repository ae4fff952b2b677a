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

//! Client identities: issuance, revocation and credential download.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, warn};

use super::alloc::{AllocError, CursorState, RangeAllocator};
use super::groups::GroupRegistry;
use super::state::{AuditEvent, StateDoc, StateError, StateFile};
use crate::pki::{CertificateAuthority, DaemonFiles, KeySealer, PkiError, ProfileTemplate, SealedKey};

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub certificate_pem: String,
    pub key: SealedKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub group_id: String,
    pub ip: Ipv4Addr,
    pub serial: String,
    pub created_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    pub credential: StoredCredential,
}

impl Client {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// A rendered `.ovpn` profile.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub name: String,
    pub profile: String,
}

impl CredentialBundle {
    pub fn file_name(&self) -> String {
        format!("{}.ovpn", self.name)
    }
}

/// Allocation counters for one group after a recalculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUsage {
    pub group_id: String,
    pub cursor: CursorState,
    pub active: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("incorrect CA passphrase")]
    InvalidAuth,

    #[error("a client with that name already exists")]
    NameConflict,

    #[error("group not found")]
    GroupNotFound,

    #[error("group is full, no addresses left")]
    GroupFull,

    #[error("client not found")]
    NotFound,

    #[error("client is already revoked")]
    AlreadyRevoked,

    #[error("another operation on this client is in progress")]
    Busy,

    #[error("client has been revoked")]
    Revoked,

    #[error(transparent)]
    Alloc(AllocError),

    #[error(transparent)]
    Pki(PkiError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("daemon file update failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile rendering failed")]
    Render(#[from] std::fmt::Error),

    #[error("signing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<PkiError> for LedgerError {
    fn from(e: PkiError) -> Self {
        match e {
            PkiError::InvalidSecret => Self::InvalidAuth,
            other => Self::Pki(other),
        }
    }
}

impl From<AllocError> for LedgerError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::GroupFull => Self::GroupFull,
            AllocError::GroupNotFound => Self::GroupNotFound,
            other => Self::Alloc(other),
        }
    }
}

type Result<T> = std::result::Result<T, LedgerError>;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LedgerError::Validation("name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LedgerError::Validation(format!(
            "name too long (max {MAX_NAME_LEN} characters)"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(LedgerError::Validation(
            "name may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

fn require_secret(secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(LedgerError::Validation("CA passphrase is required".into()));
    }
    Ok(())
}

/// Per-name lifecycle. `Pending` holds the name while a certificate is being
/// signed; `Revoking` keeps the record visible until revocation is durable.
#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Active(Client),
    Revoking(Client),
}

impl Slot {
    fn client(&self) -> Option<&Client> {
        match self {
            Slot::Pending => None,
            Slot::Active(c) | Slot::Revoking(c) => Some(c),
        }
    }
}

/// Puts a name's slot back unless disarmed: a pending reservation is
/// removed, a client being revoked becomes active again.
struct SlotGuard<'a> {
    slots: &'a DashMap<String, Slot>,
    name: &'a str,
    restore: Option<Client>,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn pending(slots: &'a DashMap<String, Slot>, name: &'a str) -> Self {
        Self {
            slots,
            name,
            restore: None,
            armed: true,
        }
    }

    fn revoking(slots: &'a DashMap<String, Slot>, name: &'a str, client: Client) -> Self {
        Self {
            slots,
            name,
            restore: Some(client),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.restore.take() {
            Some(client) => {
                self.slots
                    .insert(self.name.to_string(), Slot::Active(client));
            }
            None => {
                self.slots
                    .remove_if(self.name, |_, slot| matches!(slot, Slot::Pending));
            }
        }
    }
}

pub struct IdentityLedger {
    slots: DashMap<String, Slot>,
    revoked: RwLock<Vec<Client>>,
    ca: Arc<dyn CertificateAuthority>,
    sealer: KeySealer,
    profile: ProfileTemplate,
    files: DaemonFiles,
    allocator: Arc<RangeAllocator>,
    groups: Arc<GroupRegistry>,
    state: Arc<StateFile>,
}

impl std::fmt::Debug for IdentityLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityLedger")
            .field("clients", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl IdentityLedger {
    pub fn new(
        ca: Arc<dyn CertificateAuthority>,
        sealer: KeySealer,
        profile: ProfileTemplate,
        files: DaemonFiles,
        allocator: Arc<RangeAllocator>,
        groups: Arc<GroupRegistry>,
        state: Arc<StateFile>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            revoked: RwLock::new(Vec::new()),
            ca,
            sealer,
            profile,
            files,
            allocator,
            groups,
            state,
        }
    }

    /// Load client records from a persisted document. Groups must already be
    /// restored so the allocator knows which addresses are taken.
    pub fn restore(&self, doc: &StateDoc) {
        let mut revoked = self.revoked.write().unwrap_or_else(PoisonError::into_inner);
        for client in &doc.clients {
            if client.is_revoked() {
                revoked.push(client.clone());
            } else {
                self.slots
                    .insert(client.name.clone(), Slot::Active(client.clone()));
            }
        }
        info!(
            active = self.slots.len(),
            revoked = revoked.len(),
            "restored client ledger"
        );
    }

    async fn verify_secret(&self, secret: &str) -> Result<()> {
        let ca = Arc::clone(&self.ca);
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || ca.verify_secret(&secret)).await??;
        Ok(())
    }

    fn was_revoked(&self, name: &str) -> bool {
        self.revoked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| c.name == name)
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.state.append_audit(&event).await {
            warn!(error = %e, "failed to append audit event");
        }
    }

    fn render(&self, client: &Client, private_key_pem: &str) -> Result<CredentialBundle> {
        let profile = self.profile.render(
            self.ca.ca_certificate_pem(),
            &client.credential.certificate_pem,
            private_key_pem,
        )?;
        Ok(CredentialBundle {
            name: client.name.clone(),
            profile,
        })
    }

    /// Issue a certificate for `name` in `group_id`. The address is leased
    /// first and released again if any later step fails. The work runs on its
    /// own task, so a caller that goes away mid-issuance leaves either a fully
    /// issued client or nothing.
    #[tracing::instrument(skip(self, secret))]
    pub async fn create_client(
        self: &Arc<Self>,
        name: &str,
        group_id: &str,
        secret: &str,
    ) -> Result<(Client, CredentialBundle)> {
        validate_name(name)?;
        require_secret(secret)?;
        if group_id.is_empty() {
            return Err(LedgerError::Validation("a group must be selected".into()));
        }
        if self.groups.get(group_id).is_none() {
            return Err(LedgerError::GroupNotFound);
        }

        let ledger = Arc::clone(self);
        let (name, group_id, secret) = (name.to_string(), group_id.to_string(), secret.to_string());
        tokio::spawn(
            async move { ledger.create_detached(&name, &group_id, &secret).await }
                .in_current_span(),
        )
        .await?
    }

    async fn create_detached(
        &self,
        name: &str,
        group_id: &str,
        secret: &str,
    ) -> Result<(Client, CredentialBundle)> {
        self.verify_secret(secret).await?;

        let guard = match self.slots.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(LedgerError::NameConflict),
            Entry::Vacant(v) => {
                v.insert(Slot::Pending);
                SlotGuard::pending(&self.slots, name)
            }
        };

        let (client, bundle) = self.issue(name, group_id, secret).await?;
        self.slots
            .insert(name.to_string(), Slot::Active(client.clone()));
        guard.disarm();

        info!(client = %name, ip = %client.ip, serial = %client.serial, "client issued");
        self.audit(AuditEvent::ClientIssued {
            name: client.name.clone(),
            group_id: client.group_id.clone(),
            ip: client.ip,
            serial: client.serial.clone(),
        })
        .await;
        Ok((client, bundle))
    }

    async fn issue(
        &self,
        name: &str,
        group_id: &str,
        secret: &str,
    ) -> Result<(Client, CredentialBundle)> {
        let lease = self.allocator.lease(group_id)?;

        let ca = Arc::clone(&self.ca);
        let (cn, pass) = (name.to_string(), secret.to_string());
        let issued = match tokio::task::spawn_blocking(move || ca.issue(&pass, &cn)).await {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => {
                lease.release();
                return Err(e.into());
            }
            Err(e) => {
                lease.release();
                return Err(e.into());
            }
        };

        let key = match self.sealer.seal(issued.private_key_pem.as_bytes()) {
            Ok(key) => key,
            Err(e) => {
                lease.release();
                return Err(e.into());
            }
        };

        let client = Client {
            name: name.to_string(),
            group_id: group_id.to_string(),
            ip: lease.ip(),
            serial: issued.serial.clone(),
            created_at: Utc::now(),
            not_after: issued.not_after,
            revoked_at: None,
            credential: StoredCredential {
                certificate_pem: issued.certificate_pem.clone(),
                key,
            },
        };

        let bundle = match self.render(&client, &issued.private_key_pem) {
            Ok(bundle) => bundle,
            Err(e) => {
                lease.release();
                return Err(e);
            }
        };

        if let Err(e) = self.files.write_ccd(name, client.ip).await {
            lease.release();
            return Err(e.into());
        }

        let record = client.clone();
        let allocator = Arc::clone(&self.allocator);
        let persisted = self
            .state
            .update(|doc| {
                doc.push_client(record);
                doc.sync_cursors(&allocator);
            })
            .await;
        if let Err(e) = persisted {
            error!(client = %name, error = %e, "failed to persist client, rolling back");
            if let Err(e) = self.files.remove_ccd(name).await {
                warn!(client = %name, error = %e, "failed to remove client config during rollback");
            }
            lease.release();
            return Err(e.into());
        }

        lease.commit();
        Ok((client, bundle))
    }

    /// Revoke the active client `name`. Revoking a name that is only present
    /// as a revoked record fails with [`LedgerError::AlreadyRevoked`] and
    /// releases nothing. Runs on its own task like [`create_client`](Self::create_client).
    #[tracing::instrument(skip(self, secret))]
    pub async fn revoke_client(self: &Arc<Self>, name: &str, secret: &str) -> Result<Client> {
        validate_name(name)?;
        require_secret(secret)?;

        let ledger = Arc::clone(self);
        let (name, secret) = (name.to_string(), secret.to_string());
        tokio::spawn(async move { ledger.revoke_detached(&name, &secret).await }.in_current_span())
            .await?
    }

    async fn revoke_detached(&self, name: &str, secret: &str) -> Result<Client> {
        self.verify_secret(secret).await?;

        let client = match self.slots.get_mut(name) {
            None => None,
            Some(mut slot) => match slot.value().clone() {
                Slot::Active(client) => {
                    *slot = Slot::Revoking(client.clone());
                    Some(client)
                }
                Slot::Pending | Slot::Revoking(_) => return Err(LedgerError::Busy),
            },
        };
        let Some(client) = client else {
            return Err(if self.was_revoked(name) {
                LedgerError::AlreadyRevoked
            } else {
                LedgerError::NotFound
            });
        };
        let guard = SlotGuard::revoking(&self.slots, name, client.clone());

        self.files.publish_revocation(&client.serial).await?;

        let revoked_at = Utc::now();
        let serial = client.serial.clone();
        let persisted = self
            .state
            .update(|doc| {
                doc.mark_revoked(name, &serial, revoked_at);
            })
            .await;
        if let Err(e) = persisted {
            error!(client = %name, error = %e, "failed to persist revocation, rolling back");
            if let Err(e) = self.files.withdraw_revocation(&client.serial).await {
                warn!(client = %name, error = %e, "failed to withdraw revocation marker");
            }
            return Err(e.into());
        }

        // Durable from here on; release the address last.
        let mut record = client;
        record.revoked_at = Some(revoked_at);
        self.revoked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        self.slots.remove(name);
        guard.disarm();

        if let Err(e) = self.files.remove_ccd(name).await {
            warn!(client = %name, error = %e, "failed to remove client config");
        }
        if let Err(e) = self.allocator.release(&record.group_id, record.ip) {
            warn!(client = %name, error = %e, "failed to release address");
        }

        info!(client = %name, ip = %record.ip, serial = %record.serial, "client revoked");
        self.audit(AuditEvent::ClientRevoked {
            name: record.name.clone(),
            group_id: record.group_id.clone(),
            ip: record.ip,
            serial: record.serial.clone(),
        })
        .await;

        Ok(record)
    }

    /// The active client named `name`.
    pub fn get_client(&self, name: &str) -> Result<Client> {
        self.slots
            .get(name)
            .and_then(|slot| slot.client().cloned())
            .ok_or(LedgerError::NotFound)
    }

    /// Active clients sorted by name, optionally followed by revoked records.
    pub fn list_clients(&self, include_revoked: bool) -> Vec<Client> {
        let mut clients: Vec<Client> = self
            .slots
            .iter()
            .filter_map(|slot| slot.client().cloned())
            .collect();
        if include_revoked {
            clients.extend(
                self.revoked
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned(),
            );
        }
        clients.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        clients
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .is_some_and(|slot| slot.client().is_some())
    }

    pub fn client_count(&self, group_id: &str) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.client().is_some_and(|c| c.group_id == group_id))
            .count()
    }

    /// Re-render the originally issued profile. Never signs anything.
    pub fn download(&self, name: &str) -> Result<CredentialBundle> {
        let client = match self.slots.get(name).map(|slot| slot.client().cloned()) {
            Some(Some(client)) => client,
            Some(None) => return Err(LedgerError::NotFound),
            None if self.was_revoked(name) => return Err(LedgerError::Revoked),
            None => return Err(LedgerError::NotFound),
        };
        let key = self.sealer.open(&client.credential.key)?;
        let key = String::from_utf8(key).map_err(|_| LedgerError::Pki(PkiError::Encryption))?;
        self.render(&client, &key)
    }

    /// Pull every group's cursor back over trailing reclaimed addresses and
    /// persist the result.
    #[tracing::instrument(skip(self))]
    pub async fn recalculate(&self) -> Result<BTreeMap<String, GroupUsage>> {
        let mut usage = BTreeMap::new();
        for group in self.groups.list_groups() {
            let cursor = self.allocator.compact(&group.id)?;
            usage.insert(
                group.id.clone(),
                GroupUsage {
                    active: self.client_count(&group.id),
                    group_id: group.id,
                    cursor,
                },
            );
        }
        let allocator = Arc::clone(&self.allocator);
        self.state
            .update(|doc| doc.sync_cursors(&allocator))
            .await?;
        info!(groups = usage.len(), "recalculated group counters");
        Ok(usage)
    }
}

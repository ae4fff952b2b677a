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

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::alloc::{AddressRange, AllocError, CursorState, RangeAllocator};
use super::state::{AuditEvent, GroupRecord, StateError, StateFile};

pub const DEFAULT_ICON: &str = "\u{1F3E2}";
const MAX_NAME_CHARS: usize = 50;
const MAX_ICON_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub range: AddressRange,
    pub is_system: bool,
    pub can_see_all: bool,
    pub created_at: DateTime<Utc>,
}

impl Group {
    fn record(&self, next_ip: u64) -> GroupRecord {
        GroupRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            range_start: self.range.start_ip(),
            range_end: self.range.end_ip(),
            next_ip,
            is_system: self.is_system,
            can_see_all: self.can_see_all,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),

    #[error("a group with that name already exists")]
    NameConflict,

    #[error("group not found")]
    NotFound,

    #[error("the administrators group cannot be edited")]
    Forbidden,

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    State(#[from] StateError),
}

type Result<T> = std::result::Result<T, RegistryError>;

/// Listing order: system groups first, then by name compared
/// case-insensitively, then by exact name, then by id.
pub fn listing_order(a: &Group, b: &Group) -> Ordering {
    b.is_system
        .cmp(&a.is_system)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

/// Lowercase ASCII slug of `name`; runs of anything else collapse to `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RegistryError::Validation("name is required".into()));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(RegistryError::Validation(format!(
            "name too long (max {MAX_NAME_CHARS} characters)"
        )));
    }
    Ok(name.to_string())
}

fn validate_icon(icon: Option<&str>) -> Result<String> {
    let icon = icon.map(str::trim).filter(|i| !i.is_empty()).unwrap_or(DEFAULT_ICON);
    if icon.chars().count() > MAX_ICON_CHARS {
        return Err(RegistryError::Validation(format!(
            "icon too long (max {MAX_ICON_CHARS} characters)"
        )));
    }
    Ok(icon.to_string())
}

/// CRUD over groups. Every mutation is serialized by `write_lock`; range
/// reservation itself is serialized inside the allocator.
#[derive(Debug)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Group>>,
    write_lock: tokio::sync::Mutex<()>,
    allocator: Arc<RangeAllocator>,
    state: Arc<StateFile>,
    block_size: u32,
}

impl GroupRegistry {
    pub fn new(allocator: Arc<RangeAllocator>, state: Arc<StateFile>, block_size: u32) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            allocator,
            state,
            block_size,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Re-attach persisted groups and their ranges. `in_use` holds the
    /// addresses of active clients per group id.
    pub fn restore(
        &self,
        records: &[GroupRecord],
        in_use: &HashMap<&str, BTreeSet<u32>>,
    ) -> Result<()> {
        let empty = BTreeSet::new();
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            let range = AddressRange::new(u32::from(record.range_start), u32::from(record.range_end))
                .ok_or_else(|| {
                    RegistryError::Validation(format!("group {} has an inverted range", record.id))
                })?;
            let used = in_use.get(record.id.as_str()).unwrap_or(&empty);
            self.allocator.restore(&record.id, range, record.next_ip, used)?;
            groups.insert(
                record.id.clone(),
                Group {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    icon: record.icon.clone(),
                    range,
                    is_system: record.is_system,
                    can_see_all: record.can_see_all,
                    created_at: record.created_at,
                },
            );
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Group> {
        self.read().get(id).cloned()
    }

    /// All groups in [`listing_order`].
    pub fn list_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.read().values().cloned().collect();
        groups.sort_by(listing_order);
        groups
    }

    /// Allocation cursor of group `id`.
    pub fn cursor(&self, id: &str) -> Option<CursorState> {
        self.allocator.state(id)
    }

    /// Advisory preview of the range the next created group would get.
    pub fn preview(&self) -> Option<AddressRange> {
        self.allocator.preview(self.block_size)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Group>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_taken(&self, name: &str, except: Option<&str>) -> bool {
        self.read()
            .values()
            .any(|g| g.name == name && Some(g.id.as_str()) != except)
    }

    fn unique_id(&self, name: &str) -> String {
        let groups = self.read();
        let base = slugify(name);
        let base = if base.is_empty() {
            format!("group-{}", groups.len())
        } else {
            base
        };
        if !groups.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !groups.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_group(&self, name: &str, icon: Option<&str>) -> Result<Group> {
        self.insert_group(name, icon, false).await
    }

    /// Create the administrative group unless one already exists.
    pub async fn ensure_system_group(&self, name: &str, icon: &str) -> Result<Group> {
        if let Some(existing) = self.read().values().find(|g| g.is_system) {
            return Ok(existing.clone());
        }
        let group = self.insert_group(name, Some(icon), true).await?;
        info!(group_id = %group.id, range = %group.range, "created system group");
        Ok(group)
    }

    async fn insert_group(&self, name: &str, icon: Option<&str>, system: bool) -> Result<Group> {
        let name = validate_name(name)?;
        let icon = validate_icon(icon)?;

        let _guard = self.write_lock.lock().await;
        if self.name_taken(&name, None) {
            return Err(RegistryError::NameConflict);
        }

        let id = self.unique_id(&name);
        let range = self.allocator.reserve_range(&id, self.block_size)?;
        let group = Group {
            id: id.clone(),
            name,
            icon,
            range,
            is_system: system,
            can_see_all: system,
            created_at: Utc::now(),
        };

        let record = group.record(u64::from(range.start));
        if let Err(e) = self.state.update(|doc| doc.upsert_group(record)).await {
            self.allocator.forget(&id);
            return Err(e.into());
        }

        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), group.clone());

        info!(group_id = %id, range = %range, "group created");
        self.audit(AuditEvent::GroupCreated {
            group_id: id,
            name: group.name.clone(),
            range_start: range.start_ip(),
            range_end: range.end_ip(),
        })
        .await;

        Ok(group)
    }

    /// Rename or re-icon a group. The range is immutable.
    #[tracing::instrument(skip(self))]
    pub async fn update_group(&self, id: &str, name: &str, icon: Option<&str>) -> Result<Group> {
        let name = validate_name(name)?;
        let icon = validate_icon(icon)?;

        let _guard = self.write_lock.lock().await;
        let mut group = self.get(id).ok_or(RegistryError::NotFound)?;
        if group.is_system {
            return Err(RegistryError::Forbidden);
        }
        if self.name_taken(&name, Some(id)) {
            return Err(RegistryError::NameConflict);
        }

        group.name = name;
        group.icon = icon;

        let next = self
            .allocator
            .state(id)
            .map_or(u64::from(group.range.start), |s| s.next);
        let record = group.record(next);
        self.state.update(|doc| doc.upsert_group(record)).await?;

        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), group.clone());

        self.audit(AuditEvent::GroupUpdated {
            group_id: id.to_string(),
            name: group.name.clone(),
            icon: group.icon.clone(),
        })
        .await;

        Ok(group)
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.state.append_audit(&event).await {
            warn!(error = %e, "failed to append audit event");
        }
    }
}

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

//! Address bookkeeping: disjoint per-group ranges carved out of one address
//! space, and a per-group cursor plus reclaim set for handing out addresses.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use tracing::debug;

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// Inclusive range of IPv4 addresses held as host-order integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    pub fn contains(&self, ip: u32) -> bool {
        self.start <= ip && ip <= self.end
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn start_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn end_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// Host addresses of `network`: everything except the network and
    /// broadcast addresses (a /31 or /32 keeps all of its addresses).
    pub fn hosts_of(network: Ipv4Network) -> Self {
        let first = u32::from(network.network());
        let last = u32::from(network.broadcast());
        if network.prefix() >= 31 {
            Self { start: first, end: last }
        } else {
            Self { start: first + 1, end: last - 1 }
        }
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start_ip(), self.end_ip())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no free block of {size} addresses left in the address space")]
    NoRangeAvailable { size: u32 },

    #[error("group not found")]
    GroupNotFound,

    #[error("group already owns a range")]
    AlreadyReserved,

    #[error("range {range} overlaps an existing reservation")]
    Overlap { range: AddressRange },

    #[error("no more addresses available in this group")]
    GroupFull,

    #[error("address {ip} is outside the group's range")]
    OutOfRange { ip: Ipv4Addr },
}

type Result<T> = std::result::Result<T, AllocError>;

// ---------------------------------------------------------------------------
// Per-group cursor
// ---------------------------------------------------------------------------

/// Cursor plus reclaim set for one group. `next` may sit one past
/// `range.end`, which marks the never-issued part of the range as exhausted.
#[derive(Debug)]
struct Cursor {
    range: AddressRange,
    next: u64,
    reclaimed: BTreeSet<u32>,
}

impl Cursor {
    fn fresh(range: AddressRange) -> Self {
        Self {
            range,
            next: u64::from(range.start),
            reclaimed: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<u32> {
        if let Some(ip) = self.reclaimed.pop_first() {
            return Ok(ip);
        }
        if self.next > u64::from(self.range.end) {
            return Err(AllocError::GroupFull);
        }
        let ip = self.next as u32;
        self.next += 1;
        Ok(ip)
    }

    /// Returns false when the address was never issued or is already free.
    fn release(&mut self, ip: u32) -> Result<bool> {
        if !self.range.contains(ip) {
            return Err(AllocError::OutOfRange { ip: Ipv4Addr::from(ip) });
        }
        if u64::from(ip) >= self.next {
            return Ok(false);
        }
        Ok(self.reclaimed.insert(ip))
    }

    fn compact(&mut self) {
        while self.next > u64::from(self.range.start) {
            let below = (self.next - 1) as u32;
            if !self.reclaimed.remove(&below) {
                break;
            }
            self.next -= 1;
        }
    }

    fn state(&self) -> CursorState {
        CursorState {
            range: self.range,
            next: self.next,
            reclaimed: self.reclaimed.len(),
        }
    }
}

/// Read-only copy of a group's allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub range: AddressRange,
    pub next: u64,
    pub reclaimed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Owner {
    Group(String),
    Fixed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lowest block of `size` addresses in `pool` that does not touch any
/// reservation.
fn first_fit(
    pool: AddressRange,
    reservations: &BTreeMap<u32, (u32, Owner)>,
    size: u32,
) -> Option<AddressRange> {
    if size == 0 {
        return None;
    }
    let size = u64::from(size);
    let mut candidate = u64::from(pool.start);

    for (&start, (end, _)) in reservations {
        let (start, end) = (u64::from(start), u64::from(*end));
        if end < candidate {
            continue;
        }
        if start >= candidate + size {
            break;
        }
        candidate = end + 1;
    }

    let last = candidate + size - 1;
    if last > u64::from(pool.end) {
        return None;
    }
    AddressRange::new(candidate as u32, last as u32)
}

// ---------------------------------------------------------------------------
// RangeAllocator
// ---------------------------------------------------------------------------

/// Owns the address space. Range reservations are serialized by one global
/// lock; address allocation takes only the owning group's lock.
#[derive(Debug)]
pub struct RangeAllocator {
    pool: AddressRange,
    reservations: Mutex<BTreeMap<u32, (u32, Owner)>>,
    cursors: DashMap<String, Arc<Mutex<Cursor>>>,
}

impl RangeAllocator {
    /// An allocator over `pool`, with `fixed` addresses (the daemon's own
    /// address, gateways) never handed to any group.
    pub fn new(pool: AddressRange, fixed: &[Ipv4Addr]) -> Self {
        let reservations = fixed
            .iter()
            .map(|&ip| (u32::from(ip), (u32::from(ip), Owner::Fixed)))
            .collect();
        Self {
            pool,
            reservations: Mutex::new(reservations),
            cursors: DashMap::new(),
        }
    }

    /// Host addresses of `network` minus `server_address`.
    pub fn for_network(network: Ipv4Network, server_address: Ipv4Addr) -> Self {
        Self::new(AddressRange::hosts_of(network), &[server_address])
    }

    pub fn pool(&self) -> AddressRange {
        self.pool
    }

    /// Advisory: the block `reserve_range` would pick right now. A concurrent
    /// reservation may still claim it first.
    pub fn preview(&self, size: u32) -> Option<AddressRange> {
        let reservations = lock(&self.reservations);
        first_fit(self.pool, &reservations, size)
    }

    /// Reserve the lowest free block of `size` addresses and attach it to
    /// `group_id` before the global lock is released.
    #[tracing::instrument(skip(self))]
    pub fn reserve_range(&self, group_id: &str, size: u32) -> Result<AddressRange> {
        let mut reservations = lock(&self.reservations);
        if self.cursors.contains_key(group_id) {
            return Err(AllocError::AlreadyReserved);
        }

        let range = first_fit(self.pool, &reservations, size)
            .ok_or(AllocError::NoRangeAvailable { size })?;

        reservations.insert(range.start, (range.end, Owner::Group(group_id.to_string())));
        self.cursors
            .insert(group_id.to_string(), Arc::new(Mutex::new(Cursor::fresh(range))));

        debug!(group_id, %range, "reserved range");
        Ok(range)
    }

    /// Re-attach a persisted range. The reclaim set is rebuilt as every
    /// address below `next` that no active client holds.
    pub fn restore(
        &self,
        group_id: &str,
        range: AddressRange,
        next: u64,
        in_use: &BTreeSet<u32>,
    ) -> Result<()> {
        let mut reservations = lock(&self.reservations);
        if self.cursors.contains_key(group_id) {
            return Err(AllocError::AlreadyReserved);
        }
        let clashes = reservations
            .iter()
            .any(|(&start, (end, _))| AddressRange { start, end: *end }.overlaps(&range));
        if clashes {
            return Err(AllocError::Overlap { range });
        }

        let next = next
            .clamp(u64::from(range.start), u64::from(range.end) + 1)
            .max(in_use.last().map_or(0, |&ip| u64::from(ip) + 1));
        let reclaimed = (u64::from(range.start)..next)
            .map(|ip| ip as u32)
            .filter(|ip| !in_use.contains(ip))
            .collect();

        reservations.insert(range.start, (range.end, Owner::Group(group_id.to_string())));
        self.cursors.insert(
            group_id.to_string(),
            Arc::new(Mutex::new(Cursor { range, next, reclaimed })),
        );
        Ok(())
    }

    /// Drop a group's reservation entirely. Used to undo a reservation whose
    /// group record could not be persisted.
    pub fn forget(&self, group_id: &str) {
        let mut reservations = lock(&self.reservations);
        if let Some((_, cursor)) = self.cursors.remove(group_id) {
            let start = lock(&cursor).range.start;
            if matches!(reservations.get(&start), Some((_, Owner::Group(owner))) if owner == group_id) {
                reservations.remove(&start);
            }
        }
    }

    fn cursor(&self, group_id: &str) -> Result<Arc<Mutex<Cursor>>> {
        self.cursors
            .get(group_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(AllocError::GroupNotFound)
    }

    /// Hand out the lowest reclaimed address, or the cursor address if the
    /// reclaim set is empty.
    #[tracing::instrument(skip(self))]
    pub fn allocate_next(&self, group_id: &str) -> Result<Ipv4Addr> {
        let cursor = self.cursor(group_id)?;
        let ip = lock(&cursor).allocate()?;
        Ok(Ipv4Addr::from(ip))
    }

    /// Like [`allocate_next`](Self::allocate_next), but returns a [`Lease`]
    /// that must be either committed or released.
    pub fn lease(self: &Arc<Self>, group_id: &str) -> Result<Lease> {
        let ip = self.allocate_next(group_id)?;
        Ok(Lease {
            allocator: Arc::clone(self),
            group_id: group_id.to_string(),
            ip,
            settled: false,
        })
    }

    /// Return `ip` to the group's reclaim set. Returns false when the address
    /// was already free, so a repeated release is a no-op.
    #[tracing::instrument(skip(self))]
    pub fn release(&self, group_id: &str, ip: Ipv4Addr) -> Result<bool> {
        let cursor = self.cursor(group_id)?;
        let released = lock(&cursor).release(u32::from(ip))?;
        if !released {
            debug!(group_id, %ip, "address already free");
        }
        Ok(released)
    }

    /// Move the cursor back over reclaimed addresses directly below it.
    pub fn compact(&self, group_id: &str) -> Result<CursorState> {
        let cursor = self.cursor(group_id)?;
        let mut cursor = lock(&cursor);
        cursor.compact();
        Ok(cursor.state())
    }

    pub fn state(&self, group_id: &str) -> Option<CursorState> {
        let cursor = self.cursor(group_id).ok()?;
        let state = lock(&cursor).state();
        Some(state)
    }
}

/// An allocated address not yet bound to a durable client record. Settled by
/// exactly one of `commit` or `release`; a lease dropped unsettled releases
/// its address, so it can never leak or be returned to the pool twice.
#[derive(Debug)]
#[must_use = "a lease must be committed or released"]
pub struct Lease {
    allocator: Arc<RangeAllocator>,
    group_id: String,
    ip: Ipv4Addr,
    settled: bool,
}

impl Lease {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn commit(mut self) -> Ipv4Addr {
        self.settled = true;
        self.ip
    }

    /// Compensating action for a failed issuance.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Err(e) = self.allocator.release(&self.group_id, self.ip) {
            tracing::error!(group_id = %self.group_id, ip = %self.ip, error = %e, "failed to roll back lease");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.settled {
            debug!(group_id = %self.group_id, ip = %self.ip, "unsettled lease dropped");
        }
        self.give_back();
    }
}

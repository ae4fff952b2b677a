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

pub mod alloc;
pub mod groups;
pub mod ledger;
pub mod state;

pub use alloc::{AddressRange, AllocError, CursorState, Lease, RangeAllocator};
pub use groups::{Group, GroupRegistry, RegistryError};
pub use ledger::{Client, CredentialBundle, GroupUsage, IdentityLedger, LedgerError};
pub use state::{AuditEvent, StateDoc, StateError, StateFile};

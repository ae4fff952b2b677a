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

//! Wiring: builds every component from configuration, restoring persisted
//! state in dependency order.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::auth::AuthSettings;
use crate::config::Config;
use crate::pki::{CertificateAuthority, DaemonFiles, KeySealer, OpenSslAuthority, PkiError};
use crate::routes::{RejectedLog, Services};
use crate::sessions::{ConfiguredSource, SessionReconciler};
use crate::store::{GroupRegistry, IdentityLedger, RangeAllocator, RegistryError, StateError, StateFile};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to open state: {0}")]
    State(#[from] StateError),

    #[error("failed to restore groups: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to load certificate authority: {0}")]
    Pki(#[from] PkiError),
}

/// Build the component graph with an explicit CA, so tests can supply
/// their own.
pub async fn build_with(
    config: &Config,
    ca: Arc<dyn CertificateAuthority>,
) -> Result<Services, BootstrapError> {
    let server = &config.server;
    let net = &server.network;

    let state = Arc::new(StateFile::open(&server.state_dir).await?);
    let allocator = Arc::new(RangeAllocator::for_network(
        net.address_space,
        net.server_address,
    ));

    let registry = Arc::new(GroupRegistry::new(
        Arc::clone(&allocator),
        Arc::clone(&state),
        net.group_block_size,
    ));
    let doc = state.snapshot().await;
    registry.restore(&doc.groups, &doc.active_addresses())?;
    registry
        .ensure_system_group(&net.system_group_name, &net.system_group_icon)
        .await?;

    let files = DaemonFiles::new(
        server.pki.ccd_dir.clone(),
        server.pki.crl_dir.clone(),
        net.address_space.mask(),
    );
    let ledger = Arc::new(IdentityLedger::new(
        ca,
        KeySealer::new(config.key_secret),
        server.profile.clone(),
        files,
        Arc::clone(&allocator),
        Arc::clone(&registry),
        Arc::clone(&state),
    ));
    ledger.restore(&doc);

    let source = ConfiguredSource::from_config(
        &server.telemetry.source,
        config.management_password.clone(),
    );
    let sessions = Arc::new(SessionReconciler::new(
        source,
        Arc::clone(&ledger),
        Arc::clone(&registry),
        Duration::from_secs(server.telemetry.timeout_secs),
    ));

    info!(
        state = %state.path().display(),
        pool = %allocator.pool(),
        block_size = registry.block_size(),
        groups = doc.groups.len(),
        clients = doc.clients.len(),
        "components ready"
    );

    Ok(Services {
        groups: registry,
        ledger,
        sessions,
        auth: AuthSettings {
            jwt_secret: config.jwt_secret.clone(),
            admin_password_hash: config.admin_password_hash.clone(),
        },
        rejected: RejectedLog {
            path: server.telemetry.log_file.clone(),
            tail_lines: server.telemetry.rejected_tail_lines,
        },
    })
}

/// Build the component graph with the CA named in configuration.
pub async fn build(config: &Config) -> Result<Services, BootstrapError> {
    let pki = &config.server.pki;
    let ca = OpenSslAuthority::load(&pki.ca_cert, &pki.ca_key, pki.cert_days)?;
    build_with(config, Arc::new(ca)).await
}

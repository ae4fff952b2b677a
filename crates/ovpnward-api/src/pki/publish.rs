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

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::debug;

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Files the OpenVPN daemon reads: per-client `client-config-dir` entries
/// and the `crl-verify ... dir` revocation directory. Either directory may
/// be left unconfigured, in which case the matching writes are skipped.
#[derive(Debug, Clone)]
pub struct DaemonFiles {
    ccd_dir: Option<PathBuf>,
    crl_dir: Option<PathBuf>,
    netmask: Ipv4Addr,
}

impl DaemonFiles {
    pub fn new(ccd_dir: Option<PathBuf>, crl_dir: Option<PathBuf>, netmask: Ipv4Addr) -> Self {
        Self {
            ccd_dir,
            crl_dir,
            netmask,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, Ipv4Addr::new(255, 255, 255, 0))
    }

    pub async fn write_ccd(&self, name: &str, ip: Ipv4Addr) -> io::Result<()> {
        let Some(dir) = &self.ccd_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let body = format!("ifconfig-push {ip} {}\n", self.netmask);
        tokio::fs::write(dir.join(name), body).await?;
        debug!(client = %name, %ip, "wrote client config");
        Ok(())
    }

    pub async fn remove_ccd(&self, name: &str) -> io::Result<()> {
        match &self.ccd_dir {
            Some(dir) => remove_if_present(&dir.join(name)).await,
            None => Ok(()),
        }
    }

    /// Drop the marker for `serial` into the CRL directory. OpenVPN rejects
    /// any certificate whose decimal serial names a file there.
    pub async fn publish_revocation(&self, serial: &str) -> io::Result<()> {
        let Some(dir) = &self.crl_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(serial), b"").await?;
        debug!(%serial, "published revocation");
        Ok(())
    }

    pub async fn withdraw_revocation(&self, serial: &str) -> io::Result<()> {
        match &self.crl_dir {
            Some(dir) => remove_if_present(&dir.join(serial)).await,
            None => Ok(()),
        }
    }
}

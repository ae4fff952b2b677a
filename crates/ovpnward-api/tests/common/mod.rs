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

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use ovpnward_api::pki::{
    CertificateAuthority, DaemonFiles, IssuedCredential, KeySealer, OpenSslAuthority, PkiError,
    ProfileTemplate,
};
use ovpnward_api::store::{GroupRegistry, IdentityLedger, RangeAllocator, StateFile};
use tempfile::TempDir;

pub const CA_SECRET: &str = "ca-secret";
pub const KEY_SECRET: [u8; 32] = [0x42; 32];

pub fn test_ca() -> Arc<OpenSslAuthority> {
    let (cert, key) = OpenSslAuthority::generate("Test CA", CA_SECRET, 30).unwrap();
    Arc::new(OpenSslAuthority::from_pem(cert.as_bytes(), key.into_bytes(), 30).unwrap())
}

/// Signs normally until `fail` is set, then refuses to issue. A non-zero
/// `delay_ms` stalls every call, leaving room to cancel the caller.
pub struct FlakyCa {
    pub inner: Arc<OpenSslAuthority>,
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
}

impl FlakyCa {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: test_ca(),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn stall(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

impl CertificateAuthority for FlakyCa {
    fn verify_secret(&self, secret: &str) -> Result<(), PkiError> {
        self.stall();
        self.inner.verify_secret(secret)
    }

    fn issue(&self, secret: &str, common_name: &str) -> Result<IssuedCredential, PkiError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PkiError::Io(std::io::Error::other("signing backend offline")));
        }
        self.stall();
        self.inner.issue(secret, common_name)
    }

    fn ca_certificate_pem(&self) -> &str {
        self.inner.ca_certificate_pem()
    }
}

/// Components wired by hand over a /24 with the server on .1, so the first
/// group starts at .2.
pub struct Fixture {
    pub dir: TempDir,
    pub allocator: Arc<RangeAllocator>,
    pub registry: Arc<GroupRegistry>,
    pub ledger: Arc<IdentityLedger>,
    pub state: Arc<StateFile>,
}

impl Fixture {
    pub async fn new(ca: Arc<dyn CertificateAuthority>, block_size: u32) -> Self {
        Self::open(tempfile::tempdir().unwrap(), ca, block_size).await
    }

    /// Build components over the state already in `dir`.
    pub async fn open(dir: TempDir, ca: Arc<dyn CertificateAuthority>, block_size: u32) -> Self {
        let net: Ipv4Network = "10.8.0.0/24".parse().unwrap();
        let allocator = Arc::new(RangeAllocator::for_network(net, Ipv4Addr::new(10, 8, 0, 1)));
        let state = Arc::new(StateFile::open(&dir.path().join("state")).await.unwrap());
        let registry = Arc::new(GroupRegistry::new(
            Arc::clone(&allocator),
            Arc::clone(&state),
            block_size,
        ));
        let doc = state.snapshot().await;
        registry.restore(&doc.groups, &doc.active_addresses()).unwrap();

        let files = DaemonFiles::new(
            Some(dir.path().join("ccd")),
            Some(dir.path().join("crl")),
            net.mask(),
        );
        let profile = ProfileTemplate {
            remote_host: "vpn.example.com".into(),
            ..ProfileTemplate::default()
        };
        let ledger = Arc::new(IdentityLedger::new(
            ca,
            KeySealer::new(KEY_SECRET),
            profile,
            files,
            Arc::clone(&allocator),
            Arc::clone(&registry),
            Arc::clone(&state),
        ));
        ledger.restore(&doc);

        Self {
            dir,
            allocator,
            registry,
            ledger,
            state,
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Make the next state write fail by occupying the temp file path.
    pub fn block_state_writes(&self) {
        std::fs::create_dir_all(self.path("state/state.json.tmp")).unwrap();
    }

    pub fn unblock_state_writes(&self) {
        std::fs::remove_dir_all(self.path("state/state.json.tmp")).unwrap();
    }
}

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

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

//! Certificate authority operations and the files that expose them to the
//! VPN daemon.

pub mod authority;
pub mod profile;
pub mod publish;
pub mod sealer;

use chrono::{DateTime, Utc};

pub use authority::OpenSslAuthority;
pub use profile::ProfileTemplate;
pub use publish::DaemonFiles;
pub use sealer::{KeySealer, SealedKey};

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("invalid CA passphrase")]
    InvalidSecret,

    #[error("CA private key does not match the CA certificate")]
    KeyMismatch,

    #[error("CA private key must be stored encrypted")]
    UnencryptedKey,

    #[error("openssl error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key encryption/decryption failed")]
    Encryption,
}

/// Material produced by signing one client certificate.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    /// Decimal certificate serial, the form OpenVPN's `crl-verify dir` uses.
    pub serial: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub not_after: DateTime<Utc>,
}

/// The signing primitive. Implementations are CPU-bound and called from a
/// blocking task.
pub trait CertificateAuthority: Send + Sync {
    /// Check that `secret` unlocks the CA key.
    fn verify_secret(&self, secret: &str) -> Result<(), PkiError>;

    /// Generate a key pair and sign a client certificate for `common_name`.
    fn issue(&self, secret: &str, common_name: &str) -> Result<IssuedCredential, PkiError>;

    /// PEM of the CA certificate, embedded in every credential bundle.
    fn ca_certificate_pem(&self) -> &str;
}

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

use std::path::Path;

use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder};
use tracing::{debug, info};

use super::{CertificateAuthority, IssuedCredential, PkiError};

type Result<T> = std::result::Result<T, PkiError>;

fn generate_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let ec = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(ec)?)
}

fn common_name(cn: &str) -> Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    Ok(name.build())
}

fn random_serial() -> Result<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::ONE, false)?;
    Ok(serial)
}

fn pem_string(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// CA backed by an X.509 certificate and a passphrase-encrypted private key.
/// The key is only ever decrypted for the duration of one operation.
pub struct OpenSslAuthority {
    cert: X509,
    cert_pem: String,
    encrypted_key: Vec<u8>,
    cert_days: u32,
}

impl std::fmt::Debug for OpenSslAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSslAuthority")
            .field("subject", &self.cert.subject_name())
            .field("cert_days", &self.cert_days)
            .finish_non_exhaustive()
    }
}

impl OpenSslAuthority {
    pub fn load(cert_path: &Path, key_path: &Path, cert_days: u32) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        let authority = Self::from_pem(&cert_pem, key_pem, cert_days)?;
        info!(
            cert = %cert_path.display(),
            subject = ?authority.cert.subject_name(),
            "loaded certificate authority"
        );
        Ok(authority)
    }

    pub fn from_pem(cert_pem: &[u8], encrypted_key: Vec<u8>, cert_days: u32) -> Result<Self> {
        let cert = X509::from_pem(cert_pem)?;

        // An empty passphrase only succeeds if the key is not encrypted, in
        // which case any secret would unlock it.
        if PKey::private_key_from_pem_callback(&encrypted_key, |_| Ok(0)).is_ok() {
            return Err(PkiError::UnencryptedKey);
        }

        Ok(Self {
            cert_pem: pem_string(cert.to_pem()?),
            cert,
            encrypted_key,
            cert_days,
        })
    }

    fn unlock(&self, secret: &str) -> Result<PKey<Private>> {
        let key = PKey::private_key_from_pem_passphrase(&self.encrypted_key, secret.as_bytes())
            .map_err(|_| PkiError::InvalidSecret)?;
        if !self.cert.public_key()?.public_eq(&key) {
            return Err(PkiError::KeyMismatch);
        }
        Ok(key)
    }

    /// Build a new self-signed CA. Returns the certificate PEM and the
    /// private key PEM encrypted with `secret` (PKCS#8, AES-256-CBC).
    pub fn generate(common_name_value: &str, secret: &str, days: u32) -> Result<(String, String)> {
        let key = generate_key()?;
        let name = common_name(common_name_value)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(random_serial()?.to_asn1_integer()?.as_ref())?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(days)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(&key, MessageDigest::sha256())?;
        let cert = builder.build();

        let key_pem =
            key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), secret.as_bytes())?;
        Ok((pem_string(cert.to_pem()?), pem_string(key_pem)))
    }
}

impl CertificateAuthority for OpenSslAuthority {
    fn verify_secret(&self, secret: &str) -> Result<()> {
        self.unlock(secret).map(|_| ())
    }

    #[tracing::instrument(skip(self, secret))]
    fn issue(&self, secret: &str, common_name_value: &str) -> Result<IssuedCredential> {
        let ca_key = self.unlock(secret)?;
        let key = generate_key()?;
        let serial = random_serial()?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;
        let subject = common_name(common_name_value)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(self.cert_days)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(aki)?;
        builder.sign(&ca_key, MessageDigest::sha256())?;
        let cert = builder.build();

        let serial = serial.to_dec_str()?.to_string();
        debug!(serial = %serial, "certificate signed");

        Ok(IssuedCredential {
            serial,
            certificate_pem: pem_string(cert.to_pem()?),
            private_key_pem: pem_string(key.private_key_to_pem_pkcs8()?),
            not_after: Utc::now() + Duration::days(i64::from(self.cert_days)),
        })
    }

    fn ca_certificate_pem(&self) -> &str {
        &self.cert_pem
    }
}

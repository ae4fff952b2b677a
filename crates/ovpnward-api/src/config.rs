use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::pki::ProfileTemplate;
use crate::sessions::SourceConfig;

pub const JWT_SECRET_VAR: &str = "OVPNWARD_JWT_SECRET";
pub const KEY_SECRET_VAR: &str = "OVPNWARD_KEY_SECRET";
pub const ADMIN_HASH_VAR: &str = "OVPNWARD_ADMIN_PASSWORD_HASH";
pub const MANAGEMENT_PASSWORD_VAR: &str = "OVPNWARD_MANAGEMENT_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("OVPNWARD_KEY_SECRET must be exactly 64 hex characters (32 bytes)")]
    InvalidKeySecret,

    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("server address {address} is outside the address space {network}")]
    ServerOutsideNetwork {
        address: Ipv4Addr,
        network: Ipv4Network,
    },

    #[error("group_block_size must be greater than zero")]
    ZeroBlockSize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub address_space: Ipv4Network,
    pub server_address: Ipv4Addr,
    pub group_block_size: u32,
    pub system_group_name: String,
    pub system_group_icon: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            address_space: Ipv4Network::new(Ipv4Addr::new(10, 8, 0, 0), 16)
                .expect("/16 is a valid prefix"),
            server_address: Ipv4Addr::new(10, 8, 0, 1),
            group_block_size: 254,
            system_group_name: "Administrators".to_string(),
            system_group_icon: "\u{1F451}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PkiSection {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub cert_days: u32,
    pub crl_dir: Option<PathBuf>,
    pub ccd_dir: Option<PathBuf>,
}

impl Default for PkiSection {
    fn default() -> Self {
        Self {
            ca_cert: PathBuf::from("/etc/ovpnward/pki/ca.crt"),
            ca_key: PathBuf::from("/etc/ovpnward/pki/ca.key"),
            cert_days: 825,
            crl_dir: None,
            ccd_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub source: SourceConfig,
    pub refresh_interval_secs: u64,
    pub timeout_secs: u64,
    pub log_file: Option<PathBuf>,
    pub rejected_tail_lines: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            refresh_interval_secs: 30,
            timeout_secs: 5,
            log_file: None,
            rejected_tail_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    pub bind_addr: String,
    pub state_dir: PathBuf,
    pub network: NetworkSection,
    pub pki: PkiSection,
    pub profile: ProfileTemplate,
    pub telemetry: TelemetrySection,
}

impl Default for ServerToml {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            state_dir: PathBuf::from("/var/lib/ovpnward"),
            network: NetworkSection::default(),
            pki: PkiSection::default(),
            profile: ProfileTemplate::default(),
            telemetry: TelemetrySection::default(),
        }
    }
}

impl ServerToml {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let server = match read_optional(path).await? {
            Some(text) => toml::from_str(&text)?,
            None => Self::default(),
        };
        server.validate()?;
        Ok(server)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if !net.address_space.contains(net.server_address) {
            return Err(ConfigError::ServerOutsideNetwork {
                address: net.server_address,
                network: net.address_space,
            });
        }
        if net.group_block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerToml,
    pub jwt_secret: String,
    pub key_secret: [u8; 32],
    pub admin_password_hash: String,
    pub management_password: Option<String>,
}

fn parse_hex_32(hex: &str) -> Result<[u8; 32], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return Err(ConfigError::InvalidKeySecret);
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte =
            u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| ConfigError::InvalidKeySecret)?;
    }
    Ok(out)
}

impl Config {
    /// Build from an optional TOML document and an environment lookup.
    pub fn from_sources(
        toml_text: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let require = |var: &'static str| env(var).ok_or(ConfigError::MissingEnvVar { var });

        let server: ServerToml = match toml_text {
            Some(text) => toml::from_str(text)?,
            None => ServerToml::default(),
        };
        server.validate()?;

        Ok(Self {
            jwt_secret: require(JWT_SECRET_VAR)?,
            key_secret: parse_hex_32(&require(KEY_SECRET_VAR)?)?,
            admin_password_hash: require(ADMIN_HASH_VAR)?,
            management_password: env(MANAGEMENT_PASSWORD_VAR).filter(|p| !p.is_empty()),
            server,
        })
    }

    /// Read `path` (a missing file means defaults) and the process
    /// environment.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_optional(path).await?;
        let config = Self::from_sources(text.as_deref(), |var| std::env::var(var).ok())?;
        info!(
            bind_addr = %config.server.bind_addr,
            address_space = %config.server.network.address_space,
            block_size = config.server.network.group_block_size,
            "loaded config"
        );
        Ok(config)
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    debug!(path = %path.display(), "loading config");
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(None)
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn env(extra: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut vars: HashMap<String, String> = HashMap::from([
            (JWT_SECRET_VAR.to_string(), "jwt".to_string()),
            (KEY_SECRET_VAR.to_string(), "ab".repeat(32)),
            (ADMIN_HASH_VAR.to_string(), "$argon2id$stub".to_string()),
        ]);
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_without_file() {
        let config = Config::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.server.network.group_block_size, 254);
        assert_eq!(config.server.network.address_space.to_string(), "10.8.0.0/16");
        assert_eq!(config.server.telemetry.refresh_interval_secs, 30);
        assert_eq!(config.key_secret, [0xab; 32]);
        assert!(config.management_password.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let text = r#"
            bind_addr = "0.0.0.0:9000"

            [network]
            address_space = "10.20.0.0/24"
            server_address = "10.20.0.1"
            group_block_size = 16

            [pki]
            crl_dir = "/etc/openvpn/crl"

            [profile]
            remote_host = "vpn.example.com"

            [telemetry]
            refresh_interval_secs = 10

            [telemetry.source]
            kind = "status_file"
            path = "/run/openvpn/status.log"
        "#;
        let config = Config::from_sources(Some(text), env(&[])).unwrap();
        let server = &config.server;
        assert_eq!(server.bind_addr, "0.0.0.0:9000");
        assert_eq!(server.network.group_block_size, 16);
        assert_eq!(server.network.system_group_name, "Administrators");
        assert_eq!(server.pki.crl_dir.as_deref(), Some(Path::new("/etc/openvpn/crl")));
        assert_eq!(server.profile.remote_host, "vpn.example.com");
        assert_eq!(server.profile.remote_port, 1194);
        assert_eq!(server.telemetry.refresh_interval_secs, 10);
        assert_eq!(server.telemetry.timeout_secs, 5);
        assert!(matches!(server.telemetry.source, SourceConfig::StatusFile { .. }));
    }

    #[test]
    fn missing_secret_is_reported() {
        let err = Config::from_sources(None, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var } if var == JWT_SECRET_VAR));
    }

    #[test_case("abc" ; "too short")]
    #[test_case(&"zz".repeat(32) ; "not hex")]
    fn bad_key_secret(secret: &str) {
        let err = Config::from_sources(None, env(&[(KEY_SECRET_VAR, secret)])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeySecret));
    }

    #[test]
    fn server_must_be_inside_network() {
        let text = "[network]\naddress_space = \"10.20.0.0/24\"\n";
        let err = Config::from_sources(Some(text), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ServerOutsideNetwork { .. }));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let text = "[network]\ngroup_block_size = 0\n";
        let err = Config::from_sources(Some(text), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBlockSize));
    }

    #[test]
    fn empty_management_password_is_none() {
        let config =
            Config::from_sources(None, env(&[(MANAGEMENT_PASSWORD_VAR, "")])).unwrap();
        assert!(config.management_password.is_none());
    }
}

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

use std::fmt::{self, Write};

use serde::Deserialize;

/// Settings for the inline `.ovpn` profile handed to clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileTemplate {
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: String,
    /// Static key for `<tls-crypt>`, embedded verbatim when set.
    pub tls_crypt_key: Option<String>,
    pub extra_directives: Vec<String>,
}

impl Default for ProfileTemplate {
    fn default() -> Self {
        Self {
            remote_host: "localhost".to_string(),
            remote_port: 1194,
            protocol: "udp".to_string(),
            tls_crypt_key: None,
            extra_directives: Vec::new(),
        }
    }
}

fn inline_block(out: &mut String, tag: &str, body: &str) -> fmt::Result {
    writeln!(out, "<{tag}>")?;
    writeln!(out, "{}", body.trim_end())?;
    writeln!(out, "</{tag}>")
}

impl ProfileTemplate {
    pub fn render(
        &self,
        ca_pem: &str,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<String, fmt::Error> {
        let mut out = String::new();
        writeln!(out, "client")?;
        writeln!(out, "dev tun")?;
        writeln!(out, "proto {}", self.protocol)?;
        writeln!(out, "remote {} {}", self.remote_host, self.remote_port)?;
        writeln!(out, "nobind")?;
        writeln!(out, "persist-key")?;
        writeln!(out, "persist-tun")?;
        writeln!(out, "remote-cert-tls server")?;
        for directive in &self.extra_directives {
            writeln!(out, "{directive}")?;
        }
        inline_block(&mut out, "ca", ca_pem)?;
        inline_block(&mut out, "cert", certificate_pem)?;
        inline_block(&mut out, "key", private_key_pem)?;
        if let Some(key) = &self.tls_crypt_key {
            inline_block(&mut out, "tls-crypt", key)?;
        }
        Ok(out)
    }
}

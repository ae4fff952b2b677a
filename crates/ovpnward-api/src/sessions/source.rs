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

use std::future::Future;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::status::StatusParseError;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("management interface error: {0}")]
    Management(String),

    #[error("management interface closed before END")]
    Truncated,

    #[error("status query timed out")]
    Timeout,

    #[error(transparent)]
    Parse(#[from] StatusParseError),
}

/// Where the daemon's live connection table comes from.
pub trait StatusSource: Send + Sync {
    /// Fetch one raw status report.
    fn fetch(&self) -> impl Future<Output = Result<String, SourceError>> + Send;
}

/// The OpenVPN management interface, queried with `status 2`.
#[derive(Debug, Clone)]
pub struct ManagementSource {
    address: String,
    password: Option<String>,
}

impl ManagementSource {
    pub fn new(address: impl Into<String>, password: Option<String>) -> Self {
        Self {
            address: address.into(),
            password,
        }
    }
}

const PASSWORD_PROMPT: &str = "ENTER PASSWORD:";

impl StatusSource for ManagementSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // The password prompt has no trailing newline, so answer it up front
        // instead of waiting for it.
        if let Some(password) = &self.password {
            write.write_all(format!("{password}\n").as_bytes()).await?;
        }
        write.write_all(b"status 2\n").await?;
        write.flush().await?;

        let mut report = String::new();
        let mut complete = false;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim_start_matches(PASSWORD_PROMPT);
            if line.starts_with('>') || line.starts_with("SUCCESS:") || line.is_empty() {
                continue;
            }
            if let Some(msg) = line.strip_prefix("ERROR:") {
                return Err(SourceError::Management(msg.trim().to_string()));
            }
            report.push_str(line);
            report.push('\n');
            if line == "END" {
                complete = true;
                break;
            }
        }
        if !complete {
            return Err(SourceError::Truncated);
        }

        let _ = write.write_all(b"quit\n").await;
        debug!(address = %self.address, bytes = report.len(), "fetched status");
        Ok(report)
    }
}

/// The file written by the daemon's `status` directive.
#[derive(Debug, Clone)]
pub struct StatusFileSource {
    path: PathBuf,
}

impl StatusFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSource for StatusFileSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}

/// `[telemetry.source]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Management { address: String },
    StatusFile { path: PathBuf },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Management {
            address: "127.0.0.1:7505".to_string(),
        }
    }
}

/// The source selected in configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    Management(ManagementSource),
    File(StatusFileSource),
}

impl ConfiguredSource {
    pub fn from_config(config: &SourceConfig, management_password: Option<String>) -> Self {
        match config {
            SourceConfig::Management { address } => {
                Self::Management(ManagementSource::new(address.clone(), management_password))
            }
            SourceConfig::StatusFile { path } => Self::File(StatusFileSource::new(path.clone())),
        }
    }
}

impl StatusSource for ConfiguredSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        match self {
            Self::Management(s) => s.fetch().await,
            Self::File(s) => s.fetch().await,
        }
    }
}

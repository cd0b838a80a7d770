// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the coordinator binary

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::{ConfigDropshot, ConfigLogging};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log: ConfigLogging,
    /// The management endpoint
    pub client_api: ConfigDropshot,
    /// The marble activation endpoint
    pub marble_api: ConfigDropshot,
    pub coordinator: CoordinatorConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Directory holding the sealed state
    pub data_dir: Utf8PathBuf,
    /// Names the coordinator's TLS certificate is valid for
    #[serde(default = "default_dns_names")]
    pub dns_names: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub attestation_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub persist_timeout_ms: u64,
    /// Organization named in every certificate the coordinator issues
    #[serde(default = "default_organization")]
    pub organization: String,
    pub sealing: SealingConfig,
    pub attestation: AttestationConfig,
}

fn default_dns_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_organization() -> String {
    "Mesh Coordinator".to_string()
}

impl CoordinatorConfig {
    pub fn attestation_timeout(&self) -> Duration {
        Duration::from_millis(self.attestation_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self.sealing, SealingConfig::Simulation)
            || matches!(self.attestation, AttestationConfig::Simulation)
    }
}

/// Where the key material behind the platform wrapping key comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SealingConfig {
    /// 32 raw bytes or 64 hex characters in a file
    KeyFile { path: Utf8PathBuf },
    /// A well-known key. Sealing protects nothing.
    Simulation,
}

/// How quotes are checked and produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AttestationConfig {
    /// Ed25519-signed reports. With an `issuer_key` (PKCS#8 PEM) the
    /// coordinator also signs reports over its own root certificate.
    SignedReport {
        #[serde(default)]
        issuer_key: Option<Utf8PathBuf>,
    },
    /// Every quote is accepted.
    Simulation,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The manifest: the mesh's declarative trust policy, and the fragments that
//! amend it.

use crate::template::{self, TemplateError};
use crate::user::UserDirectory;
use mesh_certificates::CertificateError;
use mesh_coordinator_api::SecretType;
use openssl::pkey::PKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Marble leaves live for a day unless the manifest says otherwise.
pub const DEFAULT_CERTIFICATE_LIFETIME_SECONDS: u64 = 86400;

/// Upper bound on generated symmetric keys, in bits.
const MAX_SYMMETRIC_KEY_BITS: u32 = 4096;

const ATTESTATION_ROOT_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON")]
    Parse(#[source] serde_json::Error),

    #[error("marble {marble:?} references unknown package {package:?}")]
    UnknownPackage { marble: String, package: String },

    #[error(
        "marble {marble:?} references unknown infrastructure {infrastructure:?}"
    )]
    UnknownInfrastructure { marble: String, infrastructure: String },

    #[error(
        "package {0:?} needs a UniqueID, or a SignerID with ProductID and \
         SecurityVersion"
    )]
    IncompletePackage(String),

    #[error("infrastructure {0:?} needs a 32-byte RootCA")]
    BadAttestationRoot(String),

    #[error("marble {0:?} has MaxActivations of zero")]
    ZeroMaxActivations(String),

    #[error("certificate of user {user:?} is invalid")]
    BadUserCertificate {
        user: String,
        #[source]
        err: CertificateError,
    },

    #[error("user {0:?} is both an admin and a client")]
    UserIsAdminAndClient(String),

    #[error("users {0:?} and {1:?} share a certificate")]
    SharedCertificate(String, String),

    #[error("secret {secret:?} names unknown user {user:?}")]
    UnknownSecretUser { secret: String, user: String },

    #[error("secret {0:?} is generated, so it cannot have writers")]
    WritersOnGeneratedSecret(String),

    #[error("plain secret {0:?} must be user-defined and unsized")]
    InvalidPlainSecret(String),

    #[error(
        "symmetric key {secret:?} has invalid size {size:?} (bits, positive \
         multiple of 8, at most 4096)"
    )]
    InvalidSecretSize { secret: String, size: Option<u32> },

    #[error("recovery key {name:?} is not an RSA public key")]
    BadRecoveryKey {
        name: String,
        #[source]
        err: openssl::error::ErrorStack,
    },

    #[error("recovery key {0:?} is not an RSA public key")]
    NotRsaRecoveryKey(String),

    #[error("recovery threshold {threshold} is invalid for {keys} keys")]
    InvalidRecoveryThreshold { threshold: usize, keys: usize },

    #[error("update quorum {quorum} is invalid for {admins} admins")]
    InvalidUpdateQuorum { quorum: usize, admins: usize },

    #[error("certificate lifetime must be positive")]
    InvalidCertificateLifetime,

    #[error("parameters of marble {marble:?} are invalid")]
    Template {
        marble: String,
        #[source]
        err: TemplateError,
    },

    #[error("manifest update is not valid JSON")]
    UpdateParse(#[source] serde_json::Error),

    #[error("manifest update changes nothing")]
    EmptyUpdate,

    #[error("manifest update names unknown package {0:?}")]
    UpdateUnknownPackage(String),

    #[error(
        "manifest update would lower the security version of {package:?} \
         from {current:?} to {requested}"
    )]
    Downgrade { package: String, current: Option<u16>, requested: u16 },
}

/// Raw bytes carried as a hex string in JSON.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct HexBytes(pub Vec<u8>);

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map(HexBytes).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageProperties>,
    #[serde(default)]
    pub infrastructures: BTreeMap<String, InfrastructureProperties>,
    #[serde(default)]
    pub marbles: BTreeMap<String, Marble>,
    /// Admin name to certificate PEM
    #[serde(default)]
    pub admins: BTreeMap<String, String>,
    /// Client name to certificate PEM
    #[serde(default)]
    pub clients: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretDefinition>,
    /// Recovery key name to RSA public key PEM
    #[serde(default)]
    pub recovery_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub recovery_threshold: Option<usize>,
    #[serde(default)]
    pub update_quorum: Option<usize>,
    #[serde(default)]
    pub certificate_lifetime_seconds: Option<u64>,
}

/// Expected measurements of a package (an enclave image).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageProperties {
    /// Minimum acceptable security version
    #[serde(rename = "SecurityVersion", default)]
    pub security_version: Option<u16>,
    #[serde(rename = "ProductID", default)]
    pub product_id: Option<u16>,
    #[serde(rename = "SignerID", default)]
    pub signer_id: Option<HexBytes>,
    #[serde(rename = "UniqueID", default)]
    pub unique_id: Option<HexBytes>,
    #[serde(rename = "Debug", default)]
    pub debug: bool,
}

/// Expected properties of the platform a marble runs on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfrastructureProperties {
    /// Minimum quoting enclave security version
    #[serde(rename = "QESVN", default)]
    pub qe_svn: Option<u16>,
    /// Minimum provisioning certification enclave security version
    #[serde(rename = "PCESVN", default)]
    pub pce_svn: Option<u16>,
    #[serde(rename = "CPUSVN", default)]
    pub cpu_svn: Option<HexBytes>,
    /// Raw Ed25519 public key that signs this platform's reports
    #[serde(rename = "RootCA")]
    pub root_ca: HexBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Marble {
    pub package: String,
    #[serde(default)]
    pub infrastructure: Option<String>,
    #[serde(default)]
    pub multi_instance: bool,
    #[serde(default)]
    pub max_activations: Option<u64>,
    #[serde(default)]
    pub parameters: ParameterTemplate,
}

/// Process parameters whose values may contain `{{ placeholder }}`s.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ParameterTemplate {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SecretDefinition {
    #[serde(rename = "Type")]
    pub secret_type: SecretType,
    /// Key size in bits, for symmetric keys
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub user_defined: bool,
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default)]
    pub writers: Vec<String>,
}

/// SHA-256 of the manifest exactly as submitted.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ManifestDigest(pub [u8; 32]);

impl ManifestDigest {
    pub fn of(raw: &[u8]) -> ManifestDigest {
        ManifestDigest(Sha256::digest(raw).into())
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestDigest({self})")
    }
}

impl Manifest {
    /// Parse and validate a manifest.
    pub fn parse(raw: &[u8]) -> Result<Manifest, ManifestError> {
        let manifest: Manifest =
            serde_json::from_slice(raw).map_err(ManifestError::Parse)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        for (name, package) in &self.packages {
            let full_signer = package.signer_id.is_some()
                && package.product_id.is_some()
                && package.security_version.is_some();
            if package.unique_id.is_none() && !full_signer {
                return Err(ManifestError::IncompletePackage(name.clone()));
            }
        }

        for (name, infra) in &self.infrastructures {
            if infra.root_ca.0.len() != ATTESTATION_ROOT_LEN {
                return Err(ManifestError::BadAttestationRoot(name.clone()));
            }
        }

        for (name, marble) in &self.marbles {
            if !self.packages.contains_key(&marble.package) {
                return Err(ManifestError::UnknownPackage {
                    marble: name.clone(),
                    package: marble.package.clone(),
                });
            }
            if let Some(infra) = &marble.infrastructure {
                if !self.infrastructures.contains_key(infra) {
                    return Err(ManifestError::UnknownInfrastructure {
                        marble: name.clone(),
                        infrastructure: infra.clone(),
                    });
                }
            }
            if marble.max_activations == Some(0) {
                return Err(ManifestError::ZeroMaxActivations(name.clone()));
            }
        }

        // Certificates parse, and no two users collide.
        UserDirectory::from_manifest(self)?;

        self.validate_secrets()?;
        self.validate_recovery()?;

        if let Some(quorum) = self.update_quorum {
            if quorum == 0 || quorum > self.admins.len() {
                return Err(ManifestError::InvalidUpdateQuorum {
                    quorum,
                    admins: self.admins.len(),
                });
            }
        }

        if self.certificate_lifetime_seconds == Some(0) {
            return Err(ManifestError::InvalidCertificateLifetime);
        }

        let secret_names: BTreeSet<&str> =
            self.secrets.keys().map(String::as_str).collect();
        for (name, marble) in &self.marbles {
            template::validate(&marble.parameters, &secret_names).map_err(
                |err| ManifestError::Template { marble: name.clone(), err },
            )?;
        }

        Ok(())
    }

    fn validate_secrets(&self) -> Result<(), ManifestError> {
        for (name, secret) in &self.secrets {
            for user in secret.readers.iter().chain(secret.writers.iter()) {
                if !self.admins.contains_key(user)
                    && !self.clients.contains_key(user)
                {
                    return Err(ManifestError::UnknownSecretUser {
                        secret: name.clone(),
                        user: user.clone(),
                    });
                }
            }
            if !secret.user_defined && !secret.writers.is_empty() {
                return Err(ManifestError::WritersOnGeneratedSecret(
                    name.clone(),
                ));
            }
            match secret.secret_type {
                SecretType::Plain => {
                    if !secret.user_defined || secret.size.is_some() {
                        return Err(ManifestError::InvalidPlainSecret(
                            name.clone(),
                        ));
                    }
                }
                SecretType::SymmetricKey => {
                    let size_ok = match secret.size {
                        Some(bits) => {
                            bits > 0
                                && bits % 8 == 0
                                && bits <= MAX_SYMMETRIC_KEY_BITS
                        }
                        // User-defined keys may be any length.
                        None => secret.user_defined,
                    };
                    if !size_ok {
                        return Err(ManifestError::InvalidSecretSize {
                            secret: name.clone(),
                            size: secret.size,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_recovery(&self) -> Result<(), ManifestError> {
        for (name, pem) in &self.recovery_keys {
            let key = PKey::public_key_from_pem(pem.as_bytes()).map_err(
                |err| ManifestError::BadRecoveryKey { name: name.clone(), err },
            )?;
            if key.rsa().is_err() {
                return Err(ManifestError::NotRsaRecoveryKey(name.clone()));
            }
        }
        let keys = self.recovery_keys.len();
        if let Some(threshold) = self.recovery_threshold {
            if threshold == 0 || threshold > keys || threshold > 255 {
                return Err(ManifestError::InvalidRecoveryThreshold {
                    threshold,
                    keys,
                });
            }
        }
        if keys > 255 {
            return Err(ManifestError::InvalidRecoveryThreshold {
                threshold: self.recovery_threshold(),
                keys,
            });
        }
        Ok(())
    }

    /// Number of shares needed to recover; zero when recovery is disabled.
    pub fn recovery_threshold(&self) -> usize {
        self.recovery_threshold.unwrap_or(self.recovery_keys.len())
    }

    pub fn update_quorum(&self) -> usize {
        self.update_quorum.unwrap_or(1)
    }

    pub fn certificate_lifetime(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.certificate_lifetime_seconds
                .unwrap_or(DEFAULT_CERTIFICATE_LIFETIME_SECONDS),
        )
    }

    /// The infrastructures a quote for `marble` may come from.
    ///
    /// A marble pinned to an infrastructure is only checked against that one;
    /// otherwise any of the manifest's infrastructures will do.
    pub fn candidate_infrastructures(
        &self,
        marble: &Marble,
    ) -> Vec<InfrastructureProperties> {
        match &marble.infrastructure {
            Some(name) => {
                self.infrastructures.get(name).cloned().into_iter().collect()
            }
            None => self.infrastructures.values().cloned().collect(),
        }
    }
}

/// The only amendment the manifest accepts: raising package security
/// versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ManifestUpdate {
    pub packages: BTreeMap<String, PackageUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PackageUpdate {
    pub security_version: u16,
}

/// SHA-256 of a [`ManifestUpdate`]'s canonical encoding.
///
/// Co-signers who submit the same change with different whitespace or key
/// order approve the same fragment.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FragmentDigest(pub [u8; 32]);

impl fmt::Display for FragmentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FragmentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentDigest({self})")
    }
}

impl ManifestUpdate {
    pub fn parse(
        raw: &[u8],
    ) -> Result<(ManifestUpdate, FragmentDigest), ManifestError> {
        let update: ManifestUpdate =
            serde_json::from_slice(raw).map_err(ManifestError::UpdateParse)?;
        if update.packages.is_empty() {
            return Err(ManifestError::EmptyUpdate);
        }
        let canonical =
            serde_json::to_vec(&update).map_err(ManifestError::UpdateParse)?;
        let digest = FragmentDigest(Sha256::digest(&canonical).into());
        Ok((update, digest))
    }

    /// Produce the manifest that results from applying this update.
    pub fn apply(
        &self,
        manifest: &Manifest,
    ) -> Result<Manifest, ManifestError> {
        let mut updated = manifest.clone();
        for (name, change) in &self.packages {
            let package = updated.packages.get_mut(name).ok_or_else(|| {
                ManifestError::UpdateUnknownPackage(name.clone())
            })?;
            if package
                .security_version
                .is_some_and(|current| change.security_version < current)
            {
                return Err(ManifestError::Downgrade {
                    package: name.clone(),
                    current: package.security_version,
                    requested: change.security_version,
                });
            }
            package.security_version = Some(change.security_version);
        }
        Ok(updated)
    }
}

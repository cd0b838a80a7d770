// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A manifest fixture with real certificates and keys behind it.
//!
//! The default manifest has two marble types: `backend` (single instance)
//! and `frontend` (multi instance), one admin, one client, one recovery key,
//! and an infrastructure whose reports are signed by
//! [`ManifestFixture::attestation`].

use crate::certificates::UserCertificate;
use crate::recovery::RecoveryKeyPair;
use openssl::pkey::{PKey, Private};
use serde_json::{json, Map, Value};

pub const BACKEND_SECURITY_VERSION: u16 = 2;
pub const BACKEND_PRODUCT_ID: u16 = 1;
pub const BACKEND_SIGNER_ID: [u8; 32] = [0xaa; 32];
pub const FRONTEND_UNIQUE_ID: [u8; 32] = [0xbb; 32];
pub const PLATFORM_QE_SVN: u16 = 2;
pub const PLATFORM_PCE_SVN: u16 = 3;

/// The Ed25519 key a simulated platform signs its reports with.
pub struct AttestationKey {
    key: PKey<Private>,
}

impl AttestationKey {
    pub fn generate() -> Self {
        Self { key: PKey::generate_ed25519().expect("generate Ed25519 key") }
    }

    pub fn private_key_pem(&self) -> Vec<u8> {
        self.key.private_key_to_pem_pkcs8().expect("serialize Ed25519 key")
    }

    pub fn public_key_raw(&self) -> Vec<u8> {
        self.key.raw_public_key().expect("raw Ed25519 public key")
    }
}

pub struct ManifestFixture {
    pub raw: Vec<u8>,
    pub admins: Vec<UserCertificate>,
    pub clients: Vec<UserCertificate>,
    pub recovery_keys: Vec<(String, RecoveryKeyPair)>,
    pub attestation: AttestationKey,
}

impl ManifestFixture {
    pub fn admin(&self, name: &str) -> &UserCertificate {
        self.admins
            .iter()
            .find(|a| a.name == name)
            .unwrap_or_else(|| panic!("no admin named {name}"))
    }

    pub fn client(&self, name: &str) -> &UserCertificate {
        self.clients
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no client named {name}"))
    }

    pub fn recovery_key(&self, name: &str) -> &RecoveryKeyPair {
        self.recovery_keys
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, key)| key)
            .unwrap_or_else(|| panic!("no recovery key named {name}"))
    }
}

pub struct ManifestBuilder {
    admins: Vec<String>,
    clients: Vec<String>,
    recovery_keys: Vec<String>,
    recovery_threshold: Option<usize>,
    update_quorum: Option<usize>,
    frontend_max_activations: Option<u64>,
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            admins: vec!["admin".to_string()],
            clients: vec!["client".to_string()],
            recovery_keys: vec!["recovery".to_string()],
            recovery_threshold: None,
            update_quorum: None,
            frontend_max_activations: None,
        }
    }

    pub fn admins(mut self, names: &[&str]) -> Self {
        self.admins = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn recovery_keys(mut self, names: &[&str]) -> Self {
        self.recovery_keys = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn recovery_threshold(mut self, threshold: usize) -> Self {
        self.recovery_threshold = Some(threshold);
        self
    }

    pub fn update_quorum(mut self, quorum: usize) -> Self {
        self.update_quorum = Some(quorum);
        self
    }

    pub fn frontend_max_activations(mut self, max: u64) -> Self {
        self.frontend_max_activations = Some(max);
        self
    }

    pub fn build(self) -> ManifestFixture {
        let attestation = AttestationKey::generate();
        let admins: Vec<UserCertificate> =
            self.admins.iter().map(|n| UserCertificate::new(n)).collect();
        let clients: Vec<UserCertificate> =
            self.clients.iter().map(|n| UserCertificate::new(n)).collect();
        let recovery_keys: Vec<(String, RecoveryKeyPair)> = self
            .recovery_keys
            .iter()
            .map(|n| (n.clone(), RecoveryKeyPair::generate()))
            .collect();

        let users = |certs: &[UserCertificate]| -> Map<String, Value> {
            certs
                .iter()
                .map(|c| (c.name.clone(), Value::String(c.cert_pem.clone())))
                .collect()
        };
        let recovery: Map<String, Value> = recovery_keys
            .iter()
            .map(|(n, k)| (n.clone(), Value::String(k.public_key_pem())))
            .collect();
        let admin_names: Vec<&str> =
            self.admins.iter().map(String::as_str).collect();
        let mut readers = admin_names.clone();
        readers.extend(self.clients.iter().map(String::as_str));

        let mut frontend = json!({
            "Package": "frontend",
            "MultiInstance": true,
            "Parameters": {
                "Files": { "/tls/cert.pem": "{{ marble_cert }}" },
                "Env": {
                    "TLS_KEY": "{{ marble_key }}",
                    "MARBLE_UUID": "{{uuid}}"
                }
            }
        });
        if let Some(max) = self.frontend_max_activations {
            frontend["MaxActivations"] = json!(max);
        }

        let mut manifest = json!({
            "Packages": {
                "backend": {
                    "SecurityVersion": BACKEND_SECURITY_VERSION,
                    "ProductID": BACKEND_PRODUCT_ID,
                    "SignerID": hex::encode(BACKEND_SIGNER_ID),
                    "Debug": false
                },
                "frontend": {
                    "UniqueID": hex::encode(FRONTEND_UNIQUE_ID)
                }
            },
            "Infrastructures": {
                "local": {
                    "QESVN": PLATFORM_QE_SVN,
                    "PCESVN": PLATFORM_PCE_SVN,
                    "RootCA": hex::encode(attestation.public_key_raw())
                }
            },
            "Marbles": {
                "backend": {
                    "Package": "backend",
                    "Infrastructure": "local",
                    "Parameters": {
                        "Files": { "/etc/mesh/ca.pem": "{{ root_ca }}" },
                        "Env": {
                            "SEAL_KEY": "{{ seal_key }}",
                            "DB_KEY": "{{ secret.db_key }}",
                            "MARBLE_TYPE": "{{ marble_type }}"
                        },
                        "Argv": ["backend", "--id", "{{ uuid }}"]
                    }
                },
                "frontend": frontend
            },
            "Admins": users(&admins),
            "Clients": users(&clients),
            "Secrets": {
                "db_key": {
                    "Type": "symmetric-key",
                    "Size": 256,
                    "Readers": readers
                },
                "api_token": {
                    "Type": "plain",
                    "UserDefined": true,
                    "Readers": self.clients,
                    "Writers": admin_names
                }
            },
            "RecoveryKeys": recovery
        });
        if let Some(threshold) = self.recovery_threshold {
            manifest["RecoveryThreshold"] = json!(threshold);
        }
        if let Some(quorum) = self.update_quorum {
            manifest["UpdateQuorum"] = json!(quorum);
        }

        let raw = serde_json::to_vec_pretty(&manifest)
            .expect("manifest serializes");
        ManifestFixture { raw, admins, clients, recovery_keys, attestation }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolving callers of the management API to manifest users.

use crate::manifest::{Manifest, ManifestError};
use base64::Engine;
use mesh_certificates::{
    fingerprint_der, fingerprint_pem, verify_signature, Fingerprint,
};
use sha2::{Digest, Sha256};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// How far a signed request's timestamp may be from the coordinator's clock,
/// in seconds.
pub const MAX_SIGNATURE_SKEW: i64 = 300;

/// Who is making a management request.
///
/// Resolved once at the transport boundary and handed to the core; the core
/// never looks at certificate bytes itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Admin(String),
    Client(String),
    Unauthenticated,
}

impl Caller {
    /// The manifest user name, for ACL checks.
    pub fn name(&self) -> Option<&str> {
        match self {
            Caller::Admin(name) | Caller::Client(name) => Some(name),
            Caller::Unauthenticated => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Admin,
    Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("client certificate header is not valid base64")]
    Encoding(#[source] base64::DecodeError),

    #[error("client certificate header carries an invalid certificate")]
    Certificate(#[source] mesh_certificates::CertificateError),
}

/// What a management caller presents: a certificate chain, and a signature
/// by the leaf's key proving the caller holds it.
#[derive(Debug, Clone, Default)]
pub struct ClientCredential {
    /// DER, leaf first
    pub chain: Vec<Vec<u8>>,
    /// Unix seconds at which `payload` was signed
    pub timestamp: i64,
    /// The signed bytes, as rebuilt from the request
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Decode the forwarded client certificate header into DER certificates,
/// leaf first.
pub fn parse_forwarded_chain(header: &str) -> Result<Vec<Vec<u8>>, ChainError> {
    header
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            base64::engine::general_purpose::STANDARD
                .decode(part)
                .map_err(ChainError::Encoding)
        })
        .collect()
}

/// The manifest's admins and clients, keyed by certificate fingerprint.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    by_fingerprint: BTreeMap<Fingerprint, (Role, String)>,
}

impl UserDirectory {
    pub fn from_manifest(
        manifest: &Manifest,
    ) -> Result<UserDirectory, ManifestError> {
        if let Some(name) =
            manifest.admins.keys().find(|n| manifest.clients.contains_key(*n))
        {
            return Err(ManifestError::UserIsAdminAndClient(name.clone()));
        }

        let admins =
            manifest.admins.iter().map(|(n, pem)| (Role::Admin, n, pem));
        let clients =
            manifest.clients.iter().map(|(n, pem)| (Role::Client, n, pem));

        let mut by_fingerprint = BTreeMap::new();
        for (role, name, pem) in admins.chain(clients) {
            let fingerprint = fingerprint_pem(pem.as_bytes()).map_err(|err| {
                ManifestError::BadUserCertificate { user: name.clone(), err }
            })?;
            if let Some((_, other)) =
                by_fingerprint.insert(fingerprint, (role, name.clone()))
            {
                return Err(ManifestError::SharedCertificate(
                    other,
                    name.clone(),
                ));
            }
        }
        Ok(UserDirectory { by_fingerprint })
    }

    /// Identify the caller presenting `credential`.
    ///
    /// Users are pinned by the exact leaf certificate in the manifest, and
    /// only count if the signature was made with that certificate's key.
    /// Anything else is an unauthenticated caller; a leaf that does not
    /// parse is an error.
    pub fn lookup(
        &self,
        credential: &ClientCredential,
    ) -> Result<Caller, ChainError> {
        let Some(leaf) = credential.chain.first() else {
            return Ok(Caller::Unauthenticated);
        };
        let fingerprint =
            fingerprint_der(leaf).map_err(ChainError::Certificate)?;
        let Some((role, name)) = self.by_fingerprint.get(&fingerprint) else {
            return Ok(Caller::Unauthenticated);
        };
        let proven =
            verify_signature(leaf, &credential.payload, &credential.signature)
                .map_err(ChainError::Certificate)?;
        if !proven {
            return Ok(Caller::Unauthenticated);
        }
        Ok(match role {
            Role::Admin => Caller::Admin(name.clone()),
            Role::Client => Caller::Client(name.clone()),
        })
    }
}

/// Signed requests seen within the skew window, so a captured request
/// cannot be played again.
///
/// Keyed by the signer and the signed bytes rather than the signature,
/// since ECDSA signatures are malleable.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: BTreeMap<[u8; 32], i64>,
}

impl ReplayGuard {
    /// Admit a verified credential once, if its timestamp is close to `now`.
    pub fn admit(&mut self, credential: &ClientCredential, now: i64) -> bool {
        self.seen.retain(|_, expires| *expires >= now);
        if (now - credential.timestamp).abs() > MAX_SIGNATURE_SKEW {
            return false;
        }

        let mut hasher = Sha256::new();
        if let Some(leaf) = credential.chain.first() {
            hasher.update(Fingerprint::of_der(leaf).0);
        }
        hasher.update(&credential.payload);
        match self.seen.entry(hasher.finalize().into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(credential.timestamp + MAX_SIGNATURE_SKEW);
                true
            }
        }
    }
}

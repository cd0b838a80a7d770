// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manifest secrets: generated when the manifest is installed, or set later
//! by their writers.

use crate::manifest::{Manifest, SecretDefinition};
use crate::user::Caller;
use mesh_coordinator_api::{SecretType, SecretValue};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("secrets request is not valid: {0}")]
    Invalid(String),

    #[error("secret {0:?} is not defined by the manifest")]
    Unknown(String),

    #[error("caller may not access secret {0:?}")]
    Forbidden(String),

    #[error("secret {0:?} has not been set yet")]
    NotSet(String),
}

/// A secret's value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    #[zeroize(skip)]
    pub secret_type: SecretType,
    pub value: Vec<u8>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("secret_type", &self.secret_type)
            .finish_non_exhaustive()
    }
}

impl Secret {
    /// The form a secret takes in parameters and API responses: keys as hex,
    /// plain secrets verbatim.
    pub fn rendered(&self) -> String {
        match self.secret_type {
            SecretType::SymmetricKey => hex::encode(&self.value),
            SecretType::Plain => String::from_utf8_lossy(&self.value).into(),
        }
    }
}

/// Generate every secret the manifest does not leave to its users.
pub fn generate(manifest: &Manifest) -> BTreeMap<String, Secret> {
    manifest
        .secrets
        .iter()
        .filter(|(_, def)| !def.user_defined)
        .filter_map(|(name, def)| {
            let bits = def.size?;
            let mut value = vec![0u8; usize::try_from(bits / 8).ok()?];
            OsRng.try_fill_bytes(&mut value).expect("fetched random bytes");
            Some((
                name.clone(),
                Secret { secret_type: SecretType::SymmetricKey, value },
            ))
        })
        .collect()
}

/// Rendered values of the secrets that have one, for templating.
pub fn rendered(
    secrets: &BTreeMap<String, Secret>,
) -> BTreeMap<String, String> {
    secrets.iter().map(|(n, s)| (n.clone(), s.rendered())).collect()
}

fn definition<'a>(
    manifest: &'a Manifest,
    name: &str,
) -> Result<&'a SecretDefinition, SecretsError> {
    manifest
        .secrets
        .get(name)
        .ok_or_else(|| SecretsError::Unknown(name.to_string()))
}

/// Validate a write request (a JSON object of name to value) and produce the
/// secrets it sets.
///
/// Nothing is applied unless the whole request is acceptable.
pub fn prepare_write(
    manifest: &Manifest,
    caller: &Caller,
    body: &[u8],
) -> Result<BTreeMap<String, Secret>, SecretsError> {
    let Some(user) = caller.name() else {
        return Err(SecretsError::Forbidden(String::new()));
    };
    let request: BTreeMap<String, String> = serde_json::from_slice(body)
        .map_err(|e| SecretsError::Invalid(e.to_string()))?;
    if request.is_empty() {
        return Err(SecretsError::Invalid("no secrets given".to_string()));
    }

    let mut out = BTreeMap::new();
    for (name, value) in request {
        let def = definition(manifest, &name)?;
        if !def.user_defined || !def.writers.iter().any(|w| w == user) {
            return Err(SecretsError::Forbidden(name));
        }
        let value = match def.secret_type {
            SecretType::Plain => value.into_bytes(),
            SecretType::SymmetricKey => {
                let bytes = hex::decode(value.trim()).map_err(|_| {
                    SecretsError::Invalid(format!("{name:?} is not hex"))
                })?;
                let size_ok = match def.size {
                    Some(bits) => bytes.len() * 8 == bits as usize,
                    None => !bytes.is_empty(),
                };
                if !size_ok {
                    return Err(SecretsError::Invalid(format!(
                        "{name:?} has the wrong length"
                    )));
                }
                bytes
            }
        };
        out.insert(name, Secret { secret_type: def.secret_type, value });
    }
    Ok(out)
}

/// Read the named secrets, if the caller may read all of them.
pub fn read(
    manifest: &Manifest,
    secrets: &BTreeMap<String, Secret>,
    caller: &Caller,
    names: &[String],
) -> Result<BTreeMap<String, SecretValue>, SecretsError> {
    let Some(user) = caller.name() else {
        return Err(SecretsError::Forbidden(String::new()));
    };
    if names.is_empty() {
        return Err(SecretsError::Invalid("no secret names given".to_string()));
    }
    // Check every ACL before revealing anything.
    for name in names {
        let def = definition(manifest, name)?;
        if !def.readers.iter().any(|r| r == user) {
            return Err(SecretsError::Forbidden(name.clone()));
        }
    }
    names
        .iter()
        .map(|name| {
            let secret = secrets
                .get(name)
                .ok_or_else(|| SecretsError::NotSet(name.clone()))?;
            Ok((
                name.clone(),
                SecretValue {
                    secret_type: secret.secret_type,
                    value: secret.rendered(),
                },
            ))
        })
        .collect()
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A crate used to derive the keys that protect the mesh coordinator's sealed
//! state and the sealing keys handed out to marbles.

use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretBox};
use sha3::Sha3_256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string for the key that wraps the sealed state's data key.
///
/// Changing this orphans every existing sealed state blob, so it is versioned.
pub const WRAPPING_KEY_INFO: &[u8] = b"mesh-coordinator-seal-v1";

const MARBLE_SEAL_KEY_INFO: &[u8] = b"mesh-marble-seal-v1-";

/// The value the simulation retriever hands out. It is public knowledge, which
/// is the point: simulated sealing protects nothing.
const SIMULATION_IKM: [u8; 32] = *b"mesh-coordinator-simulation-key!";

/// Input Key Material
///
/// This should never be used directly, and always wrapped in a
/// `SecretBox<Ikm>` upon construction.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Ikm(pub Box<[u8; 32]>);

impl Ikm {
    pub fn new(data: &[u8; 32]) -> SecretBox<Ikm> {
        SecretBox::new(Box::new(Ikm(Box::new(*data))))
    }
}

/// Derived key used to wrap (encrypt) the data key of the sealed state
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct WrappingKey(pub Box<[u8; 32]>);

/// Derived key handed to every instance of one marble type
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct MarbleSealKey(pub Box<[u8; 32]>);

/// An error returned by the [`KeyManager`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Secret not loaded")]
    SecretNotLoaded,

    #[error("Failed to retrieve secret")]
    SecretRetrieval(#[from] SecretRetrieverError),
}

/// Derives the coordinator's wrapping key from platform (or externally
/// supplied) key material.
pub struct KeyManager<S: SecretRetriever> {
    // A mechanism for retrieving input key material
    secret_retriever: S,

    /// Pseudo-Random-Key wrapped in an `Hkdf` structure so that we can create
    /// keys from it with `HKDF-Expand`.
    prk: Option<Hkdf<Sha3_256>>,
}

impl<S: SecretRetriever> KeyManager<S> {
    pub fn new(secret_retriever: S) -> KeyManager<S> {
        KeyManager { secret_retriever, prk: None }
    }

    /// Load the input key material into the key manager.
    async fn load_secret(&mut self) -> Result<(), Error> {
        let ikm = self.secret_retriever.get().await?;
        self.prk = Some(Hkdf::new(None, ikm.expose_secret().0.as_ref()));
        Ok(())
    }

    /// Derive the key that wraps the sealed state's data key, loading the
    /// input key material first if necessary.
    pub async fn wrapping_key(
        &mut self,
    ) -> Result<SecretBox<WrappingKey>, Error> {
        if self.prk.is_none() {
            self.load_secret().await?;
        }
        let prk = self.prk.as_ref().ok_or(Error::SecretNotLoaded)?;

        let mut key = WrappingKey::default();
        prk.expand(WRAPPING_KEY_INFO, key.0.as_mut())
            .expect("32 bytes is a valid HKDF-SHA3-256 output length");
        Ok(SecretBox::new(Box::new(key)))
    }
}

/// Derive the sealing key for `marble_type` from the coordinator's marble
/// sealing secret.
///
/// The derivation is deterministic, so every instance of a marble type gets
/// the same key, across coordinator restarts and recoveries.
pub fn marble_seal_key(
    root: &SecretBox<[u8; 32]>,
    marble_type: &str,
) -> SecretBox<MarbleSealKey> {
    let prk = Hkdf::<Sha3_256>::new(None, root.expose_secret());
    let mut key = MarbleSealKey::default();
    prk.expand_multi_info(
        &[MARBLE_SEAL_KEY_INFO, marble_type.as_bytes()],
        key.0.as_mut(),
    )
    .expect("32 bytes is a valid HKDF-SHA3-256 output length");
    SecretBox::new(Box::new(key))
}

#[derive(thiserror::Error, Debug)]
pub enum SecretRetrieverError {
    #[error("key material not found at {0}")]
    Missing(Utf8PathBuf),

    #[error("failed to read key material from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(
        "key material at {0} must be 32 raw bytes or 64 hex characters"
    )]
    Malformed(Utf8PathBuf),
}

/// A mechanism for retrieving the secret used as input key material to
/// HKDF-Extract.
#[async_trait]
pub trait SecretRetriever: Send + Sync {
    async fn get(&self) -> Result<SecretBox<Ikm>, SecretRetrieverError>;
}

#[async_trait]
impl<T: SecretRetriever + ?Sized> SecretRetriever for Arc<T> {
    async fn get(&self) -> Result<SecretBox<Ikm>, SecretRetrieverError> {
        (**self).get().await
    }
}

/// Reads key material from a file provisioned by the platform.
///
/// The file holds either exactly 32 raw bytes or 64 hex characters (optionally
/// followed by a newline).
#[derive(Debug, Clone)]
pub struct FileSecretRetriever {
    path: Utf8PathBuf,
}

impl FileSecretRetriever {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[async_trait]
impl SecretRetriever for FileSecretRetriever {
    async fn get(&self) -> Result<SecretBox<Ikm>, SecretRetrieverError> {
        let mut contents =
            tokio::fs::read(&self.path).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    SecretRetrieverError::Missing(self.path.clone())
                } else {
                    SecretRetrieverError::Io { path: self.path.clone(), err }
                }
            })?;
        let result = parse_key_material(&contents)
            .ok_or_else(|| SecretRetrieverError::Malformed(self.path.clone()));
        contents.zeroize();
        result
    }
}

fn parse_key_material(contents: &[u8]) -> Option<SecretBox<Ikm>> {
    if let Ok(raw) = <&[u8; 32]>::try_from(contents) {
        return Some(Ikm::new(raw));
    }
    let text = std::str::from_utf8(contents).ok()?.trim();
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(text, &mut bytes).ok()?;
    let ikm = Ikm::new(&bytes);
    bytes.zeroize();
    Some(ikm)
}

/// Hands out fixed key material.
///
/// Used for simulation mode, where there is no platform sealing primitive, and
/// by tests that want to model a platform key changing between boots.
#[derive(Clone)]
pub struct StaticSecretRetriever {
    ikm: [u8; 32],
}

impl StaticSecretRetriever {
    pub fn new(ikm: [u8; 32]) -> Self {
        Self { ikm }
    }

    pub fn simulation() -> Self {
        Self::new(SIMULATION_IKM)
    }
}

impl std::fmt::Debug for StaticSecretRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecretRetriever").finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretRetriever for StaticSecretRetriever {
    async fn get(&self) -> Result<SecretBox<Ikm>, SecretRetrieverError> {
        Ok(Ikm::new(&self.ikm))
    }
}

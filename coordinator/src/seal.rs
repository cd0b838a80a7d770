// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sealed state: the coordinator's state, encrypted at rest.
//!
//! The state is encrypted under a random 32-byte data key. The data key is
//! itself encrypted ("wrapped") under the platform wrapping key. Losing the
//! platform key (new hardware, say) leaves the data key recoverable from
//! recovery shares; the shares' digests and threshold travel in the clear
//! header, which is authenticated as associated data.
//!
//! On disk this is a single `bcs` envelope:
//!
//! ```text
//! magic | format_version | header | wrapped_key | ciphertext
//! ```

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit};
use mesh_key_manager::WrappingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const MAGIC: [u8; 8] = *b"MESHSEAL";
pub const FORMAT_VERSION: u16 = 1;
pub const SEALED_STATE_FILE: &str = "sealed_state";

const PREFIX_LEN: usize = MAGIC.len() + std::mem::size_of::<u16>();

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("sealed state is corrupt: {0}")]
    Corrupt(&'static str),

    #[error("sealed state has unsupported format version {found}")]
    Incompatible { found: u16 },

    #[error("sealing key is unavailable or does not match the sealed state")]
    KeyUnavailable,

    #[error("failed to encrypt sealed state")]
    Encrypt,

    #[error("failed to encode sealed state")]
    Encode(#[source] bcs::Error),

    #[error("failed to access sealed state at {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("sealed state store failed: {0}")]
    Store(String),
}

/// The key the state itself is encrypted with.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct DataKey(pub Box<[u8; 32]>);

impl DataKey {
    pub fn generate() -> DataKey {
        let mut key = DataKey(Box::new([0u8; 32]));
        OsRng.try_fill_bytes(key.0.as_mut()).expect("fetched random bytes");
        key
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0[..]))
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Plaintext recovery metadata carried alongside the encrypted state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHeader {
    /// Shares needed to reconstruct the data key; zero when recovery is not
    /// configured.
    pub threshold: usize,
    /// SHA3-256 of each recovery key's share
    pub share_digests: BTreeMap<String, [u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Ciphertext {
    nonce: [u8; 12],
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 8],
    format_version: u16,
    header: RecoveryHeader,
    wrapped_key: Ciphertext,
    ciphertext: Ciphertext,
}

fn new_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.try_fill_bytes(&mut nonce).expect("fetched random bytes");
    nonce
}

fn wrapping_cipher(wrapping: &SecretBox<WrappingKey>) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(&wrapping.expose_secret().0[..]))
}

/// Encrypt `state` into a sealed blob.
pub fn seal<T: Serialize>(
    state: &T,
    header: &RecoveryHeader,
    data_key: &DataKey,
    wrapping: &SecretBox<WrappingKey>,
) -> Result<Vec<u8>, SealError> {
    let aad = bcs::to_bytes(header).map_err(SealError::Encode)?;
    let plaintext =
        Zeroizing::new(bcs::to_bytes(state).map_err(SealError::Encode)?);

    let key_nonce = new_nonce();
    let wrapped = wrapping_cipher(wrapping)
        .encrypt(
            (&key_nonce).into(),
            Payload { msg: &data_key.0[..], aad: &aad },
        )
        .map_err(|_| SealError::Encrypt)?;

    let state_nonce = new_nonce();
    let encrypted = data_key
        .cipher()
        .encrypt(
            (&state_nonce).into(),
            Payload { msg: plaintext.as_slice(), aad: &aad },
        )
        .map_err(|_| SealError::Encrypt)?;

    bcs::to_bytes(&Envelope {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        header: header.clone(),
        wrapped_key: Ciphertext { nonce: key_nonce, data: wrapped },
        ciphertext: Ciphertext { nonce: state_nonce, data: encrypted },
    })
    .map_err(SealError::Encode)
}

/// A sealed blob whose envelope has been decoded but not yet opened.
#[derive(Debug, Clone)]
pub struct SealedState {
    envelope: Envelope,
    aad: Vec<u8>,
}

impl SealedState {
    /// Decode a blob's envelope. Nothing is decrypted yet.
    pub fn decode(blob: &[u8]) -> Result<SealedState, SealError> {
        if blob.len() < PREFIX_LEN || blob[..MAGIC.len()] != MAGIC {
            return Err(SealError::Corrupt("bad magic"));
        }
        let found =
            u16::from_le_bytes([blob[MAGIC.len()], blob[MAGIC.len() + 1]]);
        if found != FORMAT_VERSION {
            return Err(SealError::Incompatible { found });
        }
        let envelope: Envelope = bcs::from_bytes(blob)
            .map_err(|_| SealError::Corrupt("undecodable envelope"))?;
        let aad = bcs::to_bytes(&envelope.header).map_err(SealError::Encode)?;
        Ok(SealedState { envelope, aad })
    }

    pub fn header(&self) -> &RecoveryHeader {
        &self.envelope.header
    }

    /// Unwrap the data key with the platform wrapping key.
    pub fn unwrap_key(
        &self,
        wrapping: &SecretBox<WrappingKey>,
    ) -> Result<DataKey, SealError> {
        let wrapped = &self.envelope.wrapped_key;
        let key = Zeroizing::new(
            wrapping_cipher(wrapping)
                .decrypt(
                    (&wrapped.nonce).into(),
                    Payload { msg: &wrapped.data, aad: &self.aad },
                )
                .map_err(|_| SealError::KeyUnavailable)?,
        );
        let key: [u8; 32] = key
            .as_slice()
            .try_into()
            .map_err(|_| SealError::Corrupt("wrapped key has wrong length"))?;
        Ok(DataKey(Box::new(key)))
    }

    /// Decrypt and decode the state.
    ///
    /// With the right key, failure means the blob is damaged. With a key
    /// reconstructed from recovery shares, the caller decides what failure
    /// means.
    pub fn open<T: DeserializeOwned>(
        &self,
        data_key: &DataKey,
    ) -> Result<T, SealError> {
        let ciphertext = &self.envelope.ciphertext;
        let plaintext = Zeroizing::new(
            data_key
                .cipher()
                .decrypt(
                    (&ciphertext.nonce).into(),
                    Payload { msg: &ciphertext.data, aad: &self.aad },
                )
                .map_err(|_| SealError::Corrupt("ciphertext does not open"))?,
        );
        bcs::from_bytes(&plaintext)
            .map_err(|_| SealError::Corrupt("state does not decode"))
    }
}

/// Where the sealed blob lives.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self) -> Result<Option<Vec<u8>>, SealError>;

    /// Replace the stored blob. Either the old or the new blob survives a
    /// crash, never a mix.
    async fn write(&self, blob: Vec<u8>) -> Result<(), SealError>;
}

/// Keeps the blob in `<data_dir>/sealed_state`.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: Utf8PathBuf,
}

impl FileStore {
    pub fn new(data_dir: &Utf8Path) -> FileStore {
        FileStore { path: data_dir.join(SEALED_STATE_FILE) }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn io_err(&self, err: std::io::Error) -> SealError {
        SealError::Io { path: self.path.clone(), err }
    }
}

#[async_trait]
impl BlobStore for FileStore {
    async fn read(&self) -> Result<Option<Vec<u8>>, SealError> {
        match tokio::fs::read(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_err(err)),
        }
    }

    async fn write(&self, blob: Vec<u8>) -> Result<(), SealError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_err(err))?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| self.io_err(err))?;
        file.write_all(&blob).await.map_err(|err| self.io_err(err))?;
        file.sync_all().await.map_err(|err| self.io_err(err))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| self.io_err(err))
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn with_blob(blob: Vec<u8>) -> MemoryStore {
        MemoryStore { blob: Mutex::new(Some(blob)), ..Default::default() }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self) -> Result<Option<Vec<u8>>, SealError> {
        Ok(self.blob())
    }

    async fn write(&self, blob: Vec<u8>) -> Result<(), SealError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SealError::Store("writes disabled".to_string()));
        }
        *self.blob.lock().unwrap() = Some(blob);
        Ok(())
    }
}

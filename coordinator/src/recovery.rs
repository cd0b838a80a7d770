// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threshold recovery of the sealed state's data key.
//!
//! When a manifest names recovery keys, the data key is split into one share
//! per key (Shamir over GF(256) for thresholds of two or more, the key itself
//! otherwise). Each share is encrypted to its recovery key and handed out
//! exactly once. Only share digests are kept.

use crate::seal::{DataKey, RecoveryHeader};
use base64::Engine;
use openssl::encrypt::Encrypter;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Padding;
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use vsss_rs::Gf256;
use zeroize::{Zeroize, ZeroizeOnDrop};

// One identifier byte and 32 bytes of key material.
pub const SHARE_SIZE: usize = 33;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("recovery is not configured for this sealed state")]
    NotConfigured,

    #[error("submitted share is not one of the expected shares")]
    InvalidShare,

    #[error("share for recovery key {0:?} was already submitted")]
    DuplicateShare(String),

    #[error("failed to split data key: {0:?}")]
    Split(vsss_rs::Error),

    #[error("failed to combine shares: {0:?}")]
    Combine(vsss_rs::Error),

    #[error("recovery key {name:?} is unusable")]
    BadRecoveryKey {
        name: String,
        #[source]
        err: openssl::error::ErrorStack,
    },

    #[error("failed to encrypt share for recovery key {name:?}")]
    Encrypt {
        name: String,
        #[source]
        err: openssl::error::ErrorStack,
    },

    #[error("reconstructed key does not unseal the state")]
    WrongKey,
}

/// One plaintext recovery share.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct KeyShare(Vec<u8>);

// Share contents must never reach a log.
impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShare").finish()
    }
}

impl KeyShare {
    pub fn new(share: Vec<u8>) -> Result<KeyShare, RecoveryError> {
        if share.len() != SHARE_SIZE {
            return Err(RecoveryError::InvalidShare);
        }
        Ok(KeyShare(share))
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha3_256::digest(&self.0).into()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Split `data_key` into `total` shares, any `threshold` of which recover it.
pub fn split_shares(
    data_key: &DataKey,
    threshold: usize,
    total: usize,
) -> Result<Vec<KeyShare>, RecoveryError> {
    if threshold <= 1 {
        // Every share is the key, tagged with its identifier.
        return Ok((1..=total)
            .map(|id| {
                let mut share = Vec::with_capacity(SHARE_SIZE);
                share.push(u8::try_from(id).unwrap_or(u8::MAX));
                share.extend_from_slice(&data_key.0[..]);
                KeyShare(share)
            })
            .collect());
    }
    let shares = Gf256::split_array(threshold, total, &data_key.0[..], OsRng)
        .map_err(RecoveryError::Split)?;
    Ok(shares.into_iter().map(KeyShare).collect())
}

/// Reconstruct the data key from at least `threshold` distinct shares.
pub fn combine(
    shares: &[KeyShare],
    threshold: usize,
) -> Result<DataKey, RecoveryError> {
    let key: Vec<u8> = if threshold <= 1 {
        let share = shares.first().ok_or(RecoveryError::InvalidShare)?;
        share.0[1..].to_vec()
    } else {
        let raw: Vec<Vec<u8>> = shares.iter().map(|s| s.0.clone()).collect();
        Gf256::combine_array(&raw).map_err(RecoveryError::Combine)?
    };
    let key: Box<[u8; 32]> =
        key.try_into().map_err(|_| RecoveryError::InvalidShare)?;
    Ok(DataKey(key))
}

fn encrypt_share(
    name: &str,
    public_key_pem: &str,
    share: &KeyShare,
) -> Result<String, RecoveryError> {
    let bad_key = |err| RecoveryError::BadRecoveryKey {
        name: name.to_string(),
        err,
    };
    let encrypt_err =
        |err| RecoveryError::Encrypt { name: name.to_string(), err };

    let key = PKey::public_key_from_pem(public_key_pem.as_bytes())
        .map_err(bad_key)?;
    let mut encrypter = Encrypter::new(&key).map_err(bad_key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP).map_err(encrypt_err)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha256()).map_err(encrypt_err)?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha256()).map_err(encrypt_err)?;
    let len = encrypter.encrypt_len(share.as_bytes()).map_err(encrypt_err)?;
    let mut ciphertext = vec![0u8; len];
    let n = encrypter
        .encrypt(share.as_bytes(), &mut ciphertext)
        .map_err(encrypt_err)?;
    ciphertext.truncate(n);
    Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
}

/// Shares produced for a new data key.
#[derive(Debug)]
pub struct ShareSplit {
    pub header: RecoveryHeader,
    /// Recovery key name to base64 RSA-OAEP ciphertext of its share
    pub encrypted_shares: BTreeMap<String, String>,
}

/// Split `data_key` across `recovery_keys` (name to RSA public key PEM).
///
/// With no recovery keys this yields an empty header: recovery is disabled.
pub fn split(
    data_key: &DataKey,
    recovery_keys: &BTreeMap<String, String>,
    threshold: usize,
) -> Result<ShareSplit, RecoveryError> {
    if recovery_keys.is_empty() {
        return Ok(ShareSplit {
            header: RecoveryHeader::default(),
            encrypted_shares: BTreeMap::new(),
        });
    }
    let shares = split_shares(data_key, threshold, recovery_keys.len())?;
    let mut header = RecoveryHeader { threshold, ..Default::default() };
    let mut encrypted_shares = BTreeMap::new();
    for ((name, pem), share) in recovery_keys.iter().zip(shares.iter()) {
        header.share_digests.insert(name.clone(), share.digest());
        encrypted_shares.insert(name.clone(), encrypt_share(name, pem, share)?);
    }
    Ok(ShareSplit { header, encrypted_shares })
}

#[derive(Debug)]
pub enum Submission {
    NeedMore(usize),
    Ready(Vec<KeyShare>),
}

/// Shares submitted so far. Lives only in memory: a restart starts over.
#[derive(Debug)]
pub struct RecoverySession {
    header: RecoveryHeader,
    submitted: BTreeMap<String, KeyShare>,
}

impl RecoverySession {
    pub fn new(header: RecoveryHeader) -> RecoverySession {
        RecoverySession { header, submitted: BTreeMap::new() }
    }

    pub fn header(&self) -> &RecoveryHeader {
        &self.header
    }

    pub fn remaining(&self) -> usize {
        self.header.threshold.saturating_sub(self.submitted.len())
    }

    pub fn reset(&mut self) {
        self.submitted.clear();
    }

    /// Accept one plaintext share.
    ///
    /// Shares that match no digest are rejected without touching progress,
    /// as are shares whose recovery key was already heard from.
    pub fn submit(
        &mut self,
        share: Vec<u8>,
    ) -> Result<Submission, RecoveryError> {
        if self.header.threshold == 0 {
            return Err(RecoveryError::NotConfigured);
        }
        let share = KeyShare::new(share)?;
        let digest = share.digest();
        let name = self
            .header
            .share_digests
            .iter()
            .find(|(_, expected)| bool::from(expected.ct_eq(&digest)))
            .map(|(name, _)| name.clone())
            .ok_or(RecoveryError::InvalidShare)?;
        if self.submitted.contains_key(&name) {
            return Err(RecoveryError::DuplicateShare(name));
        }
        self.submitted.insert(name, share);
        match self.remaining() {
            0 => Ok(Submission::Ready(
                self.submitted.values().cloned().collect(),
            )),
            n => Ok(Submission::NeedMore(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mesh_test_utils::recovery::RecoveryKeyPair;
    use proptest::sample::subsequence;
    use test_strategy::proptest;

    #[proptest]
    fn any_threshold_subset_recovers(
        #[strategy(1usize..=6)] total: usize,
        #[strategy(1usize..=#total)] threshold: usize,
        #[strategy(subsequence((0..#total).collect::<Vec<_>>(), #threshold))]
        picked: Vec<usize>,
    ) {
        let key = DataKey::generate();
        let shares = split_shares(&key, threshold, total).unwrap();
        assert_eq!(shares.len(), total);
        let subset: Vec<KeyShare> =
            picked.iter().map(|&i| shares[i].clone()).collect();
        let recovered = combine(&subset, threshold).unwrap();
        assert_eq!(recovered, key);

        if threshold >= 2 {
            let short = &subset[..threshold - 1];
            let wrong = combine(short, threshold);
            assert!(wrong.map(|k| k != key).unwrap_or(true));
        }
    }

    fn keys(n: usize) -> (Vec<RecoveryKeyPair>, BTreeMap<String, String>) {
        let pairs: Vec<RecoveryKeyPair> =
            (0..n).map(|_| RecoveryKeyPair::generate()).collect();
        let pems = pairs
            .iter()
            .enumerate()
            .map(|(i, k)| (format!("key{i}"), k.public_key_pem()))
            .collect();
        (pairs, pems)
    }

    #[test]
    fn session_counts_down_and_ignores_duplicates() {
        let (pairs, pems) = keys(3);
        let key = DataKey::generate();
        let split = split(&key, &pems, 2).unwrap();
        assert_eq!(split.header.threshold, 2);
        assert_eq!(split.encrypted_shares.len(), 3);

        let plain: Vec<Vec<u8>> = pairs
            .iter()
            .enumerate()
            .map(|(i, k)| {
                k.decrypt_share(&split.encrypted_shares[&format!("key{i}")])
            })
            .collect();

        let mut session = RecoverySession::new(split.header.clone());
        assert_eq!(session.remaining(), 2);
        assert_matches!(
            session.submit(plain[0].clone()),
            Ok(Submission::NeedMore(1))
        );
        assert_matches!(
            session.submit(plain[0].clone()),
            Err(RecoveryError::DuplicateShare(name)) if name == "key0"
        );
        assert_eq!(session.remaining(), 1);
        assert_matches!(
            session.submit(vec![0; SHARE_SIZE]),
            Err(RecoveryError::InvalidShare)
        );
        assert_matches!(
            session.submit(b"short".to_vec()),
            Err(RecoveryError::InvalidShare)
        );
        assert_eq!(session.remaining(), 1);

        let shares = match session.submit(plain[2].clone()).unwrap() {
            Submission::Ready(shares) => shares,
            other => panic!("expected ready, got {other:?}"),
        };
        assert_eq!(combine(&shares, 2).unwrap(), key);

        session.reset();
        assert_eq!(session.remaining(), 2);
    }

    #[test]
    fn single_share_threshold() {
        let (pairs, pems) = keys(2);
        let key = DataKey::generate();
        let split = split(&key, &pems, 1).unwrap();
        let share = pairs[1].decrypt_share(&split.encrypted_shares["key1"]);
        let mut session = RecoverySession::new(split.header);
        let shares = match session.submit(share).unwrap() {
            Submission::Ready(shares) => shares,
            other => panic!("expected ready, got {other:?}"),
        };
        assert_eq!(combine(&shares, 1).unwrap(), key);
    }

    #[test]
    fn unconfigured_recovery() {
        let key = DataKey::generate();
        let split = split(&key, &BTreeMap::new(), 0).unwrap();
        assert!(split.encrypted_shares.is_empty());
        let mut session = RecoverySession::new(split.header);
        assert_matches!(
            session.submit(vec![1; SHARE_SIZE]),
            Err(RecoveryError::NotConfigured)
        );
    }
}

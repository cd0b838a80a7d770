// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Certificate handling for the mesh coordinator: the certificate authority
//! that issues marble and coordinator identities, and the checks applied to
//! certificates that operators put into manifests or present as callers.

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey};
use openssl::sign::Verifier;
use openssl::x509::{X509, X509Ref};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

mod ca;

pub use ca::CaError;
pub use ca::CertificateAuthority;
pub use ca::IssuedCertificate;
pub use ca::LeafRequest;

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate")]
    BadCertificate(#[source] openssl::error::ErrorStack),

    #[error("Certificate exists, but is empty")]
    CertificateEmpty,

    #[error("Certificate exists, but is expired")]
    CertificateExpired,

    #[error("Failed to parse private key")]
    BadPrivateKey(#[source] openssl::error::ErrorStack),

    #[error("Certificate and private key do not match")]
    Mismatch,

    #[error("Certificate does not match hostname {0:?}")]
    NoDnsNameMatchingHostname(String),

    #[error("Unexpected error")]
    Unexpected(#[source] openssl::error::ErrorStack),
}

/// SHA-256 digest of a certificate's DER encoding
///
/// This is how users named in a manifest are recognized: the certificate a
/// caller presents must hash to the same value as the one in the manifest.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of_der(der: &[u8]) -> Fingerprint {
        Fingerprint(Sha256::digest(der).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Parse a PEM bundle and return its first (leaf) certificate.
pub fn leaf_from_pem(pem: &[u8]) -> Result<X509, CertificateError> {
    let mut certs =
        X509::stack_from_pem(pem).map_err(CertificateError::BadCertificate)?;
    if certs.is_empty() {
        return Err(CertificateError::CertificateEmpty);
    }
    Ok(certs.swap_remove(0))
}

/// Fingerprint of the leaf certificate of a PEM bundle.
pub fn fingerprint_pem(pem: &[u8]) -> Result<Fingerprint, CertificateError> {
    let leaf = leaf_from_pem(pem)?;
    let der = leaf.to_der().map_err(CertificateError::BadCertificate)?;
    Ok(Fingerprint::of_der(&der))
}

/// Fingerprint of a single DER certificate, after checking that it parses.
pub fn fingerprint_der(der: &[u8]) -> Result<Fingerprint, CertificateError> {
    if der.is_empty() {
        return Err(CertificateError::CertificateEmpty);
    }
    X509::from_der(der).map_err(CertificateError::BadCertificate)?;
    Ok(Fingerprint::of_der(der))
}

/// Check that `signature` over `message` was made with the private key
/// belonging to the DER certificate `der`.
///
/// ECDSA and RSA signatures are over SHA-256 of the message; Ed25519 signs
/// the message itself. A malformed signature is simply not valid.
pub fn verify_signature(
    der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, CertificateError> {
    let cert = X509::from_der(der).map_err(CertificateError::BadCertificate)?;
    let key = cert.public_key().map_err(CertificateError::BadCertificate)?;
    let mut verifier = match key.id() {
        Id::ED25519 => Verifier::new_without_digest(&key),
        _ => Verifier::new(MessageDigest::sha256(), &key),
    }
    .map_err(CertificateError::Unexpected)?;
    Ok(verifier.verify_oneshot(signature, message).unwrap_or(false))
}

pub struct CertificateValidator {
    validate_expiration: bool,
}

impl Default for CertificateValidator {
    fn default() -> Self {
        Self { validate_expiration: true }
    }
}

impl CertificateValidator {
    /// Disable validation of certificate expiration dates.
    pub fn danger_disable_expiration_validation(&mut self) {
        self.validate_expiration = false;
    }

    /// Validate that we can parse the cert chain, that the key matches, and
    /// that the certs in the chain are not expired (unless we have disabled
    /// expiration validation).
    ///
    /// `certs` is expected to be a certificate chain in PEM format.
    ///
    /// `key` is expected to be the private key for the leaf certificate of
    /// `certs` in PEM format.
    ///
    /// If `hostname` is not `None`, the leaf certificate of `certs` must be
    /// valid for `hostname`, as determined by a dNSName entry in its subject
    /// alternate names or (if there are no dNSName SANs) the cert's common
    /// name.
    pub fn validate(
        &self,
        certs: &[u8],
        key: &[u8],
        hostname: Option<&str>,
    ) -> Result<(), CertificateError> {
        let mut certs = X509::stack_from_pem(certs)
            .map_err(CertificateError::BadCertificate)?;
        if certs.is_empty() {
            return Err(CertificateError::CertificateEmpty);
        }

        if self.validate_expiration {
            let now = Asn1Time::days_from_now(0)
                .map_err(CertificateError::Unexpected)?;
            for cert in &certs {
                if cert.not_after() < now {
                    return Err(CertificateError::CertificateExpired);
                }
            }
        }

        let cert = certs.swap_remove(0);

        if let Some(hostname) = hostname {
            if !valid_for_hostname(&cert, hostname) {
                return Err(CertificateError::NoDnsNameMatchingHostname(
                    hostname.to_string(),
                ));
            }
        }

        let key = PKey::private_key_from_pem(key)
            .map_err(CertificateError::BadPrivateKey)?;

        // Verify the public key corresponding to this private key
        // matches the public key in the certificate.
        if !cert
            .public_key()
            .map_err(CertificateError::BadCertificate)?
            .public_eq(&key)
        {
            return Err(CertificateError::Mismatch);
        }

        Ok(())
    }
}

// dNSName SANs win; the common name is only consulted when there are none.
fn valid_for_hostname(cert: &X509Ref, hostname: &str) -> bool {
    let sans: Vec<String> = cert
        .subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    if !sans.is_empty() {
        return sans.iter().any(|san| dns_name_matches(san, hostname));
    }

    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .filter_map(|entry| entry.data().as_utf8().ok())
        .any(|cn| dns_name_matches(&cn, hostname))
}

// A wildcard covers exactly one leftmost label.
fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }
    match (pattern.strip_prefix("*."), hostname.split_once('.')) {
        (Some(suffix), Some((label, rest))) => {
            !label.is_empty()
                && label != "*"
                && rest.eq_ignore_ascii_case(suffix)
        }
        _ => false,
    }
}

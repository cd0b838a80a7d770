// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The coordinator's certificate authority.
//!
//! One root key pair signs every marble leaf and the coordinator's own TLS
//! leaf. There is no revocation list: rotating the root (a fresh coordinator
//! identity) is what invalidates previously issued leaves.

use crate::{CertificateError, CertificateValidator};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use secrecy::SecretString;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate key pair")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("failed to build certificate")]
    Certificate(#[source] rcgen::Error),

    #[error("failed to load CA key")]
    LoadKey(#[source] rcgen::Error),

    #[error("failed to load CA certificate")]
    LoadCertificate(#[source] rcgen::Error),

    #[error("CA certificate does not match its key")]
    Invalid(#[source] CertificateError),

    #[error("certificate lifetime {0:?} is out of range")]
    InvalidLifetime(Duration),
}

/// What a leaf certificate should say about its subject.
#[derive(Debug, Clone)]
pub struct LeafRequest {
    pub common_name: String,
    pub organizational_unit: Option<String>,
    pub dns_names: Vec<String>,
    pub lifetime: Duration,
}

/// A freshly issued leaf and the private key generated for it.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub key_pem: SecretString,
    /// Hex encoding of the certificate serial number
    pub serial: String,
    pub not_after: SystemTime,
}

pub struct CertificateAuthority {
    organization: String,
    cert_pem: String,
    cert_der: Vec<u8>,
    key: KeyPair,
    issuer: Certificate,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a new self-signed root.
    pub fn generate(
        organization: &str,
        lifetime: Duration,
    ) -> Result<CertificateAuthority, CaError> {
        let key = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{organization} Root CA"));
        dn.push(DnType::OrganizationName, organization);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, lifetime)?;
        params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

        let cert = params.self_signed(&key).map_err(CaError::Certificate)?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().to_vec();
        Ok(CertificateAuthority {
            organization: organization.to_string(),
            cert_pem,
            cert_der,
            key,
            issuer: cert,
        })
    }

    /// Reload a root from its persisted certificate and key.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<CertificateAuthority, CaError> {
        let mut validator = CertificateValidator::default();
        validator.danger_disable_expiration_validation();
        validator
            .validate(cert_pem.as_bytes(), key_pem.as_bytes(), None)
            .map_err(CaError::Invalid)?;

        let key = KeyPair::from_pem(key_pem).map_err(CaError::LoadKey)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(CaError::LoadCertificate)?;
        let organization = params
            .distinguished_name
            .get(&DnType::OrganizationName)
            .and_then(dn_value_to_string)
            .unwrap_or_default();
        let cert_der = crate::leaf_from_pem(cert_pem.as_bytes())
            .and_then(|cert| {
                cert.to_der().map_err(CertificateError::BadCertificate)
            })
            .map_err(CaError::Invalid)?;

        // The re-signed certificate is only used as the issuer of new leaves;
        // it carries the same subject and key as the persisted one, which is
        // what ends up in the chain.
        let issuer = params.self_signed(&key).map_err(CaError::Certificate)?;
        Ok(CertificateAuthority {
            organization,
            cert_pem: cert_pem.to_string(),
            cert_der,
            key,
            issuer,
        })
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn root_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn root_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn key_pem(&self) -> SecretString {
        SecretString::from(self.key.serialize_pem())
    }

    /// Generate a key pair and issue a leaf for it, signed by the root.
    ///
    /// Leaves are usable for both server and client authentication: marbles
    /// use one certificate for both sides of their mesh connections.
    pub fn issue(
        &self,
        request: &LeafRequest,
    ) -> Result<IssuedCertificate, CaError> {
        let leaf_key = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let mut params = CertificateParams::new(request.dns_names.clone())
            .map_err(CaError::Certificate)?;
        params.distinguished_name = leaf_name(
            &request.common_name,
            request.organizational_unit.as_deref(),
            &self.organization,
        );
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        let not_after = set_validity(&mut params, request.lifetime)?;
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key)
            .map_err(CaError::Certificate)?;
        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key_pem: SecretString::from(leaf_key.serialize_pem()),
            serial: hex::encode(serial),
            not_after: not_after.into(),
        })
    }

    /// Issue a throwaway self-signed server identity.
    ///
    /// Used while the real root is sealed away (recovery mode), so the
    /// management endpoint can still speak TLS.
    pub fn self_signed_server(
        organization: &str,
        dns_names: &[String],
        lifetime: Duration,
    ) -> Result<IssuedCertificate, CaError> {
        let key = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let mut params = CertificateParams::new(dns_names.to_vec())
            .map_err(CaError::Certificate)?;
        params.distinguished_name =
            leaf_name(organization, None, organization);
        let not_after = set_validity(&mut params, lifetime)?;
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        let cert = params.self_signed(&key).map_err(CaError::Certificate)?;
        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key_pem: SecretString::from(key.serialize_pem()),
            serial: hex::encode(serial),
            not_after: not_after.into(),
        })
    }
}

fn leaf_name(
    common_name: &str,
    organizational_unit: Option<&str>,
    organization: &str,
) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(ou) = organizational_unit {
        dn.push(DnType::OrganizationalUnitName, ou);
    }
    dn.push(DnType::OrganizationName, organization);
    dn
}

fn set_validity(
    params: &mut CertificateParams,
    lifetime: Duration,
) -> Result<OffsetDateTime, CaError> {
    let span = time::Duration::try_from(lifetime)
        .map_err(|_| CaError::InvalidLifetime(lifetime))?;
    let now = OffsetDateTime::now_utc();
    let not_after = now
        .checked_add(span)
        .ok_or(CaError::InvalidLifetime(lifetime))?;
    params.not_before = now;
    params.not_after = not_after;
    Ok(not_after)
}

// Positive 128-bit serials.
fn random_serial() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    bytes
}

fn dn_value_to_string(value: &rcgen::DnValue) -> Option<String> {
    match value {
        rcgen::DnValue::Utf8String(s) => Some(s.clone()),
        rcgen::DnValue::PrintableString(s) => Some(s.as_str().to_string()),
        rcgen::DnValue::Ia5String(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use openssl::nid::Nid;
    use openssl::x509::X509;
    use secrecy::ExposeSecret;

    const DAY: Duration = Duration::from_secs(86400);

    fn subject_entry(cert: &X509, nid: Nid) -> String {
        cert.subject_name()
            .entries_by_nid(nid)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string()
    }

    #[test]
    fn issued_leaf_chains_to_root() {
        let ca = CertificateAuthority::generate("Mesh", 365 * DAY).unwrap();
        let leaf = ca
            .issue(&LeafRequest {
                common_name: "6f1c5d8e-0000-4000-8000-000000000001".into(),
                organizational_unit: Some("backend".into()),
                dns_names: vec!["backend.mesh.local".into()],
                lifetime: DAY,
            })
            .unwrap();

        let root = X509::from_pem(ca.root_pem().as_bytes()).unwrap();
        let cert = X509::from_pem(leaf.cert_pem.as_bytes()).unwrap();
        assert!(cert.verify(&root.public_key().unwrap()).unwrap());
        assert_eq!(
            subject_entry(&cert, Nid::ORGANIZATIONALUNITNAME),
            "backend"
        );
        assert_eq!(subject_entry(&cert, Nid::ORGANIZATIONNAME), "Mesh");
        assert_eq!(
            subject_entry(&cert, Nid::COMMONNAME),
            "6f1c5d8e-0000-4000-8000-000000000001"
        );

        // The generated key belongs to the certificate.
        CertificateValidator::default()
            .validate(
                leaf.cert_pem.as_bytes(),
                leaf.key_pem.expose_secret().as_bytes(),
                Some("backend.mesh.local"),
            )
            .unwrap();
    }

    #[test]
    fn reloaded_ca_issues_under_the_same_root() {
        let ca = CertificateAuthority::generate("Mesh", 365 * DAY).unwrap();
        let reloaded = CertificateAuthority::from_pem(
            ca.root_pem(),
            ca.key_pem().expose_secret(),
        )
        .unwrap();
        assert_eq!(reloaded.root_pem(), ca.root_pem());
        assert_eq!(reloaded.root_der(), ca.root_der());
        assert_eq!(reloaded.organization(), "Mesh");

        let leaf = reloaded
            .issue(&LeafRequest {
                common_name: "coordinator".into(),
                organizational_unit: None,
                dns_names: vec!["localhost".into()],
                lifetime: DAY,
            })
            .unwrap();
        let root = X509::from_pem(ca.root_pem().as_bytes()).unwrap();
        let cert = X509::from_pem(leaf.cert_pem.as_bytes()).unwrap();
        assert!(cert.verify(&root.public_key().unwrap()).unwrap());
    }

    #[test]
    fn mismatched_key_is_rejected_on_reload() {
        let a = CertificateAuthority::generate("A", DAY).unwrap();
        let b = CertificateAuthority::generate("B", DAY).unwrap();
        assert_matches!(
            CertificateAuthority::from_pem(
                a.root_pem(),
                b.key_pem().expose_secret()
            ),
            Err(CaError::Invalid(CertificateError::Mismatch))
        );
    }

    #[test]
    fn serials_are_unique() {
        let ca = CertificateAuthority::generate("Mesh", DAY).unwrap();
        let request = LeafRequest {
            common_name: "x".into(),
            organizational_unit: None,
            dns_names: vec![],
            lifetime: DAY,
        };
        let a = ca.issue(&request).unwrap();
        let b = ca.issue(&request).unwrap();
        assert_ne!(a.serial, b.serial);
        assert!(a.not_after > SystemTime::now());
    }

    #[test]
    fn self_signed_server_is_not_from_the_root() {
        let ca = CertificateAuthority::generate("Mesh", DAY).unwrap();
        let ephemeral = CertificateAuthority::self_signed_server(
            "Mesh",
            &["localhost".to_string()],
            DAY,
        )
        .unwrap();
        let root = X509::from_pem(ca.root_pem().as_bytes()).unwrap();
        let cert = X509::from_pem(ephemeral.cert_pem.as_bytes()).unwrap();
        assert!(!cert.verify(&root.public_key().unwrap()).unwrap());
    }
}

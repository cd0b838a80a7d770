// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attestation quotes.
//!
//! A quote is a signed report: a platform key (the infrastructure's `RootCA`)
//! signs the measurements of the code that asked for it, plus 32 bytes of
//! caller data binding the quote to something (a TLS certificate). The
//! coordinator only verifies quotes from marbles; it issues quotes over its
//! own root certificate so operators can check it before trusting it.

use crate::manifest::{InfrastructureProperties, PackageProperties};
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq, ConstantTimeGreater};

pub const QUOTE_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    /// Carries no detail; which check failed is never revealed.
    #[error("attestation failed")]
    Failed,

    #[error("failed to load attestation key")]
    Key(#[source] openssl::error::ErrorStack),

    #[error("attestation key is not an Ed25519 key")]
    NotEd25519,

    #[error("failed to sign report")]
    Sign(#[source] openssl::error::ErrorStack),

    #[error("failed to encode report")]
    Encode(#[source] bcs::Error),
}

/// Platform properties, as reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformReport {
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub cpu_svn: Vec<u8>,
}

/// The measured identity of a piece of code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub security_version: u16,
    pub product_id: u16,
    pub signer_id: Vec<u8>,
    pub unique_id: Vec<u8>,
    pub debug: bool,
    /// SHA-256 of the data this report is bound to
    pub report_data: Vec<u8>,
    pub platform: PlatformReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Quote {
    version: u16,
    report_bytes: Vec<u8>,
    attestation_key: Vec<u8>,
    signature: Vec<u8>,
}

/// What a successfully validated quote vouches for: the digest of the data
/// it was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyBinding(pub [u8; 32]);

pub trait QuoteValidator: Send + Sync {
    /// Check `quote` against the expected package and (any one of) the
    /// candidate infrastructures, and that it binds `bound_data`.
    fn validate(
        &self,
        quote: &[u8],
        bound_data: &[u8],
        package: &PackageProperties,
        infrastructures: &[InfrastructureProperties],
    ) -> Result<PublicKeyBinding, AttestationError>;
}

pub trait QuoteIssuer: Send + Sync {
    /// Produce a quote binding `data`.
    fn issue(&self, data: &[u8]) -> Result<Vec<u8>, AttestationError>;
}

fn choice(b: bool) -> Choice {
    Choice::from(u8::from(b))
}

// `actual >= minimum`, or true if there is no minimum.
fn at_least(actual: u16, minimum: Option<u16>) -> Choice {
    match minimum {
        Some(min) => !min.ct_gt(&actual),
        None => Choice::from(1),
    }
}

fn bytes_match(actual: &[u8], expected: Option<&[u8]>) -> Choice {
    match expected {
        Some(expected) => actual.ct_eq(expected),
        None => Choice::from(1),
    }
}

/// Validates signed-report quotes.
///
/// Every check runs regardless of earlier failures, and failures are not
/// distinguished from each other.
#[derive(Debug, Default)]
pub struct SignedReportValidator;

impl SignedReportValidator {
    fn check(
        quote: &[u8],
        bound_data: &[u8],
        package: &PackageProperties,
        infrastructures: &[InfrastructureProperties],
    ) -> (Choice, [u8; 32]) {
        let expected_data: [u8; 32] = Sha256::digest(bound_data).into();
        let Ok(quote) = bcs::from_bytes::<Quote>(quote) else {
            return (Choice::from(0), expected_data);
        };
        let mut ok = quote.version.ct_eq(&QUOTE_VERSION);

        let signature_ok = PKey::public_key_from_raw_bytes(
            &quote.attestation_key,
            Id::ED25519,
        )
        .and_then(|key| {
            let mut verifier = Verifier::new_without_digest(&key)?;
            verifier.verify_oneshot(&quote.signature, &quote.report_bytes)
        })
        .unwrap_or(false);
        ok &= choice(signature_ok);

        let (report, decoded) =
            match bcs::from_bytes::<Report>(&quote.report_bytes) {
                Ok(report) => (report, true),
                Err(_) => (Report::default(), false),
            };
        ok &= choice(decoded);

        // Freshness/binding.
        ok &= report.report_data.ct_eq(&expected_data[..]);

        // Measurements.
        ok &= at_least(report.security_version, package.security_version);
        ok &= match package.product_id {
            Some(id) => report.product_id.ct_eq(&id),
            None => Choice::from(1),
        };
        ok &= bytes_match(
            &report.signer_id,
            package.signer_id.as_ref().map(|s| s.0.as_slice()),
        );
        ok &= bytes_match(
            &report.unique_id,
            package.unique_id.as_ref().map(|s| s.0.as_slice()),
        );
        ok &= choice(report.debug == package.debug);

        // Platform: the report must come from one of the candidates.
        let mut platform_ok = Choice::from(0);
        for infra in infrastructures {
            let mut this = quote.attestation_key.ct_eq(&infra.root_ca.0[..]);
            this &= at_least(report.platform.qe_svn, infra.qe_svn);
            this &= at_least(report.platform.pce_svn, infra.pce_svn);
            this &= bytes_match(
                &report.platform.cpu_svn,
                infra.cpu_svn.as_ref().map(|s| s.0.as_slice()),
            );
            platform_ok |= this;
        }
        ok &= platform_ok;

        (ok, expected_data)
    }
}

impl QuoteValidator for SignedReportValidator {
    fn validate(
        &self,
        quote: &[u8],
        bound_data: &[u8],
        package: &PackageProperties,
        infrastructures: &[InfrastructureProperties],
    ) -> Result<PublicKeyBinding, AttestationError> {
        let (ok, binding) =
            Self::check(quote, bound_data, package, infrastructures);
        if bool::from(ok) {
            Ok(PublicKeyBinding(binding))
        } else {
            Err(AttestationError::Failed)
        }
    }
}

/// Accepts every quote. Only for environments without attestation hardware,
/// and only when configured explicitly.
#[derive(Debug, Default)]
pub struct SimulationValidator;

impl QuoteValidator for SimulationValidator {
    fn validate(
        &self,
        _quote: &[u8],
        bound_data: &[u8],
        _package: &PackageProperties,
        _infrastructures: &[InfrastructureProperties],
    ) -> Result<PublicKeyBinding, AttestationError> {
        Ok(PublicKeyBinding(Sha256::digest(bound_data).into()))
    }
}

/// Signs reports with an Ed25519 platform key.
pub struct SignedReportIssuer {
    key: PKey<Private>,
    template: Report,
}

impl std::fmt::Debug for SignedReportIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedReportIssuer")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl SignedReportIssuer {
    /// `template` supplies the measurements; its `report_data` is replaced
    /// on every issue.
    pub fn from_pem(
        pem: &[u8],
        template: Report,
    ) -> Result<SignedReportIssuer, AttestationError> {
        let key =
            PKey::private_key_from_pem(pem).map_err(AttestationError::Key)?;
        if key.id() != Id::ED25519 {
            return Err(AttestationError::NotEd25519);
        }
        Ok(SignedReportIssuer { key, template })
    }

    pub fn public_key_raw(&self) -> Result<Vec<u8>, AttestationError> {
        self.key.raw_public_key().map_err(AttestationError::Key)
    }
}

impl QuoteIssuer for SignedReportIssuer {
    fn issue(&self, data: &[u8]) -> Result<Vec<u8>, AttestationError> {
        let mut report = self.template.clone();
        report.report_data = Sha256::digest(data).to_vec();
        let report_bytes =
            bcs::to_bytes(&report).map_err(AttestationError::Encode)?;
        let mut signer = Signer::new_without_digest(&self.key)
            .map_err(AttestationError::Sign)?;
        let signature = signer
            .sign_oneshot_to_vec(&report_bytes)
            .map_err(AttestationError::Sign)?;
        let attestation_key = self.public_key_raw()?;
        bcs::to_bytes(&Quote {
            version: QUOTE_VERSION,
            report_bytes,
            attestation_key,
            signature,
        })
        .map_err(AttestationError::Encode)
    }
}

/// Emits empty quotes.
#[derive(Debug, Default)]
pub struct SimulationIssuer;

impl QuoteIssuer for SimulationIssuer {
    fn issue(&self, _data: &[u8]) -> Result<Vec<u8>, AttestationError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{HexBytes, Manifest};
    use assert_matches::assert_matches;
    use mesh_test_utils::manifest::{
        AttestationKey, ManifestBuilder, BACKEND_PRODUCT_ID,
        BACKEND_SECURITY_VERSION, BACKEND_SIGNER_ID, PLATFORM_PCE_SVN,
        PLATFORM_QE_SVN,
    };

    fn backend_report() -> Report {
        Report {
            security_version: BACKEND_SECURITY_VERSION,
            product_id: BACKEND_PRODUCT_ID,
            signer_id: BACKEND_SIGNER_ID.to_vec(),
            unique_id: vec![0x11; 32],
            debug: false,
            report_data: Vec::new(),
            platform: PlatformReport {
                qe_svn: PLATFORM_QE_SVN,
                pce_svn: PLATFORM_PCE_SVN,
                cpu_svn: vec![0; 16],
            },
        }
    }

    struct Setup {
        manifest: Manifest,
        key: AttestationKey,
    }

    fn setup() -> Setup {
        let fixture = ManifestBuilder::new().build();
        Setup {
            manifest: Manifest::parse(&fixture.raw).unwrap(),
            key: fixture.attestation,
        }
    }

    fn validate_with(
        setup: &Setup,
        report: Report,
        bound: &[u8],
        claimed: &[u8],
    ) -> Result<PublicKeyBinding, AttestationError> {
        let issuer =
            SignedReportIssuer::from_pem(&setup.key.private_key_pem(), report)
                .unwrap();
        let quote = issuer.issue(bound).unwrap();
        let marble = &setup.manifest.marbles["backend"];
        SignedReportValidator.validate(
            &quote,
            claimed,
            &setup.manifest.packages[&marble.package],
            &setup.manifest.candidate_infrastructures(marble),
        )
    }

    #[test]
    fn accepts_matching_quote() {
        let setup = setup();
        let binding =
            validate_with(&setup, backend_report(), b"cert", b"cert").unwrap();
        assert_eq!(binding.0, <[u8; 32]>::from(Sha256::digest(b"cert")));
    }

    #[test]
    fn accepts_newer_security_version() {
        let setup = setup();
        let mut report = backend_report();
        report.security_version += 1;
        validate_with(&setup, report, b"cert", b"cert").unwrap();
    }

    #[test]
    fn every_mismatch_fails_the_same_way() {
        let setup = setup();
        let mutations: Vec<Box<dyn Fn(&mut Report)>> = vec![
            Box::new(|r| r.security_version -= 1),
            Box::new(|r| r.product_id += 1),
            Box::new(|r| r.signer_id[0] ^= 1),
            Box::new(|r| r.debug = true),
            Box::new(|r| r.platform.qe_svn -= 1),
            Box::new(|r| r.platform.pce_svn -= 1),
        ];
        for mutate in mutations {
            let mut report = backend_report();
            mutate(&mut report);
            assert_matches!(
                validate_with(&setup, report, b"cert", b"cert"),
                Err(AttestationError::Failed)
            );
        }
    }

    #[test]
    fn rejects_wrong_binding() {
        let setup = setup();
        assert_matches!(
            validate_with(&setup, backend_report(), b"cert", b"other cert"),
            Err(AttestationError::Failed)
        );
    }

    #[test]
    fn rejects_untrusted_platform_key() {
        let setup = setup();
        let rogue = AttestationKey::generate();
        let key = rogue.private_key_pem();
        let issuer =
            SignedReportIssuer::from_pem(&key, backend_report()).unwrap();
        let quote = issuer.issue(b"cert").unwrap();
        let marble = &setup.manifest.marbles["backend"];
        assert_matches!(
            SignedReportValidator.validate(
                &quote,
                b"cert",
                &setup.manifest.packages["backend"],
                &setup.manifest.candidate_infrastructures(marble),
            ),
            Err(AttestationError::Failed)
        );
    }

    #[test]
    fn rejects_tampered_and_garbage_quotes() {
        let setup = setup();
        let issuer = SignedReportIssuer::from_pem(
            &setup.key.private_key_pem(),
            backend_report(),
        )
        .unwrap();
        let mut quote = issuer.issue(b"cert").unwrap();
        let package = &setup.manifest.packages["backend"];
        let infras = setup.manifest.candidate_infrastructures(
            &setup.manifest.marbles["backend"],
        );

        // Flip a byte in the middle of the signed report.
        let mid = quote.len() / 3;
        quote[mid] ^= 0x01;
        assert_matches!(
            SignedReportValidator.validate(&quote, b"cert", package, &infras),
            Err(AttestationError::Failed)
        );

        for garbage in [&b""[..], b"\x00", b"not a quote at all"] {
            let validator = SignedReportValidator;
            let result = validator.validate(garbage, b"cert", package, &infras);
            assert_matches!(result, Err(AttestationError::Failed));
        }
    }

    #[test]
    fn no_infrastructure_means_no_trust() {
        let setup = setup();
        let issuer = SignedReportIssuer::from_pem(
            &setup.key.private_key_pem(),
            backend_report(),
        )
        .unwrap();
        let quote = issuer.issue(b"cert").unwrap();
        assert_matches!(
            SignedReportValidator.validate(
                &quote,
                b"cert",
                &setup.manifest.packages["backend"],
                &[],
            ),
            Err(AttestationError::Failed)
        );
    }

    #[test]
    fn cpu_svn_is_compared_when_pinned() {
        let setup = setup();
        let mut infra =
            setup.manifest.infrastructures["local"].clone();
        infra.cpu_svn = Some(HexBytes(vec![1; 16]));
        let issuer = SignedReportIssuer::from_pem(
            &setup.key.private_key_pem(),
            backend_report(),
        )
        .unwrap();
        let quote = issuer.issue(b"cert").unwrap();
        assert_matches!(
            SignedReportValidator.validate(
                &quote,
                b"cert",
                &setup.manifest.packages["backend"],
                &[infra],
            ),
            Err(AttestationError::Failed)
        );
    }

    #[test]
    fn simulation_accepts_anything() {
        let setup = setup();
        let quote = SimulationIssuer.issue(b"cert").unwrap();
        assert!(quote.is_empty());
        SimulationValidator
            .validate(&quote, b"cert", &setup.manifest.packages["backend"], &[])
            .unwrap();
    }
}

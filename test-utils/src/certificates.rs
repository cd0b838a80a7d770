// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for tests that need certificates.

use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyPair,
};

// Utility structure for making a test certificate
pub struct CertificateChain {
    root_cert: Vec<u8>,
    intermediate_cert: Vec<u8>,
    end_cert: Vec<u8>,
    end_keypair: KeyPair,
}

impl CertificateChain {
    pub fn new<S: Into<String>>(subject_alt_name: S) -> Self {
        let params =
            CertificateParams::new(vec![subject_alt_name.into()])
                .expect("valid subject alt name");
        Self::with_params(params)
    }

    pub fn with_params(params: CertificateParams) -> Self {
        let mut root_params = CertificateParams::default();
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root_keypair =
            KeyPair::generate().expect("failed to generate root keys");
        let root = root_params
            .self_signed(&root_keypair)
            .expect("failed to self-sign root cert");

        let mut intermediate_params = CertificateParams::default();
        intermediate_params.is_ca =
            IsCa::Ca(BasicConstraints::Unconstrained);
        let intermediate_keypair =
            KeyPair::generate().expect("failed to generate intermediate keys");
        let intermediate = intermediate_params
            .signed_by(&intermediate_keypair, &root, &root_keypair)
            .expect("failed to sign intermediate cert");

        let end_keypair =
            KeyPair::generate().expect("failed to generate end-entity keys");
        let end = params
            .signed_by(&end_keypair, &intermediate, &intermediate_keypair)
            .expect("failed to sign end-entity cert");

        Self {
            root_cert: root.der().to_vec(),
            intermediate_cert: intermediate.der().to_vec(),
            end_cert: end.der().to_vec(),
            end_keypair,
        }
    }

    pub fn end_cert_der(&self) -> Vec<u8> {
        self.end_cert.clone()
    }

    pub fn end_cert_private_key_as_pem(&self) -> String {
        self.end_keypair.serialize_pem()
    }

    fn cert_chain(&self) -> Vec<Vec<u8>> {
        vec![
            self.end_cert.clone(),
            self.intermediate_cert.clone(),
            self.root_cert.clone(),
        ]
    }

    pub fn cert_chain_as_pem(&self) -> String {
        der_to_pem(&self.cert_chain())
    }
}

/// A self-signed certificate standing in for an admin or client of the mesh.
pub struct UserCertificate {
    pub name: String,
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    key: PKey<Private>,
}

impl UserCertificate {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        let keypair = KeyPair::generate().expect("failed to generate keys");
        let cert = params
            .self_signed(&keypair)
            .expect("failed to self-sign user cert");
        let key = PKey::private_key_from_pem(keypair.serialize_pem().as_bytes())
            .expect("rcgen key is valid PEM");
        Self {
            name: name.to_string(),
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key,
        }
    }

    /// ECDSA-SHA256 signature over `message` with this user's key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)
            .expect("created signer");
        signer.sign_oneshot_to_vec(message).expect("signed message")
    }

    /// The header value a TLS terminator would forward for this user.
    pub fn forwarded_header(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.cert_der)
    }
}

fn der_to_pem(certs: &[Vec<u8>]) -> String {
    let mut serialized_certs = String::new();
    for cert in certs {
        let encoded_cert =
            pem::encode(&pem::Pem::new("CERTIFICATE", cert.clone()));
        serialized_certs.push_str(&encoded_cert);
    }
    serialized_certs
}

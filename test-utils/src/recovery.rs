// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RSA key pairs held by the "administrators" of recovery tests.

use base64::Engine;
use openssl::encrypt::Decrypter;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};

pub struct RecoveryKeyPair {
    key: PKey<Private>,
}

impl RecoveryKeyPair {
    pub fn generate() -> Self {
        let rsa = Rsa::generate(2048).expect("failed to generate RSA key");
        Self { key: PKey::from_rsa(rsa).expect("wrap RSA key") }
    }

    /// The public half, as it is written into a manifest.
    pub fn public_key_pem(&self) -> String {
        let pem = self
            .key
            .public_key_to_pem()
            .expect("failed to serialize public key");
        String::from_utf8(pem).expect("PEM is ASCII")
    }

    /// Decrypt a base64 share returned by the coordinator, the way an
    /// administrator would before submitting it for recovery.
    pub fn decrypt_share(&self, encrypted_b64: &str) -> Vec<u8> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .expect("share is base64");
        let mut decrypter =
            Decrypter::new(&self.key).expect("create decrypter");
        decrypter.set_rsa_padding(Padding::PKCS1_OAEP).expect("set padding");
        decrypter.set_rsa_oaep_md(MessageDigest::sha256()).expect("set md");
        decrypter.set_rsa_mgf1_md(MessageDigest::sha256()).expect("set mgf1");
        let len = decrypter.decrypt_len(&ciphertext).expect("decrypt len");
        let mut plaintext = vec![0u8; len];
        let n = decrypter
            .decrypt(&ciphertext, &mut plaintext)
            .expect("share decrypts under this recovery key");
        plaintext.truncate(n);
        plaintext
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers shared by the coordinator integration tests.

#![allow(dead_code)]

use base64::Engine;
use mesh_coordinator::quote::{
    PlatformReport, QuoteIssuer, Report, SignedReportIssuer,
    SignedReportValidator, SimulationIssuer,
};
use chrono::Utc;
use mesh_coordinator::seal::MemoryStore;
use mesh_coordinator::user::{Caller, ClientCredential};
use mesh_coordinator::{Backends, Coordinator, CoordinatorSettings};
use mesh_coordinator_api::{client_signed_payload, ActivationRequest};
use mesh_key_manager::StaticSecretRetriever;
use mesh_test_utils::certificates::UserCertificate;
use mesh_test_utils::manifest::{
    ManifestFixture, BACKEND_PRODUCT_ID, BACKEND_SECURITY_VERSION,
    BACKEND_SIGNER_ID, FRONTEND_UNIQUE_ID, PLATFORM_PCE_SVN, PLATFORM_QE_SVN,
};
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

/// Platform key material for the first boot of every test.
pub const PLATFORM_KEY: [u8; 32] = [7; 32];

/// Collaborators for a coordinator that checks real signed reports.
pub fn backends(store: Arc<MemoryStore>, platform_key: [u8; 32]) -> Backends {
    Backends {
        store,
        secret_retriever: Arc::new(StaticSecretRetriever::new(platform_key)),
        validator: Arc::new(SignedReportValidator),
        issuer: Arc::new(SimulationIssuer),
    }
}

pub async fn start(
    log: &Logger,
    store: &Arc<MemoryStore>,
    platform_key: [u8; 32],
) -> Coordinator {
    Coordinator::start(
        log,
        CoordinatorSettings::default(),
        backends(Arc::clone(store), platform_key),
    )
    .await
    .expect("coordinator started")
}

/// A coordinator with `fixture`'s manifest installed.
pub async fn start_with_manifest(
    log: &Logger,
    store: &Arc<MemoryStore>,
    fixture: &ManifestFixture,
) -> Coordinator {
    let coordinator = start(log, store, PLATFORM_KEY).await;
    coordinator.set_manifest(&fixture.raw).await.expect("manifest installed");
    coordinator
}

fn platform() -> PlatformReport {
    PlatformReport {
        qe_svn: PLATFORM_QE_SVN,
        pce_svn: PLATFORM_PCE_SVN,
        cpu_svn: Vec::new(),
    }
}

/// A report matching the fixture's `backend` package.
pub fn backend_report() -> Report {
    Report {
        security_version: BACKEND_SECURITY_VERSION,
        product_id: BACKEND_PRODUCT_ID,
        signer_id: BACKEND_SIGNER_ID.to_vec(),
        unique_id: vec![0x11; 32],
        debug: false,
        report_data: Vec::new(),
        platform: platform(),
    }
}

/// A report matching the fixture's `frontend` package.
pub fn frontend_report() -> Report {
    Report {
        security_version: 1,
        product_id: 9,
        signer_id: vec![0x22; 32],
        unique_id: FRONTEND_UNIQUE_ID.to_vec(),
        debug: false,
        report_data: Vec::new(),
        platform: platform(),
    }
}

/// A marble's side of an activation: a channel certificate, a quote signed
/// by the fixture's platform key binding it, and the request signed with
/// the channel key.
pub fn activation_request(
    fixture: &ManifestFixture,
    marble_type: &str,
    uuid: Uuid,
    report: Report,
) -> ActivationRequest {
    marble(fixture, marble_type, uuid, report).0
}

/// Like [`activation_request`], also returning the channel identity so the
/// request can be altered and signed again.
pub fn marble(
    fixture: &ManifestFixture,
    marble_type: &str,
    uuid: Uuid,
    report: Report,
) -> (ActivationRequest, UserCertificate) {
    let channel = UserCertificate::new(&uuid.to_string());
    let key = fixture.attestation.private_key_pem();
    let issuer = SignedReportIssuer::from_pem(&key, report).unwrap();
    let quote = issuer.issue(&channel.cert_der).unwrap();
    let mut request = ActivationRequest {
        marble_type: marble_type.to_string(),
        uuid,
        quote: base64::engine::general_purpose::STANDARD.encode(quote),
        channel_certificate: channel.cert_pem.clone(),
        dns_names: Vec::new(),
        signature: String::new(),
    };
    sign_activation(&mut request, &channel);
    (request, channel)
}

pub fn sign_activation(request: &mut ActivationRequest, key: &UserCertificate) {
    let signature = key.sign(&request.signed_payload());
    request.signature =
        base64::engine::general_purpose::STANDARD.encode(signature);
}

/// `user`'s signature over a request to `path`, made now.
pub fn credential(user: &UserCertificate, path: &str) -> ClientCredential {
    let timestamp = Utc::now().timestamp();
    let payload = client_signed_payload("POST", path, timestamp, b"");
    ClientCredential {
        chain: vec![user.cert_der.clone()],
        timestamp,
        signature: user.sign(&payload),
        payload,
    }
}

/// Resolve `user` to a caller, the way a signed management request would.
pub async fn caller(
    coordinator: &Coordinator,
    user: &UserCertificate,
) -> Caller {
    let path = format!("/{}", Uuid::new_v4());
    coordinator.verify_user(&credential(user, &path)).await.unwrap()
}

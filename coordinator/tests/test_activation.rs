// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Marble activation against a coordinator checking signed reports.

mod common;

use assert_matches::assert_matches;
use common::{
    activation_request, backend_report, caller, frontend_report, marble,
    sign_activation, start, start_with_manifest, PLATFORM_KEY,
};
use futures::future::join_all;
use mesh_coordinator::seal::MemoryStore;
use mesh_coordinator::Error;
use mesh_coordinator_api::CoordinatorStatus;
use mesh_test_utils::certificates::UserCertificate;
use mesh_test_utils::dev::test_setup_log;
use mesh_test_utils::manifest::ManifestBuilder;
use openssl::nid::Nid;
use openssl::x509::X509;
use std::sync::Arc;
use uuid::Uuid;

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

#[tokio::test]
async fn test_activation_issues_identity_and_parameters() {
    let logctx =
        test_setup_log("test_activation_issues_identity_and_parameters");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator = start(&logctx.log, &store, PLATFORM_KEY).await;
    assert_eq!(
        coordinator.status().await,
        CoordinatorStatus::WaitingForManifest
    );

    let uuid = Uuid::new_v4();
    let request =
        activation_request(&fixture, "backend", uuid, backend_report());
    assert_matches!(
        coordinator.activate(&request).await,
        Err(Error::NotReady(CoordinatorStatus::WaitingForManifest))
    );

    coordinator.set_manifest(&fixture.raw).await.unwrap();
    assert_eq!(
        coordinator.status().await,
        CoordinatorStatus::AcceptingMarbles
    );
    let response = coordinator.activate(&request).await.unwrap();

    // The chain is the marble's leaf followed by the coordinator root.
    let (root_pem, _) = coordinator.cert_quote().await.unwrap();
    assert_eq!(response.certificate_chain.len(), 2);
    assert_eq!(response.certificate_chain[1], root_pem);
    let leaf = X509::from_pem(response.certificate_chain[0].as_bytes())
        .unwrap();
    let root = X509::from_pem(root_pem.as_bytes()).unwrap();
    assert!(leaf.verify(&root.public_key().unwrap()).unwrap());
    assert_eq!(subject_entry(&leaf, Nid::COMMONNAME), uuid.to_string());
    assert_eq!(
        subject_entry(&leaf, Nid::ORGANIZATIONALUNITNAME),
        "backend"
    );

    let parameters = &response.parameters;
    assert_eq!(parameters.files["/etc/mesh/ca.pem"], root_pem);
    assert_eq!(parameters.env["MARBLE_TYPE"], "backend");
    assert_eq!(parameters.env["SEAL_KEY"].len(), 64);
    assert_eq!(
        parameters.argv,
        vec!["backend".to_string(), "--id".to_string(), uuid.to_string()]
    );

    // The generated secret the marble got is the one admins can read.
    let admin = caller(&coordinator, fixture.admin("admin")).await;
    let secrets = coordinator
        .get_secrets(&admin, &["db_key".to_string()])
        .await
        .unwrap();
    assert_eq!(parameters.env["DB_KEY"], secrets["db_key"].value);

    let activations = coordinator.activations().await;
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].uuid, uuid);
    assert_eq!(activations[0].marble_type, "backend");

    // Re-activation of the same instance is refused.
    assert_matches!(
        coordinator.activate(&request).await,
        Err(Error::AlreadyActivated { uuid: u, .. }) if u == uuid
    );
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_multi_instance_activation() {
    let logctx = test_setup_log("test_multi_instance_activation");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;

    let mut leaves = Vec::new();
    for _ in 0..3 {
        let uuid = Uuid::new_v4();
        let request =
            activation_request(&fixture, "frontend", uuid, frontend_report());
        let response = coordinator.activate(&request).await.unwrap();
        let parameters = &response.parameters;
        assert_eq!(parameters.env["MARBLE_UUID"], uuid.to_string());
        assert_eq!(
            parameters.files["/tls/cert.pem"],
            response.certificate_chain[0]
        );
        assert!(parameters.env["TLS_KEY"].contains("PRIVATE KEY"));
        leaves.push(response.certificate_chain[0].clone());
    }
    leaves.sort();
    leaves.dedup();
    assert_eq!(leaves.len(), 3);
    assert_eq!(coordinator.activations().await.len(), 3);
    logctx.cleanup_successful();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activation_admits_one_instance() {
    let logctx =
        test_setup_log("test_concurrent_activation_admits_one_instance");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        Arc::new(start_with_manifest(&logctx.log, &store, &fixture).await);

    // Eight different instances race for the single-instance type.
    let tasks = (0..8).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        let request = activation_request(
            &fixture,
            "backend",
            Uuid::new_v4(),
            backend_report(),
        );
        tokio::spawn(async move { coordinator.activate(&request).await })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(Error::AlreadyActivated { .. }));
    }
    assert_eq!(coordinator.activations().await.len(), 1);

    // The same instance racing itself is admitted once as well.
    let uuid = Uuid::new_v4();
    let tasks = (0..4).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        let request =
            activation_request(&fixture, "frontend", uuid, frontend_report());
        tokio::spawn(async move { coordinator.activate(&request).await })
    });
    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(_))))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(coordinator.activations().await.len(), 2);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_activation_limit() {
    let logctx = test_setup_log("test_activation_limit");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().frontend_max_activations(2).build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;

    for _ in 0..2 {
        let request = activation_request(
            &fixture,
            "frontend",
            Uuid::new_v4(),
            frontend_report(),
        );
        coordinator.activate(&request).await.unwrap();
    }
    let request = activation_request(
        &fixture,
        "frontend",
        Uuid::new_v4(),
        frontend_report(),
    );
    assert_matches!(
        coordinator.activate(&request).await,
        Err(Error::ActivationLimitReached(t)) if t == "frontend"
    );
    assert_eq!(coordinator.activations().await.len(), 2);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_failed_attestation_leaves_no_trace() {
    let logctx = test_setup_log("test_failed_attestation_leaves_no_trace");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;
    let sealed_before = store.blob();

    let mut rejected = Vec::new();

    // Signed by the right platform, but for the wrong code.
    let mut report = backend_report();
    report.signer_id = vec![0xcc; 32];
    rejected.push(activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        report,
    ));

    // Older than the manifest allows.
    let mut report = backend_report();
    report.security_version -= 1;
    rejected.push(activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        report,
    ));

    // Debug enclaves are not admitted where the package says otherwise.
    let mut report = backend_report();
    report.debug = true;
    rejected.push(activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        report,
    ));

    // A platform below the infrastructure's minimum.
    let mut report = backend_report();
    report.platform.qe_svn = 0;
    rejected.push(activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        report,
    ));

    // A valid report for a different package.
    rejected.push(activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        frontend_report(),
    ));

    // Signed by a platform the manifest does not trust.
    let stranger = ManifestBuilder::new().build();
    rejected.push(activation_request(
        &stranger,
        "backend",
        Uuid::new_v4(),
        backend_report(),
    ));

    // A genuine quote replayed over another channel.
    let genuine = activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        backend_report(),
    );
    let (mut replayed, channel) =
        marble(&fixture, "backend", Uuid::new_v4(), backend_report());
    replayed.quote = genuine.quote.clone();
    sign_activation(&mut replayed, &channel);
    rejected.push(replayed);

    // Garbage.
    let (mut garbage, channel) =
        marble(&fixture, "backend", Uuid::new_v4(), backend_report());
    garbage.quote = "AAAA".to_string();
    sign_activation(&mut garbage, &channel);
    rejected.push(garbage);

    for request in &rejected {
        assert_matches!(
            coordinator.activate(request).await,
            Err(Error::AttestationFailed)
        );
    }

    let mut unknown = genuine.clone();
    unknown.marble_type = "database".to_string();
    assert_matches!(
        coordinator.activate(&unknown).await,
        Err(Error::UnknownMarbleType(t)) if t == "database"
    );
    let mut malformed = genuine.clone();
    malformed.quote = "not base64!".to_string();
    assert_matches!(
        coordinator.activate(&malformed).await,
        Err(Error::InvalidRequest(_))
    );
    let mut bad_name = genuine.clone();
    bad_name.dns_names = vec!["no spaces allowed".to_string()];
    assert_matches!(
        coordinator.activate(&bad_name).await,
        Err(Error::InvalidRequest(_))
    );

    assert!(coordinator.activations().await.is_empty());
    assert_eq!(store.blob(), sealed_before);

    // None of that used up the single-instance slot.
    coordinator.activate(&genuine).await.unwrap();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_captured_request_cannot_mint_identities() {
    let logctx =
        test_setup_log("test_captured_request_cannot_mint_identities");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;
    let (captured, _) =
        marble(&fixture, "frontend", Uuid::new_v4(), frontend_report());
    coordinator.activate(&captured).await.unwrap();
    let sealed = store.blob();

    // The multi-instance type would admit any fresh uuid, but the quote and
    // channel certificate alone do not make a new request.
    for _ in 0..3 {
        let mut replayed = captured.clone();
        replayed.uuid = Uuid::new_v4();
        assert_matches!(
            coordinator.activate(&replayed).await,
            Err(Error::AttestationFailed)
        );
    }

    // Nor does signing with some other key, over either certificate.
    let attacker = UserCertificate::new("attacker");
    let mut forged = captured.clone();
    forged.uuid = Uuid::new_v4();
    sign_activation(&mut forged, &attacker);
    assert_matches!(
        coordinator.activate(&forged).await,
        Err(Error::AttestationFailed)
    );
    forged.channel_certificate = attacker.cert_pem.clone();
    sign_activation(&mut forged, &attacker);
    assert_matches!(
        coordinator.activate(&forged).await,
        Err(Error::AttestationFailed)
    );

    let mut unsigned = captured.clone();
    unsigned.uuid = Uuid::new_v4();
    unsigned.signature = "not base64!".to_string();
    assert_matches!(
        coordinator.activate(&unsigned).await,
        Err(Error::InvalidRequest(_))
    );

    // Played back verbatim, it names an instance that already exists.
    assert_matches!(
        coordinator.activate(&captured).await,
        Err(Error::AlreadyActivated { uuid, .. }) if uuid == captured.uuid
    );
    assert_eq!(coordinator.activations().await.len(), 1);
    assert_eq!(store.blob(), sealed);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_failed_persist_rolls_back_activation() {
    let logctx = test_setup_log("test_failed_persist_rolls_back_activation");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;
    let request = activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        backend_report(),
    );

    store.set_fail_writes(true);
    assert_matches!(
        coordinator.activate(&request).await,
        Err(Error::Persistence(_))
    );
    assert!(coordinator.activations().await.is_empty());

    store.set_fail_writes(false);
    coordinator.activate(&request).await.unwrap();
    assert_eq!(coordinator.activations().await.len(), 1);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_activations_survive_restart() {
    let logctx = test_setup_log("test_activations_survive_restart");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;
    let request = activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        backend_report(),
    );
    coordinator.activate(&request).await.unwrap();
    drop(coordinator);

    let coordinator = start(&logctx.log, &store, PLATFORM_KEY).await;
    assert_eq!(coordinator.activations().await.len(), 1);
    let other = activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        backend_report(),
    );
    assert_matches!(
        coordinator.activate(&other).await,
        Err(Error::AlreadyActivated { .. })
    );
    logctx.cleanup_successful();
}

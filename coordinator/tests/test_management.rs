// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manifest installation and updates, user secrets, and who may do what.

mod common;

use assert_matches::assert_matches;
use common::{
    activation_request, backend_report, caller, credential, start,
    start_with_manifest, PLATFORM_KEY,
};
use mesh_coordinator::seal::MemoryStore;
use mesh_coordinator::user::{Caller, ClientCredential, MAX_SIGNATURE_SKEW};
use mesh_coordinator::Error;
use mesh_coordinator_api::{CoordinatorStatus, SecretType};
use mesh_test_utils::certificates::UserCertificate;
use mesh_test_utils::dev::test_setup_log;
use mesh_test_utils::manifest::ManifestBuilder;
use openssl::x509::X509;
use std::sync::Arc;
use uuid::Uuid;

const RAISE_BACKEND: &[u8] =
    br#"{"Packages":{"backend":{"SecurityVersion":3}}}"#;

#[tokio::test]
async fn test_manifest_is_set_once() {
    let logctx = test_setup_log("test_manifest_is_set_once");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator = start(&logctx.log, &store, PLATFORM_KEY).await;

    assert_matches!(
        coordinator.set_manifest(b"{ not json").await,
        Err(Error::InvalidManifest(_))
    );
    store.set_fail_writes(true);
    assert_matches!(
        coordinator.set_manifest(&fixture.raw).await,
        Err(Error::Persistence(_))
    );
    store.set_fail_writes(false);
    assert_eq!(
        coordinator.status().await,
        CoordinatorStatus::WaitingForManifest
    );
    assert_eq!(coordinator.manifest_signature().await, None);

    let shares = coordinator.set_manifest(&fixture.raw).await.unwrap();
    assert_eq!(shares.len(), 1);
    let digest = coordinator.manifest_signature().await.unwrap();
    assert_eq!(digest.len(), 64);

    // Neither the same manifest nor a different one is accepted again.
    assert_matches!(
        coordinator.set_manifest(&fixture.raw).await,
        Err(Error::AlreadySet)
    );
    let other = ManifestBuilder::new().build();
    assert_matches!(
        coordinator.set_manifest(&other.raw).await,
        Err(Error::AlreadySet)
    );
    assert_matches!(
        coordinator.set_manifest(b"garbage").await,
        Err(Error::AlreadySet)
    );
    assert_eq!(coordinator.manifest_signature().await, Some(digest));
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_users_are_identified_by_certificate() {
    let logctx = test_setup_log("test_users_are_identified_by_certificate");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;

    assert_eq!(
        caller(&coordinator, fixture.admin("admin")).await,
        Caller::Admin("admin".to_string())
    );
    assert_eq!(
        caller(&coordinator, fixture.client("client")).await,
        Caller::Client("client".to_string())
    );
    // Same name, different certificate.
    let impostor = UserCertificate::new("admin");
    assert_eq!(caller(&coordinator, &impostor).await, Caller::Unauthenticated);
    assert_eq!(
        coordinator
            .verify_user(&ClientCredential::default())
            .await
            .unwrap(),
        Caller::Unauthenticated
    );
    let garbage = ClientCredential {
        chain: vec![b"not a certificate".to_vec()],
        ..credential(&impostor, "/secrets")
    };
    assert_matches!(
        coordinator.verify_user(&garbage).await,
        Err(Error::InvalidRequest(_))
    );
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_public_certificate_is_not_a_credential() {
    let logctx = test_setup_log("test_public_certificate_is_not_a_credential");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;

    // Everything an outsider can learn from the manifest itself.
    let manifest: serde_json::Value =
        serde_json::from_slice(&fixture.raw).unwrap();
    let admin_pem = manifest["Admins"]["admin"].as_str().unwrap();
    let admin_der = X509::from_pem(admin_pem.as_bytes())
        .unwrap()
        .to_der()
        .unwrap();
    assert_eq!(admin_der, fixture.admin("admin").cert_der);

    let attacker = UserCertificate::new("attacker");
    let genuine = credential(fixture.admin("admin"), "/secrets");
    let unsigned = ClientCredential {
        chain: vec![admin_der.clone()],
        signature: Vec::new(),
        ..genuine.clone()
    };
    let forged = ClientCredential {
        chain: vec![admin_der],
        signature: attacker.sign(&genuine.payload),
        ..genuine.clone()
    };
    for attempt in [&unsigned, &forged] {
        let who = coordinator.verify_user(attempt).await.unwrap();
        assert_eq!(who, Caller::Unauthenticated);
        assert_matches!(
            coordinator
                .write_secrets(&who, br#"{"api_token":"attacker"}"#)
                .await,
            Err(Error::Unauthorized)
        );
    }

    // The genuine credential works once; played back, it no longer does.
    assert_eq!(
        coordinator.verify_user(&genuine).await.unwrap(),
        Caller::Admin("admin".to_string())
    );
    assert_eq!(
        coordinator.verify_user(&genuine).await.unwrap(),
        Caller::Unauthenticated
    );

    // Neither does a signature made too long ago.
    let mut stale = credential(fixture.admin("admin"), "/update");
    stale.timestamp -= MAX_SIGNATURE_SKEW + 60;
    stale.payload = mesh_coordinator_api::client_signed_payload(
        "POST",
        "/update",
        stale.timestamp,
        b"",
    );
    stale.signature = fixture.admin("admin").sign(&stale.payload);
    assert_eq!(
        coordinator.verify_user(&stale).await.unwrap(),
        Caller::Unauthenticated
    );
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_update_requires_quorum_of_admins() {
    let logctx = test_setup_log("test_update_requires_quorum_of_admins");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new()
        .admins(&["alice", "bob"])
        .update_quorum(2)
        .build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;
    let digest = coordinator.manifest_signature().await;
    let alice = caller(&coordinator, fixture.admin("alice")).await;
    let bob = caller(&coordinator, fixture.admin("bob")).await;
    let client = caller(&coordinator, fixture.client("client")).await;

    for who in [&client, &Caller::Unauthenticated] {
        assert_matches!(
            coordinator.update_manifest(who, RAISE_BACKEND).await,
            Err(Error::Unauthorized)
        );
    }
    let rejected: [&[u8]; 4] = [
        br#"{"Packages":{"backend":{"SecurityVersion":1}}}"#,
        br#"{"Packages":{"database":{"SecurityVersion":5}}}"#,
        br#"{"Packages":{}}"#,
        br#"{"Marbles":{}}"#,
    ];
    for bad in rejected {
        assert_matches!(
            coordinator.update_manifest(&alice, bad).await,
            Err(Error::InvalidUpdate(_))
        );
    }

    assert_matches!(
        coordinator.update_manifest(&alice, RAISE_BACKEND).await,
        Err(Error::QuorumNotMet { remaining: 1 })
    );
    // Approving twice does not count twice.
    assert_matches!(
        coordinator.update_manifest(&alice, RAISE_BACKEND).await,
        Err(Error::QuorumNotMet { remaining: 1 })
    );
    assert!(coordinator.update_log().await.is_empty());

    // The same fragment, formatted differently.
    let reformatted = br#"{
        "Packages": { "backend": { "SecurityVersion": 3 } }
    }"#;
    coordinator.update_manifest(&bob, reformatted).await.unwrap();

    let manifest = coordinator.manifest().await.unwrap();
    assert_eq!(manifest.packages["backend"].security_version, Some(3));
    let log = coordinator.update_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].approvers, vec!["alice", "bob"]);
    assert_eq!(log[0].generation, 1);
    // The signature names the manifest as originally installed.
    assert_eq!(coordinator.manifest_signature().await, digest);

    // Marbles built before the update are no longer admitted.
    let stale = activation_request(
        &fixture,
        "backend",
        Uuid::new_v4(),
        backend_report(),
    );
    assert_matches!(
        coordinator.activate(&stale).await,
        Err(Error::AttestationFailed)
    );
    let mut report = backend_report();
    report.security_version = 3;
    let current =
        activation_request(&fixture, "backend", Uuid::new_v4(), report);
    coordinator.activate(&current).await.unwrap();
    drop(coordinator);

    let coordinator = start(&logctx.log, &store, PLATFORM_KEY).await;
    let manifest = coordinator.manifest().await.unwrap();
    assert_eq!(manifest.packages["backend"].security_version, Some(3));
    assert_eq!(coordinator.update_log().await.len(), 1);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_secret_access_follows_manifest() {
    let logctx = test_setup_log("test_secret_access_follows_manifest");
    let store = Arc::new(MemoryStore::new());
    let fixture = ManifestBuilder::new().build();
    let coordinator =
        start_with_manifest(&logctx.log, &store, &fixture).await;
    let admin = caller(&coordinator, fixture.admin("admin")).await;
    let client = caller(&coordinator, fixture.client("client")).await;
    let names = |n: &[&str]| -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    };

    // Only declared writers set user-defined secrets.
    let body = br#"{"api_token":"hunter2"}"#;
    for who in [&client, &Caller::Unauthenticated] {
        assert_matches!(
            coordinator.write_secrets(who, body).await,
            Err(Error::Unauthorized)
        );
    }
    assert_matches!(
        coordinator
            .write_secrets(&admin, br#"{"db_key":"00112233"}"#)
            .await,
        Err(Error::Unauthorized)
    );
    assert_matches!(
        coordinator.write_secrets(&admin, br#"{"nope":"x"}"#).await,
        Err(Error::InvalidSecrets(_))
    );
    coordinator.write_secrets(&admin, body).await.unwrap();

    let secrets = coordinator
        .get_secrets(&client, &names(&["api_token", "db_key"]))
        .await
        .unwrap();
    assert_eq!(secrets["api_token"].value, "hunter2");
    assert_eq!(secrets["api_token"].secret_type, SecretType::Plain);
    assert_eq!(secrets["db_key"].secret_type, SecretType::SymmetricKey);
    assert_eq!(secrets["db_key"].value.len(), 64);

    // One unreadable name fails the whole request.
    assert_matches!(
        coordinator
            .get_secrets(&admin, &names(&["db_key", "api_token"]))
            .await,
        Err(Error::Unauthorized)
    );
    assert_matches!(
        coordinator
            .get_secrets(&Caller::Unauthenticated, &names(&["db_key"]))
            .await,
        Err(Error::Unauthorized)
    );

    // A failed write leaves the old value in place.
    store.set_fail_writes(true);
    assert_matches!(
        coordinator
            .write_secrets(&admin, br#"{"api_token":"changed"}"#)
            .await,
        Err(Error::Persistence(_))
    );
    store.set_fail_writes(false);
    let secrets = coordinator
        .get_secrets(&client, &names(&["api_token"]))
        .await
        .unwrap();
    assert_eq!(secrets["api_token"].value, "hunter2");
    drop(coordinator);

    let coordinator = start(&logctx.log, &store, PLATFORM_KEY).await;
    let secrets = coordinator
        .get_secrets(&client, &names(&["api_token"]))
        .await
        .unwrap();
    assert_eq!(secrets["api_token"].value, "hunter2");
    logctx.cleanup_successful();
}

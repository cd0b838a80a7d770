// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The coordinator state machine.
//!
//! All state lives in one [`Phase`] behind a `tokio::sync::RwLock`. Mutating
//! operations build the next state on the side, seal and write it, and only
//! then install it, so a failed write leaves memory as it was.

use crate::config::CoordinatorConfig;
use crate::error::Error;
use crate::manifest::{
    FragmentDigest, Manifest, ManifestDigest, ManifestUpdate, Marble,
};
use crate::quote::{QuoteIssuer, QuoteValidator};
use crate::recovery::{self, RecoverySession, Submission};
use crate::seal::{
    self, BlobStore, DataKey, RecoveryHeader, SealError, SealedState,
};
use crate::secrets::{self, Secret};
use crate::template::{self, TemplateContext};
use crate::user::{Caller, ClientCredential, ReplayGuard, UserDirectory};
use base64::Engine;
use chrono::{DateTime, Utc};
use display_error_chain::DisplayErrorChain;
use mesh_certificates::{
    CaError, CertificateAuthority, CertificateError, CertificateValidator,
    LeafRequest,
};
use mesh_coordinator_api::{
    ActivationRequest, ActivationResponse, CoordinatorStatus, SecretValue,
};
use mesh_key_manager::{KeyManager, SecretRetriever, WrappingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;
use zeroize::Zeroizing;

const ROOT_CERT_LIFETIME: Duration = Duration::from_secs(10 * 365 * 86400);
const SERVER_CERT_LIFETIME: Duration = Duration::from_secs(365 * 86400);
const RECOVERY_CERT_LIFETIME: Duration = Duration::from_secs(30 * 86400);

/// Tunables of the core, usually taken from [`CoordinatorConfig`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub organization: String,
    pub dns_names: Vec<String>,
    pub attestation_timeout: Duration,
    pub persist_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            organization: "Mesh Coordinator".to_string(),
            dns_names: vec!["localhost".to_string()],
            attestation_timeout: Duration::from_secs(5),
            persist_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&CoordinatorConfig> for CoordinatorSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        CoordinatorSettings {
            organization: config.organization.clone(),
            dns_names: config.dns_names.clone(),
            attestation_timeout: config.attestation_timeout(),
            persist_timeout: config.persist_timeout(),
        }
    }
}

/// The pluggable pieces the core talks to.
pub struct Backends {
    pub store: Arc<dyn BlobStore>,
    pub secret_retriever: Arc<dyn SecretRetriever>,
    pub validator: Arc<dyn QuoteValidator>,
    pub issuer: Arc<dyn QuoteIssuer>,
}

/// The certificate and key both HTTPS endpoints serve.
#[derive(Clone)]
pub struct ServerIdentity {
    /// Leaf first, PEM
    pub cert_chain_pem: String,
    pub key_pem: SecretString,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("cert_chain_pem", &self.cert_chain_pem)
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    pub fn tls_config(&self) -> dropshot::ConfigTls {
        dropshot::ConfigTls::AsBytes {
            certs: self.cert_chain_pem.as_bytes().to_vec(),
            key: self.key_pem.expose_secret().as_bytes().to_vec(),
        }
    }
}

/// The manifest as installed, plus the amendments applied since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledManifest {
    /// Bytes exactly as submitted to SetManifest
    pub raw: Vec<u8>,
    pub digest: ManifestDigest,
    /// The manifest with every applied update folded in
    pub current: Manifest,
    /// Number of updates applied
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub marble_type: String,
    pub uuid: Uuid,
    /// Hex serial of the leaf issued on activation
    pub serial: String,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub fragment: FragmentDigest,
    pub approvers: Vec<String>,
    pub applied_at: DateTime<Utc>,
    /// Manifest generation this update produced
    pub generation: u64,
}

/// Everything that survives a restart. This is what gets sealed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub root_cert_pem: String,
    pub root_key_pem: String,
    /// Root of every per-marble-type sealing key
    pub marble_seal_root: [u8; 32],
    pub manifest: Option<InstalledManifest>,
    pub activations: Vec<ActivationRecord>,
    pub secrets: BTreeMap<String, Secret>,
    pub update_log: Vec<UpdateLogEntry>,
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState")
            .field("manifest", &self.manifest.as_ref().map(|m| m.digest))
            .field("activations", &self.activations.len())
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("update_log", &self.update_log.len())
            .finish_non_exhaustive()
    }
}

impl PersistedState {
    fn new(ca: &CertificateAuthority) -> PersistedState {
        let mut marble_seal_root = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut marble_seal_root)
            .expect("fetched random bytes");
        PersistedState {
            root_cert_pem: ca.root_pem().to_string(),
            root_key_pem: ca.key_pem().expose_secret().to_string(),
            marble_seal_root,
            manifest: None,
            activations: Vec::new(),
            secrets: BTreeMap::new(),
            update_log: Vec::new(),
        }
    }

    fn installed(&self) -> Result<&InstalledManifest, Error> {
        self.manifest
            .as_ref()
            .ok_or(Error::NotReady(CoordinatorStatus::WaitingForManifest))
    }
}

/// Unsealed state, ready to serve.
struct Active {
    state: PersistedState,
    data_key: DataKey,
    header: RecoveryHeader,
    ca: Arc<CertificateAuthority>,
    users: UserDirectory,
    /// Approvals of manifest updates that have not reached the quorum yet.
    /// Never persisted.
    pending_updates: BTreeMap<FragmentDigest, BTreeSet<String>>,
}

impl Active {
    fn restore(
        state: PersistedState,
        data_key: DataKey,
        header: RecoveryHeader,
    ) -> Result<Active, Error> {
        let ca = CertificateAuthority::from_pem(
            &state.root_cert_pem,
            &state.root_key_pem,
        )?;
        let users = match &state.manifest {
            Some(installed) => {
                UserDirectory::from_manifest(&installed.current)?
            }
            None => UserDirectory::default(),
        };
        Ok(Active {
            state,
            data_key,
            header,
            ca: Arc::new(ca),
            users,
            pending_updates: BTreeMap::new(),
        })
    }
}

/// The sealed blob could not be unwrapped; waiting for recovery shares.
struct RecoveryMode {
    sealed: SealedState,
    session: RecoverySession,
    /// The throwaway identity served meanwhile
    cert_pem: String,
    cert_der: Vec<u8>,
}

enum Phase {
    Active(Box<Active>),
    Recovery(Box<RecoveryMode>),
}

impl Phase {
    fn status(&self) -> CoordinatorStatus {
        match self {
            Phase::Recovery(_) => CoordinatorStatus::RecoveryMode,
            Phase::Active(active) if active.state.manifest.is_some() => {
                CoordinatorStatus::AcceptingMarbles
            }
            Phase::Active(_) => CoordinatorStatus::WaitingForManifest,
        }
    }

    fn active(&self) -> Result<&Active, Error> {
        match self {
            Phase::Active(active) => Ok(&**active),
            Phase::Recovery(_) => {
                Err(Error::NotReady(CoordinatorStatus::RecoveryMode))
            }
        }
    }

    fn active_mut(&mut self) -> Result<&mut Active, Error> {
        match self {
            Phase::Active(active) => Ok(&mut **active),
            Phase::Recovery(_) => {
                Err(Error::NotReady(CoordinatorStatus::RecoveryMode))
            }
        }
    }
}

/// Seals state and writes it out, within a deadline.
struct Sealer {
    log: Logger,
    store: Arc<dyn BlobStore>,
    key_manager: Mutex<KeyManager<Arc<dyn SecretRetriever>>>,
    timeout: Duration,
}

impl Sealer {
    async fn wrapping_key(
        &self,
    ) -> Result<SecretBox<WrappingKey>, mesh_key_manager::Error> {
        self.key_manager.lock().await.wrapping_key().await
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, Error> {
        tokio::time::timeout(self.timeout, self.store.read())
            .await
            .map_err(|_| Error::Timeout("sealed state read"))?
            .map_err(Error::from)
    }

    async fn write(
        &self,
        state: &PersistedState,
        header: &RecoveryHeader,
        data_key: &DataKey,
    ) -> Result<(), Error> {
        let wrapping = self.wrapping_key().await.map_err(|err| {
            error!(
                self.log,
                "platform sealing key is unavailable";
                "error" => %DisplayErrorChain::new(&err),
            );
            Error::SealingKey(err)
        })?;
        let blob = seal::seal(state, header, data_key, &wrapping)?;
        let len = blob.len();
        match tokio::time::timeout(self.timeout, self.store.write(blob)).await
        {
            Ok(Ok(())) => {
                debug!(self.log, "wrote sealed state"; "bytes" => len);
                Ok(())
            }
            Ok(Err(err)) => {
                error!(
                    self.log,
                    "failed to write sealed state";
                    "error" => %DisplayErrorChain::new(&err),
                );
                Err(err.into())
            }
            Err(_) => {
                error!(
                    self.log,
                    "timed out writing sealed state";
                    "timeout" => ?self.timeout,
                );
                Err(Error::Timeout("sealed state write"))
            }
        }
    }
}

pub struct Coordinator {
    log: Logger,
    settings: CoordinatorSettings,
    sealer: Sealer,
    validator: Arc<dyn QuoteValidator>,
    issuer: Arc<dyn QuoteIssuer>,
    phase: RwLock<Phase>,
    identity: watch::Sender<ServerIdentity>,
    replay: std::sync::Mutex<ReplayGuard>,
}

impl Coordinator {
    /// Load (or create) the sealed state and come up in whichever phase it
    /// implies.
    ///
    /// Returns an error only for conditions recovery cannot fix: a blob in
    /// an unknown format, a blob that is damaged although its key unwraps,
    /// or a store that cannot be read or written.
    pub async fn start(
        log: &Logger,
        settings: CoordinatorSettings,
        backends: Backends,
    ) -> Result<Coordinator, Error> {
        let log = log.new(o!("component" => "Coordinator"));
        let sealer = Sealer {
            log: log.clone(),
            store: backends.store,
            key_manager: Mutex::new(KeyManager::new(
                backends.secret_retriever,
            )),
            timeout: settings.persist_timeout,
        };
        let (phase, identity) = boot(&log, &settings, &sealer).await?;
        info!(log, "coordinator started"; "status" => ?phase.status());
        let (identity, _) = watch::channel(identity);
        Ok(Coordinator {
            log,
            settings,
            sealer,
            validator: backends.validator,
            issuer: backends.issuer,
            phase: RwLock::new(phase),
            identity,
            replay: std::sync::Mutex::new(ReplayGuard::default()),
        })
    }

    /// The TLS identity the endpoints should serve right now.
    pub fn server_identity(&self) -> ServerIdentity {
        self.identity.borrow().clone()
    }

    /// Notified whenever the TLS identity changes (on leaving recovery mode).
    pub fn subscribe_identity(&self) -> watch::Receiver<ServerIdentity> {
        self.identity.subscribe()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        self.phase.read().await.status()
    }

    /// Hex digest of the installed manifest.
    pub async fn manifest_signature(&self) -> Option<String> {
        let phase = self.phase.read().await;
        let active = phase.active().ok()?;
        active.state.manifest.as_ref().map(|m| m.digest.to_string())
    }

    /// The manifest currently in force, updates included.
    pub async fn manifest(&self) -> Option<Manifest> {
        let phase = self.phase.read().await;
        let active = phase.active().ok()?;
        active.state.manifest.as_ref().map(|m| m.current.clone())
    }

    pub async fn activations(&self) -> Vec<ActivationRecord> {
        match self.phase.read().await.active() {
            Ok(active) => active.state.activations.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn update_log(&self) -> Vec<UpdateLogEntry> {
        match self.phase.read().await.active() {
            Ok(active) => active.state.update_log.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// The root certificate (PEM) and a base64 quote binding its DER.
    ///
    /// In recovery mode the root is sealed away; the throwaway certificate
    /// currently served is returned instead.
    pub async fn cert_quote(&self) -> Result<(String, String), Error> {
        let (cert_pem, cert_der) = match &*self.phase.read().await {
            Phase::Active(active) => (
                active.ca.root_pem().to_string(),
                active.ca.root_der().to_vec(),
            ),
            Phase::Recovery(recovery) => {
                (recovery.cert_pem.clone(), recovery.cert_der.clone())
            }
        };
        let quote = self.issuer.issue(&cert_der).map_err(Error::Quote)?;
        let quote = base64::engine::general_purpose::STANDARD.encode(quote);
        Ok((cert_pem, quote))
    }

    /// Install the manifest, and return the encrypted recovery shares
    /// (recovery key name to base64 ciphertext).
    pub async fn set_manifest(
        &self,
        raw: &[u8],
    ) -> Result<BTreeMap<String, String>, Error> {
        let mut phase = self.phase.write().await;
        let active = phase.active_mut()?;
        if active.state.manifest.is_some() {
            return Err(Error::AlreadySet);
        }
        let manifest = Manifest::parse(raw)?;
        let users = UserDirectory::from_manifest(&manifest)?;

        // Shares are only ever handed out for a key that has never been
        // written under another header.
        let data_key = if manifest.recovery_keys.is_empty() {
            active.data_key.clone()
        } else {
            DataKey::generate()
        };
        let split = recovery::split(
            &data_key,
            &manifest.recovery_keys,
            manifest.recovery_threshold(),
        )?;

        let digest = ManifestDigest::of(raw);
        let mut state = active.state.clone();
        state.secrets = secrets::generate(&manifest);
        state.manifest = Some(InstalledManifest {
            raw: raw.to_vec(),
            digest,
            current: manifest,
            generation: 0,
        });
        self.sealer.write(&state, &split.header, &data_key).await?;

        active.state = state;
        active.data_key = data_key;
        active.header = split.header;
        active.users = users;
        info!(
            self.log,
            "manifest installed";
            "digest" => %digest,
            "recovery_keys" => split.encrypted_shares.len(),
            "status" => ?CoordinatorStatus::AcceptingMarbles,
        );
        Ok(split.encrypted_shares)
    }

    /// Attest a marble, and issue its identity and parameters.
    pub async fn activate(
        &self,
        request: &ActivationRequest,
    ) -> Result<ActivationResponse, Error> {
        let log = self.log.new(o!(
            "marble_type" => request.marble_type.clone(),
            "uuid" => request.uuid.to_string(),
        ));

        // Attestation runs without holding the lock; the generation tells us
        // afterwards whether the manifest moved underneath it.
        let (package, infrastructures, generation, ca, lifetime) = {
            let phase = self.phase.read().await;
            let active = phase.active()?;
            let installed = active.state.installed()?;
            let manifest = &installed.current;
            let marble = marble_definition(manifest, &request.marble_type)?;
            let package = manifest
                .packages
                .get(&marble.package)
                .cloned()
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "validated manifest lacks package {:?}",
                        marble.package
                    ))
                })?;
            (
                package,
                manifest.candidate_infrastructures(marble),
                installed.generation,
                Arc::clone(&active.ca),
                manifest.certificate_lifetime(),
            )
        };

        let quote = base64::engine::general_purpose::STANDARD
            .decode(&request.quote)
            .map_err(|_| {
                Error::InvalidRequest("quote is not valid base64".to_string())
            })?;
        let channel_der =
            channel_certificate_der(&request.channel_certificate)?;
        validate_dns_names(&request.dns_names)?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(&request.signature)
            .map_err(|_| {
                Error::InvalidRequest(
                    "signature is not valid base64".to_string(),
                )
            })?;

        // The quote vouches for the channel certificate; the signature shows
        // this request comes from whoever holds its key. Without it, a
        // captured quote could be replayed under any uuid.
        let proven = mesh_certificates::verify_signature(
            &channel_der,
            &request.signed_payload(),
            &signature,
        )
        .map_err(|err| {
            Error::InvalidRequest(format!(
                "channel certificate: {}",
                DisplayErrorChain::new(&err)
            ))
        })?;
        if !proven {
            warn!(log, "activation not signed by the channel key");
            return Err(Error::AttestationFailed);
        }

        let validator = Arc::clone(&self.validator);
        let task = tokio::task::spawn_blocking(move || {
            validator.validate(&quote, &channel_der, &package, &infrastructures)
        });
        match tokio::time::timeout(self.settings.attestation_timeout, task)
            .await
        {
            Ok(Ok(Ok(_binding))) => {}
            Ok(Ok(Err(_))) => {
                warn!(log, "marble failed attestation");
                return Err(Error::AttestationFailed);
            }
            Ok(Err(err)) => {
                return Err(Error::Internal(format!(
                    "attestation task failed: {err}"
                )));
            }
            Err(_) => {
                warn!(log, "timed out validating marble quote");
                return Err(Error::Timeout("attestation"));
            }
        }

        let issued = ca.issue(&LeafRequest {
            common_name: request.uuid.to_string(),
            organizational_unit: Some(request.marble_type.clone()),
            dns_names: request.dns_names.clone(),
            lifetime,
        })?;

        let mut phase = self.phase.write().await;
        let active = phase.active_mut()?;
        let installed = active.state.installed()?;
        if installed.generation != generation {
            return Err(Error::ManifestChanged);
        }
        let marble =
            marble_definition(&installed.current, &request.marble_type)?;
        check_uniqueness(
            &active.state.activations,
            &request.marble_type,
            request.uuid,
            marble,
        )?;

        let seal_key = mesh_key_manager::marble_seal_key(
            &SecretBox::new(Box::new(active.state.marble_seal_root)),
            &request.marble_type,
        );
        let seal_key_hex =
            Zeroizing::new(hex::encode(&seal_key.expose_secret().0[..]));
        let secrets = secrets::rendered(&active.state.secrets);
        let uuid = request.uuid.to_string();
        let parameters = template::render(
            &marble.parameters,
            &TemplateContext {
                root_ca: ca.root_pem(),
                marble_cert: &issued.cert_pem,
                marble_key: issued.key_pem.expose_secret(),
                seal_key: &seal_key_hex,
                marble_type: &request.marble_type,
                uuid: &uuid,
                secrets: &secrets,
            },
        )?;

        // No identity leaves without a durable record of it.
        let mut state = active.state.clone();
        state.activations.push(ActivationRecord {
            marble_type: request.marble_type.clone(),
            uuid: request.uuid,
            serial: issued.serial.clone(),
            activated_at: Utc::now(),
        });
        self.sealer.write(&state, &active.header, &active.data_key).await?;
        active.state = state;

        info!(log, "marble activated"; "serial" => &issued.serial);
        Ok(ActivationResponse {
            parameters,
            certificate_chain: vec![
                issued.cert_pem,
                ca.root_pem().to_string(),
            ],
        })
    }

    /// Record `caller`'s approval of a manifest update, applying it once
    /// enough admins have approved the same fragment.
    ///
    /// Returns [`Error::QuorumNotMet`] while approvals are still missing.
    pub async fn update_manifest(
        &self,
        caller: &Caller,
        raw: &[u8],
    ) -> Result<(), Error> {
        let Caller::Admin(admin) = caller else {
            return Err(Error::Unauthorized);
        };
        let mut phase = self.phase.write().await;
        let active = phase.active_mut()?;
        let installed = active.state.installed()?;
        if !installed.current.admins.contains_key(admin) {
            return Err(Error::Unauthorized);
        }

        let (update, fragment) =
            ManifestUpdate::parse(raw).map_err(Error::InvalidUpdate)?;
        let updated =
            update.apply(&installed.current).map_err(Error::InvalidUpdate)?;
        updated.validate().map_err(Error::InvalidUpdate)?;
        let quorum = installed.current.update_quorum();
        let generation = installed.generation + 1;

        let approvers = active.pending_updates.entry(fragment).or_default();
        approvers.insert(admin.clone());
        if approvers.len() < quorum {
            let remaining = quorum - approvers.len();
            info!(
                self.log,
                "manifest update approved";
                "fragment" => %fragment,
                "admin" => admin,
                "remaining" => remaining,
            );
            return Err(Error::QuorumNotMet { remaining });
        }
        let approvers: Vec<String> = approvers.iter().cloned().collect();

        let mut state = active.state.clone();
        if let Some(installed) = state.manifest.as_mut() {
            installed.current = updated;
            installed.generation = generation;
        }
        state.update_log.push(UpdateLogEntry {
            fragment,
            approvers,
            applied_at: Utc::now(),
            generation,
        });
        self.sealer
            .write(&state, &active.header, &active.data_key)
            .await?;
        active.state = state;
        active.pending_updates.clear();
        info!(
            self.log,
            "manifest update applied";
            "fragment" => %fragment,
            "generation" => generation,
        );
        Ok(())
    }

    /// Set user-defined secrets. Either every secret in `body` is written
    /// or none is.
    pub async fn write_secrets(
        &self,
        caller: &Caller,
        body: &[u8],
    ) -> Result<(), Error> {
        if caller.name().is_none() {
            return Err(Error::Unauthorized);
        }
        let mut phase = self.phase.write().await;
        let active = phase.active_mut()?;
        let installed = active.state.installed()?;
        let written =
            secrets::prepare_write(&installed.current, caller, body)?;
        let names: Vec<String> = written.keys().cloned().collect();

        let mut state = active.state.clone();
        state.secrets.extend(written);
        self.sealer
            .write(&state, &active.header, &active.data_key)
            .await?;
        active.state = state;
        info!(
            self.log,
            "secrets written";
            "user" => caller.name(),
            "secrets" => ?names,
        );
        Ok(())
    }

    pub async fn get_secrets(
        &self,
        caller: &Caller,
        names: &[String],
    ) -> Result<BTreeMap<String, SecretValue>, Error> {
        if caller.name().is_none() {
            return Err(Error::Unauthorized);
        }
        let phase = self.phase.read().await;
        let active = phase.active()?;
        let installed = active.state.installed()?;
        Ok(secrets::read(
            &installed.current,
            &active.state.secrets,
            caller,
            names,
        )?)
    }

    /// Resolve a client credential to a caller.
    ///
    /// The caller must hold the key of a certificate named in the manifest,
    /// and each signed request is honored once.
    pub async fn verify_user(
        &self,
        credential: &ClientCredential,
    ) -> Result<Caller, Error> {
        let caller = match &*self.phase.read().await {
            Phase::Active(active) => {
                active.users.lookup(credential).map_err(|err| {
                    Error::InvalidRequest(
                        DisplayErrorChain::new(&err).to_string(),
                    )
                })?
            }
            Phase::Recovery(_) => return Ok(Caller::Unauthenticated),
        };
        if caller == Caller::Unauthenticated {
            return Ok(caller);
        }
        let now = Utc::now().timestamp();
        if !self.replay.lock().unwrap().admit(credential, now) {
            warn!(
                self.log,
                "refusing stale or replayed client signature";
                "user" => caller.name(),
                "timestamp" => credential.timestamp,
            );
            return Ok(Caller::Unauthenticated);
        }
        Ok(caller)
    }

    /// Submit one decrypted recovery share. Returns how many more are
    /// needed; zero means the state was recovered.
    pub async fn recover(&self, share: Vec<u8>) -> Result<usize, Error> {
        let mut phase = self.phase.write().await;
        let Phase::Recovery(mode) = &mut *phase else {
            return Err(Error::NotInRecoveryMode);
        };
        let shares = match mode.session.submit(share)? {
            Submission::NeedMore(remaining) => {
                info!(
                    self.log,
                    "recovery share accepted";
                    "remaining" => remaining,
                );
                return Ok(remaining);
            }
            Submission::Ready(shares) => shares,
        };

        let restored = self.restore_from_shares(mode, &shares).await;
        let (active, identity) = match restored {
            Ok(restored) => restored,
            Err(err) => {
                mode.session.reset();
                warn!(
                    self.log,
                    "recovery failed; shares discarded";
                    "error" => %DisplayErrorChain::new(&err),
                );
                return Err(err);
            }
        };
        *phase = Phase::Active(Box::new(active));
        self.identity.send_replace(identity);
        info!(
            self.log,
            "recovered sealed state";
            "status" => ?phase.status(),
        );
        Ok(0)
    }

    async fn restore_from_shares(
        &self,
        mode: &RecoveryMode,
        shares: &[recovery::KeyShare],
    ) -> Result<(Active, ServerIdentity), Error> {
        let threshold = mode.session.header().threshold;
        let data_key = recovery::combine(shares, threshold)?;
        let state: PersistedState =
            mode.sealed.open(&data_key).map_err(|_| Error::WrongKey)?;
        let header = mode.sealed.header().clone();
        let active = Active::restore(state, data_key, header)?;
        let identity = server_identity(&active.ca, &self.settings)?;
        // Re-wrap the data key under whatever the platform key is now.
        self.sealer
            .write(&active.state, &active.header, &active.data_key)
            .await?;
        Ok((active, identity))
    }
}

fn marble_definition<'a>(
    manifest: &'a Manifest,
    marble_type: &str,
) -> Result<&'a Marble, Error> {
    manifest
        .marbles
        .get(marble_type)
        .ok_or_else(|| Error::UnknownMarbleType(marble_type.to_string()))
}

// A single-instance type is activated once, ever. A multi-instance type
// admits each uuid once, up to its activation limit.
fn check_uniqueness(
    activations: &[ActivationRecord],
    marble_type: &str,
    uuid: Uuid,
    marble: &Marble,
) -> Result<(), Error> {
    let mut count: u64 = 0;
    for record in activations.iter().filter(|r| r.marble_type == marble_type)
    {
        if !marble.multi_instance || record.uuid == uuid {
            return Err(Error::AlreadyActivated {
                marble_type: marble_type.to_string(),
                uuid: record.uuid,
            });
        }
        count += 1;
    }
    if marble.max_activations.is_some_and(|max| count >= max) {
        return Err(Error::ActivationLimitReached(marble_type.to_string()));
    }
    Ok(())
}

fn channel_certificate_der(pem: &str) -> Result<Vec<u8>, Error> {
    mesh_certificates::leaf_from_pem(pem.as_bytes())
        .and_then(|cert| {
            cert.to_der().map_err(CertificateError::BadCertificate)
        })
        .map_err(|err| {
            Error::InvalidRequest(format!(
                "channel certificate: {}",
                DisplayErrorChain::new(&err)
            ))
        })
}

fn validate_dns_names(names: &[String]) -> Result<(), Error> {
    for name in names {
        let valid = !name.is_empty()
            && name.len() <= 253
            && name.chars().all(|c| {
                c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*')
            });
        if !valid {
            return Err(Error::InvalidRequest(format!(
                "invalid DNS name {name:?}"
            )));
        }
    }
    Ok(())
}

fn server_identity(
    ca: &CertificateAuthority,
    settings: &CoordinatorSettings,
) -> Result<ServerIdentity, Error> {
    let common_name = settings
        .dns_names
        .first()
        .cloned()
        .unwrap_or_else(|| settings.organization.clone());
    let leaf = ca.issue(&LeafRequest {
        common_name,
        organizational_unit: None,
        dns_names: settings.dns_names.clone(),
        lifetime: SERVER_CERT_LIFETIME,
    })?;
    let identity = ServerIdentity {
        cert_chain_pem: format!("{}{}", leaf.cert_pem, ca.root_pem()),
        key_pem: leaf.key_pem,
    };
    // Clients reach us by these names; a leaf that does not cover one of
    // them would fail every handshake.
    let validator = CertificateValidator::default();
    for name in &settings.dns_names {
        validator
            .validate(
                identity.cert_chain_pem.as_bytes(),
                identity.key_pem.expose_secret().as_bytes(),
                Some(name),
            )
            .map_err(CaError::Invalid)?;
    }
    Ok(identity)
}

async fn boot(
    log: &Logger,
    settings: &CoordinatorSettings,
    sealer: &Sealer,
) -> Result<(Phase, ServerIdentity), Error> {
    let Some(blob) = sealer.read().await? else {
        info!(log, "no sealed state found; generating coordinator identity");
        let ca = CertificateAuthority::generate(
            &settings.organization,
            ROOT_CERT_LIFETIME,
        )?;
        let state = PersistedState::new(&ca);
        let active = Active::restore(
            state,
            DataKey::generate(),
            RecoveryHeader::default(),
        )?;
        sealer
            .write(&active.state, &active.header, &active.data_key)
            .await?;
        let identity = server_identity(&active.ca, settings)?;
        return Ok((Phase::Active(Box::new(active)), identity));
    };

    // An unknown format or a damaged envelope is not something recovery
    // shares can fix.
    let sealed = SealedState::decode(&blob)?;
    let data_key = match sealer.wrapping_key().await {
        Ok(wrapping) => match sealed.unwrap_key(&wrapping) {
            Ok(key) => Some(key),
            Err(SealError::KeyUnavailable) => {
                warn!(log, "platform key does not unwrap the sealed state");
                None
            }
            Err(err) => return Err(err.into()),
        },
        Err(err) => {
            // Recovery re-seals under the platform key, so shares alone
            // cannot finish it while the key material is missing.
            warn!(
                log,
                "platform sealing key is unavailable; recovery will not \
                 complete until key material is provisioned";
                "error" => %DisplayErrorChain::new(&err),
            );
            None
        }
    };

    match data_key {
        Some(data_key) => {
            let state: PersistedState = sealed.open(&data_key)?;
            let active =
                Active::restore(state, data_key, sealed.header().clone())?;
            let identity = server_identity(&active.ca, settings)?;
            info!(
                log,
                "unsealed state";
                "manifest" =>
                    ?active.state.manifest.as_ref().map(|m| m.digest),
                "activations" => active.state.activations.len(),
            );
            Ok((Phase::Active(Box::new(active)), identity))
        }
        None => {
            let cert = CertificateAuthority::self_signed_server(
                &settings.organization,
                &settings.dns_names,
                RECOVERY_CERT_LIFETIME,
            )?;
            warn!(
                log,
                "entering recovery mode";
                "threshold" => sealed.header().threshold,
            );
            let identity = ServerIdentity {
                cert_chain_pem: cert.cert_pem.clone(),
                key_pem: cert.key_pem,
            };
            let recovery = RecoveryMode {
                session: RecoverySession::new(sealed.header().clone()),
                sealed,
                cert_pem: cert.cert_pem,
                cert_der: cert.cert_der,
            };
            Ok((Phase::Recovery(Box::new(recovery)), identity))
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two HTTPS servers in front of the coordinator core.

use crate::config::{
    AttestationConfig, Config, CoordinatorConfig, SealingConfig,
};
use crate::context::ServerContext;
use crate::coordinator::{Backends, Coordinator, CoordinatorSettings};
use crate::http_entrypoints;
use crate::quote::{
    QuoteIssuer, QuoteValidator, Report, SignedReportIssuer,
    SignedReportValidator, SimulationIssuer, SimulationValidator,
};
use crate::seal::FileStore;
use crate::StartError;
use dropshot::ConfigDropshot;
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, StreamExt};
use mesh_key_manager::{
    FileSecretRetriever, SecretRetriever, StaticSecretRetriever,
};
use slog::{error, info, o, warn, Logger};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

type HttpServer = dropshot::HttpServer<Arc<ServerContext>>;
type HttpServerShutdownFut =
    Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Build the core's collaborators as `config` asks for them.
pub fn backends(
    config: &CoordinatorConfig,
    log: &Logger,
) -> Result<Backends, StartError> {
    let secret_retriever: Arc<dyn SecretRetriever> = match &config.sealing {
        SealingConfig::KeyFile { path } => {
            Arc::new(FileSecretRetriever::new(path.clone()))
        }
        SealingConfig::Simulation => {
            warn!(
                log,
                "sealing in simulation mode; sealed state is not protected"
            );
            Arc::new(StaticSecretRetriever::simulation())
        }
    };

    let validator: Arc<dyn QuoteValidator> = match &config.attestation {
        AttestationConfig::SignedReport { .. } => {
            Arc::new(SignedReportValidator)
        }
        AttestationConfig::Simulation => {
            warn!(
                log,
                "attestation in simulation mode; every quote is accepted"
            );
            Arc::new(SimulationValidator)
        }
    };
    let issuer: Arc<dyn QuoteIssuer> = match &config.attestation {
        AttestationConfig::SignedReport { issuer_key: Some(path) } => {
            let pem = std::fs::read(path).map_err(|err| {
                StartError::ReadIssuerKey { path: path.clone(), err }
            })?;
            let issuer =
                SignedReportIssuer::from_pem(&pem, Report::default())
                    .map_err(StartError::LoadIssuerKey)?;
            Arc::new(issuer)
        }
        AttestationConfig::SignedReport { issuer_key: None } => {
            warn!(
                log,
                "no attestation issuer key; \
                 the root certificate is served without a quote"
            );
            Arc::new(SimulationIssuer)
        }
        AttestationConfig::Simulation => Arc::new(SimulationIssuer),
    };

    Ok(Backends {
        store: Arc::new(FileStore::new(&config.data_dir)),
        secret_retriever,
        validator,
        issuer,
    })
}

pub struct Server {
    coordinator: Arc<Coordinator>,
    client_server: HttpServer,
    marble_server: HttpServer,
    log: Logger,
}

impl Server {
    /// Bring up the coordinator core and both servers.
    pub async fn start(
        config: &Config,
        backends: Backends,
        log: &Logger,
    ) -> Result<Server, StartError> {
        let coordinator = Coordinator::start(
            log,
            CoordinatorSettings::from(&config.coordinator),
            backends,
        )
        .await
        .map_err(StartError::InitializeCoordinator)?;
        Self::serve(
            Arc::new(coordinator),
            &config.client_api,
            &config.marble_api,
            log,
        )
    }

    /// Start both servers in front of an already running core.
    pub fn serve(
        coordinator: Arc<Coordinator>,
        client_api: &ConfigDropshot,
        marble_api: &ConfigDropshot,
        log: &Logger,
    ) -> Result<Server, StartError> {
        let context = Arc::new(ServerContext::new(
            Arc::clone(&coordinator),
            log.new(o!("component" => "ServerContext")),
        ));
        let identity = coordinator.server_identity();

        let client_server = dropshot::ServerBuilder::new(
            http_entrypoints::client_api(),
            Arc::clone(&context),
            log.new(o!("component" => "dropshot_client")),
        )
        .config(client_api.clone())
        .tls(Some(identity.tls_config()))
        .start()
        .map_err(StartError::InitializeHttpServer)?;

        let marble_server = dropshot::ServerBuilder::new(
            http_entrypoints::marble_api(),
            context,
            log.new(o!("component" => "dropshot_marble")),
        )
        .config(marble_api.clone())
        .tls(Some(identity.tls_config()))
        .start()
        .map_err(StartError::InitializeHttpServer)?;

        info!(
            log,
            "coordinator listening";
            "client_api" => %client_server.local_addr(),
            "marble_api" => %marble_server.local_addr(),
        );
        Ok(Server {
            coordinator,
            client_server,
            marble_server,
            log: log.clone(),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client_server.local_addr()
    }

    pub fn marble_address(&self) -> SocketAddr {
        self.marble_server.local_addr()
    }

    /// Serve until either server shuts down.
    ///
    /// Whenever the coordinator's TLS identity changes (it leaves recovery
    /// mode), both servers switch to the new certificate.
    pub async fn wait_for_finish(self) -> Result<(), String> {
        let mut identity = self.coordinator.subscribe_identity();
        let mut shutdown: FuturesUnordered<HttpServerShutdownFut> =
            FuturesUnordered::new();
        shutdown.push(self.client_server.wait_for_shutdown().boxed());
        shutdown.push(self.marble_server.wait_for_shutdown().boxed());

        loop {
            tokio::select! {
                result = shutdown.next() => {
                    return result.unwrap_or(Ok(()));
                }
                changed = identity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tls = identity.borrow_and_update().tls_config();
                    for server in [&self.client_server, &self.marble_server] {
                        match server.refresh_tls(&tls).await {
                            Ok(()) => info!(
                                self.log,
                                "refreshed TLS certificate";
                                "address" => %server.local_addr(),
                            ),
                            Err(err) => error!(
                                self.log,
                                "failed to refresh TLS certificate";
                                "address" => %server.local_addr(),
                                "error" => %err,
                            ),
                        }
                    }
                }
            }
        }

        while let Some(result) = shutdown.next().await {
            result?;
        }
        Ok(())
    }

    /// Stop both servers.
    pub async fn close(self) -> Result<(), String> {
        self.client_server.close().await?;
        self.marble_server.close().await
    }
}

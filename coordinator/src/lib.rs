// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mesh coordinator: admits attested marbles into the mesh, issues their
//! identities, and keeps the manifest, secrets, and CA in sealed state.

use camino::Utf8PathBuf;
use slog::{debug, error, Drain};
use slog_dtrace::ProbeRegistration;
use std::io;

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod http_entrypoints;
pub mod manifest;
pub mod quote;
pub mod recovery;
pub mod seal;
pub mod secrets;
pub mod server;
pub mod template;
pub mod user;

pub use config::Config;
pub use coordinator::{Backends, Coordinator, CoordinatorSettings};
pub use error::{Error, ErrorKind};
pub use server::Server;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize logger")]
    InitializeLogger(#[source] io::Error),
    #[error("failed to register dtrace probes: {0}")]
    RegisterDtraceProbes(String),
    #[error("failed to read attestation issuer key {path}")]
    ReadIssuerKey {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to load attestation issuer key")]
    LoadIssuerKey(#[source] quote::AttestationError),
    #[error("failed to start coordinator")]
    InitializeCoordinator(#[source] Error),
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

/// Which of the two APIs to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    Client,
    Marble,
}

/// Write the OpenAPI document of one of the APIs to stdout.
pub fn run_openapi(kind: ApiKind) -> Result<(), String> {
    let version = semver::Version::new(0, 1, 0);
    let (api, title, description) = match kind {
        ApiKind::Client => (
            http_entrypoints::client_api(),
            "Mesh Coordinator Client API",
            "Management API for operators of a mesh",
        ),
        ApiKind::Marble => (
            http_entrypoints::marble_api(),
            "Mesh Coordinator Marble API",
            "Activation API for marbles joining a mesh",
        ),
    };
    api.openapi(title, version)
        .description(description)
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

/// Run the coordinator described by `config` until its servers shut down.
pub async fn run_server(config: Config) -> Result<(), StartError> {
    let (drain, registration) = slog_dtrace::with_drain(
        config
            .log
            .to_logger("mesh-coordinator")
            .map_err(StartError::InitializeLogger)?,
    );
    let log = slog::Logger::root(drain.fuse(), slog::o!());
    match registration {
        ProbeRegistration::Success => {
            debug!(log, "registered DTrace probes");
        }
        ProbeRegistration::Failed(err) => {
            let err = StartError::RegisterDtraceProbes(err);
            error!(log, "failed to register DTrace probes"; "error" => %err);
            return Err(err);
        }
    }

    let backends = server::backends(&config.coordinator, &log)?;
    let server = Server::start(&config, backends, &log).await?;
    if let Err(err) = server.wait_for_finish().await {
        error!(log, "server stopped with an error"; "error" => err);
    }
    Ok(())
}

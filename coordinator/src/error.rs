// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors returned by coordinator operations, and how they reach HTTP
//! clients.

use crate::manifest::ManifestError;
use crate::quote::AttestationError;
use crate::recovery::RecoveryError;
use crate::seal::SealError;
use crate::secrets::SecretsError;
use crate::template::TemplateError;
use display_error_chain::DisplayErrorChain;
use dropshot::HttpError;
use mesh_certificates::CaError;
use mesh_coordinator_api::CoordinatorStatus;
use uuid::Uuid;

/// Broad classes of failure, which decide how a transport reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed manifest or request
    Validation,
    /// A quote did not verify
    Attestation,
    /// Unknown caller, or one lacking the needed role
    Authorization,
    /// The request contradicts existing state
    Conflict,
    /// Not now: waiting for a manifest, for recovery, or for a quorum
    Unavailable,
    /// Sealed state could not be written or read
    Persistence,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid manifest")]
    InvalidManifest(#[source] ManifestError),

    #[error("invalid manifest update")]
    InvalidUpdate(#[source] ManifestError),

    #[error("invalid secrets request")]
    InvalidSecrets(#[source] SecretsError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown marble type {0:?}")]
    UnknownMarbleType(String),

    #[error("recovery share rejected")]
    InvalidShare(#[source] RecoveryError),

    #[error("recovery shares do not reconstruct the sealing key")]
    WrongKey,

    #[error("attestation failed")]
    AttestationFailed,

    #[error("caller is not authorized for this operation")]
    Unauthorized,

    #[error("manifest is already set")]
    AlreadySet,

    #[error("marble {marble_type:?} instance {uuid} is already activated")]
    AlreadyActivated { marble_type: String, uuid: Uuid },

    #[error("marble {0:?} has reached its activation limit")]
    ActivationLimitReached(String),

    #[error("recovery share rejected")]
    DuplicateShare(#[source] RecoveryError),

    #[error("coordinator is not in recovery mode")]
    NotInRecoveryMode,

    #[error("sealed state has no recovery keys")]
    RecoveryNotConfigured,

    #[error("coordinator is not ready: {}", .0.message())]
    NotReady(CoordinatorStatus),

    #[error("update approved; {remaining} more approvals needed")]
    QuorumNotMet { remaining: usize },

    #[error("manifest changed during activation; retry")]
    ManifestChanged,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("marble parameters reference a secret that is not set yet")]
    SecretNotSet(#[source] TemplateError),

    #[error("failed to persist sealed state")]
    Persistence(#[from] SealError),

    #[error("platform sealing key is unavailable")]
    SealingKey(#[source] mesh_key_manager::Error),

    #[error("certificate authority failure")]
    Certificate(#[from] CaError),

    #[error("failed to produce quote")]
    Quote(#[source] AttestationError),

    #[error("failed to render marble parameters")]
    Template(#[source] TemplateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ManifestError> for Error {
    fn from(err: ManifestError) -> Error {
        Error::InvalidManifest(err)
    }
}

impl From<SecretsError> for Error {
    fn from(err: SecretsError) -> Error {
        match err {
            SecretsError::Forbidden(_) => Error::Unauthorized,
            other => Error::InvalidSecrets(other),
        }
    }
}

impl From<RecoveryError> for Error {
    fn from(err: RecoveryError) -> Error {
        match err {
            RecoveryError::NotConfigured => Error::RecoveryNotConfigured,
            RecoveryError::WrongKey => Error::WrongKey,
            RecoveryError::DuplicateShare(_) => Error::DuplicateShare(err),
            RecoveryError::InvalidShare | RecoveryError::Combine(_) => {
                Error::InvalidShare(err)
            }
            RecoveryError::Split(_)
            | RecoveryError::BadRecoveryKey { .. }
            | RecoveryError::Encrypt { .. } => {
                Error::Internal(DisplayErrorChain::new(&err).to_string())
            }
        }
    }
}

impl From<TemplateError> for Error {
    fn from(err: TemplateError) -> Error {
        match err {
            TemplateError::SecretNotSet(_) => Error::SecretNotSet(err),
            other => Error::Template(other),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidManifest(_)
            | Error::InvalidUpdate(_)
            | Error::InvalidSecrets(_)
            | Error::InvalidRequest(_)
            | Error::UnknownMarbleType(_)
            | Error::InvalidShare(_)
            | Error::WrongKey => ErrorKind::Validation,
            Error::AttestationFailed => ErrorKind::Attestation,
            Error::Unauthorized => ErrorKind::Authorization,
            Error::AlreadySet
            | Error::AlreadyActivated { .. }
            | Error::ActivationLimitReached(_)
            | Error::DuplicateShare(_)
            | Error::NotInRecoveryMode
            | Error::RecoveryNotConfigured => ErrorKind::Conflict,
            Error::NotReady(_)
            | Error::QuorumNotMet { .. }
            | Error::ManifestChanged
            | Error::Timeout(_)
            | Error::SecretNotSet(_) => ErrorKind::Unavailable,
            Error::Persistence(_) | Error::SealingKey(_) => {
                ErrorKind::Persistence
            }
            Error::Certificate(_)
            | Error::Quote(_)
            | Error::Template(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> HttpError {
        let message = DisplayErrorChain::new(&err).to_string();
        match err.kind() {
            // 4xx errors
            ErrorKind::Validation => HttpError::for_bad_request(
                Some(String::from("InvalidRequest")),
                message,
            ),
            // Never says which check failed.
            ErrorKind::Attestation => HttpError::for_bad_request(
                Some(String::from("AttestationFailed")),
                err.to_string(),
            ),
            ErrorKind::Authorization => HttpError::for_client_error(
                Some(String::from("Unauthorized")),
                dropshot::ClientErrorStatusCode::UNAUTHORIZED,
                message,
            ),
            ErrorKind::Conflict => HttpError::for_client_error(
                Some(String::from("Conflict")),
                dropshot::ClientErrorStatusCode::CONFLICT,
                message,
            ),

            // 5xx errors
            ErrorKind::Unavailable => HttpError::for_unavail(
                Some(String::from("ServiceNotAvailable")),
                message,
            ),
            ErrorKind::Persistence | ErrorKind::Internal => {
                HttpError::for_internal_error(message)
            }
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API definitions for the mesh coordinator's two HTTP endpoints: the
//! management ("client") API used by operators and the activation ("marble")
//! API used by workers joining the mesh.

use dropshot::{
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Query,
    RequestContext, TypedBody, UntypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header carrying the caller's client certificate chain: standard base64
/// of the DER encodings, separated by commas, leaf first.
///
/// A certificate alone identifies nobody. The caller must also sign the
/// request with the leaf's key; see [`client_signed_payload`].
pub const CLIENT_CERT_HEADER: &str = "x-mesh-client-cert";

/// Header carrying the Unix time (seconds) at which the request was signed.
pub const CLIENT_TIMESTAMP_HEADER: &str = "x-mesh-client-timestamp";

/// Header carrying the base64 signature over [`client_signed_payload`].
pub const CLIENT_SIGNATURE_HEADER: &str = "x-mesh-client-signature";

/// The bytes a management caller signs with its certificate's key.
///
/// `path` is the request target exactly as sent, query string included.
pub fn client_signed_payload(
    method: &str,
    path: &str,
    timestamp: i64,
    body: &[u8],
) -> Vec<u8> {
    let mut payload =
        format!("mesh-client-v1\n{method}\n{path}\n{timestamp}\n")
            .into_bytes();
    payload.extend_from_slice(body);
    payload
}

#[dropshot::api_description]
pub trait CoordinatorClientApi {
    type Context;

    /// Report which phase the coordinator is in.
    #[endpoint {
        method = GET,
        path = "/status",
    }]
    async fn status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<StatusResponse>, HttpError>;

    /// Fetch the digest of the installed manifest, if any.
    #[endpoint {
        method = GET,
        path = "/manifest",
    }]
    async fn manifest_signature(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<ManifestSignatureResponse>, HttpError>;

    /// Install the manifest. This succeeds at most once.
    ///
    /// The body is the manifest JSON exactly as it should be hashed.
    #[endpoint {
        method = POST,
        path = "/manifest",
    }]
    async fn manifest_set(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseOk<SetManifestResponse>, HttpError>;

    /// Fetch the coordinator's root certificate and an attestation quote
    /// binding it.
    #[endpoint {
        method = GET,
        path = "/quote",
    }]
    async fn cert_quote(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<CertQuoteResponse>, HttpError>;

    /// Submit one decrypted recovery share.
    #[endpoint {
        method = POST,
        path = "/recover",
    }]
    async fn recover(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseOk<RecoverResponse>, HttpError>;

    /// Approve (and, once the quorum is reached, apply) a manifest update.
    #[endpoint {
        method = POST,
        path = "/update",
    }]
    async fn manifest_update(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseOk<UpdateResponse>, HttpError>;

    /// Set user-defined secrets.
    #[endpoint {
        method = POST,
        path = "/secrets",
    }]
    async fn secrets_write(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Read secrets the caller is allowed to see.
    #[endpoint {
        method = GET,
        path = "/secrets",
    }]
    async fn secrets_get(
        rqctx: RequestContext<Self::Context>,
        query: Query<SecretsQuery>,
    ) -> Result<HttpResponseOk<SecretsResponse>, HttpError>;
}

#[dropshot::api_description]
pub trait CoordinatorMarbleApi {
    type Context;

    /// Attest a marble and hand it its identity and parameters.
    #[endpoint {
        method = POST,
        path = "/activate",
    }]
    async fn activate(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<ActivationRequest>,
    ) -> Result<HttpResponseOk<ActivationResponse>, HttpError>;
}

/// The phases of the coordinator, with the numeric codes clients expect.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    RecoveryMode,
    Uninitialized,
    WaitingForManifest,
    AcceptingMarbles,
}

impl CoordinatorStatus {
    pub fn code(&self) -> u8 {
        match self {
            CoordinatorStatus::RecoveryMode => 0,
            CoordinatorStatus::Uninitialized => 1,
            CoordinatorStatus::WaitingForManifest => 2,
            CoordinatorStatus::AcceptingMarbles => 3,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CoordinatorStatus::RecoveryMode => {
                "Coordinator is in recovery mode. Either upload a key to \
                 unseal the saved state, or set a new manifest."
            }
            CoordinatorStatus::Uninitialized => {
                "Coordinator is being initialized."
            }
            CoordinatorStatus::WaitingForManifest => {
                "Coordinator is ready to accept a manifest."
            }
            CoordinatorStatus::AcceptingMarbles => {
                "Coordinator is running correctly and ready to accept marbles."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct StatusResponse {
    pub status: CoordinatorStatus,
    pub status_code: u8,
    pub status_message: String,
}

impl From<CoordinatorStatus> for StatusResponse {
    fn from(status: CoordinatorStatus) -> Self {
        StatusResponse {
            status,
            status_code: status.code(),
            status_message: status.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ManifestSignatureResponse {
    /// Hex SHA-256 of the installed manifest, absent before installation
    pub manifest_signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct SetManifestResponse {
    /// Recovery key name to base64 RSA-OAEP encrypted share
    pub recovery_secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct CertQuoteResponse {
    /// Root certificate, PEM
    pub cert: String,
    /// Base64 attestation quote over the root certificate
    pub quote: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RecoverResponse {
    pub status_message: String,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct UpdateResponse {
    /// Whether the update was applied by this approval
    pub applied: bool,
    /// Approvals still missing; zero once applied
    pub remaining_approvals: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct SecretsQuery {
    /// Comma-separated secret names
    pub names: String,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum SecretType {
    SymmetricKey,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct SecretValue {
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    /// Hex for symmetric keys, verbatim for plain secrets
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct SecretsResponse(pub BTreeMap<String, SecretValue>);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ActivationRequest {
    pub marble_type: String,
    pub uuid: Uuid,
    /// Base64 attestation quote binding `channel_certificate`
    pub quote: String,
    /// PEM certificate of the channel the marble is talking over
    pub channel_certificate: String,
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Base64 signature over [`ActivationRequest::signed_payload`] by the
    /// key of `channel_certificate`
    pub signature: String,
}

impl ActivationRequest {
    /// The bytes the marble signs with its channel key. Everything but the
    /// signature itself is covered.
    pub fn signed_payload(&self) -> Vec<u8> {
        format!(
            "mesh-activation-v1\n{}\n{}\n{}\n{}\n{}",
            self.marble_type,
            self.uuid,
            self.dns_names.join(","),
            self.quote,
            self.channel_certificate,
        )
        .into_bytes()
    }
}

/// Process parameters after template rendering.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub struct Parameters {
    pub files: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ActivationResponse {
    pub parameters: Parameters,
    /// Leaf first, then the coordinator root, PEM
    pub certificate_chain: Vec<String>,
}

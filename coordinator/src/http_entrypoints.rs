// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::context::ServerContext;
use crate::error::Error;
use dropshot::{
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Query,
    RequestContext, TypedBody, UntypedBody,
};
use mesh_coordinator_api::*;
use std::sync::Arc;

type CoordinatorApiDescription = dropshot::ApiDescription<Arc<ServerContext>>;

/// The management endpoint.
pub fn client_api() -> CoordinatorApiDescription {
    coordinator_client_api_mod::api_description::<CoordinatorClientImpl>()
        .expect("registered entrypoints")
}

/// The activation endpoint.
pub fn marble_api() -> CoordinatorApiDescription {
    coordinator_marble_api_mod::api_description::<CoordinatorMarbleImpl>()
        .expect("registered entrypoints")
}

enum CoordinatorClientImpl {}

impl CoordinatorClientApi for CoordinatorClientImpl {
    type Context = Arc<ServerContext>;

    async fn status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<StatusResponse>, HttpError> {
        let status = rqctx.context().coordinator().status().await;
        Ok(HttpResponseOk(StatusResponse::from(status)))
    }

    async fn manifest_signature(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<ManifestSignatureResponse>, HttpError> {
        let manifest_signature =
            rqctx.context().coordinator().manifest_signature().await;
        Ok(HttpResponseOk(ManifestSignatureResponse { manifest_signature }))
    }

    async fn manifest_set(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseOk<SetManifestResponse>, HttpError> {
        let recovery_secrets = rqctx
            .context()
            .coordinator()
            .set_manifest(body.as_bytes())
            .await?;
        Ok(HttpResponseOk(SetManifestResponse { recovery_secrets }))
    }

    async fn cert_quote(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<CertQuoteResponse>, HttpError> {
        let (cert, quote) = rqctx.context().coordinator().cert_quote().await?;
        Ok(HttpResponseOk(CertQuoteResponse { cert, quote }))
    }

    async fn recover(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseOk<RecoverResponse>, HttpError> {
        let coordinator = rqctx.context().coordinator();
        let remaining = coordinator.recover(body.as_bytes().to_vec()).await?;
        let status_message = if remaining == 0 {
            coordinator.status().await.message().to_string()
        } else {
            format!("Recovery share accepted; {remaining} more needed.")
        };
        Ok(HttpResponseOk(RecoverResponse { status_message, remaining }))
    }

    async fn manifest_update(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseOk<UpdateResponse>, HttpError> {
        let ctx = rqctx.context();
        let caller = ctx.caller(&rqctx, body.as_bytes()).await?;
        match ctx.coordinator().update_manifest(&caller, body.as_bytes()).await
        {
            Ok(()) => Ok(HttpResponseOk(UpdateResponse {
                applied: true,
                remaining_approvals: 0,
            })),
            // An approval that still awaits co-signers is not a failure of
            // this request.
            Err(Error::QuorumNotMet { remaining }) => {
                Ok(HttpResponseOk(UpdateResponse {
                    applied: false,
                    remaining_approvals: remaining,
                }))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn secrets_write(
        rqctx: RequestContext<Self::Context>,
        body: UntypedBody,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        let caller = ctx.caller(&rqctx, body.as_bytes()).await?;
        ctx.coordinator().write_secrets(&caller, body.as_bytes()).await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn secrets_get(
        rqctx: RequestContext<Self::Context>,
        query: Query<SecretsQuery>,
    ) -> Result<HttpResponseOk<SecretsResponse>, HttpError> {
        let ctx = rqctx.context();
        let caller = ctx.caller(&rqctx, &[]).await?;
        let names: Vec<String> = query
            .into_inner()
            .names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
        let secrets = ctx.coordinator().get_secrets(&caller, &names).await?;
        Ok(HttpResponseOk(SecretsResponse(secrets)))
    }
}

enum CoordinatorMarbleImpl {}

impl CoordinatorMarbleApi for CoordinatorMarbleImpl {
    type Context = Arc<ServerContext>;

    async fn activate(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<ActivationRequest>,
    ) -> Result<HttpResponseOk<ActivationResponse>, HttpError> {
        let request = body.into_inner();
        let response =
            rqctx.context().coordinator().activate(&request).await?;
        Ok(HttpResponseOk(response))
    }
}

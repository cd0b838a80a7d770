// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::user::{parse_forwarded_chain, Caller, ClientCredential};
use base64::Engine;
use display_error_chain::DisplayErrorChain;
use dropshot::RequestContext;
use mesh_coordinator_api::{
    client_signed_payload, CLIENT_CERT_HEADER, CLIENT_SIGNATURE_HEADER,
    CLIENT_TIMESTAMP_HEADER,
};
use slog::{debug, Logger};
use std::sync::Arc;

pub struct ServerContext {
    coordinator: Arc<Coordinator>,
    log: Logger,
}

impl ServerContext {
    pub fn new(coordinator: Arc<Coordinator>, log: Logger) -> Self {
        Self { coordinator, log }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Resolve the caller of a management request from its client
    /// certificate and request signature headers.
    ///
    /// No certificate, or a certificate without a signature, means an
    /// unauthenticated caller. `body` must be the request body as received.
    pub async fn caller(
        &self,
        rqctx: &RequestContext<Arc<ServerContext>>,
        body: &[u8],
    ) -> Result<Caller, Error> {
        let request = &rqctx.request;
        let Some(cert) = header(rqctx, CLIENT_CERT_HEADER)? else {
            return Ok(Caller::Unauthenticated);
        };
        let (Some(timestamp), Some(signature)) = (
            header(rqctx, CLIENT_TIMESTAMP_HEADER)?,
            header(rqctx, CLIENT_SIGNATURE_HEADER)?,
        ) else {
            debug!(self.log, "client certificate presented without signature");
            return Ok(Caller::Unauthenticated);
        };

        let chain = parse_forwarded_chain(cert).map_err(|err| {
            let err = DisplayErrorChain::new(&err).to_string();
            debug!(self.log, "bad client certificate header"; "error" => &err);
            Error::InvalidRequest(err)
        })?;
        let timestamp: i64 = timestamp.parse().map_err(|_| {
            Error::InvalidRequest(format!(
                "{CLIENT_TIMESTAMP_HEADER} is not a Unix timestamp"
            ))
        })?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| {
                Error::InvalidRequest(format!(
                    "{CLIENT_SIGNATURE_HEADER} is not valid base64"
                ))
            })?;
        let path = request
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or_else(|| request.uri().path());
        let credential = ClientCredential {
            chain,
            timestamp,
            payload: client_signed_payload(
                request.method().as_str(),
                path,
                timestamp,
                body,
            ),
            signature,
        };
        self.coordinator.verify_user(&credential).await
    }
}

fn header<'a>(
    rqctx: &'a RequestContext<Arc<ServerContext>>,
    name: &str,
) -> Result<Option<&'a str>, Error> {
    rqctx
        .request
        .headers()
        .get(name)
        .map(|value| {
            value.to_str().map_err(|_| {
                Error::InvalidRequest(format!("{name} is not valid ASCII"))
            })
        })
        .transpose()
}

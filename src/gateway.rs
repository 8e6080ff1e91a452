//! Gateway registration client.
//!
//! Every sandbox is registered with the gateway, which hands back the
//! public endpoint and the API key clients use to reach the sandbox's
//! tool API. Registration is removed again on teardown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::GatewayError;

/// What the gateway returns for a registered sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct GatewayRegistration {
    /// Public URL routed to the sandbox.
    pub endpoint: String,
    pub api_key: String,
}

/// Registration capability consumed by the orchestrator.
#[async_trait]
pub(crate) trait GatewayClient: Send + Sync {
    /// Registers a sandbox reachable at `internal_endpoint`.
    async fn register(
        &self,
        sandbox_id: &str,
        name: &str,
        internal_endpoint: &str,
    ) -> Result<GatewayRegistration, GatewayError>;

    /// Removes a registration. Unknown sandboxes yield `GatewayError::NotFound`.
    async fn unregister(&self, sandbox_id: &str) -> Result<(), GatewayError>;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    sandbox_id: &'a str,
    name: &'a str,
    endpoint: &'a str,
}

/// Gateway client speaking the HTTP registration API.
pub(crate) struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/sandboxes/{}", self.base_url, path)
    }
}

async fn error_for_status(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    GatewayError::Status { status, body }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    #[allow(tail_expr_drop_order)]
    async fn register(
        &self,
        sandbox_id: &str,
        name: &str,
        internal_endpoint: &str,
    ) -> Result<GatewayRegistration, GatewayError> {
        debug!(sandbox_id, endpoint = internal_endpoint, "Registering with gateway");

        let response = self
            .client
            .post(self.url("register"))
            .json(&RegisterRequest {
                sandbox_id,
                name,
                endpoint: internal_endpoint,
            })
            .send()
            .await
            .map_err(|e| GatewayError::request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        response
            .json::<GatewayRegistration>()
            .await
            .map_err(|e| GatewayError::InvalidResponse {
                message: e.to_string(),
            })
    }

    #[allow(tail_expr_drop_order)]
    async fn unregister(&self, sandbox_id: &str) -> Result<(), GatewayError> {
        debug!(sandbox_id, "Unregistering from gateway");

        let response = self
            .client
            .delete(self.url(sandbox_id))
            .send()
            .await
            .map_err(|e| GatewayError::request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(error_for_status(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingGateway;

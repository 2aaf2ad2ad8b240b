//! jsonrpsee-backed implementations of the mesh seams.
//!
//! The router and the liveness reporter both speak to peers through
//! traits; this module grounds them in HTTP clients against the peers'
//! jsonrpsee listeners.

use async_trait::async_trait;
use butlers_core::route::{RouteEnvelope, RouteResponse};
use butlers_core::ErrorClass;
use butlers_registry::{RegistryClient, RegistryClientError};
use butlers_routing::{MeshClient, MeshConnector, RouteFailure};
use butlers_storage::RegistryRecord;
use jsonrpsee::core::client::Error as ClientError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::types::error::METHOD_NOT_FOUND_CODE;
use std::sync::Arc;
use std::time::Duration;

use crate::rpc::ButlerRpcClient;

fn map_client_error(error: &ClientError) -> RouteFailure {
    match error {
        ClientError::Call(object) => {
            RouteFailure::new(ErrorClass::InternalError, object.message().to_string())
        },
        ClientError::RequestTimeout => {
            RouteFailure::new(ErrorClass::Timeout, "mesh call timed out")
        },
        other => RouteFailure::new(ErrorClass::TargetUnavailable, other.to_string()),
    }
}

/// A mesh client over one peer's HTTP endpoint.
struct JsonRpcMeshClient {
    client: HttpClient,
}

#[async_trait]
impl MeshClient for JsonRpcMeshClient {
    async fn probe(&self) -> bool {
        self.client.probe().await.unwrap_or(false)
    }

    async fn call_tool(&self, envelope: RouteEnvelope) -> Result<RouteResponse, RouteFailure> {
        self.client
            .tool_call(envelope)
            .await
            .map_err(|e| map_client_error(&e))
    }
}

/// Connects mesh clients over HTTP.
#[derive(Debug, Clone)]
pub struct JsonRpcMeshConnector {
    request_timeout: Duration,
}

impl JsonRpcMeshConnector {
    /// Create a connector with a per-request timeout.
    #[must_use]
    pub const fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl MeshConnector for JsonRpcMeshConnector {
    async fn connect(&self, endpoint_url: &str) -> Result<Arc<dyn MeshClient>, RouteFailure> {
        let client = HttpClientBuilder::default()
            .request_timeout(self.request_timeout)
            .build(endpoint_url)
            .map_err(|e| RouteFailure::new(ErrorClass::TargetUnavailable, e.to_string()))?;
        Ok(Arc::new(JsonRpcMeshClient { client }))
    }
}

/// The liveness reporter's view of the switchboard.
pub(crate) struct SwitchboardClient {
    client: HttpClient,
}

impl SwitchboardClient {
    /// Connect to the switchboard's mesh endpoint.
    pub(crate) fn connect(
        endpoint_url: &str,
        request_timeout: Duration,
    ) -> Result<Self, RegistryClientError> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(endpoint_url)
            .map_err(|e| RegistryClientError::Unreachable(e.to_string()))?;
        Ok(Self { client })
    }
}

fn map_registry_error(error: &ClientError) -> RegistryClientError {
    match error {
        // A missing method is the HTTP-404 analogue: permanent
        // misconfiguration, not a transient fault.
        ClientError::Call(object) if object.code() == METHOD_NOT_FOUND_CODE => {
            RegistryClientError::EndpointNotFound
        },
        ClientError::Call(object) => RegistryClientError::Unreachable(object.message().to_string()),
        other => RegistryClientError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl RegistryClient for SwitchboardClient {
    async fn post_registration(&self, record: RegistryRecord) -> Result<(), RegistryClientError> {
        self.client
            .register_butler(record)
            .await
            .map_err(|e| map_registry_error(&e))
    }

    async fn post_heartbeat(&self, name: &str) -> Result<(), RegistryClientError> {
        self.client
            .heartbeat(name.into())
            .await
            .map_err(|e| map_registry_error(&e))
    }
}

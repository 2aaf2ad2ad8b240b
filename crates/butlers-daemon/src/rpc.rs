//! The butler mesh RPC surface.
//!
//! Every butler exposes the same jsonrpsee API (HTTP + WebSocket on one
//! port): tool invocation through the `route.v1` envelope, a health
//! probe, status, and the scheduler tick. The switchboard additionally
//! serves registration, heartbeats, and ingest; those methods reject on
//! every other butler.

use butlers_core::route::{RouteContext, RouteEnvelope, RouteResponse};
use butlers_core::{ButlerName, ConnectorHeartbeat, SessionId};
use butlers_ingress::{IngestApi, IngestResponse};
use butlers_registry::{ButlerRegistry, ConnectorMonitor};
use butlers_runtime::Spawner;
use butlers_scheduler::{Scheduler, TickReport};
use butlers_storage::RegistryRecord;
use chrono::{DateTime, Utc};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::tools::{ToolContext, ToolRegistry};

mod error_codes {
    /// The caller hit a switchboard-only method on another butler.
    pub(super) const NOT_SWITCHBOARD: i32 = -32001;
    /// The envelope or heartbeat failed validation.
    pub(super) const VALIDATION: i32 = -32002;
    /// Internal failure.
    pub(super) const INTERNAL: i32 = -32003;
}

/// Status payload returned by `butler_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButlerStatus {
    /// Butler name.
    pub butler: String,
    /// Seconds since startup.
    pub uptime_s: i64,
    /// Registered tool names.
    pub tools: Vec<String>,
}

/// The butler mesh RPC API.
///
/// Served by every butler daemon; called by peers (router), connectors
/// (ingest, heartbeats), and the ops CLI.
#[rpc(server, client, namespace = "butler")]
pub trait ButlerRpc {
    /// Invoke a tool through a `route.v1` envelope. Tool failures are
    /// in-band (`route_response.v1`); only transport faults surface as
    /// RPC errors.
    #[method(name = "toolCall")]
    async fn tool_call(&self, envelope: RouteEnvelope) -> Result<RouteResponse, ErrorObjectOwned>;

    /// Invoke a tool on behalf of a running session. The daemon binds the
    /// call to the session row first (ground-truth tool-call capture).
    #[method(name = "sessionToolCall")]
    async fn session_tool_call(
        &self,
        session_id: SessionId,
        tool: String,
        args: Value,
    ) -> Result<RouteResponse, ErrorObjectOwned>;

    /// Lightweight health probe for the router's client cache.
    #[method(name = "probe")]
    async fn probe(&self) -> Result<bool, ErrorObjectOwned>;

    /// Butler status.
    #[method(name = "status")]
    async fn status(&self) -> Result<ButlerStatus, ErrorObjectOwned>;

    /// Fire the scheduler once.
    #[method(name = "tick")]
    async fn tick(&self) -> Result<TickReport, ErrorObjectOwned>;

    /// Register a butler (switchboard only).
    #[method(name = "registerButler")]
    async fn register_butler(&self, record: RegistryRecord) -> Result<(), ErrorObjectOwned>;

    /// Record a butler liveness heartbeat (switchboard only).
    #[method(name = "heartbeat")]
    async fn heartbeat(&self, name: ButlerName) -> Result<(), ErrorObjectOwned>;

    /// Record a connector heartbeat (switchboard only). Returns whether
    /// the connector row was auto-created.
    #[method(name = "connectorHeartbeat")]
    async fn connector_heartbeat(
        &self,
        heartbeat: ConnectorHeartbeat,
    ) -> Result<bool, ErrorObjectOwned>;

    /// Submit an `ingest.v1` envelope (switchboard only).
    #[method(name = "ingest")]
    async fn ingest(&self, envelope: Value) -> Result<IngestResponse, ErrorObjectOwned>;
}

/// Switchboard-only services.
pub(crate) struct SwitchboardServices {
    pub(crate) registry: Arc<ButlerRegistry>,
    pub(crate) connectors: Arc<ConnectorMonitor>,
    pub(crate) ingest: Arc<IngestApi>,
}

/// The per-butler RPC implementation.
pub(crate) struct RpcImpl {
    pub(crate) butler: ButlerName,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) spawner: Arc<Spawner>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) switchboard: Option<SwitchboardServices>,
}

impl RpcImpl {
    fn switchboard(&self) -> Result<&SwitchboardServices, ErrorObjectOwned> {
        self.switchboard.as_ref().ok_or_else(|| {
            ErrorObjectOwned::owned(
                error_codes::NOT_SWITCHBOARD,
                format!("butler '{}' does not own the registry/ingest surface", self.butler),
                None::<()>,
            )
        })
    }

    async fn invoke_tool(&self, tool: &str, args: Value, context: ToolContext) -> RouteResponse {
        match self.tools.invoke(tool, args, &context).await {
            Ok(result) => RouteResponse::success(result),
            Err(failure) => RouteResponse::failure(failure.body()),
        }
    }
}

#[jsonrpsee::core::async_trait]
impl ButlerRpcServer for RpcImpl {
    async fn tool_call(&self, envelope: RouteEnvelope) -> Result<RouteResponse, ErrorObjectOwned> {
        let context = ToolContext {
            caller: envelope.request_context.clone(),
            session_id: None,
        };
        Ok(self.invoke_tool(&envelope.tool, envelope.args, context).await)
    }

    async fn session_tool_call(
        &self,
        session_id: SessionId,
        tool: String,
        args: Value,
    ) -> Result<RouteResponse, ErrorObjectOwned> {
        // Ground truth: the audit row is written from the daemon's side of
        // the wire, not from whatever the CLI claims afterwards.
        let audit = serde_json::json!({
            "tool": tool,
            "args": args,
            "at": Utc::now(),
        });
        if let Err(e) = self.spawner.record_tool_call(session_id, audit).await {
            warn!(%session_id, error = %e, "tool-call audit failed");
        }

        let context = ToolContext {
            caller: RouteContext {
                endpoint_identity: self.butler.to_string(),
                ..RouteContext::default()
            },
            session_id: Some(session_id),
        };
        Ok(self.invoke_tool(&tool, args, context).await)
    }

    async fn probe(&self) -> Result<bool, ErrorObjectOwned> {
        Ok(true)
    }

    async fn status(&self) -> Result<ButlerStatus, ErrorObjectOwned> {
        Ok(ButlerStatus {
            butler: self.butler.to_string(),
            uptime_s: Utc::now().signed_duration_since(self.started_at).num_seconds(),
            tools: self.tools.names(),
        })
    }

    async fn tick(&self) -> Result<TickReport, ErrorObjectOwned> {
        self.scheduler.tick(Utc::now()).await.map_err(|e| {
            ErrorObjectOwned::owned(error_codes::INTERNAL, e.to_string(), None::<()>)
        })
    }

    async fn register_butler(&self, record: RegistryRecord) -> Result<(), ErrorObjectOwned> {
        let services = self.switchboard()?;
        services.registry.register(record).await.map_err(|e| {
            ErrorObjectOwned::owned(error_codes::INTERNAL, e.to_string(), None::<()>)
        })
    }

    async fn heartbeat(&self, name: ButlerName) -> Result<(), ErrorObjectOwned> {
        let services = self.switchboard()?;
        services.registry.heartbeat(&name, Utc::now()).await.map_err(|e| {
            ErrorObjectOwned::owned(error_codes::VALIDATION, e.to_string(), None::<()>)
        })
    }

    async fn connector_heartbeat(
        &self,
        heartbeat: ConnectorHeartbeat,
    ) -> Result<bool, ErrorObjectOwned> {
        let services = self.switchboard()?;
        services
            .connectors
            .ingest_heartbeat(&heartbeat, Utc::now())
            .await
            .map_err(|e| {
                ErrorObjectOwned::owned(error_codes::VALIDATION, e.to_string(), None::<()>)
            })
    }

    async fn ingest(&self, envelope: Value) -> Result<IngestResponse, ErrorObjectOwned> {
        let services = self.switchboard()?;
        let raw = serde_json::to_vec(&envelope).map_err(|e| {
            ErrorObjectOwned::owned(error_codes::VALIDATION, e.to_string(), None::<()>)
        })?;
        services.ingest.submit_raw(&raw, Utc::now()).await.map_err(|e| {
            let code = match e.class() {
                butlers_core::ErrorClass::ValidationError => error_codes::VALIDATION,
                _ => error_codes::INTERNAL,
            };
            ErrorObjectOwned::owned(code, e.to_string(), None::<()>)
        })
    }
}

/// Build and start the mesh listener for one butler.
pub(crate) async fn start_listener(
    port: u16,
    rpc_impl: RpcImpl,
) -> DaemonResult<(ServerHandle, SocketAddr)> {
    let butler = rpc_impl.butler.clone();
    let server = Server::builder()
        .build(format!("127.0.0.1:{port}"))
        .await
        .map_err(|e| DaemonError::Listener(format!("failed to bind port {port}: {e}")))?;
    let addr = server
        .local_addr()
        .map_err(|e| DaemonError::Listener(e.to_string()))?;
    let handle = server.start(rpc_impl.into_rpc());
    info!(butler = %butler, %addr, "mesh listener started");
    Ok((handle, addr))
}

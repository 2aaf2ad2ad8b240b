//! Daemon startup and shutdown.
//!
//! Startup phases, in order (failures before the module phase are fatal;
//! module failures are tracked and non-fatal):
//!
//! 1. Config and runtime adapter are chosen by the caller.
//! 2. Telemetry is installed by the binary before `Daemon::start`.
//! 3. Credentials resolve through the credential store.
//! 4. One schema-scoped pool opens per butler.
//! 5. Migration chains run: core, then butler, then module chains.
//! 6. Modules start topologically; failures cascade without killing the
//!    butler.
//! 7. Core tools register.
//! 8. Module tools register behind the egress-ownership filter.
//! 9. Approval gates wrap configured tools.
//! 10. The mesh listener starts.
//! 11. The butler registers with the switchboard.
//! 12. Background loops start: scheduler ticker, liveness/heartbeat,
//!     ingress workers and scanner (switchboard only).
//!
//! Shutdown runs in reverse: loops cancel, in-flight sessions drain
//! within the configured budget, listeners stop, pools close.

use butlers_config::{ButlerConfig, DbSettings, RosterConfig};
use butlers_core::ButlerName;
use butlers_ingress::{IngestApi, IngressBuffer, run_scanner, run_worker};
use butlers_registry::{ButlerRegistry, ConnectorMonitor, LivenessReporter};
use butlers_routing::{Classifier, Dispatcher, NotifyExecutor, RouteCallGate, Router};
use butlers_runtime::{RuntimeAdapter, Spawner, SpawnerConfig};
use butlers_scheduler::{JobRegistry, NativeJob, Scheduler};
use butlers_storage::memory::{
    MemoryActionStore, MemoryInboxStore, MemoryQueueStore, MemoryRegistryStore,
    MemoryRoutingLogStore, MemorySessionStore, MemoryStateStore, MemoryTaskStore,
    MemoryConnectorStore,
};
use butlers_storage::postgres::{
    PgActionStore, PgConnectorStore, PgInboxStore, PgQueueStore, PgRegistryStore,
    PgRoutingLogStore, PgSessionStore, PgStateStore, PgTaskStore,
};
use butlers_storage::{
    ActionStore, ConnectorStore, CredentialStore, Database, EligibilityState, InboxStore,
    MigrationRunner, QueueStore, RegistryRecord, RegistryStore, RoutingLogStore, Secret,
    SessionStore, StateStore, TaskStore, butler_chain, core_chain,
};
use butlers_approval::ApprovalsEngine;
use chrono::Utc;
use jsonrpsee::server::ServerHandle;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::mesh::{JsonRpcMeshConnector, SwitchboardClient};
use crate::module::{Module, ModuleLoader};
use crate::pipeline::{SpawnerClassifierInvoker, SpawnerPromptDispatcher, SwitchboardPipeline};
use crate::rpc::{RpcImpl, SwitchboardServices, start_listener};
use crate::tools::{
    NotifyTool, RemindTool, RouteExecuteTool, ScheduleTool, SessionListTool, StateOp, StateTool,
    StatusTool, TickTool, ToolRegistry, TriggerTool,
};

/// Core API keys injected into every butler's sandbox when resolvable.
const CORE_SECRET_NAMES: &[&str] = &["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY"];

/// How the daemon persists state.
pub enum StorageMode {
    /// Postgres per the resolved settings.
    Postgres(DbSettings),
    /// In-memory stores (development and tests).
    Memory,
}

struct SharedStores {
    inbox: Arc<dyn InboxStore>,
    queue: Arc<dyn QueueStore>,
    registry: Arc<dyn RegistryStore>,
    connectors: Arc<dyn ConnectorStore>,
    routing_log: Arc<dyn RoutingLogStore>,
}

struct ButlerStores {
    sessions: Arc<dyn SessionStore>,
    state: Arc<dyn StateStore>,
    actions: Arc<dyn ActionStore>,
    tasks: Arc<dyn TaskStore>,
    db: Option<Arc<Database>>,
}

/// One running butler.
pub struct ButlerHandle {
    /// Butler name.
    pub name: ButlerName,
    /// Actual mesh listener address.
    pub addr: SocketAddr,
    /// The butler's spawner.
    pub spawner: Arc<Spawner>,
    /// The butler's scheduler.
    pub scheduler: Arc<Scheduler>,
    /// The butler's approvals engine.
    pub approvals: Arc<ApprovalsEngine>,
    /// The butler's tool registry.
    pub tools: Arc<ToolRegistry>,
    server: ServerHandle,
    modules: ModuleLoader,
    db: Option<Arc<Database>>,
}

/// Switchboard-side handles shared across the fleet.
pub struct SwitchboardShared {
    /// The ingest API.
    pub ingest: Arc<IngestApi>,
    /// The authoritative registry.
    pub registry: Arc<ButlerRegistry>,
    /// Connector monitoring.
    pub connectors: Arc<ConnectorMonitor>,
    /// The message inbox.
    pub inbox: Arc<dyn InboxStore>,
    /// The routing/fanout logs.
    pub routing_log: Arc<dyn RoutingLogStore>,
}

/// The running fleet.
pub struct Daemon {
    butlers: Vec<ButlerHandle>,
    /// Shared switchboard services.
    pub switchboard: SwitchboardShared,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

// Native jobs wired at startup.

struct RegistrySweepJob {
    registry: Arc<ButlerRegistry>,
}

#[async_trait::async_trait]
impl NativeJob for RegistrySweepJob {
    async fn run(&self, _args: Value) -> Result<Value, String> {
        let swept = self.registry.sweep(Utc::now()).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "transitioned": swept.len() }))
    }
}

struct ConnectorRollupJob {
    connectors: Arc<ConnectorMonitor>,
}

#[async_trait::async_trait]
impl NativeJob for ConnectorRollupJob {
    async fn run(&self, _args: Value) -> Result<Value, String> {
        let folded = self.connectors.rollup(Utc::now()).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "folded": folded }))
    }
}

struct ApprovalsExpireJob {
    engine: Arc<ApprovalsEngine>,
}

#[async_trait::async_trait]
impl NativeJob for ApprovalsExpireJob {
    async fn run(&self, _args: Value) -> Result<Value, String> {
        let expired = self.engine.expire_due(Utc::now()).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "expired": expired.len() }))
    }
}

impl Daemon {
    /// Start the whole fleet in this process.
    ///
    /// `modules` maps declared module names to implementations; declared
    /// names without an implementation are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Fatal on config, storage, listener, or module-graph failures;
    /// individual module startup failures are tracked, not fatal.
    pub async fn start(
        roster: &RosterConfig,
        mode: &StorageMode,
        adapter: Arc<dyn RuntimeAdapter>,
        modules: &HashMap<String, Arc<dyn Module>>,
    ) -> DaemonResult<Self> {
        let tunables = &roster.daemon;
        let switchboard_cfg = roster
            .switchboard()
            .ok_or_else(|| {
                DaemonError::Config(butlers_config::ConfigError::Invalid(
                    "roster has no switchboard".to_string(),
                ))
            })?
            .clone();

        // Shared backbone: switchboard pool, core chain, shared stores.
        let (shared, credentials, switchboard_db) =
            Self::open_shared(mode, &switchboard_cfg).await?;

        let registry = Arc::new(ButlerRegistry::new(
            Arc::clone(&shared.registry),
            tunables.quarantine_threshold,
            tunables.quarantine_window_s,
        ));
        let connectors = Arc::new(ConnectorMonitor::new(Arc::clone(&shared.connectors)));
        let buffer = Arc::new(IngressBuffer::new(tunables.queue_capacity));
        let ingest = Arc::new(IngestApi::new(
            Arc::clone(&shared.inbox),
            Arc::clone(&shared.queue),
            Arc::clone(&buffer),
        ));

        let mesh_connector = Arc::new(JsonRpcMeshConnector::new(Duration::from_secs(
            tunables.route_timeout_s,
        )));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            mesh_connector,
            Arc::clone(&shared.routing_log),
            Duration::from_secs(tunables.route_timeout_s),
        ));
        let messenger: ButlerName = roster
            .butlers
            .iter()
            .find(|b| b.name.as_str() == "messenger")
            .map_or_else(|| "messenger".into(), |b| b.name.clone());
        let notify = Arc::new(NotifyExecutor::new(Arc::clone(&router), messenger.clone()));

        let cancel = CancellationToken::new();
        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        let mut butlers: Vec<ButlerHandle> = Vec::new();
        let mut switchboard_spawner: Option<Arc<Spawner>> = None;
        let mut switchboard_addr: Option<SocketAddr> = None;

        // Switchboard first: its spawner backs the classifier, and peers
        // register against its listener.
        let mut ordered: Vec<&ButlerConfig> = roster.butlers.iter().collect();
        ordered.sort_by_key(|b| b.name.as_str() != "switchboard");

        for butler_cfg in ordered {
            let is_switchboard = butler_cfg.name.as_str() == "switchboard";
            let stores = Self::open_butler(mode, butler_cfg, switchboard_db.as_ref()).await?;
            let secrets = Self::resolve_secrets(&credentials, butler_cfg).await;

            let spawner = Arc::new(Spawner::new(
                SpawnerConfig {
                    butler: butler_cfg.name.clone(),
                    port: butler_cfg.port,
                    model: butler_cfg.model.clone(),
                    adapter_timeout: Duration::from_secs(tunables.adapter_timeout_s),
                    max_queued: tunables.max_queued,
                    roster_dir: tunables.roster_dir.clone(),
                },
                Arc::clone(&adapter),
                Arc::clone(&stores.sessions),
                secrets,
            ));

            let approvals = Arc::new(ApprovalsEngine::new(
                butler_cfg.name.clone(),
                Arc::clone(&stores.actions),
                3600,
            ));

            let mut jobs = JobRegistry::new();
            jobs.register(
                "approvals_expire",
                Arc::new(ApprovalsExpireJob {
                    engine: Arc::clone(&approvals),
                }),
            );
            if is_switchboard {
                jobs.register(
                    "registry_sweep",
                    Arc::new(RegistrySweepJob {
                        registry: Arc::clone(&registry),
                    }),
                );
                jobs.register(
                    "connector_stats_rollup",
                    Arc::new(ConnectorRollupJob {
                        connectors: Arc::clone(&connectors),
                    }),
                );
            }

            let scheduler = Arc::new(Scheduler::new(
                butler_cfg.name.clone(),
                Arc::clone(&stores.tasks),
                jobs,
                Arc::new(SpawnerPromptDispatcher {
                    spawner: Arc::clone(&spawner),
                }),
                Arc::clone(&stores.sessions),
            ));
            scheduler.load_schedules(&butler_cfg.schedules, Utc::now()).await?;

            // Modules: migrations first, then topological startup.
            let mut loader = ModuleLoader::new();
            for name in &butler_cfg.modules {
                match modules.get(name) {
                    Some(module) => loader.add(Arc::clone(module)),
                    None => warn!(butler = %butler_cfg.name, module = %name,
                        "declared module has no linked implementation"),
                }
            }
            if let Some(db) = &stores.db {
                let runner = MigrationRunner::new(db.pool().clone());
                for (module_name, chain) in loader.migration_chains()? {
                    runner
                        .run_chain(&format!("module:{}:{module_name}", butler_cfg.schema), &chain)
                        .await?;
                }
            }

            let mut tools = ToolRegistry::new()
                .with_egress_policy(butler_cfg.name.clone(), messenger.clone());
            tools.register(Arc::new(StatusTool {
                butler: butler_cfg.name.clone(),
                started_at: Utc::now(),
            }));
            tools.register(Arc::new(TriggerTool {
                spawner: Arc::clone(&spawner),
            }));
            tools.register(Arc::new(RouteExecuteTool {
                gate: RouteCallGate::new(&butler_cfg.trusted_route_callers),
                spawner: Arc::clone(&spawner),
            }));
            tools.register(Arc::new(TickTool {
                scheduler: Arc::clone(&scheduler),
            }));
            tools.register(Arc::new(NotifyTool {
                notify: Arc::clone(&notify),
            }));
            tools.register(Arc::new(RemindTool {
                spawner: Arc::clone(&spawner),
            }));
            for operation in [StateOp::Get, StateOp::Set, StateOp::Delete] {
                tools.register(Arc::new(StateTool {
                    state: Arc::clone(&stores.state),
                    operation,
                }));
            }
            for listing in [true, false] {
                tools.register(Arc::new(ScheduleTool {
                    scheduler: Arc::clone(&scheduler),
                    listing,
                }));
            }
            tools.register(Arc::new(SessionListTool {
                sessions: Arc::clone(&stores.sessions),
            }));

            loader.start_all(&mut tools).await?;

            for gate in &butler_cfg.gated_tools {
                match butlers_storage::RiskTier::parse(&gate.risk_tier) {
                    Some(tier) => tools.apply_gate(&gate.tool, Arc::clone(&approvals), tier),
                    None => warn!(butler = %butler_cfg.name, tool = %gate.tool,
                        tier = %gate.risk_tier, "unknown risk tier; gate skipped"),
                }
            }
            let tools = Arc::new(tools);

            let rpc_impl = RpcImpl {
                butler: butler_cfg.name.clone(),
                started_at: Utc::now(),
                tools: Arc::clone(&tools),
                spawner: Arc::clone(&spawner),
                scheduler: Arc::clone(&scheduler),
                switchboard: is_switchboard.then(|| SwitchboardServices {
                    registry: Arc::clone(&registry),
                    connectors: Arc::clone(&connectors),
                    ingest: Arc::clone(&ingest),
                }),
            };
            let (server, addr) = start_listener(butler_cfg.port, rpc_impl).await?;

            let record = RegistryRecord {
                name: butler_cfg.name.clone(),
                endpoint_url: format!("http://{addr}"),
                route_contract_min: 1,
                route_contract_max: 1,
                capabilities: tools.names(),
                description: butler_cfg.description.clone(),
                eligibility_state: EligibilityState::Active,
                last_heartbeat_at: Utc::now(),
                liveness_ttl_s: i64::try_from(tunables.liveness_ttl_s).unwrap_or(180),
                quarantine_reason: None,
                first_seen_at: Utc::now(),
            };

            if is_switchboard {
                // The switchboard owns the registry; it registers and
                // heartbeats itself directly.
                registry.register(record).await?;
                switchboard_spawner = Some(Arc::clone(&spawner));
                switchboard_addr = Some(addr);
                let registry_loop = Arc::clone(&registry);
                let name = butler_cfg.name.clone();
                let cancel_loop = cancel.clone();
                let interval = Duration::from_secs(tunables.heartbeat_interval_s);
                loops.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            () = cancel_loop.cancelled() => return,
                            _ = ticker.tick() => {},
                        }
                        if let Err(e) = registry_loop.heartbeat(&name, Utc::now()).await {
                            warn!(error = %e, "switchboard self-heartbeat failed");
                        }
                    }
                }));
            } else {
                // Peers exercise the real mesh path over loopback.
                let switchboard_url = format!(
                    "http://{}",
                    switchboard_addr.expect("switchboard starts first")
                );
                match SwitchboardClient::connect(
                    &switchboard_url,
                    Duration::from_secs(tunables.route_timeout_s),
                ) {
                    Ok(client) => {
                        let reporter = LivenessReporter::new(
                            Arc::new(client),
                            record,
                            Duration::from_secs(tunables.heartbeat_interval_s),
                        );
                        loops.push(tokio::spawn(reporter.run(cancel.clone())));
                    },
                    Err(e) => warn!(butler = %butler_cfg.name, error = %e,
                        "liveness reporter could not connect"),
                }
            }

            // Scheduler ticker.
            {
                let scheduler = Arc::clone(&scheduler);
                let cancel_loop = cancel.clone();
                let name = butler_cfg.name.clone();
                loops.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(30));
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            () = cancel_loop.cancelled() => return,
                            _ = ticker.tick() => {},
                        }
                        if let Err(e) = scheduler.tick(Utc::now()).await {
                            warn!(butler = %name, error = %e, "scheduler tick failed");
                        }
                    }
                }));
            }

            butlers.push(ButlerHandle {
                name: butler_cfg.name.clone(),
                addr,
                spawner,
                scheduler,
                approvals,
                tools,
                server,
                modules: loader,
                db: stores.db,
            });
            info!(butler = %butler_cfg.name, %addr, "butler up");
        }

        // The switchboard's ingest workers and scanner.
        let classifier_spawner = switchboard_spawner.expect("switchboard configured");
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&registry),
            Arc::new(SpawnerClassifierInvoker {
                spawner: classifier_spawner,
            }),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&router) as Arc<dyn butlers_routing::SubrequestRunner>,
            Arc::clone(&shared.routing_log),
            Arc::clone(&shared.inbox),
            Duration::from_secs(tunables.route_timeout_s),
        ));
        let pipeline = Arc::new(SwitchboardPipeline {
            classifier,
            dispatcher,
            inbox: Arc::clone(&shared.inbox),
        });
        for worker_id in 0..tunables.worker_count {
            loops.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&buffer),
                Arc::clone(&shared.queue),
                Arc::clone(&shared.inbox),
                Arc::clone(&pipeline) as Arc<dyn butlers_ingress::IngressProcessor>,
                cancel.clone(),
            )));
        }
        loops.push(tokio::spawn(run_scanner(
            Duration::from_secs(tunables.scanner_interval_s),
            Duration::from_secs(tunables.scanner_grace_s),
            tunables.scanner_batch_size,
            Arc::clone(&shared.queue),
            Arc::clone(&buffer),
            cancel.clone(),
        )));

        info!(butlers = butlers.len(), "fleet started");
        Ok(Self {
            butlers,
            switchboard: SwitchboardShared {
                ingest,
                registry,
                connectors,
                inbox: shared.inbox,
                routing_log: shared.routing_log,
            },
            cancel,
            loops,
            shutdown_timeout: Duration::from_secs(tunables.shutdown_timeout_s),
        })
    }

    async fn open_shared(
        mode: &StorageMode,
        switchboard: &ButlerConfig,
    ) -> DaemonResult<(SharedStores, CredentialStore, Option<Arc<Database>>)> {
        match mode {
            StorageMode::Postgres(settings) => {
                let db = Arc::new(Database::connect(settings, &switchboard.schema).await?);
                let runner = MigrationRunner::new(db.pool().clone());
                runner.run_chain("core", &core_chain()).await?;
                let shared = SharedStores {
                    inbox: Arc::new(PgInboxStore::new(db.pool().clone())),
                    queue: Arc::new(PgQueueStore::new(db.pool().clone())),
                    registry: Arc::new(PgRegistryStore::new(db.pool().clone())),
                    connectors: Arc::new(PgConnectorStore::new(db.pool().clone())),
                    routing_log: Arc::new(PgRoutingLogStore::new(db.pool().clone())),
                };
                let credentials =
                    CredentialStore::new(db.pool().clone(), settings.credential_schema.clone());
                Ok((shared, credentials, Some(db)))
            },
            StorageMode::Memory => {
                let shared = SharedStores {
                    inbox: Arc::new(MemoryInboxStore::new()),
                    queue: Arc::new(MemoryQueueStore::new()),
                    registry: Arc::new(MemoryRegistryStore::new()),
                    connectors: Arc::new(MemoryConnectorStore::new()),
                    routing_log: Arc::new(MemoryRoutingLogStore::new()),
                };
                Ok((shared, CredentialStore::env_only(), None))
            },
        }
    }

    async fn open_butler(
        mode: &StorageMode,
        butler: &ButlerConfig,
        _switchboard_db: Option<&Arc<Database>>,
    ) -> DaemonResult<ButlerStores> {
        match mode {
            StorageMode::Postgres(settings) => {
                let db = Arc::new(Database::connect(settings, &butler.schema).await?);
                let runner = MigrationRunner::new(db.pool().clone());
                runner
                    .run_chain(&format!("butler:{}", butler.schema), &butler_chain(&butler.schema))
                    .await?;
                Ok(ButlerStores {
                    sessions: Arc::new(PgSessionStore::new(db.pool().clone())),
                    state: Arc::new(PgStateStore::new(db.pool().clone())),
                    actions: Arc::new(PgActionStore::new(db.pool().clone())),
                    tasks: Arc::new(PgTaskStore::new(db.pool().clone())),
                    db: Some(db),
                })
            },
            StorageMode::Memory => Ok(ButlerStores {
                sessions: Arc::new(MemorySessionStore::new()),
                state: Arc::new(MemoryStateStore::new()),
                actions: Arc::new(MemoryActionStore::new()),
                tasks: Arc::new(MemoryTaskStore::new()),
                db: None,
            }),
        }
    }

    async fn resolve_secrets(
        credentials: &CredentialStore,
        butler: &ButlerConfig,
    ) -> Vec<(String, Secret)> {
        let mut names: Vec<String> =
            CORE_SECRET_NAMES.iter().map(ToString::to_string).collect();
        // Declared modules contribute their credential by convention.
        for module in &butler.modules {
            names.push(format!("{}_API_KEY", module.to_uppercase()));
        }

        let mut secrets = Vec::new();
        for name in names {
            match credentials.resolve(butler.name.as_str(), &name).await {
                Ok(Some(secret)) => secrets.push((name, secret)),
                Ok(None) => {},
                Err(e) => warn!(butler = %butler.name, %name, error = %e, "secret resolution failed"),
            }
        }
        secrets
    }

    /// Handle for one butler.
    #[must_use]
    pub fn butler(&self, name: &str) -> Option<&ButlerHandle> {
        self.butlers.iter().find(|b| b.name.as_str() == name)
    }

    /// All butler handles.
    #[must_use]
    pub fn butlers(&self) -> &[ButlerHandle] {
        &self.butlers
    }

    /// Shut the fleet down in reverse order.
    pub async fn shutdown(self) {
        info!("fleet shutting down");
        // Stop background loops first so nothing new is admitted.
        self.cancel.cancel();
        for task in self.loops {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("background loop did not stop in time");
            }
        }

        // Drain in-flight sessions within the budget.
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for handle in &self.butlers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !handle.spawner.drain(remaining).await {
                warn!(butler = %handle.name, "session still in flight at shutdown deadline");
            }
        }

        // Reverse startup order: modules, listener, pool.
        for handle in self.butlers.into_iter().rev() {
            handle.modules.shutdown_all().await;
            if handle.server.stop().is_err() {
                warn!(butler = %handle.name, "listener already stopped");
            }
            handle.server.stopped().await;
            if let Some(db) = handle.db {
                db.close().await;
            }
            info!(butler = %handle.name, "butler down");
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("butlers", &self.butlers.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ButlerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ButlerHandle")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

//! Butler modules and the topological loader.
//!
//! A module is a small capability set, composed rather than inherited:
//! a name, dependencies, migration revisions, startup/shutdown hooks, and
//! tool registration. Startup failures are non-fatal for the butler: the
//! failed module is marked `failed`, its dependents become
//! `cascade_failed` without being invoked, and core tools remain.

use async_trait::async_trait;
use butlers_storage::Migration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::tools::ToolRegistry;

/// Lifecycle state of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleState {
    /// Started successfully.
    Started,
    /// Its own startup hook failed.
    Failed(String),
    /// A dependency failed, so this module was never invoked.
    CascadeFailed {
        /// The failed dependency.
        dependency: String,
    },
}

/// One butler module.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Names of modules that must start before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Schema migration chain contributed by this module.
    fn migration_revisions(&self) -> Vec<Migration> {
        Vec::new()
    }

    /// Startup hook.
    async fn on_startup(&self) -> Result<(), String>;

    /// Shutdown hook (best-effort, reverse start order).
    async fn on_shutdown(&self) {}

    /// Register this module's tools.
    fn register_tools(&self, _tools: &mut ToolRegistry) {}
}

/// Loads modules in dependency order, tracking cascade failures.
#[derive(Default)]
pub struct ModuleLoader {
    modules: Vec<Arc<dyn Module>>,
    states: HashMap<String, ModuleState>,
    start_order: Vec<String>,
}

impl ModuleLoader {
    /// Create an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module.
    pub fn add(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    /// Topologically sort the declared modules.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ModuleGraph`] on unknown dependencies or
    /// cycles.
    fn sorted(&self) -> DaemonResult<Vec<Arc<dyn Module>>> {
        let by_name: HashMap<&str, &Arc<dyn Module>> =
            self.modules.iter().map(|m| (m.name(), m)).collect();

        for module in &self.modules {
            for dep in module.dependencies() {
                if !by_name.contains_key(dep.as_str()) {
                    return Err(DaemonError::ModuleGraph(format!(
                        "module '{}' depends on unknown module '{dep}'",
                        module.name()
                    )));
                }
            }
        }

        let mut sorted: Vec<Arc<dyn Module>> = Vec::with_capacity(self.modules.len());
        let mut placed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&Arc<dyn Module>> = self.modules.iter().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|module| {
                let ready = module.dependencies().iter().all(|d| placed.contains(d));
                if ready {
                    placed.insert(module.name().to_string());
                    sorted.push(Arc::clone(module));
                }
                !ready
            });
            if remaining.len() == before {
                let names: Vec<&str> = remaining.iter().map(|m| m.name()).collect();
                return Err(DaemonError::ModuleGraph(format!(
                    "dependency cycle among modules: {names:?}"
                )));
            }
        }
        Ok(sorted)
    }

    /// Collected migration chains in start order (run before startup hooks).
    ///
    /// # Errors
    ///
    /// See [`DaemonError::ModuleGraph`].
    pub fn migration_chains(&self) -> DaemonResult<Vec<(String, Vec<Migration>)>> {
        Ok(self
            .sorted()?
            .iter()
            .map(|m| (m.name().to_string(), m.migration_revisions()))
            .filter(|(_, chain)| !chain.is_empty())
            .collect())
    }

    /// Start every module in dependency order.
    ///
    /// A failure marks the module `failed` and all transitive dependents
    /// `cascade_failed`; the butler keeps running either way.
    ///
    /// # Errors
    ///
    /// Only graph errors are fatal; startup failures are absorbed into
    /// module states.
    pub async fn start_all(&mut self, tools: &mut ToolRegistry) -> DaemonResult<()> {
        let sorted = self.sorted()?;
        for module in sorted {
            let name = module.name().to_string();

            // A failed dependency cascades without invoking this module.
            let failed_dep = module.dependencies().into_iter().find(|dep| {
                matches!(
                    self.states.get(dep),
                    Some(ModuleState::Failed(_) | ModuleState::CascadeFailed { .. })
                )
            });
            if let Some(dependency) = failed_dep {
                warn!(module = %name, %dependency, "module cascade-failed");
                self.states
                    .insert(name, ModuleState::CascadeFailed { dependency });
                continue;
            }

            match module.on_startup().await {
                Ok(()) => {
                    module.register_tools(tools);
                    info!(module = %name, "module started");
                    self.start_order.push(name.clone());
                    self.states.insert(name, ModuleState::Started);
                },
                Err(reason) => {
                    warn!(module = %name, %reason, "module startup failed");
                    self.states.insert(name, ModuleState::Failed(reason));
                },
            }
        }
        Ok(())
    }

    /// Shut started modules down in reverse start order.
    pub async fn shutdown_all(&self) {
        let by_name: HashMap<&str, &Arc<dyn Module>> =
            self.modules.iter().map(|m| (m.name(), m)).collect();
        for name in self.start_order.iter().rev() {
            if let Some(module) = by_name.get(name.as_str()) {
                module.on_shutdown().await;
                info!(module = %name, "module stopped");
            }
        }
    }

    /// The state of one module.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&ModuleState> {
        self.states.get(name)
    }

    /// All module states.
    #[must_use]
    pub fn states(&self) -> &HashMap<String, ModuleState> {
        &self.states
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("modules", &self.modules.len())
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

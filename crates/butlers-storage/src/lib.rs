//! Butlers Storage - Persistence layer for the butler orchestration core.
//!
//! This crate provides:
//! - [`Database`]: a per-butler Postgres pool with schema-scoped
//!   `search_path` and a statement timeout
//! - Migration chains (core → butler → module) tracked in
//!   `shared.schema_migrations`
//! - [`CredentialStore`]: named secret resolution, DB-first with env
//!   fallback
//! - Store traits for every persisted shape in the system, each with a
//!   Postgres implementation and an in-memory implementation carrying the
//!   same CAS and uniqueness semantics
//!
//! The in-memory stores back the test suite and the `mem:` development
//! mode; nothing in the workspace requires a live Postgres to test.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod credentials;
pub mod db;
pub mod error;
pub mod memory;
pub mod migrate;
pub mod postgres;
pub mod records;
pub mod stores;

pub use credentials::{CredentialStore, Secret};
pub use db::Database;
pub use error::{StorageError, StorageResult};
pub use migrate::{Migration, MigrationRunner, butler_chain, core_chain};
pub use records::{
    ActionStatus, ApprovalEvent, ConnectorRecord, EligibilityState, EligibilityTransition,
    FanoutLogRecord, InboxRecord, InboxStatus, NewInboxRecord, PendingActionRecord, QueueItem,
    RegistryRecord, RiskTier, RoutingLogRecord, SessionCompletion, SessionRecord, SessionStatus,
    TaskRecord, TriggerAuditRecord,
};
pub use stores::{
    ActionStore, ConnectorStore, InboxStore, QueueStore, RegistryStore, RoutingLogStore,
    SessionStore, StateStore, TaskStore,
};

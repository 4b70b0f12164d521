//! Storage traits and implementations
//!
//! This module defines the storage abstraction layer for mailbox state.
//! The trait-based design allows swapping between the in-memory and the
//! SQLite backend; the choice is made once, at startup.

mod batch;
mod memory;
mod sqlite;
mod traits;

use anyhow::Context;
use std::sync::Arc;

pub use batch::{PartitionOutcome, RecentReset, run_partitioned};
pub use memory::InMemoryMailboxStore;
pub use sqlite::SqliteMailboxStore;
pub use traits::{ChangeLogStore, ChangePageRequest, MessageStore, PageRequest, SequenceProvider};

use crate::config::{BackendKind, StoreConfig};
use crate::health::{HealthCheck, InMemoryHealthCheck, SqliteHealthCheck};

/// One backend seen through every storage contract
#[derive(Clone)]
pub struct MailboxBackend {
    pub sequences: Arc<dyn SequenceProvider>,
    pub messages: Arc<dyn MessageStore>,
    pub changes: Arc<dyn ChangeLogStore>,
    pub health: Arc<dyn HealthCheck>,
}

impl MailboxBackend {
    /// Wire every contract to the same in-memory store
    pub fn in_memory(store: Arc<InMemoryMailboxStore>) -> Self {
        Self {
            sequences: store.clone(),
            messages: store.clone(),
            changes: store.clone(),
            health: Arc::new(InMemoryHealthCheck::new(store)),
        }
    }

    /// Wire every contract to the same SQLite store
    pub fn sqlite(store: Arc<SqliteMailboxStore>, health_check_timeout: std::time::Duration) -> Self {
        let health = SqliteHealthCheck::new(store.path(), health_check_timeout);
        Self {
            sequences: store.clone(),
            messages: store.clone(),
            changes: store,
            health: Arc::new(health),
        }
    }

    /// Open the backend selected by `config`
    pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        config.validate()?;
        match config.backend {
            BackendKind::Memory => Ok(Self::in_memory(Arc::new(
                InMemoryMailboxStore::with_max_list_predicate(config.in_clause_max_size),
            ))),
            BackendKind::Sqlite => {
                let path = config
                    .database_path
                    .as_ref()
                    .context("The sqlite backend requires database_path")?;
                let store = SqliteMailboxStore::open(
                    path,
                    config.operation_timeout(),
                    config.in_clause_max_size,
                )?;
                Ok(Self::sqlite(Arc::new(store), config.health_check_timeout()))
            }
        }
    }
}

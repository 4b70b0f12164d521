//! Backend health probes
//!
//! A probe makes exactly one bounded call to its backend and maps the outcome
//! to a [`Status`]. There is no retry and no memory between probes: the
//! caller polls, and recovery shows up on the first probe that succeeds.

use log::warn;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::storage::InMemoryMailboxStore;

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Healthy,
    /// Reachable but too slow to answer within the probe deadline
    Degraded,
    Unhealthy,
}

/// Result of a health check for one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub component: String,
    pub status: Status,
    pub cause: Option<String>,
}

impl HealthStatus {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: Status::Healthy,
            cause: None,
        }
    }

    pub fn degraded(component: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: Status::Degraded,
            cause: Some(cause.into()),
        }
    }

    pub fn unhealthy(component: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: Status::Unhealthy,
            cause: Some(cause.into()),
        }
    }

    /// Map a probe outcome: a missed deadline degrades, any other error is fatal
    pub fn from_probe(component: &str, outcome: Result<()>) -> Self {
        let status = match outcome {
            Ok(()) => return Self::healthy(component),
            Err(e @ StoreError::Timeout { .. }) => Self::degraded(component, e.to_string()),
            Err(e) => Self::unhealthy(component, e.to_string()),
        };
        warn!(
            "[HEALTH] {} is {:?}: {}",
            component,
            status.status,
            status.cause.as_deref().unwrap_or("unknown cause")
        );
        status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Status::Healthy
    }
}

/// A probe of one backend dependency
pub trait HealthCheck: Send + Sync {
    fn component_name(&self) -> &str;

    /// Probe the backend once
    fn check(&self) -> HealthStatus;
}

/// Probes a SQLite database file through a fresh read-only connection
pub struct SqliteHealthCheck {
    db_path: PathBuf,
    timeout: Duration,
}

impl SqliteHealthCheck {
    pub fn new(db_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            timeout,
        }
    }

    fn probe(&self) -> Result<()> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.timeout)?;
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(())
    }
}

impl HealthCheck for SqliteHealthCheck {
    fn component_name(&self) -> &str {
        "SQLite"
    }

    fn check(&self) -> HealthStatus {
        HealthStatus::from_probe(self.component_name(), self.probe())
    }
}

/// Probes the in-memory store
pub struct InMemoryHealthCheck {
    store: Arc<InMemoryMailboxStore>,
}

impl InMemoryHealthCheck {
    pub fn new(store: Arc<InMemoryMailboxStore>) -> Self {
        Self { store }
    }
}

impl HealthCheck for InMemoryHealthCheck {
    fn component_name(&self) -> &str {
        "in-memory store"
    }

    fn check(&self) -> HealthStatus {
        HealthStatus::from_probe(self.component_name(), self.store.ping())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteMailboxStore;
    use tempfile::TempDir;

    #[test]
    fn test_probe_mapping() {
        assert_eq!(HealthStatus::from_probe("db", Ok(())).status, Status::Healthy);

        let slow = HealthStatus::from_probe(
            "db",
            Err(StoreError::Timeout {
                message: "database is locked".to_string(),
            }),
        );
        assert_eq!(slow.status, Status::Degraded);
        assert!(slow.cause.unwrap().contains("locked"));

        let down = HealthStatus::from_probe("db", Err(StoreError::unavailable("refused")));
        assert_eq!(down.status, Status::Unhealthy);
        assert_eq!(down.component, "db");
    }

    #[test]
    fn test_in_memory_recovers_on_next_probe() {
        let store = Arc::new(InMemoryMailboxStore::new());
        let check = InMemoryHealthCheck::new(store.clone());
        assert!(check.check().is_healthy());

        store.set_available(false);
        assert_eq!(check.check().status, Status::Unhealthy);

        store.set_available(true);
        assert!(check.check().is_healthy());
    }

    #[test]
    fn test_sqlite_missing_file_is_unhealthy() {
        let dir = TempDir::new().unwrap();
        let check = SqliteHealthCheck::new(dir.path().join("absent.db"), Duration::from_millis(100));
        let status = check.check();
        assert_eq!(status.status, Status::Unhealthy);
        assert!(status.cause.is_some());
        assert!(!dir.path().join("absent.db").exists());
    }

    #[test]
    fn test_sqlite_open_database_is_healthy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mail.db");
        let _store = SqliteMailboxStore::open(&path, Duration::from_secs(1), 10).unwrap();

        let check = SqliteHealthCheck::new(&path, Duration::from_millis(500));
        assert_eq!(check.component_name(), "SQLite");
        assert!(check.check().is_healthy());
    }
}

//! Mailstore - consistency core of a multi-backend mailbox store
//!
//! This crate provides the pieces IMAP and JMAP front ends rely on for
//! correct mailbox state:
//! - Per-mailbox UID and modification sequence allocation
//! - Conditional flag updates and batched recent/delete operations
//! - Lazy, cursor-paginated scans of mailbox contents
//! - A per-account change log with gapless states and expiry
//! - Health probes for the configured backend
//!
//! Two backends implement the storage contracts: an in-memory store for
//! tests and embedding, and a SQLite store for persistence. The API is
//! synchronous and executor-agnostic.

pub mod changes;
pub mod config;
pub mod error;
pub mod flags;
pub mod health;
pub mod models;
pub mod scan;
pub mod service;
pub mod storage;

pub use changes::ChangeLogRepository;
pub use config::{BackendKind, StoreConfig};
pub use error::{FailedPartition, PartialBatchFailure, Result, SequenceKind, StoreError};
pub use flags::{FlagsMutationEngine, FlagsUpdateMode, FlagsUpdateRequest};
pub use health::{HealthCheck, HealthStatus, Status};
pub use models::{
    AccountId, ChangeDraft, ChangeRecord, ChangesPage, FetchType, Flags, Limit, MailboxCounters,
    MailboxId, MailboxMessage, MessageId, MessageMetadata, MessageRange, MessageUid, ModSeq,
    ScanFilter, State, SystemFlag, ThreadId,
};
pub use scan::{MessageScanner, Paginated};
pub use service::{AppendRequest, MailboxService};
pub use storage::{
    ChangeLogStore, InMemoryMailboxStore, MailboxBackend, MessageStore, RecentReset,
    SequenceProvider, SqliteMailboxStore,
};

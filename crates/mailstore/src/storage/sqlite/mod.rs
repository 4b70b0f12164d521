//! SQLite-backed mailbox store
//!
//! One connection guarded by a mutex serves all calls from this process.
//! Other processes may share the file: every write runs in an IMMEDIATE
//! transaction and waits at most the configured deadline for the lock.

mod changes;
mod messages;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::SequenceProvider;
use crate::error::{Result, SequenceKind, StoreError};
use crate::models::{MailboxId, MessageUid, ModSeq};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: mailboxes and messages
        M::up(
            r#"
            -- Per-mailbox allocation counters
            CREATE TABLE mailbox_counters (
                mailbox_id TEXT PRIMARY KEY,
                last_uid INTEGER NOT NULL DEFAULT 0,
                highest_mod_seq INTEGER NOT NULL DEFAULT 0
            );

            -- Message content, zstd compressed, shared by every mailbox
            -- the message is linked into
            CREATE TABLE message_contents (
                message_id TEXT PRIMARY KEY,
                content BLOB NOT NULL
            );

            CREATE TABLE mailbox_messages (
                mailbox_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                mod_seq INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                internal_date TEXT NOT NULL,
                size INTEGER NOT NULL,
                save_date TEXT,
                answered INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                draft INTEGER NOT NULL DEFAULT 0,
                flagged INTEGER NOT NULL DEFAULT 0,
                recent INTEGER NOT NULL DEFAULT 0,
                seen INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (mailbox_id, uid)
            ) WITHOUT ROWID;

            CREATE INDEX idx_mailbox_messages_message_id
                ON mailbox_messages(message_id);

            -- Keyword flags (one row per flag so ADD/REMOVE are set-level)
            CREATE TABLE message_user_flags (
                mailbox_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                flag TEXT NOT NULL,
                PRIMARY KEY (mailbox_id, uid, flag),
                FOREIGN KEY (mailbox_id, uid)
                    REFERENCES mailbox_messages(mailbox_id, uid) ON DELETE CASCADE
            ) WITHOUT ROWID;
            "#,
        ),
        // Migration 2: change log
        M::up(
            r#"
            -- Latest-state pointers; never expire
            CREATE TABLE change_log_heads (
                account_id TEXT PRIMARY KEY,
                latest INTEGER NOT NULL,
                latest_not_delegated INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE changes (
                account_id TEXT NOT NULL,
                state INTEGER NOT NULL,
                date TEXT NOT NULL,
                is_count_change INTEGER NOT NULL DEFAULT 0,
                is_delegated INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL DEFAULT '[]',
                updated TEXT NOT NULL DEFAULT '[]',
                destroyed TEXT NOT NULL DEFAULT '[]',
                expires_at INTEGER,
                PRIMARY KEY (account_id, state)
            ) WITHOUT ROWID;

            CREATE INDEX idx_changes_expires_at
                ON changes(expires_at) WHERE expires_at IS NOT NULL;
            "#,
        ),
    ])
}

/// SQLite implementation of every storage contract
pub struct SqliteMailboxStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    max_list_predicate: usize,
}

impl SqliteMailboxStore {
    /// Open (creating if needed) the database at `db_path`
    ///
    /// - `operation_timeout`: how long a call waits for a lock held by
    ///   another connection before failing with a timeout
    /// - `max_list_predicate`: largest `IN (...)` list sent in one statement
    pub fn open(
        db_path: impl AsRef<Path>,
        operation_timeout: Duration,
        max_list_predicate: usize,
    ) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;

        conn.busy_timeout(operation_timeout)
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .context("Failed to configure database")?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        info!("[STORE] Opened SQLite store at {:?}", db_path);

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            max_list_predicate: max_list_predicate.max(1),
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::unavailable("SQLite connection lock poisoned"))
    }

    fn bump_counter(&self, mailbox_id: &MailboxId, kind: SequenceKind) -> Result<u64> {
        let sql = match kind {
            SequenceKind::Uid => {
                "INSERT INTO mailbox_counters (mailbox_id, last_uid) VALUES (?1, 1)
                 ON CONFLICT(mailbox_id) DO UPDATE SET last_uid = last_uid + 1
                 RETURNING last_uid"
            }
            SequenceKind::ModSeq => {
                "INSERT INTO mailbox_counters (mailbox_id, highest_mod_seq) VALUES (?1, 1)
                 ON CONFLICT(mailbox_id) DO UPDATE SET highest_mod_seq = highest_mod_seq + 1
                 RETURNING highest_mod_seq"
            }
        };

        let allocated = self.conn().and_then(|conn| {
            let value: i64 = conn.query_row(sql, params![mailbox_id.as_str()], |row| row.get(0))?;
            u64::try_from(value)
                .map_err(|_| StoreError::corrupted(format!("negative {} counter {}", kind, value)))
        });

        allocated.map_err(|source| StoreError::SequenceAllocation {
            mailbox_id: mailbox_id.clone(),
            kind,
            source: Box::new(source),
        })
    }

    fn read_counters(&self, mailbox_id: &MailboxId) -> Result<(i64, i64)> {
        let conn = self.conn()?;
        let counters = conn
            .query_row(
                "SELECT last_uid, highest_mod_seq FROM mailbox_counters WHERE mailbox_id = ?",
                [mailbox_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(counters.unwrap_or((0, 0)))
    }
}

impl SequenceProvider for SqliteMailboxStore {
    fn next_uid(&self, mailbox_id: &MailboxId) -> Result<MessageUid> {
        self.bump_counter(mailbox_id, SequenceKind::Uid)
            .map(MessageUid)
    }

    fn next_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq> {
        self.bump_counter(mailbox_id, SequenceKind::ModSeq)
            .map(ModSeq)
    }

    fn last_uid(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>> {
        let (last_uid, _) = self.read_counters(mailbox_id)?;
        Ok((last_uid > 0).then(|| MessageUid(last_uid as u64)))
    }

    fn highest_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq> {
        let (_, highest_mod_seq) = self.read_counters(mailbox_id)?;
        Ok(ModSeq(highest_mod_seq.max(0) as u64))
    }
}

/// Begin a transaction that takes the write lock up front
fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// `?, ?, ?` for an `IN (...)` list of `n` values
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupted(format!("invalid date {:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SqliteMailboxStore {
        SqliteMailboxStore::open(dir.path().join("mail.db"), Duration::from_secs(5), 1000).unwrap()
    }

    #[test]
    fn test_migrations_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn test_counters_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let inbox = MailboxId::new("inbox");
        {
            let store = open(&dir);
            assert_eq!(store.last_uid(&inbox).unwrap(), None);
            assert_eq!(store.next_uid(&inbox).unwrap(), MessageUid(1));
            assert_eq!(store.next_uid(&inbox).unwrap(), MessageUid(2));
            assert_eq!(store.next_mod_seq(&inbox).unwrap(), ModSeq(1));
        }

        let store = open(&dir);
        assert_eq!(store.last_uid(&inbox).unwrap(), Some(MessageUid(2)));
        assert_eq!(store.highest_mod_seq(&inbox).unwrap(), ModSeq(1));
        assert_eq!(store.next_uid(&inbox).unwrap(), MessageUid(3));
    }

    #[test]
    fn test_concurrent_connections_allocate_distinct_values() {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(open(&dir));
        let second = Arc::new(open(&dir));
        let inbox = MailboxId::new("inbox");

        let mut mod_seqs: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = [&first, &second, &first, &second]
                .into_iter()
                .map(|store| {
                    let inbox = &inbox;
                    scope.spawn(move || {
                        (0..25)
                            .map(|_| store.next_mod_seq(inbox).unwrap().as_u64())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        mod_seqs.sort_unstable();
        assert_eq!(mod_seqs, (1..=100).collect::<Vec<_>>());
    }
}

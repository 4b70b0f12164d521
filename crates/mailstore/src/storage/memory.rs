//! In-memory storage implementation
//!
//! Used by tests and by deployments that do not need durability. Every map
//! is guarded by its own lock; counters are bumped under a single mutex so
//! allocation is an atomic read-increment-write.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::batch::RecentReset;
use super::{
    ChangeLogStore, ChangePageRequest, MessageStore, PageRequest, SequenceProvider,
};
use crate::config::DEFAULT_IN_CLAUSE_MAX_SIZE;
use crate::error::{Result, SequenceKind, StoreError};
use crate::flags::FlagsUpdateStatement;
use crate::models::{
    AccountId, ChangeDraft, ChangeLogHeads, ChangeRecord, FetchType, MailboxCounters, MailboxId,
    MailboxMessage, MessageId, MessageMetadata, MessageUid, ModSeq, State,
};

#[derive(Debug, Default, Clone, Copy)]
struct MailboxCounter {
    last_uid: u64,
    highest_mod_seq: u64,
}

struct StoredChange {
    record: ChangeRecord,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredChange {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Default)]
struct ChangeLog {
    heads: ChangeLogHeads,
    records: BTreeMap<State, StoredChange>,
}

type MailboxRows = BTreeMap<MessageUid, MailboxMessage>;

/// In-memory implementation of every storage contract
pub struct InMemoryMailboxStore {
    counters: Mutex<HashMap<MailboxId, MailboxCounter>>,
    /// Rows per mailbox, ordered by UID; content lives in `contents`
    messages: RwLock<HashMap<MailboxId, MailboxRows>>,
    contents: RwLock<HashMap<MessageId, Vec<u8>>>,
    change_logs: RwLock<HashMap<AccountId, ChangeLog>>,
    available: AtomicBool,
    max_list_predicate: usize,
}

impl InMemoryMailboxStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::with_max_list_predicate(DEFAULT_IN_CLAUSE_MAX_SIZE)
    }

    /// Create a store whose batch operations accept at most `max` UIDs per call
    pub fn with_max_list_predicate(max: usize) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            contents: RwLock::new(HashMap::new()),
            change_logs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            max_list_predicate: max.max(1),
        }
    }

    /// Simulate an outage: while unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Liveness probe
    pub fn ping(&self) -> Result<()> {
        self.ensure_available()?;
        drop(self.messages.read().map_err(|_| poisoned())?);
        Ok(())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::unavailable("in-memory store is switched off"))
        }
    }

    fn counters(&self) -> Result<MutexGuard<'_, HashMap<MailboxId, MailboxCounter>>> {
        self.ensure_available()?;
        self.counters.lock().map_err(|_| poisoned())
    }

    fn read_messages(&self) -> Result<RwLockReadGuard<'_, HashMap<MailboxId, MailboxRows>>> {
        self.ensure_available()?;
        self.messages.read().map_err(|_| poisoned())
    }

    fn write_messages(&self) -> Result<RwLockWriteGuard<'_, HashMap<MailboxId, MailboxRows>>> {
        self.ensure_available()?;
        self.messages.write().map_err(|_| poisoned())
    }

    fn read_changes(&self) -> Result<RwLockReadGuard<'_, HashMap<AccountId, ChangeLog>>> {
        self.ensure_available()?;
        self.change_logs.read().map_err(|_| poisoned())
    }

    fn write_changes(&self) -> Result<RwLockWriteGuard<'_, HashMap<AccountId, ChangeLog>>> {
        self.ensure_available()?;
        self.change_logs.write().map_err(|_| poisoned())
    }

    fn allocate(
        &self,
        mailbox_id: &MailboxId,
        kind: SequenceKind,
        bump: impl FnOnce(&mut MailboxCounter) -> u64,
    ) -> Result<u64> {
        self.counters()
            .map(|mut counters| bump(counters.entry(mailbox_id.clone()).or_default()))
            .map_err(|source| StoreError::SequenceAllocation {
                mailbox_id: mailbox_id.clone(),
                kind,
                source: Box::new(source),
            })
    }

    fn counter(&self, mailbox_id: &MailboxId) -> Result<MailboxCounter> {
        Ok(self
            .counters()?
            .get(mailbox_id)
            .copied()
            .unwrap_or_default())
    }

    fn materialize(&self, row: &MailboxMessage, fetch: FetchType) -> Result<MailboxMessage> {
        match fetch {
            FetchType::Metadata => Ok(row.clone()),
            FetchType::Full => {
                let contents = self.contents.read().map_err(|_| poisoned())?;
                Ok(MailboxMessage {
                    content: contents.get(&row.message_id).cloned(),
                    ..row.clone()
                })
            }
        }
    }

    /// Drop content of `candidates` no longer linked into any mailbox
    fn drop_orphaned_content<'a>(
        &self,
        messages: &HashMap<MailboxId, MailboxRows>,
        candidates: impl IntoIterator<Item = &'a MessageId>,
    ) -> Result<()> {
        let orphaned: BTreeSet<&MessageId> = candidates
            .into_iter()
            .filter(|message_id| {
                !messages
                    .values()
                    .any(|rows| rows.values().any(|row| &row.message_id == *message_id))
            })
            .collect();
        if !orphaned.is_empty() {
            let mut contents = self.contents.write().map_err(|_| poisoned())?;
            for message_id in orphaned {
                contents.remove(message_id);
            }
        }
        Ok(())
    }

    fn page<'m>(rows: &'m MailboxRows, request: &PageRequest<'_>) -> Vec<&'m MailboxMessage> {
        let lower = match request.after {
            Some(after) => request.range.lower().max(MessageUid(after.0.saturating_add(1))),
            None => request.range.lower(),
        };
        let upper = request.range.upper().unwrap_or(MessageUid::MAX);
        if lower > upper || request.limit == 0 {
            return Vec::new();
        }

        rows.range(lower..=upper)
            .map(|(_, row)| row)
            .filter(|row| request.filter.matches(&row.flags))
            .take(request.limit)
            .collect()
    }
}

impl Default for InMemoryMailboxStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::unavailable("in-memory store lock poisoned")
}

/// Same limit as the SQLite INTEGER column
fn check_mod_seq(mod_seq: ModSeq) -> Result<()> {
    if mod_seq > ModSeq::MAX {
        return Err(StoreError::invalid_input(format!("mod_seq {} exceeds {}", mod_seq, ModSeq::MAX)));
    }
    Ok(())
}

fn check_storable(message: &MailboxMessage) -> Result<()> {
    if message.uid > MessageUid::MAX {
        return Err(StoreError::invalid_input(format!(
            "uid {} exceeds {}",
            message.uid,
            MessageUid::MAX
        )));
    }
    if message.size > i64::MAX as u64 {
        return Err(StoreError::invalid_input(format!("size {} exceeds {}", message.size, i64::MAX)));
    }
    check_mod_seq(message.mod_seq)
}

impl SequenceProvider for InMemoryMailboxStore {
    fn next_uid(&self, mailbox_id: &MailboxId) -> Result<MessageUid> {
        self.allocate(mailbox_id, SequenceKind::Uid, |counter| {
            counter.last_uid += 1;
            counter.last_uid
        })
        .map(MessageUid)
    }

    fn next_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq> {
        self.allocate(mailbox_id, SequenceKind::ModSeq, |counter| {
            counter.highest_mod_seq += 1;
            counter.highest_mod_seq
        })
        .map(ModSeq)
    }

    fn last_uid(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>> {
        let counter = self.counter(mailbox_id)?;
        Ok((counter.last_uid > 0).then_some(MessageUid(counter.last_uid)))
    }

    fn highest_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq> {
        Ok(ModSeq(self.counter(mailbox_id)?.highest_mod_seq))
    }
}

impl MessageStore for InMemoryMailboxStore {
    fn insert(&self, message: &MailboxMessage) -> Result<()> {
        check_storable(message)?;
        let mut messages = self.write_messages()?;
        let rows = messages.entry(message.mailbox_id.clone()).or_default();
        if rows.contains_key(&message.uid) {
            return Err(StoreError::AlreadyExists {
                resource: format!("message {}/{}", message.mailbox_id, message.uid),
            });
        }

        if let Some(content) = &message.content {
            let mut contents = self.contents.write().map_err(|_| poisoned())?;
            contents
                .entry(message.message_id.clone())
                .or_insert_with(|| content.clone());
        }
        rows.insert(message.uid, message.without_content());
        Ok(())
    }

    fn find(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        fetch: FetchType,
    ) -> Result<Option<MailboxMessage>> {
        let messages = self.read_messages()?;
        messages
            .get(mailbox_id)
            .and_then(|rows| rows.get(&uid))
            .map(|row| self.materialize(row, fetch))
            .transpose()
    }

    fn fetch_page(&self, request: &PageRequest<'_>, fetch: FetchType) -> Result<Vec<MailboxMessage>> {
        let messages = self.read_messages()?;
        let Some(rows) = messages.get(request.mailbox_id) else {
            return Ok(Vec::new());
        };
        Self::page(rows, request)
            .into_iter()
            .map(|row| self.materialize(row, fetch))
            .collect()
    }

    fn fetch_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage>> {
        let messages = self.read_messages()?;
        let Some(rows) = messages.get(mailbox_id) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<&MailboxMessage> = uids.iter().filter_map(|uid| rows.get(uid)).collect();
        found.sort_by_key(|row| row.uid);
        found.dedup_by_key(|row| row.uid);
        found
            .into_iter()
            .map(|row| self.materialize(row, fetch))
            .collect()
    }

    fn fetch_uid_page(&self, request: &PageRequest<'_>) -> Result<Vec<MessageUid>> {
        let messages = self.read_messages()?;
        Ok(messages
            .get(request.mailbox_id)
            .map(|rows| Self::page(rows, request).into_iter().map(|row| row.uid).collect())
            .unwrap_or_default())
    }

    fn update_flags(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        statement: &FlagsUpdateStatement,
        new_mod_seq: ModSeq,
        expected: Option<ModSeq>,
    ) -> Result<MessageMetadata> {
        check_mod_seq(new_mod_seq)?;
        let mut messages = self.write_messages()?;
        let row = messages
            .get_mut(mailbox_id)
            .and_then(|rows| rows.get_mut(&uid))
            .ok_or_else(|| StoreError::not_found(format!("message {}/{}", mailbox_id, uid)))?;

        match expected {
            Some(expected) if row.mod_seq != expected => {
                return Err(StoreError::ModSeqConflict {
                    mailbox_id: mailbox_id.clone(),
                    uid,
                    expected,
                    actual: row.mod_seq,
                });
            }
            _ => {}
        }

        row.flags = statement.apply_to(&row.flags);
        row.mod_seq = new_mod_seq;
        Ok(row.metadata())
    }

    fn reset_recent_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        new_mod_seq: ModSeq,
    ) -> Result<RecentReset> {
        check_mod_seq(new_mod_seq)?;
        let mut messages = self.write_messages()?;
        let mut outcome = RecentReset::default();
        let Some(rows) = messages.get_mut(mailbox_id) else {
            outcome.missing = uids.to_vec();
            return Ok(outcome);
        };

        for uid in uids {
            match rows.get_mut(uid) {
                None => outcome.missing.push(*uid),
                Some(row) if row.mod_seq == new_mod_seq => outcome.already_applied.push(*uid),
                Some(row) => {
                    row.flags.recent = false;
                    row.mod_seq = new_mod_seq;
                    outcome.updated.push(row.metadata());
                }
            }
        }
        Ok(outcome)
    }

    fn delete_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
    ) -> Result<Vec<MessageMetadata>> {
        let mut messages = self.write_messages()?;
        let removed: Vec<MailboxMessage> = match messages.get_mut(mailbox_id) {
            Some(rows) => uids.iter().filter_map(|uid| rows.remove(uid)).collect(),
            None => Vec::new(),
        };

        self.drop_orphaned_content(&messages, removed.iter().map(|row| &row.message_id))?;
        Ok(removed.iter().map(MailboxMessage::metadata).collect())
    }

    fn delete_mailbox(&self, mailbox_id: &MailboxId) -> Result<Vec<MessageId>> {
        let mut messages = self.write_messages()?;
        let mut message_ids: Vec<MessageId> = messages
            .remove(mailbox_id)
            .unwrap_or_default()
            .into_values()
            .map(|row| row.message_id)
            .collect();
        message_ids.sort();
        self.drop_orphaned_content(&messages, &message_ids)?;
        Ok(message_ids)
    }

    fn delete_message(&self, message_id: &MessageId) -> Result<Vec<MailboxId>> {
        let mut messages = self.write_messages()?;
        let mut mailboxes = Vec::new();
        for (mailbox_id, rows) in messages.iter_mut() {
            let before = rows.len();
            rows.retain(|_, row| &row.message_id != message_id);
            if rows.len() < before {
                mailboxes.push(mailbox_id.clone());
            }
        }
        mailboxes.sort();
        self.drop_orphaned_content(&messages, [message_id])?;
        Ok(mailboxes)
    }

    fn find_mailboxes(&self, message_id: &MessageId) -> Result<Vec<MailboxId>> {
        let messages = self.read_messages()?;
        let mut mailboxes: Vec<MailboxId> = messages
            .iter()
            .filter(|(_, rows)| rows.values().any(|row| &row.message_id == message_id))
            .map(|(mailbox_id, _)| mailbox_id.clone())
            .collect();
        mailboxes.sort();
        Ok(mailboxes)
    }

    fn count_total_and_unseen(&self, mailbox_id: &MailboxId) -> Result<MailboxCounters> {
        let messages = self.read_messages()?;
        Ok(messages
            .get(mailbox_id)
            .map(|rows| MailboxCounters {
                total: rows.len() as u64,
                unseen: rows.values().filter(|row| !row.flags.seen).count() as u64,
            })
            .unwrap_or_default())
    }

    fn first_unseen(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>> {
        let messages = self.read_messages()?;
        Ok(messages.get(mailbox_id).and_then(|rows| {
            rows.values()
                .find(|row| !row.flags.seen)
                .map(|row| row.uid)
        }))
    }

    fn distinct_user_flags(&self, mailbox_id: &MailboxId) -> Result<BTreeSet<String>> {
        let messages = self.read_messages()?;
        Ok(messages
            .get(mailbox_id)
            .map(|rows| {
                rows.values()
                    .flat_map(|row| row.flags.user_flags.iter().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn max_list_predicate(&self) -> usize {
        self.max_list_predicate
    }
}

impl ChangeLogStore for InMemoryMailboxStore {
    fn append(&self, draft: ChangeDraft, expires_at: Option<DateTime<Utc>>) -> Result<ChangeRecord> {
        let mut logs = self.write_changes()?;
        let log = logs.entry(draft.account_id.clone()).or_default();

        let state = log.heads.latest.next();
        log.heads = log.heads.advanced(state, draft.is_delegated);
        let record = draft.into_record(state);
        log.records.insert(
            state,
            StoredChange {
                record: record.clone(),
                expires_at,
            },
        );
        Ok(record)
    }

    fn changes_page(&self, request: &ChangePageRequest<'_>) -> Result<Vec<ChangeRecord>> {
        let logs = self.read_changes()?;
        let Some(log) = logs.get(request.account_id) else {
            return Ok(Vec::new());
        };

        let lower = request.after.map(State::next).unwrap_or(request.from);
        Ok(log
            .records
            .range(lower..)
            .map(|(_, stored)| stored)
            .filter(|stored| stored.is_live(request.now))
            .take(request.limit)
            .map(|stored| stored.record.clone())
            .collect())
    }

    fn heads(&self, account_id: &AccountId) -> Result<ChangeLogHeads> {
        let logs = self.read_changes()?;
        Ok(logs
            .get(account_id)
            .map(|log| log.heads)
            .unwrap_or_default())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut logs = self.write_changes()?;
        let mut purged = 0;
        for log in logs.values_mut() {
            let before = log.records.len();
            log.records.retain(|_, stored| stored.is_live(now));
            purged += before - log.records.len();
        }
        Ok(purged)
    }
}

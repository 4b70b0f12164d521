//! Mailbox service facade
//!
//! The entry point used by protocol layers: wires one backend into the
//! flag engine, scanner and change log, and exposes their operations.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::changes::ChangeLogRepository;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::flags::{FlagsMutationEngine, FlagsUpdateRequest};
use crate::health::HealthStatus;
use crate::models::{
    AccountId, ChangeDraft, ChangeRecord, ChangesPage, FetchType, Flags, Limit, MailboxCounters,
    MailboxId, MailboxMessage, MessageId, MessageMetadata, MessageRange, MessageUid, ModSeq,
    State, ThreadId,
};
use crate::scan::{MessageScanner, Paginated};
use crate::storage::{InMemoryMailboxStore, MailboxBackend, RecentReset};

/// A new message to link into a mailbox
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub message_id: MessageId,
    pub thread_id: Option<ThreadId>,
    pub internal_date: Option<DateTime<Utc>>,
    pub flags: Flags,
    pub content: Vec<u8>,
}

impl AppendRequest {
    pub fn new(message_id: MessageId, content: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id,
            thread_id: None,
            internal_date: None,
            flags: Flags::new(),
            content: content.into(),
        }
    }

    pub fn thread_id(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn internal_date(mut self, internal_date: DateTime<Utc>) -> Self {
        self.internal_date = Some(internal_date);
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}

/// Operations offered to the protocol layer
pub struct MailboxService {
    backend: MailboxBackend,
    flags: FlagsMutationEngine,
    changes: ChangeLogRepository,
    query_batch_size: usize,
}

impl MailboxService {
    pub fn new(backend: MailboxBackend, config: &StoreConfig) -> Self {
        let flags = FlagsMutationEngine::new(backend.sequences.clone(), backend.messages.clone());
        let changes = ChangeLogRepository::new(
            backend.changes.clone(),
            config.change_retention(),
            config.query_batch_size,
        );
        Self {
            backend,
            flags,
            changes,
            query_batch_size: config.query_batch_size,
        }
    }

    /// Open the backend selected by `config` and wire the service on top
    pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        Ok(Self::new(MailboxBackend::open(config)?, config))
    }

    /// Service over a fresh in-memory store with default settings
    pub fn in_memory() -> Self {
        let config = StoreConfig::default();
        let store = Arc::new(InMemoryMailboxStore::with_max_list_predicate(
            config.in_clause_max_size,
        ));
        Self::new(MailboxBackend::in_memory(store), &config)
    }

    pub fn backend(&self) -> &MailboxBackend {
        &self.backend
    }

    // === Sequences ===

    pub fn next_uid(&self, mailbox_id: &MailboxId) -> Result<MessageUid> {
        self.backend.sequences.next_uid(mailbox_id)
    }

    pub fn next_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq> {
        self.backend.sequences.next_mod_seq(mailbox_id)
    }

    pub fn highest_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq> {
        self.backend.sequences.highest_mod_seq(mailbox_id)
    }

    // === Messages ===

    /// Allocate a UID and modification sequence and insert the message
    pub fn append(&self, mailbox_id: &MailboxId, request: AppendRequest) -> Result<MessageMetadata> {
        let uid = self.next_uid(mailbox_id)?;
        let mod_seq = self.next_mod_seq(mailbox_id)?;

        let mut builder = MailboxMessage::builder(mailbox_id.clone(), uid, request.message_id)
            .mod_seq(mod_seq)
            .save_date(Utc::now())
            .flags(request.flags)
            .content(request.content);
        if let Some(thread_id) = request.thread_id {
            builder = builder.thread_id(thread_id);
        }
        if let Some(internal_date) = request.internal_date {
            builder = builder.internal_date(internal_date);
        }
        let message = builder.build();

        self.backend.messages.insert(&message)?;
        debug!("[STORE] Appended {} to {} as uid {}", message.message_id, mailbox_id, uid);
        Ok(message.metadata())
    }

    pub fn find(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        fetch: FetchType,
    ) -> Result<Option<MailboxMessage>> {
        self.backend.messages.find(mailbox_id, uid, fetch)
    }

    /// Rows of `uids`, ascending; UIDs without a row are skipped
    pub fn find_by_uids(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage>> {
        self.scanner().find_by_uids(mailbox_id, uids, fetch)
    }

    pub fn apply_flags(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        request: &FlagsUpdateRequest,
        expected: Option<ModSeq>,
    ) -> Result<MessageMetadata> {
        self.flags.apply_flags(mailbox_id, uid, request, expected)
    }

    pub fn reset_recent_flag(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        new_mod_seq: ModSeq,
    ) -> Result<RecentReset> {
        self.flags.reset_recent_flag(mailbox_id, uids, new_mod_seq)
    }

    pub fn delete_by_uids(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
    ) -> Result<Vec<MessageMetadata>> {
        self.flags.delete_by_uids(mailbox_id, uids)
    }

    /// Remove every message of a mailbox, returning the message ids it held
    ///
    /// The mailbox's UID and modification sequence counters are kept.
    pub fn delete_mailbox(&self, mailbox_id: &MailboxId) -> Result<Vec<MessageId>> {
        let removed = self.backend.messages.delete_mailbox(mailbox_id)?;
        info!("[STORE] Deleted mailbox {} holding {} messages", mailbox_id, removed.len());
        Ok(removed)
    }

    /// Unlink a message from every mailbox, returning those mailboxes
    ///
    /// Each of them gets a fresh modification sequence first, as an expunge does.
    pub fn delete_message(&self, message_id: &MessageId) -> Result<Vec<MailboxId>> {
        for mailbox_id in self.find_mailboxes(message_id)? {
            self.next_mod_seq(&mailbox_id)?;
        }
        let mailboxes = self.backend.messages.delete_message(message_id)?;
        info!("[STORE] Deleted {} from {} mailboxes", message_id, mailboxes.len());
        Ok(mailboxes)
    }

    /// Scanner over this service's backend
    pub fn scanner(&self) -> MessageScanner<'_> {
        MessageScanner::new(self.backend.messages.as_ref(), self.query_batch_size)
    }

    /// Lazy, ascending sequence of the messages in `range`
    pub fn scan(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
        limit: Limit,
        fetch: FetchType,
    ) -> Paginated<'_, MailboxMessage, MessageUid> {
        self.scanner().messages(mailbox_id, range, limit, fetch)
    }

    pub fn counters(&self, mailbox_id: &MailboxId) -> Result<MailboxCounters> {
        self.backend.messages.count_total_and_unseen(mailbox_id)
    }

    pub fn first_unseen(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>> {
        self.backend.messages.first_unseen(mailbox_id)
    }

    pub fn find_mailboxes(&self, message_id: &MessageId) -> Result<Vec<MailboxId>> {
        self.backend.messages.find_mailboxes(message_id)
    }

    pub fn distinct_user_flags(&self, mailbox_id: &MailboxId) -> Result<BTreeSet<String>> {
        self.backend.messages.distinct_user_flags(mailbox_id)
    }

    // === Change log ===

    pub fn record_change(&self, draft: ChangeDraft) -> Result<ChangeRecord> {
        self.changes.record_change(draft)
    }

    pub fn all_changes(&self, account_id: &AccountId) -> Paginated<'_, ChangeRecord, State> {
        self.changes.all_changes(account_id)
    }

    pub fn changes_since(
        &self,
        account_id: &AccountId,
        since: State,
    ) -> Result<Paginated<'_, ChangeRecord, State>> {
        self.changes.changes_since(account_id, since)
    }

    pub fn changes_since_limited(
        &self,
        account_id: &AccountId,
        since: State,
        max_changes: usize,
    ) -> Result<ChangesPage> {
        self.changes
            .changes_since_limited(account_id, since, max_changes)
    }

    pub fn latest_state(&self, account_id: &AccountId) -> Result<State> {
        self.changes.latest_state(account_id)
    }

    pub fn latest_state_not_delegated(&self, account_id: &AccountId) -> Result<State> {
        self.changes.latest_state_not_delegated(account_id)
    }

    pub fn purge_expired_changes(&self) -> Result<usize> {
        self.changes.purge_expired()
    }

    // === Health ===

    /// Probe the backend once
    pub fn check(&self) -> HealthStatus {
        self.backend.health.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemFlag;

    #[test]
    fn test_append_allocates_sequences() {
        let service = MailboxService::in_memory();
        let inbox = MailboxId::new("inbox");

        let first = service
            .append(&inbox, AppendRequest::new(MessageId::new("m1"), "hello"))
            .unwrap();
        let second = service
            .append(
                &inbox,
                AppendRequest::new(MessageId::new("m2"), "world")
                    .flags(Flags::new().with(SystemFlag::Seen))
                    .thread_id(ThreadId::new("m1")),
            )
            .unwrap();

        assert_eq!(first.uid, MessageUid(1));
        assert_eq!(second.uid, MessageUid(2));
        assert!(second.mod_seq > first.mod_seq);
        assert_eq!(second.thread_id, ThreadId::new("m1"));
        assert!(first.save_date.is_some());
        assert_eq!(service.counters(&inbox).unwrap(), MailboxCounters { total: 2, unseen: 1 });
        assert_eq!(service.first_unseen(&inbox).unwrap(), Some(MessageUid(1)));
    }

    #[test]
    fn test_scan_returns_content_on_full_fetch() {
        let service = MailboxService::in_memory();
        let inbox = MailboxId::new("inbox");
        service
            .append(&inbox, AppendRequest::new(MessageId::new("m1"), "hello"))
            .unwrap();

        let messages: Vec<MailboxMessage> = service
            .scan(&inbox, MessageRange::All, Limit::Unlimited, FetchType::Full)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_health_is_healthy() {
        let service = MailboxService::in_memory();
        assert!(service.check().is_healthy());
    }
}

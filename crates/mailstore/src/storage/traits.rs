//! Storage trait definitions
//!
//! Each method is a single backend round trip. Multi-round-trip behaviour
//! (partitioned batches, paginated scans) is composed on top of these traits
//! by the `flags`, `scan` and `changes` modules.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::batch::RecentReset;
use crate::error::Result;
use crate::flags::FlagsUpdateStatement;
use crate::models::{
    AccountId, ChangeDraft, ChangeLogHeads, ChangeRecord, FetchType, MailboxCounters, MailboxId,
    MailboxMessage, MessageId, MessageMetadata, MessageRange, MessageUid, ModSeq, ScanFilter,
    State,
};

/// Per-mailbox durable counters for UIDs and modification sequences
///
/// Every returned value is strictly greater than all values previously
/// returned for the same mailbox, across concurrent callers and restarts.
/// Implementations must not cache values in process.
pub trait SequenceProvider: Send + Sync {
    /// Allocate the next UID of a mailbox
    fn next_uid(&self, mailbox_id: &MailboxId) -> Result<MessageUid>;

    /// Allocate the next modification sequence of a mailbox
    fn next_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq>;

    /// Last allocated UID, `None` if no UID was ever allocated
    fn last_uid(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>>;

    /// Last allocated modification sequence (0 if none)
    fn highest_mod_seq(&self, mailbox_id: &MailboxId) -> Result<ModSeq>;
}

/// One page of an ordered message range scan
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub mailbox_id: &'a MailboxId,
    pub range: MessageRange,
    pub filter: ScanFilter,
    /// Exclusive cursor: only UIDs strictly greater are returned
    pub after: Option<MessageUid>,
    pub limit: usize,
}

/// Message rows of mailboxes
pub trait MessageStore: Send + Sync {
    /// Insert a new row; its content (if any) is stored once per message id
    fn insert(&self, message: &MailboxMessage) -> Result<()>;

    /// Look up a single row
    fn find(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        fetch: FetchType,
    ) -> Result<Option<MailboxMessage>>;

    /// Rows matching the request, ascending by UID, at most `limit`
    fn fetch_page(&self, request: &PageRequest<'_>, fetch: FetchType) -> Result<Vec<MailboxMessage>>;

    /// Rows of one partition of UIDs (at most `max_list_predicate`), ascending
    ///
    /// UIDs matching no row are skipped.
    fn fetch_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage>>;

    /// UIDs matching the request, ascending, at most `limit`
    fn fetch_uid_page(&self, request: &PageRequest<'_>) -> Result<Vec<MessageUid>>;

    /// Conditional flag write returning the post-image
    ///
    /// Matches on mailbox id and UID, and on `expected` when given. Fails with
    /// `NotFound` when no row exists and `ModSeqConflict` when the row exists
    /// but its modification sequence differs from `expected`.
    fn update_flags(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        statement: &FlagsUpdateStatement,
        new_mod_seq: ModSeq,
        expected: Option<ModSeq>,
    ) -> Result<MessageMetadata>;

    /// Clear `\Recent` on one partition of UIDs (at most `max_list_predicate`)
    ///
    /// Rows already at `new_mod_seq` are left untouched and reported as
    /// already applied.
    fn reset_recent_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        new_mod_seq: ModSeq,
    ) -> Result<RecentReset>;

    /// Delete one partition of UIDs, returning the removed rows
    fn delete_batch(&self, mailbox_id: &MailboxId, uids: &[MessageUid])
    -> Result<Vec<MessageMetadata>>;

    /// Delete every row of a mailbox, returning the message ids it held
    ///
    /// The mailbox counters are kept so a recreated mailbox never reuses UIDs.
    fn delete_mailbox(&self, mailbox_id: &MailboxId) -> Result<Vec<MessageId>>;

    /// Unlink a message from every mailbox, returning those mailboxes
    fn delete_message(&self, message_id: &MessageId) -> Result<Vec<MailboxId>>;

    /// Mailboxes the message is linked into
    fn find_mailboxes(&self, message_id: &MessageId) -> Result<Vec<MailboxId>>;

    /// Recompute total and unseen counts from the rows
    fn count_total_and_unseen(&self, mailbox_id: &MailboxId) -> Result<MailboxCounters>;

    /// Lowest unseen UID
    fn first_unseen(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>>;

    /// Union of user flags in use in the mailbox
    fn distinct_user_flags(&self, mailbox_id: &MailboxId) -> Result<BTreeSet<String>>;

    /// Largest identifier list accepted in a single predicate
    fn max_list_predicate(&self) -> usize;
}

/// One page of an account's change log
#[derive(Debug, Clone, Copy)]
pub struct ChangePageRequest<'a> {
    pub account_id: &'a AccountId,
    /// Inclusive lower bound
    pub from: State,
    /// Exclusive cursor, takes over from `from` once set
    pub after: Option<State>,
    /// Records expired at this instant are not returned
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// Append-only per-account change log
pub trait ChangeLogStore: Send + Sync {
    /// Append a record, allocating its state and advancing the heads in the
    /// same backend operation
    fn append(&self, draft: ChangeDraft, expires_at: Option<DateTime<Utc>>) -> Result<ChangeRecord>;

    /// Non-expired records, ascending by state
    fn changes_page(&self, request: &ChangePageRequest<'_>) -> Result<Vec<ChangeRecord>>;

    /// Latest-state pointers; never expire
    fn heads(&self, account_id: &AccountId) -> Result<ChangeLogHeads>;

    /// Physically remove records expired at `now`
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

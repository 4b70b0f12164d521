//! Mailbox message model and the query shapes used to read it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Flags, MailboxId, MessageId, MessageUid, ModSeq, ThreadId};

/// A message as linked into one mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub mailbox_id: MailboxId,
    /// Unique within the mailbox, never reused
    pub uid: MessageUid,
    /// Bumped on every mutation of this row
    pub mod_seq: ModSeq,
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub internal_date: DateTime<Utc>,
    /// Size of the full content in octets
    pub size: u64,
    pub save_date: Option<DateTime<Utc>>,
    pub flags: Flags,
    /// Raw content, only populated by [`FetchType::Full`]
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl MailboxMessage {
    /// Create a new message builder
    pub fn builder(
        mailbox_id: MailboxId,
        uid: MessageUid,
        message_id: MessageId,
    ) -> MailboxMessageBuilder {
        MailboxMessageBuilder::new(mailbox_id, uid, message_id)
    }

    /// Metadata view of this row
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            uid: self.uid,
            mod_seq: self.mod_seq,
            flags: self.flags.clone(),
            size: self.size,
            internal_date: self.internal_date,
            save_date: self.save_date,
            message_id: self.message_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }

    /// Same row without content, as returned by [`FetchType::Metadata`]
    pub fn without_content(&self) -> MailboxMessage {
        MailboxMessage {
            content: None,
            ..self.clone()
        }
    }
}

/// Builder for creating MailboxMessage instances
pub struct MailboxMessageBuilder {
    mailbox_id: MailboxId,
    uid: MessageUid,
    message_id: MessageId,
    mod_seq: ModSeq,
    thread_id: Option<ThreadId>,
    internal_date: Option<DateTime<Utc>>,
    size: u64,
    save_date: Option<DateTime<Utc>>,
    flags: Flags,
    content: Option<Vec<u8>>,
}

impl MailboxMessageBuilder {
    fn new(mailbox_id: MailboxId, uid: MessageUid, message_id: MessageId) -> Self {
        Self {
            mailbox_id,
            uid,
            message_id,
            mod_seq: ModSeq(0),
            thread_id: None,
            internal_date: None,
            size: 0,
            save_date: None,
            flags: Flags::new(),
            content: None,
        }
    }

    pub fn mod_seq(mut self, mod_seq: ModSeq) -> Self {
        self.mod_seq = mod_seq;
        self
    }

    pub fn thread_id(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn internal_date(mut self, internal_date: DateTime<Utc>) -> Self {
        self.internal_date = Some(internal_date);
        self
    }

    pub fn save_date(mut self, save_date: DateTime<Utc>) -> Self {
        self.save_date = Some(save_date);
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the content; the size follows it
    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        self.size = content.len() as u64;
        self.content = Some(content);
        self
    }

    pub fn build(self) -> MailboxMessage {
        MailboxMessage {
            // A message with no thread is its own thread root
            thread_id: self
                .thread_id
                .unwrap_or_else(|| ThreadId::new(self.message_id.as_str())),
            mailbox_id: self.mailbox_id,
            uid: self.uid,
            mod_seq: self.mod_seq,
            message_id: self.message_id,
            internal_date: self.internal_date.unwrap_or_else(Utc::now),
            size: self.size,
            save_date: self.save_date,
            flags: self.flags,
            content: self.content,
        }
    }
}

/// Metadata returned by mutations (post-image of a row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub uid: MessageUid,
    pub mod_seq: ModSeq,
    pub flags: Flags,
    pub size: u64,
    pub internal_date: DateTime<Utc>,
    pub save_date: Option<DateTime<Utc>>,
    pub message_id: MessageId,
    pub thread_id: ThreadId,
}

/// UID range predicate, bounds inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRange {
    All,
    From(MessageUid),
    Range(MessageUid, MessageUid),
    One(MessageUid),
}

impl MessageRange {
    /// Lowest UID the range admits
    pub fn lower(&self) -> MessageUid {
        match self {
            MessageRange::All => MessageUid::MIN,
            MessageRange::From(from) | MessageRange::Range(from, _) | MessageRange::One(from) => {
                *from
            }
        }
    }

    /// Highest UID the range admits, if bounded
    pub fn upper(&self) -> Option<MessageUid> {
        match self {
            MessageRange::All | MessageRange::From(_) => None,
            MessageRange::Range(_, to) => Some(*to),
            MessageRange::One(uid) => Some(*uid),
        }
    }

    pub fn contains(&self, uid: MessageUid) -> bool {
        uid >= self.lower() && self.upper().is_none_or(|upper| uid <= upper)
    }
}

/// Row filter applied on top of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    Any,
    Unseen,
    Recent,
    NotDeleted,
    Deleted,
}

impl ScanFilter {
    pub fn matches(&self, flags: &Flags) -> bool {
        match self {
            ScanFilter::Any => true,
            ScanFilter::Unseen => !flags.seen,
            ScanFilter::Recent => flags.recent,
            ScanFilter::NotDeleted => !flags.deleted,
            ScanFilter::Deleted => flags.deleted,
        }
    }
}

/// How much of a row to materialize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchType {
    /// Every column except the content
    Metadata,
    /// Metadata plus the decompressed content
    Full,
}

/// Caller-supplied cap on the number of results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    #[default]
    Unlimited,
    Limited(usize),
}

impl Limit {
    pub fn as_option(&self) -> Option<usize> {
        match self {
            Limit::Unlimited => None,
            Limit::Limited(n) => Some(*n),
        }
    }
}

/// Denormalized mailbox counters, recomputable from message rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxCounters {
    pub total: u64,
    pub unseen: u64,
}

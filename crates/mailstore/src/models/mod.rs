//! Domain models for mailbox entities

mod change;
mod flags;
mod ids;
mod message;

pub use change::{ChangeDraft, ChangeLogHeads, ChangeRecord, ChangesPage, State};
pub use flags::{Flags, SystemFlag};
pub use ids::{AccountId, MailboxId, MessageId, MessageUid, ModSeq, ThreadId};
pub use message::{
    FetchType, Limit, MailboxCounters, MailboxMessage, MailboxMessageBuilder, MessageMetadata,
    MessageRange, ScanFilter,
};

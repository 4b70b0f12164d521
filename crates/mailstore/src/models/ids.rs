//! Identifier types
//!
//! String identifiers are opaque to this crate; numeric ones (UID, ModSeq)
//! are ordered and allocated by a [`SequenceProvider`](crate::storage::SequenceProvider).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Opaque mailbox identifier
    MailboxId
);
string_id!(
    /// Globally unique message identifier, stable across the mailboxes a
    /// message is linked into
    MessageId
);
string_id!(
    /// Conversation the message belongs to
    ThreadId
);
string_id!(
    /// Owner of a change log
    AccountId
);

/// Message UID, unique and strictly increasing within a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageUid(pub u64);

impl MessageUid {
    pub const MIN: MessageUid = MessageUid(1);
    /// Largest UID a backend can store
    pub const MAX: MessageUid = MessageUid(i64::MAX as u64);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modification sequence, bumped on every state change of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModSeq(pub u64);

impl ModSeq {
    /// Largest modification sequence a backend can store
    pub const MAX: ModSeq = ModSeq(i64::MAX as u64);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

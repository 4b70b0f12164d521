//! Change log entries used by clients for incremental state sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::AccountId;

/// Checkpoint in an account's change log
///
/// States are allocated per account from a gapless counter, so a later
/// record always carries a greater state. [`State::INITIAL`] is the state of
/// an account with no recorded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct State(pub u64);

impl State {
    pub const INITIAL: State = State(0);

    pub fn next(self) -> State {
        State(self.0.saturating_add(1))
    }

    pub fn is_initial(self) -> bool {
        self == State::INITIAL
    }
}

impl Default for State {
    fn default() -> Self {
        State::INITIAL
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recorded state transition of an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub account_id: AccountId,
    pub state: State,
    pub date: DateTime<Utc>,
    /// Message counts changed but not content
    pub is_count_change: bool,
    /// Visible only through shared access
    pub is_delegated: bool,
    pub created: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub destroyed: BTreeSet<String>,
}

/// A change that has not been assigned a state yet
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDraft {
    pub account_id: AccountId,
    pub date: DateTime<Utc>,
    pub is_count_change: bool,
    pub is_delegated: bool,
    pub created: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub destroyed: BTreeSet<String>,
}

impl ChangeDraft {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            date: Utc::now(),
            is_count_change: false,
            is_delegated: false,
            created: BTreeSet::new(),
            updated: BTreeSet::new(),
            destroyed: BTreeSet::new(),
        }
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn count_change(mut self, is_count_change: bool) -> Self {
        self.is_count_change = is_count_change;
        self
    }

    pub fn delegated(mut self, is_delegated: bool) -> Self {
        self.is_delegated = is_delegated;
        self
    }

    pub fn created<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.created.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn updated<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.updated.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn destroyed<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destroyed.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Attach the state allocated by the backend
    pub fn into_record(self, state: State) -> ChangeRecord {
        ChangeRecord {
            account_id: self.account_id,
            state,
            date: self.date,
            is_count_change: self.is_count_change,
            is_delegated: self.is_delegated,
            created: self.created,
            updated: self.updated,
            destroyed: self.destroyed,
        }
    }
}

/// Latest-state pointers of an account, kept outside retained history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeLogHeads {
    pub latest: State,
    pub latest_not_delegated: State,
}

impl ChangeLogHeads {
    /// Pointers after appending a record with `state`
    pub fn advanced(self, state: State, is_delegated: bool) -> Self {
        Self {
            latest: state,
            latest_not_delegated: if is_delegated {
                self.latest_not_delegated
            } else {
                state
            },
        }
    }
}

/// A bounded slice of changes, for clients that cap the delta size
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesPage {
    pub changes: Vec<ChangeRecord>,
    /// More records exist after the last one returned
    pub has_more: bool,
}

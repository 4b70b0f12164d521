//! Immutable description of a conditional flag write
//!
//! A [`FlagsUpdateStatement`] lists which system-flag columns to assign and
//! how to change the user-flag set. It is folded from a request once and then
//! rendered by each backend, so the write touches only the columns the mode
//! requires: ADD and REMOVE never rewrite the whole user-flag set.

use std::collections::BTreeSet;

use super::{FlagsUpdateMode, FlagsUpdateRequest};
use crate::models::{Flags, SystemFlag};

/// Set-level change applied to the user-flag set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFlagsChange {
    Unchanged,
    Append(BTreeSet<String>),
    Remove(BTreeSet<String>),
    Replace(BTreeSet<String>),
}

/// Column assignments of a flag update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsUpdateStatement {
    assignments: Vec<(SystemFlag, bool)>,
    user_flags: UserFlagsChange,
}

impl Default for FlagsUpdateStatement {
    fn default() -> Self {
        Self {
            assignments: Vec::new(),
            user_flags: UserFlagsChange::Unchanged,
        }
    }
}

impl FlagsUpdateStatement {
    /// Statement that assigns nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Statement with one more column assignment
    pub fn set(mut self, flag: SystemFlag, value: bool) -> Self {
        self.assignments.retain(|(f, _)| *f != flag);
        self.assignments.push((flag, value));
        self
    }

    /// Statement with the given user-flag change
    pub fn with_user_flags(mut self, change: UserFlagsChange) -> Self {
        self.user_flags = change;
        self
    }

    /// Fold a request into the minimal set of assignments
    pub fn for_request(request: &FlagsUpdateRequest) -> Self {
        let provided = &request.provided_flags;
        match request.mode {
            FlagsUpdateMode::Replace => SystemFlag::ALL
                .into_iter()
                .fold(Self::new(), |statement, flag| {
                    statement.set(flag, provided.contains(flag))
                })
                .with_user_flags(UserFlagsChange::Replace(provided.user_flags.clone())),
            FlagsUpdateMode::Add => provided
                .system_flags()
                .fold(Self::new(), |statement, flag| statement.set(flag, true))
                .with_user_flags(set_change(&provided.user_flags, UserFlagsChange::Append)),
            FlagsUpdateMode::Remove => provided
                .system_flags()
                .fold(Self::new(), |statement, flag| statement.set(flag, false))
                .with_user_flags(set_change(&provided.user_flags, UserFlagsChange::Remove)),
        }
    }

    pub fn assignments(&self) -> &[(SystemFlag, bool)] {
        &self.assignments
    }

    pub fn user_flags(&self) -> &UserFlagsChange {
        &self.user_flags
    }

    /// Post-image of `flags` after this statement
    pub fn apply_to(&self, flags: &Flags) -> Flags {
        let mut result = flags.clone();
        for (flag, value) in &self.assignments {
            result.set(*flag, *value);
        }
        match &self.user_flags {
            UserFlagsChange::Unchanged => {}
            UserFlagsChange::Append(added) => result.user_flags.extend(added.iter().cloned()),
            UserFlagsChange::Remove(removed) => result.user_flags.retain(|f| !removed.contains(f)),
            UserFlagsChange::Replace(replacement) => result.user_flags = replacement.clone(),
        }
        result
    }
}

fn set_change(
    flags: &BTreeSet<String>,
    change: fn(BTreeSet<String>) -> UserFlagsChange,
) -> UserFlagsChange {
    if flags.is_empty() {
        UserFlagsChange::Unchanged
    } else {
        change(flags.clone())
    }
}

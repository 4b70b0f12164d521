//! Message flags: six system flags plus open-ended user keywords

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Boolean system flags stored as dedicated columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemFlag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
}

impl SystemFlag {
    pub const ALL: [SystemFlag; 6] = [
        SystemFlag::Answered,
        SystemFlag::Deleted,
        SystemFlag::Draft,
        SystemFlag::Flagged,
        SystemFlag::Recent,
        SystemFlag::Seen,
    ];

    /// IMAP wire name (e.g. `\Seen`)
    pub fn imap_name(self) -> &'static str {
        match self {
            SystemFlag::Answered => "\\Answered",
            SystemFlag::Deleted => "\\Deleted",
            SystemFlag::Draft => "\\Draft",
            SystemFlag::Flagged => "\\Flagged",
            SystemFlag::Recent => "\\Recent",
            SystemFlag::Seen => "\\Seen",
        }
    }

    /// Parse an IMAP system flag name, case-insensitively
    pub fn from_imap_name(name: &str) -> Option<Self> {
        SystemFlag::ALL
            .into_iter()
            .find(|f| f.imap_name().eq_ignore_ascii_case(name))
    }
}

/// Flag set of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub answered: bool,
    pub deleted: bool,
    pub draft: bool,
    pub flagged: bool,
    pub recent: bool,
    pub seen: bool,
    /// User-defined keywords, kept sorted and deduplicated
    #[serde(default)]
    pub user_flags: BTreeSet<String>,
}

impl Flags {
    /// Empty flag set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list of IMAP flag names; anything that is not a system flag
    /// becomes a user keyword
    pub fn from_imap<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(Flags::new(), |flags, name| {
            match SystemFlag::from_imap_name(name) {
                Some(flag) => flags.with(flag),
                None => flags.with_user_flag(name),
            }
        })
    }

    pub fn with(mut self, flag: SystemFlag) -> Self {
        self.set(flag, true);
        self
    }

    pub fn with_user_flag(mut self, flag: impl Into<String>) -> Self {
        self.user_flags.insert(flag.into());
        self
    }

    pub fn contains(&self, flag: SystemFlag) -> bool {
        match flag {
            SystemFlag::Answered => self.answered,
            SystemFlag::Deleted => self.deleted,
            SystemFlag::Draft => self.draft,
            SystemFlag::Flagged => self.flagged,
            SystemFlag::Recent => self.recent,
            SystemFlag::Seen => self.seen,
        }
    }

    pub fn set(&mut self, flag: SystemFlag, value: bool) {
        let slot = match flag {
            SystemFlag::Answered => &mut self.answered,
            SystemFlag::Deleted => &mut self.deleted,
            SystemFlag::Draft => &mut self.draft,
            SystemFlag::Flagged => &mut self.flagged,
            SystemFlag::Recent => &mut self.recent,
            SystemFlag::Seen => &mut self.seen,
        };
        *slot = value;
    }

    pub fn contains_user_flag(&self, flag: &str) -> bool {
        self.user_flags.contains(flag)
    }

    /// System flags that are set, in [`SystemFlag::ALL`] order
    pub fn system_flags(&self) -> impl Iterator<Item = SystemFlag> + '_ {
        SystemFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }

    pub fn is_empty(&self) -> bool {
        self.system_flags().next().is_none() && self.user_flags.is_empty()
    }

    /// Every flag set in either `self` or `other`
    pub fn union(&self, other: &Flags) -> Flags {
        let mut result = self.clone();
        for flag in other.system_flags() {
            result.set(flag, true);
        }
        result.user_flags.extend(other.user_flags.iter().cloned());
        result
    }

    /// Flags of `self` that are not set in `other`
    pub fn difference(&self, other: &Flags) -> Flags {
        let mut result = self.clone();
        for flag in other.system_flags() {
            result.set(flag, false);
        }
        result.user_flags.retain(|f| !other.user_flags.contains(f));
        result
    }

    /// IMAP rendering, system flags first
    pub fn to_imap(&self) -> Vec<String> {
        self.system_flags()
            .map(|f| f.imap_name().to_string())
            .chain(self.user_flags.iter().cloned())
            .collect()
    }
}

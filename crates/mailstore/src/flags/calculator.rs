//! Pure flag computation for STORE-style updates

use serde::{Deserialize, Serialize};

use crate::models::Flags;

/// How provided flags combine with the current ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagsUpdateMode {
    Replace,
    Add,
    Remove,
}

/// A flag update: target flags plus the mode to apply them with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsUpdateRequest {
    pub provided_flags: Flags,
    pub mode: FlagsUpdateMode,
}

impl FlagsUpdateRequest {
    pub fn new(provided_flags: Flags, mode: FlagsUpdateMode) -> Self {
        Self {
            provided_flags,
            mode,
        }
    }

    pub fn replace(flags: Flags) -> Self {
        Self::new(flags, FlagsUpdateMode::Replace)
    }

    pub fn add(flags: Flags) -> Self {
        Self::new(flags, FlagsUpdateMode::Add)
    }

    pub fn remove(flags: Flags) -> Self {
        Self::new(flags, FlagsUpdateMode::Remove)
    }

    /// Compute the flags resulting from applying this request to `old_flags`
    pub fn build_new_flags(&self, old_flags: &Flags) -> Flags {
        match self.mode {
            FlagsUpdateMode::Replace => self.provided_flags.clone(),
            FlagsUpdateMode::Add => old_flags.union(&self.provided_flags),
            FlagsUpdateMode::Remove => old_flags.difference(&self.provided_flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemFlag;
    use proptest::collection::btree_set;
    use proptest::prelude::*;

    fn flags_strategy() -> impl Strategy<Value = Flags> {
        (
            any::<[bool; 6]>(),
            btree_set("[a-z$]{1,6}", 0..4),
        )
            .prop_map(|(bits, user_flags)| {
                let mut flags = Flags::new();
                for (flag, on) in SystemFlag::ALL.into_iter().zip(bits) {
                    flags.set(flag, on);
                }
                flags.user_flags = user_flags;
                flags
            })
    }

    #[test]
    fn test_replace_discards_old_flags() {
        let old = Flags::new().with(SystemFlag::Seen).with_user_flag("old");
        let provided = Flags::new().with(SystemFlag::Draft);
        let new = FlagsUpdateRequest::replace(provided.clone()).build_new_flags(&old);
        assert_eq!(new, provided);
    }

    #[test]
    fn test_add_unions() {
        let old = Flags::new().with(SystemFlag::Seen).with_user_flag("a");
        let provided = Flags::new().with(SystemFlag::Flagged).with_user_flag("a").with_user_flag("b");
        let new = FlagsUpdateRequest::add(provided).build_new_flags(&old);
        assert!(new.seen && new.flagged);
        assert_eq!(new.user_flags.len(), 2);
    }

    #[test]
    fn test_remove_clears_requested() {
        let old = Flags::new()
            .with(SystemFlag::Seen)
            .with(SystemFlag::Answered)
            .with_user_flag("a");
        let provided = Flags::new().with(SystemFlag::Seen).with_user_flag("a").with_user_flag("zz");
        let new = FlagsUpdateRequest::remove(provided).build_new_flags(&old);
        assert_eq!(new, Flags::new().with(SystemFlag::Answered));
    }

    #[test]
    fn test_inputs_untouched() {
        let old = Flags::new().with(SystemFlag::Seen);
        let request = FlagsUpdateRequest::remove(Flags::new().with(SystemFlag::Seen));
        let _ = request.build_new_flags(&old);
        assert!(old.seen);
        assert!(request.provided_flags.seen);
    }

    proptest! {
        #[test]
        fn replace_round_trips(f in flags_strategy(), g in flags_strategy()) {
            let replaced = FlagsUpdateRequest::replace(g).build_new_flags(&f);
            let restored = FlagsUpdateRequest::replace(f.clone()).build_new_flags(&replaced);
            prop_assert_eq!(restored, f);
        }

        #[test]
        fn add_is_idempotent(f in flags_strategy(), g in flags_strategy()) {
            let request = FlagsUpdateRequest::add(g);
            let once = request.build_new_flags(&f);
            let twice = request.build_new_flags(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn remove_never_introduces_flags(f in flags_strategy(), g in flags_strategy()) {
            let new = FlagsUpdateRequest::remove(g).build_new_flags(&f);
            for flag in new.system_flags() {
                prop_assert!(f.contains(flag));
            }
            prop_assert!(new.user_flags.is_subset(&f.user_flags));
        }
    }
}

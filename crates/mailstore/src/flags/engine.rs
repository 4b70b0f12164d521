//! Persistence of flag updates and other per-row mutations

use log::{debug, info};
use std::sync::Arc;

use super::{FlagsUpdateRequest, FlagsUpdateStatement};
use crate::error::{Result, StoreError};
use crate::models::{MailboxId, MessageMetadata, MessageUid, ModSeq};
use crate::storage::{run_partitioned, MessageStore, RecentReset, SequenceProvider};

/// Applies flag requests and batch mutations to stored messages
///
/// Every mutation is stamped with a freshly allocated modification sequence.
/// Nothing here reads a row and then writes it back: each write is a single
/// conditional statement evaluated by the backend.
pub struct FlagsMutationEngine {
    sequences: Arc<dyn SequenceProvider>,
    messages: Arc<dyn MessageStore>,
}

impl FlagsMutationEngine {
    pub fn new(sequences: Arc<dyn SequenceProvider>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            sequences,
            messages,
        }
    }

    /// Apply `request` to one message and return its post-image
    ///
    /// With `expected` set, the write only matches a row still at that
    /// modification sequence.
    pub fn apply_flags(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        request: &FlagsUpdateRequest,
        expected: Option<ModSeq>,
    ) -> Result<MessageMetadata> {
        let new_mod_seq = self.sequences.next_mod_seq(mailbox_id)?;
        let statement = FlagsUpdateStatement::for_request(request);

        let updated =
            self.messages
                .update_flags(mailbox_id, uid, &statement, new_mod_seq, expected)?;

        debug!(
            "[STORE] {:?} flags on {}/{} -> modseq {}",
            request.mode, mailbox_id, uid, updated.mod_seq
        );
        Ok(updated)
    }

    /// Clear `\Recent` on `uids`, stamping changed rows with `new_mod_seq`
    ///
    /// Safe to retry with the same `new_mod_seq`: rows already carrying it are
    /// reported in [`RecentReset::already_applied`] and left untouched.
    pub fn reset_recent_flag(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        new_mod_seq: ModSeq,
    ) -> Result<RecentReset> {
        if new_mod_seq > ModSeq::MAX {
            return Err(StoreError::invalid_input(format!(
                "mod_seq {} exceeds {}",
                new_mod_seq,
                ModSeq::MAX
            )));
        }
        let uids = sorted_unique(uids);
        let outcome = run_partitioned(&uids, self.messages.max_list_predicate(), |partition| {
            self.messages
                .reset_recent_batch(mailbox_id, partition, new_mod_seq)
        })?;

        debug!(
            "[STORE] Reset recent on {}: {} updated, {} skipped",
            mailbox_id,
            outcome.updated.len(),
            outcome.skipped()
        );
        Ok(outcome)
    }

    /// Delete `uids` from the mailbox, returning the removed rows
    ///
    /// A modification sequence is allocated first so the mailbox's highest
    /// modification sequence moves past the expunge.
    pub fn delete_by_uids(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
    ) -> Result<Vec<MessageMetadata>> {
        let uids = sorted_unique(uids);
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mod_seq = self.sequences.next_mod_seq(mailbox_id)?;
        let deleted = run_partitioned(&uids, self.messages.max_list_predicate(), |partition| {
            self.messages.delete_batch(mailbox_id, partition)
        })?;

        info!(
            "[STORE] Deleted {} of {} requested messages from {} at modseq {}",
            deleted.len(),
            uids.len(),
            mailbox_id,
            mod_seq
        );
        Ok(deleted)
    }
}

fn sorted_unique(uids: &[MessageUid]) -> Vec<MessageUid> {
    let mut uids = uids.to_vec();
    uids.sort_unstable();
    uids.dedup();
    uids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Flags, MailboxMessage, MessageId, SystemFlag};
    use crate::storage::InMemoryMailboxStore;

    fn setup(max_list_predicate: usize) -> (Arc<InMemoryMailboxStore>, FlagsMutationEngine) {
        let store = Arc::new(InMemoryMailboxStore::with_max_list_predicate(max_list_predicate));
        let engine = FlagsMutationEngine::new(store.clone(), store.clone());
        (store, engine)
    }

    fn append(store: &InMemoryMailboxStore, mailbox: &MailboxId, flags: Flags) -> MessageUid {
        let uid = store.next_uid(mailbox).unwrap();
        let mod_seq = store.next_mod_seq(mailbox).unwrap();
        let message = MailboxMessage::builder(
            mailbox.clone(),
            uid,
            MessageId::new(format!("{}-{}", mailbox, uid)),
        )
        .mod_seq(mod_seq)
        .flags(flags)
        .build();
        store.insert(&message).unwrap();
        uid
    }

    #[test]
    fn test_apply_flags_bumps_mod_seq() {
        let (store, engine) = setup(10);
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new());

        let seen = Flags::new().with(SystemFlag::Seen);
        let added = engine
            .apply_flags(&inbox, uid, &FlagsUpdateRequest::add(seen.clone()), None)
            .unwrap();
        assert!(added.flags.seen);
        assert_eq!(added.mod_seq, ModSeq(2));

        let removed = engine
            .apply_flags(&inbox, uid, &FlagsUpdateRequest::remove(seen), None)
            .unwrap();
        assert!(!removed.flags.seen);
        assert_eq!(removed.mod_seq, ModSeq(3));
    }

    #[test]
    fn test_apply_flags_missing_row() {
        let (_store, engine) = setup(10);
        let result = engine.apply_flags(
            &MailboxId::new("inbox"),
            MessageUid(99),
            &FlagsUpdateRequest::add(Flags::new().with(SystemFlag::Flagged)),
            None,
        );
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_apply_flags_expected_mod_seq() {
        let (store, engine) = setup(10);
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new());
        let request = FlagsUpdateRequest::add(Flags::new().with(SystemFlag::Answered));

        let result = engine.apply_flags(&inbox, uid, &request, Some(ModSeq(7)));
        match result {
            Err(StoreError::ModSeqConflict { actual, .. }) => assert_eq!(actual, ModSeq(1)),
            other => panic!("expected conflict, got {:?}", other),
        }

        let updated = engine
            .apply_flags(&inbox, uid, &request, Some(ModSeq(1)))
            .unwrap();
        assert!(updated.flags.answered);
    }

    #[test]
    fn test_reset_recent_is_idempotent() {
        let (store, engine) = setup(2);
        let inbox = MailboxId::new("inbox");
        let recent = Flags::new().with(SystemFlag::Recent);
        let uids: Vec<MessageUid> = (0..5).map(|_| append(&store, &inbox, recent.clone())).collect();
        let target = store.next_mod_seq(&inbox).unwrap();

        let mut request = uids.clone();
        request.push(MessageUid(42));
        let first = engine.reset_recent_flag(&inbox, &request, target).unwrap();
        assert_eq!(first.updated.len(), 5);
        assert!(first.updated.iter().all(|m| !m.flags.recent && m.mod_seq == target));
        assert_eq!(first.missing, vec![MessageUid(42)]);

        let retry = engine.reset_recent_flag(&inbox, &uids, target).unwrap();
        assert!(retry.updated.is_empty());
        assert_eq!(retry.already_applied, uids);
    }

    #[test]
    fn test_reset_recent_rejects_unstorable_mod_seq() {
        let (store, engine) = setup(2);
        let inbox = MailboxId::new("inbox");
        let uids: Vec<MessageUid> = (0..3)
            .map(|_| append(&store, &inbox, Flags::new().with(SystemFlag::Recent)))
            .collect();

        let result = engine.reset_recent_flag(&inbox, &uids, ModSeq(u64::MAX));
        assert!(matches!(result, Err(StoreError::InvalidInput { .. })));
        assert!(store
            .find(&inbox, uids[0], crate::models::FetchType::Metadata)
            .unwrap()
            .unwrap()
            .flags
            .recent);
    }

    #[test]
    fn test_delete_by_uids_partitions() {
        let (store, engine) = setup(2);
        let inbox = MailboxId::new("inbox");
        let uids: Vec<MessageUid> = (0..5).map(|_| append(&store, &inbox, Flags::new())).collect();
        let before = store.highest_mod_seq(&inbox).unwrap();

        let deleted = engine.delete_by_uids(&inbox, &uids[1..4]).unwrap();
        let deleted: Vec<MessageUid> = deleted.iter().map(|m| m.uid).collect();
        assert_eq!(deleted, uids[1..4].to_vec());
        assert!(store.highest_mod_seq(&inbox).unwrap() > before);
        assert_eq!(store.count_total_and_unseen(&inbox).unwrap().total, 2);
    }

    #[test]
    fn test_unavailable_sequence_fails_before_write() {
        let (store, engine) = setup(10);
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new());
        store.set_available(false);

        let result = engine.apply_flags(
            &inbox,
            uid,
            &FlagsUpdateRequest::add(Flags::new().with(SystemFlag::Seen)),
            None,
        );
        assert!(matches!(result, Err(StoreError::SequenceAllocation { .. })));

        store.set_available(true);
        let stored = store.find(&inbox, uid, crate::models::FetchType::Metadata).unwrap().unwrap();
        assert!(!stored.flags.seen);
    }
}

//! Message listings built on the paginator

use log::debug;

use crate::error::Result;
use crate::models::{
    FetchType, Limit, MailboxId, MailboxMessage, MessageMetadata, MessageRange, MessageUid,
    ScanFilter,
};
use crate::storage::{MessageStore, PageRequest, run_partitioned};

use super::Paginated;

/// Ordered scans over the messages of a mailbox
pub struct MessageScanner<'a> {
    store: &'a dyn MessageStore,
    batch_size: usize,
}

impl<'a> MessageScanner<'a> {
    pub fn new(store: &'a dyn MessageStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Rows of `range` matching `filter`, ascending by UID
    pub fn scan(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
        filter: ScanFilter,
        limit: Limit,
        fetch: FetchType,
    ) -> Paginated<'a, MailboxMessage, MessageUid> {
        let store = self.store;
        let mailbox_id = mailbox_id.clone();
        Paginated::new(self.batch_size, limit, |row| row.uid, move |after, size| {
            store.fetch_page(
                &PageRequest {
                    mailbox_id: &mailbox_id,
                    range,
                    filter,
                    after,
                    limit: size,
                },
                fetch,
            )
        })
    }

    /// Every row of `range`
    pub fn messages(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
        limit: Limit,
        fetch: FetchType,
    ) -> Paginated<'a, MailboxMessage, MessageUid> {
        self.scan(mailbox_id, range, ScanFilter::Any, limit, fetch)
    }

    /// Metadata of every row of `range`
    pub fn metadata(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
        limit: Limit,
    ) -> impl Iterator<Item = Result<MessageMetadata>> + use<'a> {
        self.messages(mailbox_id, range, limit, FetchType::Metadata)
            .map(|row| row.map(|message| message.metadata()))
    }

    /// Rows of `uids`, ascending, fetched in partitions the store accepts
    ///
    /// UIDs without a row are skipped.
    pub fn find_by_uids(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage>> {
        let mut uids = uids.to_vec();
        uids.sort_unstable();
        uids.dedup();

        let rows: Vec<MailboxMessage> =
            run_partitioned(&uids, self.store.max_list_predicate(), |partition| {
                self.store.fetch_batch(mailbox_id, partition, fetch)
            })?;
        debug!(
            "[SCAN] Fetched {} of {} requested uids from {}",
            rows.len(),
            uids.len(),
            mailbox_id
        );
        Ok(rows)
    }

    /// UIDs of `range` matching `filter`, without materializing rows
    pub fn uids(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
        filter: ScanFilter,
        limit: Limit,
    ) -> Paginated<'a, MessageUid, MessageUid> {
        let store = self.store;
        let mailbox_id = mailbox_id.clone();
        Paginated::new(self.batch_size, limit, |uid| *uid, move |after, size| {
            store.fetch_uid_page(&PageRequest {
                mailbox_id: &mailbox_id,
                range,
                filter,
                after,
                limit: size,
            })
        })
    }

    pub fn unseen_uids(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
    ) -> Paginated<'a, MessageUid, MessageUid> {
        self.uids(mailbox_id, range, ScanFilter::Unseen, Limit::Unlimited)
    }

    pub fn recent_uids(&self, mailbox_id: &MailboxId) -> Paginated<'a, MessageUid, MessageUid> {
        self.uids(mailbox_id, MessageRange::All, ScanFilter::Recent, Limit::Unlimited)
    }

    pub fn not_deleted_uids(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
    ) -> Paginated<'a, MessageUid, MessageUid> {
        self.uids(mailbox_id, range, ScanFilter::NotDeleted, Limit::Unlimited)
    }

    pub fn deleted_uids(
        &self,
        mailbox_id: &MailboxId,
        range: MessageRange,
    ) -> Paginated<'a, MessageUid, MessageUid> {
        self.uids(mailbox_id, range, ScanFilter::Deleted, Limit::Unlimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Flags, MessageId, ModSeq, SystemFlag};
    use crate::storage::InMemoryMailboxStore;

    fn store_with(flags: &[Flags]) -> InMemoryMailboxStore {
        let store = InMemoryMailboxStore::new();
        for (i, flags) in flags.iter().enumerate() {
            let uid = i as u64 + 1;
            let message = MailboxMessage::builder(
                MailboxId::new("inbox"),
                MessageUid(uid),
                MessageId::new(format!("m{}", uid)),
            )
            .mod_seq(ModSeq(uid))
            .flags(flags.clone())
            .build();
            store.insert(&message).unwrap();
        }
        store
    }

    fn uids(scan: Paginated<'_, MessageUid, MessageUid>) -> Vec<u64> {
        scan.map(|uid| uid.unwrap().as_u64()).collect()
    }

    #[test]
    fn test_pages_of_two_over_three_messages() {
        let store = store_with(&[Flags::new(), Flags::new(), Flags::new()]);
        let scanner = MessageScanner::new(&store, 2);
        let inbox = MailboxId::new("inbox");

        let mut scan = scanner.messages(&inbox, MessageRange::All, Limit::Unlimited, FetchType::Metadata);
        let first = scan.next_page().unwrap().unwrap();
        let second = scan.next_page().unwrap().unwrap();
        assert_eq!(first.iter().map(|m| m.uid.as_u64()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.iter().map(|m| m.uid.as_u64()).collect::<Vec<_>>(), vec![3]);
        assert!(scan.next_page().is_none());
        assert_eq!(scan.pages_fetched(), 2);
    }

    #[test]
    fn test_range_beyond_last_uid_is_empty() {
        let store = store_with(&[Flags::new(), Flags::new()]);
        let scanner = MessageScanner::new(&store, 2);
        let scan = scanner.uids(
            &MailboxId::new("inbox"),
            MessageRange::From(MessageUid(10)),
            ScanFilter::Any,
            Limit::Unlimited,
        );
        assert!(uids(scan).is_empty());
    }

    #[test]
    fn test_filtered_listings() {
        let seen = Flags::new().with(SystemFlag::Seen);
        let deleted = Flags::new().with(SystemFlag::Deleted).with(SystemFlag::Seen);
        let recent = Flags::new().with(SystemFlag::Recent);
        let store = store_with(&[seen, recent.clone(), deleted, recent, Flags::new()]);
        let scanner = MessageScanner::new(&store, 2);
        let inbox = MailboxId::new("inbox");

        assert_eq!(uids(scanner.unseen_uids(&inbox, MessageRange::All)), vec![2, 4, 5]);
        assert_eq!(uids(scanner.recent_uids(&inbox)), vec![2, 4]);
        assert_eq!(uids(scanner.deleted_uids(&inbox, MessageRange::All)), vec![3]);
        assert_eq!(
            uids(scanner.not_deleted_uids(&inbox, MessageRange::Range(MessageUid(2), MessageUid(4)))),
            vec![2, 4]
        );
    }

    #[test]
    fn test_find_by_uids_spans_partitions() {
        let store = InMemoryMailboxStore::with_max_list_predicate(2);
        for uid in 1..=5 {
            let message = MailboxMessage::builder(
                MailboxId::new("inbox"),
                MessageUid(uid),
                MessageId::new(format!("m{}", uid)),
            )
            .content(format!("body {}", uid).into_bytes())
            .build();
            store.insert(&message).unwrap();
        }
        let scanner = MessageScanner::new(&store, 10);

        let request: Vec<MessageUid> = [5, 1, 3, 9, 1, 4].into_iter().map(MessageUid).collect();
        let rows = scanner
            .find_by_uids(&MailboxId::new("inbox"), &request, FetchType::Full)
            .unwrap();
        let found: Vec<u64> = rows.iter().map(|m| m.uid.as_u64()).collect();
        assert_eq!(found, vec![1, 3, 4, 5]);
        assert_eq!(rows[0].content.as_deref(), Some(&b"body 1"[..]));

        assert!(scanner
            .find_by_uids(&MailboxId::new("inbox"), &[], FetchType::Metadata)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_metadata_respects_limit() {
        let store = store_with(&vec![Flags::new(); 7]);
        let scanner = MessageScanner::new(&store, 5);
        let metadata: Vec<MessageMetadata> = scanner
            .metadata(&MailboxId::new("inbox"), MessageRange::From(MessageUid(2)), Limit::Limited(3))
            .collect::<Result<_>>()
            .unwrap();
        let uids: Vec<u64> = metadata.iter().map(|m| m.uid.as_u64()).collect();
        assert_eq!(uids, vec![2, 3, 4]);
    }
}

//! Change log reads and writes on top of a [`ChangeLogStore`]

use chrono::{Duration, Utc};
use log::{debug, warn};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::models::{AccountId, ChangeDraft, ChangeRecord, ChangesPage, Limit, State};
use crate::scan::Paginated;
use crate::storage::{ChangeLogStore, ChangePageRequest};

/// Records account changes and serves them back by state
pub struct ChangeLogRepository {
    store: Arc<dyn ChangeLogStore>,
    /// How long a record stays readable, `None` for ever
    retention: Option<Duration>,
    batch_size: usize,
}

impl ChangeLogRepository {
    pub fn new(store: Arc<dyn ChangeLogStore>, retention: Option<Duration>, batch_size: usize) -> Self {
        Self {
            store,
            retention,
            batch_size: batch_size.max(1),
        }
    }

    /// Append a change, allocating its state
    pub fn record_change(&self, draft: ChangeDraft) -> Result<ChangeRecord> {
        let expires_at = self
            .retention
            .and_then(|retention| draft.date.checked_add_signed(retention));
        let record = self.store.append(draft, expires_at)?;

        debug!(
            "[CHANGES] Recorded state {} for account {} (delegated: {})",
            record.state, record.account_id, record.is_delegated
        );
        Ok(record)
    }

    /// Every retained record of the account, ascending by state
    pub fn all_changes(&self, account_id: &AccountId) -> Paginated<'_, ChangeRecord, State> {
        self.scan_from(account_id, State::INITIAL, Limit::Unlimited)
    }

    /// Records with a state greater than or equal to `since`, ascending
    ///
    /// The first page is read before returning so that a checkpoint that fell
    /// out of retention is reported as [`StoreError::StaleState`] instead of
    /// silently yielding an incomplete delta. A state never allocated for
    /// the account is [`StoreError::NotFound`].
    pub fn changes_since(
        &self,
        account_id: &AccountId,
        since: State,
    ) -> Result<Paginated<'_, ChangeRecord, State>> {
        self.checked_scan(account_id, since, Limit::Unlimited)
    }

    /// At most `max_changes` records from `since`, and whether more exist
    pub fn changes_since_limited(
        &self,
        account_id: &AccountId,
        since: State,
        max_changes: usize,
    ) -> Result<ChangesPage> {
        let mut changes = self
            .checked_scan(account_id, since, Limit::Limited(max_changes.saturating_add(1)))?
            .collect::<Result<Vec<_>>>()?;

        let has_more = changes.len() > max_changes;
        changes.truncate(max_changes);
        Ok(ChangesPage { changes, has_more })
    }

    /// Greatest state ever recorded, [`State::INITIAL`] for a new account
    pub fn latest_state(&self, account_id: &AccountId) -> Result<State> {
        Ok(self.store.heads(account_id)?.latest)
    }

    /// Greatest state among records that are not delegated
    pub fn latest_state_not_delegated(&self, account_id: &AccountId) -> Result<State> {
        Ok(self.store.heads(account_id)?.latest_not_delegated)
    }

    /// Physically remove expired records
    pub fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired(Utc::now())
    }

    fn scan_from(
        &self,
        account_id: &AccountId,
        from: State,
        limit: Limit,
    ) -> Paginated<'_, ChangeRecord, State> {
        let store = &*self.store;
        let account_id = account_id.clone();
        let now = Utc::now();
        Paginated::new(self.batch_size, limit, |record| record.state, move |after, size| {
            store.changes_page(&ChangePageRequest {
                account_id: &account_id,
                from,
                after,
                now,
                limit: size,
            })
        })
    }

    fn checked_scan(
        &self,
        account_id: &AccountId,
        since: State,
        limit: Limit,
    ) -> Result<Paginated<'_, ChangeRecord, State>> {
        let latest = self.store.heads(account_id)?.latest;
        if since > latest {
            return Err(StoreError::not_found(format!(
                "state {} of account {}",
                since, account_id
            )));
        }
        if since.is_initial() && latest.is_initial() {
            return Ok(self.scan_from(account_id, since, Limit::Limited(0)));
        }

        // The record at the checkpoint must still be retained
        let boundary = if since.is_initial() { since.next() } else { since };
        let mut scan = self.scan_from(account_id, since, limit);
        scan.prime()?;

        match scan.buffered().first() {
            Some(first) if first.state == boundary => Ok(scan),
            _ => {
                warn!(
                    "[CHANGES] State {} of account {} expired, full resync required",
                    since, account_id
                );
                Err(StoreError::StaleState {
                    account_id: account_id.clone(),
                    state: since,
                })
            }
        }
    }
}

//! Change log tables

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{OptionalExtension, params};

use super::{SqliteMailboxStore, parse_date, write_tx};
use crate::error::{Result, StoreError};
use crate::models::{AccountId, ChangeDraft, ChangeLogHeads, ChangeRecord, State};
use crate::storage::{ChangeLogStore, ChangePageRequest};

fn encode_ids(ids: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(ids)
        .map_err(|e| StoreError::corrupted(format!("failed to encode identifiers: {}", e)))
}

fn decode_ids(json: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(json)
        .map_err(|e| StoreError::corrupted(format!("invalid identifier set: {}", e)))
}

fn to_state(value: i64) -> Result<State> {
    u64::try_from(value)
        .map(State)
        .map_err(|_| StoreError::corrupted(format!("negative state {}", value)))
}

/// Raw columns of one change row
struct ChangeRow {
    state: i64,
    date: String,
    is_count_change: bool,
    is_delegated: bool,
    created: String,
    updated: String,
    destroyed: String,
}

impl ChangeRow {
    fn into_record(self, account_id: &AccountId) -> Result<ChangeRecord> {
        Ok(ChangeRecord {
            account_id: account_id.clone(),
            state: to_state(self.state)?,
            date: parse_date(&self.date)?,
            is_count_change: self.is_count_change,
            is_delegated: self.is_delegated,
            created: decode_ids(&self.created)?,
            updated: decode_ids(&self.updated)?,
            destroyed: decode_ids(&self.destroyed)?,
        })
    }
}

impl ChangeLogStore for SqliteMailboxStore {
    fn append(&self, draft: ChangeDraft, expires_at: Option<DateTime<Utc>>) -> Result<ChangeRecord> {
        let created = encode_ids(&draft.created)?;
        let updated = encode_ids(&draft.updated)?;
        let destroyed = encode_ids(&draft.destroyed)?;

        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        // Allocate the state and move the heads in one statement
        let state: i64 = tx.query_row(
            "INSERT INTO change_log_heads (account_id, latest, latest_not_delegated)
             VALUES (?1, 1, CASE WHEN ?2 THEN 0 ELSE 1 END)
             ON CONFLICT(account_id) DO UPDATE SET
                latest = latest + 1,
                latest_not_delegated =
                    CASE WHEN ?2 THEN latest_not_delegated ELSE latest + 1 END
             RETURNING latest",
            params![draft.account_id.as_str(), draft.is_delegated],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO changes
             (account_id, state, date, is_count_change, is_delegated,
              created, updated, destroyed, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                draft.account_id.as_str(),
                state,
                draft.date.to_rfc3339(),
                draft.is_count_change,
                draft.is_delegated,
                created,
                updated,
                destroyed,
                expires_at.map(|at| at.timestamp_millis()),
            ],
        )?;

        tx.commit()?;
        Ok(draft.into_record(to_state(state)?))
    }

    fn changes_page(&self, request: &ChangePageRequest<'_>) -> Result<Vec<ChangeRecord>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let lower = request.after.map(State::next).unwrap_or(request.from);
        // States are stored as INTEGER, nothing lies above i64::MAX
        let Ok(lower) = i64::try_from(lower.0) else {
            return Ok(Vec::new());
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT state, date, is_count_change, is_delegated, created, updated, destroyed
             FROM changes
             WHERE account_id = ?1 AND state >= ?2
               AND (expires_at IS NULL OR expires_at > ?3)
             ORDER BY state ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    request.account_id.as_str(),
                    lower,
                    request.now.timestamp_millis(),
                    i64::try_from(request.limit).unwrap_or(i64::MAX),
                ],
                |row| {
                    Ok(ChangeRow {
                        state: row.get(0)?,
                        date: row.get(1)?,
                        is_count_change: row.get(2)?,
                        is_delegated: row.get(3)?,
                        created: row.get(4)?,
                        updated: row.get(5)?,
                        destroyed: row.get(6)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|row| row.into_record(request.account_id))
            .collect()
    }

    fn heads(&self, account_id: &AccountId) -> Result<ChangeLogHeads> {
        let conn = self.conn()?;
        let heads: Option<(i64, i64)> = conn
            .query_row(
                "SELECT latest, latest_not_delegated FROM change_log_heads WHERE account_id = ?",
                [account_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match heads {
            Some((latest, latest_not_delegated)) => Ok(ChangeLogHeads {
                latest: to_state(latest)?,
                latest_not_delegated: to_state(latest_not_delegated)?,
            }),
            None => Ok(ChangeLogHeads::default()),
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let purged = conn.execute(
            "DELETE FROM changes WHERE expires_at IS NOT NULL AND expires_at <= ?",
            [now.timestamp_millis()],
        )?;
        if purged > 0 {
            info!("[CHANGES] Purged {} expired change records", purged);
        }
        Ok(purged)
    }
}

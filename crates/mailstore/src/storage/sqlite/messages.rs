//! Message rows: inserts, paged reads and conditional flag writes

use std::collections::{BTreeSet, HashMap};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{SqliteMailboxStore, parse_date, placeholders, write_tx};
use crate::error::{Result, StoreError};
use crate::flags::{FlagsUpdateStatement, UserFlagsChange};
use crate::models::{
    FetchType, Flags, MailboxCounters, MailboxId, MailboxMessage, MessageId, MessageMetadata,
    MessageUid, ModSeq, ScanFilter, SystemFlag, ThreadId,
};
use crate::storage::{MessageStore, PageRequest, RecentReset};

const ZSTD_LEVEL: i32 = 3;

/// Columns shared by both fetch types, in [`MessageRow`] order
const METADATA_COLUMNS: &str = "m.mailbox_id, m.uid, m.mod_seq, m.message_id, m.thread_id,
    m.internal_date, m.size, m.save_date,
    m.answered, m.deleted, m.draft, m.flagged, m.recent, m.seen,
    (SELECT json_group_array(f.flag) FROM message_user_flags f
      WHERE f.mailbox_id = m.mailbox_id AND f.uid = m.uid)";

/// Projection and joins for a fetch type
fn select_from(fetch: FetchType) -> String {
    match fetch {
        FetchType::Metadata => format!("SELECT {} FROM mailbox_messages m", METADATA_COLUMNS),
        FetchType::Full => format!(
            "SELECT {}, c.content FROM mailbox_messages m
             LEFT JOIN message_contents c ON c.message_id = m.message_id",
            METADATA_COLUMNS
        ),
    }
}

fn flag_column(flag: SystemFlag) -> &'static str {
    match flag {
        SystemFlag::Answered => "answered",
        SystemFlag::Deleted => "deleted",
        SystemFlag::Draft => "draft",
        SystemFlag::Flagged => "flagged",
        SystemFlag::Recent => "recent",
        SystemFlag::Seen => "seen",
    }
}

fn filter_clause(filter: ScanFilter) -> &'static str {
    match filter {
        ScanFilter::Any => "",
        ScanFilter::Unseen => " AND m.seen = 0",
        ScanFilter::Recent => " AND m.recent = 1",
        ScanFilter::NotDeleted => " AND m.deleted = 0",
        ScanFilter::Deleted => " AND m.deleted = 1",
    }
}

/// `WHERE ... ORDER BY ... LIMIT ...` of a page request and its parameters
///
/// `None` when the request can only match UIDs above [`MessageUid::MAX`].
fn page_predicate(request: &PageRequest<'_>) -> Option<(String, Vec<Value>)> {
    let mut sql = String::from(" WHERE m.mailbox_id = ? AND m.uid >= ?");
    let mut values = vec![
        Value::Text(request.mailbox_id.as_str().to_string()),
        Value::Integer(stored_uid(request.range.lower())?),
    ];
    if let Some(upper) = request.range.upper() {
        sql.push_str(" AND m.uid <= ?");
        values.push(Value::Integer(stored_uid(upper).unwrap_or(i64::MAX)));
    }
    if let Some(after) = request.after {
        sql.push_str(" AND m.uid > ?");
        values.push(Value::Integer(stored_uid(after)?));
    }
    sql.push_str(filter_clause(request.filter));
    sql.push_str(" ORDER BY m.uid ASC LIMIT ?");
    values.push(Value::Integer(i64::try_from(request.limit).unwrap_or(i64::MAX)));
    Some((sql, values))
}

/// The single UPDATE statement of a flag write
///
/// Parameters: `?1` mailbox, `?2` uid, `?3` new modseq, `?4` expected modseq.
fn update_flags_sql(statement: &FlagsUpdateStatement, with_expected: bool) -> String {
    let mut sql = String::from("UPDATE mailbox_messages SET mod_seq = ?3");
    for (flag, value) in statement.assignments() {
        sql.push_str(&format!(", {} = {}", flag_column(*flag), u8::from(*value)));
    }
    sql.push_str(" WHERE mailbox_id = ?1 AND uid = ?2");
    if with_expected {
        sql.push_str(" AND mod_seq = ?4");
    }
    sql.push_str(" RETURNING mod_seq");
    sql
}

/// Column value of a UID; `None` above [`MessageUid::MAX`], where no row exists
fn stored_uid(uid: MessageUid) -> Option<i64> {
    i64::try_from(uid.as_u64()).ok()
}

/// Column values of the UIDs a row can exist for
fn stored_uids(uids: &[MessageUid]) -> Vec<i64> {
    uids.iter().copied().filter_map(stored_uid).collect()
}

/// Parameter of a written column, rejecting values an INTEGER cannot hold
fn column_param(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::invalid_input(format!("{} {} exceeds {}", column, value, i64::MAX)))
}

fn uid_values(mailbox_id: &MailboxId, uids: &[i64]) -> Vec<Value> {
    std::iter::once(Value::Text(mailbox_id.as_str().to_string()))
        .chain(uids.iter().copied().map(Value::Integer))
        .collect()
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::corrupted(format!("negative {}: {}", column, value)))
}

/// Raw columns of one message row
struct MessageRow {
    mailbox_id: String,
    uid: i64,
    mod_seq: i64,
    message_id: String,
    thread_id: String,
    internal_date: String,
    size: i64,
    save_date: Option<String>,
    system_flags: [bool; 6],
    user_flags: String,
    content: Option<Vec<u8>>,
}

impl MessageRow {
    fn read(row: &Row<'_>, fetch: FetchType) -> rusqlite::Result<Self> {
        Ok(Self {
            mailbox_id: row.get(0)?,
            uid: row.get(1)?,
            mod_seq: row.get(2)?,
            message_id: row.get(3)?,
            thread_id: row.get(4)?,
            internal_date: row.get(5)?,
            size: row.get(6)?,
            save_date: row.get(7)?,
            system_flags: [
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
            ],
            user_flags: row.get(14)?,
            content: match fetch {
                FetchType::Metadata => None,
                FetchType::Full => row.get(15)?,
            },
        })
    }

    fn into_message(self) -> Result<MailboxMessage> {
        let [answered, deleted, draft, flagged, recent, seen] = self.system_flags;
        let user_flags: BTreeSet<String> = serde_json::from_str(&self.user_flags)
            .map_err(|e| StoreError::corrupted(format!("invalid user flags: {}", e)))?;

        let content = self
            .content
            .map(|compressed| zstd::decode_all(&compressed[..]))
            .transpose()
            .map_err(|e| StoreError::corrupted(format!("failed to decompress content: {}", e)))?;

        Ok(MailboxMessage {
            mailbox_id: MailboxId::new(self.mailbox_id),
            uid: MessageUid(to_u64(self.uid, "uid")?),
            mod_seq: ModSeq(to_u64(self.mod_seq, "mod_seq")?),
            message_id: MessageId::new(self.message_id),
            thread_id: ThreadId::new(self.thread_id),
            internal_date: parse_date(&self.internal_date)?,
            size: to_u64(self.size, "size")?,
            save_date: self.save_date.as_deref().map(parse_date).transpose()?,
            flags: Flags {
                answered,
                deleted,
                draft,
                flagged,
                recent,
                seen,
                user_flags,
            },
            content,
        })
    }
}

/// Run a message SELECT and decode every row
fn query_messages(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
    fetch: FetchType,
) -> Result<Vec<MailboxMessage>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| MessageRow::read(row, fetch))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(MessageRow::into_message).collect()
}

/// Rows of `uids`, ascending
fn query_uids(
    conn: &Connection,
    mailbox_id: &MailboxId,
    uids: &[MessageUid],
    fetch: FetchType,
) -> Result<Vec<MailboxMessage>> {
    let stored = stored_uids(uids);
    if stored.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "{} WHERE m.mailbox_id = ? AND m.uid IN ({}) ORDER BY m.uid ASC",
        select_from(fetch),
        placeholders(stored.len())
    );
    query_messages(conn, &sql, uid_values(mailbox_id, &stored), fetch)
}

/// Metadata of `uids`, ascending
fn load_metadata(
    conn: &Connection,
    mailbox_id: &MailboxId,
    uids: &[MessageUid],
) -> Result<Vec<MessageMetadata>> {
    Ok(query_uids(conn, mailbox_id, uids, FetchType::Metadata)?
        .iter()
        .map(MailboxMessage::metadata)
        .collect())
}

/// Drop content no longer linked into any mailbox
fn collect_orphaned_content<'a>(
    conn: &Connection,
    message_ids: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let message_ids: BTreeSet<&str> = message_ids.into_iter().collect();
    if message_ids.is_empty() {
        return Ok(());
    }
    conn.execute(
        &format!(
            "DELETE FROM message_contents WHERE message_id IN ({})
             AND NOT EXISTS (SELECT 1 FROM mailbox_messages m
                             WHERE m.message_id = message_contents.message_id)",
            placeholders(message_ids.len())
        ),
        params_from_iter(message_ids),
    )?;
    Ok(())
}

fn load_one(conn: &Connection, mailbox_id: &MailboxId, uid: MessageUid) -> Result<MessageMetadata> {
    load_metadata(conn, mailbox_id, &[uid])?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::not_found(format!("message {}/{}", mailbox_id, uid)))
}

fn insert_user_flags<'a>(
    conn: &Connection,
    mailbox_id: &MailboxId,
    uid_param: i64,
    flags: impl IntoIterator<Item = &'a String>,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO message_user_flags (mailbox_id, uid, flag) VALUES (?, ?, ?)",
    )?;
    for flag in flags {
        stmt.execute(params![mailbox_id.as_str(), uid_param, flag])?;
    }
    Ok(())
}

fn apply_user_flags(
    conn: &Connection,
    mailbox_id: &MailboxId,
    uid_param: i64,
    change: &UserFlagsChange,
) -> Result<()> {
    match change {
        UserFlagsChange::Unchanged => Ok(()),
        UserFlagsChange::Append(added) => insert_user_flags(conn, mailbox_id, uid_param, added),
        UserFlagsChange::Remove(removed) => {
            let mut stmt = conn.prepare_cached(
                "DELETE FROM message_user_flags WHERE mailbox_id = ? AND uid = ? AND flag = ?",
            )?;
            for flag in removed {
                stmt.execute(params![mailbox_id.as_str(), uid_param, flag])?;
            }
            Ok(())
        }
        UserFlagsChange::Replace(replacement) => {
            conn.execute(
                "DELETE FROM message_user_flags WHERE mailbox_id = ? AND uid = ?",
                params![mailbox_id.as_str(), uid_param],
            )?;
            insert_user_flags(conn, mailbox_id, uid_param, replacement)
        }
    }
}

impl MessageStore for SqliteMailboxStore {
    fn insert(&self, message: &MailboxMessage) -> Result<()> {
        let uid_param = column_param(message.uid.as_u64(), "uid")?;
        let mod_seq_param = column_param(message.mod_seq.as_u64(), "mod_seq")?;
        let size_param = column_param(message.size, "size")?;
        let compressed = message
            .content
            .as_ref()
            .map(|content| zstd::encode_all(&content[..], ZSTD_LEVEL))
            .transpose()
            .map_err(|e| StoreError::corrupted(format!("failed to compress content: {}", e)))?;

        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let flags = &message.flags;
        tx.execute(
            "INSERT INTO mailbox_messages
             (mailbox_id, uid, mod_seq, message_id, thread_id, internal_date, size, save_date,
              answered, deleted, draft, flagged, recent, seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                message.mailbox_id.as_str(),
                uid_param,
                mod_seq_param,
                message.message_id.as_str(),
                message.thread_id.as_str(),
                message.internal_date.to_rfc3339(),
                size_param,
                message.save_date.map(|date| date.to_rfc3339()),
                flags.answered,
                flags.deleted,
                flags.draft,
                flags.flagged,
                flags.recent,
                flags.seen,
            ],
        )
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists { .. } => StoreError::AlreadyExists {
                resource: format!("message {}/{}", message.mailbox_id, message.uid),
            },
            other => other,
        })?;

        insert_user_flags(&tx, &message.mailbox_id, uid_param, &flags.user_flags)?;

        if let Some(compressed) = compressed {
            tx.execute(
                "INSERT OR IGNORE INTO message_contents (message_id, content) VALUES (?, ?)",
                params![message.message_id.as_str(), compressed],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn find(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        fetch: FetchType,
    ) -> Result<Option<MailboxMessage>> {
        let Some(uid_param) = stored_uid(uid) else {
            return Ok(None);
        };
        let conn = self.conn()?;
        let sql = format!("{} WHERE m.mailbox_id = ? AND m.uid = ?", select_from(fetch));
        Ok(query_messages(&conn, &sql, uid_values(mailbox_id, &[uid_param]), fetch)?
            .into_iter()
            .next())
    }

    fn fetch_page(&self, request: &PageRequest<'_>, fetch: FetchType) -> Result<Vec<MailboxMessage>> {
        let Some((predicate, values)) = page_predicate(request).filter(|_| request.limit > 0) else {
            return Ok(Vec::new());
        };
        let conn = self.conn()?;
        let sql = format!("{}{}", select_from(fetch), predicate);
        query_messages(&conn, &sql, values, fetch)
    }

    fn fetch_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        fetch: FetchType,
    ) -> Result<Vec<MailboxMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        query_uids(&conn, mailbox_id, uids, fetch)
    }

    fn fetch_uid_page(&self, request: &PageRequest<'_>) -> Result<Vec<MessageUid>> {
        let Some((predicate, values)) = page_predicate(request).filter(|_| request.limit > 0) else {
            return Ok(Vec::new());
        };
        let conn = self.conn()?;
        let sql = format!("SELECT m.uid FROM mailbox_messages m{}", predicate);

        let mut stmt = conn.prepare(&sql)?;
        let uids = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        uids.into_iter()
            .map(|uid| to_u64(uid, "uid").map(MessageUid))
            .collect()
    }

    fn update_flags(
        &self,
        mailbox_id: &MailboxId,
        uid: MessageUid,
        statement: &FlagsUpdateStatement,
        new_mod_seq: ModSeq,
        expected: Option<ModSeq>,
    ) -> Result<MessageMetadata> {
        let mod_seq_param = column_param(new_mod_seq.as_u64(), "mod_seq")?;
        let Some(uid_param) = stored_uid(uid) else {
            return Err(StoreError::not_found(format!("message {}/{}", mailbox_id, uid)));
        };

        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let sql = update_flags_sql(statement, expected.is_some());
        let mailbox_param = mailbox_id.as_str();
        let matched: Option<i64> = match expected {
            // No row carries a modseq above i64::MAX, so the guard cannot match
            Some(expected) => match i64::try_from(expected.as_u64()) {
                Ok(expected_param) => tx
                    .query_row(
                        &sql,
                        params![mailbox_param, uid_param, mod_seq_param, expected_param],
                        |row| row.get(0),
                    )
                    .optional()?,
                Err(_) => None,
            },
            None => tx
                .query_row(&sql, params![mailbox_param, uid_param, mod_seq_param], |row| {
                    row.get(0)
                })
                .optional()?,
        };

        if matched.is_none() {
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT mod_seq FROM mailbox_messages WHERE mailbox_id = ? AND uid = ?",
                    params![mailbox_param, uid_param],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match (actual, expected) {
                (Some(actual), Some(expected)) => StoreError::ModSeqConflict {
                    mailbox_id: mailbox_id.clone(),
                    uid,
                    expected,
                    actual: ModSeq(to_u64(actual, "mod_seq")?),
                },
                _ => StoreError::not_found(format!("message {}/{}", mailbox_id, uid)),
            });
        }

        apply_user_flags(&tx, mailbox_id, uid_param, statement.user_flags())?;
        let updated = load_one(&tx, mailbox_id, uid)?;
        tx.commit()?;
        Ok(updated)
    }

    fn reset_recent_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
        new_mod_seq: ModSeq,
    ) -> Result<RecentReset> {
        if uids.is_empty() {
            return Ok(RecentReset::default());
        }
        let target = column_param(new_mod_seq.as_u64(), "mod_seq")?;
        let stored = stored_uids(uids);

        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let current: HashMap<i64, i64> = if stored.is_empty() {
            HashMap::new()
        } else {
            let mut stmt = tx.prepare(&format!(
                "SELECT uid, mod_seq FROM mailbox_messages WHERE mailbox_id = ? AND uid IN ({})",
                placeholders(stored.len())
            ))?;
            stmt.query_map(params_from_iter(uid_values(mailbox_id, &stored)), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?
        };

        let mut outcome = RecentReset::default();
        let mut to_update = Vec::new();
        for uid in uids {
            match stored_uid(*uid).and_then(|key| current.get(&key)) {
                None => outcome.missing.push(*uid),
                Some(mod_seq) if *mod_seq == target => outcome.already_applied.push(*uid),
                Some(_) => to_update.push(*uid),
            }
        }

        if !to_update.is_empty() {
            let mut values = vec![Value::Integer(target)];
            values.extend(uid_values(mailbox_id, &stored_uids(&to_update)));
            values.push(Value::Integer(target));
            tx.execute(
                &format!(
                    "UPDATE mailbox_messages SET recent = 0, mod_seq = ?
                     WHERE mailbox_id = ? AND uid IN ({}) AND mod_seq <> ?",
                    placeholders(to_update.len())
                ),
                params_from_iter(values),
            )?;
            outcome.updated = load_metadata(&tx, mailbox_id, &to_update)?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn delete_batch(
        &self,
        mailbox_id: &MailboxId,
        uids: &[MessageUid],
    ) -> Result<Vec<MessageMetadata>> {
        let stored = stored_uids(uids);
        if stored.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let removed = load_metadata(&tx, mailbox_id, uids)?;
        tx.execute(
            &format!(
                "DELETE FROM mailbox_messages WHERE mailbox_id = ? AND uid IN ({})",
                placeholders(stored.len())
            ),
            params_from_iter(uid_values(mailbox_id, &stored)),
        )?;
        collect_orphaned_content(&tx, removed.iter().map(|m| m.message_id.as_str()))?;

        tx.commit()?;
        Ok(removed)
    }

    fn delete_mailbox(&self, mailbox_id: &MailboxId) -> Result<Vec<MessageId>> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let mut message_ids = {
            let mut stmt = tx.prepare(
                "DELETE FROM mailbox_messages WHERE mailbox_id = ? RETURNING message_id",
            )?;
            stmt.query_map([mailbox_id.as_str()], |row| row.get::<_, String>(0))?
                .map(|row| row.map(MessageId::new))
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        message_ids.sort();
        collect_orphaned_content(&tx, message_ids.iter().map(MessageId::as_str))?;

        tx.commit()?;
        Ok(message_ids)
    }

    fn delete_message(&self, message_id: &MessageId) -> Result<Vec<MailboxId>> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let mut mailboxes = {
            let mut stmt = tx.prepare(
                "DELETE FROM mailbox_messages WHERE message_id = ? RETURNING mailbox_id",
            )?;
            stmt.query_map([message_id.as_str()], |row| row.get::<_, String>(0))?
                .map(|row| row.map(MailboxId::new))
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        mailboxes.sort();
        mailboxes.dedup();
        collect_orphaned_content(&tx, [message_id.as_str()])?;

        tx.commit()?;
        Ok(mailboxes)
    }

    fn find_mailboxes(&self, message_id: &MessageId) -> Result<Vec<MailboxId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT mailbox_id FROM mailbox_messages
             WHERE message_id = ? ORDER BY mailbox_id",
        )?;
        let mailboxes = stmt
            .query_map([message_id.as_str()], |row| row.get::<_, String>(0))?
            .map(|row| row.map(MailboxId::new))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(mailboxes)
    }

    fn count_total_and_unseen(&self, mailbox_id: &MailboxId) -> Result<MailboxCounters> {
        let conn = self.conn()?;
        let (total, unseen): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(seen = 0), 0) FROM mailbox_messages
             WHERE mailbox_id = ?",
            [mailbox_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(MailboxCounters {
            total: to_u64(total, "total")?,
            unseen: to_u64(unseen, "unseen")?,
        })
    }

    fn first_unseen(&self, mailbox_id: &MailboxId) -> Result<Option<MessageUid>> {
        let conn = self.conn()?;
        let uid: Option<i64> = conn.query_row(
            "SELECT MIN(uid) FROM mailbox_messages WHERE mailbox_id = ? AND seen = 0",
            [mailbox_id.as_str()],
            |row| row.get(0),
        )?;
        uid.map(|uid| to_u64(uid, "uid").map(MessageUid)).transpose()
    }

    fn distinct_user_flags(&self, mailbox_id: &MailboxId) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT flag FROM message_user_flags WHERE mailbox_id = ?",
        )?;
        let flags = stmt
            .query_map([mailbox_id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(flags)
    }

    fn max_list_predicate(&self) -> usize {
        self.max_list_predicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FlagsUpdateRequest;
    use crate::models::MessageRange;
    use crate::storage::SequenceProvider;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteMailboxStore) {
        let dir = TempDir::new().unwrap();
        let store =
            SqliteMailboxStore::open(dir.path().join("mail.db"), Duration::from_secs(5), 2).unwrap();
        (dir, store)
    }

    fn append(store: &SqliteMailboxStore, mailbox: &MailboxId, flags: Flags) -> MessageUid {
        let uid = store.next_uid(mailbox).unwrap();
        let mod_seq = store.next_mod_seq(mailbox).unwrap();
        let message = MailboxMessage::builder(
            mailbox.clone(),
            uid,
            MessageId::new(format!("{}-{}", mailbox, uid)),
        )
        .mod_seq(mod_seq)
        .flags(flags)
        .content(format!("Subject: {}\r\n\r\nbody", uid).into_bytes())
        .build();
        store.insert(&message).unwrap();
        uid
    }

    #[test]
    fn test_update_sql_only_touches_assigned_columns() {
        let statement = FlagsUpdateStatement::for_request(&FlagsUpdateRequest::add(
            Flags::new().with(SystemFlag::Seen),
        ));
        assert_eq!(
            update_flags_sql(&statement, false),
            "UPDATE mailbox_messages SET mod_seq = ?3, seen = 1 \
             WHERE mailbox_id = ?1 AND uid = ?2 RETURNING mod_seq"
        );

        let statement = FlagsUpdateStatement::new().set(SystemFlag::Deleted, false);
        assert!(update_flags_sql(&statement, true).contains("deleted = 0"));
        assert!(update_flags_sql(&statement, true).contains("AND mod_seq = ?4"));
    }

    #[test]
    fn test_page_predicate_with_cursor() {
        let inbox = MailboxId::new("inbox");
        let request = PageRequest {
            mailbox_id: &inbox,
            range: MessageRange::Range(MessageUid(2), MessageUid(9)),
            filter: ScanFilter::Unseen,
            after: Some(MessageUid(4)),
            limit: 3,
        };
        let (sql, values) = page_predicate(&request).unwrap();
        assert_eq!(
            sql,
            " WHERE m.mailbox_id = ? AND m.uid >= ? AND m.uid <= ? AND m.uid > ? \
             AND m.seen = 0 ORDER BY m.uid ASC LIMIT ?"
        );
        assert_eq!(values.len(), 5);
    }

    #[test]
    fn test_page_predicate_beyond_storable_uids() {
        let inbox = MailboxId::new("inbox");
        let mut request = PageRequest {
            mailbox_id: &inbox,
            range: MessageRange::Range(MessageUid(2), MessageUid(u64::MAX)),
            filter: ScanFilter::Any,
            after: None,
            limit: 10,
        };
        let (_, values) = page_predicate(&request).unwrap();
        assert_eq!(values[2], Value::Integer(i64::MAX));

        request.after = Some(MessageUid(u64::MAX));
        assert!(page_predicate(&request).is_none());

        request.after = None;
        request.range = MessageRange::From(MessageUid(u64::MAX));
        assert!(page_predicate(&request).is_none());
    }

    #[test]
    fn test_insert_rejects_unstorable_values() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let message = MailboxMessage::builder(inbox.clone(), MessageUid(u64::MAX), MessageId::new("big"))
            .mod_seq(ModSeq(1))
            .build();
        let err = store.insert(&message).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput { .. }));
        assert!(!err.is_retryable());

        let message = MailboxMessage::builder(inbox.clone(), MessageUid(1), MessageId::new("big"))
            .mod_seq(ModSeq(u64::MAX))
            .build();
        assert!(matches!(store.insert(&message), Err(StoreError::InvalidInput { .. })));
        assert_eq!(store.count_total_and_unseen(&inbox).unwrap(), MailboxCounters::default());
    }

    #[test]
    fn test_round_trip_with_content() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new().with(SystemFlag::Recent).with_user_flag("$Label1"));

        let metadata = store.find(&inbox, uid, FetchType::Metadata).unwrap().unwrap();
        assert!(metadata.content.is_none());
        assert!(metadata.flags.recent);
        assert!(metadata.flags.contains_user_flag("$Label1"));

        let full = store.find(&inbox, uid, FetchType::Full).unwrap().unwrap();
        assert_eq!(full.content.as_deref(), Some(&b"Subject: 1\r\n\r\nbody"[..]));
        assert_eq!(full.size, 18);

        assert!(store.find(&inbox, MessageUid(9), FetchType::Full).unwrap().is_none());
    }

    #[test]
    fn test_update_flags_set_level_user_flags() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new().with_user_flag("a"));

        let add = FlagsUpdateStatement::for_request(&FlagsUpdateRequest::add(
            Flags::new().with(SystemFlag::Flagged).with_user_flag("b"),
        ));
        let updated = store.update_flags(&inbox, uid, &add, ModSeq(10), None).unwrap();
        assert!(updated.flags.flagged);
        assert_eq!(updated.mod_seq, ModSeq(10));
        assert_eq!(updated.flags.user_flags.len(), 2);

        let remove = FlagsUpdateStatement::for_request(&FlagsUpdateRequest::remove(
            Flags::new().with_user_flag("a").with_user_flag("missing"),
        ));
        let updated = store
            .update_flags(&inbox, uid, &remove, ModSeq(11), Some(ModSeq(10)))
            .unwrap();
        assert_eq!(updated.flags.user_flags, BTreeSet::from(["b".to_string()]));
        assert!(updated.flags.flagged);
    }

    #[test]
    fn test_update_flags_conflict_and_not_found() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new());
        let statement = FlagsUpdateStatement::new().set(SystemFlag::Seen, true);

        let err = store
            .update_flags(&inbox, uid, &statement, ModSeq(5), Some(ModSeq(4)))
            .unwrap_err();
        assert!(matches!(err, StoreError::ModSeqConflict { actual: ModSeq(1), .. }));

        let err = store
            .update_flags(&inbox, MessageUid(77), &statement, ModSeq(5), None)
            .unwrap_err();
        assert!(err.is_not_found());

        // A failed conditional write leaves the row untouched
        let row = store.find(&inbox, uid, FetchType::Metadata).unwrap().unwrap();
        assert!(!row.flags.seen);
        assert_eq!(row.mod_seq, ModSeq(1));
    }

    #[test]
    fn test_reset_recent_batch_guards_retries() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let recent = Flags::new().with(SystemFlag::Recent);
        let first = append(&store, &inbox, recent.clone());
        let second = append(&store, &inbox, recent);

        let outcome = store
            .reset_recent_batch(&inbox, &[first, second, MessageUid(50)], ModSeq(9))
            .unwrap();
        assert_eq!(outcome.updated.len(), 2);
        assert!(outcome.updated.iter().all(|m| !m.flags.recent && m.mod_seq == ModSeq(9)));
        assert_eq!(outcome.missing, vec![MessageUid(50)]);

        let retry = store.reset_recent_batch(&inbox, &[first, second], ModSeq(9)).unwrap();
        assert!(retry.updated.is_empty());
        assert_eq!(retry.already_applied, vec![first, second]);
    }

    #[test]
    fn test_delete_batch_collects_content() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let uid = append(&store, &inbox, Flags::new());
        let message_id = MessageId::new(format!("{}-{}", inbox, uid));

        let removed = store.delete_batch(&inbox, &[uid, MessageUid(99)]).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].uid, uid);
        assert!(store.find_mailboxes(&message_id).unwrap().is_empty());

        let conn = store.conn().unwrap();
        let contents: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_contents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(contents, 0);
        let user_flags: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_user_flags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(user_flags, 0);
    }

    #[test]
    fn test_fetch_batch_skips_missing_uids() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let first = append(&store, &inbox, Flags::new());
        let second = append(&store, &inbox, Flags::new());

        let rows = store
            .fetch_batch(&inbox, &[second, MessageUid(40), first, MessageUid(u64::MAX)], FetchType::Full)
            .unwrap();
        let uids: Vec<MessageUid> = rows.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![first, second]);
        assert!(rows.iter().all(|m| m.content.is_some()));
    }

    #[test]
    fn test_delete_mailbox_and_message_collect_content() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        let archive = MailboxId::new("archive");
        append(&store, &inbox, Flags::new().with_user_flag("work"));
        append(&store, &inbox, Flags::new());

        // Link the first inbox message into a second mailbox
        let shared = MessageId::new("inbox-1");
        let copy = MailboxMessage::builder(archive.clone(), MessageUid(1), shared.clone())
            .mod_seq(ModSeq(1))
            .build();
        store.insert(&copy).unwrap();

        let removed = store.delete_mailbox(&inbox).unwrap();
        assert_eq!(removed, vec![shared.clone(), MessageId::new("inbox-2")]);
        assert_eq!(store.count_total_and_unseen(&inbox).unwrap(), MailboxCounters::default());
        assert_eq!(store.find_mailboxes(&shared).unwrap(), vec![archive.clone()]);

        let contents = |store: &SqliteMailboxStore| -> i64 {
            store
                .conn()
                .unwrap()
                .query_row("SELECT COUNT(*) FROM message_contents", [], |row| row.get(0))
                .unwrap()
        };
        // Still linked into the archive
        assert_eq!(contents(&store), 1);

        assert_eq!(store.delete_message(&shared).unwrap(), vec![archive.clone()]);
        assert!(store.find_mailboxes(&shared).unwrap().is_empty());
        assert_eq!(contents(&store), 0);
        assert!(store.delete_message(&shared).unwrap().is_empty());

        // Counters survive the mailbox
        assert_eq!(store.next_uid(&inbox).unwrap(), MessageUid(3));
    }

    #[test]
    fn test_counters_and_user_flags() {
        let (_dir, store) = setup();
        let inbox = MailboxId::new("inbox");
        append(&store, &inbox, Flags::new().with(SystemFlag::Seen).with_user_flag("work"));
        let unseen = append(&store, &inbox, Flags::new().with_user_flag("$Junk"));
        append(&store, &inbox, Flags::new().with_user_flag("work"));

        assert_eq!(
            store.count_total_and_unseen(&inbox).unwrap(),
            MailboxCounters { total: 3, unseen: 2 }
        );
        assert_eq!(store.first_unseen(&inbox).unwrap(), Some(unseen));
        assert_eq!(
            store.distinct_user_flags(&inbox).unwrap(),
            BTreeSet::from(["$Junk".to_string(), "work".to_string()])
        );
        assert_eq!(
            store.count_total_and_unseen(&MailboxId::new("empty")).unwrap(),
            MailboxCounters::default()
        );
        assert_eq!(store.first_unseen(&MailboxId::new("empty")).unwrap(), None);
    }
}

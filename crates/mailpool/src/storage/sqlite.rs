//! SQLite-based storage for tokens, cached mail and batch progress

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{
    BatchStore, CacheStore, CacheTable, EntryFilter, EntryMeta, StoredEntry, TierUsage, TokenStore,
};
use crate::models::{BatchProgress, BatchState, CachedAccessToken, ItemRecord, ItemStatus};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Access tokens, one per account
            CREATE TABLE access_tokens (
                account TEXT PRIMARY KEY,
                token_value TEXT NOT NULL,
                token_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                expires_at INTEGER NOT NULL,   -- unix millis
                issued_at INTEGER NOT NULL
            );

            CREATE INDEX idx_access_tokens_expires_at ON access_tokens(expires_at);

            -- Folder listing pages
            CREATE TABLE list_cache (
                account TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                message_id TEXT,
                payload BLOB NOT NULL,         -- zstd compressed when compressed = 1
                compressed INTEGER NOT NULL DEFAULT 0,
                raw_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (account, cache_key)
            );

            CREATE INDEX idx_list_cache_usage
                ON list_cache(access_count ASC, last_accessed_at ASC);

            -- Message details
            CREATE TABLE detail_cache (
                account TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                message_id TEXT,
                payload BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                raw_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (account, cache_key)
            );

            CREATE INDEX idx_detail_cache_usage
                ON detail_cache(access_count ASC, last_accessed_at ASC);
            CREATE INDEX idx_detail_cache_message ON detail_cache(account, message_id);
            "#,
        ),
        // Migration 2: Batch progress
        M::up(
            r#"
            CREATE TABLE batches (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE INDEX idx_batches_started_at ON batches(started_at DESC);

            CREATE TABLE batch_items (
                batch_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                label TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                finished_at INTEGER,
                PRIMARY KEY (batch_id, idx),
                FOREIGN KEY (batch_id) REFERENCES batches(id) ON DELETE CASCADE
            );
            "#,
        ),
    ])
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

const ENTRY_COLUMNS: &str = "account, cache_key, message_id, payload, compressed, raw_size, \
                             access_count, last_accessed_at, created_at";

const META_COLUMNS: &str = "account, cache_key, message_id, compressed, raw_size, stored_size, \
                            access_count, last_accessed_at, created_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<StoredEntry> {
    Ok(StoredEntry {
        account: row.get(0)?,
        cache_key: row.get(1)?,
        message_id: row.get(2)?,
        payload: row.get(3)?,
        compressed: row.get(4)?,
        raw_size: row.get::<_, i64>(5)? as usize,
        access_count: row.get::<_, i64>(6)? as u64,
        last_accessed_at: from_millis(row.get(7)?),
        created_at: from_millis(row.get(8)?),
    })
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<EntryMeta> {
    Ok(EntryMeta {
        account: row.get(0)?,
        cache_key: row.get(1)?,
        message_id: row.get(2)?,
        compressed: row.get(3)?,
        raw_size: row.get::<_, i64>(4)? as usize,
        stored_size: row.get::<_, i64>(5)? as usize,
        access_count: row.get::<_, i64>(6)? as u64,
        last_accessed_at: from_millis(row.get(7)?),
        created_at: from_millis(row.get(8)?),
    })
}

/// SQLite-based storage
///
/// A single connection behind a mutex; every trait call is one short
/// statement or transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;
        Self::init(conn, true)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, false)
    }

    fn init(mut conn: Connection, on_disk: bool) -> Result<Self> {
        // WAL lets readers proceed while a write is in flight; NORMAL sync
        // is safe under WAL. foreign_keys is needed for the batch cascade.
        if on_disk {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            )?;
        }
        conn.execute_batch(
            r#"
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_: PoisonError<_>| anyhow!("database connection lock poisoned"))
    }

    /// Count stored tokens (for stats)
    pub fn count_tokens(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM access_tokens", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    fn load_progress_with(conn: &Connection, batch_id: &str) -> Result<Option<BatchProgress>> {
        let header: Option<(String, String, i64, Option<i64>)> = conn
            .query_row(
                "SELECT label, state, started_at, finished_at FROM batches WHERE id = ?",
                [batch_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((label, state, started_at, finished_at)) = header else {
            return Ok(None);
        };

        let state = BatchState::parse(&state)
            .ok_or_else(|| anyhow!("batch {} has unknown state {}", batch_id, state))?;

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM batch_items WHERE batch_id = ? GROUP BY status",
        )?;
        let counts = stmt
            .query_map([batch_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut progress = BatchProgress {
            batch_id: batch_id.to_string(),
            label,
            state,
            total: 0,
            succeeded: 0,
            failed: 0,
            started_at: from_millis(started_at),
            finished_at: finished_at.map(from_millis),
        };

        for (status, count) in counts {
            let count = count as usize;
            progress.total += count;
            match ItemStatus::parse(&status) {
                Some(ItemStatus::Success) => progress.succeeded += count,
                Some(ItemStatus::Failed) => progress.failed += count,
                Some(ItemStatus::Pending) => {}
                None => bail!("batch {} has item with unknown status {}", batch_id, status),
            }
        }

        Ok(Some(progress))
    }
}

impl TokenStore for SqliteStore {
    fn get_token(&self, account: &str) -> Result<Option<CachedAccessToken>> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                "SELECT account, token_value, token_type, scope, expires_at, issued_at
                 FROM access_tokens WHERE account = ?",
                [account],
                |row| {
                    Ok(CachedAccessToken {
                        account: row.get(0)?,
                        token_value: row.get(1)?,
                        token_type: row.get(2)?,
                        scope: row.get(3)?,
                        expires_at: from_millis(row.get(4)?),
                        issued_at: from_millis(row.get(5)?),
                    })
                },
            )
            .optional()?;
        Ok(token)
    }

    fn save_token(&self, token: &CachedAccessToken) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO access_tokens
             (account, token_value, token_type, scope, expires_at, issued_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(account) DO UPDATE SET
                token_value = excluded.token_value,
                token_type = excluded.token_type,
                scope = excluded.scope,
                expires_at = excluded.expires_at,
                issued_at = excluded.issued_at",
            params![
                token.account,
                token.token_value,
                token.token_type,
                token.scope,
                to_millis(token.expires_at),
                to_millis(token.issued_at),
            ],
        )?;
        Ok(())
    }

    fn delete_token(&self, account: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM access_tokens WHERE account = ?", [account])?;
        Ok(())
    }

    fn purge_expired_tokens(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM access_tokens WHERE expires_at < ?",
            [to_millis(before)],
        )?;
        Ok(deleted)
    }
}

impl CacheStore for SqliteStore {
    fn upsert_entry(&self, table: CacheTable, entry: &StoredEntry) -> Result<()> {
        let conn = self.conn()?;
        // ON CONFLICT keeps access_count and created_at of the existing row
        let sql = format!(
            "INSERT INTO {table}
             (account, cache_key, message_id, payload, compressed, raw_size, stored_size,
              access_count, last_accessed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(account, cache_key) DO UPDATE SET
                message_id = excluded.message_id,
                payload = excluded.payload,
                compressed = excluded.compressed,
                raw_size = excluded.raw_size,
                stored_size = excluded.stored_size,
                last_accessed_at = MAX(last_accessed_at, excluded.last_accessed_at)",
            table = table.table_name()
        );
        conn.execute(
            &sql,
            params![
                entry.account,
                entry.cache_key,
                entry.message_id,
                entry.payload,
                entry.compressed,
                entry.raw_size as i64,
                entry.stored_size() as i64,
                entry.access_count as i64,
                to_millis(entry.last_accessed_at),
                to_millis(entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn read_entry(
        &self,
        table: CacheTable,
        account: &str,
        cache_key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredEntry>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let touched = tx.execute(
            &format!(
                "UPDATE {} SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE account = ?2 AND cache_key = ?3",
                table.table_name()
            ),
            params![to_millis(at), account, cache_key],
        )?;

        if touched == 0 {
            return Ok(None);
        }

        let entry = tx
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM {} WHERE account = ?1 AND cache_key = ?2",
                    table.table_name()
                ),
                params![account, cache_key],
                entry_from_row,
            )
            .optional()?;

        tx.commit()?;
        Ok(entry)
    }

    fn scan_entries(
        &self,
        table: CacheTable,
        filter: &EntryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntryMeta>> {
        let conn = self.conn()?;
        // NULL parameters disable their clause
        let sql = format!(
            "SELECT {META_COLUMNS} FROM {}
             WHERE (?1 IS NULL OR account = ?1)
               AND (?2 IS NULL OR substr(cache_key, 1, length(?2)) = ?2)
               AND (?3 IS NULL OR message_id = ?3)
             ORDER BY access_count ASC, last_accessed_at ASC, account ASC, cache_key ASC
             LIMIT ?4 OFFSET ?5",
            table.table_name()
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    filter.account,
                    filter.key_prefix,
                    filter.message_id,
                    limit.min(i64::MAX as usize) as i64,
                    offset as i64,
                ],
                meta_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_entry(&self, table: CacheTable, account: &str, cache_key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE account = ? AND cache_key = ?",
                table.table_name()
            ),
            params![account, cache_key],
        )?;
        Ok(deleted > 0)
    }

    fn delete_by_message(
        &self,
        table: CacheTable,
        account: &str,
        message_id: &str,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE account = ? AND message_id = ?",
                table.table_name()
            ),
            params![account, message_id],
        )?;
        Ok(deleted)
    }

    fn delete_by_prefix(&self, table: CacheTable, account: &str, prefix: &str) -> Result<usize> {
        let conn = self.conn()?;
        // substr() instead of LIKE so '%' and '_' in folder names stay literal
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE account = ?1 AND substr(cache_key, 1, length(?2)) = ?2",
                table.table_name()
            ),
            params![account, prefix],
        )?;
        Ok(deleted)
    }

    fn usage(&self, table: CacheTable) -> Result<TierUsage> {
        let conn = self.conn()?;
        let (rows, bytes): (i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(stored_size), 0) FROM {}",
                table.table_name()
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(TierUsage {
            rows: rows as usize,
            bytes: bytes as u64,
        })
    }

    fn evict_least_used(&self, table: CacheTable, count: usize) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {table} WHERE rowid IN (
                    SELECT rowid FROM {table}
                    ORDER BY access_count ASC, last_accessed_at ASC, account ASC, cache_key ASC
                    LIMIT ?
                 )",
                table = table.table_name()
            ),
            [count as i64],
        )?;
        Ok(deleted)
    }

    fn clear_table(&self, table: CacheTable) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(&format!("DELETE FROM {}", table.table_name()), [])?;
        Ok(())
    }
}

impl BatchStore for SqliteStore {
    fn create_batch(
        &self,
        batch_id: &str,
        label: &str,
        item_labels: &[String],
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO batches (id, label, state, started_at) VALUES (?, ?, ?, ?)",
            params![
                batch_id,
                label,
                BatchState::Running.as_str(),
                to_millis(started_at)
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO batch_items (batch_id, idx, label, status) VALUES (?, ?, ?, ?)",
            )?;
            for (index, item_label) in item_labels.iter().enumerate() {
                stmt.execute(params![
                    batch_id,
                    index as i64,
                    item_label,
                    ItemStatus::Pending.as_str()
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn record_outcome(
        &self,
        batch_id: &str,
        index: usize,
        status: ItemStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        // The status guard keeps transitions one-way
        let updated = conn.execute(
            "UPDATE batch_items SET status = ?, error = ?, finished_at = ?
             WHERE batch_id = ? AND idx = ? AND status = 'pending'",
            params![
                status.as_str(),
                error,
                to_millis(at),
                batch_id,
                index as i64
            ],
        )?;
        Ok(updated > 0)
    }

    fn finish_batch(&self, batch_id: &str, state: BatchState, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE batches SET state = ?, finished_at = ? WHERE id = ?",
            params![state.as_str(), to_millis(at), batch_id],
        )?;
        if updated == 0 {
            bail!("unknown batch {}", batch_id);
        }
        Ok(())
    }

    fn load_progress(&self, batch_id: &str) -> Result<Option<BatchProgress>> {
        let conn = self.conn()?;
        Self::load_progress_with(&conn, batch_id)
    }

    fn load_items(&self, batch_id: &str, status: Option<ItemStatus>) -> Result<Vec<ItemRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT idx, label, status, error, finished_at FROM batch_items
             WHERE batch_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY idx",
        )?;

        let rows = stmt
            .query_map(params![batch_id, status.map(|s| s.as_str())], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(index, label, status, error, finished_at)| {
                let status = ItemStatus::parse(&status)
                    .ok_or_else(|| anyhow!("unknown item status {}", status))?;
                Ok(ItemRecord {
                    index: index as usize,
                    label,
                    status,
                    error,
                    finished_at: finished_at.map(from_millis),
                })
            })
            .collect()
    }

    fn list_batches(&self, limit: usize) -> Result<Vec<BatchProgress>> {
        let conn = self.conn()?;
        let ids: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT id FROM batches ORDER BY started_at DESC LIMIT ?")?;
            stmt.query_map([limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut batches = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(progress) = Self::load_progress_with(&conn, &id)? {
                batches.push(progress);
            }
        }
        Ok(batches)
    }

    fn purge_batches(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        // batch_items rows go with ON DELETE CASCADE
        let deleted = conn.execute(
            "DELETE FROM batches WHERE finished_at IS NOT NULL AND finished_at < ?",
            [to_millis(before)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("mailpool.db")).unwrap();
        (store, dir)
    }

    fn make_token(account: &str, expires_in_secs: i64) -> CachedAccessToken {
        let now = Utc::now();
        CachedAccessToken {
            account: account.to_string(),
            token_value: format!("token-for-{}", account),
            token_type: "Bearer".to_string(),
            scope: "scope".to_string(),
            expires_at: now + Duration::seconds(expires_in_secs),
            issued_at: now,
        }
    }

    fn make_entry(account: &str, key: &str, message_id: Option<&str>, size: usize) -> StoredEntry {
        let now = Utc::now();
        StoredEntry {
            account: account.to_string(),
            cache_key: key.to_string(),
            message_id: message_id.map(str::to_string),
            payload: vec![b'x'; size],
            compressed: false,
            raw_size: size,
            access_count: 0,
            last_accessed_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_token_crud() {
        let (store, _dir) = create_test_store();
        let token = make_token("a@test", 3600);

        store.save_token(&token).unwrap();
        let loaded = store.get_token("a@test").unwrap().unwrap();
        assert_eq!(loaded.token_value, token.token_value);
        assert_eq!(
            loaded.expires_at.timestamp_millis(),
            token.expires_at.timestamp_millis()
        );

        store.delete_token("a@test").unwrap();
        assert!(store.get_token("a@test").unwrap().is_none());
    }

    #[test]
    fn test_save_token_replaces() {
        let (store, _dir) = create_test_store();
        store.save_token(&make_token("a@test", 60)).unwrap();

        let mut newer = make_token("a@test", 3600);
        newer.token_value = "rotated".to_string();
        store.save_token(&newer).unwrap();

        assert_eq!(store.count_tokens().unwrap(), 1);
        assert_eq!(store.get_token("a@test").unwrap().unwrap().token_value, "rotated");
    }

    #[test]
    fn test_purge_expired_tokens() {
        let (store, _dir) = create_test_store();
        store.save_token(&make_token("old@test", -60)).unwrap();
        store.save_token(&make_token("new@test", 3600)).unwrap();

        assert_eq!(store.purge_expired_tokens(Utc::now()).unwrap(), 1);
        assert!(store.get_token("old@test").unwrap().is_none());
        assert!(store.get_token("new@test").unwrap().is_some());
    }

    #[test]
    fn test_read_entry_touches_row() {
        let (store, _dir) = create_test_store();
        store
            .upsert_entry(CacheTable::Details, &make_entry("a", "k", Some("m1"), 16))
            .unwrap();

        let at = Utc::now() + Duration::seconds(5);
        let entry = store
            .read_entry(CacheTable::Details, "a", "k", at)
            .unwrap()
            .unwrap();
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.last_accessed_at.timestamp_millis(), at.timestamp_millis());
        assert_eq!(entry.payload, vec![b'x'; 16]);

        assert!(
            store
                .read_entry(CacheTable::Details, "a", "missing", at)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_upsert_preserves_access_count() {
        let (store, _dir) = create_test_store();
        store
            .upsert_entry(CacheTable::Lists, &make_entry("a", "k", None, 8))
            .unwrap();
        store
            .read_entry(CacheTable::Lists, "a", "k", Utc::now())
            .unwrap();
        store
            .upsert_entry(CacheTable::Lists, &make_entry("a", "k", None, 32))
            .unwrap();

        let meta = store
            .scan_entries(CacheTable::Lists, &EntryFilter::default(), 10, 0)
            .unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].access_count, 1);
        assert_eq!(meta[0].stored_size, 32);
    }

    #[test]
    fn test_usage_and_eviction_order() {
        let (store, _dir) = create_test_store();
        for key in ["a", "b", "c", "d"] {
            store
                .upsert_entry(CacheTable::Details, &make_entry("acct", key, Some(key), 100))
                .unwrap();
        }
        // b and d are read, a and c are not
        let now = Utc::now();
        store.read_entry(CacheTable::Details, "acct", "b", now).unwrap();
        store.read_entry(CacheTable::Details, "acct", "d", now).unwrap();
        store.read_entry(CacheTable::Details, "acct", "d", now).unwrap();

        let usage = store.usage(CacheTable::Details).unwrap();
        assert_eq!(usage.rows, 4);
        assert_eq!(usage.bytes, 400);

        assert_eq!(store.evict_least_used(CacheTable::Details, 2).unwrap(), 2);

        let remaining: Vec<String> = store
            .scan_entries(CacheTable::Details, &EntryFilter::default(), 10, 0)
            .unwrap()
            .into_iter()
            .map(|m| m.cache_key)
            .collect();
        assert_eq!(remaining, vec!["b".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_delete_by_prefix_and_message() {
        let (store, _dir) = create_test_store();
        store
            .upsert_entry(CacheTable::Lists, &make_entry("a", "INBOX|1", None, 4))
            .unwrap();
        store
            .upsert_entry(CacheTable::Lists, &make_entry("a", "INBOX|2", None, 4))
            .unwrap();
        store
            .upsert_entry(CacheTable::Lists, &make_entry("a", "Sent|1", None, 4))
            .unwrap();
        store
            .upsert_entry(CacheTable::Lists, &make_entry("b", "INBOX|1", None, 4))
            .unwrap();

        assert_eq!(store.delete_by_prefix(CacheTable::Lists, "a", "INBOX|").unwrap(), 2);
        assert_eq!(store.usage(CacheTable::Lists).unwrap().rows, 2);
        assert_eq!(store.delete_by_prefix(CacheTable::Lists, "a", "").unwrap(), 1);
        assert_eq!(store.usage(CacheTable::Lists).unwrap().rows, 1);

        store
            .upsert_entry(CacheTable::Details, &make_entry("a", "INBOX|m1", Some("m1"), 4))
            .unwrap();
        store
            .upsert_entry(CacheTable::Details, &make_entry("a", "Junk|m1", Some("m1"), 4))
            .unwrap();
        assert_eq!(store.delete_by_message(CacheTable::Details, "a", "m1").unwrap(), 2);
    }

    #[test]
    fn test_scan_filters_and_paginates() {
        let (store, _dir) = create_test_store();
        for i in 0..5 {
            store
                .upsert_entry(
                    CacheTable::Details,
                    &make_entry("a", &format!("k{}", i), Some("m"), 4),
                )
                .unwrap();
        }
        store
            .upsert_entry(CacheTable::Details, &make_entry("b", "k0", None, 4))
            .unwrap();

        let filter = EntryFilter::account("a");
        let page1 = store.scan_entries(CacheTable::Details, &filter, 2, 0).unwrap();
        let page3 = store.scan_entries(CacheTable::Details, &filter, 2, 4).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page3.len(), 1);
        assert!(page1.iter().all(|m| m.account == "a"));
    }

    #[test]
    fn test_batch_progress_is_derived() {
        let (store, _dir) = create_test_store();
        let labels = vec!["x@test".to_string(), "y@test".to_string(), "z@test".to_string()];
        store.create_batch("b1", "refresh", &labels, Utc::now()).unwrap();

        store
            .record_outcome("b1", 0, ItemStatus::Success, None, Utc::now())
            .unwrap();
        store
            .record_outcome("b1", 2, ItemStatus::Failed, Some("invalid_grant"), Utc::now())
            .unwrap();

        let progress = store.load_progress("b1").unwrap().unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.state, BatchState::Running);

        // Second transition is ignored
        assert!(
            !store
                .record_outcome("b1", 2, ItemStatus::Success, None, Utc::now())
                .unwrap()
        );

        store.finish_batch("b1", BatchState::Completed, Utc::now()).unwrap();
        let progress = store.load_progress("b1").unwrap().unwrap();
        assert_eq!(progress.state, BatchState::Completed);
        assert!(progress.finished_at.is_some());

        let failed = store.load_items("b1", Some(ItemStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].label, "z@test");
        assert_eq!(failed[0].error.as_deref(), Some("invalid_grant"));

        assert_eq!(store.list_batches(10).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_batches_keeps_running_and_recent() {
        let (store, _dir) = create_test_store();
        let labels = vec!["x@test".to_string(), "y@test".to_string()];
        let long_ago = Utc::now() - Duration::days(30);

        store.create_batch("old", "refresh", &labels, long_ago).unwrap();
        store
            .record_outcome("old", 0, ItemStatus::Success, None, long_ago)
            .unwrap();
        store.finish_batch("old", BatchState::Completed, long_ago).unwrap();

        store.create_batch("running", "import", &labels, long_ago).unwrap();

        store.create_batch("recent", "refresh", &labels, Utc::now()).unwrap();
        store.finish_batch("recent", BatchState::Completed, Utc::now()).unwrap();

        let purged = store.purge_batches(Utc::now() - Duration::days(7)).unwrap();
        assert_eq!(purged, 1);

        assert!(store.load_progress("old").unwrap().is_none());
        assert!(store.load_progress("running").unwrap().is_some());
        assert!(store.load_progress("recent").unwrap().is_some());

        // Items of the purged batch went with it
        let orphans: i64 = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM batch_items WHERE batch_id = 'old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
        assert_eq!(store.load_items("running", None).unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mailpool.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_token(&make_token("a@test", 3600)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_token("a@test").unwrap().is_some());
    }
}

// Remote relational backend: contract plus a SQLite-backed implementation

use crate::channel::Topic;
use crate::cursor::CursorPayload;
use crate::filter::{self, FOLD_CASE_SQL, Filter};
use crate::record::{ListedRecord, StateEntry, now_ms};
use eyre::{Context, Result};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// A row change observed on the state table
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Insert or update; carries the new payload
    Upserted(Value),
    Deleted,
    /// The feed broke after it was established
    Failed(String),
}

/// Receives change events for one subscribed key
pub type ChangeSink = Box<dyn Fn(ChangeEvent)>;

/// Listing request as handed to the backend
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub filters: Vec<Filter>,
    /// Only rows strictly after this position
    pub after: Option<CursorPayload>,
    pub limit: usize,
}

/// Client-side contract of the remote store
pub trait RemoteStore {
    /// Payload stored under `key`, if any
    fn select_state(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or replace the payload stored under `key`
    fn upsert_state(&self, key: &str, payload: &Value) -> Result<()>;

    /// Open a change feed for `key`. Events arrive through `sink` until the
    /// returned subscription is cancelled or the feed reports `Failed`.
    fn subscribe_state(&self, key: &str, sink: ChangeSink) -> Result<RemoteSubscription>;

    /// Rows in (timestamp desc, id desc) order matching every filter
    fn query_records(&self, query: &RecordQuery) -> Result<Vec<ListedRecord>>;
}

/// Handle to an open change feed. Cancelling is idempotent and also happens on drop.
pub struct RemoteSubscription {
    teardown: Option<Box<dyn FnOnce()>>,
}

impl RemoteSubscription {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSubscription")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

/// Change feed message; `key: None` reaches every subscriber
#[derive(Debug, Clone)]
struct FeedMessage {
    key: Option<String>,
    event: ChangeEvent,
}

/// Remote store over a SQLite database
pub struct SqliteRemote {
    db: Connection,
    feed: Topic<FeedMessage>,
}

impl SqliteRemote {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create remote store directory")?;
        }
        let db = Connection::open(path).context("Failed to open SQLite database")?;
        Self::with_connection(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(db)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        let remote = Self {
            db,
            feed: Topic::default(),
        };
        remote.register_functions()?;
        remote.create_schema()?;
        Ok(remote)
    }

    fn register_functions(&self) -> Result<()> {
        self.db
            .create_scalar_function(
                FOLD_CASE_SQL,
                1,
                FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
                |ctx| {
                    let text: String = ctx.get(0)?;
                    Ok(filter::fold_case(&text))
                },
            )
            .context("Failed to register SQL functions")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        debug!("Creating remote schema");

        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS state_entries (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS listed_records (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                data_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_listed_records_order ON listed_records(timestamp DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_listed_records_category ON listed_records(category, timestamp DESC, id DESC);
            "#,
        )?;

        Ok(())
    }

    /// Every stored state entry, by key
    pub fn entries(&self) -> Result<Vec<StateEntry>> {
        let mut stmt = self
            .db
            .prepare("SELECT key, payload, updated_at FROM state_entries ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row_result in rows {
            let (key, payload, updated_at) = row_result?;
            let payload = serde_json::from_str(&payload).context("Failed to deserialize stored payload")?;
            entries.push(StateEntry {
                key,
                payload,
                updated_at: Some(updated_at),
            });
        }
        Ok(entries)
    }

    /// Remove the entry for `key`, notifying subscribers with `Deleted`
    pub fn delete_state(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .execute("DELETE FROM state_entries WHERE key = ?1", [key])
            .context("Failed to delete state entry")?;
        if removed > 0 {
            self.notify(key, ChangeEvent::Deleted);
        }
        Ok(removed > 0)
    }

    /// Insert or replace listing rows. Timestamps are normalized first.
    pub fn insert_records(&mut self, records: impl IntoIterator<Item = ListedRecord>) -> Result<usize> {
        let tx = self.db.transaction()?;
        let mut count = 0;

        for record in records {
            let record = record.normalized()?;
            let data_json = serde_json::to_string(&record).context("Failed to serialize record")?;
            tx.execute(
                "INSERT OR REPLACE INTO listed_records (id, timestamp, category, title, description, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    &record.id,
                    &record.timestamp,
                    &record.category,
                    &record.title,
                    &record.description,
                    data_json
                ],
            )?;
            count += 1;
        }

        tx.commit()?;
        info!(count, "Inserted listing records");
        Ok(count)
    }

    /// Fail every open change feed, as a dropped connection would
    pub fn close_feeds(&self, reason: &str) {
        warn!(count = self.watcher_count(), reason, "Closing remote change feeds");
        self.feed.publish(FeedMessage {
            key: None,
            event: ChangeEvent::Failed(reason.to_string()),
        });
        self.feed.close();
    }

    pub fn watcher_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    fn notify(&self, key: &str, event: ChangeEvent) {
        let reached = self.feed.publish(FeedMessage {
            key: Some(key.to_string()),
            event,
        });
        debug!(key, reached, "Notified change feed");
    }
}

impl RemoteStore for SqliteRemote {
    fn select_state(&self, key: &str) -> Result<Option<Value>> {
        let payload: Option<String> = self
            .db
            .query_row("SELECT payload FROM state_entries WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        match payload {
            Some(json) => {
                let value = serde_json::from_str(&json).context("Failed to deserialize stored payload")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn upsert_state(&self, key: &str, payload: &Value) -> Result<()> {
        let json = serde_json::to_string(payload).context("Failed to serialize payload")?;

        self.db.execute(
            "INSERT INTO state_entries (key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            rusqlite::params![key, json, now_ms()],
        )?;

        self.notify(key, ChangeEvent::Upserted(payload.clone()));
        Ok(())
    }

    fn subscribe_state(&self, key: &str, sink: ChangeSink) -> Result<RemoteSubscription> {
        let wanted = key.to_string();
        let mut guard = self.feed.subscribe(move |message: &FeedMessage| {
            if message.key.as_ref().is_none_or(|k| *k == wanted) {
                sink(message.event.clone());
            }
        });
        debug!(key, watchers = self.watcher_count(), "Opened change feed");

        Ok(RemoteSubscription::new(move || guard.release()))
    }

    fn query_records(&self, query: &RecordQuery) -> Result<Vec<ListedRecord>> {
        let mut sql = String::from("SELECT data_json FROM listed_records WHERE 1 = 1");
        let mut params: Vec<SqlValue> = Vec::new();

        for filter in &query.filters {
            sql.push_str(" AND ");
            sql.push_str(&filter.to_sql(&mut params));
        }

        if let Some(after) = &query.after {
            sql.push_str(" AND (timestamp < ? OR (timestamp = ? AND id < ?))");
            params.push(SqlValue::Text(after.timestamp.clone()));
            params.push(SqlValue::Text(after.timestamp.clone()));
            params.push(SqlValue::Text(after.id.clone()));
        }

        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        params.push(SqlValue::Integer(query.limit as i64));

        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row_result in rows {
            let data_json = row_result?;
            let record: ListedRecord = serde_json::from_str(&data_json).context("Failed to deserialize record")?;
            results.push(record);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Field, FilterOp};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn record(id: &str, timestamp: &str, category: &str) -> ListedRecord {
        ListedRecord {
            id: id.to_string(),
            timestamp: timestamp.to_string(),
            category: category.to_string(),
            title: format!("Title {}", id),
            description: String::new(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_open_creates_database() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/remote.db");

        let remote = SqliteRemote::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(remote.select_state("missing").unwrap(), None);
    }

    #[test]
    fn test_upsert_and_select() {
        let remote = SqliteRemote::open_in_memory().unwrap();

        remote.upsert_state("grid_rows", &json!([{"a": 1}])).unwrap();
        remote.upsert_state("grid_rows", &json!([{"a": 2}])).unwrap();

        assert_eq!(remote.select_state("grid_rows").unwrap(), Some(json!([{"a": 2}])));
        let count: i64 = remote
            .db
            .query_row("SELECT COUNT(*) FROM state_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let entries = remote.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "grid_rows");
        assert!(entries[0].updated_at.is_some());
    }

    #[test]
    fn test_change_feed_filtered_by_key() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let sink_seen = seen.clone();
        let _sub = remote
            .subscribe_state("a", Box::new(move |event| sink_seen.borrow_mut().push(event)))
            .unwrap();

        remote.upsert_state("a", &json!(1)).unwrap();
        remote.upsert_state("b", &json!(2)).unwrap();
        remote.delete_state("a").unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![ChangeEvent::Upserted(json!(1)), ChangeEvent::Deleted]
        );
    }

    #[test]
    fn test_subscription_cancel_is_idempotent() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        let mut sub = remote.subscribe_state("a", Box::new(|_| {})).unwrap();
        assert_eq!(remote.watcher_count(), 1);

        sub.cancel();
        sub.cancel();
        assert_eq!(remote.watcher_count(), 0);
    }

    #[test]
    fn test_cancel_after_remote_dropped() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        let mut sub = remote.subscribe_state("a", Box::new(|_| {})).unwrap();
        drop(remote);
        sub.cancel();
    }

    #[test]
    fn test_close_feeds_reports_failure() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = seen.clone();
        let _sub = remote
            .subscribe_state("a", Box::new(move |event| sink_seen.borrow_mut().push(event)))
            .unwrap();

        remote.close_feeds("connection reset");

        assert_eq!(*seen.borrow(), vec![ChangeEvent::Failed("connection reset".to_string())]);
        assert_eq!(remote.watcher_count(), 0);
    }

    #[test]
    fn test_query_records_keyset() {
        let mut remote = SqliteRemote::open_in_memory().unwrap();
        remote
            .insert_records(vec![
                record("a", "2025-02-12", "UI"),
                record("b", "2025-02-12", "API"),
                record("c", "2025-02-16", "UI"),
                record("d", "2025-01-28", "UI"),
            ])
            .unwrap();

        let all = remote
            .query_records(&RecordQuery {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "d"]);

        let after_b = remote
            .query_records(&RecordQuery {
                after: Some(CursorPayload {
                    timestamp: "2025-02-12T00:00:00.000Z".to_string(),
                    id: "b".to_string(),
                }),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = after_b.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);

        let ui_only = remote
            .query_records(&RecordQuery {
                filters: vec![Filter {
                    field: Field::Category,
                    op: FilterOp::Eq,
                    value: "UI".to_string(),
                }],
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = ui_only.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_query_records_search_folds_non_ascii() {
        let mut remote = SqliteRemote::open_in_memory().unwrap();
        let mut summer = record("a", "2025-02-12", "UI");
        summer.title = "Été release".to_string();
        let mut plain = record("b", "2025-02-13", "UI");
        plain.description = "ete without accents".to_string();
        remote.insert_records(vec![summer, plain]).unwrap();

        let found = remote
            .query_records(&RecordQuery {
                filters: vec![Filter {
                    field: Field::Text,
                    op: FilterOp::Contains,
                    value: filter::fold_case("ÉTÉ"),
                }],
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }
}

// Failure-injecting remote store for tests

use crate::listing::ListQuery;
use crate::record::ListedRecord;
use crate::remote::{ChangeEvent, ChangeSink, RecordQuery, RemoteStore, RemoteSubscription, SqliteRemote};
use eyre::{Result, eyre};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;

/// Wraps an in-memory [`SqliteRemote`]; each flag makes the matching call fail
pub struct FlakyRemote {
    pub inner: SqliteRemote,
    pub fail_select: Cell<bool>,
    pub fail_upsert: Cell<bool>,
    pub fail_subscribe: Cell<bool>,
    /// Report `Failed` through the sink before `subscribe_state` returns
    pub fail_feed_on_open: Cell<bool>,
    pub fail_query: Cell<bool>,
    pub queries: Cell<usize>,
}

impl FlakyRemote {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::from_inner(
            SqliteRemote::open_in_memory().expect("in-memory database"),
        ))
    }

    pub fn from_inner(inner: SqliteRemote) -> Self {
        Self {
            inner,
            fail_select: Cell::new(false),
            fail_upsert: Cell::new(false),
            fail_subscribe: Cell::new(false),
            fail_feed_on_open: Cell::new(false),
            fail_query: Cell::new(false),
            queries: Cell::new(0),
        }
    }

    /// Remote seeded with listing rows
    pub fn with_records(records: Vec<ListedRecord>) -> Rc<Self> {
        let mut inner = SqliteRemote::open_in_memory().expect("in-memory database");
        inner.insert_records(records).expect("seed records");
        Rc::new(Self::from_inner(inner))
    }
}

impl RemoteStore for FlakyRemote {
    fn select_state(&self, key: &str) -> Result<Option<Value>> {
        if self.fail_select.get() {
            return Err(eyre!("injected select failure"));
        }
        self.inner.select_state(key)
    }

    fn upsert_state(&self, key: &str, payload: &Value) -> Result<()> {
        if self.fail_upsert.get() {
            return Err(eyre!("injected upsert failure"));
        }
        self.inner.upsert_state(key, payload)
    }

    fn subscribe_state(&self, key: &str, sink: ChangeSink) -> Result<RemoteSubscription> {
        if self.fail_subscribe.get() {
            return Err(eyre!("injected subscribe failure"));
        }
        if self.fail_feed_on_open.get() {
            sink(ChangeEvent::Failed("injected feed failure".to_string()));
        }
        self.inner.subscribe_state(key, sink)
    }

    fn query_records(&self, query: &RecordQuery) -> Result<Vec<ListedRecord>> {
        self.queries.set(self.queries.get() + 1);
        if self.fail_query.get() {
            return Err(eyre!("injected query failure"));
        }
        self.inner.query_records(query)
    }
}

/// Record with the fields the listing engine looks at
pub fn listed(id: &str, timestamp: &str, category: &str, title: &str, description: &str) -> ListedRecord {
    ListedRecord {
        id: id.to_string(),
        timestamp: timestamp.to_string(),
        category: category.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        extra: serde_json::Map::new(),
    }
    .normalized()
    .expect("valid timestamp")
}

/// Shorthand for a query with only a limit
pub fn limit(n: usize) -> ListQuery {
    ListQuery {
        limit: Some(n),
        ..Default::default()
    }
}

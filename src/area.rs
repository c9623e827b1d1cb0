// Local storage area: a synchronous string key-value medium shared by the
// clients of one origin, with change events delivered to the other clients

use crate::channel::{ListenerGuard, Topic};
use crate::jsonl::{self, Versioned};
use crate::record::now_ms;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info};
use uuid::Uuid;

const AREA_FILE: &str = "local.jsonl";

/// Fired on every client except the writer when an item changes
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the item was removed
    pub new_value: Option<String>,
}

/// One persisted mutation; `value: None` is a removal tombstone
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AreaLine {
    key: String,
    value: Option<String>,
    updated_at: i64,
}

impl Versioned for AreaLine {
    fn key(&self) -> &str {
        &self.key
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

/// A storage event tagged with the client that caused it
#[derive(Debug, Clone)]
struct AreaNotice {
    writer: Uuid,
    event: StorageEvent,
}

struct AreaInner {
    path: Option<PathBuf>,
    quota_bytes: Option<u64>,
    items: RefCell<BTreeMap<String, String>>,
    events: Topic<AreaNotice>,
}

/// The storage medium of one origin. Cloning shares the same area.
#[derive(Clone)]
pub struct StorageArea {
    inner: Rc<AreaInner>,
}

impl StorageArea {
    /// Open the area persisted under `dir`, compacting its log
    pub fn open<P: AsRef<Path>>(dir: P, quota_bytes: Option<u64>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).context("Failed to create local storage directory")?;
        let path = dir.join(AREA_FILE);

        // Tombstones are dropped; they only matter until the next compaction
        let live = jsonl::compact_jsonl::<AreaLine, _>(&path, |l| l.value.is_some())?;

        let items: BTreeMap<String, String> = live.into_iter().filter_map(|l| l.value.map(|v| (l.key, v))).collect();
        info!(path = ?path, items = items.len(), "Opened local storage area");

        Ok(Self::build(Some(path), quota_bytes, items))
    }

    /// Area that lives only as long as the process
    pub fn in_memory(quota_bytes: Option<u64>) -> Self {
        Self::build(None, quota_bytes, BTreeMap::new())
    }

    fn build(path: Option<PathBuf>, quota_bytes: Option<u64>, items: BTreeMap<String, String>) -> Self {
        Self {
            inner: Rc::new(AreaInner {
                path,
                quota_bytes,
                items: RefCell::new(items),
                events: Topic::default(),
            }),
        }
    }

    /// Register a new client of this area
    pub fn attach(&self) -> AreaClient {
        AreaClient {
            id: Uuid::now_v7(),
            area: self.clone(),
        }
    }

    /// Bytes currently held (keys plus values)
    pub fn used_bytes(&self) -> u64 {
        self.inner
            .items
            .borrow()
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, key: &str, value: Option<&str>) -> Result<()> {
        if let Some(path) = &self.inner.path {
            let line = AreaLine {
                key: key.to_string(),
                value: value.map(str::to_string),
                updated_at: now_ms(),
            };
            jsonl::append_jsonl(path, &line)?;
        }
        Ok(())
    }

    fn check_quota(&self, key: &str, value: &str) -> Result<()> {
        let Some(quota) = self.inner.quota_bytes else {
            return Ok(());
        };

        let current = self.used_bytes();
        let replaced = self
            .inner
            .items
            .borrow()
            .get(key)
            .map(|old| (key.len() + old.len()) as u64)
            .unwrap_or(0);
        let needed = current - replaced + (key.len() + value.len()) as u64;

        if needed > quota {
            return Err(eyre!("Storage quota exceeded: {} bytes needed, {} allowed", needed, quota));
        }
        Ok(())
    }

    fn dispatch(&self, writer: Uuid, event: StorageEvent) {
        let key = event.key.clone();
        let reached = self.inner.events.publish(AreaNotice { writer, event });
        debug!(key = %key, reached, "Dispatched storage event");
    }
}

/// One client's view of a storage area
#[derive(Clone)]
pub struct AreaClient {
    id: Uuid,
    area: StorageArea,
}

impl AreaClient {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn area(&self) -> &StorageArea {
        &self.area
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.area.inner.items.borrow().get(key).cloned()
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.area.check_quota(key, value)?;
        self.area.persist(key, Some(value))?;
        self.area
            .inner
            .items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());

        self.area.dispatch(
            self.id,
            StorageEvent {
                key: key.to_string(),
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> Result<()> {
        if !self.area.inner.items.borrow().contains_key(key) {
            return Ok(());
        }

        self.area.persist(key, None)?;
        self.area.inner.items.borrow_mut().remove(key);

        self.area.dispatch(
            self.id,
            StorageEvent {
                key: key.to_string(),
                new_value: None,
            },
        );
        Ok(())
    }

    /// Observe changes made by other clients of the area
    pub fn on_change(&self, handler: impl Fn(&StorageEvent) + 'static) -> ListenerGuard {
        let me = self.id;
        self.area.inner.events.subscribe(move |notice: &AreaNotice| {
            if notice.writer != me {
                handler(&notice.event);
            }
        })
    }
}

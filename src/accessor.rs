// Lazily constructed, invalidatable remote handle

use crate::config::RemoteConfig;
use crate::remote::{RemoteStore, SqliteRemote};
use eyre::{Result, eyre};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

type Connector = Box<dyn Fn() -> Result<Rc<dyn RemoteStore>>>;

/// Owns the cached remote handle.
///
/// `get` memoizes a successfully constructed handle until `invalidate` is
/// called. Construction failures are logged and reported as `None`, and the
/// next `get` tries again.
pub struct RemoteAccessor {
    connector: Connector,
    cached: RefCell<Option<Rc<dyn RemoteStore>>>,
}

impl RemoteAccessor {
    pub fn new(connector: impl Fn() -> Result<Rc<dyn RemoteStore>> + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            cached: RefCell::new(None),
        }
    }

    /// Accessor that opens the SQLite database named by `config`.
    /// With no database configured every `get` returns `None`.
    pub fn from_config(config: &RemoteConfig) -> Self {
        let database = config.database.clone();
        Self::new(move || {
            let path = database
                .as_ref()
                .ok_or_else(|| eyre!("Remote store not configured (no database path)"))?;
            let remote: Rc<dyn RemoteStore> = Rc::new(SqliteRemote::open(path)?);
            Ok(remote)
        })
    }

    /// Accessor whose construction always fails
    pub fn unavailable() -> Self {
        Self::new(|| Err(eyre!("Remote store disabled")))
    }

    /// Accessor over an already open handle; after invalidation it hands
    /// out the same handle again
    pub fn with_handle(remote: Rc<dyn RemoteStore>) -> Self {
        Self::new(move || Ok(remote.clone()))
    }

    pub fn get(&self) -> Option<Rc<dyn RemoteStore>> {
        if let Some(handle) = self.cached.borrow().as_ref() {
            return Some(handle.clone());
        }

        match (self.connector)() {
            Ok(handle) => {
                debug!("Constructed remote handle");
                *self.cached.borrow_mut() = Some(handle.clone());
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, "Remote store unavailable");
                None
            }
        }
    }

    /// Drop the cached handle so the next `get` constructs a fresh one
    pub fn invalidate(&self) {
        if self.cached.borrow_mut().take().is_some() {
            debug!("Invalidated remote handle");
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached.borrow().is_some()
    }
}

// Local fallback store: namespaced JSON values in the storage area

use crate::area::AreaClient;
use serde_json::Value;
use tracing::{debug, warn};

/// Reads and writes JSON payloads under `<namespace><key>`.
///
/// Never fails: corrupt entries are removed and read as absent, and
/// rejected writes are logged and dropped.
#[derive(Clone)]
pub struct LocalStore {
    client: AreaClient,
    namespace: String,
}

impl LocalStore {
    pub fn new(client: AreaClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> &AreaClient {
        &self.client
    }

    /// Full storage key for `key`
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        let storage_key = self.storage_key(key);
        let raw = self.client.get_item(&storage_key)?;

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Corrupt local state, removing entry");
                if let Err(e) = self.client.remove_item(&storage_key) {
                    warn!(key, error = %e, "Failed to remove corrupt local state");
                }
                None
            }
        }
    }

    pub fn write(&self, key: &str, payload: &Value) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize local state");
                return;
            }
        };

        match self.client.set_item(&self.storage_key(key), &json) {
            Ok(()) => debug!(key, bytes = json.len(), "Wrote local state"),
            Err(e) => warn!(key, error = %e, "Failed to write local state"),
        }
    }
}

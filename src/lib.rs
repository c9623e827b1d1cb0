// gridstore - keyed state replication with local fallback, and keyset-paginated listings

pub mod accessor;
pub mod area;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod cursor;
pub mod dataset;
pub mod filter;
pub mod jsonl;
pub mod listing;
pub mod local;
pub mod record;
pub mod remote;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-export main types for convenience
pub use accessor::RemoteAccessor;
pub use broadcast::{Broadcaster, ChannelHub, Origin};
pub use channel::{ListenerGuard, Topic};
pub use config::Config;
pub use cursor::CursorPayload;
pub use dataset::StaticDataset;
pub use listing::{ListPage, ListQuery, RecordLister};
pub use local::LocalStore;
pub use record::{BroadcastMessage, GRID_ROWS, ListedRecord, SETTINGS_PREFERENCES, StateEntry, now_ms};
pub use remote::{ChangeEvent, RemoteStore, SqliteRemote};
pub use state::{StateStore, Subscription};

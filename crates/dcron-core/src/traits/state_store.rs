// # State Store Trait
//
// Defines the interface for persistent key/value state.
//
// ## Purpose
//
// The state store is the single place the watcher keeps cross-tick state:
// - `ip`: the last public IP whose DNS update was verified
// - `monitor-input`: the "DNS in flux" marker, set while an update is
//   unverified
//
// It is constructed once at process start and passed by reference to
// the components that need it.
//
// ## Implementations
//
// - File-based: JSON file with atomic writes
// - Memory: for tests and one-shot runs

use async_trait::async_trait;

/// Key holding the last verified public IP
pub const LAST_IP_KEY: &str = "ip";

/// Key holding the "DNS in flux" marker
pub const DNS_MARKER_KEY: &str = "monitor-input";

/// Value of the marker while an update is unverified
pub const DNS_MARKER_PAUSE: &str = "pause";

/// A stored value and when it was written
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateEntry {
    /// The stored value
    pub value: String,
    /// Timestamp of the last write
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl StateEntry {
    /// Create an entry stamped with the current time
    ///
    /// # Visibility
    ///
    /// This is `pub(crate)` so entries are only stamped by store implementations.
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            updated_at: chrono::Utc::now(),
        }
    }
}

/// Trait for state store implementations
///
/// All methods must be safe to call concurrently from multiple tasks.
/// Writes are durable once the call returns (or after [`StateStore::flush`]
/// for buffering implementations).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get an entry
    ///
    /// # Returns
    ///
    /// - `Ok(Some(StateEntry))`: The entry
    /// - `Ok(None)`: Key not present
    /// - `Err(Error)`: Storage error
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, crate::Error>;

    /// Create or replace an entry
    async fn set(&self, key: &str, value: &str) -> Result<(), crate::Error>;

    /// Delete an entry (no-op if absent)
    async fn delete(&self, key: &str) -> Result<(), crate::Error>;

    /// List all keys in the store
    async fn list_keys(&self) -> Result<Vec<String>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;

    /// Get just the value of an entry
    async fn get_value(&self, key: &str) -> Result<Option<String>, crate::Error> {
        Ok(self.get(key).await?.map(|entry| entry.value))
    }
}

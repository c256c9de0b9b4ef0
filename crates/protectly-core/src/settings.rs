// ── Settings store ──
//
// The embedding application owns persistent settings (host, credentials)
// and may change them at runtime. The controller subscribes to change
// notifications so a credential edit triggers an immediate re-login
// instead of waiting for the next session refresh.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Settings key for the NVR account credentials.
pub const SETTING_CREDENTIALS: &str = "nvr:credentials";

const CHANGE_CHANNEL_SIZE: usize = 16;

/// Credentials as stored in application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub username: String,
    pub password: String,
}

/// Key-value settings seam. Change notifications carry the key that
/// changed.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value);
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// In-memory [`SettingsStore`] with change broadcast.
#[derive(Debug)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
    change_tx: broadcast::Sender<String>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            values: RwLock::new(HashMap::new()),
            change_tx,
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_owned(), value);
        // Send errors just mean nobody is listening yet.
        let _ = self.change_tx.send(key.to_owned());
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_notifies_subscribers_with_the_key() {
        let store = MemorySettingsStore::new();
        let mut rx = store.subscribe();

        store.set(
            SETTING_CREDENTIALS,
            serde_json::json!({ "username": "ubnt", "password": "pw" }),
        );

        assert_eq!(rx.try_recv().unwrap(), SETTING_CREDENTIALS);

        let stored: StoredCredentials =
            serde_json::from_value(store.get(SETTING_CREDENTIALS).unwrap()).unwrap();
        assert_eq!(stored.username, "ubnt");
    }

    #[test]
    fn get_missing_key_is_none() {
        let store = MemorySettingsStore::new();
        assert!(store.get("nope").is_none());
    }
}

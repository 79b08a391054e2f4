//! # Persistence Module
//!
//! ## Why This Module Exists
//! The device has to come back online after every reboot without anybody at the
//! console. Everything it learns while being provisioned (network credentials,
//! the broker it discovered, the identity it was given by the server) is kept in
//! a [`ConfigStore`] and read back by the orchestrator on the next start.
//!
//! ## Key Abstractions
//! - **Opaque string store**: the connectivity core only ever sees
//!   `get_string` / `set_string` / `delete_key`; the typed helpers below are
//!   the only place that knows the key names and value encodings.
//! - **Settings**: deploy-time tuning (retry bound, timeouts, blink periods)
//!   lives separately in [`settings::Settings`].
//!
//! ## Error Handling Strategy
//! A missing value is `Ok(None)` so the caller decides whether to prompt or to
//! skip the flow. Only backend failures are errors.

pub mod config_store;
pub mod settings;

pub use config_store::{ConfigStore, FileConfigStore, MemoryConfigStore, StoreError};

use tracing::warn;

pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASSWORD: &str = "wifi_pw";
pub const KEY_BROKER_URI: &str = "mqtt_uri";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_SERVER_URL: &str = "server_url";

/// Credentials of the wireless network the device joins.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

impl std::fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"***")
            .finish()
    }
}

/// Both SSID and password must be present, a half-configured network is
/// treated as not configured.
pub fn load_wifi_credentials(
    store: &dyn ConfigStore,
) -> Result<Option<NetworkCredentials>, StoreError> {
    let ssid = store.get_string(KEY_WIFI_SSID)?;
    let password = store.get_string(KEY_WIFI_PASSWORD)?;

    Ok(match (ssid, password) {
        (Some(ssid), Some(password)) => Some(NetworkCredentials { ssid, password }),
        _ => None,
    })
}

pub fn save_wifi_credentials(
    store: &dyn ConfigStore,
    credentials: &NetworkCredentials,
) -> Result<(), StoreError> {
    store.set_string(KEY_WIFI_SSID, &credentials.ssid)?;
    store.set_string(KEY_WIFI_PASSWORD, &credentials.password)
}

pub fn load_broker_uri(store: &dyn ConfigStore) -> Result<Option<String>, StoreError> {
    store.get_string(KEY_BROKER_URI)
}

pub fn save_broker_uri(store: &dyn ConfigStore, uri: &str) -> Result<(), StoreError> {
    store.set_string(KEY_BROKER_URI, uri)
}

/// Reads the numeric device id. A value that does not parse is reported and
/// treated as absent so registration can replace it.
pub fn load_device_id(store: &dyn ConfigStore) -> Result<Option<u32>, StoreError> {
    let Some(raw) = store.get_string(KEY_DEVICE_ID)? else {
        return Ok(None);
    };

    match raw.trim().parse::<u32>() {
        Ok(id) => Ok(Some(id)),
        Err(e) => {
            warn!("Ignoring stored device id {:?}: {}", raw, e);
            Ok(None)
        }
    }
}

pub fn save_device_id(store: &dyn ConfigStore, id: u32) -> Result<(), StoreError> {
    store.set_string(KEY_DEVICE_ID, &id.to_string())
}

pub fn delete_device_id(store: &dyn ConfigStore) -> Result<(), StoreError> {
    store.delete_key(KEY_DEVICE_ID)
}

pub fn load_server_url(store: &dyn ConfigStore) -> Result<Option<String>, StoreError> {
    store.get_string(KEY_SERVER_URL)
}

pub fn save_server_url(store: &dyn ConfigStore, url: &str) -> Result<(), StoreError> {
    store.set_string(KEY_SERVER_URL, url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_need_both_halves() {
        let store = MemoryConfigStore::with_entries([(KEY_WIFI_SSID, "Lab")]);
        assert!(load_wifi_credentials(&store).unwrap().is_none());

        store.set_string(KEY_WIFI_PASSWORD, "secret123").unwrap();
        let credentials = load_wifi_credentials(&store).unwrap().unwrap();
        assert_eq!(credentials.ssid, "Lab");
        assert_eq!(credentials.password, "secret123");
    }

    #[test]
    fn garbage_device_id_reads_as_missing() {
        let store = MemoryConfigStore::with_entries([(KEY_DEVICE_ID, "forty-two")]);
        assert_eq!(load_device_id(&store).unwrap(), None);

        save_device_id(&store, 42).unwrap();
        assert_eq!(load_device_id(&store).unwrap(), Some(42));

        delete_device_id(&store).unwrap();
        assert_eq!(load_device_id(&store).unwrap(), None);
    }

    #[test]
    fn password_is_not_logged() {
        let credentials = NetworkCredentials {
            ssid: "Lab".into(),
            password: "secret123".into(),
        };
        assert!(!format!("{:?}", credentials).contains("secret123"));
    }
}

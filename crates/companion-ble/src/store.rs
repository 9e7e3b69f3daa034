//! Persisted trust record and preferences
//!
//! A [`SettingsStore`] is a small durable key-value store; [`PairingStore`]
//! keeps the single paired device and the auto-connect flag in it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LinkError, LinkResult};
use crate::peer::PeerAddress;

const KEY_PAIRED_ADDRESS: &str = "paired_device_address";
const KEY_PAIRED_NAME: &str = "paired_device_name";
const KEY_PAIRED_AT: &str = "paired_at";
const KEY_AUTO_CONNECT: &str = "auto_connect";

// ----------------------------------------------------------------------------
// Settings Stores
// ----------------------------------------------------------------------------

/// Durable string key-value settings
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> LinkResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> LinkResult<()>;
    fn remove(&self, key: &str) -> LinkResult<()>;

    /// Write several keys as one update
    fn set_many(&self, entries: &[(&str, &str)]) -> LinkResult<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Remove several keys as one update
    fn remove_many(&self, keys: &[&str]) -> LinkResult<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> LinkResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| LinkError::Store("settings lock poisoned".into()))
}

/// Volatile store for tests and demos
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> LinkResult<Option<String>> {
        Ok(lock(&self.values)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> LinkResult<()> {
        lock(&self.values)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> LinkResult<()> {
        lock(&self.values)?.remove(key);
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> LinkResult<()> {
        let mut values = lock(&self.values)?;
        for (key, value) in entries {
            values.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> LinkResult<()> {
        let mut values = lock(&self.values)?;
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }
}

/// Settings kept in a pretty-printed JSON object on disk
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileSettings {
    /// Open the file, starting empty when it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> LinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded settings from {}", path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> LinkResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> LinkResult<Option<String>> {
        Ok(lock(&self.values)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> LinkResult<()> {
        let mut values = lock(&self.values)?;
        values.insert(key.to_string(), value.to_string());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> LinkResult<()> {
        let mut values = lock(&self.values)?;
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> LinkResult<()> {
        let mut values = lock(&self.values)?;
        for (key, value) in entries {
            values.insert(key.to_string(), value.to_string());
        }
        self.flush(&values)
    }

    fn remove_many(&self, keys: &[&str]) -> LinkResult<()> {
        let mut values = lock(&self.values)?;
        let mut changed = false;
        for key in keys {
            changed |= values.remove(*key).is_some();
        }
        if changed {
            self.flush(&values)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Pairing Store
// ----------------------------------------------------------------------------

/// The single trusted peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub address: PeerAddress,
    pub name: String,
    /// Milliseconds since the Unix epoch
    pub paired_at: u64,
}

/// Typed access to the pairing record
#[derive(Clone)]
pub struct PairingStore {
    settings: Arc<dyn SettingsStore>,
}

impl PairingStore {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySettings::new()))
    }

    pub fn load(&self) -> LinkResult<Option<PairedDevice>> {
        let Some(address) = self.settings.get(KEY_PAIRED_ADDRESS)? else {
            return Ok(None);
        };
        let name = self.settings.get(KEY_PAIRED_NAME)?.unwrap_or_default();
        let paired_at = self
            .settings
            .get(KEY_PAIRED_AT)?
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Ok(Some(PairedDevice {
            address: PeerAddress::new(address),
            name,
            paired_at,
        }))
    }

    /// Overwrite the trusted peer in a single write
    pub fn save(&self, device: &PairedDevice) -> LinkResult<()> {
        let paired_at = device.paired_at.to_string();
        self.settings.set_many(&[
            (KEY_PAIRED_ADDRESS, device.address.as_str()),
            (KEY_PAIRED_NAME, &device.name),
            (KEY_PAIRED_AT, &paired_at),
        ])?;
        info!("Saved paired device {} ({})", device.name, device.address);
        Ok(())
    }

    pub fn forget(&self) -> LinkResult<()> {
        self.settings
            .remove_many(&[KEY_PAIRED_ADDRESS, KEY_PAIRED_NAME, KEY_PAIRED_AT])?;
        info!("Forgot paired device");
        Ok(())
    }

    /// Defaults to enabled
    pub fn auto_connect(&self) -> LinkResult<bool> {
        Ok(self
            .settings
            .get(KEY_AUTO_CONNECT)?
            .map(|v| v != "false")
            .unwrap_or(true))
    }

    pub fn set_auto_connect(&self, enabled: bool) -> LinkResult<()> {
        self.settings
            .set(KEY_AUTO_CONNECT, if enabled { "true" } else { "false" })
    }
}

impl std::fmt::Debug for PairingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingStore").finish_non_exhaustive()
    }
}

/// Current wall-clock time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device() -> PairedDevice {
        PairedDevice {
            address: PeerAddress::new("AA:BB:CC:DD:EE:FF"),
            name: "Pixel".into(),
            paired_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_pairing_record_roundtrip() {
        let store = PairingStore::in_memory();
        assert_eq!(store.load().unwrap(), None);

        store.save(&device()).unwrap();
        assert_eq!(store.load().unwrap(), Some(device()));

        store.forget().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_auto_connect_flag() {
        let store = PairingStore::in_memory();
        assert!(store.auto_connect().unwrap());
        store.set_auto_connect(false).unwrap();
        assert!(!store.auto_connect().unwrap());

        // Forgetting the device keeps the preference
        store.forget().unwrap();
        assert!(!store.auto_connect().unwrap());
    }

    #[test]
    fn test_json_file_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        {
            let settings = Arc::new(JsonFileSettings::open(&path).unwrap());
            PairingStore::new(settings).save(&device()).unwrap();
        }

        let reopened = PairingStore::new(Arc::new(JsonFileSettings::open(&path).unwrap()));
        assert_eq!(reopened.load().unwrap(), Some(device()));

        let raw: BTreeMap<String, String> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.get(KEY_PAIRED_NAME).map(String::as_str), Some("Pixel"));
    }

    /// Counts writes and rejects single-key updates
    #[derive(Default)]
    struct BatchOnly {
        inner: MemorySettings,
        writes: Mutex<usize>,
    }

    impl SettingsStore for BatchOnly {
        fn get(&self, key: &str) -> LinkResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, _value: &str) -> LinkResult<()> {
            Err(LinkError::Store(format!("unbatched write of {}", key)))
        }

        fn remove(&self, key: &str) -> LinkResult<()> {
            Err(LinkError::Store(format!("unbatched removal of {}", key)))
        }

        fn set_many(&self, entries: &[(&str, &str)]) -> LinkResult<()> {
            *self.writes.lock().unwrap() += 1;
            self.inner.set_many(entries)
        }

        fn remove_many(&self, keys: &[&str]) -> LinkResult<()> {
            *self.writes.lock().unwrap() += 1;
            self.inner.remove_many(keys)
        }
    }

    #[test]
    fn test_pairing_record_is_written_as_one_update() {
        let settings = Arc::new(BatchOnly::default());
        let store = PairingStore::new(settings.clone());

        store.save(&device()).unwrap();
        assert_eq!(*settings.writes.lock().unwrap(), 1);
        assert_eq!(store.load().unwrap(), Some(device()));

        store.forget().unwrap();
        assert_eq!(*settings.writes.lock().unwrap(), 2);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_json_batch_replaces_whole_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = PairingStore::new(Arc::new(JsonFileSettings::open(&path).unwrap()));
        store.save(&device()).unwrap();

        let other = PairedDevice {
            address: PeerAddress::new("11:22:33:44:55:66"),
            name: "Desk".into(),
            paired_at: 1_800_000_000_000,
        };
        store.save(&other).unwrap();

        let raw: BTreeMap<String, String> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.get(KEY_PAIRED_ADDRESS).map(String::as_str), Some("11:22:33:44:55:66"));
        assert_eq!(raw.get(KEY_PAIRED_NAME).map(String::as_str), Some("Desk"));
        assert_eq!(raw.get(KEY_PAIRED_AT).map(String::as_str), Some("1800000000000"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(JsonFileSettings::open(&path), Err(LinkError::Json(_))));
    }
}

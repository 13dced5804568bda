//! Credentials and the persistence port they are stored through.
//!
//! The core never touches disk directly; it reads and writes credentials via
//! a [`CredentialStore`]. Two stores ship with the crate: an in-memory one and
//! a JSON file store for daemons.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Access/refresh token pair with the access token's expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// True when the access token is still usable at `now` with `margin` to
    /// spare.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        self.expires_at - margin > now
    }
}

// Tokens never end up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Read/write port for persisted credentials, keyed by server id.
pub trait CredentialStore: Send + Sync {
    /// Returns `Ok(None)` if nothing is stored for the server.
    fn load(&self, server_id: &str) -> Result<Option<Credentials>, StoreError>;

    /// Stores credentials, replacing any previous value.
    fn save(&self, server_id: &str, credentials: &Credentials) -> Result<(), StoreError>;

    /// Forgets the server's credentials.
    fn clear(&self, server_id: &str) -> Result<(), StoreError>;
}

/// Volatile store; contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an entry, builder style.
    pub fn with(self, server_id: impl Into<String>, credentials: Credentials) -> Self {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.into(), credentials);
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, server_id: &str) -> Result<Option<Credentials>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned())
    }

    fn save(&self, server_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.to_string(), credentials.clone());
        Ok(())
    }

    fn clear(&self, server_id: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        Ok(())
    }
}

/// Credentials cached in memory and persisted to a JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Credentials>>,
}

impl FileCredentialStore {
    /// Opens the store, loading existing entries from disk.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let entries = load_entries(&path)?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all server ids with stored credentials.
    pub fn server_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Writes the current entries to disk.
    fn persist(&self) -> Result<(), StoreError> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!("persisted {} credential(s) to {:?}", map.len(), self.path);
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, server_id: &str) -> Result<Option<Credentials>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned())
    }

    fn save(&self, server_id: &str, credentials: &Credentials) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.to_string(), credentials.clone());
        self.persist()
    }

    fn clear(&self, server_id: &str) -> Result<(), StoreError> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<HashMap<String, Credentials>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let entries: HashMap<String, Credentials> = serde_json::from_str(&data)?;
    debug!("loaded {} credential(s) from {:?}", entries.len(), path);
    Ok(entries)
}

/// Returns the default credential file path.
pub fn default_credentials_path() -> Option<PathBuf> {
    crate::config::config_dir().map(|d| d.join("tether").join("credentials.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(tag: &str) -> Credentials {
        Credentials::new(
            format!("access-{tag}"),
            format!("refresh-{tag}"),
            DateTime::<Utc>::UNIX_EPOCH + TimeDelta::hours(1),
        )
    }

    fn test_store() -> (tempfile::TempDir, FileCredentialStore) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("credentials.json");
        let store = FileCredentialStore::open(path).unwrap();
        (tmp, store)
    }

    #[test]
    fn validity_respects_margin() {
        let c = creds("a");
        let margin = TimeDelta::seconds(30);
        let before = c.expires_at - TimeDelta::seconds(31);
        let inside_margin = c.expires_at - TimeDelta::seconds(10);
        assert!(c.is_valid_at(before, margin));
        assert!(!c.is_valid_at(inside_margin, margin));
        assert!(!c.is_valid_at(c.expires_at, TimeDelta::zero()));
    }

    #[test]
    fn debug_redacts_tokens() {
        let rendered = format!("{:?}", creds("secret"));
        assert!(!rendered.contains("access-secret"));
        assert!(!rendered.contains("refresh-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryCredentialStore::new().with("srv", creds("a"));
        assert_eq!(store.load("srv").unwrap(), Some(creds("a")));
        store.save("srv", &creds("b")).unwrap();
        assert_eq!(store.load("srv").unwrap(), Some(creds("b")));
        store.clear("srv").unwrap();
        assert!(store.load("srv").unwrap().is_none());
    }

    #[test]
    fn new_file_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.server_ids().is_empty());
        assert!(store.load("srv").unwrap().is_none());
    }

    #[test]
    fn file_store_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("credentials.json");

        {
            let store = FileCredentialStore::open(path.clone()).unwrap();
            store.save("srv-1", &creds("1")).unwrap();
            store.save("srv-2", &creds("2")).unwrap();
        }

        let reopened = FileCredentialStore::open(path).unwrap();
        assert_eq!(reopened.load("srv-1").unwrap(), Some(creds("1")));
        assert_eq!(reopened.load("srv-2").unwrap(), Some(creds("2")));
        let mut ids = reopened.server_ids();
        ids.sort();
        assert_eq!(ids, vec!["srv-1", "srv-2"]);
    }

    #[test]
    fn file_store_clear_is_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("credentials.json");
        let store = FileCredentialStore::open(path.clone()).unwrap();
        store.save("srv", &creds("a")).unwrap();
        store.clear("srv").unwrap();

        let reopened = FileCredentialStore::open(path).unwrap();
        assert!(reopened.load("srv").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_tmp, store) = test_store();
        store.save("srv", &creds("a")).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let path = PathBuf::from("/tmp/nonexistent_tether_test_credentials.json");
        assert!(load_entries(&path).unwrap().is_empty());
    }
}

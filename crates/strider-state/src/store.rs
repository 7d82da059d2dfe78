//! KvStore — redb-backed versioned key-value persistence.
//!
//! Every `store` writes a new version row and moves the current pointer;
//! historical versions stay until compaction trims them. The current
//! pointer can also be moved with compare-and-set, which is how the root
//! group serializes concurrent modification.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{version_key, version_prefix, CURRENT, VERSIONS};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The current pointer stored per key.
#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: u64,
}

/// Thread-safe versioned store backed by redb.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
}

impl KvStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CURRENT).map_err(map_err!(Table))?;
        txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Write a new version of `key` and move the current pointer to it.
    pub fn store(&self, key: &str, version: u64, value: &[u8]) -> StateResult<()> {
        self.write_version(key, version, value, None, false)
    }

    /// Compare-and-set write: succeeds only when the current pointer
    /// matches `expected` (`None` = key must be absent). Mismatch yields
    /// a retryable [`StateError::Conflict`].
    pub fn store_cas(
        &self,
        key: &str,
        version: u64,
        value: &[u8],
        expected: Option<u64>,
    ) -> StateResult<()> {
        self.write_version(key, version, value, Some(expected), true)
    }

    fn write_version(
        &self,
        key: &str,
        version: u64,
        value: &[u8],
        expected: Option<Option<u64>>,
        check: bool,
    ) -> StateResult<()> {
        let pointer = serde_json::to_vec(&CurrentPointer { version }).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut current = txn.open_table(CURRENT).map_err(map_err!(Table))?;
            if check {
                let actual = match current.get(key).map_err(map_err!(Read))? {
                    Some(guard) => {
                        let p: CurrentPointer = serde_json::from_slice(guard.value())
                            .map_err(map_err!(Deserialize))?;
                        Some(p.version)
                    }
                    None => None,
                };
                let expected = expected.unwrap_or(None);
                if actual != expected {
                    return Err(StateError::Conflict {
                        key: key.to_string(),
                        expected,
                        actual,
                    });
                }
            }
            current
                .insert(key, pointer.as_slice())
                .map_err(map_err!(Write))?;
            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            versions
                .insert(version_key(key, version).as_str(), value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read the current value of `key`, with its version.
    pub fn get(&self, key: &str) -> StateResult<Option<(u64, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let current = txn.open_table(CURRENT).map_err(map_err!(Table))?;
        let pointer = match current.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let p: CurrentPointer =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                p.version
            }
            None => return Ok(None),
        };
        let versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        match versions
            .get(version_key(key, pointer).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => Ok(Some((pointer, guard.value().to_vec()))),
            None => Err(StateError::NotFound(format!(
                "{key}: current pointer {pointer} has no version row"
            ))),
        }
    }

    /// Read one historical version of `key`.
    pub fn get_version(&self, key: &str, version: u64) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        Ok(versions
            .get(version_key(key, version).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// All retained versions of `key`, ascending.
    pub fn versions(&self, key: &str) -> StateResult<Vec<u64>> {
        let prefix = version_prefix(key);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in versions.iter().map_err(map_err!(Read))? {
            let (k, _) = entry.map_err(map_err!(Read))?;
            if let Some(suffix) = k.value().strip_prefix(prefix.as_str()) {
                if let Ok(version) = suffix.parse::<u64>() {
                    out.push(version);
                }
            }
        }
        Ok(out)
    }

    /// Delete `key` entirely: current pointer and every retained version.
    /// Returns true if the key existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let prefix = version_prefix(key);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut current = txn.open_table(CURRENT).map_err(map_err!(Table))?;
            existed = current.remove(key).map_err(map_err!(Write))?.is_some();
            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let stale: Vec<String> = versions
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (k, _) = entry.ok()?;
                    let k = k.value().to_string();
                    k.starts_with(prefix.as_str()).then_some(k)
                })
                .collect();
            for k in &stale {
                versions.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Remove one historical version of `key`. The current version is
    /// left alone even if named.
    pub fn delete_version(&self, key: &str, version: u64) -> StateResult<bool> {
        if let Some((current, _)) = self.get(key)? {
            if current == version {
                return Ok(false);
            }
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            existed = versions
                .remove(version_key(key, version).as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All live keys under a prefix.
    pub fn ids(&self, prefix: &str) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let current = txn.open_table(CURRENT).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for entry in current.iter().map_err(map_err!(Read))? {
            let (k, _) = entry.map_err(map_err!(Read))?;
            if k.value().starts_with(prefix) {
                out.push(k.value().to_string());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KvStore {
        KvStore::open_in_memory().unwrap()
    }

    #[test]
    fn store_and_get_current() {
        let kv = store();
        kv.store("group:/", 10, b"v10").unwrap();
        kv.store("group:/", 20, b"v20").unwrap();

        let (version, value) = kv.get("group:/").unwrap().unwrap();
        assert_eq!(version, 20);
        assert_eq!(value, b"v20");
    }

    #[test]
    fn get_missing_returns_none() {
        assert!(store().get("nope").unwrap().is_none());
    }

    #[test]
    fn versions_ascending() {
        let kv = store();
        kv.store("k", 30, b"c").unwrap();
        kv.store("k", 10, b"a").unwrap();
        kv.store("k", 20, b"b").unwrap();

        assert_eq!(kv.versions("k").unwrap(), vec![10, 20, 30]);
        assert_eq!(kv.get_version("k", 10).unwrap().unwrap(), b"a");
    }

    #[test]
    fn versions_do_not_leak_across_keys() {
        let kv = store();
        kv.store("k", 1, b"a").unwrap();
        kv.store("k2", 2, b"b").unwrap();

        assert_eq!(kv.versions("k").unwrap(), vec![1]);
        assert_eq!(kv.versions("k2").unwrap(), vec![2]);
    }

    #[test]
    fn cas_succeeds_on_expected_version() {
        let kv = store();
        kv.store_cas("root", 1, b"a", None).unwrap();
        kv.store_cas("root", 2, b"b", Some(1)).unwrap();

        let (version, _) = kv.get("root").unwrap().unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn cas_conflict_is_retryable() {
        let kv = store();
        kv.store("root", 5, b"a").unwrap();

        let err = kv.store_cas("root", 6, b"b", Some(4)).unwrap_err();
        assert!(err.is_retryable());
        match err {
            StateError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, Some(4));
                assert_eq!(actual, Some(5));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Value unchanged.
        let (version, value) = kv.get("root").unwrap().unwrap();
        assert_eq!(version, 5);
        assert_eq!(value, b"a");
    }

    #[test]
    fn cas_expecting_absent_conflicts_when_present() {
        let kv = store();
        kv.store("root", 5, b"a").unwrap();
        assert!(kv.store_cas("root", 6, b"b", None).is_err());
    }

    #[test]
    fn delete_removes_all_versions() {
        let kv = store();
        kv.store("k", 1, b"a").unwrap();
        kv.store("k", 2, b"b").unwrap();

        assert!(kv.delete("k").unwrap());
        assert!(!kv.delete("k").unwrap());
        assert!(kv.get("k").unwrap().is_none());
        assert!(kv.versions("k").unwrap().is_empty());
    }

    #[test]
    fn delete_version_spares_current() {
        let kv = store();
        kv.store("k", 1, b"a").unwrap();
        kv.store("k", 2, b"b").unwrap();

        // Current version is protected.
        assert!(!kv.delete_version("k", 2).unwrap());
        assert!(kv.delete_version("k", 1).unwrap());
        assert_eq!(kv.versions("k").unwrap(), vec![2]);
    }

    #[test]
    fn ids_filters_by_prefix() {
        let kv = store();
        kv.store("instance:a", 1, b"x").unwrap();
        kv.store("instance:b", 1, b"x").unwrap();
        kv.store("group:/", 1, b"x").unwrap();

        let ids = kv.ids("instance:").unwrap();
        assert_eq!(ids, vec!["instance:a", "instance:b"]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("strider.redb");

        {
            let kv = KvStore::open(&db_path).unwrap();
            kv.store("group:/", 42, b"tree").unwrap();
        }

        // Reopen the same database file.
        let kv = KvStore::open(&db_path).unwrap();
        let (version, value) = kv.get("group:/").unwrap().unwrap();
        assert_eq!(version, 42);
        assert_eq!(value, b"tree");
    }
}

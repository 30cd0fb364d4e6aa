use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::trace;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use super::{Disk, Memory};

//------------ Key -----------------------------------------------------------

/// A key in a store: a scope and a name within that scope.
///
/// Neither part may be empty or contain a slash.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Key {
    scope: String,
    name: String,
}

impl Key {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Result<Self, KeyValueError> {
        let key = Key {
            scope: scope.into(),
            name: name.into(),
        };
        if Self::valid_segment(&key.scope) && Self::valid_segment(&key.name) {
            Ok(key)
        } else {
            Err(KeyValueError::InvalidKey(key))
        }
    }

    fn valid_segment(s: &str) -> bool {
        !s.is_empty() && !s.contains('/') && s != "." && s != ".."
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

//------------ KeyValueStore -------------------------------------------------

#[derive(Debug)]
pub enum KeyValueStore {
    Memory(Memory),
    Disk(Disk),
}

// # Construct and high level functions.
impl KeyValueStore {
    /// Creates a new KeyValueStore for the given namespace.
    pub fn create(storage_uri: &Url, namespace: &str) -> Result<Self, KeyValueError> {
        if !Key::valid_segment(namespace) {
            return Err(KeyValueError::Other(format!("invalid namespace: {}", namespace)));
        }
        match storage_uri.scheme() {
            "local" => {
                let path = format!("{}{}", storage_uri.host_str().unwrap_or_default(), storage_uri.path());
                Ok(KeyValueStore::Disk(Disk::new(&path, namespace)?))
            }
            "memory" => Ok(KeyValueStore::Memory(Memory::new(storage_uri.host_str(), namespace))),
            scheme => Err(KeyValueError::UnknownScheme(scheme.to_owned())),
        }
    }

    /// Runs the closure in a transaction.
    ///
    /// Other transactions on the same store wait until this one is done.
    /// Writes made through the transaction become visible to later reads
    /// of the same transaction immediately, and to everybody else only
    /// after the closure returned `Ok`. If it returns an error, nothing is
    /// written.
    pub fn execute<F, T>(&self, op: F) -> Result<T, KeyValueError>
    where
        F: FnOnce(&mut Transaction) -> Result<T, KeyValueError>,
    {
        match self {
            KeyValueStore::Memory(memory) => memory.execute(op),
            KeyValueStore::Disk(disk) => disk.execute(op),
        }
    }

    /// Stores a key value pair, serialized as json, overwrite existing
    pub fn store<V: Serialize>(&self, key: &Key, value: &V) -> Result<(), KeyValueError> {
        self.execute(|tx| tx.store(key, value))
    }

    /// Gets a value for a key, returns an error if the value cannot be
    /// deserialized, returns None if it cannot be found.
    pub fn get<V: DeserializeOwned>(&self, key: &Key) -> Result<Option<V>, KeyValueError> {
        self.execute(|tx| tx.get(key))
    }

    /// Delete a key-value pair. Deleting an absent key is not an error.
    pub fn drop_key(&self, key: &Key) -> Result<(), KeyValueError> {
        self.execute(|tx| {
            tx.delete(key);
            Ok(())
        })
    }

    /// Returns all keys for the given scope
    pub fn list_keys(&self, scope: &str) -> StorageResult<Vec<Key>> {
        self.execute(|tx| tx.list_keys(scope))
    }

    /// Returns all values in the given scope.
    pub fn values<V: DeserializeOwned>(&self, scope: &str) -> StorageResult<Vec<(Key, V)>> {
        self.execute(|tx| tx.values(scope))
    }
}

impl fmt::Display for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValueStore::Memory(memory) => memory.fmt(f),
            KeyValueStore::Disk(disk) => disk.fmt(f),
        }
    }
}

//------------ Transaction ---------------------------------------------------

/// Read access to committed data, implemented by each backend.
pub(super) trait Snapshot {
    fn read(&self, key: &Key) -> StorageResult<Option<Value>>;
    fn keys(&self, scope: &str) -> StorageResult<Vec<Key>>;
}

/// The view of a store inside [`KeyValueStore::execute`].
pub struct Transaction<'a> {
    snapshot: &'a dyn Snapshot,
    writes: BTreeMap<Key, Option<Value>>,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(snapshot: &'a dyn Snapshot) -> Self {
        Transaction {
            snapshot,
            writes: BTreeMap::new(),
        }
    }

    pub(super) fn into_writes(self) -> BTreeMap<Key, Option<Value>> {
        self.writes
    }

    pub fn get<V: DeserializeOwned>(&self, key: &Key) -> StorageResult<Option<V>> {
        let value = match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.snapshot.read(key)?,
        };
        match value {
            Some(value) => {
                trace!("got value for key: {}", key);
                Ok(Some(serde_json::from_value(value)?))
            }
            None => {
                trace!("got nothing for key: {}", key);
                Ok(None)
            }
        }
    }

    pub fn has(&self, key: &Key) -> StorageResult<bool> {
        match self.writes.get(key) {
            Some(pending) => Ok(pending.is_some()),
            None => Ok(self.snapshot.read(key)?.is_some()),
        }
    }

    pub fn store<V: Serialize>(&mut self, key: &Key, value: &V) -> StorageResult<()> {
        self.writes.insert(key.clone(), Some(serde_json::to_value(value)?));
        Ok(())
    }

    pub fn delete(&mut self, key: &Key) {
        self.writes.insert(key.clone(), None);
    }

    pub fn list_keys(&self, scope: &str) -> StorageResult<Vec<Key>> {
        let mut keys: BTreeSet<Key> = self.snapshot.keys(scope)?.into_iter().collect();
        for (key, pending) in self.writes.iter().filter(|(k, _)| k.scope() == scope) {
            match pending {
                Some(_) => keys.insert(key.clone()),
                None => keys.remove(key),
            };
        }
        Ok(keys.into_iter().collect())
    }

    pub fn values<V: DeserializeOwned>(&self, scope: &str) -> StorageResult<Vec<(Key, V)>> {
        let mut res = vec![];
        for key in self.list_keys(scope)? {
            if let Some(value) = self.get(&key)? {
                res.push((key, value));
            }
        }
        Ok(res)
    }
}

//------------ StorageResult -------------------------------------------------

pub type StorageResult<T> = Result<T, KeyValueError>;

//------------ KeyValueError -------------------------------------------------

/// This type defines possible Errors for KeyValueStore
#[derive(Debug)]
pub enum KeyValueError {
    UnknownScheme(String),
    IoError(String),
    JsonError(serde_json::Error),
    InvalidKey(Key),
    Other(String),
}

impl From<serde_json::Error> for KeyValueError {
    fn from(e: serde_json::Error) -> Self {
        KeyValueError::JsonError(e)
    }
}

impl fmt::Display for KeyValueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyValueError::UnknownScheme(e) => write!(f, "Unknown Scheme: {}", e),
            KeyValueError::IoError(e) => write!(f, "I/O error: {}", e),
            KeyValueError::JsonError(e) => write!(f, "JSON error: {}", e),
            KeyValueError::InvalidKey(key) => write!(f, "Invalid key: {}", key),
            KeyValueError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for KeyValueError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<(KeyValueStore, Option<tempfile::TempDir>)> {
        let mem_uri = Url::parse(&format!("memory://{}", uuid::Uuid::new_v4())).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let disk_uri = Url::parse(&format!("local://{}", dir.path().display())).unwrap();
        vec![
            (KeyValueStore::create(&mem_uri, "test").unwrap(), None),
            (KeyValueStore::create(&disk_uri, "test").unwrap(), Some(dir)),
        ]
    }

    #[test]
    fn store_get_and_drop() {
        for (store, _dir) in stores() {
            let key = Key::new("certs", "1-ab").unwrap();
            assert_eq!(store.get::<String>(&key).unwrap(), None);

            store.store(&key, &"value".to_string()).unwrap();
            assert_eq!(store.get::<String>(&key).unwrap(), Some("value".to_string()));
            assert_eq!(store.list_keys("certs").unwrap(), vec![key.clone()]);

            store.drop_key(&key).unwrap();
            assert_eq!(store.get::<String>(&key).unwrap(), None);
            assert!(store.list_keys("certs").unwrap().is_empty());
        }
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        for (store, _dir) in stores() {
            let a = Key::new("s", "a").unwrap();
            let b = Key::new("s", "b").unwrap();
            store.store(&a, &1).unwrap();

            let res: StorageResult<()> = store.execute(|tx| {
                tx.store(&a, &2)?;
                tx.store(&b, &2)?;
                assert_eq!(tx.get::<i32>(&a)?, Some(2));
                Err(KeyValueError::Other("abort".into()))
            });
            assert!(res.is_err());

            assert_eq!(store.get::<i32>(&a).unwrap(), Some(1));
            assert_eq!(store.get::<i32>(&b).unwrap(), None);
        }
    }

    #[test]
    fn transaction_sees_own_deletes() {
        for (store, _dir) in stores() {
            let a = Key::new("s", "a").unwrap();
            let b = Key::new("s", "b").unwrap();
            store.store(&a, &1).unwrap();
            store.store(&b, &1).unwrap();

            store
                .execute(|tx| {
                    tx.delete(&a);
                    assert!(!tx.has(&a)?);
                    assert_eq!(tx.list_keys("s")?, vec![b.clone()]);
                    Ok(())
                })
                .unwrap();
            assert_eq!(store.values::<i32>("s").unwrap().len(), 1);
        }
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(Key::new("a/b", "c").is_err());
        assert!(Key::new("a", "").is_err());
        assert!(Key::new("..", "x").is_err());
    }
}

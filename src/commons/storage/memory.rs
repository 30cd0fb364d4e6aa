use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use lazy_static::lazy_static;
use serde_json::Value;

use super::kv::{Key, KeyValueError, Snapshot, StorageResult, Transaction};

type Namespace = HashMap<Key, Value>;

lazy_static! {
    static ref STORE: Mutex<HashMap<String, Namespace>> = Mutex::new(HashMap::new());
}

/// A store kept in process memory.
///
/// All stores created for the same `memory://<name>` URL and namespace see
/// the same data for as long as the process lives. Transactions must not
/// be nested: the closure of one may not use another memory store.
#[derive(Debug)]
pub struct Memory {
    namespace: String,
}

impl Memory {
    pub fn new(name: Option<&str>, namespace: &str) -> Self {
        Memory {
            namespace: format!("{}/{}", name.unwrap_or_default(), namespace),
        }
    }

    pub(super) fn execute<F, T>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Transaction) -> StorageResult<T>,
    {
        let mut store = STORE
            .lock()
            .map_err(|_| KeyValueError::Other("memory store lock poisoned".to_string()))?;
        let map = store.entry(self.namespace.clone()).or_default();

        let (res, writes) = {
            let snapshot = MemorySnapshot(&*map);
            let mut tx = Transaction::new(&snapshot);
            let res = op(&mut tx)?;
            (res, tx.into_writes())
        };

        for (key, value) in writes {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(res)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory://{}", self.namespace)
    }
}

struct MemorySnapshot<'a>(&'a Namespace);

impl Snapshot for MemorySnapshot<'_> {
    fn read(&self, key: &Key) -> StorageResult<Option<Value>> {
        Ok(self.0.get(key).cloned())
    }

    fn keys(&self, scope: &str) -> StorageResult<Vec<Key>> {
        Ok(self.0.keys().filter(|k| k.scope() == scope).cloned().collect())
    }
}

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::fmt;

use lazy_static::lazy_static;
use serde_json::Value;

use super::kv::{Key, KeyValueError, Snapshot, StorageResult, Transaction};

lazy_static! {
    static ref LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

/// A store keeping one JSON file per key below `<path>/<namespace>`.
///
/// Every value lives in `<scope>/<name>.json`. Files are replaced through a
/// rename so readers never see a half written value.
#[derive(Debug)]
pub struct Disk {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Disk {
    pub fn new(path: &str, namespace: &str) -> StorageResult<Self> {
        let root = Path::new(path).join(namespace);
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;

        let lock = LOCKS
            .lock()
            .map_err(|_| KeyValueError::Other("disk lock registry poisoned".to_string()))?
            .entry(root.clone())
            .or_default()
            .clone();

        Ok(Disk { root, lock })
    }

    pub(super) fn execute<F, T>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Transaction) -> StorageResult<T>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| KeyValueError::Other(format!("lock for {} poisoned", self.root.display())))?;

        let snapshot = DiskSnapshot { root: &self.root };
        let mut tx = Transaction::new(&snapshot);
        let res = op(&mut tx)?;

        for (key, value) in tx.into_writes() {
            let path = self.path(&key);
            match value {
                Some(value) => write_atomic(&path, &serde_json::to_vec_pretty(&value)?)?,
                None => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&path, e)),
                },
            }
        }
        Ok(res)
    }

    fn path(&self, key: &Key) -> PathBuf {
        key_path(&self.root, key)
    }
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local://{}", self.root.display())
    }
}

fn key_path(root: &Path, key: &Key) -> PathBuf {
    root.join(key.scope()).join(format!("{}.json", key.name()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: io::Error) -> KeyValueError {
    KeyValueError::IoError(format!("{}: {}", path.display(), e))
}

struct DiskSnapshot<'a> {
    root: &'a Path,
}

impl Snapshot for DiskSnapshot<'_> {
    fn read(&self, key: &Key) -> StorageResult<Option<Value>> {
        let path = key_path(self.root, key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn keys(&self, scope: &str) -> StorageResult<Vec<Key>> {
        let dir = self.root.join(scope);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut keys = vec![];
        for entry in entries {
            let path = entry.map_err(|e| io_error(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(Key::new(scope, name)?);
            }
        }
        Ok(keys)
    }
}

//! Durable key value storage.
//!
//! Stores are created from a storage URL: `memory://<name>` for a process
//! wide in-memory store, `local://<path>` for JSON files on disk. All
//! access goes through [`KeyValueStore::execute`] which applies the writes
//! of its closure all together, or not at all when the closure fails.

mod disk;
mod kv;
mod memory;

pub use self::disk::Disk;
pub use self::kv::{Key, KeyValueError, KeyValueStore, StorageResult, Transaction};
pub use self::memory::Memory;

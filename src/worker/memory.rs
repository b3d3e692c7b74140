// src/worker/memory.rs

//! Local storage of task results.
//!
//! [`SpillBuffer`] keeps the most recently used results in RAM up to a
//! byte target and moves the least recently used ones to files in a spill
//! directory. Reading a spilled key loads it back ("promotes" it), which
//! may in turn spill other keys.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, error, trace};

use crate::errors::Result;
use crate::types::Key;

/// Storage backend for results held by a worker.
pub trait DataStore: fmt::Debug + Send {
    fn insert(&mut self, key: Key, value: Bytes) -> Result<()>;

    /// Read a value, promoting it to RAM if the store spills.
    fn get(&mut self, key: &str) -> Result<Option<Bytes>>;

    /// Remove a value. Returns whether it was present.
    fn remove(&mut self, key: &str) -> Result<bool>;

    fn contains(&self, key: &str) -> bool;

    fn nbytes(&self, key: &str) -> Option<u64>;

    fn keys(&self) -> Vec<Key>;

    /// Bytes held in RAM.
    fn memory_bytes(&self) -> u64;

    fn spilled_bytes(&self) -> u64 {
        0
    }

    fn spilled_count(&self) -> usize {
        0
    }

    /// Whether reads and writes may hit the filesystem.
    fn uses_disk(&self) -> bool {
        false
    }
}

/// Plain in-RAM store; never spills.
impl DataStore for BTreeMap<Key, Bytes> {
    fn insert(&mut self, key: Key, value: Bytes) -> Result<()> {
        BTreeMap::insert(self, key, value);
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        Ok(BTreeMap::get(self, key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        Ok(BTreeMap::remove(self, key).is_some())
    }

    fn contains(&self, key: &str) -> bool {
        self.contains_key(key)
    }

    fn nbytes(&self, key: &str) -> Option<u64> {
        BTreeMap::get(self, key).map(|v| v.len() as u64)
    }

    fn keys(&self) -> Vec<Key> {
        BTreeMap::keys(self).cloned().collect()
    }

    fn memory_bytes(&self) -> u64 {
        self.values().map(|v| v.len() as u64).sum()
    }
}

/// LRU-ordered in-memory store that spills to disk above `target` bytes.
///
/// Without a spill directory nothing is ever spilled and `target` is only
/// advisory. A value that fails to spill stays in RAM.
pub struct SpillBuffer {
    target: u64,
    directory: Option<PathBuf>,
    fast: LruCache<Key, Bytes>,
    fast_bytes: u64,
    slow: BTreeMap<Key, u64>,
    slow_bytes: u64,
}

impl fmt::Debug for SpillBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillBuffer")
            .field("target", &self.target)
            .field("directory", &self.directory)
            .field("fast", &self.fast.len())
            .field("fast_bytes", &self.fast_bytes)
            .field("slow", &self.slow.len())
            .field("slow_bytes", &self.slow_bytes)
            .finish()
    }
}

impl SpillBuffer {
    /// Create a buffer; the spill directory is created if needed.
    pub fn new(target: u64, directory: Option<&Path>) -> Result<Self> {
        if let Some(dir) = directory {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            target,
            directory: directory.map(Path::to_path_buf),
            fast: LruCache::unbounded(),
            fast_bytes: 0,
            slow: BTreeMap::new(),
            slow_bytes: 0,
        })
    }

    /// Keys currently on disk.
    pub fn spilled_keys(&self) -> BTreeSet<Key> {
        self.slow.keys().cloned().collect()
    }

    fn spill_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(blake3::hash(key.as_bytes()).to_hex().as_str())
    }

    /// Move least recently used values to disk until RAM is under target.
    /// The most recently used value always stays in RAM. Stops at the first
    /// failed write, leaving that value in RAM at the LRU end.
    fn evict(&mut self) {
        let Some(dir) = self.directory.clone() else {
            return;
        };
        while self.fast_bytes > self.target && self.fast.len() > 1 {
            let Some((key, value)) = self.fast.pop_lru() else {
                break;
            };
            let nbytes = value.len() as u64;
            let path = Self::spill_path(&dir, &key);
            if let Err(err) = fs::write(&path, &value) {
                error!(key = %key, path = %path.display(), error = %err, "spill to disk failed; keeping value in memory");
                self.fast.put(key.clone(), value);
                self.fast.demote(&key);
                break;
            }
            trace!(key = %key, nbytes, "spilled to disk");
            self.fast_bytes -= nbytes;
            self.slow_bytes += nbytes;
            self.slow.insert(key, nbytes);
        }
    }

    /// Load a spilled value back, dropping its file. The key stays spilled
    /// if the file cannot be read.
    fn take_slow(&mut self, key: &str) -> Result<Option<Bytes>> {
        let (Some(&nbytes), Some(dir)) = (self.slow.get(key), &self.directory) else {
            return Ok(None);
        };
        let path = Self::spill_path(dir, key);
        let value = fs::read(&path)?;
        Self::remove_file(&path, key);
        self.slow.remove(key);
        self.slow_bytes -= nbytes;
        Ok(Some(Bytes::from(value)))
    }

    fn discard_slow(&mut self, key: &str) -> bool {
        let Some(nbytes) = self.slow.remove(key) else {
            return false;
        };
        self.slow_bytes -= nbytes;
        if let Some(dir) = &self.directory {
            Self::remove_file(&Self::spill_path(dir, key), key);
        }
        true
    }

    fn remove_file(path: &Path, key: &str) {
        if let Err(err) = fs::remove_file(path) {
            debug!(key = %key, error = %err, "could not remove spill file");
        }
    }
}

impl DataStore for SpillBuffer {
    fn insert(&mut self, key: Key, value: Bytes) -> Result<()> {
        self.remove(&key)?;
        self.fast_bytes += value.len() as u64;
        self.fast.put(key, value);
        self.evict();
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        if let Some(value) = self.fast.get(key) {
            return Ok(Some(value.clone()));
        }
        let Some(value) = self.take_slow(key)? else {
            return Ok(None);
        };
        trace!(key = %key, "promoted from disk");
        self.fast_bytes += value.len() as u64;
        self.fast.put(key.to_string(), value.clone());
        self.evict();
        Ok(Some(value))
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        if let Some(value) = self.fast.pop(key) {
            self.fast_bytes -= value.len() as u64;
            return Ok(true);
        }
        Ok(self.discard_slow(key))
    }

    fn contains(&self, key: &str) -> bool {
        self.fast.contains(key) || self.slow.contains_key(key)
    }

    fn nbytes(&self, key: &str) -> Option<u64> {
        self.fast
            .peek(key)
            .map(|v| v.len() as u64)
            .or_else(|| self.slow.get(key).copied())
    }

    fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.fast.iter().map(|(k, _)| k.clone()).collect();
        keys.extend(self.slow.keys().cloned());
        keys.sort();
        keys
    }

    fn memory_bytes(&self) -> u64 {
        self.fast_bytes
    }

    fn spilled_bytes(&self) -> u64 {
        self.slow_bytes
    }

    fn spilled_count(&self) -> usize {
        self.slow.len()
    }

    fn uses_disk(&self) -> bool {
        self.directory.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: usize) -> Bytes {
        Bytes::from(vec![7u8; n])
    }

    #[test]
    fn spills_least_recently_used_and_promotes_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = SpillBuffer::new(100, Some(dir.path())).unwrap();

        buf.insert("a".into(), value(60)).unwrap();
        buf.insert("b".into(), value(60)).unwrap();
        assert_eq!(buf.spilled_keys(), BTreeSet::from(["a".to_string()]));
        assert_eq!(buf.memory_bytes(), 60);
        assert_eq!(buf.spilled_bytes(), 60);

        let a = buf.get("a").unwrap().unwrap();
        assert_eq!(a.len(), 60);
        assert_eq!(buf.spilled_keys(), BTreeSet::from(["b".to_string()]));
        assert_eq!(buf.spilled_count(), 1);
        assert!(buf.contains("a") && buf.contains("b"));
    }

    #[test]
    fn remove_deletes_spilled_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = SpillBuffer::new(10, Some(dir.path())).unwrap();
        buf.insert("a".into(), value(20)).unwrap();
        buf.insert("b".into(), value(20)).unwrap();

        assert!(buf.remove("a").unwrap());
        assert!(!buf.contains("a"));
        assert_eq!(buf.spilled_bytes(), 0);
        assert_eq!(buf.keys(), vec!["b".to_string()]);
        assert!(!buf.remove("a").unwrap());
    }

    #[test]
    fn unwritable_directory_keeps_values_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let spill_dir = dir.path().join("spill");
        let mut buf = SpillBuffer::new(100, Some(&spill_dir)).unwrap();
        fs::remove_dir_all(&spill_dir).unwrap();

        buf.insert("a".into(), value(60)).unwrap();
        buf.insert("b".into(), value(60)).unwrap();
        assert_eq!(buf.spilled_count(), 0);
        assert_eq!(buf.memory_bytes(), 120);
        assert_eq!(buf.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buf.nbytes("a"), Some(60));

        // Once the directory is back, the value that failed goes first.
        fs::create_dir_all(&spill_dir).unwrap();
        buf.insert("c".into(), value(10)).unwrap();
        assert_eq!(buf.spilled_keys(), BTreeSet::from(["a".to_string()]));
        assert_eq!(buf.memory_bytes(), 70);
        assert_eq!(buf.get("a").unwrap().map(|v| v.len()), Some(60));
    }

    #[test]
    fn without_directory_everything_stays_in_memory() {
        let mut buf = SpillBuffer::new(1, None).unwrap();
        buf.insert("a".into(), value(5)).unwrap();
        buf.insert("b".into(), value(5)).unwrap();
        assert_eq!(buf.memory_bytes(), 10);
        assert_eq!(buf.spilled_count(), 0);
        assert_eq!(buf.nbytes("a"), Some(5));
    }
}

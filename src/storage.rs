//! In-memory key-value storage.
//!
//! The store is owned by the event loop and handed to the command processor by
//! mutable reference, so it needs no locking. Keys and values are arbitrary bytes.

use std::collections::HashMap;
use tracing::{info, trace};

/// Snapshot of storage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStats {
    /// Number of keys stored.
    pub item_count: usize,
    /// Approximate bytes held by keys and values.
    pub memory_used: usize,
}

/// Byte-keyed in-memory map.
#[derive(Debug, Default)]
pub struct Storage {
    data: HashMap<Vec<u8>, Vec<u8>>,
    /// Sum of key and value lengths.
    memory_used: usize,
}

impl Storage {
    /// Create an empty store.
    pub fn new() -> Self {
        info!("Initializing storage");
        Self::default()
    }

    /// Look up a value.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Insert or overwrite a value.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        trace!(key_len = key.len(), value_len = value.len(), "set");
        let key_len = key.len();
        let value_len = value.len();
        match self.data.insert(key, value) {
            // Key already counted
            Some(old) => self.memory_used = self.memory_used - old.len() + value_len,
            None => self.memory_used += key_len + value_len,
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.data.remove(key) {
            Some(value) => {
                self.memory_used -= key.len() + value.len();
                true
            }
            None => false,
        }
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            item_count: self.data.len(),
            memory_used: self.memory_used,
        }
    }
}

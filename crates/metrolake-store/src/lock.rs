//! Per-key write locks.
//!
//! At most one writer per partition key inside this process; the manifest
//! claim covers other processes.

use std::sync::{Condvar, Mutex};

use rustc_hash::FxHashSet;

/// Set of keys currently held by a writer.
#[derive(Default)]
pub struct KeyLocks {
    held: Mutex<FxHashSet<String>>,
    released: Condvar,
}

/// RAII guard that releases its key on drop.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it.
    pub fn acquire(&self, key: &str) -> KeyGuard<'_> {
        let mut held = self.held.lock().expect("key lock poisoned");
        while held.contains(key) {
            held = self.released.wait(held).expect("key lock poisoned");
        }
        held.insert(key.to_string());
        KeyGuard {
            locks: self,
            key: key.to_string(),
        }
    }

    /// Hold `key` only if nobody else does.
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard<'_>> {
        let mut held = self.held.lock().expect("key lock poisoned");
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard {
            locks: self,
            key: key.to_string(),
        })
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().expect("key lock poisoned");
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}

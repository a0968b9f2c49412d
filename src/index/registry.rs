//! Shared registry of served indexes.
//!
//! One reader/writer lock guards the name→handle map; each handle carries
//! its own lock (see `served`), so a long read on one index never blocks
//! mutation of another. Slots may temporarily hold no handle during a
//! rotation hand-off; `get` treats such slots as absent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::served::Served;

type Slot = Option<Arc<Served>>;

/// Registry errors surfaced to callers directly, bypassing dashboards.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("index '{0}' already exists")]
    Duplicate(String),

    #[error("index '{0}' not found")]
    NotFound(String),
}

/// Concurrent name→handle map.
#[derive(Default)]
pub struct IndexRegistry {
    map: RwLock<HashMap<String, Slot>>,
}

impl IndexRegistry {
    pub fn new() -> IndexRegistry {
        IndexRegistry::default()
    }

    /// Insert a brand-new entry; refuses to touch an existing key, even a
    /// null-slot one.
    pub fn add_unique(&self, name: &str, handle: Arc<Served>) -> Result<(), RegistryError> {
        let mut map = self.map.write();
        if map.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        map.insert(name.to_string(), Some(handle));
        Ok(())
    }

    /// Install `handle` under `name`, replacing whatever was there.
    /// Returns the prior slot value. The old reference is released only
    /// after the new one is installed, so a reader that just saw the key
    /// non-empty can never observe an empty slot.
    pub fn add_or_replace(&self, name: &str, handle: Slot) -> Slot {
        self.add_or_replace_with(name, handle, |_| {})
    }

    /// Same, running `hook` after the insert while the map lock is still
    /// held (rotation bookkeeping hangs off this).
    pub fn add_or_replace_with<F>(&self, name: &str, handle: Slot, hook: F) -> Slot
    where
        F: FnOnce(&str),
    {
        let old;
        {
            let mut map = self.map.write();
            old = map.insert(name.to_string(), handle);
            hook(name);
        }
        old.flatten()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.map.write().remove(name).is_some()
    }

    /// Remove the entry only when its slot holds no handle.
    pub fn delete_if_null(&self, name: &str) -> bool {
        let mut map = self.map.write();
        match map.get(name) {
            Some(None) => {
                map.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.read().contains_key(name)
    }

    /// Acquire a reference to the handle under `name`. Null slots read as
    /// absent.
    pub fn get(&self, name: &str) -> Option<Arc<Served>> {
        self.map.read().get(name).and_then(|slot| slot.clone())
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().len() == 0
    }

    /// Drop every entry. Handles die when their last acquired reference
    /// does.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Iterate under shared lock: the key set is fixed for the iterator's
    /// lifetime and deletion is impossible.
    pub fn read_iter(&self) -> ReadIter<'_> {
        let guard = self.map.read();
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        ReadIter {
            guard,
            keys,
            pos: 0,
        }
    }

    /// Iterate under exclusive lock; the current entry may be deleted in
    /// place.
    pub fn write_iter(&self) -> WriteIter<'_> {
        let guard = self.map.write();
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        WriteIter {
            guard,
            keys,
            pos: 0,
        }
    }
}

/// Read-locked registry cursor.
pub struct ReadIter<'a> {
    guard: RwLockReadGuard<'a, HashMap<String, Slot>>,
    keys: Vec<String>,
    pos: usize,
}

impl ReadIter<'_> {
    /// Next `(name, handle)` pair; null slots yield `(name, None)`.
    pub fn advance(&mut self) -> Option<(String, Slot)> {
        let key = self.keys.get(self.pos)?.clone();
        self.pos += 1;
        let slot = self.guard.get(&key).and_then(|s| s.clone());
        Some((key, slot))
    }
}

/// Write-locked registry cursor with in-place deletion.
pub struct WriteIter<'a> {
    guard: RwLockWriteGuard<'a, HashMap<String, Slot>>,
    keys: Vec<String>,
    pos: usize,
}

impl WriteIter<'_> {
    pub fn advance(&mut self) -> Option<(String, Slot)> {
        let key = self.keys.get(self.pos)?.clone();
        self.pos += 1;
        let slot = self.guard.get(&key).and_then(|s| s.clone());
        Some((key, slot))
    }

    /// Delete the entry the cursor last returned and rewind so the next
    /// `advance` visits its successor.
    pub fn delete_current(&mut self) {
        if self.pos == 0 {
            return;
        }
        let key = self.keys.remove(self.pos - 1);
        self.pos -= 1;
        self.guard.remove(&key);
    }
}

//! Concurrency-safe registry of running plugin clients, one per kind.
//!
//! Every mutation that retires an entry triggers its cleanup while still
//! holding the write lock, so a reader can never obtain a handle whose
//! cleanup has already been invoked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::key::PluginKey;
use crate::lifecycle::{Cleanup, ProcessExit};

/// A running plugin instance as held by the store.
#[derive(Debug)]
pub struct EnabledPlugin<T: ?Sized> {
    /// Typed RPC client.
    pub client: Arc<T>,
    /// Terminates the instance.
    pub cleanup: Cleanup,
    /// Resolves when the instance exits.
    pub exit: ProcessExit,
    /// Distinguishes successive instances under the same key.
    pub generation: u64,
}

impl<T: ?Sized> Clone for EnabledPlugin<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            cleanup: self.cleanup.clone(),
            exit: self.exit.clone(),
            generation: self.generation,
        }
    }
}

/// Map of plugin key to running instance.
#[derive(Debug)]
pub struct PluginStore<T: ?Sized> {
    entries: RwLock<HashMap<PluginKey, EnabledPlugin<T>>>,
    next_generation: AtomicU64,
}

impl<T: ?Sized> Default for PluginStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> PluginStore<T> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Insert a running instance and return its generation.
    ///
    /// An instance already stored under `key` is retired and its cleanup
    /// triggered.
    pub fn insert(
        &self,
        key: PluginKey,
        client: Arc<T>,
        cleanup: Cleanup,
        exit: ProcessExit,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = entries.insert(
            key,
            EnabledPlugin {
                client,
                cleanup,
                exit,
                generation,
            },
        ) {
            previous.cleanup.trigger();
        }
        generation
    }

    /// The client stored under `key`.
    #[must_use]
    pub fn get(&self, key: &PluginKey) -> Option<Arc<T>> {
        self.inspect(key, |entry| Arc::clone(&entry.client))
    }

    /// Run `f` against the entry under `key` while holding the read lock.
    pub fn inspect<R>(&self, key: &PluginKey, f: impl FnOnce(&EnabledPlugin<T>) -> R) -> Option<R> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(f)
    }

    /// The first entry whose key names the same plugin as `key`, ignoring versions.
    #[must_use]
    pub fn find_plugin(&self, key: &PluginKey) -> Option<(PluginKey, Arc<T>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<_> = entries
            .iter()
            .filter(|(k, _)| k.same_plugin(key))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(b.0));
        matches
            .first()
            .map(|(k, e)| ((*k).clone(), Arc::clone(&e.client)))
    }

    /// Current generation of the instance under `key`.
    #[must_use]
    pub fn generation(&self, key: &PluginKey) -> Option<u64> {
        self.inspect(key, |entry| entry.generation)
    }

    /// Remove the instance under `key`, triggering its cleanup.
    pub fn remove(&self, key: &PluginKey) -> Option<EnabledPlugin<T>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(key)?;
        removed.cleanup.trigger();
        debug!(plugin = %key, generation = removed.generation, "removed plugin from store");
        Some(removed)
    }

    /// Remove the instance under `key` only if it is still `generation`.
    ///
    /// Returns `None` when the key is absent or holds a newer instance, which
    /// makes handling a crash of a given instance at-most-once.
    pub fn remove_generation(&self, key: &PluginKey, generation: u64) -> Option<EnabledPlugin<T>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_none_or(|e| e.generation != generation) {
            return None;
        }
        let removed = entries.remove(key)?;
        removed.cleanup.trigger();
        debug!(plugin = %key, generation, "retired crashed plugin instance");
        Some(removed)
    }

    /// Remove every instance, triggering all cleanups.
    pub fn drain(&self) -> Vec<(PluginKey, EnabledPlugin<T>)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<_> = entries.drain().collect();
        for (_, entry) in &drained {
            entry.cleanup.trigger();
        }
        drained
    }

    /// Instances whose process exited without a cleanup request.
    #[must_use]
    pub fn exited_unexpectedly(&self) -> Vec<(PluginKey, u64)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|(_, e)| e.exit.try_get().is_some_and(|report| !report.requested))
            .map(|(k, e)| (k.clone(), e.generation))
            .collect()
    }

    /// All stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<PluginKey> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of stored instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

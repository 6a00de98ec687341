//! Restart bookkeeping per plugin, for status listings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::key::PluginKey;

/// User-facing plugin status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginStatus {
    /// Running, or being restarted below the threshold.
    Running,
    /// Stopped for good until the agent restarts.
    Deactivated,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("Running"),
            Self::Deactivated => f.write_str("Deactivated"),
        }
    }
}

/// Snapshot of one plugin's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// Derived status.
    pub status: PluginStatus,
    /// Restarts so far, capped at the threshold.
    pub restart_count: u32,
    /// Restarts after which the restart policy applies.
    pub threshold: u32,
    /// When the plugin last started, crashed or was deactivated.
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    restart_count: u32,
    deactivated: bool,
    last_transition: DateTime<Utc>,
}

/// Restart counters for every plugin that has been started.
#[derive(Debug)]
pub struct HealthStats {
    threshold: u32,
    entries: Mutex<HashMap<PluginKey, Entry>>,
}

impl HealthStats {
    /// Empty stats with the configured restart threshold.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The restart threshold.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Start tracking `key`. Existing counters are kept.
    pub fn register(&self, key: &PluginKey) {
        self.lock().entry(key.clone()).or_insert_with(|| Entry {
            restart_count: 0,
            deactivated: false,
            last_transition: Utc::now(),
        });
    }

    /// Count one restart of `key` and return the new count, capped at the
    /// threshold.
    pub fn increment(&self, key: &PluginKey) -> u32 {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            restart_count: 0,
            deactivated: false,
            last_transition: Utc::now(),
        });
        entry.restart_count = entry.restart_count.saturating_add(1).min(self.threshold);
        entry.last_transition = Utc::now();
        entry.restart_count
    }

    /// Mark `key` deactivated regardless of its restart count.
    pub fn mark_deactivated(&self, key: &PluginKey) {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            restart_count: 0,
            deactivated: false,
            last_transition: Utc::now(),
        });
        if !entry.deactivated {
            entry.deactivated = true;
            entry.last_transition = Utc::now();
        }
    }

    /// Health of one plugin.
    #[must_use]
    pub fn status(&self, key: &PluginKey) -> Option<HealthStatus> {
        self.lock().get(key).map(|e| self.snapshot(e))
    }

    /// Health of every tracked plugin.
    #[must_use]
    pub fn all(&self) -> BTreeMap<PluginKey, HealthStatus> {
        self.lock()
            .iter()
            .map(|(k, e)| (k.clone(), self.snapshot(e)))
            .collect()
    }

    fn snapshot(&self, entry: &Entry) -> HealthStatus {
        let status = if entry.deactivated || entry.restart_count >= self.threshold {
            PluginStatus::Deactivated
        } else {
            PluginStatus::Running
        };
        HealthStatus {
            status,
            restart_count: entry.restart_count,
            threshold: self.threshold,
            last_transition: entry.last_transition,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PluginKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

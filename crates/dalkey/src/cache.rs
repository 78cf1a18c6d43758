//! Persisted transpile-graph cache.
//!
//! The serialized record carries the engine version and a canonical
//! encoding of the dependency set; restore happens only when both match
//! the running engine, otherwise the cache is discarded without error.
//! The backing store is a browser-style key/value surface.

use dalkey_core::config::Configurations;
use dalkey_core::SerializedTranspiledModule;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Engine cache version. Bump when the serialized layout or the transpile
/// semantics change; stale caches are discarded on load.
pub const SCRIPT_VERSION: u32 = 4;

/// The single JSON record persisted per sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedSandbox {
    pub transpiled_modules: Vec<SerializedTranspiledModule>,
    pub cached_paths: FxHashMap<String, FxHashMap<String, String>>,
    pub version: u32,
    /// Milliseconds since the epoch at serialization time.
    pub timestamp: u64,
    pub configurations: Configurations,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entry: Option<String>,
    /// Directory → filenames known to exist in fetched packages.
    #[serde(default)]
    pub meta: FxHashMap<String, Vec<String>>,
    /// Canonical encoding of the top-level dependency set.
    pub dependencies_query: String,
}

impl SerializedSandbox {
    /// Whether this record may be restored into the running engine.
    #[must_use]
    pub fn is_loadable(&self, dependencies_query: &str) -> bool {
        self.version == SCRIPT_VERSION && self.dependencies_query == dependencies_query
    }
}

/// Milliseconds since the epoch, for cache timestamps.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Browser-style key/value store backing the persisted cache.
pub trait CacheStorage {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
    fn remove(&mut self, key: &str);
}

/// In-memory storage for tests and headless hosts.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    entries: FxHashMap<String, String>,
}

impl MemoryCacheStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

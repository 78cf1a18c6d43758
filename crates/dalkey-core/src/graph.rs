//! The transpiled-module graph.
//!
//! One transpiled module (TM) is one compiled variant of a source module
//! under a loader-query prefix: the unit of the compile graph. The graph is
//! cyclic, so edges are stored as hashes into a central registry that owns
//! every node; no TM ever holds another directly. Disposal detaches the
//! node from both reverse-edge sets of every neighbor before dropping it.

use crate::error::Error;
use crate::hmr::HmrConfig;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// Deterministic hash identifying a `(path, query)` variant.
#[must_use]
pub fn tm_hash(path: &str, query: &str) -> String {
    blake3::hash(format!("{query}!{path}").as_bytes()).to_hex().to_string()
}

/// Transpiled code plus its source map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranspiledSource {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_map: Option<serde_json::Value>,
}

impl TranspiledSource {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            source_map: None,
        }
    }
}

/// Cached result of evaluating a TM.
#[derive(Debug, Clone, PartialEq)]
pub struct Compilation {
    /// JSON snapshot of `module.exports` after evaluation.
    pub exports: serde_json::Value,
}

/// One node of the compile graph.
#[derive(Debug, Clone, Default)]
pub struct TranspiledModule {
    pub hash: String,
    pub path: String,
    pub query: String,

    /// `None` until transpiled or after invalidation.
    pub source: Option<TranspiledSource>,
    /// Emitted asset path → content.
    pub assets: FxHashMap<String, String>,
    /// Paths of modules emitted during this TM's transpilation.
    pub child_modules: Vec<String>,

    /// TMs required at runtime.
    pub dependencies: FxHashSet<String>,
    /// Request string → dependency hash, recorded as requests resolve.
    pub dependency_requests: FxHashMap<String, String>,
    /// TMs whose transpilation output was consumed at compile time.
    pub transpilation_dependencies: FxHashSet<String>,
    /// Reverse of `dependencies`.
    pub initiators: FxHashSet<String>,
    /// Reverse of `transpilation_dependencies`.
    pub transpilation_initiators: FxHashSet<String>,

    /// `None` when not yet evaluated or invalidated.
    pub compilation: Option<Compilation>,
    pub hmr_config: HmrConfig,

    pub errors: Vec<Error>,
    pub warnings: Vec<String>,

    pub is_entry: bool,
    pub is_test_file: bool,
    /// A dependency was unresolvable; retried after the manifest updates.
    pub has_missing_dependencies: bool,
    /// Loaders actually ran for this TM (as opposed to packager
    /// passthrough); feeds the serializer's skip rule.
    pub required_transpilation: bool,
}

impl TranspiledModule {
    fn new(path: &str, query: &str) -> Self {
        Self {
            hash: tm_hash(path, query),
            path: path.to_string(),
            query: query.to_string(),
            ..Self::default()
        }
    }

    /// Whether the next transpile pass must process this TM. Retained
    /// errors keep it true so failed modules retry.
    #[must_use]
    pub fn should_transpile(&self) -> bool {
        self.source.is_none() || !self.errors.is_empty() || self.has_missing_dependencies
    }

    /// Drop all transpilation state ahead of a retry.
    pub fn reset_transpilation(&mut self) {
        self.source = None;
        self.compilation = None;
        self.assets.clear();
        self.errors.clear();
        self.warnings.clear();
        self.has_missing_dependencies = false;
        self.required_transpilation = false;
    }
}

/// Serialized form of a TM for the persisted cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedTranspiledModule {
    pub hash: String,
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub query: String,
    pub source: Option<TranspiledSource>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty", default)]
    pub assets: FxHashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub child_modules: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty", default)]
    pub dependency_requests: FxHashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub transpilation_dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub initiators: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub transpilation_initiators: Vec<String>,
    pub hmr_config: HmrConfig,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub is_entry: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub is_test_file: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub required_transpilation: bool,
}

impl SerializedTranspiledModule {
    #[must_use]
    pub fn from_module(tm: &TranspiledModule) -> Self {
        let sorted = |set: &FxHashSet<String>| -> Vec<String> {
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort_unstable();
            v
        };
        Self {
            hash: tm.hash.clone(),
            path: tm.path.clone(),
            query: tm.query.clone(),
            source: tm.source.clone(),
            assets: tm.assets.clone(),
            child_modules: tm.child_modules.clone(),
            dependencies: sorted(&tm.dependencies),
            dependency_requests: tm.dependency_requests.clone(),
            transpilation_dependencies: sorted(&tm.transpilation_dependencies),
            initiators: sorted(&tm.initiators),
            transpilation_initiators: sorted(&tm.transpilation_initiators),
            hmr_config: tm.hmr_config.clone(),
            is_entry: tm.is_entry,
            is_test_file: tm.is_test_file,
            required_transpilation: tm.required_transpilation,
        }
    }
}

/// Hash-indexed registry owning every TM.
#[derive(Debug, Clone, Default)]
pub struct TmRegistry {
    tms: FxHashMap<String, TranspiledModule>,
    /// path → (query → hash).
    by_path: FxHashMap<String, FxHashMap<String, String>>,
}

impl TmRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or lazily create the `(path, query)` variant; returns its
    /// hash.
    pub fn get_or_create(&mut self, path: &str, query: &str) -> String {
        let hash = tm_hash(path, query);
        if !self.tms.contains_key(&hash) {
            self.tms.insert(hash.clone(), TranspiledModule::new(path, query));
            self.by_path
                .entry(path.to_string())
                .or_default()
                .insert(query.to_string(), hash.clone());
        }
        hash
    }

    #[must_use]
    pub fn get(&self, hash: &str) -> Option<&TranspiledModule> {
        self.tms.get(hash)
    }

    #[must_use]
    pub fn get_mut(&mut self, hash: &str) -> Option<&mut TranspiledModule> {
        self.tms.get_mut(hash)
    }

    #[must_use]
    pub fn lookup(&self, path: &str, query: &str) -> Option<&TranspiledModule> {
        self.tms.get(&tm_hash(path, query))
    }

    /// Hashes of every variant of a path.
    #[must_use]
    pub fn variant_hashes(&self, path: &str) -> Vec<String> {
        self.by_path
            .get(path)
            .map(|variants| variants.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TranspiledModule)> {
        self.tms.iter()
    }

    #[must_use]
    pub fn hashes(&self) -> Vec<String> {
        self.tms.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tms.is_empty()
    }

    /// Record a runtime dependency edge, updating both directions.
    pub fn add_dependency(&mut self, from: &str, to: &str, request: &str) {
        if let Some(tm) = self.tms.get_mut(from) {
            tm.dependencies.insert(to.to_string());
            tm.dependency_requests
                .insert(request.to_string(), to.to_string());
        }
        if let Some(tm) = self.tms.get_mut(to) {
            tm.initiators.insert(from.to_string());
        }
    }

    /// Record a compile-time dependency edge, updating both directions.
    pub fn add_transpilation_dependency(&mut self, from: &str, to: &str) {
        if let Some(tm) = self.tms.get_mut(from) {
            tm.transpilation_dependencies.insert(to.to_string());
        }
        if let Some(tm) = self.tms.get_mut(to) {
            tm.transpilation_initiators.insert(from.to_string());
        }
    }

    /// Drop a TM's outgoing edges ahead of retranspilation, detaching it
    /// from the reverse sets of its former dependencies.
    pub fn clear_dependencies(&mut self, hash: &str) {
        let (deps, tdeps) = match self.tms.get_mut(hash) {
            Some(tm) => (
                std::mem::take(&mut tm.dependencies),
                std::mem::take(&mut tm.transpilation_dependencies),
            ),
            None => return,
        };
        if let Some(tm) = self.tms.get_mut(hash) {
            tm.dependency_requests.clear();
            tm.child_modules.clear();
        }
        for dep in deps {
            if let Some(tm) = self.tms.get_mut(&dep) {
                tm.initiators.remove(hash);
            }
        }
        for dep in tdeps {
            if let Some(tm) = self.tms.get_mut(&dep) {
                tm.transpilation_initiators.remove(hash);
            }
        }
    }

    /// Dispose a TM: detach it from every neighbor's edge sets and remove
    /// it from the registry. Returns the node for final bookkeeping
    /// (child-module cleanup).
    pub fn dispose(&mut self, hash: &str) -> Option<TranspiledModule> {
        let tm = self.tms.remove(hash)?;

        for neighbor in tm.initiators.iter().chain(&tm.dependencies) {
            if let Some(other) = self.tms.get_mut(neighbor) {
                other.dependencies.remove(hash);
                other.initiators.remove(hash);
                other.dependency_requests.retain(|_, target| target.as_str() != hash);
            }
        }
        for neighbor in tm
            .transpilation_initiators
            .iter()
            .chain(&tm.transpilation_dependencies)
        {
            if let Some(other) = self.tms.get_mut(neighbor) {
                other.transpilation_dependencies.remove(hash);
                other.transpilation_initiators.remove(hash);
            }
        }

        if let Some(variants) = self.by_path.get_mut(&tm.path) {
            variants.retain(|_, h| h != hash);
            if variants.is_empty() {
                self.by_path.remove(&tm.path);
            }
        }
        Some(tm)
    }

    /// Dispose every variant of a path. Returns the disposed nodes.
    pub fn dispose_variants(&mut self, path: &str) -> Vec<TranspiledModule> {
        self.variant_hashes(path)
            .iter()
            .filter_map(|hash| self.dispose(hash))
            .collect()
    }

    /// Propagate a source-module update: every variant of the path loses
    /// its transpiled source and compilation and turns dirty; the
    /// invalidation runs transitively along transpilation-initiator edges
    /// (those consumers must retranspile) while plain initiators lose only
    /// their cached compilation. Returns the hashes that must retranspile.
    pub fn mark_module_updated(&mut self, path: &str) -> Vec<String> {
        let mut to_retranspile = Vec::new();
        let mut visited: FxHashSet<String> = FxHashSet::default();
        let mut queue: Vec<String> = self.variant_hashes(path);

        while let Some(hash) = queue.pop() {
            if !visited.insert(hash.clone()) {
                continue;
            }
            let Some(tm) = self.tms.get_mut(&hash) else { continue };
            tm.source = None;
            tm.compilation = None;
            tm.hmr_config.set_dirty();
            to_retranspile.push(hash.clone());

            let transpilation_initiators: Vec<String> =
                tm.transpilation_initiators.iter().cloned().collect();
            let initiators: Vec<String> = tm.initiators.iter().cloned().collect();

            queue.extend(transpilation_initiators);
            self.invalidate_compilations(&initiators);
        }

        to_retranspile
    }

    /// Invalidate cached compilations transitively up the initiator chain.
    fn invalidate_compilations(&mut self, start: &[String]) {
        let mut visited: FxHashSet<String> = FxHashSet::default();
        let mut queue: Vec<String> = start.to_vec();
        while let Some(hash) = queue.pop() {
            if !visited.insert(hash.clone()) {
                continue;
            }
            let Some(tm) = self.tms.get_mut(&hash) else { continue };
            if tm.compilation.is_none() {
                continue;
            }
            tm.compilation = None;
            queue.extend(tm.initiators.iter().cloned());
        }
    }

    /// Reset every TM's transpile and evaluation state (configuration
    /// changes can affect every transpiler).
    pub fn reset_all(&mut self) {
        for tm in self.tms.values_mut() {
            tm.reset_transpilation();
        }
    }

    pub fn clear(&mut self) {
        self.tms.clear();
        self.by_path.clear();
    }

    /// Restore phase one: instantiate a TM from its serialized form so the
    /// hash exists. Edges reconnect in phase two.
    pub fn restore_node(&mut self, serialized: &SerializedTranspiledModule) {
        let mut tm = TranspiledModule::new(&serialized.path, &serialized.query);
        tm.source = serialized.source.clone();
        tm.assets = serialized.assets.clone();
        tm.child_modules = serialized.child_modules.clone();
        tm.hmr_config = serialized.hmr_config.clone();
        tm.is_entry = serialized.is_entry;
        tm.is_test_file = serialized.is_test_file;
        tm.required_transpilation = serialized.required_transpilation;

        self.by_path
            .entry(tm.path.clone())
            .or_default()
            .insert(tm.query.clone(), tm.hash.clone());
        self.tms.insert(tm.hash.clone(), tm);
    }

    /// Restore phase two: reconnect one TM's edges by hash. Returns false
    /// when a referenced hash is missing, in which case the caller aborts
    /// the restore of that TM.
    pub fn restore_edges(&mut self, serialized: &SerializedTranspiledModule) -> bool {
        let all_present = serialized
            .dependencies
            .iter()
            .chain(&serialized.transpilation_dependencies)
            .chain(&serialized.initiators)
            .chain(&serialized.transpilation_initiators)
            .all(|hash| self.tms.contains_key(hash));
        if !all_present {
            return false;
        }

        for (request, dep) in &serialized.dependency_requests {
            self.add_dependency(&serialized.hash, dep, request);
        }
        for dep in &serialized.dependencies {
            if let Some(tm) = self.tms.get_mut(&serialized.hash) {
                tm.dependencies.insert(dep.clone());
            }
            if let Some(tm) = self.tms.get_mut(dep) {
                tm.initiators.insert(serialized.hash.clone());
            }
        }
        for dep in &serialized.transpilation_dependencies {
            self.add_transpilation_dependency(&serialized.hash, dep);
        }
        true
    }
}

//! The sandbox manager.
//!
//! Owns the module store, the transpiled-module registry, the resolver
//! and its cache, and the evaluation runtime, and drives the two stages:
//! transpilation (suspension-capable: bridge lookups and dependency
//! fetches may happen here) and evaluation (strictly synchronous). All
//! state mutates on the caller's thread through this type.

use crate::bridge::FileResolver;
use crate::cache::{now_ms, CacheStorage, SerializedSandbox, SCRIPT_VERSION};
use crate::fetcher::DependencyFetcher;
use dalkey_core::config::{parse_env, Configurations};
use dalkey_core::graph::SerializedTranspiledModule;
use dalkey_core::path::{dirname, has_extension_of, node_modules_package, normalize, split_query};
use dalkey_core::{
    tm_hash, CombinedMetas, Compilation, Error, HmrStatus, HmrStatusBroadcast, LoaderContext,
    Manifest, Module, ModuleStore, Preset, Resolver, ResolverHost, Result, TmRegistry,
    TranspiledModule, TranspiledSource,
};
use dalkey_runtime::{DefinedModule, EvalRuntime, HmrEvent, RequireDelegate};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Engine stage. Transpilation may suspend on host I/O; evaluation never
/// does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Transpilation,
    Evaluation,
}

/// Construction options.
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// The host exposes a file-resolver bridge (installed via
    /// [`Manager::set_file_resolver`]).
    pub has_file_resolver: bool,
}

/// Options for [`Manager::evaluate_module`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluateOptions {
    /// Re-evaluate even when a cached compilation exists.
    pub force: bool,
    /// Evaluate with test globals (`NODE_ENV=test`).
    pub test_globals: bool,
}

/// Options for [`Manager::serialize`].
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    pub entry_path: Option<String>,
    /// Drop source maps from the persisted record.
    pub optimize_for_size: bool,
}

/// Mutable engine state, shared with the runtime's require delegate.
pub(crate) struct EngineState {
    pub store: ModuleStore,
    pub registry: TmRegistry,
    pub resolver: Resolver,
    pub manifest: Manifest,
    pub metas: CombinedMetas,
    pub configurations: Configurations,
    pub module_directories: Vec<String>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            store: ModuleStore::new(),
            registry: TmRegistry::new(),
            resolver: Resolver::new(),
            manifest: Manifest::default(),
            metas: CombinedMetas::new(),
            configurations: Configurations::default(),
            module_directories: Vec::new(),
        }
    }

    /// Resolve through the resolver with the engine's current snapshot.
    fn resolve(&mut self, preset: &dyn Preset, request: &str, from: &str) -> Result<String> {
        let extensions = preset.resolvable_extensions();
        let EngineState {
            store,
            resolver,
            manifest,
            metas,
            module_directories,
            ..
        } = self;
        let host = ResolverHost {
            store,
            metas,
            manifest,
            preset,
            module_directories,
        };
        resolver.resolve(&host, request, from, &extensions)
    }
}

/// Require fallback used during evaluation: resolves through the engine's
/// in-memory state only, and hands back already-transpiled output.
struct GraphDelegate {
    state: Rc<RefCell<EngineState>>,
    preset: Rc<dyn Preset>,
}

impl RequireDelegate for GraphDelegate {
    fn resolve_require(&self, from_hash: &str, request: &str) -> std::result::Result<DefinedModule, String> {
        let mut state = self.state.borrow_mut();

        let from_path = state
            .registry
            .get(from_hash)
            .map(|tm| tm.path.clone())
            .ok_or_else(|| format!("unknown module '{from_hash}'"))?;

        let (query, bare) = split_query(request);
        let query = query.to_string();
        let bare = bare.to_string();
        let resolved = state
            .resolve(self.preset.as_ref(), &bare, &from_path)
            .map_err(|e| e.to_string())?;

        let target = state.registry.get_or_create(&resolved, &query);
        state.registry.add_dependency(from_hash, &target, request);

        let tm = state
            .registry
            .get(&target)
            .ok_or_else(|| format!("unknown module '{target}'"))?;
        let source = tm
            .source
            .as_ref()
            .ok_or_else(|| format!("module '{resolved}' is not transpiled"))?;

        Ok(DefinedModule {
            hash: tm.hash.clone(),
            dirname: dirname(&tm.path).to_string(),
            filename: tm.path.clone(),
            require_map: tm
                .dependency_requests
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            code: source.code.clone(),
        })
    }
}

/// The orchestrator.
pub struct Manager {
    id: String,
    preset: Rc<dyn Preset>,
    state: Rc<RefCell<EngineState>>,
    runtime: EvalRuntime,
    hmr: HmrStatusBroadcast,
    stage: Stage,

    file_resolver: Option<Rc<dyn FileResolver>>,
    fetcher: Option<Rc<dyn DependencyFetcher>>,
    cache_storage: Option<Box<dyn CacheStorage>>,
    has_file_resolver: bool,

    /// Environment variables handed to transpilers and evaluation.
    env: FxHashMap<String, String>,
    /// Hashes whose factory in the runtime matches their current source.
    defined: FxHashSet<String>,
    /// Dedup set for the current transpile pass: a TM already enqueued is
    /// never transpiled twice in parallel.
    transpile_jobs: FxHashSet<String>,
    /// The env/globals generation injected into the runtime.
    globals: Option<bool>,
    pending_hard_reload: bool,
    hard_reloads: u32,
}

impl Manager {
    /// Construct a manager around an initial module set. `cb` fires once
    /// the virtual FS backend is populated.
    pub fn new(
        id: impl Into<String>,
        preset: Rc<dyn Preset>,
        modules: Vec<Module>,
        options: &ManagerOptions,
        cb: Option<Box<dyn FnOnce(&mut Manager)>>,
    ) -> Result<Self> {
        let runtime = EvalRuntime::new().map_err(|e| Error::other(e.to_string()))?;

        let mut state = EngineState::new();
        for module in modules {
            state.store.add(module);
        }

        let state = Rc::new(RefCell::new(state));
        let mut manager = Self {
            id: id.into(),
            preset: Rc::clone(&preset),
            state: Rc::clone(&state),
            runtime,
            hmr: HmrStatusBroadcast::new(),
            stage: Stage::default(),
            file_resolver: None,
            fetcher: None,
            cache_storage: None,
            has_file_resolver: options.has_file_resolver,
            env: FxHashMap::default(),
            defined: FxHashSet::default(),
            transpile_jobs: FxHashSet::default(),
            globals: None,
            pending_hard_reload: false,
            hard_reloads: 0,
        };
        manager
            .runtime
            .set_delegate(Some(Rc::new(GraphDelegate { state, preset })));
        manager.refresh_env();

        if let Some(cb) = cb {
            cb(&mut manager);
        }
        Ok(manager)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn hmr_status(&self) -> HmrStatus {
        self.hmr.status()
    }

    /// Register an HMR status listener; returns a removal token.
    pub fn add_hmr_listener(&mut self, listener: Box<dyn Fn(HmrStatus)>) -> usize {
        self.hmr.add_listener(listener)
    }

    pub fn remove_hmr_listener(&mut self, id: usize) {
        self.hmr.remove_listener(id)
    }

    /// Number of hard reloads performed (page reloads in a browser host).
    #[must_use]
    pub fn hard_reload_count(&self) -> u32 {
        self.hard_reloads
    }

    #[must_use]
    pub fn has_file_resolver(&self) -> bool {
        self.has_file_resolver
    }

    pub fn set_file_resolver(&mut self, resolver: Rc<dyn FileResolver>) {
        self.has_file_resolver = true;
        self.file_resolver = Some(resolver);
    }

    pub fn set_dependency_fetcher(&mut self, fetcher: Rc<dyn DependencyFetcher>) {
        self.fetcher = Some(fetcher);
    }

    pub fn set_cache_storage(&mut self, storage: Box<dyn CacheStorage>) {
        self.cache_storage = Some(storage);
    }

    /// Absorb the packager manifest: contents enter the store as
    /// precomputed modules, and every module that previously failed on a
    /// missing dependency is reset for retry.
    pub fn set_manifest(&mut self, manifest: Manifest) {
        let mut state = self.state.borrow_mut();
        for (path, content) in &manifest.contents {
            state.store.add(Module::precomputed(
                path.clone(),
                content.content.clone(),
                content.requires.clone(),
            ));
        }
        state.manifest = manifest;
        state.resolver.clear_cache();

        for hash in state.registry.hashes() {
            let missing = state
                .registry
                .get(&hash)
                .is_some_and(|tm| tm.has_missing_dependencies);
            if missing {
                if let Some(tm) = state.registry.get_mut(&hash) {
                    tm.reset_transpilation();
                }
                self.defined.remove(&hash);
            }
        }
    }

    /// Record file paths known to exist inside fetched packages.
    pub fn set_combined_metas(&mut self, paths: Vec<String>) {
        let mut state = self.state.borrow_mut();
        state.metas.extend(paths);
        state.resolver.clear_cache();
    }

    /// Replace the configuration bundle. Any change resets every TM's
    /// transpile and evaluation state. Returns whether anything changed.
    pub fn update_configurations(&mut self, configurations: Configurations) -> Result<bool> {
        let changed = {
            let state = self.state.borrow();
            state.configurations != configurations
        };
        if !changed {
            return Ok(false);
        }

        debug!("configuration changed, resetting transpilation state");
        {
            let mut state = self.state.borrow_mut();
            state.configurations = configurations;
            state.registry.reset_all();
            state.resolver.clear_cache();
        }
        self.refresh_env();
        {
            let mut state = self.state.borrow_mut();
            let node_path = self.env.get("NODE_PATH").cloned();
            let directories = state
                .configurations
                .module_directories(node_path.as_deref());
            state.module_directories = directories;
        }
        self.defined.clear();
        self.globals = None;
        self.runtime
            .reset()
            .map_err(|e| Error::other(e.to_string()))?;
        Ok(true)
    }

    /// Module directories beyond `node_modules` currently in effect.
    #[must_use]
    pub fn module_directories(&self) -> Vec<String> {
        self.state.borrow().module_directories.clone()
    }

    /// Environment variables visible to transpilers and evaluated code.
    #[must_use]
    pub fn env_variables(&self) -> FxHashMap<String, String> {
        self.env.clone()
    }

    fn refresh_env(&mut self) {
        if !self.preset.has_dot_env() {
            return;
        }
        let env = {
            let state = self.state.borrow();
            state.store.code("/.env").map(parse_env)
        };
        if let Some(env) = env {
            self.env = env;
        }
    }

    /// Synchronous resolution against the in-memory store only.
    pub fn resolve(&mut self, request: &str, from: &str) -> Result<String> {
        let preset = Rc::clone(&self.preset);
        self.state
            .borrow_mut()
            .resolve(preset.as_ref(), request, from)
    }

    /// Resolution with host fallbacks: a failed lookup may consult the
    /// file-resolver bridge or trigger a dependency download, then retry.
    /// For identical inputs with no fetch needed this agrees with
    /// [`Manager::resolve`].
    pub fn resolve_fetching(&mut self, request: &str, from: &str) -> Result<String> {
        let err = match self.resolve(request, from) {
            Ok(path) => return Ok(path),
            Err(err) => err,
        };

        let missing_dependency_name = match &err {
            Error::DependencyNotFound { name, .. } => Some(name.clone()),
            Error::ModuleNotFound {
                path,
                is_dependency: true,
                ..
            } => {
                if path.starts_with('.') || path.starts_with('/') {
                    node_modules_package(path).map(String::from)
                } else {
                    Some(dalkey_core::path::package_name(path).to_string())
                }
            }
            Error::ModuleNotFound { .. } => None,
            _ => return Err(err),
        };

        if let (Some(name), true) = (&missing_dependency_name, self.fetcher.is_some()) {
            let name = name.clone();
            self.download_dependency(&name)?;
            return self.resolve(request, from);
        }

        match &err {
            Error::ModuleNotFound { tried, .. } if self.file_resolver.is_some() => {
                let resolver = self
                    .file_resolver
                    .clone()
                    .ok_or_else(|| err.clone())?;
                let mut fetched_any = false;
                for candidate in tried.clone() {
                    let found = resolver.is_file(&candidate).unwrap_or(false);
                    if !found {
                        continue;
                    }
                    if let Ok(Some(content)) = resolver.read_file(&candidate) {
                        debug!(path = %candidate, "fetched file over the bridge");
                        self.state
                            .borrow_mut()
                            .store
                            .add(Module::new(candidate, content));
                        fetched_any = true;
                    }
                }
                if fetched_any {
                    self.resolve(request, from)
                } else {
                    Err(err)
                }
            }
            _ => Err(err),
        }
    }

    /// Fetch a package through the host fetcher and absorb its files.
    pub fn download_dependency(&mut self, name: &str) -> Result<()> {
        let fetcher = self
            .fetcher
            .clone()
            .ok_or_else(|| Error::other(format!("no fetcher configured for '{name}'")))?;
        let version = self
            .state
            .borrow()
            .manifest
            .dependency_version(name)
            .unwrap_or_else(|| "latest".to_string());

        debug!(name = %name, version = %version, "downloading dependency");
        let fetched = fetcher
            .fetch(name, &version)
            .map_err(|e| Error::other(e.to_string()))?;

        let mut state = self.state.borrow_mut();
        for module in fetched.modules {
            state.store.add(Module {
                downloaded: true,
                ..module
            });
        }
        state.metas.extend(fetched.metas);
        state.resolver.clear_cache();
        Ok(())
    }

    /// Read a file's content synchronously: the store, then the bridge,
    /// then a package fetch for meta-known files. `ENOENT` otherwise.
    pub fn read_file_sync(&mut self, path: &str) -> Result<String> {
        if let Some(code) = self.state.borrow().store.code(path) {
            return Ok(code.to_string());
        }

        if let Some(resolver) = self.file_resolver.clone() {
            if let Ok(Some(content)) = resolver.read_file(path) {
                self.state
                    .borrow_mut()
                    .store
                    .add(Module::new(path, content.clone()));
                return Ok(content);
            }
        }

        let meta_known = self.state.borrow().metas.contains(path);
        if meta_known && self.fetcher.is_some() {
            if let Some(name) = node_modules_package(path).map(String::from) {
                self.download_dependency(&name)?;
                if let Some(code) = self.state.borrow().store.code(path) {
                    return Ok(code.to_string());
                }
            }
        }

        Err(Error::enoent(path))
    }

    /// Transpile the entry and its transitive dependencies. Returns the
    /// hashes that were (re)transpiled.
    pub fn transpile_modules(&mut self, entry_path: &str, is_test_file: bool) -> Result<Vec<String>> {
        self.stage = Stage::Transpilation;
        self.hmr.set(HmrStatus::Check);
        self.transpile_jobs.clear();

        let entry = normalize(entry_path);
        self.read_file_sync(&entry)?;

        let entry_hash = {
            let mut state = self.state.borrow_mut();
            let hash = state.registry.get_or_create(&entry, "");
            if let Some(tm) = state.registry.get_mut(&hash) {
                tm.is_entry = true;
                tm.is_test_file = is_test_file;
            }
            hash
        };

        self.transpile_worklist(vec![entry_hash], true)
    }

    /// Drive the transpile worklist. `stop_on_error` propagates the first
    /// failure; otherwise failures stay attached to their TMs.
    fn transpile_worklist(&mut self, seed: Vec<String>, stop_on_error: bool) -> Result<Vec<String>> {
        let mut transpiled = Vec::new();
        let mut queue = seed;

        while let Some(hash) = queue.pop() {
            if !self.transpile_jobs.insert(hash.clone()) {
                continue;
            }
            match self.ensure_transpiled(&hash) {
                Ok(true) => transpiled.push(hash.clone()),
                Ok(false) => {}
                Err(err) if stop_on_error => return Err(err),
                Err(err) => warn!(error = %err, "module failed to retranspile"),
            }

            let state = self.state.borrow();
            if let Some(tm) = state.registry.get(&hash) {
                queue.extend(tm.dependencies.iter().cloned());
                queue.extend(tm.transpilation_dependencies.iter().cloned());
            }
        }

        Ok(transpiled)
    }

    /// Run the loader pipeline for one TM when it needs it. Returns
    /// whether a transpilation happened.
    fn ensure_transpiled(&mut self, hash: &str) -> Result<bool> {
        let (path, query, needed) = {
            let state = self.state.borrow();
            match state.registry.get(hash) {
                Some(tm) => (tm.path.clone(), tm.query.clone(), tm.should_transpile()),
                None => return Ok(false),
            }
        };
        if !needed {
            return Ok(false);
        }

        self.defined.remove(hash);
        self.read_file_sync(&path)?;
        let module = self
            .state
            .borrow()
            .store
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::enoent(&path))?;

        {
            let mut state = self.state.borrow_mut();
            state.registry.clear_dependencies(hash);
            if let Some(tm) = state.registry.get_mut(hash) {
                tm.reset_transpilation();
            }
        }

        let ignored = has_extension_of(&path, self.preset.ignored_extensions());
        let loaders = if ignored {
            Vec::new()
        } else {
            self.preset.get_loaders(&module, &query)
        };

        let mut code = module.code.clone();
        let mut source_map = None;
        let mut requests: Vec<String> = Vec::new();
        let mut transpilation_requests: Vec<String> = Vec::new();

        if ignored {
            // Raw assets evaluate to their stringified content.
            code = format!(
                "module.exports = {};",
                serde_json::to_string(&module.code).map_err(|e| Error::other(e.to_string()))?
            );
        }

        for entry in &loaders {
            let staged = {
                let state = self.state.borrow();
                let mut ctx =
                    LoaderContext::new(&path, &query, &entry.options, &self.env, &state.store);
                let output = entry.transpiler.transpile(&code, &mut ctx);
                (output, ctx.into_effects())
            };
            let (output, (emitted, deps, tdeps, assets, warnings)) = staged;

            let output = output.map_err(|e| {
                let error = Error::Transpile {
                    module_hash: hash.to_string(),
                    path: path.clone(),
                    transpiler: entry.transpiler.name().to_string(),
                    message: e.message,
                };
                let mut state = self.state.borrow_mut();
                if let Some(tm) = state.registry.get_mut(hash) {
                    tm.errors.push(error.clone());
                }
                error
            })?;

            code = output.code;
            if output.source_map.is_some() {
                source_map = output.source_map;
            }

            {
                let mut state = self.state.borrow_mut();
                for child in emitted {
                    let child_path = normalize(&child.path);
                    state
                        .store
                        .add(Module::child_of(hash, child_path.clone(), child.code));
                    let child_hash = state.registry.get_or_create(&child_path, &child.query);
                    state.registry.add_dependency(hash, &child_hash, &child_path);
                    if let Some(tm) = state.registry.get_mut(hash) {
                        tm.child_modules.push(child_path);
                    }
                }
                if let Some(tm) = state.registry.get_mut(hash) {
                    tm.assets.extend(assets);
                    tm.warnings.extend(warnings);
                }
            }
            requests.extend(deps);
            transpilation_requests.extend(tdeps);
        }

        // Requests: the packager's pre-scan wins; otherwise scan the final
        // code. Loader-declared dependencies always count.
        if let Some(pre) = &module.requires {
            requests.extend(pre.iter().cloned());
        } else if !ignored {
            requests.extend(dalkey_core::scan::scan_requests(&code));
        }

        for request in dedup(requests) {
            self.register_dependency(hash, &path, &request, false)?;
        }
        for request in dedup(transpilation_requests) {
            self.register_dependency(hash, &path, &request, true)?;
        }

        let mut state = self.state.borrow_mut();
        if let Some(tm) = state.registry.get_mut(hash) {
            tm.source = Some(TranspiledSource { code, source_map });
            tm.required_transpilation = ignored || !loaders.is_empty();
        }
        Ok(true)
    }

    /// Resolve a declared request and record the graph edge.
    fn register_dependency(
        &mut self,
        from_hash: &str,
        from_path: &str,
        request: &str,
        transpilation: bool,
    ) -> Result<()> {
        let (query, bare) = split_query(request);
        let resolved = match self.resolve_fetching(bare, from_path) {
            Ok(resolved) => resolved,
            Err(err) => {
                let mut state = self.state.borrow_mut();
                if let Some(tm) = state.registry.get_mut(from_hash) {
                    if err.is_missing_dependency() {
                        tm.has_missing_dependencies = true;
                    }
                    tm.errors.push(err.clone());
                }
                return Err(err);
            }
        };

        // Content must be local before evaluation; fetch it now while
        // suspension is still allowed.
        if !self.state.borrow().store.contains(&resolved) {
            self.read_file_sync(&resolved)?;
        }

        let mut state = self.state.borrow_mut();
        let target = state.registry.get_or_create(&resolved, query);
        if transpilation {
            state.registry.add_transpilation_dependency(from_hash, &target);
        } else {
            state.registry.add_dependency(from_hash, &target, request);
        }
        Ok(())
    }

    /// Evaluate the entry module and return its exports snapshot.
    pub fn evaluate_module(
        &mut self,
        entry_path: &str,
        options: &EvaluateOptions,
    ) -> Result<serde_json::Value> {
        self.stage = Stage::Evaluation;

        if self.pending_hard_reload {
            self.perform_hard_reload()?;
        }

        let entry = normalize(entry_path);
        let entry_hash = tm_hash(&entry, "");
        {
            let state = self.state.borrow();
            let tm = state.registry.get(&entry_hash).ok_or_else(|| {
                Error::module_not_found(entry.clone(), "/", false, Vec::new())
            })?;
            if tm.source.is_none() {
                return Err(Error::other(format!("module '{entry}' is not transpiled")));
            }
        }

        if options.force {
            let mut state = self.state.borrow_mut();
            if let Some(tm) = state.registry.get_mut(&entry_hash) {
                tm.compilation = None;
            }
        }

        let webpack_hmr = self.state.borrow().configurations.sandbox.enable_webpack_hmr;
        let dirty: Vec<String> = {
            let state = self.state.borrow();
            state
                .registry
                .iter()
                .filter(|(_, tm)| tm.hmr_config.is_dirty())
                .map(|(hash, _)| hash.clone())
                .collect()
        };

        // Fast path: nothing dirty and a cached compilation.
        if !options.force && dirty.is_empty() {
            let state = self.state.borrow();
            if let Some(compilation) = state
                .registry
                .get(&entry_hash)
                .and_then(|tm| tm.compilation.as_ref())
            {
                return Ok(compilation.exports.clone());
            }
        }

        self.inject_globals(options.test_globals)?;

        if !dirty.is_empty() && !webpack_hmr {
            let needs_reload = {
                let state = self.state.borrow();
                dirty.iter().any(|hash| {
                    state
                        .registry
                        .get(hash)
                        .is_some_and(|tm| tm.hmr_config.requires_hard_reload())
                })
            };
            if needs_reload {
                self.perform_hard_reload()?;
                self.inject_globals(options.test_globals)?;
            } else {
                self.hmr.set(HmrStatus::Apply);
                for hash in &dirty {
                    self.hot_swap(hash)?;
                }
            }
        }

        self.define_closure(&entry_hash)?;
        self.invalidate_stale(&entry_hash)?;

        let eval_result = self.runtime.evaluate(&entry_hash);
        self.apply_hmr_events();

        if let Err(err) = eval_result {
            let error = Error::Evaluation {
                module_hash: entry_hash.clone(),
                path: entry,
                message: err.to_string(),
            };
            {
                let mut state = self.state.borrow_mut();
                if let Some(tm) = state.registry.get_mut(&entry_hash) {
                    tm.errors.push(error.clone());
                }
            }
            self.hmr.set(HmrStatus::Fail);
            if self.state.borrow().configurations.sandbox.hard_reload_on_change {
                self.pending_hard_reload = true;
            }
            return Err(error);
        }

        let exports = self.record_compilations(&entry_hash)?;

        // Post-evaluate: settle HMR states.
        {
            let mut state = self.state.borrow_mut();
            for hash in state.registry.hashes() {
                if let Some(tm) = state.registry.get_mut(&hash) {
                    tm.hmr_config.settle();
                }
            }
        }
        self.hmr.set(HmrStatus::Idle);
        Ok(exports)
    }

    /// Re-evaluate one dirty module in place: dispose, re-define with the
    /// fresh source, run, and fire accept callbacks of its initiators.
    fn hot_swap(&mut self, hash: &str) -> Result<()> {
        let has_dispose = self
            .state
            .borrow()
            .registry
            .get(hash)
            .is_some_and(|tm| tm.hmr_config.has_dispose_handler);
        if has_dispose {
            self.hmr.set(HmrStatus::Dispose);
        }
        self.runtime
            .invalidate(hash)
            .map_err(|e| Error::other(e.to_string()))?;
        if has_dispose {
            self.hmr.set(HmrStatus::Apply);
        }

        self.define_closure(hash)?;
        if let Err(err) = self.runtime.evaluate(hash) {
            let path = self
                .state
                .borrow()
                .registry
                .get(hash)
                .map(|tm| tm.path.clone())
                .unwrap_or_default();
            let error = Error::Evaluation {
                module_hash: hash.to_string(),
                path,
                message: err.to_string(),
            };
            let mut state = self.state.borrow_mut();
            if let Some(tm) = state.registry.get_mut(hash) {
                tm.errors.push(error.clone());
            }
            drop(state);
            self.hmr.set(HmrStatus::Fail);
            return Err(error);
        }
        self.apply_hmr_events();

        if let Ok(Some(exports)) = self.runtime.exports_snapshot(hash) {
            let mut state = self.state.borrow_mut();
            if let Some(tm) = state.registry.get_mut(hash) {
                tm.compilation = Some(Compilation { exports });
            }
        }

        let initiators: Vec<String> = self
            .state
            .borrow()
            .registry
            .get(hash)
            .map(|tm| tm.initiators.iter().cloned().collect())
            .unwrap_or_default();
        for parent in initiators {
            self.runtime
                .notify_accept(&parent, hash)
                .map_err(|e| Error::other(e.to_string()))?;
        }
        self.apply_hmr_events();
        Ok(())
    }

    /// Define factories for every reachable TM whose runtime definition is
    /// stale or missing.
    fn define_closure(&mut self, start: &str) -> Result<()> {
        let mut to_define = Vec::new();
        {
            let state = self.state.borrow();
            let mut visited: FxHashSet<String> = FxHashSet::default();
            let mut queue = vec![start.to_string()];
            while let Some(hash) = queue.pop() {
                if !visited.insert(hash.clone()) {
                    continue;
                }
                let Some(tm) = state.registry.get(&hash) else {
                    continue;
                };
                queue.extend(tm.dependencies.iter().cloned());
                if self.defined.contains(&hash) {
                    continue;
                }
                let Some(source) = &tm.source else {
                    return Err(Error::other(format!(
                        "module '{}' is not transpiled",
                        tm.path
                    )));
                };
                to_define.push(DefinedModule {
                    hash: hash.clone(),
                    dirname: dirname(&tm.path).to_string(),
                    filename: tm.path.clone(),
                    require_map: tm
                        .dependency_requests
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<BTreeMap<_, _>>(),
                    code: source.code.clone(),
                });
            }
        }

        if to_define.is_empty() {
            return Ok(());
        }
        self.runtime
            .define_modules(&to_define)
            .map_err(|e| Error::other(e.to_string()))?;
        for module in &to_define {
            self.defined.insert(module.hash.clone());
        }
        Ok(())
    }

    /// Drop runtime instances of reachable TMs whose compilation was
    /// invalidated, so their factories re-run.
    fn invalidate_stale(&mut self, start: &str) -> Result<()> {
        let stale: Vec<String> = {
            let state = self.state.borrow();
            let mut visited: FxHashSet<String> = FxHashSet::default();
            let mut queue = vec![start.to_string()];
            let mut stale = Vec::new();
            while let Some(hash) = queue.pop() {
                if !visited.insert(hash.clone()) {
                    continue;
                }
                let Some(tm) = state.registry.get(&hash) else {
                    continue;
                };
                queue.extend(tm.dependencies.iter().cloned());
                if tm.compilation.is_none() {
                    stale.push(hash);
                }
            }
            stale
        };
        for hash in stale {
            self.runtime
                .invalidate(&hash)
                .map_err(|e| Error::other(e.to_string()))?;
        }
        Ok(())
    }

    /// Snapshot compilations for every evaluated TM reachable from the
    /// entry; returns the entry's exports.
    fn record_compilations(&mut self, entry_hash: &str) -> Result<serde_json::Value> {
        let closure: Vec<String> = {
            let state = self.state.borrow();
            let mut visited: FxHashSet<String> = FxHashSet::default();
            let mut queue = vec![entry_hash.to_string()];
            while let Some(hash) = queue.pop() {
                if !visited.insert(hash.clone()) {
                    continue;
                }
                if let Some(tm) = state.registry.get(&hash) {
                    queue.extend(tm.dependencies.iter().cloned());
                }
            }
            visited.into_iter().collect()
        };

        let mut entry_exports = serde_json::Value::Null;
        for hash in closure {
            let snapshot = self
                .runtime
                .exports_snapshot(&hash)
                .map_err(|e| Error::other(e.to_string()))?;
            if let Some(exports) = snapshot {
                if hash == entry_hash {
                    entry_exports = exports.clone();
                }
                let mut state = self.state.borrow_mut();
                if let Some(tm) = state.registry.get_mut(&hash) {
                    tm.compilation = Some(Compilation { exports });
                }
            }
        }
        Ok(entry_exports)
    }

    /// Apply `module.hot` intent reported by evaluated code.
    fn apply_hmr_events(&mut self) {
        let events = self.runtime.drain_hmr_events();
        if events.is_empty() {
            return;
        }
        let mut state = self.state.borrow_mut();
        for event in events {
            match event {
                HmrEvent::AcceptSelf { hash } => {
                    if let Some(tm) = state.registry.get_mut(&hash) {
                        tm.hmr_config.accept_self();
                    }
                }
                HmrEvent::AcceptDep { hash, dep } => {
                    if let Some(tm) = state.registry.get_mut(&hash) {
                        tm.hmr_config.accept_dependency(dep);
                    }
                }
                HmrEvent::Decline { hash } => {
                    if let Some(tm) = state.registry.get_mut(&hash) {
                        tm.hmr_config.decline();
                    }
                }
                HmrEvent::Dispose { hash } => {
                    if let Some(tm) = state.registry.get_mut(&hash) {
                        tm.hmr_config.register_dispose();
                    }
                }
                HmrEvent::Invalidate { hash } => {
                    if let Some(tm) = state.registry.get_mut(&hash) {
                        tm.compilation = None;
                        tm.hmr_config.set_dirty();
                    }
                }
            }
        }
    }

    /// The in-engine equivalent of reloading the host page: a fresh
    /// runtime registry and no cached compilations.
    fn perform_hard_reload(&mut self) -> Result<()> {
        self.hmr.set(HmrStatus::Fail);
        warn!("performing hard reload");

        self.runtime
            .reset()
            .map_err(|e| Error::other(e.to_string()))?;
        self.defined.clear();
        self.globals = None;

        let mut state = self.state.borrow_mut();
        for hash in state.registry.hashes() {
            if let Some(tm) = state.registry.get_mut(&hash) {
                tm.compilation = None;
                tm.hmr_config.settle();
            }
        }
        drop(state);

        self.pending_hard_reload = false;
        self.hard_reloads += 1;
        Ok(())
    }

    /// Install `process.env` and test globals into the runtime.
    fn inject_globals(&mut self, test_globals: bool) -> Result<()> {
        if self.globals == Some(test_globals) {
            return Ok(());
        }
        let node_env = if test_globals { "test" } else { "development" };
        let env_json = serde_json::to_string(&self.env).map_err(|e| Error::other(e.to_string()))?;
        let script = format!(
            "globalThis.process = globalThis.process || {{}};\
             globalThis.process.env = Object.assign({{ NODE_ENV: {node_env:?} }}, {env_json});"
        );
        self.runtime
            .execute(&script)
            .map_err(|e| Error::other(e.to_string()))?;
        self.globals = Some(test_globals);
        Ok(())
    }

    /// Apply a full new module map: diff, invalidate, retranspile.
    /// Returns the successfully retranspiled hashes.
    pub fn update_data(&mut self, modules: Vec<Module>) -> Result<Vec<String>> {
        self.stage = Stage::Transpilation;
        self.hmr.set(HmrStatus::Check);

        // Capture the incoming map before mutating state.
        let incoming: FxHashMap<String, Module> = modules
            .into_iter()
            .map(|m| (normalize(&m.path), m))
            .collect();

        let (added, updated, deleted) = {
            let state = self.state.borrow();
            let mut added = Vec::new();
            let mut updated = Vec::new();
            for (path, module) in &incoming {
                match state.store.get(path) {
                    None => added.push(path.clone()),
                    Some(existing) if existing.code != module.code => updated.push(path.clone()),
                    Some(_) => {}
                }
            }
            let deleted: Vec<String> = state
                .store
                .iter()
                .filter(|(path, module)| {
                    !incoming.contains_key(*path)
                        && !module.is_child()
                        && !path.starts_with("/node_modules")
                        && path.as_str() != dalkey_core::path::EMPTY_SHIM_PATH
                })
                .map(|(path, _)| path.clone())
                .collect();
            (added, updated, deleted)
        };

        let changed = !(added.is_empty() && updated.is_empty() && deleted.is_empty());
        debug!(
            added = added.len(),
            updated = updated.len(),
            deleted = deleted.len(),
            "update data"
        );

        let mut dirty: Vec<String> = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            if changed {
                state.resolver.clear_cache();
            }

            for path in &deleted {
                let disposed = state.registry.dispose_variants(path);
                for tm in &disposed {
                    self.defined.remove(&tm.hash);
                    for child in &tm.child_modules {
                        state.store.remove(child);
                        for child_tm in state.registry.dispose_variants(child) {
                            self.defined.remove(&child_tm.hash);
                        }
                    }
                    // Live initiators of a deleted module retranspile and
                    // surface module-not-found, never a silent dangle.
                    for parent in &tm.initiators {
                        if let Some(parent_tm) = state.registry.get_mut(parent) {
                            parent_tm.source = None;
                            parent_tm.compilation = None;
                            parent_tm.hmr_config.set_dirty();
                            dirty.push(parent.clone());
                        }
                    }
                }
                state.store.remove(path);
            }

            for path in &added {
                state.store.add(incoming[path].clone());
                state.registry.get_or_create(path, "");
            }

            for path in &updated {
                state.store.update(path, incoming[path].code.clone());
                dirty.extend(state.registry.mark_module_updated(path));
            }

            // Modules that failed on a missing dependency retry as well.
            for hash in state.registry.hashes() {
                let missing = state
                    .registry
                    .get(&hash)
                    .is_some_and(|tm| tm.has_missing_dependencies);
                if missing {
                    if let Some(tm) = state.registry.get_mut(&hash) {
                        tm.reset_transpilation();
                    }
                    dirty.push(hash);
                }
            }
        }
        for hash in &dirty {
            self.defined.remove(hash);
        }

        if added.iter().chain(&updated).any(|path| path == "/.env") {
            self.refresh_env();
        }

        self.transpile_jobs.clear();
        let retranspiled = self.transpile_worklist(dedup(dirty), false)?;

        if changed && self.state.borrow().configurations.sandbox.hard_reload_on_change {
            self.pending_hard_reload = true;
        }
        Ok(retranspiled)
    }

    /// Serialize the transpile graph for persistence. Precomputed TMs
    /// (manifest-provided content that needed no transpilation and was not
    /// downloaded) are elided and regenerate lazily after restore.
    #[must_use]
    pub fn serialize(&self, options: &SerializeOptions) -> SerializedSandbox {
        let state = self.state.borrow();
        let mut transpiled_modules: Vec<SerializedTranspiledModule> = state
            .registry
            .iter()
            .filter(|(_, tm)| {
                let downloaded = state
                    .store
                    .get(&tm.path)
                    .is_some_and(|module| module.downloaded);
                let precomputed = state.manifest.contents.contains_key(&tm.path)
                    && !tm.required_transpilation
                    && !downloaded;
                !precomputed
            })
            .map(|(_, tm)| SerializedTranspiledModule::from_module(tm))
            .collect();
        transpiled_modules.sort_by(|a, b| a.hash.cmp(&b.hash));

        if options.optimize_for_size {
            for tm in &mut transpiled_modules {
                if let Some(source) = &mut tm.source {
                    source.source_map = None;
                }
            }
        }

        SerializedSandbox {
            transpiled_modules,
            cached_paths: state.resolver.cached_paths().clone(),
            version: SCRIPT_VERSION,
            timestamp: now_ms(),
            configurations: state.configurations.clone(),
            entry: options.entry_path.clone(),
            meta: state.metas.directory_index(),
            dependencies_query: state.manifest.dependencies_query(),
        }
    }

    /// Restore a serialized graph. Returns false (and restores nothing)
    /// when the record's version or dependency set does not match.
    pub fn load(&mut self, data: &SerializedSandbox) -> bool {
        let query = self.state.borrow().manifest.dependencies_query();
        if !data.is_loadable(&query) {
            debug!(
                version = data.version,
                expected = SCRIPT_VERSION,
                "discarding persisted cache"
            );
            return false;
        }

        let mut state = self.state.borrow_mut();
        state.registry.clear();
        self.defined.clear();

        // Phase one: instantiate every TM so all hashes exist.
        for node in &data.transpiled_modules {
            state.registry.restore_node(node);
        }
        // Phase two: reconnect edges by hash; a broken reference aborts
        // that TM's restore silently.
        for node in &data.transpiled_modules {
            if !state.registry.restore_edges(node) {
                debug!(hash = %node.hash, "dropping cache entry with broken references");
                state.registry.dispose(&node.hash);
            }
        }

        state.resolver.restore_cached_paths(data.cached_paths.clone());
        state.configurations = data.configurations.clone();
        let meta_paths: Vec<String> = data
            .meta
            .iter()
            .flat_map(|(dir, files)| files.iter().map(move |f| format!("{dir}/{f}")))
            .collect();
        state.metas.extend(meta_paths);
        true
    }

    fn cache_key(&self) -> String {
        format!("dalkey.cache.{}", self.id)
    }

    /// Persist the current graph into the configured cache storage.
    pub fn save_cache(&mut self, options: &SerializeOptions) -> Result<()> {
        let record = self.serialize(options);
        let json = serde_json::to_string(&record).map_err(|e| Error::other(e.to_string()))?;
        let key = self.cache_key();
        match &mut self.cache_storage {
            Some(storage) => {
                storage.set(&key, json);
                Ok(())
            }
            None => Err(Error::other("no cache storage configured")),
        }
    }

    /// Restore from the configured cache storage, if a loadable record is
    /// present. Mismatches are discarded silently.
    pub fn load_cache(&mut self) -> bool {
        let key = self.cache_key();
        let Some(json) = self.cache_storage.as_ref().and_then(|s| s.get(&key)) else {
            return false;
        };
        match serde_json::from_str::<SerializedSandbox>(&json) {
            Ok(record) => self.load(&record),
            Err(err) => {
                debug!(error = %err, "discarding unreadable persisted cache");
                false
            }
        }
    }

    /// Remove the persisted record from the cache storage.
    pub fn delete_api_cache(&mut self) {
        let key = self.cache_key();
        if let Some(storage) = &mut self.cache_storage {
            storage.remove(&key);
        }
    }

    /// Drop every derived structure: the TM registry, the resolver cache,
    /// the combined metas, and the runtime registry.
    pub fn clear_cache(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.registry.clear();
        state.resolver.clear_cache();
        state.metas.clear();
        drop(state);

        self.defined.clear();
        self.transpile_jobs.clear();
        self.globals = None;
        self.runtime
            .reset()
            .map_err(|e| Error::other(e.to_string()))
    }

    /// Tear the manager down: dispose preset transpilers and release the
    /// runtime registry.
    pub fn dispose(&mut self) {
        for transpiler in self.preset.transpilers() {
            transpiler.dispose();
        }
        if let Err(err) = self.runtime.reset() {
            warn!(error = %err, "runtime reset failed during dispose");
        }
        self.hmr.set(HmrStatus::Idle);
    }

    // Introspection used by hosts and tests.

    /// A snapshot of the TM at `(path, query)`.
    #[must_use]
    pub fn transpiled_module(&self, path: &str, query: &str) -> Option<TranspiledModule> {
        self.state
            .borrow()
            .registry
            .lookup(&normalize(path), query)
            .cloned()
    }

    #[must_use]
    pub fn registry_len(&self) -> usize {
        self.state.borrow().registry.len()
    }

    /// Whether a TM with this hash exists in the registry.
    #[must_use]
    pub fn transpiled_module_by_hash_exists(&self, hash: &str) -> bool {
        self.state.borrow().registry.get(hash).is_some()
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.state.borrow().store.len()
    }

    #[must_use]
    pub fn module_code(&self, path: &str) -> Option<String> {
        self.state.borrow().store.code(path).map(String::from)
    }

    #[must_use]
    pub fn resolver_cache_is_empty(&self) -> bool {
        self.state.borrow().resolver.cache_is_empty()
    }

    #[must_use]
    pub fn dependencies_query(&self) -> String {
        self.state.borrow().manifest.dependencies_query()
    }
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::VanillaPreset;

    fn manager_with(modules: Vec<Module>) -> Manager {
        Manager::new(
            "test-sandbox",
            Rc::new(VanillaPreset::new()),
            modules,
            &ManagerOptions::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_construction_callback_fires() {
        let called = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&called);
        let _manager = Manager::new(
            "cb-sandbox",
            Rc::new(VanillaPreset::new()),
            vec![Module::new("/index.js", "module.exports = 1;")],
            &ManagerOptions::default(),
            Some(Box::new(move |m| {
                *seen.borrow_mut() = m.module_count() > 0;
            })),
        )
        .unwrap();
        assert!(*called.borrow());
    }

    #[test]
    fn test_transpile_builds_dependency_edges() {
        let mut manager = manager_with(vec![
            Module::new("/index.js", "module.exports = require('./dep') + 1;"),
            Module::new("/dep.js", "module.exports = 41;"),
        ]);
        let transpiled = manager.transpile_modules("/index.js", false).unwrap();
        assert_eq!(transpiled.len(), 2);

        let entry = manager.transpiled_module("/index.js", "").unwrap();
        let dep = manager.transpiled_module("/dep.js", "").unwrap();
        assert!(entry.dependencies.contains(&dep.hash));
        assert!(dep.initiators.contains(&entry.hash));
        assert!(entry.is_entry);
        assert!(entry.source.is_some());
    }

    #[test]
    fn test_transpile_is_idempotent() {
        let mut manager = manager_with(vec![Module::new("/index.js", "module.exports = 1;")]);
        let first = manager.transpile_modules("/index.js", false).unwrap();
        assert_eq!(first.len(), 1);
        let second = manager.transpile_modules("/index.js", false).unwrap();
        assert!(second.is_empty());
        assert_eq!(manager.registry_len(), 1);
    }

    #[test]
    fn test_sync_and_fetching_resolve_agree() {
        let mut manager = manager_with(vec![
            Module::new("/index.js", ""),
            Module::new("/dep.js", ""),
        ]);
        let sync = manager.resolve("./dep", "/index.js").unwrap();
        let fetching = manager.resolve_fetching("./dep", "/index.js").unwrap();
        assert_eq!(sync, fetching);
    }

    #[test]
    fn test_update_data_diff_and_cache_clearing() {
        let mut manager = manager_with(vec![
            Module::new("/index.js", "module.exports = require('./dep');"),
            Module::new("/dep.js", "module.exports = 1;"),
        ]);
        manager.transpile_modules("/index.js", false).unwrap();
        assert!(!manager.resolver_cache_is_empty());

        // Same map → no change, cache stays.
        manager
            .update_data(vec![
                Module::new("/index.js", "module.exports = require('./dep');"),
                Module::new("/dep.js", "module.exports = 1;"),
            ])
            .unwrap();
        assert!(!manager.resolver_cache_is_empty());

        // Changed dep → cache cleared, dep retranspiled.
        let retranspiled = manager
            .update_data(vec![
                Module::new("/index.js", "module.exports = require('./dep');"),
                Module::new("/dep.js", "module.exports = 2;"),
            ])
            .unwrap();
        assert!(manager.resolver_cache_is_empty());
        let dep_hash = tm_hash("/dep.js", "");
        assert!(retranspiled.contains(&dep_hash));
        assert_eq!(manager.module_code("/dep.js").unwrap(), "module.exports = 2;");
    }

    #[test]
    fn test_update_data_deletes_modules() {
        let mut manager = manager_with(vec![
            Module::new("/index.js", "module.exports = 1;"),
            Module::new("/old.js", "module.exports = 2;"),
        ]);
        manager.transpile_modules("/old.js", false).unwrap();

        manager
            .update_data(vec![Module::new("/index.js", "module.exports = 1;")])
            .unwrap();
        assert!(manager.module_code("/old.js").is_none());
        assert!(manager.transpiled_module("/old.js", "").is_none());
    }

    #[test]
    fn test_deleted_dependency_marks_initiator_errored() {
        let mut manager = manager_with(vec![
            Module::new("/index.js", "module.exports = require('./dep');"),
            Module::new("/dep.js", "module.exports = 1;"),
        ]);
        manager.transpile_modules("/index.js", false).unwrap();

        manager
            .update_data(vec![Module::new(
                "/index.js",
                "module.exports = require('./dep');",
            )])
            .unwrap();

        let entry = manager.transpiled_module("/index.js", "").unwrap();
        assert!(entry.source.is_none());
        assert!(!entry.errors.is_empty());
    }

    #[test]
    fn test_serialize_skips_precomputed_manifest_modules() {
        let mut manifest = Manifest::default();
        manifest.contents.insert(
            "/node_modules/left-pad/index.js".to_string(),
            dalkey_core::ManifestContent {
                content: "module.exports = function(){};".to_string(),
                requires: Vec::new(),
            },
        );
        let mut manager = manager_with(vec![Module::new(
            "/index.js",
            "module.exports = require('left-pad');",
        )]);
        manager.set_manifest(manifest);
        manager.transpile_modules("/index.js", false).unwrap();

        let record = manager.serialize(&SerializeOptions::default());
        assert!(record
            .transpiled_modules
            .iter()
            .any(|tm| tm.path == "/index.js"));
        assert!(!record
            .transpiled_modules
            .iter()
            .any(|tm| tm.path == "/node_modules/left-pad/index.js"));
    }

    #[test]
    fn test_configuration_change_resets_graph() {
        let mut manager = manager_with(vec![Module::new("/index.js", "module.exports = 1;")]);
        manager.transpile_modules("/index.js", false).unwrap();
        assert!(manager
            .transpiled_module("/index.js", "")
            .unwrap()
            .source
            .is_some());

        let changed = manager
            .update_configurations(Configurations {
                ts_config: Some(serde_json::json!({"compilerOptions": {"baseUrl": "src"}})),
                ..Configurations::default()
            })
            .unwrap();
        assert!(changed);
        assert!(manager
            .transpiled_module("/index.js", "")
            .unwrap()
            .source
            .is_none());
        assert_eq!(manager.module_directories(), vec!["src".to_string()]);

        // Same bundle again is a no-op.
        let changed = manager
            .update_configurations(Configurations {
                ts_config: Some(serde_json::json!({"compilerOptions": {"baseUrl": "src"}})),
                ..Configurations::default()
            })
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_clear_cache_drops_registry_and_metas() {
        let mut manager = manager_with(vec![Module::new("/index.js", "module.exports = 1;")]);
        manager.set_combined_metas(vec!["/node_modules/x/index.js".to_string()]);
        manager.transpile_modules("/index.js", false).unwrap();
        assert!(manager.registry_len() > 0);

        manager.clear_cache().unwrap();
        assert_eq!(manager.registry_len(), 0);
        assert!(manager.resolver_cache_is_empty());
    }
}

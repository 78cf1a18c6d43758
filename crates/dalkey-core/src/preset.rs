//! Presets and transpiler descriptors.
//!
//! A preset is the policy object a sandbox template plugs in: it supplies
//! ordered transpiler chains per file pattern, aliasing rules, the
//! extensions resolution probes, and the extensions whose files are served
//! as raw assets. Transpilers are uniform capability objects: the
//! pipeline is data-driven, with no inheritance between stages.

use crate::module::Module;
use crate::store::ModuleStore;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

/// Output of a single transpiler stage; stage *n*'s code feeds stage
/// *n*+1.
#[derive(Debug, Clone, Default)]
pub struct TranspilerOutput {
    pub code: String,
    pub source_map: Option<Value>,
}

impl TranspilerOutput {
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            source_map: None,
        }
    }
}

/// Failure raised by a transpiler stage; the manager wraps it with the
/// module hash and stage name.
#[derive(Debug, Clone)]
pub struct TranspilerError {
    pub message: String,
}

impl TranspilerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A module emitted while transpiling another (e.g. CSS extracted from a
/// component file).
#[derive(Debug, Clone)]
pub struct EmittedModule {
    pub path: String,
    pub code: String,
    /// Loader query the child should be compiled under.
    pub query: String,
}

/// Context handed to each transpiler stage. Stages read the store
/// snapshot and record their effects here; the manager applies them after
/// the stage returns.
pub struct LoaderContext<'a> {
    pub path: &'a str,
    pub query: &'a str,
    /// Stage options from the preset's loader entry.
    pub options: &'a Value,
    /// Environment variables visible to transpilers.
    pub env: &'a FxHashMap<String, String>,
    store: &'a ModuleStore,

    emitted_modules: Vec<EmittedModule>,
    dependencies: Vec<String>,
    transpilation_dependencies: Vec<String>,
    assets: Vec<(String, String)>,
    warnings: Vec<String>,
}

impl<'a> LoaderContext<'a> {
    #[must_use]
    pub fn new(
        path: &'a str,
        query: &'a str,
        options: &'a Value,
        env: &'a FxHashMap<String, String>,
        store: &'a ModuleStore,
    ) -> Self {
        Self {
            path,
            query,
            options,
            env,
            store,
            emitted_modules: Vec::new(),
            dependencies: Vec::new(),
            transpilation_dependencies: Vec::new(),
            assets: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Read another file's content at compile time. Use
    /// [`Self::add_transpilation_dependency`] as well when the output
    /// depends on it.
    #[must_use]
    pub fn read_file(&self, path: &str) -> Option<&str> {
        self.store.code(path)
    }

    /// Emit a synthetic child module; it is added to the store with this
    /// TM as parent.
    pub fn emit_module(&mut self, path: impl Into<String>, code: impl Into<String>, query: impl Into<String>) {
        self.emitted_modules.push(EmittedModule {
            path: path.into(),
            code: code.into(),
            query: query.into(),
        });
    }

    /// Declare a runtime dependency by request string; the manager
    /// resolves it and records the graph edge.
    pub fn add_dependency(&mut self, request: impl Into<String>) {
        self.dependencies.push(request.into());
    }

    /// Declare a compile-time dependency (e.g. a config file whose content
    /// this stage consumed).
    pub fn add_transpilation_dependency(&mut self, request: impl Into<String>) {
        self.transpilation_dependencies.push(request.into());
    }

    /// Emit an asset file.
    pub fn emit_asset(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.assets.push((path.into(), content.into()));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Drain the recorded effects: (emitted modules, runtime deps,
    /// transpilation deps, assets, warnings).
    #[must_use]
    #[allow(clippy::type_complexity)]
    pub fn into_effects(
        self,
    ) -> (
        Vec<EmittedModule>,
        Vec<String>,
        Vec<String>,
        Vec<(String, String)>,
        Vec<String>,
    ) {
        (
            self.emitted_modules,
            self.dependencies,
            self.transpilation_dependencies,
            self.assets,
            self.warnings,
        )
    }
}

/// One transpiler stage.
pub trait Transpiler {
    fn name(&self) -> &str;

    /// Run the stage. Input is the previous stage's output.
    fn transpile(
        &self,
        code: &str,
        ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput, TranspilerError>;

    /// Release resources (workers, caches) on manager teardown.
    fn dispose(&self) {}

    /// Debugging context surfaced to hosts (versions, active options).
    fn transpiler_context(&self) -> Value {
        Value::Null
    }
}

/// A transpiler paired with per-pattern options.
#[derive(Clone)]
pub struct LoaderEntry {
    pub transpiler: Arc<dyn Transpiler>,
    pub options: Value,
}

impl LoaderEntry {
    #[must_use]
    pub fn new(transpiler: Arc<dyn Transpiler>) -> Self {
        Self {
            transpiler,
            options: Value::Null,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// The pluggable policy object supplied by a sandbox template.
pub trait Preset {
    fn name(&self) -> &str;

    /// Every transpiler the preset owns, for disposal on teardown.
    fn transpilers(&self) -> Vec<Arc<dyn Transpiler>>;

    /// Ordered transpiler chain for a module under a loader query.
    fn get_loaders(&self, module: &Module, query: &str) -> Vec<LoaderEntry>;

    /// Alias table consulted before resolution; `None` leaves the request
    /// unchanged.
    fn get_aliased_path(&self, path: &str) -> Option<String>;

    /// Extensions whose files skip loaders and evaluate to their raw
    /// content.
    fn ignored_extensions(&self) -> &[String];

    /// Extensions the resolver probes, in order.
    fn resolvable_extensions(&self) -> Vec<&str> {
        vec![".js", ".jsx", ".json"]
    }

    /// Whether `/.env` feeds transpiler environment variables.
    fn has_dot_env(&self) -> bool {
        false
    }
}

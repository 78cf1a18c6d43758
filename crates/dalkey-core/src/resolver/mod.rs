//! Node-style module resolution over the virtual file system.
//!
//! Resolution layers, applied in order:
//! 1. Preset aliasing (`{{sandboxRoot}}` substitution, then the preset's
//!    alias table)
//! 2. Manifest dependency aliasing for requests made from inside
//!    `/node_modules/<dep>/…` (version-split deduping)
//! 3. The core-library shim table (Node built-ins → `// empty` stub)
//! 4. Node resolution proper: relative/absolute joins, `node_modules`
//!    walks plus configured module directories, `package.json`
//!    `main`/`browser`/`exports`
//! 5. A directory-scoped result cache, invalidated wholesale on any
//!    file-set change
//!
//! Existence is answered by the module store plus the combined-metas index
//! of files known to live inside fetched packages; the resolver itself
//! never performs I/O.

mod exports;
mod pkg_json;

pub use exports::{has_exports, resolve_exports};
pub use pkg_json::{browser_rewrite, main_field, skips_browser_field, BrowserTarget};

use crate::error::{Error, Result};
use crate::manifest::{CombinedMetas, Manifest};
use crate::path::{
    dirname, join, node_modules_package, node_modules_paths, normalize, package_name,
    EMPTY_SHIM_PATH,
};
use crate::preset::Preset;
use crate::shims::shim_target;
use crate::store::ModuleStore;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

/// Placeholder substituted with the sandbox root in aliased requests.
const SANDBOX_ROOT_PLACEHOLDER: &str = "{{sandboxRoot}}";

/// Everything the resolver reads. Borrowed per call so transpiler stages
/// always see the manager's current snapshot.
pub struct ResolverHost<'a> {
    pub store: &'a ModuleStore,
    pub metas: &'a CombinedMetas,
    pub manifest: &'a Manifest,
    pub preset: &'a dyn Preset,
    /// Extra module directories (tsconfig `baseUrl`, `NODE_PATH` roots).
    pub module_directories: &'a [String],
}

impl ResolverHost<'_> {
    fn is_file(&self, path: &str) -> bool {
        self.store.contains(path) || self.metas.contains(path)
    }

    fn package_json(&self, dir: &str) -> Option<Value> {
        self.store
            .code(&join(dir, "package.json"))
            .and_then(pkg_json::parse)
    }
}

/// The resolver plus its two-level `dirname(from) → request → path` cache.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    cached_paths: FxHashMap<String, FxHashMap<String, String>>,
}

impl Resolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `request` as required from `from`. Successful resolutions
    /// are cached under the requester's directory; failures purge their
    /// cache entry.
    pub fn resolve(
        &mut self,
        host: &ResolverHost<'_>,
        request: &str,
        from: &str,
        extensions: &[&str],
    ) -> Result<String> {
        let from_dir = dirname(from).to_string();

        if let Some(cached) = self
            .cached_paths
            .get(&from_dir)
            .and_then(|entries| entries.get(request))
        {
            return Ok(cached.clone());
        }

        match resolve_uncached(host, request, from, &from_dir, extensions) {
            Ok(path) => {
                self.cached_paths
                    .entry(from_dir)
                    .or_default()
                    .insert(request.to_string(), path.clone());
                Ok(path)
            }
            Err(err) => {
                if let Some(entries) = self.cached_paths.get_mut(&from_dir) {
                    entries.remove(request);
                }
                Err(err)
            }
        }
    }

    /// Whether a resolution is already cached (and what it resolved to).
    #[must_use]
    pub fn cached(&self, from: &str, request: &str) -> Option<&String> {
        self.cached_paths
            .get(dirname(from))
            .and_then(|entries| entries.get(request))
    }

    /// Drop the whole cache. Any add/remove/move of files invalidates
    /// every directory-scoped resolution at once.
    pub fn clear_cache(&mut self) {
        if !self.cached_paths.is_empty() {
            debug!(directories = self.cached_paths.len(), "clearing resolver cache");
            self.cached_paths.clear();
        }
    }

    #[must_use]
    pub fn cache_is_empty(&self) -> bool {
        self.cached_paths.is_empty()
    }

    #[must_use]
    pub fn cached_paths(&self) -> &FxHashMap<String, FxHashMap<String, String>> {
        &self.cached_paths
    }

    /// Restore a persisted cache wholesale.
    pub fn restore_cached_paths(
        &mut self,
        cached_paths: FxHashMap<String, FxHashMap<String, String>>,
    ) {
        self.cached_paths = cached_paths;
    }
}

fn resolve_uncached(
    host: &ResolverHost<'_>,
    request: &str,
    from: &str,
    from_dir: &str,
    extensions: &[&str],
) -> Result<String> {
    // Step 1: preset aliasing.
    let mut req = if request.contains(SANDBOX_ROOT_PLACEHOLDER) {
        request.replace(SANDBOX_ROOT_PLACEHOLDER, "")
    } else {
        request.to_string()
    };
    if let Some(aliased) = host.preset.get_aliased_path(&req) {
        req = aliased;
    }

    // Step 2: manifest dependency aliasing for requests from inside a
    // packaged dependency.
    if is_bare(&req) {
        if let Some(dep) = node_modules_package(from) {
            let name_len = package_name(&req).len();
            let rewritten = host
                .manifest
                .alias_for(dep, &req[..name_len])
                .map(|actual| format!("{actual}{}", &req[name_len..]));
            if let Some(rewritten) = rewritten {
                req = rewritten;
            }
        }
    }

    // Step 3: core-library shims, unless the manifest ships a real
    // implementation for the name.
    if req == EMPTY_SHIM_PATH {
        return Ok(EMPTY_SHIM_PATH.to_string());
    }
    if is_bare(&req) && !host.manifest.knows_dependency(package_name(&req)) {
        if let Some(shim) = shim_target(&req) {
            return Ok(shim.to_string());
        }
    }

    // Step 4: Node resolution.
    let mut tried: Vec<String> = Vec::new();
    if is_bare(&req) {
        resolve_bare(host, &req, from, from_dir, extensions, &mut tried)
    } else {
        resolve_pathlike(host, &req, from, from_dir, extensions, &mut tried)
    }
    .ok_or_else(|| classify_failure(host, &req, from, from_dir, tried))
}

fn is_bare(request: &str) -> bool {
    !request.starts_with('.') && !request.starts_with('/')
}

/// Resolve a relative or absolute request, applying object-form `browser`
/// rewrites of the containing package.
fn resolve_pathlike(
    host: &ResolverHost<'_>,
    request: &str,
    from: &str,
    from_dir: &str,
    extensions: &[&str],
    tried: &mut Vec<String>,
) -> Option<String> {
    let base = join(from_dir, request);

    if let Some(target) = browser_subpath_rewrite(host, from, &base, extensions) {
        return match target {
            BrowserTarget::Ignore => Some(EMPTY_SHIM_PATH.to_string()),
            BrowserTarget::Path(rewritten) => {
                let root = owning_package_root(from);
                let rewritten = join(if root.is_empty() { "/" } else { &root }, &rewritten);
                resolve_as_file(host, &rewritten, extensions, tried)
                    .or_else(|| resolve_as_directory(host, &rewritten, extensions, tried))
            }
        };
    }

    resolve_as_file(host, &base, extensions, tried)
        .or_else(|| resolve_as_directory(host, &base, extensions, tried))
}

/// Resolve a bare request through the module-directory walk.
fn resolve_bare(
    host: &ResolverHost<'_>,
    request: &str,
    from: &str,
    from_dir: &str,
    extensions: &[&str],
    tried: &mut Vec<String>,
) -> Option<String> {
    // Object-form browser field of the containing package may remap or
    // blank out a bare name (`{"fs": false}`).
    let root = owning_package_root(from);
    let pkg_root = if root.is_empty() { "/".to_string() } else { root };
    if let Some(pkg) = host.package_json(&pkg_root) {
        if !skips_browser_field(package_name_of(&pkg, &pkg_root)) {
            match browser_rewrite(&pkg, request) {
                Some(BrowserTarget::Ignore) => return Some(EMPTY_SHIM_PATH.to_string()),
                Some(BrowserTarget::Path(rewritten)) => {
                    let target = join(&pkg_root, &rewritten);
                    if let Some(resolved) = resolve_as_file(host, &target, extensions, tried) {
                        return Some(resolved);
                    }
                }
                None => {}
            }
        }
    }

    let name = package_name(request);
    let subpath = request
        .strip_prefix(name)
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|rest| !rest.is_empty());

    for dir in node_modules_paths(from_dir, host.module_directories) {
        let pkg_dir = join(&dir, name);

        if let Some(pkg) = host.package_json(&pkg_dir) {
            if has_exports(&pkg) {
                let export_subpath = subpath.map(|s| format!("./{s}"));
                if let Some(target) = resolve_exports(&pkg, export_subpath.as_deref()) {
                    let candidate = join(&pkg_dir, &target);
                    if let Some(resolved) = resolve_as_file(host, &candidate, extensions, tried) {
                        return Some(resolved);
                    }
                    tried.push(candidate);
                }
                // An exports field makes other subpaths of this copy
                // unreachable; keep walking outer directories.
                continue;
            }
        }

        let candidate = join(&dir, request);
        if let Some(resolved) = resolve_as_file(host, &candidate, extensions, tried)
            .or_else(|| resolve_as_directory(host, &candidate, extensions, tried))
        {
            return Some(resolved);
        }
    }

    None
}

/// Probe a path as a file: exact match first, then configured extensions
/// in order; first match wins.
fn resolve_as_file(
    host: &ResolverHost<'_>,
    path: &str,
    extensions: &[&str],
    tried: &mut Vec<String>,
) -> Option<String> {
    if host.is_file(path) {
        return Some(path.to_string());
    }
    tried.push(path.to_string());

    for ext in extensions {
        let candidate = format!("{path}{ext}");
        if host.is_file(&candidate) {
            return Some(candidate);
        }
        tried.push(candidate);
    }
    None
}

/// Probe a path as a directory: `package.json` entry fields first (main
/// beats `index.<ext>`), then index probing.
fn resolve_as_directory(
    host: &ResolverHost<'_>,
    dir: &str,
    extensions: &[&str],
    tried: &mut Vec<String>,
) -> Option<String> {
    if let Some(pkg) = host.package_json(dir) {
        let skip_browser = skips_browser_field(package_name_of(&pkg, dir));

        let entry = resolve_exports(&pkg, None)
            .or_else(|| main_field(&pkg, skip_browser).map(String::from));
        if let Some(entry) = entry {
            let candidate = join(dir, &entry);
            if let Some(resolved) = resolve_as_file(host, &candidate, extensions, tried) {
                return Some(resolved);
            }
            // main may itself name a directory ("./lib").
            if let Some(resolved) = resolve_index(host, &candidate, extensions, tried) {
                return Some(resolved);
            }
        }
    }

    resolve_index(host, dir, extensions, tried)
}

fn resolve_index(
    host: &ResolverHost<'_>,
    dir: &str,
    extensions: &[&str],
    tried: &mut Vec<String>,
) -> Option<String> {
    for ext in extensions {
        let candidate = join(dir, &format!("index{ext}"));
        if host.is_file(&candidate) {
            return Some(candidate);
        }
        tried.push(candidate);
    }
    None
}

/// Root directory of the package that owns `path`: its `/node_modules/...`
/// package directory, or `""` for sandbox-root files (whose package.json
/// is `/package.json`).
fn owning_package_root(path: &str) -> String {
    match node_modules_package(path) {
        Some(name) => format!("/node_modules/{name}"),
        None => String::new(),
    }
}

fn package_name_of<'a>(pkg: &'a Value, dir: &'a str) -> &'a str {
    pkg_json::name(pkg).unwrap_or_else(|| node_modules_package(dir).unwrap_or(""))
}

/// Object-form `browser` rewrite for a relative sub-path of the owning
/// package. Keys are matched with and without the probing extensions.
fn browser_subpath_rewrite(
    host: &ResolverHost<'_>,
    from: &str,
    target: &str,
    extensions: &[&str],
) -> Option<BrowserTarget> {
    let root = owning_package_root(from);
    let pkg_dir = if root.is_empty() { "/" } else { root.as_str() };
    let pkg = host.package_json(pkg_dir)?;
    if skips_browser_field(package_name_of(&pkg, pkg_dir)) {
        return None;
    }

    let rel = relative_key(pkg_dir, target)?;
    if let Some(rewrite) = browser_rewrite(&pkg, &rel) {
        return Some(rewrite);
    }
    for ext in extensions {
        if let Some(rewrite) = browser_rewrite(&pkg, &format!("{rel}{ext}")) {
            return Some(rewrite);
        }
    }
    None
}

/// `./`-prefixed form of `path` relative to `root`, when inside it.
fn relative_key(root: &str, path: &str) -> Option<String> {
    if root == "/" {
        return Some(format!(".{path}"));
    }
    path.strip_prefix(root)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| format!(".{rest}"))
}

/// Classify a failed resolution per the target's location and the
/// manifest's knowledge of it.
fn classify_failure(
    host: &ResolverHost<'_>,
    request: &str,
    from: &str,
    from_dir: &str,
    tried: Vec<String>,
) -> Error {
    let dependency_name = if is_bare(request) {
        Some(package_name(request).to_string())
    } else {
        node_modules_package(&join(from_dir, request)).map(String::from)
    };

    match dependency_name {
        Some(name) if host.manifest.knows_dependency(&name) => {
            Error::module_not_found(request, from, true, tried)
        }
        Some(name) => {
            debug!(name = %name, from = %from, "dependency missing from manifest");
            Error::dependency_not_found(name, from)
        }
        None => Error::module_not_found(request, from, false, tried),
    }
}

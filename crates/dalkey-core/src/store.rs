//! The authoritative path → module mapping.
//!
//! The store is the engine's view of the virtual file system: editor files,
//! packager-provided dependency files, loader-emitted children, and the
//! empty shim all live here. Graph bookkeeping (disposing transpiled
//! variants, clearing the resolver cache) is coordinated by the manager;
//! the store itself only answers ownership and existence questions.

use crate::module::Module;
use crate::path::normalize;
use crate::shims::{EMPTY_SHIM_CANONICAL_PATH, EMPTY_SHIM_CODE, EMPTY_SHIM_PATH};
use rustc_hash::FxHashMap;

/// Path → module map over the virtual FS.
#[derive(Debug, Clone, Default)]
pub struct ModuleStore {
    modules: FxHashMap<String, Module>,
}

impl ModuleStore {
    /// Create a store pre-seeded with the empty shim at both its sentinel
    /// and canonical paths.
    #[must_use]
    pub fn new() -> Self {
        let mut store = Self::default();
        store.add(Module::new(EMPTY_SHIM_PATH, EMPTY_SHIM_CODE));
        store.add(Module::new(EMPTY_SHIM_CANONICAL_PATH, EMPTY_SHIM_CODE));
        store
    }

    /// Add a module. Idempotent: re-adding a path with identical code is a
    /// no-op, and an existing module is only replaced when the code
    /// differs. Returns true when the store changed.
    pub fn add(&mut self, module: Module) -> bool {
        let path = normalize(&module.path);
        match self.modules.get(&path) {
            Some(existing) if existing.code == module.code => false,
            _ => {
                self.modules.insert(path.clone(), Module { path, ..module });
                true
            }
        }
    }

    /// Replace a module's code. Returns true when the module existed and
    /// the code changed.
    pub fn update(&mut self, path: &str, code: impl Into<String>) -> bool {
        let path = normalize(path);
        match self.modules.get_mut(&path) {
            Some(module) => {
                let code = code.into();
                if module.code == code {
                    false
                } else {
                    module.code = code;
                    module.requires = None;
                    true
                }
            }
            None => false,
        }
    }

    /// Remove a module. The shim paths are fixed and never removed.
    pub fn remove(&mut self, path: &str) -> Option<Module> {
        let path = normalize(path);
        if path == EMPTY_SHIM_PATH || path == EMPTY_SHIM_CANONICAL_PATH {
            return None;
        }
        self.modules.remove(&path)
    }

    /// Move a module to a new path (remove + add).
    pub fn rename(&mut self, path: &str, new_path: &str) -> bool {
        match self.remove(path) {
            Some(module) => self.add(Module {
                path: normalize(new_path),
                ..module
            }),
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Module> {
        self.modules.get(path)
    }

    #[must_use]
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        self.modules.get_mut(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Read a module's code.
    #[must_use]
    pub fn code(&self, path: &str) -> Option<&str> {
        self.modules.get(path).map(|m| m.code.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Module)> {
        self.modules.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.modules.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_store_seeds_shims() {
        let store = ModuleStore::new();
        assert_eq!(store.code(EMPTY_SHIM_PATH), Some(EMPTY_SHIM_CODE));
        assert_eq!(store.code(EMPTY_SHIM_CANONICAL_PATH), Some(EMPTY_SHIM_CODE));
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = ModuleStore::new();
        assert!(store.add(Module::new("/index.js", "a")));
        assert!(!store.add(Module::new("/index.js", "a")));
        assert!(store.add(Module::new("/index.js", "b")));
        assert_eq!(store.code("/index.js"), Some("b"));
    }

    #[test]
    fn test_update_clears_prescanned_requires() {
        let mut store = ModuleStore::new();
        store.add(Module::precomputed("/a.js", "require('./b')", vec!["./b".into()]));
        assert!(store.update("/a.js", "module.exports = 1;"));
        assert!(store.get("/a.js").unwrap().requires.is_none());
    }

    #[test]
    fn test_remove_never_drops_shims() {
        let mut store = ModuleStore::new();
        assert!(store.remove(EMPTY_SHIM_PATH).is_none());
        assert!(store.remove(EMPTY_SHIM_CANONICAL_PATH).is_none());
        assert!(store.contains(EMPTY_SHIM_PATH));
    }

    #[test]
    fn test_rename() {
        let mut store = ModuleStore::new();
        store.add(Module::new("/old.js", "x"));
        assert!(store.rename("/old.js", "/new.js"));
        assert!(!store.contains("/old.js"));
        assert_eq!(store.code("/new.js"), Some("x"));
    }

    #[test]
    fn test_paths_are_normalized_on_add() {
        let mut store = ModuleStore::new();
        store.add(Module::new("/src/./a.js", "x"));
        assert!(store.contains("/src/a.js"));
    }
}

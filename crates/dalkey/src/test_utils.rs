//! Shared fixtures for unit and integration tests.
//!
//! A minimal preset with a JSON loader and configurable aliases. Real
//! sandbox templates ship their own presets; this one exists so the
//! engine can be exercised without any template.

use dalkey_core::{
    LoaderContext, LoaderEntry, Module, Preset, Transpiler, TranspilerError, TranspilerOutput,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Wraps JSON file content into a CommonJS export.
pub struct JsonTranspiler;

impl Transpiler for JsonTranspiler {
    fn name(&self) -> &str {
        "json-loader"
    }

    fn transpile(
        &self,
        code: &str,
        _ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput, TranspilerError> {
        let value: serde_json::Value = serde_json::from_str(code)
            .map_err(|e| TranspilerError::new(format!("invalid JSON: {e}")))?;
        Ok(TranspilerOutput::code(format!("module.exports = {value};")))
    }
}

/// A plain-JavaScript preset: JSON loader, optional aliases, optional
/// raw-asset extensions, no transform of JS itself.
#[derive(Default)]
pub struct VanillaPreset {
    aliases: FxHashMap<String, String>,
    ignored: Vec<String>,
}

impl VanillaPreset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.aliases.insert(from.into(), to.into());
        self
    }

    #[must_use]
    pub fn with_ignored_extension(mut self, ext: impl Into<String>) -> Self {
        self.ignored.push(ext.into());
        self
    }
}

impl Preset for VanillaPreset {
    fn name(&self) -> &str {
        "vanilla"
    }

    fn transpilers(&self) -> Vec<Arc<dyn Transpiler>> {
        vec![Arc::new(JsonTranspiler)]
    }

    fn get_loaders(&self, module: &Module, _query: &str) -> Vec<LoaderEntry> {
        if module.path.ends_with(".json") {
            vec![LoaderEntry::new(Arc::new(JsonTranspiler))]
        } else {
            Vec::new()
        }
    }

    fn get_aliased_path(&self, path: &str) -> Option<String> {
        self.aliases.get(path).cloned()
    }

    fn ignored_extensions(&self) -> &[String] {
        &self.ignored
    }

    fn resolvable_extensions(&self) -> Vec<&str> {
        vec![".js", ".jsx", ".json"]
    }
}

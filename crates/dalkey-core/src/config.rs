//! Sandbox configuration bundle.
//!
//! Parsed configuration files travel as raw JSON values: a configuration
//! change can affect the output of every transpiler, so the manager deep
//! compares the whole bundle and resets the graph when anything moved.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sandbox behavior toggles from `sandbox.config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOptions {
    /// Reload the whole page on any change instead of patching in place.
    #[serde(default)]
    pub hard_reload_on_change: bool,
    /// Hand the dirty cycle to the host framework's own HMR runtime.
    #[serde(default)]
    pub enable_webpack_hmr: bool,
}

/// The full parsed configuration bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configurations {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub package_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ts_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub js_config: Option<Value>,
    #[serde(default)]
    pub sandbox: SandboxOptions,
}

impl Configurations {
    /// Module directories beyond `node_modules`: the TS/JS config
    /// `compilerOptions.baseUrl` plus any `NODE_PATH` roots.
    #[must_use]
    pub fn module_directories(&self, node_path: Option<&str>) -> Vec<String> {
        let mut directories = Vec::new();

        for config in [&self.ts_config, &self.js_config] {
            let base_url = config
                .as_ref()
                .and_then(|c| c.pointer("/compilerOptions/baseUrl"))
                .and_then(Value::as_str);
            if let Some(base_url) = base_url {
                let dir = base_url.trim_start_matches("./").to_string();
                if !dir.is_empty() && !directories.contains(&dir) {
                    directories.push(dir);
                }
            }
        }

        if let Some(node_path) = node_path {
            for dir in node_path.split(':').filter(|d| !d.is_empty()) {
                let dir = dir.to_string();
                if !directories.contains(&dir) {
                    directories.push(dir);
                }
            }
        }

        directories
    }
}

/// Parse a `/.env` file: `KEY=value` lines, `#` comments, optional
/// surrounding quotes, `export` prefixes tolerated.
#[must_use]
pub fn parse_env(code: &str) -> FxHashMap<String, String> {
    let mut env = FxHashMap::default();

    for line in code.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);

        env.insert(key.to_string(), value.to_string());
    }

    env
}

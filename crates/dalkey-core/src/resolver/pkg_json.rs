//! `package.json` field evaluation over the virtual store.
//!
//! Works on raw `serde_json::Value`s: a sandbox sees arbitrary user
//! packages, so missing or malformed fields degrade to `None` instead of
//! failing resolution outright.

use serde_json::Value;

/// Entry-point fields probed for a package root, in order. `browser` is
/// skipped for packages in the hostile set.
const MAIN_FIELDS: &[&str] = &["browser", "module", "main"];

/// Dependencies whose `browser` field is known to break in-page bundling.
const SKIP_BROWSER_FIELD: &[&str] = &["babel-core", "@babel/core"];

/// Parse a package.json source. Malformed JSON yields `None`.
#[must_use]
pub fn parse(code: &str) -> Option<Value> {
    serde_json::from_str(code).ok()
}

/// Whether `browser` fields of this package must be ignored.
#[must_use]
pub fn skips_browser_field(package_name: &str) -> bool {
    SKIP_BROWSER_FIELD.contains(&package_name)
}

/// The package's entry point from its main fields. A string-valued
/// `browser` wins unless the package is in the opt-out set; the object
/// form is handled separately by [`browser_rewrite`].
#[must_use]
pub fn main_field(pkg: &Value, skip_browser: bool) -> Option<&str> {
    for field in MAIN_FIELDS {
        if *field == "browser" && skip_browser {
            continue;
        }
        match pkg.get(field) {
            Some(Value::String(target)) => return Some(target),
            _ => {}
        }
    }
    None
}

/// Rewrite target from an object-form `browser` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserTarget {
    /// Substitute this path or request.
    Path(String),
    /// The key maps to `false`: replace with the empty shim.
    Ignore,
}

/// Look up `key` (a relative sub-path like `./lib/server.js`, or a bare
/// request name) in the object form of the `browser` field.
#[must_use]
pub fn browser_rewrite(pkg: &Value, key: &str) -> Option<BrowserTarget> {
    let browser = pkg.get("browser")?.as_object()?;
    let value = browser
        .get(key)
        .or_else(|| key.strip_prefix("./").and_then(|bare| browser.get(bare)))?;
    match value {
        Value::String(target) => Some(BrowserTarget::Path(target.clone())),
        Value::Bool(false) => Some(BrowserTarget::Ignore),
        _ => None,
    }
}

/// The package `name` field.
#[must_use]
pub fn name(pkg: &Value) -> Option<&str> {
    pkg.get("name").and_then(Value::as_str)
}

//! `package.json` exports field evaluation.
//!
//! Node-compatible exports resolution the way browser bundlers apply it:
//! - root exports (string, `"."` key, root conditions object)
//! - subpath keys (`"./feature"`)
//! - pattern keys (`"./*"`, most specific wins)
//! - conditional targets, preferring `browser`, then `require`, then
//!   `default` (evaluation is CommonJS inside the page)

use serde_json::Value;

/// Conditions honored when evaluating conditional exports, in preference
/// order.
const CONDITIONS: &[&str] = &["browser", "require", "default"];

/// Resolve exports for any subpath.
///
/// - `subpath == None` resolves root exports.
/// - `subpath == Some("./feature")` tries an exact key, then patterns.
///
/// Returns the target path (starting with `./`) if found.
#[must_use]
pub fn resolve_exports(pkg_json: &Value, subpath: Option<&str>) -> Option<String> {
    match subpath {
        None => resolve_exports_root(pkg_json),
        Some(sub) => resolve_exports_subpath(pkg_json, sub)
            .or_else(|| resolve_exports_pattern(pkg_json, sub)),
    }
}

/// Whether the package declares an exports field at all. When it does,
/// subpaths outside the exports map are unreachable.
#[must_use]
pub fn has_exports(pkg_json: &Value) -> bool {
    pkg_json.get("exports").is_some()
}

/// Resolve the root export. Callers fall back to the main fields when this
/// returns `None` and the package has no exports field.
#[must_use]
pub fn resolve_exports_root(pkg_json: &Value) -> Option<String> {
    let exports = pkg_json.get("exports")?;

    if exports.is_string() {
        return resolve_target(exports, "");
    }

    let obj = exports.as_object()?;
    if let Some(dot) = obj.get(".") {
        return resolve_target(dot, "");
    }

    // Root-level conditions object: no "." key, keys are conditions.
    if obj.keys().any(|k| !k.starts_with('.')) {
        return resolve_target(exports, "");
    }

    None
}

/// Resolve an exact subpath key (`"./feature"`).
#[must_use]
pub fn resolve_exports_subpath(pkg_json: &Value, subpath: &str) -> Option<String> {
    if !subpath.starts_with("./") {
        return None;
    }
    let obj = pkg_json.get("exports")?.as_object()?;
    if !has_subpath_keys(obj) {
        return None;
    }
    resolve_target(obj.get(subpath)?, "")
}

/// Resolve a pattern key (`"./*"`, `"./features/*"`). Only one `*` per key
/// is supported; the most specific pattern (longest key) wins; the matched
/// span substitutes into the target's `*`.
#[must_use]
pub fn resolve_exports_pattern(pkg_json: &Value, subpath: &str) -> Option<String> {
    if !subpath.starts_with("./") {
        return None;
    }
    let obj = pkg_json.get("exports")?.as_object()?;

    let mut best: Option<(&String, &Value, String)> = None;
    for (key, value) in obj {
        if !key.starts_with("./") || key.chars().filter(|&c| c == '*').count() != 1 {
            continue;
        }
        if let Some(star) = match_pattern(key, subpath) {
            let more_specific = best.as_ref().map_or(true, |(k, _, _)| key.len() > k.len());
            if more_specific {
                best = Some((key, value, star));
            }
        }
    }

    let (_, value, star) = best?;
    resolve_target(value, &star)
}

/// Match `subpath` against a single-`*` pattern, returning the span the
/// star captured.
fn match_pattern(pattern: &str, subpath: &str) -> Option<String> {
    let star = pattern.find('*')?;
    let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
    if subpath.len() < prefix.len() + suffix.len() {
        return None;
    }
    if subpath.starts_with(prefix) && subpath.ends_with(suffix) {
        Some(subpath[prefix.len()..subpath.len() - suffix.len()].to_string())
    } else {
        None
    }
}

/// Whether any exports key addresses a subpath.
fn has_subpath_keys(obj: &serde_json::Map<String, Value>) -> bool {
    obj.keys().any(|k| k.starts_with('.'))
}

/// Resolve a target value: a string, a conditions object, or an array of
/// fallbacks. `star` substitutes into pattern targets.
fn resolve_target(value: &Value, star: &str) -> Option<String> {
    match value {
        Value::String(target) => validate_target(target, star),
        Value::Object(conditions) => {
            // Key order matters: the first condition we honor wins.
            for (key, nested) in conditions {
                if key.starts_with('.') {
                    continue;
                }
                if CONDITIONS.contains(&key.as_str()) {
                    if let Some(resolved) = resolve_target(nested, star) {
                        return Some(resolved);
                    }
                }
            }
            None
        }
        Value::Array(fallbacks) => fallbacks.iter().find_map(|v| resolve_target(v, star)),
        _ => None,
    }
}

/// Targets must stay inside the package: start with `./` and never walk
/// out through `..`.
fn validate_target(target: &str, star: &str) -> Option<String> {
    if !target.starts_with("./") || target.contains("..") {
        return None;
    }
    Some(if target.contains('*') {
        target.replacen('*', star, 1)
    } else {
        target.to_string()
    })
}

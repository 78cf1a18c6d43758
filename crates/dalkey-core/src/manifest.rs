//! Dependency manifest from the packager service.
//!
//! The packager precomputes third-party sources plus resolution metadata:
//! file contents with pre-scanned requires, the top-level dependency list,
//! nested dependency versions with their parents, and per-dependency alias
//! tables that let two versions of one library coexist
//! (`react-dom` → `react` rewritten to `react/17.0.0`).

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// One file shipped by the packager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestContent {
    /// File content.
    pub content: String,
    /// Pre-scanned literal request strings.
    #[serde(default)]
    pub requires: Vec<String>,
}

/// A top-level dependency of the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Requested range or pinned version, as written by the editor.
    pub version: String,
}

/// A nested dependency resolved by the packager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDependency {
    /// Requested semver range.
    pub semver: String,
    /// Resolved version.
    pub resolved: semver::Version,
    /// Names of the packages that depend on this one.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// The packager's precomputed bundle of third-party sources plus
/// resolution metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Path → file shipped by the packager.
    #[serde(default)]
    pub contents: FxHashMap<String, ManifestContent>,
    /// Top-level dependencies.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Nested dependency name → resolution metadata.
    #[serde(default, rename = "dependencyDependencies")]
    pub dependency_dependencies: FxHashMap<String, DependencyDependency>,
    /// Dependency → (requested name → actual name) rewrites for
    /// version-split deduping.
    #[serde(default, rename = "dependencyAliases")]
    pub dependency_aliases: FxHashMap<String, FxHashMap<String, String>>,
}

impl Manifest {
    /// Whether the manifest knows a package by name, either top-level or
    /// nested.
    #[must_use]
    pub fn knows_dependency(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| d.name == name)
            || self.dependency_dependencies.contains_key(name)
    }

    /// Requested version for a known package, preferring the top-level
    /// entry.
    #[must_use]
    pub fn dependency_version(&self, name: &str) -> Option<String> {
        if let Some(dep) = self.dependencies.iter().find(|d| d.name == name) {
            return Some(dep.version.clone());
        }
        self.dependency_dependencies
            .get(name)
            .map(|d| d.resolved.to_string())
    }

    /// Alias rewrite for `requested` as seen from inside `dep`, when the
    /// packager split versions.
    #[must_use]
    pub fn alias_for(&self, dep: &str, requested: &str) -> Option<&str> {
        self.dependency_aliases
            .get(dep)
            .and_then(|aliases| aliases.get(requested))
            .map(String::as_str)
    }

    /// Canonical encoding of the top-level dependency set, used as the
    /// persisted-cache key. Sorted so the encoding is order-independent.
    #[must_use]
    pub fn dependencies_query(&self) -> String {
        let mut pairs: Vec<String> = self
            .dependencies
            .iter()
            .map(|d| format!("{}@{}", d.name, d.version))
            .collect();
        pairs.sort_unstable();
        pairs.join("&")
    }
}

/// Session-scoped index of file paths known to exist inside fetched npm
/// packages. Resolution treats these as present even before their content
/// is local; serialization derives its directory index from them.
#[derive(Debug, Clone, Default)]
pub struct CombinedMetas {
    paths: FxHashSet<String>,
}

impl CombinedMetas {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record known file paths. Append-only during a session.
    pub fn extend(&mut self, paths: impl IntoIterator<Item = String>) {
        self.paths.extend(paths);
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Directory → filenames index for the serialized cache.
    #[must_use]
    pub fn directory_index(&self) -> FxHashMap<String, Vec<String>> {
        let mut index: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for path in &self.paths {
            let dir = crate::path::dirname(path).to_string();
            index
                .entry(dir)
                .or_default()
                .push(crate::path::basename(path).to_string());
        }
        for files in index.values_mut() {
            files.sort_unstable();
        }
        index
    }

    /// Cleared by explicit cache reset only.
    pub fn clear(&mut self) {
        self.paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with_react() -> Manifest {
        let mut manifest = Manifest {
            dependencies: vec![Dependency {
                name: "react".to_string(),
                version: "17.0.2".to_string(),
            }],
            ..Manifest::default()
        };
        manifest.dependency_dependencies.insert(
            "object-assign".to_string(),
            DependencyDependency {
                semver: "^4.1.1".to_string(),
                resolved: semver::Version::new(4, 1, 1),
                parents: vec!["react".to_string()],
            },
        );
        manifest
    }

    #[test]
    fn test_knows_dependency() {
        let manifest = manifest_with_react();
        assert!(manifest.knows_dependency("react"));
        assert!(manifest.knows_dependency("object-assign"));
        assert!(!manifest.knows_dependency("lodash"));
    }

    #[test]
    fn test_dependency_version_prefers_top_level() {
        let manifest = manifest_with_react();
        assert_eq!(manifest.dependency_version("react").as_deref(), Some("17.0.2"));
        assert_eq!(
            manifest.dependency_version("object-assign").as_deref(),
            Some("4.1.1")
        );
    }

    #[test]
    fn test_dependencies_query_is_sorted() {
        let manifest = Manifest {
            dependencies: vec![
                Dependency {
                    name: "zlib-browserify".to_string(),
                    version: "1.0.0".to_string(),
                },
                Dependency {
                    name: "react".to_string(),
                    version: "17.0.2".to_string(),
                },
            ],
            ..Manifest::default()
        };
        assert_eq!(
            manifest.dependencies_query(),
            "react@17.0.2&zlib-browserify@1.0.0"
        );
    }

    #[test]
    fn test_alias_lookup() {
        let mut manifest = Manifest::default();
        let mut aliases = FxHashMap::default();
        aliases.insert("react".to_string(), "react/17.0.0".to_string());
        manifest
            .dependency_aliases
            .insert("react-dom".to_string(), aliases);

        assert_eq!(manifest.alias_for("react-dom", "react"), Some("react/17.0.0"));
        assert_eq!(manifest.alias_for("react-dom", "lodash"), None);
        assert_eq!(manifest.alias_for("vue", "react"), None);
    }

    #[test]
    fn test_directory_index() {
        let mut metas = CombinedMetas::new();
        metas.extend([
            "/node_modules/react/index.js".to_string(),
            "/node_modules/react/cjs/react.development.js".to_string(),
        ]);
        let index = metas.directory_index();
        assert_eq!(index["/node_modules/react"], vec!["index.js"]);
        assert_eq!(
            index["/node_modules/react/cjs"],
            vec!["react.development.js"]
        );
    }
}

//! Source modules of the virtual file system.

use serde::{Deserialize, Serialize};

/// A single source file, addressed by absolute virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Absolute POSIX path in the virtual FS.
    pub path: String,
    /// Source code.
    pub code: String,
    /// Literal request strings, present when the packager pre-scanned the
    /// file. When absent, loaders declare dependencies during transpile.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requires: Option<Vec<String>>,
    /// Set when the module was fetched on demand from the registry.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub downloaded: bool,
    /// Hash of the transpiled module that emitted this file, when the
    /// module is a loader child (e.g. extracted CSS).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<String>,
}

impl Module {
    /// Create a plain source module.
    #[must_use]
    pub fn new(path: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            requires: None,
            downloaded: false,
            parent: None,
        }
    }

    /// Create a module whose requests were pre-scanned by the packager.
    #[must_use]
    pub fn precomputed(
        path: impl Into<String>,
        code: impl Into<String>,
        requires: Vec<String>,
    ) -> Self {
        Self {
            requires: Some(requires),
            ..Self::new(path, code)
        }
    }

    /// Create a module emitted by a loader during transpilation.
    #[must_use]
    pub fn child_of(
        parent_hash: impl Into<String>,
        path: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            parent: Some(parent_hash.into()),
            ..Self::new(path, code)
        }
    }

    /// Mark the module as fetched from the registry.
    #[must_use]
    pub fn with_downloaded(mut self) -> Self {
        self.downloaded = true;
        self
    }

    /// Whether this module was emitted by a loader.
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }
}

//! Error types for the sandbox engine.
//!
//! Errors are structured values, never bare strings: resolution failures
//! carry the request, the initiating path, and whether the target was a
//! known dependency; transpile and evaluation failures carry the hash of
//! the transpiled module they belong to.

use thiserror::Error;

/// Maximum number of candidate paths recorded on a resolution failure.
pub const MAX_TRIED_PATHS: usize = 20;

/// Core error type for sandbox operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Resolution failed. `is_dependency` is true when the target lies
    /// under a `node_modules` name known to the manifest.
    #[error("Cannot find module '{path}' from '{from}'")]
    ModuleNotFound {
        path: String,
        from: String,
        is_dependency: bool,
        tried: Vec<String>,
    },

    /// Resolution reached a `node_modules` package absent from the
    /// manifest. Recoverable by fetching the dependency.
    #[error("Dependency '{name}' not found, requested from '{from}'")]
    DependencyNotFound { name: String, from: String },

    /// A transpiler stage threw.
    #[error("Transpilation of '{path}' failed in '{transpiler}': {message}")]
    Transpile {
        module_hash: String,
        path: String,
        transpiler: String,
        message: String,
    },

    /// A runtime exception during evaluation.
    #[error("Evaluation of '{path}' failed: {message}")]
    Evaluation {
        module_hash: String,
        path: String,
        message: String,
    },

    /// The synchronous read facade found the file in neither the module
    /// store nor the host file resolver.
    #[error("ENOENT: no such file '{path}'")]
    Enoent { path: String },

    /// A persisted cache was produced by a different engine version or
    /// dependency set. Non-fatal; the cache is discarded.
    #[error("cache version mismatch: got {got}, expected {expected}")]
    CacheVersionMismatch { got: u32, expected: u32 },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a `ModuleNotFound` error, capping the tried-path list.
    #[must_use]
    pub fn module_not_found(
        path: impl Into<String>,
        from: impl Into<String>,
        is_dependency: bool,
        mut tried: Vec<String>,
    ) -> Self {
        tried.truncate(MAX_TRIED_PATHS);
        Self::ModuleNotFound {
            path: path.into(),
            from: from.into(),
            is_dependency,
            tried,
        }
    }

    #[must_use]
    pub fn dependency_not_found(name: impl Into<String>, from: impl Into<String>) -> Self {
        Self::DependencyNotFound {
            name: name.into(),
            from: from.into(),
        }
    }

    #[must_use]
    pub fn enoent(path: impl Into<String>) -> Self {
        Self::Enoent { path: path.into() }
    }

    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this failure can be retried after a dependency fetch or
    /// manifest refresh.
    #[must_use]
    pub fn is_missing_dependency(&self) -> bool {
        matches!(
            self,
            Self::DependencyNotFound { .. } | Self::ModuleNotFound { is_dependency: true, .. }
        )
    }
}

/// Convenience result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

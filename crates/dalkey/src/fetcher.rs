//! On-demand dependency download.
//!
//! When resolution reaches a package the manifest knows nothing about,
//! the manager asks a host-supplied fetcher for it and retries. Network
//! transport is the host's concern; the engine only defines the seam and
//! the store-population flow.

use dalkey_core::Module;
use thiserror::Error;

/// Fetch failure surfaced to the caller of the resolving operation.
#[derive(Debug, Clone, Error)]
#[error("Failed to fetch dependency '{name}@{version}': {message}")]
pub struct FetchError {
    pub name: String,
    pub version: String,
    pub message: String,
}

impl FetchError {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            message: message.into(),
        }
    }
}

/// A fetched package: its files plus the full path listing (metas) so the
/// resolver can see files whose content stays remote.
#[derive(Debug, Clone, Default)]
pub struct FetchedDependency {
    /// Modules to add to the store, paths under `/node_modules/<name>`.
    pub modules: Vec<Module>,
    /// Every file path known to exist in the package.
    pub metas: Vec<String>,
}

/// Host-supplied package source.
pub trait DependencyFetcher {
    /// Fetch a package at a version (range or pin, as the manifest
    /// recorded it).
    fn fetch(&self, name: &str, version: &str) -> Result<FetchedDependency, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyFetcher;

    impl DependencyFetcher for EmptyFetcher {
        fn fetch(&self, name: &str, version: &str) -> Result<FetchedDependency, FetchError> {
            Err(FetchError::new(name, version, "offline"))
        }
    }

    #[test]
    fn test_fetch_error_display() {
        let err = EmptyFetcher.fetch("lodash", "^4").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to fetch dependency 'lodash@^4': offline"
        );
    }
}

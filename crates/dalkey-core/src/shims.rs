//! Core-library shims.
//!
//! Node built-ins are meaningless inside the sandbox page; requests for
//! them redirect to a stub module whose code is `// empty`, unless the
//! manifest ships a real browser implementation for the name.

pub use crate::path::EMPTY_SHIM_PATH;

/// Canonical store path of the empty shim.
pub const EMPTY_SHIM_CANONICAL_PATH: &str = "/node_modules/empty/index.js";

/// Source of the empty shim module.
pub const EMPTY_SHIM_CODE: &str = "// empty";

/// Node built-in module names redirected to the empty shim.
const NODE_BUILTINS: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

/// Extra shimmed names that are not Node built-ins but show up in
/// dependency code and have no browser meaning.
const EXTRA_SHIMS: &[&str] = &["pnpapi", "yarnpnp"];

/// Whether a request names a shimmed core library.
#[must_use]
pub fn is_core_shim(request: &str) -> bool {
    let name = request.strip_prefix("node:").unwrap_or(request);
    NODE_BUILTINS.contains(&name) || EXTRA_SHIMS.contains(&name)
}

/// Shim target for a request: the empty-shim sentinel, or `None` when the
/// request is not shimmed.
#[must_use]
pub fn shim_target(request: &str) -> Option<&'static str> {
    is_core_shim(request).then_some(EMPTY_SHIM_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_shimmed() {
        assert!(is_core_shim("fs"));
        assert!(is_core_shim("child_process"));
        assert!(is_core_shim("node:path"));
    }

    #[test]
    fn test_regular_packages_are_not_shimmed() {
        assert!(!is_core_shim("react"));
        assert!(!is_core_shim("fs-extra"));
        assert!(!is_core_shim("./fs"));
    }

    #[test]
    fn test_shim_target_is_sentinel() {
        assert_eq!(shim_target("os"), Some(EMPTY_SHIM_PATH));
        assert_eq!(shim_target("lodash"), None);
    }
}

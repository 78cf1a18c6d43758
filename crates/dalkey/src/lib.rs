#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

//! In-browser bundling and evaluation engine for a sandboxed playground.
//!
//! Given a virtual file system of source modules plus a precomputed
//! dependency manifest, the [`Manager`] resolves inter-module references,
//! drives per-module transpilation through a pluggable preset, evaluates
//! the resulting CommonJS graph, and patches changed modules in place
//! (HMR). The transpile graph serializes to a browser-style key/value
//! store and restores across reloads when the engine version and
//! dependency set match.
//!
//! ```no_run
//! use dalkey::{EvaluateOptions, Manager, ManagerOptions};
//! use dalkey::test_utils::VanillaPreset;
//! use dalkey_core::Module;
//! use std::rc::Rc;
//!
//! let mut manager = Manager::new(
//!     "sandbox",
//!     Rc::new(VanillaPreset::new()),
//!     vec![
//!         Module::new("/index.js", "module.exports = require('./dep') + 1;"),
//!         Module::new("/dep.js", "module.exports = 41;"),
//!     ],
//!     &ManagerOptions::default(),
//!     None,
//! )
//! .unwrap();
//!
//! manager.transpile_modules("/index.js", false).unwrap();
//! let exports = manager
//!     .evaluate_module("/index.js", &EvaluateOptions::default())
//!     .unwrap();
//! assert_eq!(exports, serde_json::json!(42));
//! ```

pub mod bridge;
pub mod cache;
pub mod fetcher;
pub mod manager;
pub mod test_utils;

pub use bridge::{FileResolver, ProtocolFileResolver, StaticFileResolver};
pub use cache::{CacheStorage, MemoryCacheStorage, SerializedSandbox, SCRIPT_VERSION};
pub use fetcher::{DependencyFetcher, FetchError, FetchedDependency};
pub use manager::{EvaluateOptions, Manager, ManagerOptions, SerializeOptions, Stage};

pub use dalkey_core::{
    Dependency, Error, HmrState, HmrStatus, Manifest, ManifestContent, Module, Preset, Result,
};

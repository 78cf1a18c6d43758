#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

//! Core data model and logic of the dalkey sandbox engine.
//!
//! This crate is the pure layer: the virtual-FS module store, the
//! transpiled-module graph, Node-style resolution over the store and the
//! packager manifest, the preset/transpiler seam, HMR state, and the
//! serialized forms. It performs no I/O and embeds no JS engine; those
//! live in `dalkey-runtime` and the `dalkey` orchestrator.

pub mod config;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod manifest;
pub mod module;
pub mod path;
pub mod preset;
pub mod resolver;
pub mod scan;
pub mod shims;
pub mod store;

pub use error::{Error, Result};
pub use graph::{
    tm_hash, Compilation, SerializedTranspiledModule, TmRegistry, TranspiledModule,
    TranspiledSource,
};
pub use hmr::{HmrConfig, HmrState, HmrStatus, HmrStatusBroadcast};
pub use manifest::{CombinedMetas, Dependency, DependencyDependency, Manifest, ManifestContent};
pub use module::Module;
pub use preset::{
    EmittedModule, LoaderContext, LoaderEntry, Preset, Transpiler, TranspilerError,
    TranspilerOutput,
};
pub use resolver::{Resolver, ResolverHost};
pub use store::ModuleStore;

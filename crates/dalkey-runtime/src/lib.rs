#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! CommonJS evaluation engine for the dalkey sandbox, on deno_core.
//!
//! Transpiled modules are registered as factories keyed by hash;
//! evaluation is strictly synchronous and cycle-safe, matching CommonJS
//! partial-export semantics. `module.hot` calls and exports snapshots
//! cross back to the engine through ops.

mod runtime;

pub use runtime::{
    DefinedModule, EvalRuntime, EvalState, HmrEvent, RequireDelegate, RuntimeError,
};

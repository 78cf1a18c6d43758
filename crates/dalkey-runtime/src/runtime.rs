//! CommonJS evaluation on deno_core.
//!
//! The engine registers one factory per transpiled module, keyed by hash,
//! together with its request → hash map. Evaluation is strictly
//! synchronous: everything runs through `execute_script`, the require
//! fallback op consults an in-memory delegate only, and results cross the
//! boundary as JSON strings via ops, never as raw v8 handles.

use deno_core::error::AnyError;
use deno_core::{extension, op2, JsRuntime, OpState, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Bootstrap JavaScript installing the module registry and `require`.
const PRELUDE_JS: &str = include_str!("prelude.js");

/// Runtime error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("Runtime initialization failed: {0}")]
    Init(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Everything the JS side needs to register one module factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinedModule {
    pub hash: String,
    pub dirname: String,
    pub filename: String,
    /// Request string → dependency hash.
    pub require_map: std::collections::BTreeMap<String, String>,
    /// Transpiled CommonJS body.
    pub code: String,
}

/// `module.hot` intent reported by evaluated code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmrEvent {
    AcceptSelf { hash: String },
    AcceptDep { hash: String, dep: String },
    Decline { hash: String },
    Dispose { hash: String },
    Invalidate { hash: String },
}

/// Synchronous require fallback: resolve a request that was not in the
/// static require map. Implementations must not suspend; evaluation
/// never performs async I/O.
pub trait RequireDelegate {
    fn resolve_require(&self, from_hash: &str, request: &str) -> Result<DefinedModule, String>;
}

/// Shared state the ops write into.
#[derive(Default)]
pub struct EvalState {
    events: Vec<HmrEvent>,
    reported: Option<String>,
    delegate: Option<Rc<dyn RequireDelegate>>,
}

type SharedEvalState = Rc<RefCell<EvalState>>;

extension!(
    dalkey_sandbox,
    ops = [op_dalkey_hmr_event, op_dalkey_report, op_dalkey_resolve],
);

/// Record a `module.hot` call.
#[op2(fast)]
fn op_dalkey_hmr_event(
    state: &mut OpState,
    #[string] kind: &str,
    #[string] hash: &str,
    #[string] dep: &str,
) {
    let cell = state.borrow::<SharedEvalState>().clone();
    let event = match kind {
        "accept-self" => HmrEvent::AcceptSelf {
            hash: hash.to_string(),
        },
        "accept-dep" => HmrEvent::AcceptDep {
            hash: hash.to_string(),
            dep: dep.to_string(),
        },
        "decline" => HmrEvent::Decline {
            hash: hash.to_string(),
        },
        "dispose" => HmrEvent::Dispose {
            hash: hash.to_string(),
        },
        _ => HmrEvent::Invalidate {
            hash: hash.to_string(),
        },
    };
    cell.borrow_mut().events.push(event);
}

/// Store an exports snapshot (JSON) for the engine to pick up.
#[op2(fast)]
fn op_dalkey_report(state: &mut OpState, #[string] json: &str) {
    let cell = state.borrow::<SharedEvalState>().clone();
    cell.borrow_mut().reported = Some(json.to_string());
}

/// Resolve a request missing from the static require map through the
/// installed delegate. Returns the defined module as JSON.
#[op2]
#[string]
fn op_dalkey_resolve(
    state: &mut OpState,
    #[string] from_hash: &str,
    #[string] request: &str,
) -> Result<String, AnyError> {
    let cell = state.borrow::<SharedEvalState>().clone();
    let delegate = cell
        .borrow()
        .delegate
        .clone()
        .ok_or_else(|| AnyError::msg("no require delegate installed"))?;

    let defined = delegate
        .resolve_require(from_hash, request)
        .map_err(AnyError::msg)?;
    serde_json::to_string(&defined).map_err(|e| AnyError::msg(e.to_string()))
}

/// The evaluation engine: one `JsRuntime` owning the module registry.
pub struct EvalRuntime {
    js_runtime: JsRuntime,
    state: SharedEvalState,
}

impl EvalRuntime {
    /// Create a runtime with the CommonJS prelude installed.
    pub fn new() -> Result<Self, RuntimeError> {
        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![dalkey_sandbox::init_ops()],
            ..Default::default()
        });

        let state: SharedEvalState = Rc::new(RefCell::new(EvalState::default()));
        js_runtime.op_state().borrow_mut().put(Rc::clone(&state));

        js_runtime
            .execute_script("<dalkey:prelude>", PRELUDE_JS.to_string())
            .map_err(|e| RuntimeError::Init(format!("prelude failed: {e}")))?;

        Ok(Self { js_runtime, state })
    }

    /// Install (or clear) the synchronous require fallback.
    pub fn set_delegate(&mut self, delegate: Option<Rc<dyn RequireDelegate>>) {
        self.state.borrow_mut().delegate = delegate;
    }

    /// Register factories for a batch of modules. Re-defining a hash
    /// replaces its factory while keeping its dispose/accept bookkeeping.
    pub fn define_modules(&mut self, modules: &[DefinedModule]) -> Result<(), RuntimeError> {
        if modules.is_empty() {
            return Ok(());
        }
        let mut script = String::new();
        for module in modules {
            let map_json = serde_json::to_string(&module.require_map)
                .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
            script.push_str(&format!(
                "globalThis.__dalkey.define({hash}, {dirname}, {filename}, {map}, \
                 function (module, exports, require, __dirname, __filename) {{\n{code}\n}});\n",
                hash = js_string(&module.hash)?,
                dirname = js_string(&module.dirname)?,
                filename = js_string(&module.filename)?,
                map = js_string(&map_json)?,
                code = module.code,
            ));
        }
        debug!(count = modules.len(), "defining module factories");
        self.execute(&script)
    }

    /// Evaluate a module by hash. Errors carry the JS message and stack.
    pub fn evaluate(&mut self, hash: &str) -> Result<(), RuntimeError> {
        let script = format!("globalThis.__dalkey.evaluate({});", js_string(hash)?);
        self.execute(&script)
    }

    /// Run dispose handlers and drop the cached module instance so the
    /// next evaluate re-runs the factory.
    pub fn invalidate(&mut self, hash: &str) -> Result<(), RuntimeError> {
        let script = format!("globalThis.__dalkey.invalidate({});", js_string(hash)?);
        self.execute(&script)
    }

    /// Fire accept callbacks `parent` registered for `dep`.
    pub fn notify_accept(&mut self, parent: &str, dep: &str) -> Result<(), RuntimeError> {
        let script = format!(
            "globalThis.__dalkey.notifyAccept({}, {});",
            js_string(parent)?,
            js_string(dep)?
        );
        self.execute(&script)
    }

    /// Remove a module from the registry entirely.
    pub fn drop_module(&mut self, hash: &str) -> Result<(), RuntimeError> {
        let script = format!("globalThis.__dalkey.drop({});", js_string(hash)?);
        self.execute(&script)
    }

    /// Clear the registry (hard reload).
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        self.execute("globalThis.__dalkey.reset();")
    }

    /// JSON snapshot of a module's `module.exports`, or `None` when the
    /// module has not been evaluated. Circular or non-serializable exports
    /// snapshot as `Null`.
    pub fn exports_snapshot(
        &mut self,
        hash: &str,
    ) -> Result<Option<serde_json::Value>, RuntimeError> {
        #[derive(Deserialize)]
        struct Report {
            evaluated: bool,
            exports: serde_json::Value,
        }

        let script = format!("globalThis.__dalkey.report({});", js_string(hash)?);
        self.execute(&script)?;

        let reported = self.state.borrow_mut().reported.take();
        match reported {
            Some(json) => {
                let report: Report = serde_json::from_str(&json)
                    .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
                Ok(report.evaluated.then_some(report.exports))
            }
            None => Ok(None),
        }
    }

    /// Take the `module.hot` events recorded since the last drain.
    pub fn drain_hmr_events(&mut self) -> Vec<HmrEvent> {
        std::mem::take(&mut self.state.borrow_mut().events)
    }

    /// Execute a raw script in the runtime's context.
    pub fn execute(&mut self, code: &str) -> Result<(), RuntimeError> {
        self.js_runtime
            .execute_script("<dalkey>", code.to_string())
            .map(|_| ())
            .map_err(|e| RuntimeError::JavaScript(e.to_string()))
    }
}

fn js_string(value: &str) -> Result<String, RuntimeError> {
    serde_json::to_string(value).map_err(|e| RuntimeError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn defined(hash: &str, code: &str, deps: &[(&str, &str)]) -> DefinedModule {
        DefinedModule {
            hash: hash.to_string(),
            dirname: "/".to_string(),
            filename: format!("/{hash}.js"),
            require_map: deps
                .iter()
                .map(|(req, target)| ((*req).to_string(), (*target).to_string()))
                .collect::<BTreeMap<_, _>>(),
            code: code.to_string(),
        }
    }

    #[test]
    fn test_evaluate_and_report_exports() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined("a", "module.exports = 40 + 2;", &[])])
            .unwrap();
        runtime.evaluate("a").unwrap();
        assert_eq!(runtime.exports_snapshot("a").unwrap().unwrap(), serde_json::json!(42));
    }

    #[test]
    fn test_require_walks_the_map() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[
                defined("dep", "module.exports = 41;", &[]),
                defined("entry", "module.exports = require('./dep') + 1;", &[("./dep", "dep")]),
            ])
            .unwrap();
        runtime.evaluate("entry").unwrap();
        assert_eq!(runtime.exports_snapshot("entry").unwrap().unwrap(), serde_json::json!(42));
    }

    #[test]
    fn test_cycle_returns_partial_exports() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[
                defined(
                    "a",
                    "const b = require('./b'); module.exports.b = b; module.exports.v = 1;",
                    &[("./b", "b")],
                ),
                defined(
                    "b",
                    "const a = require('./a'); module.exports.a = a; module.exports.v = 2;",
                    &[("./a", "a")],
                ),
            ])
            .unwrap();
        runtime.evaluate("a").unwrap();

        // b captured a's partial exports object mid-cycle; a then filled
        // the same object in, so identity holds through the cycle.
        runtime
            .execute(
                "const a = globalThis.__dalkey.evaluate('a');\
                 if (a.v !== 1) throw new Error('a.v');\
                 if (a.b.v !== 2) throw new Error('a.b.v');\
                 if (a.b.a !== a) throw new Error('identity');",
            )
            .unwrap();
    }

    #[test]
    fn test_cycle_with_exports_replacement_sees_partial_object() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[
                defined(
                    "a",
                    "const b = require('./b'); module.exports = { b, v: 1 };",
                    &[("./b", "b")],
                ),
                defined(
                    "b",
                    "const a = require('./a'); module.exports = { a, v: 2 };",
                    &[("./a", "a")],
                ),
            ])
            .unwrap();
        runtime.evaluate("a").unwrap();

        // Replacing module.exports after the cycle closed means b keeps
        // the pre-replacement partial object, exactly as CommonJS does.
        runtime
            .execute(
                "const a = globalThis.__dalkey.evaluate('a');\
                 if (a.v !== 1) throw new Error('a.v');\
                 if (a.b.v !== 2) throw new Error('a.b.v');\
                 if (a.b.a === a) throw new Error('partial object expected');\
                 if (Object.keys(a.b.a).length !== 0) throw new Error('partial should be empty');",
            )
            .unwrap();
    }

    #[test]
    fn test_cached_exports_are_reused() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined(
                "counter",
                "globalThis.__count = (globalThis.__count || 0) + 1; module.exports = globalThis.__count;",
                &[],
            )])
            .unwrap();
        runtime.evaluate("counter").unwrap();
        runtime.evaluate("counter").unwrap();
        assert_eq!(runtime.exports_snapshot("counter").unwrap().unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_invalidate_reruns_factory() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined(
                "counter",
                "globalThis.__n = (globalThis.__n || 0) + 1; module.exports = globalThis.__n;",
                &[],
            )])
            .unwrap();
        runtime.evaluate("counter").unwrap();
        runtime.invalidate("counter").unwrap();
        runtime.evaluate("counter").unwrap();
        assert_eq!(runtime.exports_snapshot("counter").unwrap().unwrap(), serde_json::json!(2));
    }

    #[test]
    fn test_hmr_events_are_drained() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined("hot", "module.hot.accept(); module.exports = 1;", &[])])
            .unwrap();
        runtime.evaluate("hot").unwrap();

        let events = runtime.drain_hmr_events();
        assert_eq!(
            events,
            vec![HmrEvent::AcceptSelf {
                hash: "hot".to_string()
            }]
        );
        assert!(runtime.drain_hmr_events().is_empty());
    }

    #[test]
    fn test_evaluation_error_propagates() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined("boom", "throw new Error('kaboom');", &[])])
            .unwrap();
        let err = runtime.evaluate("boom").unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    struct StaticDelegate;

    impl RequireDelegate for StaticDelegate {
        fn resolve_require(&self, _from: &str, request: &str) -> Result<DefinedModule, String> {
            if request == "./late" {
                Ok(DefinedModule {
                    hash: "late".to_string(),
                    dirname: "/".to_string(),
                    filename: "/late.js".to_string(),
                    require_map: BTreeMap::new(),
                    code: "module.exports = 'late-bound';".to_string(),
                })
            } else {
                Err(format!("Cannot find module '{request}'"))
            }
        }
    }

    #[test]
    fn test_resolve_fallback_through_delegate() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime.set_delegate(Some(Rc::new(StaticDelegate)));
        runtime
            .define_modules(&[defined("entry", "module.exports = require('./late');", &[])])
            .unwrap();
        runtime.evaluate("entry").unwrap();
        assert_eq!(
            runtime.exports_snapshot("entry").unwrap().unwrap(),
            serde_json::json!("late-bound")
        );
    }

    #[test]
    fn test_missing_module_without_delegate_errors() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined("entry", "require('./ghost');", &[])])
            .unwrap();
        assert!(runtime.evaluate("entry").is_err());
    }

    #[test]
    fn test_dispose_handler_data_carries_over() {
        let mut runtime = EvalRuntime::new().unwrap();
        runtime
            .define_modules(&[defined(
                "stateful",
                "module.hot.dispose((data) => { data.kept = 7; });\
                 module.exports = module.hot.data ? module.hot.data.kept : 0;",
                &[],
            )])
            .unwrap();
        runtime.evaluate("stateful").unwrap();
        assert_eq!(runtime.exports_snapshot("stateful").unwrap().unwrap(), serde_json::json!(0));

        runtime.invalidate("stateful").unwrap();
        runtime.evaluate("stateful").unwrap();
        assert_eq!(runtime.exports_snapshot("stateful").unwrap().unwrap(), serde_json::json!(7));
    }
}

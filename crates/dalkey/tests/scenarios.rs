//! End-to-end engine scenarios: transpile → evaluate round trips, HMR
//! cycles, dependency aliasing, cache persistence, and host fallbacks.

use dalkey::test_utils::VanillaPreset;
use dalkey::{
    DependencyFetcher, EvaluateOptions, FetchError, FetchedDependency, Manager, ManagerOptions,
    SerializeOptions, StaticFileResolver,
};
use dalkey_core::{Dependency, Error, HmrStatus, Manifest, ManifestContent, Module};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

fn manager_with(modules: Vec<Module>) -> Manager {
    Manager::new(
        "scenarios",
        Rc::new(VanillaPreset::new()),
        modules,
        &ManagerOptions::default(),
        None,
    )
    .unwrap()
}

#[test]
fn fresh_transpile_and_evaluate() {
    let mut manager = manager_with(vec![
        Module::new("/index.js", "module.exports = require('./dep') + 1;"),
        Module::new("/dep.js", "module.exports = 41;"),
    ]);

    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(42));
}

#[test]
fn repeated_evaluate_returns_cached_exports() {
    let mut manager = manager_with(vec![Module::new(
        "/index.js",
        "globalThis.__runs = (globalThis.__runs || 0) + 1; module.exports = globalThis.__runs;",
    )]);

    manager.transpile_modules("/index.js", false).unwrap();
    let first = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    let second = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(first, serde_json::json!(1));
    assert_eq!(second, serde_json::json!(1));

    let forced = manager
        .evaluate_module(
            "/index.js",
            &EvaluateOptions {
                force: true,
                ..EvaluateOptions::default()
            },
        )
        .unwrap();
    assert_eq!(forced, serde_json::json!(2));
}

#[test]
fn dependency_alias_rewrites_version_split_requests() {
    let mut manifest = Manifest {
        dependencies: vec![Dependency {
            name: "react".to_string(),
            version: "17".to_string(),
        }],
        ..Manifest::default()
    };
    let mut aliases = FxHashMap::default();
    aliases.insert("react".to_string(), "react/17.0.0".to_string());
    manifest
        .dependency_aliases
        .insert("react-dom".to_string(), aliases);
    manifest.contents.insert(
        "/node_modules/react/17.0.0/index.js".to_string(),
        ManifestContent {
            content: "module.exports = 'react-17';".to_string(),
            requires: Vec::new(),
        },
    );

    let mut manager = manager_with(Vec::new());
    manager.set_manifest(manifest);

    let resolved = manager
        .resolve("react", "/node_modules/react-dom/index.js")
        .unwrap();
    assert!(resolved.starts_with("/node_modules/react/17.0.0/"));
}

#[test]
fn hmr_accept_applies_update_without_hard_reload() {
    let mut manager = manager_with(vec![
        Module::new("/index.js", "module.exports = require('./dep') + 1;"),
        Module::new(
            "/dep.js",
            "module.exports = 41; if (module.hot) { module.hot.accept(); }",
        ),
    ]);

    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(42));

    let statuses = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&statuses);
    manager.add_hmr_listener(Box::new(move |status| sink.borrow_mut().push(status)));

    manager
        .update_data(vec![
            Module::new("/index.js", "module.exports = require('./dep') + 1;"),
            Module::new(
                "/dep.js",
                "module.exports = 100; if (module.hot) { module.hot.accept(); }",
            ),
        ])
        .unwrap();

    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(101));
    assert_eq!(manager.hard_reload_count(), 0);
    assert_eq!(
        *statuses.borrow(),
        vec![HmrStatus::Check, HmrStatus::Apply, HmrStatus::Idle]
    );
}

#[test]
fn dirty_declined_module_forces_hard_reload() {
    let mut manager = manager_with(vec![
        Module::new("/index.js", "module.exports = require('./dep');"),
        Module::new(
            "/dep.js",
            "module.exports = 1; if (module.hot) { module.hot.decline(); }",
        ),
    ]);

    manager.transpile_modules("/index.js", false).unwrap();
    manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();

    manager
        .update_data(vec![
            Module::new("/index.js", "module.exports = require('./dep');"),
            Module::new(
                "/dep.js",
                "module.exports = 2; if (module.hot) { module.hot.decline(); }",
            ),
        ])
        .unwrap();

    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(2));
    assert_eq!(manager.hard_reload_count(), 1);
}

#[test]
fn cycle_yields_partial_exports_with_identity() {
    let mut manager = manager_with(vec![
        Module::new(
            "/a.js",
            "const b = require('./b'); module.exports.b = b; module.exports.v = 1;",
        ),
        Module::new(
            "/b.js",
            "const a = require('./a'); module.exports.a = a; module.exports.v = 2;",
        ),
        Module::new(
            "/probe.js",
            "const a = require('./a');\
             module.exports = a.v === 1 && a.b.v === 2 && a.b.a === a;",
        ),
    ]);

    manager.transpile_modules("/probe.js", false).unwrap();
    let exports = manager
        .evaluate_module("/probe.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(true));
}

#[test]
fn cycle_with_exports_replacement_yields_defined_exports() {
    let mut manager = manager_with(vec![
        Module::new(
            "/a.js",
            "const b = require('./b'); module.exports = { b, v: 1 };",
        ),
        Module::new(
            "/b.js",
            "const a = require('./a'); module.exports = { a, v: 2 };",
        ),
        Module::new(
            "/probe.js",
            "const a = require('./a');\
             module.exports = a.v === 1 && a.b.v === 2 && typeof a.b.a === 'object';",
        ),
    ]);

    manager.transpile_modules("/probe.js", false).unwrap();
    let exports = manager
        .evaluate_module("/probe.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(true));
}

#[test]
fn serialize_load_round_trips_the_graph() {
    let mut manager = manager_with(vec![
        Module::new("/index.js", "module.exports = require('./dep') + 1;"),
        Module::new("/dep.js", "module.exports = 41;"),
    ]);
    manager.transpile_modules("/index.js", false).unwrap();

    let record = manager.serialize(&SerializeOptions {
        entry_path: Some("/index.js".to_string()),
        optimize_for_size: false,
    });

    let mut restored = manager_with(vec![
        Module::new("/index.js", "module.exports = require('./dep') + 1;"),
        Module::new("/dep.js", "module.exports = 41;"),
    ]);
    assert!(restored.load(&record));

    // Structurally isomorphic: re-serializing yields the same graph.
    let record_again = restored.serialize(&SerializeOptions {
        entry_path: Some("/index.js".to_string()),
        optimize_for_size: false,
    });
    assert_eq!(record.transpiled_modules.len(), record_again.transpiled_modules.len());
    for (a, b) in record
        .transpiled_modules
        .iter()
        .zip(&record_again.transpiled_modules)
    {
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.dependencies, b.dependencies);
        assert_eq!(a.initiators, b.initiators);
        assert_eq!(a.source, b.source);
    }
    assert_eq!(record.cached_paths, record_again.cached_paths);

    // The restored graph evaluates without a fresh transpile pass.
    let exports = restored
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(42));
}

#[test]
fn cache_with_changed_dependency_set_is_discarded_silently() {
    let manifest_17 = Manifest {
        dependencies: vec![Dependency {
            name: "react".to_string(),
            version: "17.0.2".to_string(),
        }],
        ..Manifest::default()
    };
    let manifest_18 = Manifest {
        dependencies: vec![Dependency {
            name: "react".to_string(),
            version: "18.2.0".to_string(),
        }],
        ..Manifest::default()
    };

    let mut manager = manager_with(vec![Module::new("/index.js", "module.exports = 1;")]);
    manager.set_manifest(manifest_17);
    manager.transpile_modules("/index.js", false).unwrap();
    let record = manager.serialize(&SerializeOptions::default());

    let mut other = manager_with(vec![Module::new("/index.js", "module.exports = 1;")]);
    other.set_manifest(manifest_18);
    assert!(!other.load(&record));
    assert_eq!(other.registry_len(), 0);
}

struct LodashFetcher;

impl DependencyFetcher for LodashFetcher {
    fn fetch(&self, name: &str, _version: &str) -> Result<FetchedDependency, FetchError> {
        assert_eq!(name, "lodash");
        Ok(FetchedDependency {
            modules: vec![Module::new(
                "/node_modules/lodash/index.js",
                "module.exports = 'lodash-value';",
            )],
            metas: vec!["/node_modules/lodash/index.js".to_string()],
        })
    }
}

#[test]
fn missing_dependency_is_fetched_and_retried() {
    let mut manager = manager_with(vec![Module::new(
        "/index.js",
        "module.exports = require('lodash');",
    )]);
    manager.set_manifest(Manifest {
        dependencies: vec![Dependency {
            name: "lodash".to_string(),
            version: "^4.17.21".to_string(),
        }],
        ..Manifest::default()
    });
    manager.set_dependency_fetcher(Rc::new(LodashFetcher));

    // The synchronous resolver alone fails; the fetching sibling
    // populates the store and retries.
    let resolved = manager.resolve_fetching("lodash", "/index.js").unwrap();
    assert_eq!(resolved, "/node_modules/lodash/index.js");

    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!("lodash-value"));
}

#[test]
fn node_builtins_evaluate_to_the_empty_shim() {
    let mut manager = manager_with(vec![Module::new(
        "/index.js",
        "module.exports = typeof require('fs');",
    )]);
    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!("object"));
}

#[test]
fn json_modules_evaluate_to_their_value() {
    let mut manager = manager_with(vec![
        Module::new("/index.js", "module.exports = require('./data.json').answer;"),
        Module::new("/data.json", r#"{"answer": 42}"#),
    ]);
    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!(42));
}

#[test]
fn ignored_extensions_evaluate_to_raw_content() {
    let mut manager = Manager::new(
        "assets",
        Rc::new(VanillaPreset::new().with_ignored_extension(".css")),
        vec![
            Module::new("/index.js", "module.exports = require('./styles.css');"),
            Module::new("/styles.css", "body { margin: 0; }"),
        ],
        &ManagerOptions::default(),
        None,
    )
    .unwrap();

    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!("body { margin: 0; }"));
}

#[test]
fn file_resolver_bridge_supplies_missing_files() {
    let mut manager = manager_with(vec![Module::new(
        "/index.js",
        "module.exports = require('./host-only');",
    )]);
    manager.set_file_resolver(Rc::new(StaticFileResolver::new([(
        "/host-only.js".to_string(),
        "module.exports = 'from-host';".to_string(),
    )])));

    manager.transpile_modules("/index.js", false).unwrap();
    let exports = manager
        .evaluate_module("/index.js", &EvaluateOptions::default())
        .unwrap();
    assert_eq!(exports, serde_json::json!("from-host"));
}

#[test]
fn read_file_sync_without_any_source_is_enoent() {
    let mut manager = manager_with(Vec::new());
    let err = manager.read_file_sync("/ghost.js").unwrap_err();
    assert!(matches!(err, Error::Enoent { .. }));
}

#[test]
fn unknown_relative_request_raises_module_not_found() {
    let mut manager = manager_with(vec![Module::new(
        "/index.js",
        "module.exports = require('./missing');",
    )]);
    let err = manager.transpile_modules("/index.js", false).unwrap_err();
    assert!(matches!(
        err,
        Error::ModuleNotFound {
            is_dependency: false,
            ..
        }
    ));

    let entry = manager.transpiled_module("/index.js", "").unwrap();
    assert!(!entry.errors.is_empty());
    assert!(entry.should_transpile());
}

#[test]
fn transpiled_dependency_hashes_all_exist() {
    let mut manager = manager_with(vec![
        Module::new("/index.js", "require('./a'); require('./b');"),
        Module::new("/a.js", "require('./b');"),
        Module::new("/b.js", "module.exports = 2;"),
    ]);
    manager.transpile_modules("/index.js", false).unwrap();

    for path in ["/index.js", "/a.js", "/b.js"] {
        let tm = manager.transpiled_module(path, "").unwrap();
        assert!(tm.source.is_some());
        for dep in &tm.dependencies {
            assert!(
                manager
                    .transpiled_module_by_hash_exists(dep),
                "dependency hash missing from registry"
            );
        }
    }
}

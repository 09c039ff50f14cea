//! Integration tests for analysis, extraction and bundling over whole projects.

mod common;

use std::fs;

use common::{delivery, target, ScriptedExecutor, GRADING_PROJECT};
use verifier_bundle::{
    read_archive, BundleError, Bundler, BundlerConfig, CallArgs, ProjectIndex,
    RequestKind, VerifierDefinition,
};

fn grading_definition() -> VerifierDefinition {
    let (_, checks) = GRADING_PROJECT
        .iter()
        .find(|(path, _)| *path == "grading/checks.py")
        .unwrap();
    VerifierDefinition::builder("check", *checks)
        .module("grading.checks")
        .build()
}

/// Test: a verifier with only an external requirement ships no local code.
#[tokio::test]
async fn test_external_only_verifier() {
    let executor = ScriptedExecutor::new();
    let target = target("env-a", &executor);
    let cache = delivery(ProjectIndex::empty());
    let def = VerifierDefinition::builder(
        "f",
        "def f(env, values):\n    import numpy as np\n    return float(np.mean(values))\n",
    )
    .requirement("numpy")
    .build();

    let bundle = cache.bundler().bundle(&def).await.unwrap();
    assert_eq!(bundle.requirements, vec!["numpy", "fleet-python"]);
    assert!(bundle.tree.files.is_empty());

    cache
        .deliver(&def, &target, CallArgs::new().arg(serde_json::json!([1, 2, 3])))
        .await
        .unwrap();
    let sent = executor.requests();
    let files = sent[0].files.as_ref().unwrap();
    let names: Vec<&str> = files.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["manifest.json", "requirements.txt", "verifier.py"]);
    assert_eq!(files["requirements.txt"], "numpy\nfleet-python\n");
}

/// Test: a chain A → B → C across modules is shipped, the unused sibling is not.
#[test]
fn test_closure_ships_chain_only() {
    let project = ProjectIndex::from_sources(GRADING_PROJECT.iter().copied()).unwrap();
    let bundler = Bundler::new(project, BundlerConfig::default());
    let def = grading_definition();

    let closure = bundler.analyze(&def).unwrap();
    assert!(closure.contains_symbol("grading.helpers.chain:a"));
    assert!(closure.contains_symbol("grading.helpers.chain:b"));
    assert!(closure.contains_symbol("grading.helpers.leaf:c"));
    assert!(!closure.contains_symbol("grading.helpers.chain:d"));

    let bundle = bundler.assemble(&def).unwrap();
    let files = read_archive(bundle.archive()).unwrap();
    let names: Vec<&str> = files.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec![
            "grading/__init__.py",
            "grading/helpers/__init__.py",
            "grading/helpers/chain.py",
            "grading/helpers/leaf.py",
            "manifest.json",
            "requirements.txt",
            "verifier.py",
        ]
    );
    let chain = &files["grading/helpers/chain.py"];
    assert!(chain.contains("def a(x):"));
    assert!(chain.contains("def b(x):"));
    assert!(!chain.contains("def d(x):"));
    assert!(files["verifier.py"].contains("from grading.helpers.chain import a"));
    // the verifier's own module is not shipped
    assert!(!files.contains_key("grading/checks.py"));
}

/// Test: an unresolvable name fails analysis and builds nothing.
#[tokio::test]
async fn test_unresolved_reference_produces_no_bundle() {
    let project = ProjectIndex::from_sources([(
        "tasks/verify.py",
        "def verify(env):\n    return helper_function_four(env)\n",
    )])
    .unwrap();
    let bundler = Bundler::new(project, BundlerConfig::default());
    let def = VerifierDefinition::builder("verify", "def verify(env):\n    return helper_function_four(env)\n")
        .module("tasks.verify")
        .build();

    match bundler.bundle(&def).await {
        Err(BundleError::UnresolvedReference { name, .. }) => {
            assert_eq!(name, "helper_function_four")
        }
        other => panic!("expected an unresolved reference, got {other:?}"),
    }
    assert!(bundler.cache().is_empty());
}

/// Test: a project discovered on disk from one of its files.
#[tokio::test]
async fn test_on_disk_project() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("pyproject.toml"), "[project]\nname = \"grading\"\n").unwrap();
    for (path, source) in GRADING_PROJECT {
        let file = root.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, source).unwrap();
    }
    fs::create_dir_all(root.join("grading/__pycache__")).unwrap();
    fs::write(root.join("grading/__pycache__/stale.py"), "def broken(:\n").unwrap();

    let project = ProjectIndex::discover(root.join("grading/checks.py")).unwrap();
    assert_eq!(project.root(), Some(root));
    assert_eq!(project.len(), GRADING_PROJECT.len());

    let executor = ScriptedExecutor::new();
    let target = target("env-disk", &executor);
    let cache = delivery(project);
    let def = grading_definition();

    let outcome = cache.deliver(&def, &target, CallArgs::new()).await.unwrap();
    assert_eq!(outcome.kind, RequestKind::FullBundle);
    let sent = executor.requests();
    let files = sent[0].files.as_ref().unwrap();
    assert!(files.contains_key("grading/helpers/leaf.py"));
}

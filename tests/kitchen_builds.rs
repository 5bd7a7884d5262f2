// tests/kitchen_builds.rs

//! End-to-end kitchen builds running on the host.

#![cfg(unix)]

mod common;

use bake::commands::resolve_target;
use bake::packager::artifact;
use bake::recipe::Target;
use bake::{Error, Kitchen};
use common::{Fixture, counting_step};
use std::fs;

fn greeter(steps: &str) -> String {
    format!(
        "recipes:
  - name: greeter
    path: .
    steps:
{steps}
packs:
  - name: greeter
    type: application
"
    )
}

fn greet_step() -> String {
    counting_step("greet", &[], "echo hi > \"$CHEF_INSTALL_DIR/greet\"")
}

#[test]
fn test_trivial_build_then_noop() {
    let fixture = Fixture::new(&greeter(&greet_step()));
    let kitchen = fixture.kitchen();

    fixture.run(&kitchen).unwrap();
    assert_eq!(fixture.runs("greet"), 1);
    assert_eq!(
        fs::read_to_string(kitchen.layout().install().join("greet")).unwrap(),
        "hi\n"
    );

    let out = fixture.dir.path().join("out");
    let packs = kitchen.pack(None, Some(&out)).unwrap();
    assert_eq!(packs.len(), 1);
    let unpacked = fixture.dir.path().join("unpacked");
    let manifest = artifact::extract(&packs[0], &unpacked, &[]).unwrap();
    assert_eq!(manifest.name, "greeter");
    assert_eq!(fs::read_to_string(unpacked.join("greet")).unwrap(), "hi\n");

    // Everything is cached
    fixture.run(&kitchen).unwrap();
    assert_eq!(fixture.runs("greet"), 1);

    // A reopened kitchen sees the same state
    let reopened = fixture.kitchen();
    fixture.run(&reopened).unwrap();
    assert_eq!(fixture.runs("greet"), 1);
}

#[test]
fn test_clean_reruns_dependents() {
    let steps = format!(
        "{}{}",
        counting_step("generate", &[], ""),
        counting_step("build", &["generate"], "")
    );
    let fixture = Fixture::new(&greeter(&steps));
    let kitchen = fixture.kitchen();

    fixture.run(&kitchen).unwrap();
    assert_eq!((fixture.runs("generate"), fixture.runs("build")), (1, 1));

    kitchen.clean(Some("generate")).unwrap();
    let cache = kitchen.cache().unwrap();
    assert!(!cache.is_step_complete("greeter", "generate"));
    assert!(!cache.is_step_complete("greeter", "build"));
    drop(cache);

    fixture.run(&kitchen).unwrap();
    assert_eq!((fixture.runs("generate"), fixture.runs("build")), (2, 2));

    // Cleaning the dependent alone leaves its dependency cached
    kitchen.clean(Some("build")).unwrap();
    fixture.run(&kitchen).unwrap();
    assert_eq!((fixture.runs("generate"), fixture.runs("build")), (2, 3));
}

#[test]
fn test_failed_step_is_retried() {
    let steps = format!(
        "{}{}",
        counting_step("first", &[], ""),
        counting_step("second", &[], "test -f \"$CHEF_PROJECT_DIR/go\"")
    );
    let fixture = Fixture::new(&greeter(&steps));
    let kitchen = fixture.kitchen();

    let err = fixture.run(&kitchen).unwrap_err();
    assert!(matches!(err, Error::StepFailed { .. }), "{err}");
    let log = fs::read_to_string(kitchen.layout().log_file()).unwrap();
    assert!(log.contains("=== greeter/second ==="));
    assert!(log.contains("error:"));

    fs::write(fixture.project_dir().join("go"), "").unwrap();
    fixture.run(&kitchen).unwrap();
    assert_eq!((fixture.runs("first"), fixture.runs("second")), (1, 2));
}

#[test]
fn test_pack_is_reproducible_across_kitchens() {
    let fixture = Fixture::new(&greeter(&greet_step()));
    let build = |out: &str| {
        let kitchen = fixture.kitchen();
        fixture.run(&kitchen).unwrap();
        let packs = kitchen.pack(None, Some(&fixture.dir.path().join(out))).unwrap();
        fs::read(&packs[0]).unwrap()
    };

    let first = build("first");
    bake::kitchen::layout::purge(&fixture.kitchen_dir()).unwrap();
    let second = build("second");
    assert_eq!(fixture.runs("greet"), 2);
    assert_eq!(first, second);
}

#[test]
fn test_cross_compile_selection() {
    let fixture = Fixture::new(&format!(
        "platforms:
  - name: linux
    architectures: [amd64, arm64]

{}",
        greeter(&greet_step())
    ));
    let recipe = fixture.recipe();

    let target = resolve_target(&recipe, Some("linux/arm64")).unwrap();
    assert_eq!(
        target,
        Target {
            platform: "linux".to_string(),
            arch: "arm64".to_string(),
        }
    );

    let err = resolve_target(&recipe, Some("linux/x86")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnsupportedTarget { .. })
    ));

    let err = resolve_target(&recipe, Some("windows/amd64")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnsupportedTarget { .. })
    ));

    let kitchen = Kitchen::open(&fixture.recipe_path, recipe, target, fixture.options()).unwrap();
    assert_eq!(kitchen.target().arch, "arm64");
    assert!(kitchen.target().is_cross() || bake::recipe::model::host_arch() == "arm64");
}

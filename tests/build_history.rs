// tests/build_history.rs

//! `bake run` records every build in the state store.

#![cfg(unix)]

mod common;

use bake::cli::Cli;
use bake::commands::{RunOverrides, Session, cmd_run};
use bake::store::{LogLevel, TransactionStatus, TransactionType};
use bake::{BakeConfig, CancelToken, Store};
use clap::Parser;
use common::{Fixture, counting_step};

fn recipe(steps: &str) -> String {
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

fn session(fixture: &Fixture) -> Session {
    let root = fixture.dir.path();
    let config = BakeConfig {
        kitchen_dir: Some(fixture.kitchen_dir()),
        store_dir: Some(root.join("store")),
        state_db: Some(root.join("state").join("state.db")),
        signing_key: Some(root.join("signing.key")),
        confined: false,
        ..Default::default()
    };
    let recipe = fixture.recipe_path.to_string_lossy().to_string();
    let cli = Cli::try_parse_from(["bake", "--recipe", recipe.as_str(), "run"]).unwrap();
    Session::new(config, &cli, CancelToken::new())
}

fn run_and_pack(session: &Session) -> anyhow::Result<()> {
    cmd_run(
        session,
        RunOverrides {
            pack: true,
            ..Default::default()
        },
    )
}

#[test]
fn test_run_records_build_transaction() {
    let fixture = Fixture::new(&recipe(&counting_step(
        "greet",
        &[],
        "echo hi > \"$CHEF_INSTALL_DIR/greet\"",
    )));
    let session = session(&fixture);
    run_and_pack(&session).unwrap();

    let store = Store::open(&session.config.state_db()).unwrap();
    {
        let guard = store.lock();
        let transactions = guard.transactions();
        assert_eq!(transactions.len(), 1);
        let tx = &transactions[0];
        assert_eq!(tx.transaction_type, TransactionType::Build);
        assert_eq!(tx.state, TransactionStatus::Completed);
        assert_eq!(tx.name, "greeter");
        assert!(tx.completed_at.is_some());

        let messages: Vec<&str> = guard
            .transaction_logs(tx.id)
            .iter()
            .map(|l| l.message.as_str())
            .collect();
        assert!(messages.iter().any(|m| m.ends_with("greet completed")));
        assert!(messages.contains(&"packed greeter revision 1"));

        let app = guard.application("greeter").unwrap();
        let revision = app.latest_revision().unwrap();
        assert_eq!(revision.revision, 1);
        assert_eq!(revision.channel, "devel");
        assert_eq!((revision.major, revision.minor, revision.patch), (1, 0, 0));
        assert!(revision.size > 0);

        let states = guard.transaction_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].transaction_id, tx.id);
        assert_eq!(states[0].revision, 1);
    }
    drop(store);

    // Cached rebuild still records a transaction and a new revision
    run_and_pack(&session).unwrap();
    assert_eq!(fixture.runs("greet"), 1);
    let store = Store::open(&session.config.state_db()).unwrap();
    let guard = store.lock();
    assert_eq!(guard.transactions().len(), 2);
    assert!(
        guard
            .transactions()
            .iter()
            .all(|t| t.state == TransactionStatus::Completed)
    );
    let app = guard.application("greeter").unwrap();
    assert_eq!(app.revisions.len(), 2);
    assert_eq!(app.latest_revision().unwrap().revision, 2);
}

#[test]
fn test_failed_run_marks_transaction_failed() {
    let fixture = Fixture::new(&recipe(&counting_step("broken", &[], "exit 3")));
    let session = session(&fixture);
    assert!(run_and_pack(&session).is_err());

    let store = Store::open(&session.config.state_db()).unwrap();
    let guard = store.lock();
    let transactions = guard.transactions();
    assert_eq!(transactions.len(), 1);
    let tx = &transactions[0];
    assert_eq!(tx.state, TransactionStatus::Failed);

    let logs = guard.transaction_logs(tx.id);
    assert!(
        logs.iter()
            .any(|l| l.level == LogLevel::Error && l.message.ends_with("broken failed"))
    );
    let last = logs.last().unwrap();
    assert_eq!(last.level, LogLevel::Error);
    assert!(last.message.starts_with("Failed to build greeter"));
    assert!(guard.application("greeter").is_none());
}

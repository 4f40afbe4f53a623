//! Exercises `convert::run` itself end to end, rather than hand-wiring
//! `retrieve_stream` + `planner::plan` + `Engine` the way the other
//! integration tests do. These are the only tests that actually drive the
//! state-layer seeding, `state/last` rewrite, and bootstrap reconciliation
//! together, since those only ever run inside `convert::run`.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use accurev2git::model::{ElementChange, Transaction, TransactionKind, TxId};
use accurev2git::refs::visible_branch;
use accurev2git::target::TargetStore;
use accurev2git::testing::ScriptedSource;
use chrono::{DateTime, Utc};

fn tx(id: i64, kind: TransactionKind, paths: &[&str]) -> Transaction {
    Transaction {
        id: TxId(id),
        kind,
        author: "jdoe".to_string(),
        timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + id, 0).unwrap(),
        message: format!("tx {id}"),
        from_stream: None,
        to_stream: None,
        elements: paths.iter().map(|p| ElementChange { path: p.to_string() }).collect(),
    }
}

fn scripted_source() -> Arc<ScriptedSource> {
    let source = ScriptedSource::new()
        .with_streams(TxId(1), vec![common::stream(1, "Main", None)])
        .with_streams(TxId(2), vec![common::stream(1, "Main", None)])
        .with_hist(TxId(1), tx(1, TransactionKind::MkStream, &["a.txt"]))
        .with_hist(TxId(2), tx(2, TransactionKind::Keep, &["a.txt"]))
        .with_diff(TxId(1), TxId(2), vec!["a.txt".to_string()])
        .with_pop_contents(TxId(1), vec![("a.txt", "v1")])
        .with_pop_contents(TxId(2), vec![("a.txt", "v2")]);
    Arc::new(source)
}

#[tokio::test]
async fn running_twice_against_the_same_target_reproduces_identical_tips() {
    let target = common::target();
    let source = scripted_source();
    let config = common::config(&["Main"], 1, 2);
    let main_branch = visible_branch("Main");

    let work_root_1 = tempfile::tempdir().unwrap();
    let stop = AtomicBool::new(false);
    accurev2git::convert::run(&source, &target, &config, work_root_1.path(), &stop)
        .await
        .unwrap();
    let tip_after_first_run = target.read_ref(&main_branch).await.unwrap();
    assert!(tip_after_first_run.is_some(), "first run must have created the visible branch");

    let work_root_2 = tempfile::tempdir().unwrap();
    let stop = AtomicBool::new(false);
    accurev2git::convert::run(&source, &target, &config, work_root_2.path(), &stop)
        .await
        .unwrap();
    let tip_after_second_run = target.read_ref(&main_branch).await.unwrap();

    assert_eq!(
        tip_after_first_run, tip_after_second_run,
        "running the same conversion twice against the same target must reproduce the same ref hash, \
         not recompute a different chain from the final tip"
    );
}

#[tokio::test]
async fn resuming_after_new_transactions_leaves_the_already_processed_prefix_untouched() {
    let target = common::target();
    let source = scripted_source();
    let main_branch = visible_branch("Main");

    let work_root_1 = tempfile::tempdir().unwrap();
    let stop = AtomicBool::new(false);
    accurev2git::convert::run(&source, &target, &common::config(&["Main"], 1, 2), work_root_1.path(), &stop)
        .await
        .unwrap();
    let tip_after_tx2 = target.read_ref(&main_branch).await.unwrap().unwrap();

    // A later pass widens end-tx to include a new transaction (tx 3); the
    // in-memory source is extended to match.
    let source = {
        let source = ScriptedSource::new()
            .with_streams(TxId(1), vec![common::stream(1, "Main", None)])
            .with_streams(TxId(2), vec![common::stream(1, "Main", None)])
            .with_streams(TxId(3), vec![common::stream(1, "Main", None)])
            .with_hist(TxId(1), tx(1, TransactionKind::MkStream, &["a.txt"]))
            .with_hist(TxId(2), tx(2, TransactionKind::Keep, &["a.txt"]))
            .with_hist(TxId(3), tx(3, TransactionKind::Keep, &["a.txt"]))
            .with_diff(TxId(1), TxId(2), vec!["a.txt".to_string()])
            .with_diff(TxId(2), TxId(3), vec!["a.txt".to_string()])
            .with_pop_contents(TxId(1), vec![("a.txt", "v1")])
            .with_pop_contents(TxId(2), vec![("a.txt", "v2")])
            .with_pop_contents(TxId(3), vec![("a.txt", "v3")]);
        Arc::new(source)
    };

    let work_root_2 = tempfile::tempdir().unwrap();
    let stop = AtomicBool::new(false);
    accurev2git::convert::run(&source, &target, &common::config(&["Main"], 1, 3), work_root_2.path(), &stop)
        .await
        .unwrap();
    let tip_after_tx3 = target.read_ref(&main_branch).await.unwrap().unwrap();

    assert_ne!(tip_after_tx2, tip_after_tx3, "the new transaction must still advance the branch");

    let meta = target.show_commit(&tip_after_tx3).await.unwrap();
    assert_eq!(
        meta.parents.first(),
        Some(&tip_after_tx2),
        "tx 3's commit must chain onto tx 2's exact tip from the first pass, not a recomputed one"
    );
}

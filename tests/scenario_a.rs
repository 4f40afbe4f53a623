//! Single stream, three transactions (mkstream, two promotes), asserting
//! both branch-commit count and tree contents at every step.

mod common;

use std::collections::HashSet;

use accurev2git::engine::{Engine, EngineState};
use accurev2git::model::{ElementChange, StreamId, Transaction, TransactionKind, TxId};
use accurev2git::names::StreamNameCache;
use accurev2git::planner;
use accurev2git::refs::visible_branch;
use accurev2git::retrieval::retrieve_stream;
use accurev2git::target::TargetStore;
use accurev2git::testing::ScriptedSource;
use chrono::{DateTime, Utc};

fn tx(id: i64, kind: TransactionKind, to: Option<i64>, paths: &[&str]) -> Transaction {
    Transaction {
        id: TxId(id),
        kind,
        author: "jdoe".to_string(),
        timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + id, 0).unwrap(),
        message: format!("tx {id}"),
        from_stream: None,
        to_stream: to.map(StreamId),
        elements: paths.iter().map(|p| ElementChange { path: p.to_string() }).collect(),
    }
}

#[tokio::test]
async fn single_stream_three_transactions_produce_expected_trees() {
    let target = common::target();
    let names = StreamNameCache::new();
    let author = common::author();
    let depot = accurev2git::model::DepotId(1);
    let main = StreamId(1);

    let source = ScriptedSource::new()
        .with_streams(TxId(1), vec![common::stream(1, "Main", None)])
        .with_streams(TxId(2), vec![common::stream(1, "Main", None)])
        .with_streams(TxId(3), vec![common::stream(1, "Main", None)])
        .with_hist(TxId(1), tx(1, TransactionKind::MkStream, None, &["a.txt"]))
        .with_hist(TxId(2), tx(2, TransactionKind::Promote, Some(1), &["a.txt"]))
        .with_hist(TxId(3), tx(3, TransactionKind::Promote, Some(1), &["b.txt"]))
        .with_diff(TxId(1), TxId(2), vec!["a.txt".to_string()])
        .with_diff(TxId(2), TxId(3), vec!["b.txt".to_string()])
        .with_pop_contents(TxId(1), vec![("a.txt", "hello")])
        .with_pop_contents(TxId(2), vec![("a.txt", "hello world")])
        .with_pop_contents(TxId(3), vec![("b.txt", "x")]);

    let work_root = tempfile::tempdir().unwrap();
    retrieve_stream(
        &source,
        &target,
        &names,
        depot,
        "D",
        main,
        "Main",
        accurev2git::config::Method::Diff,
        TxId(1),
        TxId(3),
        &author,
        work_root.path(),
    )
    .await
    .unwrap();

    let planned = planner::plan(&target, depot, &[main]).await.unwrap();
    assert_eq!(planned.len(), 3);

    let config = common::config(&["Main"], 1, 3);
    let tracked: HashSet<StreamId> = [main].into_iter().collect();
    let engine = Engine::new(&target, &config, &names, tracked);
    let mut state = EngineState::new();

    let mut expected_tree_sizes = Vec::new();
    for item in &planned {
        let applied = engine.process_transaction(&mut state, item).await.unwrap();
        expected_tree_sizes.push(applied.len());
    }
    // Every transaction in this scenario produces exactly one commit on Main.
    assert_eq!(expected_tree_sizes, vec![1, 1, 1]);

    let tip = target.read_ref(&visible_branch("Main")).await.unwrap().unwrap();
    let tree = target.tree_of(&tip).await.unwrap();
    assert_eq!(common::tree_contents(&target, &tree, "a.txt").await, Some("hello world".to_string()));
    assert_eq!(common::tree_contents(&target, &tree, "b.txt").await, Some("x".to_string()));
}

//! `chstream` that changes a tracked stream's basis re-anchors it: a merge
//! commit whose parents are the stream's own prior tip and its new basis's
//! tip at that transaction. A stream whose basis did not change gets only
//! bookkeeping, never a spurious merge.

mod common;

use std::collections::HashSet;

use accurev2git::engine::policy::CommitOp;
use accurev2git::engine::{Engine, EngineState};
use accurev2git::model::{ElementChange, StreamId, Transaction, TransactionKind, TxId};
use accurev2git::names::StreamNameCache;
use accurev2git::planner;
use accurev2git::retrieval::retrieve_stream;
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
async fn chstream_basis_change_merges_with_new_basis_tip() {
    let target = common::target();
    let names = StreamNameCache::new();
    let author = common::author();
    let depot = accurev2git::model::DepotId(1);
    let main = StreamId(1);
    let feature = StreamId(2);

    let no_basis = vec![common::stream(1, "Main", None), common::stream(2, "Feature", None)];
    let rebased = vec![common::stream(1, "Main", None), common::stream(2, "Feature", Some(1))];

    let source = ScriptedSource::new()
        .with_streams(TxId(1), no_basis.clone())
        .with_streams(TxId(2), no_basis.clone())
        .with_streams(TxId(3), rebased)
        .with_hist(TxId(1), tx(1, TransactionKind::MkStream, None, &["m.txt"]))
        .with_hist(TxId(2), tx(2, TransactionKind::MkStream, None, &["f.txt"]))
        .with_hist(TxId(3), tx(3, TransactionKind::ChStream, Some(2), &["f.txt"]))
        .with_pop_contents(TxId(1), vec![("m.txt", "m1")])
        .with_pop_contents(TxId(2), vec![("f.txt", "f1")]);

    let main_root = tempfile::tempdir().unwrap();
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
        main_root.path(),
    )
    .await
    .unwrap();

    let feature_root = tempfile::tempdir().unwrap();
    retrieve_stream(
        &source,
        &target,
        &names,
        depot,
        "D",
        feature,
        "Feature",
        accurev2git::config::Method::Diff,
        TxId(2),
        TxId(3),
        &author,
        feature_root.path(),
    )
    .await
    .unwrap();

    let planned = planner::plan(&target, depot, &[main, feature]).await.unwrap();
    assert_eq!(planned.len(), 3);

    let config = common::config(&["Main", "Feature"], 1, 3);
    let tracked: HashSet<StreamId> = [main, feature].into_iter().collect();
    let engine = Engine::new(&target, &config, &names, tracked);
    let mut state = EngineState::new();

    let mut all_applied = Vec::new();
    for item in &planned {
        let applied = engine.process_transaction(&mut state, item).await.unwrap();
        all_applied.push((item.transaction.id, applied));
    }

    let (_, tx3_applied) = all_applied.iter().find(|(id, _)| *id == TxId(3)).unwrap();

    let main_op = tx3_applied.iter().find(|a| a.stream == main).map(|a| &a.op);
    assert!(matches!(main_op, Some(CommitOp::NoOp { .. })), "Main's own basis never changed, expected no-op, got {main_op:?}");

    let feature_op = tx3_applied.iter().find(|a| a.stream == feature).map(|a| &a.op);
    match feature_op {
        Some(CommitOp::Merge { parents, .. }) => {
            let main_tip = state.visible_tip[&main].clone();
            assert_eq!(parents[1], main_tip, "second parent must be the new basis's tip");
        }
        other => panic!("expected Feature to get a merge commit re-anchoring onto Main, got {other:?}"),
    }
}

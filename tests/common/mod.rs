use std::collections::HashMap;
use std::path::PathBuf;

use accurev2git::config::{Config, EmptyChildStreamAction, Method, TxRef};
use accurev2git::model::{StreamId, StreamInfo, StreamKind, TxId};
use accurev2git::testing::{test_author, InMemoryTargetStore};

pub fn stream(id: i64, name: &str, basis: Option<i64>) -> StreamInfo {
    StreamInfo {
        id: StreamId(id),
        name: name.to_string(),
        basis: basis.map(StreamId),
        kind: StreamKind::Normal,
        timelock: None,
    }
}

pub fn config(streams: &[&str], start: i64, end: i64) -> Config {
    Config {
        depot: "D".to_string(),
        streams: streams.iter().map(|s| s.to_string()).collect(),
        start_tx: TxRef::Literal(TxId(start)),
        end_tx: TxRef::Literal(TxId(end)),
        method: Method::Diff,
        source_stream_fast_forward: false,
        empty_child_stream_action: EmptyChildStreamAction::Merge,
        user_map: HashMap::new(),
        repo_path: PathBuf::from("/tmp/accurev2git-test"),
        retrieval_concurrency: 1,
    }
}

pub fn target() -> InMemoryTargetStore {
    InMemoryTargetStore::new()
}

pub fn author() -> accurev2git::target::Signature {
    test_author()
}

pub async fn tree_contents(
    target: &InMemoryTargetStore,
    tree: &accurev2git::target::TreeId,
    path: &str,
) -> Option<String> {
    use accurev2git::target::TargetStore as _;
    target
        .read_blob(tree, path)
        .await
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

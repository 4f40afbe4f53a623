//! In-memory fakes of [`crate::source::SourceClient`] and
//! [`crate::target::TargetStore`], shared by unit and integration tests
//! across the crate so every module tests against the same notion of "a
//! source" and "a target" instead of each hand-rolling its own mock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::ConvertError;
use crate::model::{StreamId, StreamInfo, StreamKind, StreamsSnapshot, Transaction, TransactionKind, TxId};
use crate::source::xml::{HistTransaction, HistVersion, HistXml, StreamXml, StreamsXml};
use crate::source::{DiffResult, HistResult, PopOptions, ShowStreamsResult, SourceClient, TxRange};
use crate::target::{BlobId, CommitId, CommitMeta, Signature, TargetStore, TreeId};

fn transaction_kind_str(kind: &TransactionKind) -> String {
    match kind {
        TransactionKind::MkStream => "mkstream".to_string(),
        TransactionKind::ChStream => "chstream".to_string(),
        TransactionKind::Promote => "promote".to_string(),
        TransactionKind::Keep => "keep".to_string(),
        TransactionKind::Defunct => "defunct".to_string(),
        TransactionKind::Purge => "purge".to_string(),
        TransactionKind::Move => "move".to_string(),
        TransactionKind::Other(s) => s.clone(),
    }
}

fn stream_kind_str(kind: &StreamKind) -> String {
    match kind {
        StreamKind::Normal => "normal".to_string(),
        StreamKind::Workspace => "workspace".to_string(),
        StreamKind::Gated => "gated".to_string(),
        StreamKind::Other(s) => s.clone(),
    }
}

/// Serializes `transaction` into the same `hist.xml` shape
/// [`crate::planner::plan`] later deserializes back out of the committed
/// info tree, so a scripted transaction round-trips through the real
/// retrieval and planning code instead of a hand-written placeholder that
/// only resembles AccuRev's actual response shape.
fn hist_xml_for(transaction: &Transaction) -> String {
    let raw = HistXml {
        task_id: 1,
        transactions: vec![HistTransaction {
            id: transaction.id.0,
            kind: transaction_kind_str(&transaction.kind),
            user: transaction.author.clone(),
            time: transaction.timestamp.timestamp(),
            comment: transaction.message.clone(),
            from_stream: transaction.from_stream.map(|s| s.0),
            to_stream: transaction.to_stream.map(|s| s.0),
            versions: transaction
                .elements
                .iter()
                .map(|e| HistVersion { path: e.path.clone() })
                .collect(),
        }],
    };
    quick_xml::se::to_string(&raw).expect("HistXml always serializes")
}

fn streams_xml_for(streams: &[StreamInfo]) -> String {
    let raw = StreamsXml {
        task_id: 1,
        streams: streams
            .iter()
            .map(|s| StreamXml {
                id: s.id.0,
                name: s.name.clone(),
                basis_id: s.basis.map(|b| b.0),
                kind: stream_kind_str(&s.kind),
                timelock_tx: s.timelock.map(|t| t.0),
            })
            .collect(),
    };
    quick_xml::se::to_string(&raw).expect("StreamsXml always serializes")
}

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = DefaultHasher::new();
    for p in parts {
        p.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// A scripted source: every (depot, tx) or (stream, from, to) query is
/// registered ahead of time; an unregistered query is a test bug, not a
/// source error, so it panics rather than returning `Err`.
#[derive(Default)]
pub struct ScriptedSource {
    hist: Mutex<HashMap<i64, HistResult>>,
    streams: Mutex<HashMap<i64, ShowStreamsResult>>,
    diffs: Mutex<HashMap<(i64, i64), DiffResult>>,
    pops: Mutex<HashMap<i64, Vec<(String, String)>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hist(self, tx: TxId, transaction: Transaction) -> Self {
        let raw_xml = hist_xml_for(&transaction);
        self.hist.lock().unwrap().insert(tx.0, HistResult { raw_xml, transaction });
        self
    }

    pub fn with_streams(self, tx: TxId, streams: Vec<StreamInfo>) -> Self {
        let raw_xml = streams_xml_for(&streams);
        self.streams.lock().unwrap().insert(
            tx.0,
            ShowStreamsResult {
                raw_xml,
                snapshot: StreamsSnapshot { at_tx: tx, streams },
            },
        );
        self
    }

    pub fn with_diff(self, from: TxId, to: TxId, changed_paths: Vec<String>) -> Self {
        self.diffs.lock().unwrap().insert(
            (from.0, to.0),
            DiffResult {
                raw_xml: "<AcResponse taskId=\"1\"/>".to_string(),
                changed_paths,
            },
        );
        self
    }

    /// Registers the file contents `pop` should materialize for `tx`.
    pub fn with_pop_contents(self, tx: TxId, files: Vec<(&str, &str)>) -> Self {
        self.pops.lock().unwrap().insert(
            tx.0,
            files.into_iter().map(|(p, c)| (p.to_string(), c.to_string())).collect(),
        );
        self
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn hist(&self, _depot: &str, tx: TxId) -> Result<HistResult, ConvertError> {
        self.hist
            .lock()
            .unwrap()
            .get(&tx.0)
            .cloned()
            .ok_or_else(|| ConvertError::Source {
                stream: None,
                tx: Some(tx),
                op: "hist".into(),
                message: "no scripted hist result".into(),
            })
    }

    async fn show_streams(&self, _depot: &str, tx: TxId) -> Result<ShowStreamsResult, ConvertError> {
        self.streams
            .lock()
            .unwrap()
            .get(&tx.0)
            .cloned()
            .ok_or_else(|| ConvertError::Source {
                stream: None,
                tx: Some(tx),
                op: "show_streams".into(),
                message: "no scripted streams result".into(),
            })
    }

    async fn diff(&self, _stream_name: &str, from_tx: TxId, to_tx: TxId) -> Result<DiffResult, ConvertError> {
        Ok(self
            .diffs
            .lock()
            .unwrap()
            .get(&(from_tx.0, to_tx.0))
            .cloned()
            .unwrap_or_default())
    }

    async fn pop(
        &self,
        _stream_name: &str,
        tx: TxId,
        dest_dir: &Path,
        _opts: PopOptions,
    ) -> Result<(), ConvertError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        if let Some(files) = self.pops.lock().unwrap().get(&tx.0) {
            for (path, contents) in files {
                let full = dest_dir.join(path);
                if let Some(parent) = full.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(full, contents).await?;
            }
        }
        Ok(())
    }

    async fn deep_hist(&self, _depot: &str, _stream: StreamId, range: TxRange) -> Result<Vec<TxId>, ConvertError> {
        Ok((range.from.0..=range.to.0).map(TxId).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct CommitRecord {
    tree: TreeId,
    parents: Vec<CommitId>,
    message: String,
}

/// An in-memory target store. Trees are content-addressed by hashing the
/// sorted `(relative path, contents)` pairs found under a commit's
/// workdir; commits are addressed by hashing `(tree, parents, message)`.
/// Determinism (same inputs -> same ids across runs) is the only property
/// this crate's tests rely on from a target store, which this satisfies
/// without needing a real object format.
#[derive(Clone, Default)]
pub struct InMemoryTargetStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    refs: HashMap<String, CommitId>,
    commits: HashMap<CommitId, CommitRecord>,
    trees: HashMap<TreeId, Vec<(String, Vec<u8>)>>,
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn walk(dir: &Path, prefix: &Path, out: &mut Vec<(String, Vec<u8>)>) -> std::io::Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = prefix.join(entry.file_name());
            if path.is_dir() {
                Self::walk(&path, &rel, out)?;
            } else {
                out.push((rel.to_string_lossy().replace('\\', "/"), std::fs::read(&path)?));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetStore for InMemoryTargetStore {
    async fn commit_tree(
        &self,
        ref_name: &str,
        workdir: &Path,
        message: &str,
        author: &Signature,
        allow_empty: bool,
        parents: &[CommitId],
    ) -> Result<CommitId, ConvertError> {
        let mut files = Vec::new();
        Self::walk(workdir, Path::new(""), &mut files)?;
        files.sort_by(|a, b| a.0.cmp(&b.0));

        if !allow_empty && files.is_empty() && parents.len() == 1 {
            let unchanged = {
                let guard = self.inner.lock().unwrap();
                guard
                    .commits
                    .get(&parents[0])
                    .and_then(|prev| guard.trees.get(&prev.tree))
                    .is_some_and(|prev_files| prev_files == &files)
            };
            if unchanged {
                return Err(ConvertError::Invariant("empty commit not allowed".into()));
            }
        }

        let tree_bytes: Vec<&[u8]> = files.iter().flat_map(|(p, c)| [p.as_bytes(), c.as_slice()]).collect();
        let tree = TreeId(digest(&tree_bytes));
        self.inner.lock().unwrap().trees.insert(tree.clone(), files);

        self.commit_tree_direct(tree, message, author, parents).await
            .map(|c| {
                // commit_tree_direct doesn't know the ref; record it here.
                self.inner.lock().unwrap().refs.entry(ref_name.to_string()).or_insert_with(|| c.clone());
                c
            })
    }

    async fn commit_tree_direct(
        &self,
        tree: TreeId,
        message: &str,
        author: &Signature,
        parents: &[CommitId],
    ) -> Result<CommitId, ConvertError> {
        let parent_bytes: Vec<&[u8]> = parents.iter().map(|p| p.0.as_bytes()).collect();
        let mut parts = vec![tree.0.as_bytes(), message.as_bytes(), author.email.as_bytes()];
        parts.extend(parent_bytes);
        let id = CommitId(digest(&parts));
        self.inner.lock().unwrap().commits.insert(
            id.clone(),
            CommitRecord {
                tree,
                parents: parents.to_vec(),
                message: message.to_string(),
            },
        );
        Ok(id)
    }

    async fn update_ref(&self, ref_name: &str, commit: CommitId) -> Result<(), ConvertError> {
        self.inner.lock().unwrap().refs.insert(ref_name.to_string(), commit);
        Ok(())
    }

    async fn read_ref(&self, ref_name: &str) -> Result<Option<CommitId>, ConvertError> {
        Ok(self.inner.lock().unwrap().refs.get(ref_name).cloned())
    }

    async fn show_commit(&self, commit: &CommitId) -> Result<CommitMeta, ConvertError> {
        let guard = self.inner.lock().unwrap();
        let record = guard
            .commits
            .get(commit)
            .ok_or_else(|| ConvertError::Target {
                op: "show_commit".into(),
                message: format!("unknown commit {commit}"),
            })?;
        Ok(CommitMeta {
            tree: record.tree.clone(),
            parents: record.parents.clone(),
            message: record.message.clone(),
        })
    }

    async fn read_blob(&self, tree: &TreeId, path: &str) -> Result<Option<Vec<u8>>, ConvertError> {
        let guard = self.inner.lock().unwrap();
        Ok(guard
            .trees
            .get(tree)
            .and_then(|files| files.iter().find(|(p, _)| p == path))
            .map(|(_, c)| c.clone()))
    }

    async fn diff_trees_nonempty(&self, a: &CommitId, b: &CommitId) -> Result<bool, ConvertError> {
        let ta = self.tree_of(a).await?;
        let tb = self.tree_of(b).await?;
        Ok(ta != tb)
    }

    async fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool, ConvertError> {
        let mut frontier = vec![descendant.clone()];
        let guard = self.inner.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        while let Some(c) = frontier.pop() {
            if &c == ancestor {
                return Ok(true);
            }
            if !seen.insert(c.clone()) {
                continue;
            }
            if let Some(record) = guard.commits.get(&c) {
                frontier.extend(record.parents.iter().cloned());
            }
        }
        Ok(false)
    }

    async fn hash_object(&self, bytes: &[u8]) -> Result<BlobId, ConvertError> {
        Ok(BlobId(digest(&[bytes])))
    }
}

pub fn test_author() -> Signature {
    Signature {
        name: "Test User".to_string(),
        email: "test@example.com".to_string(),
        when: chrono::DateTime::UNIX_EPOCH,
    }
}

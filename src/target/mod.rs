//! Target store adapter: thin, storage-only operations over the target
//! VCS's content-addressed object store and ref namespace.
//!
//! Mirrors the shape of a repository-access trait: the trait below knows
//! nothing about how the target VCS is actually invoked (shelling out to a
//! CLI, talking to a daemon, an in-memory fake for tests) — only the
//! handful of primitives the retrieval pipeline, planner, and processing
//! engine need. Every method is atomic with respect to a single ref
//! update; there is no multi-ref transaction primitive because the core
//! never needs to update two refs as one atomic unit (see SPEC_FULL.md
//! §4.6: `state/last` is the only cross-ref authority, and it is rewritten
//! after, not atomically with, the visible-branch ref).

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ConvertError;

/// An opaque commit identifier in the target store (e.g. a git SHA). The
/// core never computes this itself — hashing is the target VCS's job —
/// it only threads opaque ids returned by [`TargetStore`] methods.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque tree identifier in the target store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub String);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque blob identifier, returned by [`TargetStore::hash_object`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(pub String);

/// Author/committer identity attached to a commit (SPEC_FULL.md §4.5:
/// "committer equals author").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

/// Commit metadata as read back from the target store (SPEC_FULL.md §4.2:
/// "read a tree/commit/blob by ref").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    pub tree: TreeId,
    pub parents: Vec<CommitId>,
    pub message: String,
}

/// Storage-level operations over the target VCS. Implementors are
/// expected to be cheap to clone (a handle to a shared repository) and
/// safe to use from multiple retrieval tasks concurrently, since distinct
/// streams' retrieval jobs touch disjoint refs (SPEC_FULL.md §5).
#[async_trait]
pub trait TargetStore: Send + Sync + Clone {
    /// Commits the current contents of `workdir` to `ref_name`, with the
    /// given parents, allowing an empty (no-op) tree when `allow_empty` is
    /// set. Used by the retrieval pipeline, which actually materializes a
    /// working copy via `pop`.
    async fn commit_tree(
        &self,
        ref_name: &str,
        workdir: &Path,
        message: &str,
        author: &Signature,
        allow_empty: bool,
        parents: &[CommitId],
    ) -> Result<CommitId, ConvertError>;

    /// Builds a commit directly from an already-known tree, without
    /// materializing a working copy. Used by the processing engine, which
    /// is almost always reusing a `data` ref commit's tree verbatim rather
    /// than writing files to disk again.
    async fn commit_tree_direct(
        &self,
        tree: TreeId,
        message: &str,
        author: &Signature,
        parents: &[CommitId],
    ) -> Result<CommitId, ConvertError>;

    /// Atomically updates `ref_name` to point at `commit`.
    async fn update_ref(&self, ref_name: &str, commit: CommitId) -> Result<(), ConvertError>;

    /// Reads the commit `ref_name` currently points at, or `None` if the
    /// ref does not exist yet.
    async fn read_ref(&self, ref_name: &str) -> Result<Option<CommitId>, ConvertError>;

    /// Reads a commit's metadata (tree, parents, message).
    async fn show_commit(&self, commit: &CommitId) -> Result<CommitMeta, ConvertError>;

    /// The tree a commit points to; a convenience over `show_commit` for
    /// the common case where only the tree is needed.
    async fn tree_of(&self, commit: &CommitId) -> Result<TreeId, ConvertError> {
        Ok(self.show_commit(commit).await?.tree)
    }

    /// Reads a blob at `path` within `tree`, or `None` if the path does
    /// not exist in that tree.
    async fn read_blob(&self, tree: &TreeId, path: &str) -> Result<Option<Vec<u8>>, ConvertError>;

    /// Whether the trees of `a` and `b` differ at all. SPEC_FULL.md §4.2
    /// only ever needs empty/non-empty, never the actual patch.
    async fn diff_trees_nonempty(
        &self,
        a: &CommitId,
        b: &CommitId,
    ) -> Result<bool, ConvertError>;

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    async fn is_ancestor(
        &self,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, ConvertError>;

    /// Hashes `bytes` as a blob without writing it to any ref (used by the
    /// stream-name cache to address individual id->name entries).
    async fn hash_object(&self, bytes: &[u8]) -> Result<BlobId, ConvertError>;
}

//! Pure decision functions for the processing engine (SPEC_FULL.md §4.5).
//! Every function here takes already-known facts (tip commits, whether two
//! trees are equal, whether one commit is an ancestor of another) as plain
//! values and returns a [`CommitOp`] or two; none of them touch a
//! [`crate::target::TargetStore`]. The facts themselves are gathered by
//! `engine::mod`'s async driver, which is the only place that talks to the
//! store — this split is what makes the policy table testable without a
//! real object store.

use crate::config::EmptyChildStreamAction;
use crate::model::StreamId;
use crate::target::{CommitId, TreeId};

/// One commit (or ref update) the applier must perform. Ordered the same
/// way the engine emits them, so applying a `Vec<CommitOp>` in sequence is
/// always correct (a `FastForward` is only ever emitted right after the
/// `Merge`/`CherryPick` it depends on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOp {
    /// `mkstream`: an orphan root commit on `stream`'s visible branch.
    Root { stream: StreamId, tree: TreeId },
    /// A transaction recorded against `stream` with no content change to
    /// its visible branch (still audited).
    NoOp { stream: StreamId },
    /// A two-parent commit on `stream`: `[current tip, other tip]`.
    Merge {
        stream: StreamId,
        parents: [CommitId; 2],
        tree: TreeId,
    },
    /// A single-parent commit on `stream` that does not carry the other
    /// side's history (`parents = [current tip]`).
    CherryPick {
        stream: StreamId,
        parent: CommitId,
        tree: TreeId,
    },
    /// Advances `stream`'s visible branch directly to `target` (used for
    /// `source-stream-fast-forward`).
    FastForward { stream: StreamId, target: CommitId },
}

impl CommitOp {
    pub fn stream(&self) -> StreamId {
        match self {
            CommitOp::Root { stream, .. }
            | CommitOp::NoOp { stream, .. }
            | CommitOp::Merge { stream, .. }
            | CommitOp::CherryPick { stream, .. }
            | CommitOp::FastForward { stream, .. } => *stream,
        }
    }
}

/// `mkstream`: always an orphan root (SPEC_FULL.md §4.5 default policy —
/// anchoring children to their basis's tip is not implemented, matching
/// the spec's stated default).
pub fn decide_mkstream(stream: StreamId, tree: TreeId) -> CommitOp {
    CommitOp::Root { stream, tree }
}

/// `chstream`: a no-op unless the stream's basis actually changed between
/// `tx-1` and `tx`.
pub fn decide_chstream(
    stream: StreamId,
    basis_changed: bool,
    child_tip: CommitId,
    new_basis_tip: Option<CommitId>,
    tree: TreeId,
) -> CommitOp {
    if !basis_changed {
        return CommitOp::NoOp { stream };
    }
    match new_basis_tip {
        Some(basis_tip) => CommitOp::Merge {
            stream,
            parents: [child_tip, basis_tip],
            tree,
        },
        // New basis untracked: nothing to merge in, but the stream's
        // content at tx must still land on the visible branch.
        None => CommitOp::CherryPick {
            stream,
            parent: child_tip,
            tree,
        },
    }
}

/// Whether the source stream of a promote is known and tracked.
#[derive(Debug, Clone, Copy)]
pub struct TrackedSource {
    pub stream: StreamId,
    pub tip: CommitId,
}

/// A promote (or any transaction with a `toStream`): the destination
/// commit, plus an optional fast-forward of the source's visible branch.
pub fn decide_promote(
    dst: StreamId,
    dst_tip: CommitId,
    src: Option<TrackedSource>,
    source_stream_fast_forward: bool,
    tree: TreeId,
) -> (CommitOp, Option<CommitOp>) {
    match src {
        Some(TrackedSource { stream: src_stream, tip: src_tip }) => {
            let dst_commit = CommitOp::Merge {
                stream: dst,
                parents: [dst_tip, src_tip],
                tree,
            };
            let ff = source_stream_fast_forward.then(|| CommitOp::FastForward {
                stream: src_stream,
                // The applier resolves this to the just-created dst commit
                // id once `dst_commit` has actually been applied.
                target: CommitId(String::new()),
            });
            (dst_commit, ff)
        }
        None => (
            CommitOp::CherryPick {
                stream: dst,
                parent: dst_tip,
                tree,
            },
            None,
        ),
    }
}

/// Recursive child propagation after a destination commit lands
/// (SPEC_FULL.md §4.5, "After every destination commit"). `trees_equal` is
/// whether the child's `data` tree at tx equals the parent's new commit's
/// tree; `parent_is_ancestor_of_child_tip` is whether that new parent
/// commit is already reachable from the child's current tip.
pub fn decide_child_propagation(
    child: StreamId,
    child_tip: CommitId,
    new_parent_commit: CommitId,
    trees_equal: bool,
    parent_is_ancestor_of_child_tip: bool,
    empty_child_action: EmptyChildStreamAction,
    child_tree: TreeId,
) -> CommitOp {
    if trees_equal {
        if parent_is_ancestor_of_child_tip {
            return CommitOp::NoOp { stream: child };
        }
        return match empty_child_action {
            EmptyChildStreamAction::Merge => CommitOp::Merge {
                stream: child,
                parents: [child_tip, new_parent_commit],
                tree: child_tree,
            },
            EmptyChildStreamAction::CherryPick => CommitOp::CherryPick {
                stream: child,
                parent: child_tip,
                tree: child_tree,
            },
        };
    }
    CommitOp::CherryPick {
        stream: child,
        parent: child_tip,
        tree: child_tree,
    }
}

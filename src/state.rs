//! State and resume layer (SPEC_FULL.md §4.6): `state/last` is the single
//! cross-stream authority for every tracked stream's visible-branch tip,
//! and `commit_history/<stream>` is an append-only audit chain whose most
//! recent commit's second parent must always agree with it.

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use crate::errors::ConvertError;
use crate::model::{DepotId, StreamId, TxId};
use crate::names::StreamNameCache;
use crate::refs::{commit_history_ref, state_last_ref, visible_branch};
use crate::target::{CommitId, Signature, TargetStore};

const STATE_PREFIX: &str = "streams/";

/// Reads `state/last` for every stream in `tracked`, skipping any stream
/// with no recorded entry (never `mkstream`-d yet).
pub async fn read_state_last<T: TargetStore>(
    target: &T,
    depot: DepotId,
    tracked: &[StreamId],
) -> Result<HashMap<StreamId, CommitId>, ConvertError> {
    let mut map = HashMap::new();
    for &stream in tracked {
        if let Some(tip) = read_tip(target, depot, stream).await? {
            map.insert(stream, tip);
        }
    }
    Ok(map)
}

/// Reads one stream's recorded tip straight out of `state/last`'s tree,
/// without materializing the whole map.
pub async fn read_tip<T: TargetStore>(
    target: &T,
    depot: DepotId,
    stream: StreamId,
) -> Result<Option<CommitId>, ConvertError> {
    let Some(commit) = target.read_ref(&state_last_ref(depot)).await? else {
        return Ok(None);
    };
    let tree = target.tree_of(&commit).await?;
    let path = format!("{STATE_PREFIX}{}", stream.0);
    let Some(bytes) = target.read_blob(&tree, &path).await? else {
        return Ok(None);
    };
    Ok(Some(CommitId(String::from_utf8_lossy(&bytes).trim().to_string())))
}

/// The transaction `state/last` was last rewritten for, or `None` if it has
/// never been written (a fresh conversion). `convert::run` uses this to
/// skip transactions the processing loop already committed on an earlier
/// pass, rather than recomputing them from tips that no longer match the
/// as-of-tx state those earlier commits were built against (SPEC_FULL.md
/// §8: restarting after an interruption must reproduce the same history
/// for every transaction already reflected in `state/last`, not redo it).
pub async fn last_processed_tx<T: TargetStore>(target: &T, depot: DepotId) -> Result<Option<TxId>, ConvertError> {
    let ref_name = state_last_ref(depot);
    let Some(commit) = target.read_ref(&ref_name).await? else {
        return Ok(None);
    };
    let meta = target.show_commit(&commit).await?;
    meta.message
        .strip_prefix("transaction ")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(TxId)
        .map(Some)
        .ok_or_else(|| ConvertError::Invariant(format!("state/last commit missing transaction id: {}", meta.message)))
}

/// Rewrites `state/last` from scratch with the given `stream -> tip` map,
/// one file per stream under `streams/`. Called after every transaction's
/// commits are emitted (SPEC_FULL.md §4.5: "after all commits for tx are
/// emitted, atomically rewrite `state/last`").
pub async fn write_state_last<T: TargetStore>(
    target: &T,
    depot: DepotId,
    tips: &HashMap<StreamId, CommitId>,
    tx: TxId,
    author: &Signature,
    scratch_dir: &Path,
) -> Result<CommitId, ConvertError> {
    let dir = scratch_dir.join("state_last");
    let _ = tokio::fs::remove_dir_all(&dir).await;
    let files_dir = dir.join("streams");
    tokio::fs::create_dir_all(&files_dir).await?;

    let mut ids: Vec<&StreamId> = tips.keys().collect();
    ids.sort();
    for id in ids {
        tokio::fs::write(files_dir.join(id.0.to_string()), tips[id].0.as_bytes()).await?;
    }

    let ref_name = state_last_ref(depot);
    let parent = target.read_ref(&ref_name).await?;
    let commit = target
        .commit_tree(
            &ref_name,
            &dir,
            &format!("transaction {tx}"),
            author,
            true,
            &parent.into_iter().collect::<Vec<_>>(),
        )
        .await?;
    target.update_ref(&ref_name, commit.clone()).await?;
    Ok(commit)
}

/// Appends one audit commit to `commit_history/<stream>`: parents are
/// `[previous commit_history tip (if any), the stream's new visible tip]`,
/// so the most recent commit's second parent is always checkable against
/// `state/last`.
pub async fn append_commit_history<T: TargetStore>(
    target: &T,
    depot: DepotId,
    stream: StreamId,
    tx: TxId,
    visible_tip: CommitId,
    author: &Signature,
    scratch_dir: &Path,
) -> Result<CommitId, ConvertError> {
    let ref_name = commit_history_ref(depot, stream);
    let dir = scratch_dir.join("commit_history").join(stream.0.to_string());
    let _ = tokio::fs::remove_dir_all(&dir).await;
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join("tx"), tx.0.to_string()).await?;

    let prev = target.read_ref(&ref_name).await?;
    let mut parents = Vec::new();
    parents.extend(prev);
    parents.push(visible_tip);

    let commit = target
        .commit_tree(&ref_name, &dir, &format!("transaction {tx}"), author, true, &parents)
        .await?;
    target.update_ref(&ref_name, commit.clone()).await?;
    Ok(commit)
}

/// Startup reconciliation (SPEC_FULL.md §4.6): restores every tracked
/// stream's visible branch to `state/last`'s recorded tip (the engine is
/// the sole authority — a visible branch ref that disagrees loses), and
/// repairs `commit_history` if its tip's second parent disagrees with the
/// now-authoritative tip. Returns the `stream -> tip` map to seed
/// [`crate::engine::EngineState`]. `names` must already carry every
/// tracked stream's name (the conversion resolves stream ids to names
/// before this runs) so the branch this restores is the same
/// `refs/heads/<name>` ref the engine itself reads and writes.
pub async fn bootstrap<T: TargetStore>(
    target: &T,
    depot: DepotId,
    tracked: &[StreamId],
    names: &StreamNameCache,
    author: &Signature,
    scratch_dir: &Path,
) -> Result<HashMap<StreamId, CommitId>, ConvertError> {
    let mut tips = HashMap::new();

    for &stream in tracked {
        let Some(authoritative) = read_tip(target, depot, stream).await? else {
            continue;
        };

        let branch = visible_branch(&names.branch_name(stream));
        if let Some(current) = target.read_ref(&branch).await? {
            if current != authoritative {
                warn!(
                    stream = stream.0,
                    "visible branch disagrees with state/last, state/last wins"
                );
            }
        }
        target.update_ref(&branch, authoritative.clone()).await?;

        let history_ref = commit_history_ref(depot, stream);
        if let Some(history_tip) = target.read_ref(&history_ref).await? {
            let meta = target.show_commit(&history_tip).await?;
            let recorded = meta.parents.get(1).cloned();
            if recorded.as_ref() != Some(&authoritative) {
                info!(stream = stream.0, "commit_history disagrees with state/last, appending correction");
                let tx = TxId(0);
                append_commit_history(target, depot, stream, tx, authoritative.clone(), author, scratch_dir).await?;
            }
        }

        tips.insert(stream, authoritative);
    }

    Ok(tips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_prefix_matches_read_tip_path_construction() {
        assert_eq!(format!("{STATE_PREFIX}{}", 3), "streams/3");
    }
}

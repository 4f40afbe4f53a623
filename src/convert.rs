//! Top-level orchestrator (SPEC_FULL.md §2, §5): resolves the configured
//! streams and transaction bounds, fans retrieval out across them, then
//! drains the planner's merged transaction order through the processing
//! engine and the state layer, one transaction at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument};

use crate::config::{Config, TxRef};
use crate::engine::{Engine, EngineState};
use crate::errors::ConvertError;
use crate::model::{DepotId, StreamId, TxId};
use crate::names::StreamNameCache;
use crate::planner;
use crate::retrieval::{self, RetrievalOutcome};
use crate::source::{SourceClient, TxRange};
use crate::state;
use crate::target::{Signature, TargetStore};

/// The identity every bookkeeping commit (`info`/`data`/`hwm`/`state/last`/
/// `commit_history`) is written under. These refs are never user-visible
/// branches, so they do not need per-transaction authorship the way the
/// engine's commits on `refs/heads/*` do.
fn bookkeeping_signature() -> Signature {
    Signature {
        name: "accurev2git".to_string(),
        email: "accurev2git@localhost".to_string(),
        when: chrono::DateTime::UNIX_EPOCH,
    }
}

/// Resolves `depot`'s name to a stable [`DepotId`]. A depot's identity in
/// this engine's ref namespace only needs to be a function of its name,
/// not an id assigned by the source (which this crate never queries for
/// depot ids, only stream/transaction ones).
fn resolve_depot_id(name: &str) -> DepotId {
    // FNV-1a: deterministic across runs and platforms, unlike the
    // randomized-by-default `DefaultHasher`.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    DepotId((hash & 0x7fff_ffff_ffff_ffff) as i64)
}

/// Resolves a [`TxRef`] to a literal [`TxId`]. `First` is always
/// transaction 1; `Highest`/`Now` asks every already-resolved stream for
/// its superset of affecting transactions via `deep_hist` and takes the
/// overall maximum, since no source operation directly reports "the
/// current highest transaction id" in this crate's trait.
async fn resolve_tx_ref<S: SourceClient>(
    source: &S,
    depot_name: &str,
    streams: &[StreamId],
    r: TxRef,
) -> Result<TxId, ConvertError> {
    match r {
        TxRef::Literal(tx) => Ok(tx),
        TxRef::First => Ok(TxId(1)),
        TxRef::Highest | TxRef::Now => {
            let mut highest = TxId(1);
            for &stream in streams {
                let txs = source
                    .deep_hist(depot_name, stream, TxRange { from: TxId(1), to: TxId(i64::MAX) })
                    .await?;
                if let Some(&max) = txs.iter().max() {
                    highest = highest.max(max);
                }
            }
            Ok(highest)
        }
    }
}

/// Maps `config.streams`' names to ids via one `show streams` call at
/// transaction 1 — every tracked stream is assumed to already exist by
/// then (SPEC_FULL.md's `start-tx` bounds the conversion's visible
/// history, not a stream's own creation date).
async fn resolve_stream_ids<S: SourceClient>(
    source: &S,
    depot_name: &str,
    names: &StreamNameCache,
    wanted: &[String],
) -> Result<Vec<StreamId>, ConvertError> {
    let probe = source.show_streams(depot_name, TxId(1)).await?;
    names.observe(&probe.snapshot.streams);

    let mut by_name: HashMap<&str, StreamId> = HashMap::new();
    for s in &probe.snapshot.streams {
        by_name.insert(s.name.as_str(), s.id);
    }

    wanted
        .iter()
        .map(|n| {
            by_name.get(n.as_str()).copied().ok_or_else(|| {
                ConvertError::Invariant(format!("configured stream {n:?} not found in depot {depot_name:?}"))
            })
        })
        .collect()
}

/// Runs retrieval, planning, and processing for one full pass over
/// `config`'s configured streams and transaction range. `work_root` is
/// this run's exclusive scratch directory (subdivided per stream); `stop`
/// is checked between transactions so a caller can request a cooperative,
/// restartable pause (SPEC_FULL.md §6: exit code 2).
#[instrument(skip(source, target, config, work_root, stop), fields(depot = %config.depot))]
pub async fn run<S, T>(
    source: &S,
    target: &T,
    config: &Config,
    work_root: &Path,
    stop: &AtomicBool,
) -> Result<(), ConvertError>
where
    S: SourceClient + Clone + Send + Sync + 'static,
    T: TargetStore + 'static,
{
    let depot = resolve_depot_id(&config.depot);
    let names = StreamNameCache::new();
    let bot = bookkeeping_signature();

    let stream_ids = resolve_stream_ids(source, &config.depot, &names, &config.streams).await?;
    let start_tx = resolve_tx_ref(source, &config.depot, &stream_ids, config.start_tx).await?;
    let end_tx = resolve_tx_ref(source, &config.depot, &stream_ids, config.end_tx).await?;

    info!(
        streams = stream_ids.len(),
        start_tx = start_tx.0,
        end_tx = end_tx.0,
        "resolved conversion scope"
    );

    let tracked: std::collections::HashSet<StreamId> = stream_ids.iter().copied().collect();
    let mut engine_state = EngineState::new();
    engine_state.visible_tip = state::bootstrap(target, depot, &stream_ids, &names, &bot, work_root).await?;
    let last_processed = state::last_processed_tx(target, depot).await?;

    retrieve_all(source, target, &names, config, depot, &stream_ids, start_tx, end_tx, &bot, work_root).await?;

    if !names.is_empty() {
        names.persist(target, depot, &bot).await?;
    }

    let planned = planner::plan(target, depot, &stream_ids).await?;
    info!(
        transactions = planned.len(),
        last_processed = last_processed.map(|t| t.0),
        "entering processing engine"
    );

    let engine = Engine::new(target, config, &names, tracked);

    for item in &planned {
        if stop.load(Ordering::Relaxed) {
            return Err(ConvertError::Interrupted(Some(item.transaction.id)));
        }

        // Already reflected in `state/last` from an earlier pass: the
        // visible tips `bootstrap` just restored already carry its
        // effects, so replaying it again would recompute a merge parent
        // against the final tip instead of the as-of-tx one it actually
        // used (SPEC_FULL.md §8 round-trip/interrupt-restart laws).
        if last_processed.is_some_and(|last| item.transaction.id <= last) {
            continue;
        }

        let applied = engine.process_transaction(&mut engine_state, item).await?;
        if applied.is_empty() {
            continue;
        }

        state::write_state_last(target, depot, &engine_state.visible_tip, item.transaction.id, &bot, work_root)
            .await?;
        for op in &applied {
            state::append_commit_history(target, depot, op.stream, item.transaction.id, op.new_tip.clone(), &bot, work_root)
                .await?;
        }
    }

    Ok(())
}

/// Fans per-stream retrieval out across up to `config.retrieval_concurrency`
/// concurrent jobs, each in its own scratch subdirectory (SPEC_FULL.md §5:
/// "no two retrieval jobs may share the working directory").
#[allow(clippy::too_many_arguments)]
async fn retrieve_all<S, T>(
    source: &S,
    target: &T,
    names: &StreamNameCache,
    config: &Config,
    depot: DepotId,
    streams: &[StreamId],
    start_tx: TxId,
    end_tx: TxId,
    author: &Signature,
    work_root: &Path,
) -> Result<Vec<RetrievalOutcome>, ConvertError>
where
    S: SourceClient + Send + Sync + 'static + Clone,
    T: TargetStore + 'static,
{
    let semaphore = Arc::new(Semaphore::new(config.retrieval_concurrency.max(1)));
    let mut set: JoinSet<Result<RetrievalOutcome, ConvertError>> = JoinSet::new();

    for &stream in streams {
        let source = source.clone();
        let target = target.clone();
        let names = names.clone();
        let semaphore = semaphore.clone();
        let stream_name = names
            .name_of(stream)
            .unwrap_or_else(|| format!("stream-{}", stream.0));
        let depot_name = config.depot.clone();
        let method = config.method;
        let author = author.clone();
        let stream_root: PathBuf = work_root.join("retrieval").join(stream.0.to_string());

        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            retrieval::retrieve_stream(
                &source,
                &target,
                &names,
                depot,
                &depot_name,
                stream,
                &stream_name,
                method,
                start_tx,
                end_tx,
                &author,
                &stream_root,
            )
            .await
        });
    }

    let mut outcomes = Vec::with_capacity(streams.len());
    while let Some(result) = set.join_next().await {
        let outcome = result.map_err(|e| ConvertError::Invariant(format!("retrieval task panicked: {e}")))??;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depot_id_resolution_is_deterministic() {
        assert_eq!(resolve_depot_id("MyDepot"), resolve_depot_id("MyDepot"));
        assert_ne!(resolve_depot_id("MyDepot"), resolve_depot_id("OtherDepot"));
    }
}

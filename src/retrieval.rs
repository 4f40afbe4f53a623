//! Per-stream retrieval pipeline (SPEC_FULL.md §4.3): advances a stream's
//! hidden `info`/`data`/`hwm` refs one transaction at a time, choosing
//! among the `pop`/`diff`/`deep-hist` candidate-transaction strategies.

use std::path::Path;

use tracing::{debug, info, instrument};

use crate::config::Method;
use crate::errors::ConvertError;
use crate::model::{DepotId, StreamId, StreamsSnapshot, Transaction, TxId};
use crate::names::StreamNameCache;
use crate::refs::{data_ref, hwm_ref, info_ref};
use crate::source::xml::normalize_task_id;
use crate::source::{DiffResult, PopOptions, SourceClient, TxRange};
use crate::target::{CommitId, Signature, TargetStore};

/// One candidate transaction's fetched metadata, produced by the info
/// pass and consumed by the data pass. Keeping this as a plain struct
/// (rather than re-fetching from the source in the data pass) is what
/// makes the two passes independent of each other's external-command
/// traffic: the data pass only ever calls `pop`.
struct StepArtifacts {
    tx: TxId,
    hist_xml: String,
    streams_xml: String,
    diff_xml: String,
    transaction: Transaction,
    snapshot: StreamsSnapshot,
    changed_paths: Vec<String>,
    /// Whether this tx's diff was empty (nothing to pop) — meaningless
    /// for the `pop` method, which always repopulates in full.
    diff_empty: bool,
}

fn tx_of_message(message: &str) -> Option<TxId> {
    message
        .strip_prefix("transaction ")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(TxId)
}

async fn read_hwm<T: TargetStore>(
    target: &T,
    depot: DepotId,
    stream: StreamId,
) -> Result<Option<TxId>, ConvertError> {
    let ref_name = hwm_ref(depot, stream);
    let Some(commit) = target.read_ref(&ref_name).await? else {
        return Ok(None);
    };
    let tree = target.tree_of(&commit).await?;
    let Some(bytes) = target.read_blob(&tree, "hwm").await? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&bytes);
    text.trim()
        .parse::<i64>()
        .map(|v| Some(TxId(v)))
        .map_err(|_| ConvertError::Invariant(format!("malformed hwm blob: {text}")))
}

/// What [`resume_point`] found on disk for a stream.
enum Resume {
    /// Neither ref exists: this stream has never been retrieved.
    NeverStarted,
    /// `info` was committed for `tx` but a crash happened before `data`
    /// was committed for the same transaction (this can only be the
    /// stream's very first transaction, since every later step commits
    /// `info` and `data` for the same candidate in the same pass pairing).
    /// The caller reuses the existing `info` commit and only needs to
    /// (re)populate `data` for `tx`.
    InfoOnly { info_tip: CommitId, tx: TxId },
    /// Both refs are consistent (possibly after a one-commit `info`
    /// rewind); retrieval resumes after `tx`.
    Ready {
        info_tip: CommitId,
        data_tip: CommitId,
        tx: TxId,
    },
}

/// Resolves the resume point for a stream: reads `hwm`, the tip of
/// `info`, and the tip of `data`; if `info` is exactly one commit ahead of
/// `data` (the only sanctioned rewind, per SPEC_FULL.md §4.3), rewinds
/// `info` to `data`'s tip before returning.
async fn resume_point<T: TargetStore>(
    target: &T,
    depot: DepotId,
    stream: StreamId,
) -> Result<Resume, ConvertError> {
    let info_ref_name = info_ref(depot, stream);
    let data_ref_name = data_ref(depot, stream);

    let Some(info_tip) = target.read_ref(&info_ref_name).await? else {
        return Ok(Resume::NeverStarted);
    };
    let Some(data_tip) = target.read_ref(&data_ref_name).await? else {
        let info_commit = target.show_commit(&info_tip).await?;
        let tx = tx_of_message(&info_commit.message).ok_or_else(|| {
            ConvertError::Invariant("info commit missing transaction id".into())
        })?;
        return Ok(Resume::InfoOnly { info_tip, tx });
    };

    let info_commit = target.show_commit(&info_tip).await?;
    let data_commit = target.show_commit(&data_tip).await?;
    let info_tx = tx_of_message(&info_commit.message)
        .ok_or_else(|| ConvertError::Invariant("info commit missing transaction id".into()))?;
    let data_tx = tx_of_message(&data_commit.message)
        .ok_or_else(|| ConvertError::Invariant("data commit missing transaction id".into()))?;

    let (agreed_tx, resumed_info_tip) = if info_tx == data_tx {
        (info_tx, info_tip)
    } else if info_tx.0 == data_tx.0 + 1 {
        info!(stream = stream.0, tx = info_tx.0, "info ahead of data by one commit, rewinding info");
        let parent = info_commit
            .parents
            .first()
            .cloned()
            .ok_or_else(|| ConvertError::Invariant("info tip has no parent to rewind to".into()))?;
        target.update_ref(&info_ref_name, parent.clone()).await?;
        (data_tx, parent)
    } else {
        return Err(ConvertError::Invariant(format!(
            "info ({info_tx}) and data ({data_tx}) diverged by more than one commit for stream {stream}"
        )));
    };

    let hwm = read_hwm(target, depot, stream).await?.unwrap_or(agreed_tx);
    let tx = agreed_tx.min(hwm);
    Ok(Resume::Ready {
        info_tip: resumed_info_tip,
        data_tip,
        tx,
    })
}

async fn write_xml_tree(
    dir: &Path,
    hist_xml: &str,
    streams_xml: &str,
    diff_xml: Option<&str>,
) -> Result<(), ConvertError> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join("hist.xml"), hist_xml).await?;
    tokio::fs::write(dir.join("streams.xml"), streams_xml).await?;
    if let Some(diff_xml) = diff_xml {
        tokio::fs::write(dir.join("diff.xml"), diff_xml).await?;
    } else {
        let _ = tokio::fs::remove_file(dir.join("diff.xml")).await;
    }
    Ok(())
}

/// Fetches one candidate transaction's metadata (`hist`, `show streams`,
/// and — unless it's the mkstream transaction — `diff`), normalizing
/// `TaskId` on each payload. A `ParseError` from `hist` is converted into
/// the sentinel transaction described in SPEC_FULL.md §7 rather than
/// propagated, so one unparseable old transaction never aborts an
/// otherwise-healthy stream's retrieval.
async fn fetch_step<S: SourceClient>(
    source: &S,
    depot: &str,
    stream_name: &str,
    tx: TxId,
    prev_tx: TxId,
    is_mkstream: bool,
) -> Result<StepArtifacts, ConvertError> {
    let hist = match source.hist(depot, tx).await {
        Ok(h) => h,
        Err(ConvertError::Parse { .. }) => crate::source::HistResult {
            raw_xml: String::new(),
            transaction: Transaction::parse_error_sentinel(tx),
        },
        Err(e) => return Err(e),
    };

    let streams = source.show_streams(depot, tx).await?;

    let (diff_xml, changed_paths, diff_empty) = if is_mkstream {
        (String::new(), Vec::new(), true)
    } else {
        let DiffResult {
            raw_xml,
            changed_paths,
        } = source.diff(stream_name, prev_tx, tx).await?;
        let empty = changed_paths.is_empty();
        (raw_xml, changed_paths, empty)
    };

    Ok(StepArtifacts {
        tx,
        hist_xml: normalize_task_id(&hist.raw_xml),
        streams_xml: normalize_task_id(&streams.raw_xml),
        diff_xml: normalize_task_id(&diff_xml),
        transaction: hist.transaction,
        snapshot: streams.snapshot,
        changed_paths,
        diff_empty,
    })
}

/// The outcome of a completed (or resumed-and-completed) retrieval pass
/// over a stream: the high-water mark now recorded, plus the tips of
/// `info`/`data` for callers (the planner) that want to avoid a re-read.
pub struct RetrievalOutcome {
    pub hwm: TxId,
    pub info_tip: CommitId,
    pub data_tip: CommitId,
}

/// Retrieves every candidate transaction for `stream` in `(resume, end_tx]`
/// (or performs the initial `mkstream` populate if this stream has never
/// been retrieved before), advancing `info`, `data`, and `hwm` in that
/// order. `work_root` is this stream's exclusive scratch directory for
/// the duration of the call (SPEC_FULL.md §5: "no two retrieval jobs may
/// share the working directory").
#[instrument(skip(source, target, names, work_root, author), fields(stream = stream.0))]
#[allow(clippy::too_many_arguments)]
pub async fn retrieve_stream<S: SourceClient, T: TargetStore>(
    source: &S,
    target: &T,
    names: &StreamNameCache,
    depot: DepotId,
    depot_name: &str,
    stream: StreamId,
    stream_name: &str,
    method: Method,
    mkstream_tx: TxId,
    end_tx: TxId,
    author: &Signature,
    work_root: &Path,
) -> Result<RetrievalOutcome, ConvertError> {
    let info_ref_name = info_ref(depot, stream);
    let data_ref_name = data_ref(depot, stream);
    let hwm_ref_name = hwm_ref(depot, stream);

    let resumed = resume_point(target, depot, stream).await?;

    let (mut last_info, mut last_data, start_after) = match resumed {
        Resume::Ready {
            info_tip,
            data_tip,
            tx,
        } => (Some(info_tip), Some(data_tip), tx),
        Resume::InfoOnly { info_tip, tx } => {
            // Crash window: info/<s> was committed for `tx` but data/<s>
            // never was. Reuse the existing info commit and only redo the
            // data side for the same transaction.
            info!(stream = stream.0, tx = tx.0, "resuming mkstream populate (data only)");
            let data_dir = work_root.join("data");
            tokio::fs::create_dir_all(&data_dir).await?;
            source
                .pop(
                    stream_name,
                    tx,
                    &data_dir,
                    PopOptions {
                        recursive: true,
                        overwrite: true,
                    },
                )
                .await?;
            let data_commit = target
                .commit_tree(
                    &data_ref_name,
                    &data_dir,
                    &format!("transaction {}", tx),
                    author,
                    true,
                    &[],
                )
                .await?;
            target.update_ref(&data_ref_name, data_commit.clone()).await?;
            (Some(info_tip), Some(data_commit), tx)
        }
        Resume::NeverStarted => {
            info!(stream = stream.0, tx = mkstream_tx.0, "performing mkstream populate");
            let step = fetch_step(source, depot_name, stream_name, mkstream_tx, mkstream_tx, true).await?;
            names.observe(&step.snapshot.streams);

            let info_dir = work_root.join("info");
            write_xml_tree(&info_dir, &step.hist_xml, &step.streams_xml, None).await?;
            let info_commit = target
                .commit_tree(
                    &info_ref_name,
                    &info_dir,
                    &format!("transaction {}", mkstream_tx),
                    author,
                    true,
                    &[],
                )
                .await?;
            target.update_ref(&info_ref_name, info_commit.clone()).await?;

            let data_dir = work_root.join("data");
            tokio::fs::create_dir_all(&data_dir).await?;
            source
                .pop(
                    stream_name,
                    mkstream_tx,
                    &data_dir,
                    PopOptions {
                        recursive: true,
                        overwrite: true,
                    },
                )
                .await?;
            let data_commit = target
                .commit_tree(
                    &data_ref_name,
                    &data_dir,
                    &format!("transaction {}", mkstream_tx),
                    author,
                    true,
                    &[],
                )
                .await?;
            target.update_ref(&data_ref_name, data_commit.clone()).await?;

            (Some(info_commit), Some(data_commit), mkstream_tx)
        }
    };

    let candidates: Vec<TxId> = if start_after >= end_tx {
        Vec::new()
    } else {
        match method {
            Method::Pop | Method::Diff => ((start_after.0 + 1)..=end_tx.0).map(TxId).collect(),
            Method::DeepHist => {
                let mut txs = source
                    .deep_hist(
                        depot_name,
                        stream,
                        TxRange {
                            from: TxId(start_after.0 + 1),
                            to: end_tx,
                        },
                    )
                    .await?;
                txs.sort();
                txs.dedup();
                txs
            }
        }
    };

    // Pass 1: info. Fetches metadata for every candidate and commits it;
    // the resulting artifacts feed pass 2 without re-contacting the
    // source (other than `pop` itself).
    let mut artifacts = Vec::with_capacity(candidates.len());
    let mut prev_tx = start_after;
    for tx in &candidates {
        debug!(stream = stream.0, tx = tx.0, "info pass");
        let step = fetch_step(source, depot_name, stream_name, *tx, prev_tx, false).await?;
        names.observe(&step.snapshot.streams);

        let info_dir = work_root.join("info");
        let diff_xml = if step.transaction.is_parse_error_sentinel() {
            None
        } else {
            Some(step.diff_xml.as_str())
        };
        write_xml_tree(&info_dir, &step.hist_xml, &step.streams_xml, diff_xml).await?;
        let parents = last_info.clone().into_iter().collect::<Vec<_>>();
        let commit = target
            .commit_tree(
                &info_ref_name,
                &info_dir,
                &format!("transaction {}", tx),
                author,
                true,
                &parents,
            )
            .await?;
        target.update_ref(&info_ref_name, commit.clone()).await?;
        last_info = Some(commit);
        prev_tx = *tx;
        artifacts.push(step);
    }

    // Pass 2: data.
    let data_dir = work_root.join("data");
    for step in &artifacts {
        debug!(stream = stream.0, tx = step.tx.0, "data pass");
        match method {
            Method::Pop => {
                let _ = tokio::fs::remove_dir_all(&data_dir).await;
                tokio::fs::create_dir_all(&data_dir).await?;
                source
                    .pop(
                        stream_name,
                        step.tx,
                        &data_dir,
                        PopOptions {
                            recursive: true,
                            overwrite: true,
                        },
                    )
                    .await?;
            }
            Method::Diff | Method::DeepHist => {
                if !step.diff_empty {
                    for path in &step.changed_paths {
                        let _ = tokio::fs::remove_file(data_dir.join(path.trim_start_matches('/'))).await;
                    }
                    source
                        .pop(
                            stream_name,
                            step.tx,
                            &data_dir,
                            PopOptions {
                                recursive: true,
                                overwrite: false,
                            },
                        )
                        .await?;
                }
            }
        }

        let parents = last_data.clone().into_iter().collect::<Vec<_>>();
        let commit = target
            .commit_tree(
                &data_ref_name,
                &data_dir,
                &format!("transaction {}", step.tx),
                author,
                true,
                &parents,
            )
            .await?;
        target.update_ref(&data_ref_name, commit.clone()).await?;
        last_data = Some(commit);
    }

    let final_tx = candidates.last().copied().unwrap_or(start_after);
    let hwm_dir = work_root.join("hwm");
    tokio::fs::create_dir_all(&hwm_dir).await?;
    tokio::fs::write(hwm_dir.join("hwm"), final_tx.0.to_string()).await?;
    let hwm_parent = target.read_ref(&hwm_ref_name).await?;
    let hwm_commit = target
        .commit_tree(
            &hwm_ref_name,
            &hwm_dir,
            &format!("transaction {}", final_tx),
            author,
            true,
            &hwm_parent.into_iter().collect::<Vec<_>>(),
        )
        .await?;
    target.update_ref(&hwm_ref_name, hwm_commit).await?;

    info!(stream = stream.0, hwm = final_tx.0, "retrieval pass complete");

    Ok(RetrievalOutcome {
        hwm: final_tx,
        info_tip: last_info.expect("info always committed at least once (mkstream)"),
        data_tip: last_data.expect("data always committed at least once (mkstream)"),
    })
}

//! Processing engine (SPEC_FULL.md §4.5): consumes the planner's ordered
//! transaction stream and emits commits on user-visible branches. Talks to
//! the target store directly only to gather the facts the pure decision
//! functions in [`policy`] need (tip lookups, tree/ancestor checks) and to
//! apply the resulting [`policy::CommitOp`]s.

pub mod policy;

use std::collections::{HashMap, HashSet};

use tracing::{instrument, warn};

use crate::config::Config;
use crate::errors::ConvertError;
use crate::model::{BasisHistory, StreamId, Transaction, TransactionKind, TxId};
use crate::names::StreamNameCache;
use crate::planner::PlannedTransaction;
use crate::refs::visible_branch;
use crate::target::{CommitId, Signature, TargetStore};

use policy::{decide_chstream, decide_child_propagation, decide_mkstream, decide_promote, CommitOp, TrackedSource};

/// Mutable state the engine carries across transactions: the in-memory
/// mirror of every tracked stream's visible-branch tip (so the engine
/// never has to re-read a ref mid-transaction) and each stream's basis
/// history (so `chstream` can compare `basis(tx-1)` with `basis(tx)`).
#[derive(Default)]
pub struct EngineState {
    pub visible_tip: HashMap<StreamId, CommitId>,
    pub basis_history: HashMap<StreamId, BasisHistory>,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One applied commit op, as reported back to the caller (`state.rs` uses
/// this to rewrite `state/last` and append audit commits).
#[derive(Debug, Clone)]
pub struct AppliedOp {
    pub stream: StreamId,
    pub op: CommitOp,
    /// The stream's visible-branch tip after this op (unchanged from
    /// before for a `NoOp`).
    pub new_tip: CommitId,
}

pub struct Engine<'a, T: TargetStore> {
    target: &'a T,
    config: &'a Config,
    names: &'a StreamNameCache,
    tracked: HashSet<StreamId>,
}

impl<'a, T: TargetStore> Engine<'a, T> {
    pub fn new(target: &'a T, config: &'a Config, names: &'a StreamNameCache, tracked: HashSet<StreamId>) -> Self {
        Self {
            target,
            config,
            names,
            tracked,
        }
    }

    fn branch_name(&self, stream: StreamId) -> String {
        self.names.branch_name(stream)
    }

    fn message(&self, tx: &Transaction) -> String {
        if tx.message.is_empty() {
            format!("accurev transaction {}", tx.id)
        } else {
            tx.message.clone()
        }
    }

    fn author(&self, tx: &Transaction) -> Signature {
        let (name, email, _timezone) = crate::config::resolve_author(self.config, &tx.author);
        Signature {
            name,
            email,
            when: tx.timestamp,
        }
    }

    /// Applies one op against the store, returning the resulting tip. A
    /// `NoOp` performs no store call and returns `existing_tip` unchanged.
    async fn apply(
        &self,
        op: &CommitOp,
        existing_tip: Option<CommitId>,
        author: &Signature,
        message: &str,
    ) -> Result<CommitId, ConvertError> {
        match op {
            CommitOp::NoOp { .. } => existing_tip
                .ok_or_else(|| ConvertError::Invariant("no-op on a stream with no prior tip".into())),
            CommitOp::Root { stream, tree } => {
                let commit = self
                    .target
                    .commit_tree_direct(tree.clone(), message, author, &[])
                    .await?;
                self.target
                    .update_ref(&visible_branch(&self.branch_name(*stream)), commit.clone())
                    .await?;
                Ok(commit)
            }
            CommitOp::Merge { stream, parents, tree } => {
                let commit = self
                    .target
                    .commit_tree_direct(tree.clone(), message, author, parents)
                    .await?;
                self.target
                    .update_ref(&visible_branch(&self.branch_name(*stream)), commit.clone())
                    .await?;
                Ok(commit)
            }
            CommitOp::CherryPick { stream, parent, tree } => {
                let commit = self
                    .target
                    .commit_tree_direct(tree.clone(), message, author, std::slice::from_ref(parent))
                    .await?;
                self.target
                    .update_ref(&visible_branch(&self.branch_name(*stream)), commit.clone())
                    .await?;
                Ok(commit)
            }
            CommitOp::FastForward { stream, target } => {
                self.target
                    .update_ref(&visible_branch(&self.branch_name(*stream)), target.clone())
                    .await?;
                Ok(target.clone())
            }
        }
    }

    /// Processes one planner-delivered transaction end to end, returning
    /// every op actually applied (in emission order).
    #[instrument(skip(self, state, planned), fields(tx = planned.transaction.id.0))]
    pub async fn process_transaction(
        &self,
        state: &mut EngineState,
        planned: &PlannedTransaction,
    ) -> Result<Vec<AppliedOp>, ConvertError> {
        let tx = &planned.transaction;
        let mut applied = Vec::new();

        for s in &planned.streams_snapshot.streams {
            state
                .basis_history
                .entry(s.id)
                .or_default()
                .record(tx.id, s.basis);
        }

        if tx.is_parse_error_sentinel() {
            return Ok(applied);
        }

        match tx.kind {
            TransactionKind::MkStream => {
                // Every tracked stream gets an `info`/`data` commit at every
                // transaction in its range (§4.3), so `affected` here
                // ordinarily holds more than just the one stream this
                // particular `mkstream` created. Only a stream with no
                // prior tip is actually being created now; an
                // already-established stream that happens to share this tx
                // id gets a bookkeeping no-op instead of a second, history
                // -discarding root commit.
                for (stream, data_commit) in &planned.affected {
                    let author = self.author(tx);
                    let message = self.message(tx);
                    if let Some(existing) = state.visible_tip.get(stream).cloned() {
                        let op = CommitOp::NoOp { stream: *stream };
                        let new_tip = self.apply(&op, Some(existing), &author, &message).await?;
                        applied.push(AppliedOp { stream: *stream, op, new_tip });
                        continue;
                    }
                    let tree = self.target.tree_of(data_commit).await?;
                    let op = decide_mkstream(*stream, tree);
                    let new_tip = self.apply(&op, None, &author, &message).await?;
                    state.visible_tip.insert(*stream, new_tip.clone());
                    applied.push(AppliedOp { stream: *stream, op, new_tip });
                }
            }
            TransactionKind::ChStream => {
                for (stream, data_commit) in &planned.affected {
                    let tree = self.target.tree_of(data_commit).await?;
                    let history = state.basis_history.entry(*stream).or_default();
                    let prev_basis = tx.id.0.checked_sub(1).map(TxId).and_then(|t| history.basis_at(t));
                    let new_basis = history.basis_at(tx.id);
                    let basis_changed = prev_basis != new_basis;
                    let child_tip = state.visible_tip.get(stream).cloned().ok_or_else(|| {
                        ConvertError::Invariant(format!("chstream on stream {stream} with no prior tip"))
                    })?;
                    let new_basis_tip = new_basis.and_then(|b| state.visible_tip.get(&b).cloned());
                    let op = decide_chstream(*stream, basis_changed, child_tip.clone(), new_basis_tip, tree);
                    let author = self.author(tx);
                    let message = self.message(tx);
                    let new_tip = self.apply(&op, Some(child_tip), &author, &message).await?;
                    state.visible_tip.insert(*stream, new_tip.clone());
                    applied.push(AppliedOp { stream: *stream, op, new_tip });
                }
            }
            _ if tx.to_stream.is_some() => {
                self.process_destination(state, planned, &mut applied).await?;
            }
            _ => {
                // `keep`/`defunct`/`purge`/`move` are workspace-origin: the
                // source reports one depot-wide `hist` record per tx, but
                // every tracked stream still gets a bookkeeping `data`
                // commit at this tx (§4.3), so `affected` is not narrowed
                // to the workspace's own backing stream. The only signal
                // this crate has for which stream the transaction actually
                // happened on is whether that stream's own `data` tree
                // changed at this tx; every other entry is a same-tree
                // bookkeeping commit and must stay untouched.
                for (stream, data_commit) in &planned.affected {
                    let Some(child_tip) = state.visible_tip.get(stream).cloned() else {
                        warn!(stream = stream.0, tx = tx.id.0, "workspace-origin tx for an unmkstreamed stream, skipping");
                        continue;
                    };
                    let data_meta = self.target.show_commit(data_commit).await?;
                    if let Some(prev_data) = data_meta.parents.first() {
                        if !self.target.diff_trees_nonempty(prev_data, data_commit).await? {
                            continue;
                        }
                    }
                    let op = CommitOp::CherryPick {
                        stream: *stream,
                        parent: child_tip.clone(),
                        tree: data_meta.tree,
                    };
                    let author = self.author(tx);
                    let message = self.message(tx);
                    let new_tip = self.apply(&op, Some(child_tip), &author, &message).await?;
                    state.visible_tip.insert(*stream, new_tip.clone());
                    applied.push(AppliedOp { stream: *stream, op, new_tip });
                }
            }
        }

        Ok(applied)
    }

    /// `Promote` (and any transaction with a `toStream`): emits the
    /// destination commit, optionally fast-forwards the source, then
    /// walks tracked descendants depth-first, in stream-id order.
    async fn process_destination(
        &self,
        state: &mut EngineState,
        planned: &PlannedTransaction,
        applied: &mut Vec<AppliedOp>,
    ) -> Result<(), ConvertError> {
        let tx = &planned.transaction;
        let dst = tx.to_stream.expect("checked by caller");
        let (_, dst_data_commit) = planned
            .affected
            .iter()
            .find(|(s, _)| *s == dst)
            .ok_or_else(|| ConvertError::Invariant(format!("destination stream {dst} missing from affected set")))?;
        let tree = self.target.tree_of(dst_data_commit).await?;
        let dst_tip = state
            .visible_tip
            .get(&dst)
            .cloned()
            .ok_or_else(|| ConvertError::Invariant(format!("destination stream {dst} has no prior tip (never mkstreamed)")))?;

        let src = match tx.from_stream {
            Some(s) if self.tracked.contains(&s) => {
                state.visible_tip.get(&s).cloned().map(|tip| TrackedSource { stream: s, tip })
            }
            _ => None,
        };

        let (dst_op, ff_op) = decide_promote(dst, dst_tip.clone(), src, self.config.source_stream_fast_forward, tree);
        let author = self.author(tx);
        let message = self.message(tx);
        let new_dst_tip = self.apply(&dst_op, Some(dst_tip), &author, &message).await?;
        state.visible_tip.insert(dst, new_dst_tip.clone());
        applied.push(AppliedOp {
            stream: dst,
            op: dst_op,
            new_tip: new_dst_tip.clone(),
        });

        if let Some(CommitOp::FastForward { stream: src_stream, .. }) = ff_op {
            let resolved = CommitOp::FastForward {
                stream: src_stream,
                target: new_dst_tip.clone(),
            };
            self.apply(&resolved, None, &author, &message).await?;
            state.visible_tip.insert(src_stream, new_dst_tip.clone());
            applied.push(AppliedOp {
                stream: src_stream,
                op: resolved,
                new_tip: new_dst_tip.clone(),
            });
        }

        // Depth-first, in stream-id order: a `Vec` used as a stack, with
        // each parent's children pushed in descending id order so they
        // pop back off in ascending order.
        let mut stack = vec![(dst, new_dst_tip)];
        while let Some((parent, parent_commit)) = stack.pop() {
            let parent_tree = self.target.tree_of(&parent_commit).await?;
            let mut children: Vec<StreamId> = planned
                .streams_snapshot
                .streams
                .iter()
                .filter(|s| s.basis == Some(parent) && self.tracked.contains(&s.id))
                .map(|s| s.id)
                .collect();
            children.sort_by(|a, b| b.cmp(a));

            for child in children {
                let Some(child_tip) = state.visible_tip.get(&child).cloned() else {
                    warn!(stream = child.0, tx = tx.id.0, "tracked child has no tip yet, skipping propagation");
                    continue;
                };
                let child_tree = match planned.affected.iter().find(|(s, _)| *s == child) {
                    Some((_, data_commit)) => self.target.tree_of(data_commit).await?,
                    None => parent_tree.clone(),
                };
                let trees_equal = child_tree == parent_tree;
                let parent_is_ancestor = self.target.is_ancestor(&parent_commit, &child_tip).await?;
                let op = decide_child_propagation(
                    child,
                    child_tip.clone(),
                    parent_commit.clone(),
                    trees_equal,
                    parent_is_ancestor,
                    self.config.empty_child_stream_action,
                    child_tree,
                );
                let new_child_tip = self.apply(&op, Some(child_tip), &author, &message).await?;
                state.visible_tip.insert(child, new_child_tip.clone());
                applied.push(AppliedOp {
                    stream: child,
                    op,
                    new_tip: new_child_tip.clone(),
                });
                stack.push((child, new_child_tip));
            }
        }

        Ok(())
    }
}

//! Ref-path builders for the namespace layout in SPEC_FULL.md §6. Kept as
//! pure string construction so every other module names a ref the same
//! way, instead of re-deriving the layout at each call site.

use crate::model::{DepotId, StreamId};

/// Namespace prefix every ref in this crate lives under (analogous to
/// `refs/` itself, but scoped so a converted repository's own branches
/// never collide with the engine's bookkeeping refs).
pub const NAMESPACE: &str = "refs/accurev2git";

pub fn info_ref(depot: DepotId, stream: StreamId) -> String {
    format!("{NAMESPACE}/depots/{depot}/streams/{stream}/info")
}

pub fn data_ref(depot: DepotId, stream: StreamId) -> String {
    format!("{NAMESPACE}/depots/{depot}/streams/{stream}/data")
}

pub fn hwm_ref(depot: DepotId, stream: StreamId) -> String {
    format!("{NAMESPACE}/depots/{depot}/streams/{stream}/hwm")
}

pub fn commit_history_ref(depot: DepotId, stream: StreamId) -> String {
    format!("{NAMESPACE}/depots/{depot}/streams/{stream}/commit_history")
}

pub fn state_last_ref(depot: DepotId) -> String {
    format!("{NAMESPACE}/state/depots/{depot}/last")
}

pub fn stream_names_cache_ref(depot: DepotId) -> String {
    format!("{NAMESPACE}/cache/depots/{depot}/stream_names")
}

/// The user-configured visible branch for a stream. Unlike the hidden
/// refs above, this name comes from the stream's own name (subject to
/// whatever branch-naming the embedding binary layers on); the engine
/// only needs a stable mapping, so it uses the plain branch namespace
/// with the stream name verbatim.
pub fn visible_branch(stream_name: &str) -> String {
    format!("refs/heads/{stream_name}")
}

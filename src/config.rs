//! Configuration data consumed by the core. Loading a [`Config`] from an
//! XML or other configuration file is the embedding binary's job (see
//! SPEC_FULL.md §1); this module only defines the shape the core expects
//! to receive, with defaults for every optional field.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::TxId;

/// Which retrieval strategy the per-stream pipeline uses to pick candidate
/// transactions (SPEC_FULL.md §4.3).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    Pop,
    #[default]
    Diff,
    DeepHist,
}

/// The action taken when a child stream's propagated tree matches its
/// basis's new commit tree but the basis commit is not yet an ancestor of
/// the child's tip (SPEC_FULL.md §4.5).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyChildStreamAction {
    #[default]
    Merge,
    CherryPick,
}

/// `start-tx`/`end-tx` accept either a literal transaction id or one of
/// the source-side keywords.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum TxRef {
    Literal(TxId),
    First,
    Highest,
    Now,
}

/// One `user-map` entry: a source username mapped to the identity used on
/// every commit authored by that user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserMapEntry {
    pub name: String,
    pub email: String,
    pub timezone: String,
}

/// The full set of options the core consumes, per SPEC_FULL.md §6.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub depot: String,
    pub streams: Vec<String>,
    pub start_tx: TxRef,
    pub end_tx: TxRef,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub source_stream_fast_forward: bool,
    #[serde(default)]
    pub empty_child_stream_action: EmptyChildStreamAction,
    #[serde(default)]
    pub user_map: HashMap<String, UserMapEntry>,
    pub repo_path: PathBuf,
    /// Maximum number of per-stream retrieval jobs to run concurrently
    /// (SPEC_FULL.md §5); not named in the original option list but
    /// required to bound the retrieval fan-out's resource usage.
    #[serde(default = "default_retrieval_concurrency")]
    pub retrieval_concurrency: usize,
}

fn default_retrieval_concurrency() -> usize {
    4
}

/// Resolves a source username to the identity recorded on its commits,
/// falling back to the raw username (as both name and a synthesized
/// email) when the `user-map` has no entry for it — unmapped users must
/// never block a conversion.
pub fn resolve_author(config: &Config, username: &str) -> (String, String, String) {
    match config.user_map.get(username) {
        Some(entry) => (entry.name.clone(), entry.email.clone(), entry.timezone.clone()),
        None => (
            username.to_string(),
            format!("{username}@localhost"),
            "+0000".to_string(),
        ),
    }
}

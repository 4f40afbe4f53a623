//! Core data model: depots, streams, transactions, and the stream-basis
//! history used to answer "what was stream S's basis at transaction T".
//!
//! Identifiers are newtypes over `i64` rather than bare integers so that a
//! depot id, a stream id, and a transaction id can never be swapped at a
//! call site by accident; the compiler rejects it instead of a reviewer
//! having to notice it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                $name(v)
            }
        }
    };
}

id_newtype!(DepotId);
id_newtype!(StreamId);
id_newtype!(TxId);

/// A source depot: the top-level container of streams and transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depot {
    pub id: DepotId,
    pub name: String,
}

/// `kind` is open-ended on the source side; anything this crate doesn't
/// recognize is preserved verbatim in `Other` rather than rejected, so a
/// source-side addition never breaks parsing of older history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Normal,
    Workspace,
    Gated,
    Other(String),
}

impl StreamKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "normal" => StreamKind::Normal,
            "workspace" => StreamKind::Workspace,
            "gated" => StreamKind::Gated,
            other => StreamKind::Other(other.to_string()),
        }
    }
}

/// A stream's identity and the basis/kind/timelock fields that mutate over
/// time via `chstream`. This struct is a snapshot as of one `show streams`
/// call; see [`BasisHistory`] for how the engine answers "basis at T".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub name: String,
    pub basis: Option<StreamId>,
    pub kind: StreamKind,
    pub timelock: Option<TxId>,
}

/// The full set of streams known to a depot as of one transaction, as
/// returned by `show streams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsSnapshot {
    pub at_tx: TxId,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    MkStream,
    ChStream,
    Promote,
    Keep,
    Defunct,
    Purge,
    Move,
    Other(String),
}

impl TransactionKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "mkstream" => TransactionKind::MkStream,
            "chstream" => TransactionKind::ChStream,
            "promote" => TransactionKind::Promote,
            "keep" => TransactionKind::Keep,
            "defunct" => TransactionKind::Defunct,
            "purge" => TransactionKind::Purge,
            "move" => TransactionKind::Move,
            other => TransactionKind::Other(other.to_string()),
        }
    }
}

/// A single changed element (file) path. Content never needs to travel
/// through this type: it flows through the `data` ref's tree instead, so
/// the engine only ever needs to know *which paths* a transaction touched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementChange {
    pub path: String,
}

/// A single immutable transaction on a depot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub kind: TransactionKind,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Present on promotes when the source depot recorded it; old history
    /// may omit it even for a promote.
    pub from_stream: Option<StreamId>,
    /// Present on promotes and any other transaction with a destination.
    pub to_stream: Option<StreamId>,
    pub elements: Vec<ElementChange>,
}

impl Transaction {
    /// A sentinel transaction recorded when the source returned a
    /// `ParseError` for this id (see §7/§4.3): empty history, no element
    /// changes, preserved as a distinguishable "parse-error" kind so the
    /// engine can treat it as a pure bookkeeping no-op.
    pub fn parse_error_sentinel(id: TxId) -> Self {
        Transaction {
            id,
            kind: TransactionKind::Other("parse-error".to_string()),
            author: String::new(),
            timestamp: DateTime::UNIX_EPOCH,
            message: String::new(),
            from_stream: None,
            to_stream: None,
            elements: Vec::new(),
        }
    }

    pub fn is_parse_error_sentinel(&self) -> bool {
        matches!(&self.kind, TransactionKind::Other(s) if s == "parse-error")
    }
}

/// Per-stream history of basis values recorded at each `show streams`
/// snapshot the retrieval pipeline has observed, ordered by transaction id.
/// "Basis at T" is resolved by binary search rather than by walking a live
/// mutable adjacency list (see SPEC_FULL.md §9): the stream-basis graph is a
/// tree that mutates over time, and modeling it as an append-only event log
/// plus a snapshot cache keeps every past answer stable once recorded.
#[derive(Debug, Clone, Default)]
pub struct BasisHistory {
    // TxId -> basis recorded as of that snapshot.
    snapshots: BTreeMap<TxId, Option<StreamId>>,
}

impl BasisHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the basis observed in a `show streams` snapshot at `at_tx`.
    /// Snapshots are idempotent: recording the same `at_tx` twice with the
    /// same value is a no-op, and recording it with a different value
    /// overwrites (a later retrieval re-observing an already-processed
    /// transaction must agree with the first observation; that agreement
    /// is enforced by the caller, not here).
    pub fn record(&mut self, at_tx: TxId, basis: Option<StreamId>) {
        self.snapshots.insert(at_tx, basis);
    }

    /// The effective basis at transaction `t`: the basis recorded in the
    /// most recent snapshot with `at_tx <= t`, or `None` if no snapshot at
    /// or before `t` has been recorded yet.
    pub fn basis_at(&self, t: TxId) -> Option<StreamId> {
        self.snapshots
            .range(..=t)
            .next_back()
            .and_then(|(_, basis)| *basis)
    }
}

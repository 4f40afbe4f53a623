//! Error types for the conversion engine.
//!
//! This module defines a unified error enumeration used across the source
//! client adapter, the target store adapter, the retrieval pipeline, and
//! the processing engine. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details (transaction id, stream id,
//!   operation name) via its message payload, so operator-visible messages
//!   are self-describing without extra context threading.
//! - Variants map onto the exit-code contract in SPEC_FULL.md §6 via
//!   [`ConvertError::exit_code`].

use thiserror::Error;

use crate::model::{StreamId, TxId};

#[derive(Error, Debug)]
/// Unified error enumeration for the conversion engine.
///
/// - Used across the source adapter, target adapter, retrieval pipeline,
///   and processing engine.
/// - Implements `std::error::Error` via `thiserror`.
pub enum ConvertError {
    /// A transient failure class (login expiry, network) from the source
    /// client. Retried internally by [`crate::source::RetryingSourceClient`];
    /// only escapes here once retries are exhausted.
    #[error("transient source error on tx {tx:?}: {message}")]
    TransientSource { tx: Option<TxId>, message: String },

    /// The source client exited non-zero or otherwise failed in a way that
    /// is not transient. Aborts the current stream's retrieval; other
    /// streams continue.
    #[error("source error (stream {stream:?}, tx {tx:?}, op {op}): {message}")]
    Source {
        stream: Option<StreamId>,
        tx: Option<TxId>,
        op: String,
        message: String,
    },

    /// The source returned ill-formed XML for a particular transaction.
    /// Known to happen for very old transactions; the retrieval pipeline
    /// records a sentinel and continues rather than surfacing this as
    /// fatal (see `Transaction::parse_error_sentinel`).
    #[error("parse error (stream {stream:?}, tx {tx}): {message}")]
    Parse {
        stream: StreamId,
        tx: TxId,
        message: String,
    },

    /// A target store operation failed. Fatal: abort immediately. State
    /// refs remain consistent because every prior `update_ref` was atomic.
    #[error("target store error (op {op}): {message}")]
    Target { op: String, message: String },

    /// The core detected a violated invariant (e.g. info ahead of data by
    /// more than one commit, or a planner/engine ordering violation).
    /// Fatal; maps to exit code 3.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The cooperative stop flag was observed between transactions. Not
    /// itself one of the five taxonomy entries above (it is not a detected
    /// failure, just a requested pause) but still needs its own exit code
    /// (2, restartable).
    #[error("interrupted at tx {0:?}")]
    Interrupted(Option<TxId>),

    /// I/O error from the working-directory scratch space used by
    /// retrieval (pop destinations, temporary pack staging).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Maps this error onto the exit-code contract of SPEC_FULL.md §6:
    /// `0` success, `1` configuration/external-client error, `2`
    /// interrupted (restartable), `3` internal invariant violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConvertError::TransientSource { .. }
            | ConvertError::Source { .. }
            | ConvertError::Parse { .. }
            | ConvertError::Target { .. }
            | ConvertError::Io(_) => 1,
            ConvertError::Interrupted(_) => 2,
            ConvertError::Invariant(_) => 3,
        }
    }

    /// Transient errors are the only class the retry decorator re-issues;
    /// everything else is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConvertError::TransientSource { .. })
    }
}

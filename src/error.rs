// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error taxonomy for the cache. Variants line up with the error kinds the
/// core is required to distinguish: store misses are collapsed to `None`
/// well before they reach here (see [`crate::retry::handle_db_operation`]),
/// everything else propagates as one of these.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("durable store cannot shrink below ceiling for subject {subject}")]
    LimitExceeded { subject: String },

    #[error("requested page {requested} past known end {available}")]
    OutOfRange { requested: usize, available: usize },

    #[error("subject {subject} has {tx_count} txs, exceeds cache limit")]
    PolicyReject { subject: String, tx_count: u64 },

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Transport(_) | CacheError::Storage(_))
    }
}

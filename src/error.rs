//! Error taxonomy for queries and mutations.
//!
//! Fetch failures belong to the external data service and are recorded
//! per-key in the store; query and mutation errors additionally carry what
//! the specific caller needs to know about its own call.

use std::sync::Arc;

use thiserror::Error;

use crate::key::QueryKey;

/// Failure reported by the external fetcher or mutator.
///
/// The cache does not retry these; retry policy belongs to the fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The data service could not be reached.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The data service rejected the operation.
    #[error("application failure: {0}")]
    Application(String),
}

impl FetchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }
}

/// Error returned to a caller awaiting one specific resolution.
///
/// The shared cache state is updated independently of this value; every
/// caller coalesced onto the same fetch observes the same failure.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("fetch for `{key}` failed: {source}")]
    Fetch {
        key: QueryKey,
        #[source]
        source: Arc<FetchError>,
    },
    /// The task running the shared fetch went away before settling it,
    /// e.g. because its caller was cancelled mid-flight.
    #[error("in-flight fetch for `{0}` was abandoned before settling")]
    Abandoned(QueryKey),
}

impl QueryError {
    /// The underlying fetch failure, when there is one.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch { source, .. } => Some(source),
            Self::Abandoned(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    /// Caller-side programming error: a mutation must name the keys its
    /// optimistic projection touches.
    #[error("mutation config names no affected keys")]
    NoAffectedKeys,
    /// The mutator failed; the optimistic write has been rolled back.
    #[error("mutation failed: {source}")]
    Execution {
        #[source]
        source: FetchError,
    },
}

use thiserror::Error;

use crate::events::{RequestId, SessionId};

/// Failure of a single pipeline stage.
///
/// Stage errors are caught at the stage boundary and folded into a `Failed`
/// status; none of them are retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The input could not be interpreted as an image.
    #[error("could not decode image: {0}")]
    Decode(String),

    /// The resized image could not be encoded for upload.
    #[error("could not encode upload payload: {0}")]
    Encode(String),

    /// Transport failure or non-2xx response.
    #[error("network error: {0}")]
    Network(String),

    /// A 2xx response without a usable body.
    #[error("{stage} returned an empty payload")]
    EmptyPayload { stage: &'static str },

    /// A result that belongs to a superseded session or parameter set.
    #[error("stale result for session {session} (request {request:?})")]
    Stale {
        session: SessionId,
        request: Option<RequestId>,
    },

    /// The task running a stage ended without producing a result.
    #[error("stage task failed: {0}")]
    Internal(String),
}

impl StageError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }

    /// Stale results are dropped silently instead of being shown to the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Stale { .. })
    }
}

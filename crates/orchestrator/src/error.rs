use thiserror::Error;

/// Client-facing error for the HTTP-triggered actions. Engine/push
/// failures on setup paths are handled internally (the Call is abandoned,
/// nothing is surfaced) — they never reach this enum.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<kv_store::StoreError> for OrchestratorError {
    fn from(err: kv_store::StoreError) -> Self {
        OrchestratorError::Store(err.to_string())
    }
}

impl From<realtime_store::StoreError> for OrchestratorError {
    fn from(err: realtime_store::StoreError) -> Self {
        OrchestratorError::Store(err.to_string())
    }
}

use thiserror::Error;

/// Tool failures are recovered locally inside the loop and never reach
/// here; LLM and storage failures abort the turn
/// and are surfaced to the caller verbatim.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Upstream(#[from] shrimp_llm::LlmError),

    #[error(transparent)]
    Storage(#[from] shrimp_store::StorageError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

use thiserror::Error;

/// `UpstreamError`: any LLM call failure. The turn orchestrator aborts the
/// turn and surfaces this verbatim rather than retrying.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("upstream error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

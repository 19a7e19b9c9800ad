use thiserror::Error;

/// Shell session manager error taxonomy.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("unknown shell session: {0}")]
    UnknownSession(String),

    /// Returned as a structured result, not raised, by `run_command` callers —
    /// kept as an error variant so `write_stdin`/`close_shell_session` can
    /// still bail with it directly when that is the right shape.
    #[error("session {0} already has a command in flight")]
    SessionBusy(String),

    #[error("failed to spawn shell: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShellError>;

/// Errors from substrate operations.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// The backend could not be reached or refused the request.
    #[error("substrate unavailable: {0}")]
    Unavailable(String),

    /// The backend is read-only and rejected a mutation batch.
    #[error("substrate is read-only, {pending} mutation(s) not applied")]
    ReadOnly { pending: usize },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for substrate operations.
pub type SubstrateResult<T> = Result<T, SubstrateError>;

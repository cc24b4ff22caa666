use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid urn {urn:?}: {reason}")]
    InvalidUrn { urn: String, reason: String },

    #[error("urn {urn} has {depth} components, cannot split at {at}")]
    SplitOutOfRange { urn: String, depth: usize, at: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

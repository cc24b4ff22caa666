use strata_substrate::SubstrateError;
use strata_types::{TypeError, Urn};

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No object (no recorded type) exists at the URN.
    #[error("object not found: {0}")]
    NotFound(Urn),

    /// The stored type disagrees with an explicitly requested type.
    #[error("type mismatch for {urn}: expected {expected}, found {found}")]
    TypeMismatch {
        urn: Urn,
        expected: String,
        found: String,
    },

    /// The attribute is not declared on the resolved type.
    #[error("attribute {attribute} is not declared on type {type_name}")]
    UnknownAttribute { type_name: String, attribute: String },

    /// Lock contention, acquisition timeout, or a write under a dead lease.
    #[error("lock error on {urn}: {reason}")]
    Lock { urn: Urn, reason: String },

    /// A structurally nonsensical request.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Chunks of a stream are missing from the substrate.
    #[error("stream {urn} is missing {} chunk(s)", .missing.len())]
    StreamIntegrity { urn: Urn, missing: Vec<Urn> },

    /// The type name is not registered.
    #[error("unknown object type: {0}")]
    UnknownType(String),

    /// An unbounded read would exceed the configured ceiling.
    #[error("read of {requested} bytes exceeds the limit of {limit} bytes")]
    OversizedRead { requested: u64, limit: u64 },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Value encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] TypeError),

    /// Error from the underlying substrate.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),
}

impl StoreError {
    pub(crate) fn lock(urn: &Urn, reason: impl Into<String>) -> Self {
        Self::Lock {
            urn: urn.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }

    pub fn is_unknown_attribute(&self) -> bool {
        matches!(self, Self::UnknownAttribute { .. })
    }

    pub fn is_lock_error(&self) -> bool {
        matches!(self, Self::Lock { .. })
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }

    /// Conditions batch callers are expected to branch on rather than
    /// propagate.
    pub fn is_recoverable(&self) -> bool {
        self.is_not_found() || self.is_type_mismatch() || self.is_unknown_attribute()
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

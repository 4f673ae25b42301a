use thiserror::Error;

/// The ways a single [`load`][crate::Loader::load] can fail.
///
/// `E` is the error type of the batch function. Because one failure may be
/// handed to many callers, `E` must be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function failed as a whole. Every caller waiting on the
    /// batch receives a copy of this error.
    #[error("batch function failed: {0}")]
    Batch(E),

    /// The batch function succeeded, but reported a failure for this
    /// particular key. Other keys in the same batch are unaffected.
    #[error("failed to load key: {0}")]
    Key(E),

    /// The batch function returned a different number of results than the
    /// number of keys it was given. Since there is no way to tell which
    /// result belongs to which key, the whole batch is discarded.
    #[error("batch function returned {actual} results for {expected} keys")]
    ContractViolation { expected: usize, actual: usize },

    /// The loader's cache key function rejected the key. The key was never
    /// queued.
    #[error("key was rejected by the loader's cache key function")]
    InvalidKey,
}

impl<E> LoadError<E> {
    /// The batch function's own error, if this failure came from one.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            LoadError::Batch(err) | LoadError::Key(err) => Some(err),
            LoadError::ContractViolation { .. } | LoadError::InvalidKey => None,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, LoadError::ContractViolation { .. })
    }
}

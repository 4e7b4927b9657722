/// Create an internal error.
///
/// # Example
/// ```rust
/// use graph_cache::internal_error;
/// use graph_cache::error::CacheError;
/// # fn may_be_none() -> Option<()> { None }
///
/// const NAME: &str = "the thing";
/// let result: Result<(), CacheError> = may_be_none()
///     .ok_or_else(|| internal_error!("Expected {NAME} to be Some"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::CacheError::internal(format!( $( $arg )+ ))
    }
}

/// Break out of the current function, returning an internal error.
#[macro_export]
macro_rules! bail {
    ( $( $arg:tt )+ ) => {
        return Err($crate::internal_error!( $( $arg )+ ))
    }
}

/// A transport failure as reported by the user-supplied transport. The cache
/// wraps it into [`CacheError::Network`] before surfacing it on a response or
/// watcher error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The document cannot be compiled into a plan (unknown fragment spread,
    /// unknown operation name, empty document).
    #[error("{message}")]
    PlanInvalid { message: String },
    /// A `cache-only` query found no complete cached data.
    #[error("no cached data for cache-only query")]
    CacheOnlyMiss,
    /// The transport failed. The original transport error is the source.
    #[error("network error: {0}")]
    Network(#[from] TransportError),
    /// A read produced partial data. This is a diagnostic carried on results,
    /// never a thrown failure.
    #[error("incomplete data: {message}")]
    Incomplete { message: String },
    /// An invariant the cache relies on was violated (e.g. an entity without
    /// `__typename` where one is required).
    #[error("{message}")]
    Invariant { message: String },
    #[error("{message}")]
    Internal { message: String },
}

impl CacheError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn plan_invalid(message: impl Into<String>) -> Self {
        Self::PlanInvalid {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }
}

/// Soft warnings recorded during composition (e.g. an `after` cursor that is
/// not present in the canonical edge list). They always go to the `tracing`
/// channel; debug builds additionally retain them on the cache instance so
/// tests and development tooling can assert on them.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::From)]
#[display(fmt = "{}", message)]
pub struct Diagnostic {
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

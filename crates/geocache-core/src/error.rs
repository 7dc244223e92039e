//! Error types for the feature cache.

use thiserror::Error;

/// Result type alias using CacheError.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Coarse error category surfaced to callers of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lookup miss. Expected; the caller should resolve externally.
    NotFound,
    /// Uniqueness violation on an origin pair, feature id or term.
    Conflict,
    /// Index entry referencing a missing feature.
    Integrity,
    /// Underlying persistence unavailable or failing.
    Storage,
    /// Bad input, configuration or I/O outside the storage engine.
    Invalid,
}

/// Errors that can occur in the feature cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// No feature with this id.
    #[error("Feature not found: {id}")]
    FeatureNotFound { id: String },

    /// No feature for this origin pair.
    #[error("No feature for origin {origin_type}/{origin_id}")]
    OriginNotFound { origin_id: i64, origin_type: String },

    /// Term is not indexed.
    #[error("Term not found: {term:?}")]
    TermNotFound { term: String },

    /// Feature id is already used by a different origin pair.
    #[error("Feature id {id} already belongs to origin {existing_origin}")]
    FeatureConflict { id: String, existing_origin: String },

    /// Term is already bound to a different feature.
    #[error("Term {term:?} is already bound to feature {bound_to}")]
    TermConflict { term: String, bound_to: String },

    /// Index entry points at a feature that does not exist.
    #[error("Integrity violation: {message}")]
    Integrity { message: String },

    /// Database error.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Invalid argument provided.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Malformed feature id.
    #[error("Invalid feature id: {id:?}")]
    InvalidFeatureId { id: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CacheError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FeatureNotFound { .. } | Self::OriginNotFound { .. } | Self::TermNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::FeatureConflict { .. } | Self::TermConflict { .. } => ErrorKind::Conflict,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Storage { .. } | Self::Io(_) => ErrorKind::Storage,
            Self::InvalidArgument { .. }
            | Self::InvalidFeatureId { .. }
            | Self::Serialization(_)
            | Self::Config { .. } => ErrorKind::Invalid,
        }
    }

    /// True for lookup misses.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Get a stable error code, e.g. for CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FeatureNotFound { .. } => "FEATURE_NOT_FOUND",
            Self::OriginNotFound { .. } => "ORIGIN_NOT_FOUND",
            Self::TermNotFound { .. } => "TERM_NOT_FOUND",
            Self::FeatureConflict { .. } => "FEATURE_CONFLICT",
            Self::TermConflict { .. } => "TERM_CONFLICT",
            Self::Integrity { .. } => "INTEGRITY_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::InvalidFeatureId { .. } => "INVALID_FEATURE_ID",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }
}

/// Extension for turning a `NotFound` result into an `Option`.
pub trait OptionalExt<T> {
    /// Map lookup misses to `Ok(None)`, keep every other error.
    fn found(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for Result<T> {
    fn found(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

//! Unified error handling for the bizmap library.
//!
//! One error type covers the batch consolidation path and the query-serving
//! path. The serving path turns most of these into degraded responses; the
//! batch path lets them abort the run.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for bizmap operations.
#[derive(Debug, Error)]
pub enum BizmapError {
    /// A requested category has no stored partition.
    #[error("No partition stored for category '{label}'")]
    MissingData { label: String },

    /// Density clustering could not run on the given input.
    #[error("Clustering failed: {message}")]
    ClusteringFailed { message: String },

    /// The text embedder rejected the input or produced unusable vectors.
    #[error("Embedding failed: {message}")]
    EmbeddingFailed { message: String },

    /// A caller-supplied parameter is out of range.
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    /// The CRS string is not one this crate can project.
    #[error("Unsupported CRS '{crs}'")]
    UnsupportedCrs { crs: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Filesystem error with the path that caused it.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding of a stored artifact failed.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Taxonomy input could not be parsed.
    #[error("Taxonomy error: {message}")]
    Taxonomy { message: String },
}

impl BizmapError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BizmapError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(message: impl ToString) -> Self {
        BizmapError::Serialization {
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid(name: &str, message: impl Into<String>) -> Self {
        BizmapError::InvalidParameter {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Whether the batch pipeline must abort on this error.
    ///
    /// Missing partitions only ever occur on the serving path and are skipped.
    pub fn is_fatal_for_batch(&self) -> bool {
        !matches!(self, BizmapError::MissingData { .. })
    }
}

/// Result type alias for bizmap operations.
pub type Result<T> = std::result::Result<T, BizmapError>;

/// Extension trait for converting Option to BizmapError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a clustering failure.
    fn ok_or_clustering(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_clustering(self, message: &str) -> Result<T> {
        self.ok_or_else(|| BizmapError::ClusteringFailed {
            message: message.to_string(),
        })
    }
}

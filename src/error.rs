//! Error kinds raised by the matrix multiplication workload.

use thiserror::Error;

/// Errors raised while parsing partitions and reducing contributions.
///
/// Each kind has its own recovery scope: a malformed record is dropped, a
/// dimension error aborts its partition and a malformed contribution skips
/// its output key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// An input line could not be decoded into a cell.
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// The partition name does not encode a valid shape, or a cell does not fit it.
    #[error("bad dimension metadata for partition `{partition}`: {reason}")]
    DimensionMetadata { partition: String, reason: String },

    /// An intermediate value could not be used at reduce time.
    #[error("malformed contribution for key `{key}`: {reason}")]
    MalformedContribution { key: String, reason: String },
}

impl MatrixError {
    pub fn record(line: usize, reason: impl Into<String>) -> Self {
        MatrixError::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }

    pub fn dimension(partition: impl Into<String>, reason: impl Into<String>) -> Self {
        MatrixError::DimensionMetadata {
            partition: partition.into(),
            reason: reason.into(),
        }
    }

    pub fn contribution(key: impl Into<String>, reason: impl Into<String>) -> Self {
        MatrixError::MalformedContribution {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error invalidates the whole partition it came from.
    pub fn is_fatal_for_partition(&self) -> bool {
        matches!(self, MatrixError::DimensionMetadata { .. })
    }
}

//! Error types for store operations.

use thiserror::Error;

/// Errors surfaced by the stream store and its components.
///
/// Each variant maps to exactly one HTTP status at the server boundary,
/// see [`StoreError::status_code`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream already exists with different configuration")]
    ConfigMismatch,

    #[error("sequence {received} is not greater than last sequence {last}")]
    SequenceConflict { last: String, received: String },

    #[error("content-type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch { expected: String, actual: String },

    #[error("stream is closed")]
    StreamClosed,

    #[error("stale producer epoch {received}, current epoch is {current}")]
    StaleEpoch { current: i64, received: i64 },

    #[error("producer seq must be 0 at the start of epoch {epoch}, got {received}")]
    InvalidEpochSeq { epoch: i64, received: i64 },

    #[error("producer seq gap: expected {expected}, received {received}")]
    ProducerSeqGap { expected: i64, received: i64 },

    #[error("producer-id, producer-epoch and producer-seq must be set together")]
    PartialProducer,

    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("empty JSON arrays are not allowed on append")]
    EmptyJsonArray,

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("corrupted segment: frame length {len} exceeds the {max} byte limit")]
    CorruptedSegment { len: u64, max: u64 },

    #[error("invalid offset: {0:?}")]
    InvalidOffset(String),

    #[error("empty body not allowed")]
    EmptyBody,

    #[error("cannot specify both TTL and Expires-At")]
    TtlConflict,

    #[error("invalid TTL value")]
    InvalidTtl,

    #[error("invalid Expires-At timestamp")]
    InvalidExpiresAt,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Metadata(#[from] heed::Error),
}

impl StoreError {
    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::ConfigMismatch
            | StoreError::SequenceConflict { .. }
            | StoreError::ContentTypeMismatch { .. }
            | StoreError::StreamClosed
            | StoreError::InvalidEpochSeq { .. }
            | StoreError::ProducerSeqGap { .. } => 409,
            StoreError::StaleEpoch { .. } => 403,
            StoreError::PartialProducer
            | StoreError::InvalidJson(_)
            | StoreError::EmptyJsonArray
            | StoreError::InvalidOffset(_)
            | StoreError::EmptyBody
            | StoreError::TtlConflict
            | StoreError::InvalidTtl
            | StoreError::InvalidExpiresAt => 400,
            StoreError::MessageTooLarge { .. } => 413,
            StoreError::Cancelled
            | StoreError::CorruptedSegment { .. }
            | StoreError::Io(_)
            | StoreError::Metadata(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_cover_protocol_mapping() {
        assert_eq!(StoreError::NotFound("/s".into()).status_code(), 404);
        assert_eq!(StoreError::ConfigMismatch.status_code(), 409);
        assert_eq!(
            StoreError::StaleEpoch {
                current: 2,
                received: 1
            }
            .status_code(),
            403
        );
        assert_eq!(StoreError::PartialProducer.status_code(), 400);
        assert_eq!(
            StoreError::MessageTooLarge {
                size: 1,
                max: 0
            }
            .status_code(),
            413
        );
        assert_eq!(
            StoreError::CorruptedSegment { len: 1, max: 0 }.status_code(),
            500
        );
    }
}

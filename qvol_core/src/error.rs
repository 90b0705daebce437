use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T, E = QvolError> = std::result::Result<T, E>;

/// Status of a compression or decompression job.
///
/// A job reports exactly one of these. Chunk-level codec failures carry the
/// index of the first failing chunk (in chunk order) and the codec's own
/// error, unchanged.
#[derive(Debug, Error)]
pub enum QvolError {
    #[error("no compression mode selected before compress")]
    CompModeUnknown,

    #[error("input holds {actual} values but the volume dimensions need {expected}")]
    WrongLength { expected: usize, actual: usize },

    /// Divide-by-RMS was requested on a buffer whose RMS is zero.
    #[error("cannot condition buffer: divide-by-RMS requested on an all-zero buffer")]
    ZeroRms,

    #[error("invalid dimensions: {0}")]
    InvalidDims(String),

    #[error("invalid QoI configuration: {0}")]
    InvalidQoi(String),

    #[error("chunk {index} failed: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: CodecError,
    },

    #[error("chunk {index} stream is {len} bytes, larger than a u32 length field")]
    ChunkStreamTooLarge { index: usize, len: usize },

    #[error("malformed bitstream: {0}")]
    Bitstream(&'static str),

    #[error("worker pool: {0}")]
    ThreadPool(String),
}

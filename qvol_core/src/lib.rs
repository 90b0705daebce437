pub mod chunk;
pub mod codec;
pub mod compressor;
pub mod conditioner;
pub mod config;
pub mod decompressor;
pub mod error;
pub mod format;
pub mod pool;
pub mod qoi;
pub mod stats;
pub mod tuning;

pub use chunk::{ChunkBox, Dims, Element};
pub use codec::{Codec, CodecError, CompressionMode};
pub use compressor::Compressor;
pub use conditioner::Conditioner;
pub use config::{JobConfig, Precision};
pub use decompressor::Decompressor;
pub use error::{QvolError, Result};
pub use format::{Header, HEADER_BASE_MULTI, HEADER_BASE_SINGLE};
pub use qoi::{Qoi, QoiMeta};
pub use stats::ErrorStats;
pub use tuning::{QoiParams, TuningConstants};

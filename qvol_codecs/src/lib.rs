mod backend;
mod lz4_backend;
mod outlier;
mod passthrough;
mod quant;
mod varint;
mod zstd_backend;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use backend::{Backend, BACKEND_LZ4, BACKEND_NONE, BACKEND_ZSTD};
pub use lz4_backend::Lz4;
pub use passthrough::PassThrough;
pub use quant::{QuantCodec, STREAM_HEADER_SIZE, STREAM_VERSION};
pub use zstd_backend::Zstd;

use qvol_core::CodecError;

/// Resolve a lossless back end from the id stored in a chunk stream.
pub fn backend_by_id(id: u8) -> Result<Box<dyn Backend>, CodecError> {
    match id {
        BACKEND_NONE => Ok(Box::new(PassThrough)),
        BACKEND_ZSTD => Ok(Box::new(Zstd::default())),
        BACKEND_LZ4 => Ok(Box::new(Lz4)),
        _ => Err(CodecError::Corrupt("unknown lossless back end id")),
    }
}

/// User-facing choice of lossless back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    None,
    #[default]
    Zstd,
    Lz4,
}

impl BackendKind {
    pub fn build(self) -> Box<dyn Backend> {
        match self {
            BackendKind::None => Box::new(PassThrough),
            BackendKind::Zstd => Box::new(Zstd::default()),
            BackendKind::Lz4 => Box::new(Lz4),
        }
    }

    /// A codec factory for the compressor and decompressor.
    pub fn codec_factory(self) -> impl Fn() -> QuantCodec + Sync + Send + Copy {
        move || QuantCodec::new(self.build())
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::None => "none",
            BackendKind::Zstd => "zstd",
            BackendKind::Lz4 => "lz4",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "passthrough" => Ok(BackendKind::None),
            "zstd" => Ok(BackendKind::Zstd),
            "lz4" => Ok(BackendKind::Lz4),
            other => Err(format!(
                "unknown back end {other:?}; supported: none, zstd, lz4"
            )),
        }
    }
}

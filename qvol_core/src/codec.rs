use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::qoi::Qoi;

/// Fidelity target for a compression job, carrying its quality value.
///
/// The meaning of the value depends on the variant: bits per value, decibels,
/// absolute point-wise error, or a codec-specific direct quantization knob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "quality", rename_all = "snake_case")]
pub enum CompressionMode {
    Rate(f64),
    Psnr(f64),
    PointwiseTolerance(f64),
    DirectQuality(f64),
}

impl CompressionMode {
    pub fn quality(&self) -> f64 {
        match *self {
            CompressionMode::Rate(q)
            | CompressionMode::Psnr(q)
            | CompressionMode::PointwiseTolerance(q)
            | CompressionMode::DirectQuality(q) => q,
        }
    }

    /// The user's own point-wise error budget, if this mode sets one.
    pub fn pointwise_tolerance(&self) -> Option<f64> {
        match *self {
            CompressionMode::PointwiseTolerance(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        let q = self.quality();
        q.is_finite() && q > 0.0
    }

    /// Hand the fidelity target to a codec through the matching setter.
    pub fn apply<C: Codec + ?Sized>(&self, codec: &mut C) {
        match *self {
            CompressionMode::Rate(bpp) => codec.set_bitrate(bpp),
            CompressionMode::Psnr(db) => codec.set_psnr(db),
            CompressionMode::PointwiseTolerance(t) => codec.set_tolerance(t),
            CompressionMode::DirectQuality(q) => codec.set_direct_quality(q),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("codec has no input data")]
    NoData,

    #[error("codec dims {dims:?} do not match {len} input values")]
    DimMismatch { dims: [usize; 3], len: usize },

    #[error("no fidelity target set on the codec")]
    ModeUnset,

    #[error("invalid quality value {0}")]
    InvalidQuality(f64),

    #[error("corrupt chunk stream: {0}")]
    Corrupt(&'static str),

    #[error("chunk stream checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    Checksum { expected: u64, actual: u64 },

    #[error("lossless back end: {0}")]
    Backend(String),

    #[error("{0}")]
    Other(String),
}

/// Per-chunk lossy codec.
///
/// One instance compresses one chunk at a time: the caller sets dims, hands
/// over the chunk's values, picks exactly one fidelity setter, optionally
/// attaches a QoI model, then calls [`compress`](Codec::compress) and reads
/// the stream back with [`append_encoded_bitstream`](Codec::append_encoded_bitstream).
///
/// Instances are reused across chunks by the same worker, so every setting
/// is overwritten before each chunk. They are never shared between threads
/// while in use, hence `Send` but not `Sync`.
pub trait Codec: Send {
    /// Human-readable codec name for CLI display.
    fn name(&self) -> &'static str;

    fn set_dims(&mut self, dims: [usize; 3]);

    /// Take ownership of the values to compress (x varies fastest).
    fn take_data(&mut self, data: Vec<f64>);

    fn set_bitrate(&mut self, bpp: f64);
    fn set_psnr(&mut self, psnr: f64);
    fn set_tolerance(&mut self, tolerance: f64);
    fn set_direct_quality(&mut self, q: f64);

    fn set_qoi(&mut self, qoi: Box<dyn Qoi>);
    /// Detach any QoI model left over from a previous chunk.
    fn clear_qoi(&mut self);
    fn set_qoi_tolerance(&mut self, tolerance: f64);
    fn set_qoi_block_size(&mut self, block_size: usize);

    fn compress(&mut self, high_prec: bool) -> Result<(), CodecError>;

    /// Append the stream produced by the last `compress` call to `out`.
    fn append_encoded_bitstream(&self, out: &mut Vec<u8>);

    /// Length in bytes of the stream `append_encoded_bitstream` would append.
    fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        self.append_encoded_bitstream(&mut buf);
        buf.len()
    }

    fn use_bitstream(&mut self, stream: &[u8]) -> Result<(), CodecError>;

    /// Extent the next decoded stream must have. Applies to one
    /// `decompress` call; a stream claiming other dims is rejected before
    /// anything is allocated for it.
    fn expect_dims(&mut self, _dims: [usize; 3]) {}

    fn decompress(&mut self) -> Result<(), CodecError>;

    /// Give up the decoded values held by the codec.
    fn release_data(&mut self) -> Vec<f64>;
}

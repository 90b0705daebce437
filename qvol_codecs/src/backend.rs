use std::fmt;

use qvol_core::CodecError;

/// Lossless pass applied to a chunk's quantized payload.
///
/// Each `Backend` implementation:
/// - Is identified by a stable numeric `id()` stored in every chunk stream,
///   so a decoder can pick the right one without being told.
/// - Packs and unpacks one payload at a time with no state carried between
///   calls.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Stable backend ID stored in the chunk stream header.
    fn id(&self) -> u8;

    /// Human-readable backend name for CLI display.
    fn name(&self) -> &'static str;

    fn pack(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// `raw_len` is the unpacked length recorded by the encoder.
    fn unpack(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError>;
}

pub const BACKEND_NONE: u8 = 0;
pub const BACKEND_ZSTD: u8 = 1;
pub const BACKEND_LZ4: u8 = 2;

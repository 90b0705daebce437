use std::io::Read;

use qvol_core::CodecError;

use crate::backend::{Backend, BACKEND_ZSTD};

/// Zstandard back end.
///
/// Quantization indices of smooth fields are dominated by small values and
/// long runs, which zstd at a low level already squeezes well.
#[derive(Debug, Clone, Copy)]
pub struct Zstd {
    /// Compression level (1 = fast / larger, 22 = slow / smallest).
    pub level: i32,
}

impl Default for Zstd {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Zstd {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Backend for Zstd {
    fn id(&self) -> u8 {
        BACKEND_ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn pack(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(raw, self.level).map_err(|e| CodecError::Backend(format!("zstd: {e}")))
    }

    fn unpack(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        // grow with the bytes actually decoded, never past one over the limit
        let decoder = zstd::stream::read::Decoder::new(packed)
            .map_err(|e| CodecError::Backend(format!("zstd: {e}")))?;
        let mut raw = Vec::new();
        decoder
            .take(raw_len as u64 + 1)
            .read_to_end(&mut raw)
            .map_err(|e| CodecError::Backend(format!("zstd: {e}")))?;
        if raw.len() != raw_len {
            return Err(CodecError::Corrupt("zstd payload length mismatch"));
        }
        Ok(raw)
    }
}

use lz4_flex::block::decompress;
use lz4_flex::compress_prepend_size;
use qvol_core::CodecError;

use crate::backend::{Backend, BACKEND_LZ4};

/// LZ4 back end.
///
/// Fastest decode of the bundled back ends, at a worse ratio than zstd.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4;

impl Backend for Lz4 {
    fn id(&self) -> u8 {
        BACKEND_LZ4
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn pack(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(compress_prepend_size(raw))
    }

    fn unpack(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        if packed.len() < 4 {
            return Err(CodecError::Corrupt("lz4 payload shorter than its size prefix"));
        }
        let prefix = u32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]]);
        if prefix as usize != raw_len {
            return Err(CodecError::Corrupt("lz4 payload length mismatch"));
        }
        let raw = decompress(&packed[4..], raw_len)
            .map_err(|e| CodecError::Backend(format!("lz4: {e}")))?;
        if raw.len() != raw_len {
            return Err(CodecError::Corrupt("lz4 payload length mismatch"));
        }
        Ok(raw)
    }
}

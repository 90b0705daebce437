use qvol_core::CodecError;

use crate::backend::{Backend, BACKEND_NONE};

/// Stores the payload verbatim.
///
/// Useful for measuring what the quantizer alone achieves.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Backend for PassThrough {
    fn id(&self) -> u8 {
        BACKEND_NONE
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn pack(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(raw.to_vec())
    }

    fn unpack(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        if packed.len() != raw_len {
            return Err(CodecError::Corrupt("stored payload length mismatch"));
        }
        Ok(packed.to_vec())
    }
}

//! Reversible statistical normalization of a flat value buffer.

use crate::error::{QvolError, Result};

/// Size of the conditioning metadata record: flags, mean, rms.
pub const META_SIZE: usize = 17;

const FLAG_SUBTRACT_MEAN: u8 = 1 << 0;
const FLAG_DIVIDE_BY_RMS: u8 = 1 << 1;

const DEFAULT_STRIDES: usize = 2048;
const MAX_STRIDES: usize = 16_384;

/// Fixed-size record of which transforms were applied and with what values.
pub type ConditionMeta = [u8; META_SIZE];

/// Subtract-mean / divide-by-RMS normalizer.
///
/// Sums are accumulated per equal-size stride and the stride averages are
/// averaged again, which keeps cancellation error bounded on very large
/// buffers.
#[derive(Debug, Clone, Copy)]
pub struct Conditioner {
    subtract_mean: bool,
    divide_by_rms: bool,
}

impl Default for Conditioner {
    fn default() -> Self {
        Self {
            subtract_mean: true,
            divide_by_rms: false,
        }
    }
}

impl Conditioner {
    pub fn new(subtract_mean: bool, divide_by_rms: bool) -> Self {
        Self {
            subtract_mean,
            divide_by_rms,
        }
    }

    pub fn toggle_all_false(&mut self) {
        self.subtract_mean = false;
        self.divide_by_rms = false;
    }

    pub fn toggle_subtract_mean(&mut self, b: bool) {
        self.subtract_mean = b;
    }

    pub fn toggle_divide_by_rms(&mut self, b: bool) {
        self.divide_by_rms = b;
    }

    /// Normalize `buf` in place and return the metadata needed to undo it.
    ///
    /// Fails with [`QvolError::ZeroRms`], leaving `buf` untouched, when
    /// divide-by-RMS is on and every value is zero.
    pub fn condition(&self, buf: &mut [f64]) -> Result<ConditionMeta> {
        if self.divide_by_rms && buf.iter().all(|&v| v == 0.0) {
            return Err(QvolError::ZeroRms);
        }

        let strides = num_strides(buf.len());
        let mut mean = 0.0;
        let mut rms = 1.0;

        if self.subtract_mean {
            mean = strided_mean(buf, strides, |v| v);
            buf.iter_mut().for_each(|v| *v -= mean);
        }

        if self.divide_by_rms {
            rms = strided_mean(buf, strides, |v| v * v).sqrt();
            // Mean removal can leave a constant buffer at exactly zero.
            if rms == 0.0 {
                buf.iter_mut().for_each(|v| *v += mean);
                return Err(QvolError::ZeroRms);
            }
            buf.iter_mut().for_each(|v| *v /= rms);
        }

        let mut flags = 0u8;
        if self.subtract_mean {
            flags |= FLAG_SUBTRACT_MEAN;
        }
        if self.divide_by_rms {
            flags |= FLAG_DIVIDE_BY_RMS;
        }

        let mut meta = [0u8; META_SIZE];
        meta[0] = flags;
        meta[1..9].copy_from_slice(&mean.to_le_bytes());
        meta[9..17].copy_from_slice(&rms.to_le_bytes());
        Ok(meta)
    }

    /// Undo [`condition`](Self::condition): multiply by rms, then add the mean.
    pub fn inverse_condition(&self, buf: &mut [f64], meta: &[u8]) -> Result<()> {
        let (flags, mean, rms) = parse_meta(meta)?;

        if flags & FLAG_DIVIDE_BY_RMS != 0 {
            buf.iter_mut().for_each(|v| *v *= rms);
        }
        if flags & FLAG_SUBTRACT_MEAN != 0 {
            buf.iter_mut().for_each(|v| *v += mean);
        }
        Ok(())
    }

    pub fn meta_size(&self) -> usize {
        META_SIZE
    }
}

fn parse_meta(meta: &[u8]) -> Result<(u8, f64, f64)> {
    if meta.len() < META_SIZE {
        return Err(QvolError::Bitstream("conditioning metadata too short"));
    }
    let mean = f64::from_le_bytes(meta[1..9].try_into().map_err(|_| QvolError::Bitstream("mean"))?);
    let rms = f64::from_le_bytes(meta[9..17].try_into().map_err(|_| QvolError::Bitstream("rms"))?);
    Ok((meta[0], mean, rms))
}

/// Pick a stride count that divides `len` exactly: 2048 if it works, else
/// the first divisor going up to 16 384, else the first going down.
pub(crate) fn num_strides(len: usize) -> usize {
    if len == 0 || len % DEFAULT_STRIDES == 0 {
        return DEFAULT_STRIDES;
    }
    if let Some(n) = (DEFAULT_STRIDES..=MAX_STRIDES).find(|n| len % n == 0) {
        return n;
    }
    (1..DEFAULT_STRIDES)
        .rev()
        .find(|n| len % n == 0)
        .unwrap_or(1)
}

fn strided_mean(buf: &[f64], strides: usize, f: impl Fn(f64) -> f64) -> f64 {
    if buf.is_empty() {
        return 0.0;
    }
    let stride_len = buf.len() / strides;
    let total: f64 = buf
        .chunks_exact(stride_len)
        .map(|s| s.iter().map(|&v| f(v)).sum::<f64>() / stride_len as f64)
        .sum();
    total / strides as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_count_divides_length() {
        assert_eq!(num_strides(4096), 2048);
        assert_eq!(num_strides(9000), 2250);
        assert_eq!(num_strides(17), 17);
        assert_eq!(num_strides(64 * 64 * 64) % 2048, 0);
        for len in [1usize, 7, 31 * 31 * 31, 100_003, 250_000] {
            assert_eq!(len % num_strides(len), 0, "len {len}");
        }
    }
}

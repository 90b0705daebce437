use std::mem;

use tracing::{debug, trace};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use qvol_core::chunk::Dims;
use qvol_core::conditioner::{ConditionMeta, Conditioner, META_SIZE};
use qvol_core::{Codec, CodecError, CompressionMode, Qoi};

use crate::backend::Backend;
use crate::outlier::{correct_outliers, satisfies, Constraints};
use crate::varint::{put_i64, put_u64, Cursor};
use crate::{backend_by_id, Zstd};

/// Chunk stream format version, stored in byte 0.
pub const STREAM_VERSION: u8 = 1;

/// Fixed size of the chunk stream header in bytes.
///   version:u8 + backend:u8 + flags:u8 + dims:3×u32 + condition_meta[17]
///   + step:f64 + raw_len:u64 + checksum:u64
///   = 1 + 1 + 1 + 12 + 17 + 8 + 8 + 8 = 56
///
/// The checksum covers the first 48 header bytes and the packed payload.
pub const STREAM_HEADER_SIZE: usize = 56;

/// Outliers are stored as f64 rather than f32.
const FLAG_WIDE_OUTLIERS: u8 = 1 << 0;

/// Quantization indices beyond this magnitude are stored as outliers.
const MAX_INDEX: f64 = (1u64 << 52) as f64;

const RATE_SEARCH_STEPS: usize = 24;

/// Largest payload a value can need: index varint, outlier delta varint and
/// an f64 outlier.
const MAX_BYTES_PER_VALUE: usize = 10 + 10 + 8;

/// Bytes of the stream header covered by the checksum.
const CHECKED_HEADER: usize = 48;

/// Error-bounded uniform scalar quantizer with outlier correction.
///
/// Each chunk is mean-centred, quantized with a step derived from the
/// fidelity target, and reconstructed exactly the way the decoder will.
/// Values whose reconstruction breaks the point-wise tolerance or the QoI
/// constraint are then stored verbatim. Indices and outliers go through a
/// lossless [`Backend`] and carry an xxh3 checksum.
///
/// # Stream layout
/// ```text
/// [HEADER: 56 bytes]
/// [PACKED PAYLOAD]   ← backend(indices as zigzag varints,
///                                outlier count, (position delta, value) × count)
/// ```
#[derive(Debug)]
pub struct QuantCodec {
    backend: Box<dyn Backend>,
    conditioner: Conditioner,
    dims: Dims,
    data: Vec<f64>,
    mode: Option<CompressionMode>,
    qoi: Option<Box<dyn Qoi>>,
    qoi_tolerance: f64,
    qoi_block_size: usize,
    expected_dims: Option<Dims>,
    encoded: Vec<u8>,
    stream: Vec<u8>,
    decoded: Vec<f64>,
}

impl Default for QuantCodec {
    fn default() -> Self {
        Self::new(Box::new(Zstd::default()))
    }
}

impl QuantCodec {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            conditioner: Conditioner::default(),
            dims: [0; 3],
            data: Vec::new(),
            mode: None,
            qoi: None,
            qoi_tolerance: 0.0,
            qoi_block_size: 1,
            expected_dims: None,
            encoded: Vec::new(),
            stream: Vec::new(),
            decoded: Vec::new(),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Quantization step for the non-rate modes.
    fn step_for(mode: CompressionMode, range: f64) -> f64 {
        match mode {
            CompressionMode::PointwiseTolerance(t) => 2.0 * t,
            CompressionMode::Psnr(db) if range > 0.0 => {
                (12.0 * range * range / 10f64.powf(db / 10.0)).sqrt()
            }
            CompressionMode::Psnr(_) => 1.0,
            CompressionMode::DirectQuality(q) => q,
            // only used as the coarse end of the rate search
            CompressionMode::Rate(_) => (2.0 * range).max(1.0),
        }
    }

    fn encode(
        &self,
        orig: &[f64],
        conditioned: &[f64],
        meta: &ConditionMeta,
        step: f64,
        constraints: &Constraints<'_>,
        high_prec: bool,
    ) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(orig.len() + 16);
        let mut recon = Vec::with_capacity(orig.len());
        let mut overflow = Vec::new();
        for (i, &c) in conditioned.iter().enumerate() {
            let mut q = (c / step).round();
            if !(q.abs() <= MAX_INDEX) {
                q = 0.0;
                overflow.push(i);
            }
            put_i64(&mut payload, q as i64);
            recon.push(q * step);
        }
        self.conditioner
            .inverse_condition(&mut recon, meta)
            .map_err(|e| CodecError::Other(e.to_string()))?;
        // NaN never satisfies a bound, so these become outliers
        for i in overflow {
            recon[i] = f64::NAN;
        }

        let outliers = correct_outliers(orig, &mut recon, self.dims, constraints);
        let wide = high_prec || !narrow_outliers_fit(orig, &recon, &outliers, self.dims, constraints);

        put_u64(&mut payload, outliers.len() as u64);
        let mut prev = 0;
        for &i in &outliers {
            put_u64(&mut payload, (i - prev) as u64);
            prev = i;
            if wide {
                payload.extend_from_slice(&orig[i].to_le_bytes());
            } else {
                payload.extend_from_slice(&(orig[i] as f32).to_le_bytes());
            }
        }

        let packed = self.backend.pack(&payload)?;
        let mut out = Vec::with_capacity(STREAM_HEADER_SIZE + packed.len());
        out.push(STREAM_VERSION);
        out.push(self.backend.id());
        out.push(if wide { FLAG_WIDE_OUTLIERS } else { 0 });
        for &d in &self.dims {
            let d = u32::try_from(d).map_err(|_| CodecError::DimMismatch {
                dims: self.dims,
                len: orig.len(),
            })?;
            out.extend_from_slice(&d.to_le_bytes());
        }
        out.extend_from_slice(meta);
        out.extend_from_slice(&step.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        let checksum = stream_checksum(&out, &packed);
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&packed);

        trace!(step, outliers = outliers.len(), wide, bytes = out.len(), "chunk quantized");
        Ok(out)
    }

    /// Bisect the step on a log scale for the finest one within `bpp`.
    #[allow(clippy::too_many_arguments)]
    fn encode_at_rate(
        &self,
        bpp: f64,
        orig: &[f64],
        conditioned: &[f64],
        meta: &ConditionMeta,
        range: f64,
        constraints: &Constraints<'_>,
        high_prec: bool,
    ) -> Result<Vec<u8>, CodecError> {
        let n = orig.len() as f64;
        let bits = |s: &[u8]| s.len() as f64 * 8.0 / n;

        let mut hi = Self::step_for(CompressionMode::Rate(bpp), range);
        let mut best = self.encode(orig, conditioned, meta, hi, constraints, high_prec)?;
        if bits(&best) > bpp || range == 0.0 {
            return Ok(best);
        }

        let mut lo = (hi * f64::powi(2.0, -40)).max(f64::MIN_POSITIVE);
        for _ in 0..RATE_SEARCH_STEPS {
            let mid = (lo * hi).sqrt();
            let candidate = self.encode(orig, conditioned, meta, mid, constraints, high_prec)?;
            if bits(&candidate) <= bpp {
                best = candidate;
                hi = mid;
            } else {
                lo = mid;
            }
        }
        debug!(bpp, step = hi, achieved = bits(&best), "rate search finished");
        Ok(best)
    }
}

/// Whether storing the outliers as f32 still satisfies every constraint.
fn narrow_outliers_fit(
    orig: &[f64],
    recon: &[f64],
    outliers: &[usize],
    dims: Dims,
    constraints: &Constraints<'_>,
) -> bool {
    if outliers.is_empty() {
        return true;
    }
    let mut trial = recon.to_vec();
    for &i in outliers {
        trial[i] = orig[i] as f32 as f64;
    }
    satisfies(orig, &trial, dims, constraints)
}

impl Codec for QuantCodec {
    fn name(&self) -> &'static str {
        "quant"
    }

    fn set_dims(&mut self, dims: [usize; 3]) {
        self.dims = dims;
    }

    fn take_data(&mut self, data: Vec<f64>) {
        self.data = data;
    }

    fn set_bitrate(&mut self, bpp: f64) {
        self.mode = Some(CompressionMode::Rate(bpp));
    }

    fn set_psnr(&mut self, psnr: f64) {
        self.mode = Some(CompressionMode::Psnr(psnr));
    }

    fn set_tolerance(&mut self, tolerance: f64) {
        self.mode = Some(CompressionMode::PointwiseTolerance(tolerance));
    }

    fn set_direct_quality(&mut self, q: f64) {
        self.mode = Some(CompressionMode::DirectQuality(q));
    }

    fn set_qoi(&mut self, qoi: Box<dyn Qoi>) {
        self.qoi = Some(qoi);
    }

    fn clear_qoi(&mut self) {
        self.qoi = None;
        self.qoi_block_size = 1;
    }

    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.qoi_tolerance = tolerance;
    }

    fn set_qoi_block_size(&mut self, block_size: usize) {
        self.qoi_block_size = block_size.max(1);
    }

    /// Consumes the data handed over by `take_data`.
    fn compress(&mut self, high_prec: bool) -> Result<(), CodecError> {
        self.encoded.clear();
        if self.data.is_empty() {
            return Err(CodecError::NoData);
        }
        if self.dims.iter().product::<usize>() != self.data.len() {
            return Err(CodecError::DimMismatch {
                dims: self.dims,
                len: self.data.len(),
            });
        }
        let mode = self.mode.ok_or(CodecError::ModeUnset)?;
        if !mode.is_valid() {
            return Err(CodecError::InvalidQuality(mode.quality()));
        }
        if self.data.iter().any(|v| !v.is_finite()) {
            return Err(CodecError::Other("non-finite input value".into()));
        }

        let orig = mem::take(&mut self.data);
        let (lo, hi) = orig
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = hi - lo;

        let mut conditioned = orig.clone();
        let meta = self
            .conditioner
            .condition(&mut conditioned)
            .map_err(|e| CodecError::Other(e.to_string()))?;

        let constraints = Constraints {
            tolerance: mode.pointwise_tolerance().unwrap_or(f64::INFINITY),
            qoi: self.qoi.as_deref(),
            qoi_tolerance: self.qoi_tolerance,
            qoi_block_size: self.qoi_block_size,
        };

        self.encoded = match mode {
            CompressionMode::Rate(bpp) => self.encode_at_rate(
                bpp,
                &orig,
                &conditioned,
                &meta,
                range,
                &constraints,
                high_prec,
            )?,
            _ => {
                let step = Self::step_for(mode, range);
                self.encode(&orig, &conditioned, &meta, step, &constraints, high_prec)?
            }
        };
        Ok(())
    }

    fn append_encoded_bitstream(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.encoded);
    }

    fn encoded_len(&self) -> usize {
        self.encoded.len()
    }

    fn use_bitstream(&mut self, stream: &[u8]) -> Result<(), CodecError> {
        if stream.len() < STREAM_HEADER_SIZE {
            return Err(CodecError::Corrupt("stream shorter than its header"));
        }
        if stream[0] != STREAM_VERSION {
            return Err(CodecError::Corrupt("unsupported stream version"));
        }
        self.stream.clear();
        self.stream.extend_from_slice(stream);
        Ok(())
    }

    fn expect_dims(&mut self, dims: [usize; 3]) {
        self.expected_dims = Some(dims);
    }

    fn decompress(&mut self) -> Result<(), CodecError> {
        let expected_dims = self.expected_dims.take();
        let s = &self.stream;
        if s.len() < STREAM_HEADER_SIZE {
            return Err(CodecError::Corrupt("no stream loaded"));
        }
        let backend = backend_by_id(s[1])?;
        let wide = s[2] & FLAG_WIDE_OUTLIERS != 0;
        let dims: Dims = std::array::from_fn(|i| read_u32(s, 3 + 4 * i) as usize);
        if expected_dims.is_some_and(|e| e != dims) {
            return Err(CodecError::Corrupt("stream dims differ from the chunk extent"));
        }
        let meta = &s[15..15 + META_SIZE];
        let step = f64::from_le_bytes(read_8(s, 32));
        let raw_len = u64::from_le_bytes(read_8(s, 40));
        let expected = u64::from_le_bytes(read_8(s, 48));

        let packed = &s[STREAM_HEADER_SIZE..];
        let actual = stream_checksum(&s[..CHECKED_HEADER], packed);
        if actual != expected {
            return Err(CodecError::Checksum { expected, actual });
        }

        let n = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or(CodecError::Corrupt("chunk dims overflow"))?;
        let max_raw = n
            .checked_mul(MAX_BYTES_PER_VALUE)
            .and_then(|m| m.checked_add(10))
            .ok_or(CodecError::Corrupt("chunk dims overflow"))?;
        // every value takes at least one byte, plus the outlier count
        let raw_len = usize::try_from(raw_len)
            .ok()
            .filter(|&r| r > n && r <= max_raw)
            .ok_or(CodecError::Corrupt("payload length does not fit the chunk dims"))?;
        let payload = backend.unpack(packed, raw_len)?;

        let mut cur = Cursor::new(&payload);
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(cur.i64()? as f64 * step);
        }
        self.conditioner
            .inverse_condition(&mut values, meta)
            .map_err(|e| CodecError::Other(e.to_string()))?;

        let count = cur.u64()?;
        if count > n as u64 {
            return Err(CodecError::Corrupt("more outliers than values"));
        }
        let mut pos = 0usize;
        for _ in 0..count {
            pos = usize::try_from(cur.u64()?)
                .ok()
                .and_then(|d| pos.checked_add(d))
                .filter(|&p| p < n)
                .ok_or(CodecError::Corrupt("outlier position out of range"))?;
            values[pos] = if wide {
                f64::from_le_bytes(cur.bytes::<8>()?)
            } else {
                f64::from(f32::from_le_bytes(cur.bytes::<4>()?))
            };
        }
        if !cur.is_empty() {
            return Err(CodecError::Corrupt("trailing payload bytes"));
        }

        self.dims = dims;
        self.decoded = values;
        Ok(())
    }

    fn release_data(&mut self) -> Vec<f64> {
        mem::take(&mut self.decoded)
    }
}

fn stream_checksum(header: &[u8], packed: &[u8]) -> u64 {
    xxh3_64_with_seed(packed, xxh3_64(&header[..CHECKED_HEADER]))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_8(buf: &[u8], at: usize) -> [u8; 8] {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    b
}

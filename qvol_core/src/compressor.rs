use rayon::prelude::*;
use tracing::{debug, info};

use crate::chunk::{
    align_to_qoi_block, chunk_volume, clamp_chunk_dims, gather_chunk, ChunkBox, Dims, Element,
};
use crate::codec::{Codec, CodecError, CompressionMode};
use crate::error::{QvolError, Result};
use crate::format::generate_header;
use crate::pool::CodecPool;
use crate::tuning::{QoiParams, QoiTuner, TuningConstants};

/// Default preferred chunk extent along each axis.
pub const DEFAULT_CHUNK_DIMS: Dims = [256, 256, 256];

/// Chunked, parallel volume compressor.
///
/// # Compress contract
/// Set the volume and preferred chunk dims, exactly one fidelity target, and
/// optionally QoI parameters, then call [`compress`](Self::compress) with a
/// flat x-fastest buffer. On success the bitstream is available from
/// [`get_encoded_bitstream`](Self::get_encoded_bitstream); on failure no
/// bitstream is kept.
///
/// # Layout produced
/// ```text
/// [HEADER: 14 or 20 bytes + 4 × N chunk lengths]
/// [CHUNK 0] [CHUNK 1] ... [CHUNK N-1]      ← independent codec streams
/// ```
///
/// `factory` builds one codec per worker thread; with an active QoI it also
/// builds the throwaway codecs used for trial compression.
pub struct Compressor<F> {
    factory: F,
    num_threads: usize,
    vol_dims: Dims,
    chunk_dims: Dims,
    mode: Option<CompressionMode>,
    qoi: QoiParams,
    tuning: TuningConstants,
    high_prec: bool,

    /// Chunk dims after clamping and QoI alignment, set by `compress`.
    effective_chunk_dims: Dims,
    orig_is_float: bool,
    header: Vec<u8>,
    streams: Vec<Vec<u8>>,
}

impl<F> Compressor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            num_threads: 0,
            vol_dims: [0; 3],
            chunk_dims: DEFAULT_CHUNK_DIMS,
            mode: None,
            qoi: QoiParams::default(),
            tuning: TuningConstants::default(),
            high_prec: false,
            effective_chunk_dims: [0; 3],
            orig_is_float: false,
            header: Vec::new(),
            streams: Vec::new(),
        }
    }

    /// Worker count; 0 uses all available hardware threads.
    pub fn set_num_threads(&mut self, n: usize) {
        self.num_threads = n;
    }

    pub fn set_dims_and_chunks(&mut self, vol_dims: Dims, chunk_dims: Dims) {
        self.vol_dims = vol_dims;
        self.chunk_dims = chunk_dims;
    }

    pub fn set_mode(&mut self, mode: CompressionMode) {
        self.mode = Some(mode);
    }

    pub fn set_bitrate(&mut self, bpp: f64) {
        self.set_mode(CompressionMode::Rate(bpp));
    }

    pub fn set_psnr(&mut self, psnr: f64) {
        self.set_mode(CompressionMode::Psnr(psnr));
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.set_mode(CompressionMode::PointwiseTolerance(tolerance));
    }

    pub fn set_direct_quality(&mut self, q: f64) {
        self.set_mode(CompressionMode::DirectQuality(q));
    }

    pub fn set_qoi_params(&mut self, params: QoiParams) {
        self.qoi = params;
    }

    pub fn set_tuning_constants(&mut self, constants: TuningConstants) {
        self.tuning = constants;
    }

    pub fn set_high_prec(&mut self, high_prec: bool) {
        self.high_prec = high_prec;
    }

    /// Chunk extent used by the last successful `compress`.
    pub fn effective_chunk_dims(&self) -> Dims {
        self.effective_chunk_dims
    }

    /// Chunk extent `compress` would use with the current settings.
    pub fn plan_chunk_dims(&self) -> Dims {
        let clamped = clamp_chunk_dims(self.vol_dims, self.chunk_dims);
        match self.qoi.alignment() {
            Some(block) => align_to_qoi_block(clamped, block),
            None => clamped,
        }
    }

    /// Whether the last compressed volume was single precision.
    pub fn orig_is_float(&self) -> bool {
        self.orig_is_float
    }

    pub fn num_chunks(&self) -> usize {
        self.streams.len()
    }

    /// Header bytes of the last successful `compress`.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn chunk_streams(&self) -> &[Vec<u8>] {
        &self.streams
    }

    /// Header followed by every chunk stream, or empty before a successful
    /// `compress`.
    pub fn get_encoded_bitstream(&self) -> Vec<u8> {
        if self.header.is_empty() {
            return Vec::new();
        }
        let total = self.header.len() + self.streams.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.header);
        for s in &self.streams {
            out.extend_from_slice(s);
        }
        out
    }

    /// Compress a volume stored as `T` (f32 or f64).
    pub fn compress<T, C>(&mut self, buf: &[T]) -> Result<()>
    where
        T: Element,
        C: Codec,
        F: Fn() -> C + Sync,
    {
        self.header.clear();
        self.streams.clear();

        let mode = self.mode.ok_or(QvolError::CompModeUnknown)?;
        if self.vol_dims.contains(&0) {
            return Err(QvolError::InvalidDims(format!(
                "volume dims {:?} contain a zero",
                self.vol_dims
            )));
        }
        let expected: usize = self.vol_dims.iter().product();
        if buf.len() != expected {
            return Err(QvolError::WrongLength {
                expected,
                actual: buf.len(),
            });
        }

        let chunk_dims = self.plan_chunk_dims();
        let boxes = chunk_volume(self.vol_dims, chunk_dims);
        let tuner = QoiTuner::new(
            &self.qoi,
            &self.tuning,
            self.vol_dims,
            mode.pointwise_tolerance(),
            self.high_prec,
        )?;
        let pool = CodecPool::new(self.num_threads)?;

        info!(
            dims = ?self.vol_dims,
            chunk_dims = ?chunk_dims,
            chunks = boxes.len(),
            workers = pool.num_workers(),
            ?mode,
            qoi = tuner.is_some(),
            "compressing volume"
        );

        let job = ChunkJob {
            vol: buf,
            vol_dims: self.vol_dims,
            mode,
            high_prec: self.high_prec,
            tuner: tuner.as_ref(),
            qoi_block_size: self.qoi.block_size.max(1),
            factory: &self.factory,
            pool: &pool,
        };

        let results: Vec<Result<Vec<u8>, CodecError>> = pool.install(|| {
            boxes
                .par_iter()
                .enumerate()
                .map(|(index, chunk)| job.run(index, chunk))
                .collect()
        });

        let mut streams = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            streams.push(result.map_err(|source| QvolError::Chunk { index, source })?);
        }

        let header = generate_header(self.vol_dims, chunk_dims, &streams, T::IS_F32)?;
        if header.is_empty() {
            return Err(QvolError::Bitstream("chunk stream count does not match the partition"));
        }

        let payload: usize = streams.iter().map(Vec::len).sum();
        info!(
            header_bytes = header.len(),
            payload_bytes = payload,
            bpp = (header.len() + payload) as f64 * 8.0 / expected as f64,
            "compression finished"
        );

        self.effective_chunk_dims = chunk_dims;
        self.orig_is_float = T::IS_F32;
        self.header = header;
        self.streams = streams;
        Ok(())
    }
}

/// Read-only state shared by every chunk task of one job.
struct ChunkJob<'a, T, C, F> {
    vol: &'a [T],
    vol_dims: Dims,
    mode: CompressionMode,
    high_prec: bool,
    tuner: Option<&'a QoiTuner>,
    qoi_block_size: usize,
    factory: &'a F,
    pool: &'a CodecPool<C>,
}

impl<T, C, F> ChunkJob<'_, T, C, F>
where
    T: Element,
    C: Codec,
    F: Fn() -> C + Sync,
{
    fn run(&self, index: usize, chunk: &ChunkBox) -> Result<Vec<u8>, CodecError> {
        let data = gather_chunk(self.vol, self.vol_dims, chunk);
        assert!(!data.is_empty(), "chunk {index} box {chunk:?} lies outside the volume");
        let dims = chunk.dims();

        let tuning = match self.tuner {
            Some(tuner) => Some(tuner.tune(&data, dims, self.factory)?),
            None => None,
        };

        self.pool.with_codec(self.factory, |codec| -> Result<Vec<u8>, CodecError> {
            codec.set_dims(dims);
            codec.take_data(data);
            codec.clear_qoi();
            match (tuning, self.tuner) {
                (Some(tuned), Some(tuner)) => {
                    codec.set_tolerance(tuned.tolerance);
                    if let Some(qoi) = tuned.qoi {
                        codec.set_qoi(qoi);
                        codec.set_qoi_tolerance(tuner.plan().nominal_tolerance);
                        codec.set_qoi_block_size(self.qoi_block_size);
                    }
                }
                _ => self.mode.apply(codec),
            }
            codec.compress(self.high_prec)?;

            let mut out = Vec::new();
            codec.append_encoded_bitstream(&mut out);
            debug!(index, offset = ?chunk.offset, len = ?chunk.len, bytes = out.len(), "chunk compressed");
            Ok(out)
        })
    }
}

use rayon::prelude::*;
use tracing::{debug, info};

use crate::chunk::{scatter_chunk, Dims, Element};
use crate::codec::{Codec, CodecError};
use crate::error::{QvolError, Result};
use crate::format::{Header, FLAG_PARTIAL_STREAM};
use crate::pool::CodecPool;

/// Parallel decoder for bitstreams written by [`Compressor`](crate::Compressor).
///
/// # Decode sequence
/// 1. [`use_bitstream`](Self::use_bitstream) parses the header, rebuilds the
///    chunk partition from the stored dims and checks that the payload holds
///    exactly the bytes the length table promises.
/// 2. [`decompress`](Self::decompress) decodes every chunk with a per-worker
///    codec and scatters it into a volume of `x·y·z` values.
pub struct Decompressor<F> {
    factory: F,
    num_threads: usize,
    header: Option<Header>,
    payload: Vec<u8>,
    volume: Vec<f64>,
}

impl<F> Decompressor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            num_threads: 0,
            header: None,
            payload: Vec::new(),
            volume: Vec::new(),
        }
    }

    /// Worker count; 0 uses all available hardware threads.
    pub fn set_num_threads(&mut self, n: usize) {
        self.num_threads = n;
    }

    /// Parse and keep a bitstream for decoding.
    pub fn use_bitstream(&mut self, bytes: &[u8]) -> Result<()> {
        self.header = None;
        self.payload.clear();
        self.volume.clear();

        let header = Header::from_bytes(bytes)?;
        if header.has_flag(FLAG_PARTIAL_STREAM) {
            return Err(QvolError::Bitstream("partial-stream bitstreams are not supported"));
        }

        let start = header.header_len();
        let expected = header.payload_len();
        let actual = bytes.len() - start;
        if actual < expected {
            return Err(QvolError::Bitstream("truncated chunk payload"));
        }
        if actual > expected {
            return Err(QvolError::Bitstream("trailing bytes after the last chunk"));
        }

        self.payload = bytes[start..].to_vec();
        self.header = Some(header);
        Ok(())
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn dims(&self) -> Dims {
        self.header.as_ref().map_or([0; 3], |h| h.vol_dims)
    }

    /// Whether the compressed volume was single precision.
    pub fn orig_is_float(&self) -> bool {
        self.header.as_ref().is_some_and(Header::orig_is_float)
    }

    /// Decode every chunk into the output volume.
    pub fn decompress<C>(&mut self) -> Result<()>
    where
        C: Codec,
        F: Fn() -> C + Sync,
    {
        let header = self
            .header
            .as_ref()
            .ok_or(QvolError::Bitstream("no bitstream loaded"))?;
        let boxes = header.chunk_boxes();
        let ranges = header.chunk_ranges();
        let pool = CodecPool::new(self.num_threads)?;

        info!(
            dims = ?header.vol_dims,
            chunks = boxes.len(),
            workers = pool.num_workers(),
            "decompressing volume"
        );

        let payload = &self.payload;
        let factory = &self.factory;
        let results: Vec<Result<Vec<f64>, CodecError>> = pool.install(|| {
            boxes
                .par_iter()
                .zip(ranges.par_iter())
                .enumerate()
                .map(|(index, (chunk, range))| {
                    pool.with_codec(factory, |codec| -> Result<Vec<f64>, CodecError> {
                        codec.use_bitstream(&payload[range.clone()])?;
                        codec.expect_dims(chunk.dims());
                        codec.decompress()?;
                        let data = codec.release_data();
                        if data.len() != chunk.num_values() {
                            return Err(CodecError::Corrupt("decoded chunk has the wrong length"));
                        }
                        debug!(index, values = data.len(), "chunk decompressed");
                        Ok(data)
                    })
                })
                .collect()
        });

        let mut volume = Vec::new();
        volume
            .try_reserve_exact(header.num_values())
            .map_err(|_| QvolError::Bitstream("volume too large to allocate"))?;
        volume.resize(header.num_values(), 0.0);
        for (index, (result, chunk)) in results.into_iter().zip(&boxes).enumerate() {
            let data = result.map_err(|source| QvolError::Chunk { index, source })?;
            if !scatter_chunk(&mut volume, header.vol_dims, chunk, &data) {
                return Err(QvolError::Bitstream("chunk box outside the volume"));
            }
        }

        self.volume = volume;
        Ok(())
    }

    /// Decoded values, x fastest.
    pub fn view_data(&self) -> &[f64] {
        &self.volume
    }

    /// Take the decoded volume in the requested precision.
    pub fn release_decoded_data<T: Element>(&mut self) -> Vec<T> {
        std::mem::take(&mut self.volume)
            .into_iter()
            .map(T::from_f64)
            .collect()
    }
}

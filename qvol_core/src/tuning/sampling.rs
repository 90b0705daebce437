//! Representative sub-block sampling for rate/distortion trials.
//!
//! Candidate blocks sit on a lattice with spacing `edge` and extent
//! `edge + 1` per axis. A cheap profiling pass looks at a coarse sub-lattice
//! of each block and keeps the blocks whose values vary by more than a
//! threshold; when enough blocks qualify, sampling draws from those,
//! otherwise from the whole lattice.

use crate::chunk::{gather_chunk, ChunkBox, Dims};

/// Blocks handed to the trial codec. All blocks share `dims`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub dims: Dims,
    pub blocks: Vec<Vec<f64>>,
}

impl Sample {
    pub fn num_values(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }
}

fn axis_origins(extent: usize, edge: usize) -> impl Iterator<Item = usize> {
    let count = if edge == 0 || extent == 0 { 0 } else { (extent - 1) / edge };
    (0..count).map(move |i| i * edge)
}

/// Number of lattice blocks that fit in a chunk.
pub fn lattice_len(dims: Dims, edge: usize) -> usize {
    dims.iter().map(|&d| axis_origins(d, edge).count()).product()
}

fn lattice(dims: Dims, edge: usize) -> Vec<[usize; 3]> {
    let mut out = Vec::new();
    for z in axis_origins(dims[2], edge) {
        for y in axis_origins(dims[1], edge) {
            for x in axis_origins(dims[0], edge) {
                out.push([x, y, z]);
            }
        }
    }
    out
}

/// Origins of the lattice blocks whose strided points spread wider than
/// `threshold`, in lattice order.
pub fn profile_blocks(
    chunk: &[f64],
    dims: Dims,
    edge: usize,
    threshold: f64,
    stride: usize,
) -> Vec<[usize; 3]> {
    let stride = stride.max(1);
    let plane = dims[0] * dims[1];
    let mut kept = Vec::new();

    for origin in lattice(dims, edge) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for z in (origin[2]..=origin[2] + edge).step_by(stride) {
            for y in (origin[1]..=origin[1] + edge).step_by(stride) {
                for x in (origin[0]..=origin[0] + edge).step_by(stride) {
                    let v = chunk[z * plane + y * dims[0] + x];
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            }
        }
        if hi - lo > threshold {
            kept.push(origin);
        }
    }
    kept
}

/// Whether enough blocks passed profiling to sample from them alone.
pub fn profiling_qualifies(kept: usize, total: usize, sample_rate: f64, factor: f64) -> bool {
    let needed = (factor * sample_rate * total as f64).floor();
    kept as f64 > needed
}

/// Draw about `sample_rate` of the lattice, evenly spaced over either the
/// profiled blocks or the whole lattice.
///
/// A chunk too small to hold a single block becomes its own sample.
pub fn sample_blocks(
    chunk: &[f64],
    dims: Dims,
    edge: usize,
    sample_rate: f64,
    profiled: Option<&[[usize; 3]]>,
) -> Sample {
    let total = lattice_len(dims, edge);
    if total == 0 {
        return Sample {
            dims,
            blocks: vec![chunk.to_vec()],
        };
    }

    let wanted = ((total as f64 * sample_rate).round() as usize).max(1);
    let pool: Vec<[usize; 3]> = match profiled {
        Some(origins) if !origins.is_empty() => origins.to_vec(),
        _ => lattice(dims, edge),
    };
    let take = wanted.min(pool.len());

    let extent = [edge + 1; 3];
    let blocks = (0..take)
        .map(|i| {
            let origin = pool[i * pool.len() / take];
            gather_chunk(chunk, dims, &ChunkBox::new(origin, extent))
        })
        .collect();

    Sample {
        dims: extent,
        blocks,
    }
}

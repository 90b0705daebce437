//! Volume partitioning into independently compressed chunks, plus the
//! gather/scatter helpers that move a chunk between the flat volume buffer
//! and a contiguous per-chunk buffer.
//!
//! Every buffer in this crate is laid out with x varying fastest and z
//! slowest.

/// Extent of a volume or chunk along x, y, z.
pub type Dims = [usize; 3];

/// Floating-point element types a volume can be stored in.
pub trait Element: Copy + Into<f64> + Send + Sync + 'static {
    /// Whether the type is single precision.
    const IS_F32: bool;

    fn from_f64(v: f64) -> Self;
}

impl Element for f32 {
    const IS_F32: bool = true;

    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    const IS_F32: bool = false;

    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Axis-aligned sub-region of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkBox {
    pub offset: [usize; 3],
    pub len: [usize; 3],
}

impl ChunkBox {
    pub fn new(offset: [usize; 3], len: [usize; 3]) -> Self {
        Self { offset, len }
    }

    /// The six-number form: (offset_x, len_x, offset_y, len_y, offset_z, len_z).
    pub fn as_array(&self) -> [usize; 6] {
        [
            self.offset[0],
            self.len[0],
            self.offset[1],
            self.len[1],
            self.offset[2],
            self.len[2],
        ]
    }

    pub fn dims(&self) -> Dims {
        self.len
    }

    pub fn num_values(&self) -> usize {
        self.len.iter().product()
    }

    /// Whether the box lies entirely inside a volume of extent `vol`.
    pub fn fits(&self, vol: Dims) -> bool {
        (0..3).all(|i| {
            self.offset[i]
                .checked_add(self.len[i])
                .is_some_and(|end| end <= vol[i])
        })
    }
}

/// Clamp each preferred chunk length to `[1, vol[axis]]`.
pub fn clamp_chunk_dims(vol: Dims, preferred: Dims) -> Dims {
    let mut out = [0; 3];
    for i in 0..3 {
        out[i] = preferred[i].max(1).min(vol[i].max(1));
    }
    out
}

/// Align chunk lengths to a regional QoI block size so that no QoI block
/// straddles a chunk boundary: each length is rounded down to a multiple of
/// `block`, or raised to `block` if it was smaller.
pub fn align_to_qoi_block(chunk: Dims, block: usize) -> Dims {
    if block <= 1 {
        return chunk;
    }
    let mut out = chunk;
    for cd in out.iter_mut() {
        if *cd < block {
            *cd = block;
        } else {
            *cd -= *cd % block;
        }
    }
    out
}

/// Split `vol` into chunk boxes of nominal extent `chunk`.
///
/// Each axis gets `max(1, vol / chunk)` segments; all segments have the
/// nominal length except the last, which absorbs the remainder. Boxes are
/// ordered x fastest, then y, then z.
pub fn chunk_volume(vol: Dims, chunk: Dims) -> Vec<ChunkBox> {
    let segments: [Vec<(usize, usize)>; 3] =
        std::array::from_fn(|i| axis_segments(vol[i], chunk[i]));

    let mut boxes = Vec::with_capacity(segments.iter().map(Vec::len).product());
    for &(oz, lz) in &segments[2] {
        for &(oy, ly) in &segments[1] {
            for &(ox, lx) in &segments[0] {
                boxes.push(ChunkBox::new([ox, oy, oz], [lx, ly, lz]));
            }
        }
    }
    boxes
}

/// Number of boxes `chunk_volume` would produce, without building them.
///
/// `None` if the count overflows `usize`.
pub fn chunk_count(vol: Dims, chunk: Dims) -> Option<usize> {
    (0..3).try_fold(1usize, |acc, i| acc.checked_mul(segment_count(vol[i], chunk[i])))
}

fn segment_count(extent: usize, chunk: usize) -> usize {
    (extent / chunk.max(1)).max(1)
}

fn axis_segments(extent: usize, chunk: usize) -> Vec<(usize, usize)> {
    let chunk = chunk.max(1);
    let count = segment_count(extent, chunk);
    (0..count)
        .map(|s| {
            let offset = s * chunk;
            let len = if s + 1 == count { extent - offset } else { chunk };
            (offset, len)
        })
        .collect()
}

/// Copy the values of `chunk` out of `vol` into a contiguous `f64` buffer.
///
/// Returns an empty buffer if the box does not fit inside `vol_dims`.
pub fn gather_chunk<T>(vol: &[T], vol_dims: Dims, chunk: &ChunkBox) -> Vec<f64>
where
    T: Copy + Into<f64>,
{
    if !chunk.fits(vol_dims) || vol.len() < vol_dims.iter().product() {
        return Vec::new();
    }

    let mut buf = Vec::with_capacity(chunk.num_values());
    let row_len = chunk.len[0];
    let plane = vol_dims[0] * vol_dims[1];
    for z in chunk.offset[2]..chunk.offset[2] + chunk.len[2] {
        for y in chunk.offset[1]..chunk.offset[1] + chunk.len[1] {
            let start = z * plane + y * vol_dims[0] + chunk.offset[0];
            buf.extend(vol[start..start + row_len].iter().map(|&v| v.into()));
        }
    }
    buf
}

/// Write a decoded chunk back into the volume at its box.
///
/// Returns `false` (and writes nothing) if the box does not fit or `data`
/// has the wrong length.
pub fn scatter_chunk(vol: &mut [f64], vol_dims: Dims, chunk: &ChunkBox, data: &[f64]) -> bool {
    if !chunk.fits(vol_dims)
        || data.len() != chunk.num_values()
        || vol.len() < vol_dims.iter().product()
    {
        return false;
    }

    let row_len = chunk.len[0];
    let plane = vol_dims[0] * vol_dims[1];
    for (row, src) in data.chunks_exact(row_len).enumerate() {
        let y = chunk.offset[1] + row % chunk.len[1];
        let z = chunk.offset[2] + row / chunk.len[1];
        let start = z * plane + y * vol_dims[0] + chunk.offset[0];
        vol[start..start + row_len].copy_from_slice(src);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_goes_to_last_chunk() {
        assert_eq!(axis_segments(10, 4), vec![(0, 4), (4, 6)]);
        assert_eq!(axis_segments(3, 8), vec![(0, 3)]);
        assert_eq!(axis_segments(8, 4), vec![(0, 4), (4, 4)]);
    }

    #[test]
    fn chunk_count_matches_partition() {
        let cases = [
            ([10, 7, 3], [4, 4, 4]),
            ([64, 64, 64], [16, 32, 64]),
            ([5, 5, 5], [9, 9, 9]),
        ];
        for (vol, chunk) in cases {
            assert_eq!(chunk_count(vol, chunk), Some(chunk_volume(vol, chunk).len()));
        }
        assert_eq!(chunk_count([usize::MAX; 3], [1; 3]), None);
    }

    #[test]
    fn qoi_alignment_rounds_down_or_raises() {
        assert_eq!(align_to_qoi_block([70, 3, 64], 8), [64, 8, 64]);
        assert_eq!(align_to_qoi_block([70, 3, 64], 1), [70, 3, 64]);
    }

    #[test]
    fn gather_rejects_box_outside_volume() {
        let vol = vec![0.0f32; 27];
        let b = ChunkBox::new([2, 0, 0], [2, 3, 3]);
        assert!(gather_chunk(&vol, [3, 3, 3], &b).is_empty());
    }

    #[test]
    fn gather_then_scatter_restores_region() {
        let dims = [5, 4, 3];
        let vol: Vec<f64> = (0..60).map(|v| v as f64).collect();
        let b = ChunkBox::new([1, 1, 1], [3, 2, 2]);
        let chunk = gather_chunk(&vol, dims, &b);
        assert_eq!(chunk.len(), 12);
        assert_eq!(chunk[0], (1 * 20 + 1 * 5 + 1) as f64);

        let mut out = vec![-1.0; 60];
        assert!(scatter_chunk(&mut out, dims, &b, &chunk));
        assert_eq!(out[26], 26.0);
        assert_eq!(out[0], -1.0);
    }
}

use crate::chunk::{chunk_count, chunk_volume, ChunkBox, Dims};
use crate::error::{QvolError, Result};

/// Current bitstream format version, stored in byte 0.
pub const FORMAT_VERSION: u8 = 1;

/// Fixed header bytes before the chunk length table, multi-chunk case.
///   version:u8 + flags:u8 + vol_dims:3×u32 + chunk_dims:3×u16 = 20
pub const HEADER_BASE_MULTI: usize = 20;

/// Fixed header bytes before the chunk length table, single-chunk case.
///   version:u8 + flags:u8 + vol_dims:3×u32 = 14
pub const HEADER_BASE_SINGLE: usize = 14;

/// Bytes per entry in the chunk length table.
pub const CHUNK_LEN_SIZE: usize = 4;

// ── Flags ──────────────────────────────────────────────────────────────────

/// Stream was truncated to a prefix of each chunk; not decodable here.
pub const FLAG_PARTIAL_STREAM: u8 = 1 << 0;

/// Volume is three-dimensional.
pub const FLAG_IS_3D: u8 = 1 << 1;

/// Input was single precision.
pub const FLAG_ORIG_IS_FLOAT: u8 = 1 << 2;

/// More than one chunk; chunk dims follow the volume dims.
pub const FLAG_MULTI_CHUNK: u8 = 1 << 3;

const FLAGS_RESERVED: u8 = 0xF0;

// ── Header ─────────────────────────────────────────────────────────────────

/// Decoded representation of the bitstream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub vol_dims: Dims,
    /// Nominal chunk extent; equal to `vol_dims` for a single chunk.
    pub chunk_dims: Dims,
    /// Byte length of each chunk stream, in chunk order.
    pub chunk_lens: Vec<u32>,
}

impl Header {
    /// Describe a finished set of chunk streams.
    pub fn new(vol_dims: Dims, chunk_dims: Dims, chunk_lens: Vec<u32>, orig_is_float: bool) -> Self {
        let mut flags = FLAG_IS_3D;
        if orig_is_float {
            flags |= FLAG_ORIG_IS_FLOAT;
        }
        if chunk_lens.len() > 1 {
            flags |= FLAG_MULTI_CHUNK;
        }
        Self {
            version: FORMAT_VERSION,
            flags,
            vol_dims,
            chunk_dims: if chunk_lens.len() > 1 { chunk_dims } else { vol_dims },
            chunk_lens,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_multi_chunk(&self) -> bool {
        self.has_flag(FLAG_MULTI_CHUNK)
    }

    pub fn orig_is_float(&self) -> bool {
        self.has_flag(FLAG_ORIG_IS_FLOAT)
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_lens.len()
    }

    /// Size of the serialized header, length table included.
    pub fn header_len(&self) -> usize {
        header_len(self.num_chunks())
    }

    /// Sum of all chunk stream lengths.
    pub fn payload_len(&self) -> usize {
        self.chunk_lens.iter().map(|&l| l as usize).sum()
    }

    pub fn num_values(&self) -> usize {
        self.vol_dims.iter().product()
    }

    /// Chunk boxes implied by the dims, in chunk order.
    pub fn chunk_boxes(&self) -> Vec<ChunkBox> {
        chunk_volume(self.vol_dims, self.chunk_dims)
    }

    /// Byte range of each chunk stream within the payload.
    pub fn chunk_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let mut start = 0;
        self.chunk_lens
            .iter()
            .map(|&len| {
                let r = start..start + len as usize;
                start = r.end;
                r
            })
            .collect()
    }

    /// Serialize. Fails if a dimension does not fit its field width.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.push(self.version);
        buf.push(self.flags);
        for &d in &self.vol_dims {
            let d = u32::try_from(d)
                .map_err(|_| QvolError::InvalidDims(format!("volume dim {d} exceeds u32")))?;
            buf.extend_from_slice(&d.to_le_bytes());
        }
        if self.is_multi_chunk() {
            for &d in &self.chunk_dims {
                let d = u16::try_from(d)
                    .map_err(|_| QvolError::InvalidDims(format!("chunk dim {d} exceeds u16")))?;
                buf.extend_from_slice(&d.to_le_bytes());
            }
        }
        for len in &self.chunk_lens {
            buf.extend_from_slice(&len.to_le_bytes());
        }
        Ok(buf)
    }

    /// Parse and validate a header from the front of `buf`.
    ///
    /// Checks the version, reserved flag bits, that the length table is
    /// present, and that the chunk count matches the dims. The payload itself
    /// is not required to be present.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_BASE_SINGLE {
            return Err(QvolError::Bitstream("shorter than the fixed header"));
        }
        let version = buf[0];
        if version != FORMAT_VERSION {
            return Err(QvolError::Bitstream("unsupported format version"));
        }
        let flags = buf[1];
        if flags & FLAGS_RESERVED != 0 {
            return Err(QvolError::Bitstream("reserved flag bits set"));
        }

        let vol_dims: Dims = std::array::from_fn(|i| read_u32(buf, 2 + 4 * i) as usize);
        if vol_dims.contains(&0) {
            return Err(QvolError::Bitstream("zero volume dimension"));
        }
        if vol_dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(QvolError::Bitstream("volume value count overflows"));
        }

        let multi = flags & FLAG_MULTI_CHUNK != 0;
        let (chunk_dims, base) = if multi {
            if buf.len() < HEADER_BASE_MULTI {
                return Err(QvolError::Bitstream("truncated chunk dims"));
            }
            let cd: Dims = std::array::from_fn(|i| read_u16(buf, 14 + 2 * i) as usize);
            if cd.contains(&0) {
                return Err(QvolError::Bitstream("zero chunk dimension"));
            }
            (cd, HEADER_BASE_MULTI)
        } else {
            (vol_dims, HEADER_BASE_SINGLE)
        };

        let num_chunks = if multi {
            chunk_count(vol_dims, chunk_dims)
                .ok_or(QvolError::Bitstream("chunk count overflows"))?
        } else {
            1
        };
        if multi && num_chunks < 2 {
            return Err(QvolError::Bitstream("multi-chunk flag with a single chunk"));
        }
        let table_end = num_chunks
            .checked_mul(CHUNK_LEN_SIZE)
            .and_then(|t| t.checked_add(base))
            .ok_or(QvolError::Bitstream("chunk table overflows"))?;
        if buf.len() < table_end {
            return Err(QvolError::Bitstream("truncated chunk length table"));
        }
        let chunk_lens = (0..num_chunks)
            .map(|i| read_u32(buf, base + CHUNK_LEN_SIZE * i))
            .collect();

        Ok(Self {
            version,
            flags,
            vol_dims,
            chunk_dims,
            chunk_lens,
        })
    }
}

/// Header size for `num_chunks` chunks.
pub fn header_len(num_chunks: usize) -> usize {
    let base = if num_chunks > 1 {
        HEADER_BASE_MULTI
    } else {
        HEADER_BASE_SINGLE
    };
    base + CHUNK_LEN_SIZE * num_chunks
}

/// Build the serialized header for `streams`.
///
/// Returns an empty buffer when the stream count does not match the number
/// of chunks the dims imply; callers treat that as "nothing to emit".
pub fn generate_header(
    vol_dims: Dims,
    chunk_dims: Dims,
    streams: &[Vec<u8>],
    orig_is_float: bool,
) -> Result<Vec<u8>> {
    if chunk_count(vol_dims, chunk_dims) != Some(streams.len()) {
        return Ok(Vec::new());
    }
    let lens = streams
        .iter()
        .enumerate()
        .map(|(index, s)| {
            u32::try_from(s.len()).map_err(|_| QvolError::ChunkStreamTooLarge {
                index,
                len: s.len(),
            })
        })
        .collect::<Result<Vec<u32>>>()?;
    Header::new(vol_dims, chunk_dims, lens, orig_is_float).to_bytes()
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

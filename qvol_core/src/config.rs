use serde::{Deserialize, Serialize};

use crate::chunk::Dims;
use crate::codec::CompressionMode;
use crate::compressor::{Compressor, DEFAULT_CHUNK_DIMS};
use crate::tuning::{QoiParams, TuningConstants};

/// Storage precision of a raw volume file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F64,
}

impl Precision {
    pub fn bytes_per_value(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F64 => 8,
        }
    }
}

/// Everything a compression job can be configured with.
///
/// ```json
/// {
///   "dims": [384, 384, 256],
///   "chunk_dims": [128, 128, 128],
///   "mode": { "mode": "pointwise_tolerance", "quality": 1e-3 },
///   "qoi": { "meta": { "id": 2 }, "tolerance": 1e-2, "block_size": 4 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub dims: Dims,
    pub chunk_dims: Dims,
    /// 0 uses all hardware threads.
    pub num_threads: usize,
    pub mode: Option<CompressionMode>,
    pub qoi: QoiParams,
    pub high_prec: bool,
    pub precision: Precision,
    pub tuning: TuningConstants,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            dims: [0; 3],
            chunk_dims: DEFAULT_CHUNK_DIMS,
            num_threads: 0,
            mode: None,
            qoi: QoiParams::default(),
            high_prec: false,
            precision: Precision::default(),
            tuning: TuningConstants::default(),
        }
    }
}

impl JobConfig {
    /// A compressor with every setting of this job applied.
    pub fn compressor<F>(&self, factory: F) -> Compressor<F> {
        let mut c = Compressor::new(factory);
        c.set_num_threads(self.num_threads);
        c.set_dims_and_chunks(self.dims, self.chunk_dims);
        if let Some(mode) = self.mode {
            c.set_mode(mode);
        }
        c.set_qoi_params(self.qoi.clone());
        c.set_tuning_constants(self.tuning.clone());
        c.set_high_prec(self.high_prec);
        c
    }
}

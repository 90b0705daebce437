//! Per-chunk point-wise error bound selection under a QoI constraint.
//!
//! Two regimes:
//! - **global**: QoIs whose error is a fixed multiple of the value error get
//!   a closed-form bound, no search;
//! - **searched**: everything else runs bound extraction → quantile ladder
//!   → profiling and sampling → rate/distortion trials, keeping the bound
//!   with the lowest measured rate.
//!
//! Regional QoIs (block size above one) first inflate the QoI tolerance by a
//! Hoeffding factor, see [`tail`].

pub mod quantile;
pub mod sampling;
pub mod search;
pub mod tail;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::Dims;
use crate::codec::{Codec, CodecError};
use crate::error::{QvolError, Result};
use crate::qoi::{Qoi, QoiMeta};

use search::{search_best_bound, trial_rate, TrialSettings};

/// Empirical constants of the tuning search, exposed so they can be
/// adjusted without code changes. Defaults are the tuned values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConstants {
    /// Share of the tightest per-value bounds the quantile ladder looks at.
    pub quantile_rate: f64,
    /// Fractions of that share to evaluate, loosest first.
    pub quantile_fractions: Vec<f64>,
    /// Lattice spacing of sampled blocks; blocks span `edge + 1` values.
    pub sample_block_edge: usize,
    pub sample_rate: f64,
    /// Profiling is used only if more than `factor × sample_rate × blocks`
    /// blocks pass it.
    pub profiling_factor: f64,
    pub accept_slack: f64,
    pub eb_floor: f64,
    /// `(max block edge, rate ceiling)` pairs for near-identity QoIs.
    pub rate_ceilings: Vec<(usize, f64)>,
    pub rate_ceiling_max: f64,
    pub profiling_exception: Option<ProfilingException>,
}

impl Default for TuningConstants {
    fn default() -> Self {
        Self {
            quantile_rate: 0.2,
            quantile_fractions: vec![1.0, 0.5, 0.25, 0.10, 0.05, 0.025, 0.01],
            sample_block_edge: 31,
            sample_rate: 0.01,
            profiling_factor: 0.6,
            accept_slack: 1.02,
            eb_floor: 1e-15,
            rate_ceilings: vec![(4, 4.0), (8, 8.0), (16, 12.0), (32, 16.0)],
            rate_ceiling_max: 32.0,
            profiling_exception: Some(ProfilingException::default()),
        }
    }
}

impl TuningConstants {
    /// Coarse stride used when profiling a sample block.
    pub fn profiling_stride(&self) -> usize {
        (self.sample_block_edge / 4).max(1)
    }
}

/// A single QoI/volume/tolerance combination for which profiling is
/// switched off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilingException {
    pub qoi_id: u32,
    pub dim_y: usize,
    pub qoi_tolerance: f64,
}

impl Default for ProfilingException {
    fn default() -> Self {
        Self {
            qoi_id: 23,
            dim_y: 1200,
            qoi_tolerance: 1e-3,
        }
    }
}

impl ProfilingException {
    pub fn matches(&self, qoi_id: u32, vol_dims: Dims, qoi_tolerance: f64) -> bool {
        self.qoi_id == qoi_id
            && vol_dims[1] == self.dim_y
            && (qoi_tolerance - self.qoi_tolerance).abs() <= 1e-10
    }
}

/// QoI part of a job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QoiParams {
    pub meta: QoiMeta,
    pub tolerance: f64,
    /// 1 enforces the QoI per value, above 1 per cubic block of that edge.
    pub block_size: usize,
    /// Dispersion multiplier of the tail bound.
    pub k: f64,
    /// Confidence of the tail bound.
    pub confidence: f64,
}

impl Default for QoiParams {
    fn default() -> Self {
        Self {
            meta: QoiMeta::default(),
            tolerance: 0.0,
            block_size: 1,
            k: 2.0,
            confidence: 0.999,
        }
    }
}

impl QoiParams {
    pub fn is_active(&self) -> bool {
        self.meta.is_enabled() && self.tolerance > 0.0
    }

    pub fn is_regional(&self) -> bool {
        self.block_size > 1
    }

    /// Block size that chunk dims must align to, if any.
    pub fn alignment(&self) -> Option<usize> {
        (self.is_active() && self.is_regional()).then_some(self.block_size)
    }
}

/// Job-wide QoI tolerances, fixed before any chunk is processed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QoiPlan {
    /// Tolerance the user asked for; enforced per block by the codec.
    pub nominal_tolerance: f64,
    /// Nominal tolerance times the tail-bound rate; drives per-value bounds.
    pub tuned_tolerance: f64,
    pub rate: f64,
}

impl QoiPlan {
    pub fn new(params: &QoiParams, constants: &TuningConstants) -> Self {
        let rate = tolerance_rate(params, constants);
        Self {
            nominal_tolerance: params.tolerance,
            tuned_tolerance: params.tolerance * rate,
            rate,
        }
    }
}

/// Inflation factor applied to the QoI tolerance; 1 unless regional.
pub fn tolerance_rate(params: &QoiParams, constants: &TuningConstants) -> f64 {
    if !params.is_regional() {
        return 1.0;
    }
    let n = params.block_size.pow(3);
    let mut rate = tail::hoeffding_rate(n, 1, params.confidence, params.k).max(1.0);
    if params.meta.is_near_identity() {
        let cap = tail::rate_ceiling(
            params.block_size,
            &constants.rate_ceilings,
            constants.rate_ceiling_max,
        );
        rate = rate.min(cap);
    }
    rate
}

/// Point-wise bound for a QoI `a·x`: the QoI tolerance over `|a|`, capped by
/// the user's own point-wise budget.
pub fn global_tolerance(scale: f64, qoi_tolerance: f64, pwe: Option<f64>) -> f64 {
    (qoi_tolerance / scale.abs()).min(pwe.unwrap_or(f64::MAX))
}

/// What the tuner decided for one chunk.
#[derive(Debug)]
pub struct ChunkTuning {
    /// Point-wise tolerance to compress the chunk with.
    pub tolerance: f64,
    /// Model to attach to the codec, with its global bound set.
    pub qoi: Option<Box<dyn Qoi>>,
    /// Measured bits per value of the chosen bound, when a search ran.
    pub best_rate: Option<f64>,
}

/// Shared, read-only tuner for one job.
#[derive(Debug)]
pub struct QoiTuner {
    params: QoiParams,
    constants: TuningConstants,
    plan: QoiPlan,
    prototype: Box<dyn Qoi>,
    vol_dims: Dims,
    pwe: Option<f64>,
    high_prec: bool,
}

impl QoiTuner {
    /// Returns `None` when the QoI is not active for this job.
    pub fn new(
        params: &QoiParams,
        constants: &TuningConstants,
        vol_dims: Dims,
        pwe: Option<f64>,
        high_prec: bool,
    ) -> Result<Option<Self>> {
        if !params.is_active() {
            return Ok(None);
        }
        if !params.tolerance.is_finite() {
            return Err(QvolError::InvalidQoi(format!(
                "QoI tolerance must be finite, got {}",
                params.tolerance
            )));
        }
        let plan = QoiPlan::new(params, constants);
        let prototype = params
            .meta
            .build(plan.tuned_tolerance, pwe.unwrap_or(f64::MAX))?;

        info!(
            qoi = %prototype.expression(),
            id = params.meta.id,
            nominal = plan.nominal_tolerance,
            tuned = plan.tuned_tolerance,
            rate = plan.rate,
            block_size = params.block_size,
            "QoI tuning enabled"
        );

        Ok(Some(Self {
            params: params.clone(),
            constants: constants.clone(),
            plan,
            prototype,
            vol_dims,
            pwe,
            high_prec,
        }))
    }

    pub fn plan(&self) -> &QoiPlan {
        &self.plan
    }

    fn block_size(&self) -> usize {
        self.params.block_size.max(1)
    }

    /// Decide the point-wise tolerance for one chunk.
    ///
    /// `factory` builds the throwaway codecs used for trial compression;
    /// trials run sequentially on the calling thread.
    pub fn tune<C, F>(
        &self,
        chunk: &[f64],
        chunk_dims: Dims,
        factory: &F,
    ) -> Result<ChunkTuning, CodecError>
    where
        C: Codec,
        F: Fn() -> C,
    {
        if self.params.meta.is_near_identity() {
            return Ok(self.tune_global());
        }

        let c = &self.constants;
        let cap = self.pwe.unwrap_or(f64::MAX);
        let mut qoi = self.prototype.clone();

        let mut ebs = quantile::per_value_bounds(chunk, qoi.as_ref(), cap);
        let candidates = quantile::candidate_bounds(&mut ebs, c.quantile_rate, &c.quantile_fractions);
        drop(ebs);
        let Some(&threshold) = candidates.first() else {
            return Err(CodecError::NoData);
        };

        let edge = c.sample_block_edge;
        let profiled =
            sampling::profile_blocks(chunk, chunk_dims, edge, threshold, c.profiling_stride());
        let total = sampling::lattice_len(chunk_dims, edge);
        let mut profiling =
            sampling::profiling_qualifies(profiled.len(), total, c.sample_rate, c.profiling_factor);
        if let Some(exception) = &c.profiling_exception {
            if exception.matches(self.params.meta.id, self.vol_dims, self.plan.nominal_tolerance) {
                profiling = false;
            }
        }
        let sample = sampling::sample_blocks(
            chunk,
            chunk_dims,
            edge,
            c.sample_rate,
            profiling.then_some(profiled.as_slice()),
        );
        debug!(
            profiled = profiled.len(),
            lattice = total,
            profiling,
            sampled_blocks = sample.blocks.len(),
            "sampled chunk"
        );

        let settings = TrialSettings {
            qoi_tolerance: self.plan.nominal_tolerance,
            qoi_block_size: self.block_size(),
            high_prec: self.high_prec,
        };
        let outcome = search_best_bound(&candidates, cap, c.eb_floor, c.accept_slack, |eb| {
            let mut trial_codec = factory();
            trial_rate(&mut trial_codec, &sample, eb, qoi.as_ref(), settings)
        })?;

        info!(
            best_eb = outcome.best_eb,
            best_rate = outcome.best_rate,
            trials = outcome.trials,
            "chunk bound selected"
        );

        qoi.set_global_eb(outcome.best_eb);
        Ok(ChunkTuning {
            tolerance: outcome.best_eb,
            qoi: Some(qoi),
            best_rate: outcome.best_rate.is_finite().then_some(outcome.best_rate),
        })
    }

    fn tune_global(&self) -> ChunkTuning {
        let scale = self.prototype.linear_scale().unwrap_or(1.0);
        let tolerance = global_tolerance(scale, self.plan.tuned_tolerance, self.pwe);
        let qoi = self.params.is_regional().then(|| {
            let mut q = self.prototype.clone();
            q.set_global_eb(tolerance);
            q
        });
        ChunkTuning {
            tolerance,
            qoi,
            best_rate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qoi::{QOI_LINEAR, QOI_SQUARE, QOI_SYMBOLIC};

    fn params(meta: QoiMeta, tolerance: f64, block_size: usize) -> QoiParams {
        QoiParams {
            meta,
            tolerance,
            block_size,
            ..QoiParams::default()
        }
    }

    #[test]
    fn pointwise_qoi_is_not_inflated() {
        let p = params(QoiMeta::new(QOI_SQUARE), 1e-2, 1);
        assert_eq!(tolerance_rate(&p, &TuningConstants::default()), 1.0);
    }

    #[test]
    fn near_identity_rate_is_capped_by_block_edge() {
        let c = TuningConstants::default();
        // uncapped rate for 8^3 with k = 2 is about 11.6
        let p = params(QoiMeta::new(QOI_SYMBOLIC).with_expression("x"), 1.0, 8);
        assert_eq!(tolerance_rate(&p, &c), 8.0);
        let p = params(QoiMeta::new(QOI_SQUARE), 1.0, 8);
        assert!(tolerance_rate(&p, &c) > 11.0);
    }

    #[test]
    fn rate_never_drops_below_one() {
        let mut p = params(QoiMeta::new(QOI_SQUARE), 1.0, 2);
        p.k = 0.01;
        assert_eq!(tolerance_rate(&p, &TuningConstants::default()), 1.0);
    }

    #[test]
    fn global_tolerance_respects_scale_and_cap() {
        assert_eq!(global_tolerance(4.0, 1.0, None), 0.25);
        assert_eq!(global_tolerance(-4.0, 1.0, Some(0.1)), 0.1);
        assert_eq!(global_tolerance(1.0, 0.05, Some(0.1)), 0.05);
    }

    #[test]
    fn inactive_qoi_builds_no_tuner() {
        let p = params(QoiMeta::new(QOI_LINEAR), 0.0, 1);
        let tuner = QoiTuner::new(&p, &TuningConstants::default(), [8, 8, 8], None, false);
        assert!(tuner.unwrap().is_none());
    }

    #[test]
    fn profiling_exception_is_narrow() {
        let e = ProfilingException::default();
        assert!(e.matches(23, [500, 1200, 98], 1e-3));
        assert!(!e.matches(23, [500, 1201, 98], 1e-3));
        assert!(!e.matches(2, [500, 1200, 98], 1e-3));
        assert!(!e.matches(23, [500, 1200, 98], 2e-3));
    }
}

//! Finding the values a reconstruction must store exactly.
//!
//! A value becomes an outlier when its reconstruction breaks the point-wise
//! tolerance, or breaks the QoI tolerance either at that point or, for
//! regional QoIs, in the average over its block.

use qvol_core::chunk::Dims;
use qvol_core::Qoi;

/// Fidelity constraints checked after quantization.
#[derive(Debug, Clone, Copy)]
pub struct Constraints<'a> {
    /// Point-wise bound; infinite when the mode sets none.
    pub tolerance: f64,
    pub qoi: Option<&'a dyn Qoi>,
    pub qoi_tolerance: f64,
    /// 1 checks the QoI per value, above 1 per cubic block.
    pub qoi_block_size: usize,
}

impl Constraints<'_> {
    fn qoi_error(qoi: &dyn Qoi, orig: f64, recon: f64) -> Option<f64> {
        let a = qoi.eval(orig);
        a.is_finite().then(|| qoi.eval(recon) - a)
    }

    /// Whether the value alone violates a constraint.
    fn point_violates(&self, orig: f64, recon: f64) -> bool {
        if !((orig - recon).abs() <= self.tolerance) {
            return true;
        }
        match self.qoi {
            // undefined QoI at the original value: keep it exactly
            Some(qoi) if !qoi.eval(orig).is_finite() => recon != orig,
            Some(qoi) if self.qoi_block_size <= 1 => {
                Self::qoi_error(qoi, orig, recon).map_or(true, |d| !(d.abs() <= self.qoi_tolerance))
            }
            _ => false,
        }
    }
}

/// Overwrite every outlier of `recon` with its original value and return
/// the outlier positions in ascending order.
pub fn correct_outliers(
    orig: &[f64],
    recon: &mut [f64],
    dims: Dims,
    constraints: &Constraints<'_>,
) -> Vec<usize> {
    let mut outlier = vec![false; orig.len()];
    for (i, (&o, r)) in orig.iter().zip(recon.iter_mut()).enumerate() {
        if constraints.point_violates(o, *r) {
            outlier[i] = true;
            *r = o;
        }
    }

    if let Some(qoi) = constraints.qoi {
        if constraints.qoi_block_size > 1 {
            let mut errs = Vec::new();
            for block in regional_blocks(dims, constraints.qoi_block_size) {
                let tol = constraints.qoi_tolerance;
                fix_block(qoi, tol, block, orig, recon, &mut outlier, &mut errs);
            }
        }
    }

    outlier
        .iter()
        .enumerate()
        .filter_map(|(i, &o)| o.then_some(i))
        .collect()
}

/// Whether `recon` satisfies every constraint, point-wise and regional.
pub fn satisfies(orig: &[f64], recon: &[f64], dims: Dims, constraints: &Constraints<'_>) -> bool {
    if orig
        .iter()
        .zip(recon)
        .any(|(&o, &r)| constraints.point_violates(o, r))
    {
        return false;
    }
    match constraints.qoi {
        Some(qoi) if constraints.qoi_block_size > 1 => {
            regional_blocks(dims, constraints.qoi_block_size).all(|block| {
                block_error(qoi, block, orig, recon).abs() <= constraints.qoi_tolerance
            })
        }
        _ => true,
    }
}

/// One cubic block of edge `b`; blocks on the far faces may be partial.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Block {
    lo: [usize; 3],
    hi: [usize; 3],
    dims: Dims,
}

impl Block {
    #[cfg(test)]
    fn len(&self) -> usize {
        (0..3).map(|i| self.hi[i] - self.lo[i]).product()
    }

    /// Flat indices, x fastest.
    fn indices(self) -> impl Iterator<Item = usize> {
        let Block { lo, hi, dims } = self;
        (lo[2]..hi[2]).flat_map(move |z| {
            (lo[1]..hi[1])
                .flat_map(move |y| (lo[0]..hi[0]).map(move |x| (z * dims[1] + y) * dims[0] + x))
        })
    }
}

fn regional_blocks(dims: Dims, b: usize) -> impl Iterator<Item = Block> {
    let counts: [usize; 3] = std::array::from_fn(|i| dims[i].div_ceil(b));
    (0..counts[2]).flat_map(move |bz| {
        (0..counts[1]).flat_map(move |by| {
            (0..counts[0]).map(move |bx| {
                let lo = [bx * b, by * b, bz * b];
                let hi: [usize; 3] = std::array::from_fn(|i| (lo[i] + b).min(dims[i]));
                Block { lo, hi, dims }
            })
        })
    })
}

/// Mean QoI error over the block's values with a defined QoI.
fn block_error(qoi: &dyn Qoi, block: Block, orig: &[f64], recon: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for i in block.indices() {
        if let Some(d) = Constraints::qoi_error(qoi, orig[i], recon[i]) {
            sum += d;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Restore the largest contributors to the block's mean QoI error until the
/// mean is back within tolerance. `errs` is scratch space shared across blocks.
fn fix_block(
    qoi: &dyn Qoi,
    tolerance: f64,
    block: Block,
    orig: &[f64],
    recon: &mut [f64],
    outlier: &mut [bool],
    errs: &mut Vec<(usize, f64)>,
) {
    errs.clear();
    errs.extend(
        block
            .indices()
            .filter_map(|i| Constraints::qoi_error(qoi, orig[i], recon[i]).map(|d| (i, d))),
    );
    if errs.is_empty() {
        return;
    }
    let n = errs.len() as f64;
    let mut sum: f64 = errs.iter().map(|&(_, d)| d).sum();
    if !sum.is_finite() {
        // a reconstruction with an undefined QoI; restore the whole block
        for &(i, _) in errs.iter() {
            recon[i] = orig[i];
            outlier[i] = true;
        }
        return;
    }
    if (sum / n).abs() <= tolerance {
        return;
    }

    let sign = sum.signum();
    errs.sort_unstable_by(|a, b| (b.1 * sign).total_cmp(&(a.1 * sign)));
    for &(i, d) in errs.iter() {
        if (sum / n).abs() <= tolerance {
            break;
        }
        sum -= d;
        recon[i] = orig[i];
        outlier[i] = true;
    }
}

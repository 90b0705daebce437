use std::fmt;

use serde::Serialize;

use crate::error::{QvolError, Result};

/// Distortion of a reconstruction against its original.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorStats {
    pub rmse: f64,
    /// Largest absolute point-wise error.
    pub linf: f64,
    /// `20·log10(range / rmse)`; infinite for an exact reconstruction.
    pub psnr: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

impl ErrorStats {
    /// Compare `recon` against `orig`. Value range is taken from `orig`.
    pub fn compare<T>(orig: &[T], recon: &[T]) -> Result<Self>
    where
        T: Copy + Into<f64>,
    {
        if orig.len() != recon.len() {
            return Err(QvolError::WrongLength {
                expected: orig.len(),
                actual: recon.len(),
            });
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut linf = 0.0f64;
        let mut sum_sq = 0.0f64;
        for (&a, &b) in orig.iter().zip(recon) {
            let (a, b): (f64, f64) = (a.into(), b.into());
            min = min.min(a);
            max = max.max(a);
            let d = (a - b).abs();
            linf = linf.max(d);
            sum_sq += d * d;
        }

        if orig.is_empty() {
            return Ok(Self {
                rmse: 0.0,
                linf: 0.0,
                psnr: f64::INFINITY,
                min: 0.0,
                max: 0.0,
                range: 0.0,
            });
        }

        let rmse = (sum_sq / orig.len() as f64).sqrt();
        let range = max - min;
        let psnr = if rmse == 0.0 {
            f64::INFINITY
        } else {
            20.0 * (range / rmse).log10()
        };
        Ok(Self {
            rmse,
            linf,
            psnr,
            min,
            max,
            range,
        })
    }
}

impl fmt::Display for ErrorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  range:  [{:.6e}, {:.6e}] ({:.6e})", self.min, self.max, self.range)?;
        writeln!(f, "  rmse:   {:.6e}", self.rmse)?;
        writeln!(f, "  linf:   {:.6e}", self.linf)?;
        write!(f, "  psnr:   {:.2} dB", self.psnr)
    }
}

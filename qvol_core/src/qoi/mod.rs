//! Quantities of interest: derived functions of the data whose error, rather
//! than the raw value error, is the fidelity target.
//!
//! A model answers one question for the tuner and the codec: given a value,
//! how far may it move before the QoI moves by more than the tolerance?

mod expr;
mod models;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QvolError, Result};

pub use expr::{Expr, ExprError, Func, Shape};
pub use models::{LinearQoi, LogQoi, ReciprocalQoi, SquareQoi, SymbolicQoi};

// ── QoI ids ────────────────────────────────────────────────────────────────

pub const QOI_SYMBOLIC: u32 = 1;
pub const QOI_SQUARE: u32 = 2;
pub const QOI_LOG: u32 = 3;
pub const QOI_LINEAR: u32 = 11;
pub const QOI_RECIPROCAL: u32 = 13;

/// Model contract shared by the tuner and the codec.
pub trait Qoi: Send + Sync + fmt::Debug {
    fn id(&self) -> u32;

    /// Evaluate the QoI at a single value.
    fn eval(&self, v: f64) -> f64;

    /// Largest absolute error at `v` that keeps the QoI error within the
    /// tolerance, never above the model's global bound.
    fn interpret_eb(&self, v: f64) -> f64;

    fn set_global_eb(&mut self, eb: f64);
    fn global_eb(&self) -> f64;

    fn set_qoi_tolerance(&mut self, tolerance: f64);
    fn qoi_tolerance(&self) -> f64;

    /// `Some(a)` when the QoI is `a·x`, so its error propagates linearly and
    /// the point-wise bound has a closed form independent of the data.
    fn linear_scale(&self) -> Option<f64> {
        None
    }

    fn expression(&self) -> String;

    fn box_clone(&self) -> Box<dyn Qoi>;
}

impl Clone for Box<dyn Qoi> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Immutable description of which QoI the user cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QoiMeta {
    pub id: u32,
    /// Expression for the symbolic QoI; `x` when absent.
    #[serde(default)]
    pub expression: Option<String>,
    /// Coefficient of the linear QoI.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Use closed-form bounds where the expression shape allows it.
    #[serde(default = "default_analytical")]
    pub analytical: bool,
}

fn default_analytical() -> bool {
    true
}

impl Default for QoiMeta {
    fn default() -> Self {
        Self {
            id: 0,
            expression: None,
            scale: None,
            analytical: true,
        }
    }
}

impl QoiMeta {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_analytical(mut self, analytical: bool) -> Self {
        self.analytical = analytical;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.id > 0
    }

    /// QoIs whose error is a fixed multiple of the value error: the bare `x`
    /// expression and the linear QoI.
    pub fn is_near_identity(&self) -> bool {
        match self.id {
            QOI_LINEAR => true,
            QOI_SYMBOLIC => self.expression.as_deref().map_or(true, |e| e.trim() == "x"),
            _ => false,
        }
    }

    /// Build the model for this description.
    pub fn build(&self, tolerance: f64, global_eb: f64) -> Result<Box<dyn Qoi>> {
        let qoi: Box<dyn Qoi> = match self.id {
            QOI_SYMBOLIC => {
                let text = self.expression.as_deref().unwrap_or("x");
                let expr = Expr::parse(text)
                    .map_err(|e| QvolError::InvalidQoi(format!("expression {text:?}: {e}")))?;
                Box::new(SymbolicQoi::new(expr, self.analytical, tolerance, global_eb))
            }
            QOI_SQUARE => Box::new(SquareQoi::new(tolerance, global_eb)),
            QOI_LOG => Box::new(LogQoi::new(tolerance, global_eb)),
            QOI_LINEAR => {
                let scale = self.scale.unwrap_or(1.0);
                if !scale.is_finite() || scale == 0.0 {
                    return Err(QvolError::InvalidQoi(format!(
                        "linear QoI needs a finite non-zero scale, got {scale}"
                    )));
                }
                Box::new(LinearQoi::new(scale, tolerance, global_eb))
            }
            QOI_RECIPROCAL => Box::new(ReciprocalQoi::new(tolerance, global_eb)),
            other => {
                return Err(QvolError::InvalidQoi(format!("unknown QoI id {other}")));
            }
        };
        Ok(qoi)
    }
}

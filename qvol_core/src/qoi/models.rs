use super::expr::{Expr, Shape};
use super::{Qoi, QOI_LINEAR, QOI_LOG, QOI_RECIPROCAL, QOI_SQUARE, QOI_SYMBOLIC};

// ── closed-form bounds ─────────────────────────────────────────────────────
//
// Each returns the largest e such that |f(v ± e) - f(v)| <= tol.

fn linear_eb(scale: f64, tol: f64) -> f64 {
    tol / scale.abs()
}

fn square_eb(v: f64, tol: f64) -> f64 {
    (v * v + tol).sqrt() - v.abs()
}

fn reciprocal_eb(v: f64, tol: f64) -> f64 {
    if v >= 0.0 {
        tol * v * v / (1.0 + tol * v)
    } else {
        tol * v * v / (1.0 - tol * v)
    }
}

fn ln_eb(v: f64, tol: f64) -> f64 {
    v.abs() * (1.0 - (-tol).exp())
}

/// Numerical bound for an arbitrary `f`: bisection on
/// `max(|f(v+e) - f(v)|, |f(v-e) - f(v)|) <= tol` over `[0, cap]`.
fn numeric_eb(f: impl Fn(f64) -> f64, v: f64, tol: f64, cap: f64) -> f64 {
    let base = f(v);
    if !base.is_finite() || tol <= 0.0 {
        return 0.0;
    }
    let within = |e: f64| {
        let d = (f(v + e) - base).abs().max((f(v - e) - base).abs());
        d <= tol
    };

    // Grow an upper bracket until it fails or reaches the cap.
    let mut hi = v.abs().max(1.0).min(cap);
    let mut grow = 0;
    while within(hi) {
        if hi >= cap || grow >= 64 {
            return hi.min(cap);
        }
        hi = (hi * 2.0).min(cap);
        grow += 1;
    }

    let mut lo = 0.0;
    for _ in 0..64 {
        let mid = 0.5 * (lo + hi);
        if within(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

// ── models ─────────────────────────────────────────────────────────────────

/// `a·x`.
#[derive(Debug, Clone)]
pub struct LinearQoi {
    scale: f64,
    tolerance: f64,
    global_eb: f64,
}

impl LinearQoi {
    pub fn new(scale: f64, tolerance: f64, global_eb: f64) -> Self {
        Self {
            scale,
            tolerance,
            global_eb,
        }
    }
}

impl Qoi for LinearQoi {
    fn id(&self) -> u32 {
        QOI_LINEAR
    }

    fn eval(&self, v: f64) -> f64 {
        self.scale * v
    }

    fn interpret_eb(&self, _v: f64) -> f64 {
        linear_eb(self.scale, self.tolerance).min(self.global_eb)
    }

    fn set_global_eb(&mut self, eb: f64) {
        self.global_eb = eb;
    }

    fn global_eb(&self) -> f64 {
        self.global_eb
    }

    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn qoi_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn linear_scale(&self) -> Option<f64> {
        Some(self.scale)
    }

    fn expression(&self) -> String {
        format!("{}*x", self.scale)
    }

    fn box_clone(&self) -> Box<dyn Qoi> {
        Box::new(self.clone())
    }
}

/// `x²`.
#[derive(Debug, Clone)]
pub struct SquareQoi {
    tolerance: f64,
    global_eb: f64,
}

impl SquareQoi {
    pub fn new(tolerance: f64, global_eb: f64) -> Self {
        Self {
            tolerance,
            global_eb,
        }
    }
}

impl Qoi for SquareQoi {
    fn id(&self) -> u32 {
        QOI_SQUARE
    }

    fn eval(&self, v: f64) -> f64 {
        v * v
    }

    fn interpret_eb(&self, v: f64) -> f64 {
        square_eb(v, self.tolerance).min(self.global_eb)
    }

    fn set_global_eb(&mut self, eb: f64) {
        self.global_eb = eb;
    }

    fn global_eb(&self) -> f64 {
        self.global_eb
    }

    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn qoi_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn expression(&self) -> String {
        "x^2".to_string()
    }

    fn box_clone(&self) -> Box<dyn Qoi> {
        Box::new(self.clone())
    }
}

/// `ln x`. Non-positive values get a zero bound and must be kept exactly.
#[derive(Debug, Clone)]
pub struct LogQoi {
    tolerance: f64,
    global_eb: f64,
}

impl LogQoi {
    pub fn new(tolerance: f64, global_eb: f64) -> Self {
        Self {
            tolerance,
            global_eb,
        }
    }
}

impl Qoi for LogQoi {
    fn id(&self) -> u32 {
        QOI_LOG
    }

    fn eval(&self, v: f64) -> f64 {
        v.ln()
    }

    fn interpret_eb(&self, v: f64) -> f64 {
        if v <= 0.0 {
            return 0.0;
        }
        ln_eb(v, self.tolerance).min(self.global_eb)
    }

    fn set_global_eb(&mut self, eb: f64) {
        self.global_eb = eb;
    }

    fn global_eb(&self) -> f64 {
        self.global_eb
    }

    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn qoi_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn expression(&self) -> String {
        "ln(x)".to_string()
    }

    fn box_clone(&self) -> Box<dyn Qoi> {
        Box::new(self.clone())
    }
}

/// `1/x`.
#[derive(Debug, Clone)]
pub struct ReciprocalQoi {
    tolerance: f64,
    global_eb: f64,
}

impl ReciprocalQoi {
    pub fn new(tolerance: f64, global_eb: f64) -> Self {
        Self {
            tolerance,
            global_eb,
        }
    }
}

impl Qoi for ReciprocalQoi {
    fn id(&self) -> u32 {
        QOI_RECIPROCAL
    }

    fn eval(&self, v: f64) -> f64 {
        1.0 / v
    }

    fn interpret_eb(&self, v: f64) -> f64 {
        reciprocal_eb(v, self.tolerance).min(self.global_eb)
    }

    fn set_global_eb(&mut self, eb: f64) {
        self.global_eb = eb;
    }

    fn global_eb(&self) -> f64 {
        self.global_eb
    }

    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn qoi_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn expression(&self) -> String {
        "1/x".to_string()
    }

    fn box_clone(&self) -> Box<dyn Qoi> {
        Box::new(self.clone())
    }
}

/// A parsed single-variable expression.
///
/// With `analytical` set and a recognised shape the closed-form bound is
/// used; everything else goes through bisection.
#[derive(Debug, Clone)]
pub struct SymbolicQoi {
    expr: Expr,
    shape: Option<Shape>,
    tolerance: f64,
    global_eb: f64,
}

impl SymbolicQoi {
    pub fn new(expr: Expr, analytical: bool, tolerance: f64, global_eb: f64) -> Self {
        let shape = if analytical { expr.shape() } else { None };
        Self {
            expr,
            shape,
            tolerance,
            global_eb,
        }
    }
}

impl Qoi for SymbolicQoi {
    fn id(&self) -> u32 {
        QOI_SYMBOLIC
    }

    fn eval(&self, v: f64) -> f64 {
        self.expr.eval(v)
    }

    fn interpret_eb(&self, v: f64) -> f64 {
        let tol = self.tolerance;
        let eb = match self.shape {
            Some(Shape::Linear(a)) => linear_eb(a, tol),
            Some(Shape::Square) => square_eb(v, tol),
            Some(Shape::Reciprocal) => reciprocal_eb(v, tol),
            Some(Shape::Ln) if v > 0.0 => ln_eb(v, tol),
            Some(Shape::Ln) => 0.0,
            None => numeric_eb(|x| self.expr.eval(x), v, tol, self.global_eb),
        };
        eb.min(self.global_eb)
    }

    fn set_global_eb(&mut self, eb: f64) {
        self.global_eb = eb;
    }

    fn global_eb(&self) -> f64 {
        self.global_eb
    }

    fn set_qoi_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    fn qoi_tolerance(&self) -> f64 {
        self.tolerance
    }

    fn linear_scale(&self) -> Option<f64> {
        match self.expr {
            Expr::Var => Some(1.0),
            _ => None,
        }
    }

    fn expression(&self) -> String {
        self.expr.to_string()
    }

    fn box_clone(&self) -> Box<dyn Qoi> {
        Box::new(self.clone())
    }
}

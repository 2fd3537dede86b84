//! Gauss-Legendre quadrature on the unit interval.
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

/// Quadrature error
#[derive(thiserror::Error, Debug)]
pub enum QuadratureError {
    /// Rule not found
    #[error("no Gauss-Legendre rule with {0} points")]
    RuleNotFound(usize),
}

/// Gauss-Legendre rule on `[0, 1]`.
#[derive(Debug, Clone)]
pub struct QuadratureRule {
    /// The number of points of the quadrature rule.
    pub npoints: usize,
    /// The points in ascending order.
    pub points: Vec<f64>,
    /// The weights, summing to one.
    pub weights: Vec<f64>,
}

impl QuadratureRule {
    /// Apply the rule to `f`.
    pub fn integrate(&self, f: impl Fn(f64) -> f64) -> f64 {
        self.points
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| w * f(*x))
            .sum()
    }
}

lazy_static! {
    static ref RULES: Mutex<HashMap<usize, Arc<QuadratureRule>>> = Mutex::new(HashMap::new());
}

const MAX_NEWTON_ITERATIONS: usize = 100;

/// Return the Gauss-Legendre rule with `npoints` points on `[0, 1]`.
///
/// The rule integrates polynomials of degree `2 npoints - 1` exactly. Rules are computed once per
/// process and shared.
pub fn gauss_legendre(npoints: usize) -> Result<Arc<QuadratureRule>, QuadratureError> {
    if npoints == 0 {
        return Err(QuadratureError::RuleNotFound(npoints));
    }
    let mut rules = RULES.lock().unwrap();
    Ok(rules
        .entry(npoints)
        .or_insert_with(|| Arc::new(compute_gauss_legendre(npoints)))
        .clone())
}

/// Legendre polynomial `P_n(x)` and its derivative.
fn legendre_with_derivative(n: usize, x: f64) -> (f64, f64) {
    let mut p0 = 1.0;
    let mut p1 = x;
    for k in 2..=n {
        let k = k as f64;
        let p2 = ((2.0 * k - 1.0) * x * p1 - (k - 1.0) * p0) / k;
        p0 = p1;
        p1 = p2;
    }
    let dp = n as f64 * (x * p1 - p0) / (x * x - 1.0);
    (p1, dp)
}

fn compute_gauss_legendre(npoints: usize) -> QuadratureRule {
    let n = npoints as f64;
    let mut points = Vec::with_capacity(npoints);
    let mut weights = Vec::with_capacity(npoints);

    // Roots in descending order on [-1, 1], ascending after mapping x -> (1 - x) / 2.
    for i in 0..npoints {
        let mut x = (PI * (i as f64 + 0.75) / (n + 0.5)).cos();
        let mut dp = 1.0;
        for _ in 0..MAX_NEWTON_ITERATIONS {
            let (p, dpx) = legendre_with_derivative(npoints, x);
            dp = dpx;
            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                let (_, dpx) = legendre_with_derivative(npoints, x);
                dp = dpx;
                break;
            }
        }
        points.push(0.5 * (1.0 - x));
        weights.push(1.0 / ((1.0 - x * x) * dp * dp));
    }

    QuadratureRule {
        npoints,
        points,
        weights,
    }
}

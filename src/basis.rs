//! Scaling functions on the unit interval.
use crate::constants::MAX_ORDER;
use crate::index::NodeIndex;
use crate::quadrature::{gauss_legendre, QuadratureRule};
use crate::types::{MwError, Result, ScalingType};
use rlst::{
    rlst_dynamic_array2, Array, BaseArray, RawAccessMut, UnsafeRandomAccessMut, VectorContainer,
};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Dense column-major matrix.
pub type Matrix = Array<f64, BaseArray<f64, VectorContainer<f64>, 2>, 2>;

/// A family of `order + 1` orthonormal polynomials on `[0, 1]`, together with the Gauss-Legendre
/// rule of `order + 1` points that projects onto them exactly.
#[derive(Debug, Clone)]
pub struct ScalingBasis {
    scaling_type: ScalingType,
    order: usize,
    rule: Arc<QuadratureRule>,
}

impl ScalingBasis {
    /// Create a basis.
    pub fn new(scaling_type: ScalingType, order: usize) -> Result<Self> {
        if order > MAX_ORDER {
            return Err(MwError::InvalidOrder(order));
        }
        Ok(Self {
            scaling_type,
            order,
            rule: gauss_legendre(order + 1)?,
        })
    }

    /// Create a Legendre basis.
    pub fn legendre(order: usize) -> Result<Self> {
        Self::new(ScalingType::Legendre, order)
    }

    /// Create an interpolating basis.
    pub fn interpolating(order: usize) -> Result<Self> {
        Self::new(ScalingType::Interpolating, order)
    }

    /// The family of scaling functions.
    pub fn scaling_type(&self) -> ScalingType {
        self.scaling_type
    }

    /// The polynomial order.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of scaling functions, `order + 1`.
    pub fn kp1(&self) -> usize {
        self.order + 1
    }

    /// Quadrature points.
    pub fn quadrature_points(&self) -> &[f64] {
        &self.rule.points
    }

    /// Quadrature weights.
    pub fn quadrature_weights(&self) -> &[f64] {
        &self.rule.weights
    }

    /// Values of all scaling functions at `x`.
    pub fn evaluate(&self, x: f64) -> Vec<f64> {
        let mut values = vec![0.0; self.kp1()];
        self.evaluate_into(x, &mut values);
        values
    }

    /// Write the values of all scaling functions at `x` into `values`.
    pub fn evaluate_into(&self, x: f64, values: &mut [f64]) {
        let kp1 = self.kp1();
        assert!(values.len() >= kp1);
        match self.scaling_type {
            ScalingType::Legendre => {
                let t = 2.0 * x - 1.0;
                let mut p0 = 1.0;
                let mut p1 = t;
                values[0] = 1.0;
                if kp1 > 1 {
                    values[1] = 3f64.sqrt() * t;
                }
                for j in 2..kp1 {
                    let k = j as f64;
                    let p2 = ((2.0 * k - 1.0) * t * p1 - (k - 1.0) * p0) / k;
                    p0 = p1;
                    p1 = p2;
                    values[j] = (2.0 * k + 1.0).sqrt() * p2;
                }
            }
            ScalingType::Interpolating => {
                let points = &self.rule.points;
                for (j, value) in values.iter_mut().take(kp1).enumerate() {
                    let lagrange = points
                        .iter()
                        .enumerate()
                        .filter(|(m, _)| *m != j)
                        .fold(1.0, |acc, (_, xm)| acc * (x - xm) / (points[j] - xm));
                    *value = lagrange / self.rule.weights[j].sqrt();
                }
            }
        }
    }

    /// Integrals of the scaling functions over `[0, 1]`.
    pub fn integrals(&self) -> Vec<f64> {
        let kp1 = self.kp1();
        let mut integrals = vec![0.0; kp1];
        let mut values = vec![0.0; kp1];
        for (x, w) in self.rule.points.iter().zip(&self.rule.weights) {
            self.evaluate_into(*x, &mut values);
            for (integral, value) in integrals.iter_mut().zip(&values) {
                *integral += w * value;
            }
        }
        integrals
    }

    /// Matrix `P[q, j] = w_q φ_j(x_q)`. A row of values at the quadrature points times `P` is the
    /// row of coefficients.
    pub fn projection_matrix(&self) -> Matrix {
        let kp1 = self.kp1();
        let mut matrix = rlst_dynamic_array2!(f64, [kp1, kp1]);
        let mut values = vec![0.0; kp1];
        for (q, (x, w)) in self.rule.points.iter().zip(&self.rule.weights).enumerate() {
            self.evaluate_into(*x, &mut values);
            for (j, value) in values.iter().enumerate() {
                unsafe {
                    *matrix.get_unchecked_mut([q, j]) = w * value;
                }
            }
        }
        matrix
    }

    /// Matrix `V[j, q] = φ_j(x_q)`, mapping a row of coefficients to the values at the quadrature
    /// points. Inverse of [`ScalingBasis::projection_matrix`].
    pub fn value_matrix(&self) -> Matrix {
        let kp1 = self.kp1();
        let mut matrix = rlst_dynamic_array2!(f64, [kp1, kp1]);
        // Column q holds the basis functions at x_q.
        for (column, x) in matrix
            .data_mut()
            .chunks_exact_mut(kp1)
            .zip(&self.rule.points)
        {
            self.evaluate_into(*x, column);
        }
        matrix
    }

    /// Evaluate the scaling expansion `block` of the cell `idx` at the point `r`.
    pub fn evaluate_expansion<const D: usize>(
        &self,
        block: &[f64],
        idx: &NodeIndex<D>,
        r: &[f64; D],
    ) -> f64 {
        let kp1 = self.kp1();
        let two_n = 2f64.powi(idx.scale());
        let mut phi = vec![0.0; D * kp1];
        for d in 0..D {
            let x = two_n * r[d] - f64::from(idx.translation()[d]);
            self.evaluate_into(x, &mut phi[d * kp1..(d + 1) * kp1]);
        }
        let mut result = 0.0;
        for (m, c) in block.iter().enumerate() {
            let mut rem = m;
            let mut product = *c;
            for d in 0..D {
                product *= phi[d * kp1 + rem % kp1];
                rem /= kp1;
            }
            result += product;
        }
        result * two_n.powf(0.5 * D as f64)
    }

    /// Integral of the scaling expansion `block` of a cell at `scale`.
    pub fn integrate_expansion<const D: usize>(&self, block: &[f64], scale: i32) -> f64 {
        let kp1 = self.kp1();
        let integrals = self.integrals();
        let mut result = 0.0;
        for (m, c) in block.iter().enumerate() {
            let mut rem = m;
            let mut product = *c;
            for _ in 0..D {
                product *= integrals[rem % kp1];
                rem /= kp1;
            }
            result += product;
        }
        result * 2f64.powf(-0.5 * f64::from(scale) * D as f64)
    }
}

impl PartialEq for ScalingBasis {
    fn eq(&self, other: &Self) -> bool {
        self.scaling_type == other.scaling_type && self.order == other.order
    }
}

impl Eq for ScalingBasis {}

impl Hash for ScalingBasis {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scaling_type.hash(state);
        self.order.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::*;
    use paste::paste;
    use rlst::prelude::*;

    #[test]
    fn test_value_matrix_columns() {
        let basis = ScalingBasis::legendre(3).unwrap();
        let matrix = basis.value_matrix();
        for (q, x) in basis.quadrature_points().iter().enumerate() {
            for (j, value) in basis.evaluate(*x).iter().enumerate() {
                assert_eq!(*matrix.get([j, q]).unwrap(), *value);
            }
        }
    }

    #[test]
    fn test_invalid_order() {
        assert!(matches!(
            ScalingBasis::legendre(MAX_ORDER + 1),
            Err(MwError::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_interpolating_is_cardinal() {
        let basis = ScalingBasis::interpolating(4).unwrap();
        for (q, x) in basis.quadrature_points().iter().enumerate() {
            let values = basis.evaluate(*x);
            for (j, value) in values.iter().enumerate() {
                let expected = if j == q {
                    1.0 / basis.quadrature_weights()[j].sqrt()
                } else {
                    0.0
                };
                assert_relative_eq!(*value, expected, epsilon = 1e-11);
            }
        }
    }

    #[test]
    fn test_legendre_values() {
        let basis = ScalingBasis::legendre(2).unwrap();
        let values = basis.evaluate(1.0);
        assert_relative_eq!(values[0], 1.0, epsilon = 1e-14);
        assert_relative_eq!(values[1], 3f64.sqrt(), epsilon = 1e-14);
        assert_relative_eq!(values[2], 5f64.sqrt(), epsilon = 1e-14);
    }

    #[test]
    fn test_expansion_of_constant() {
        let basis = ScalingBasis::legendre(3).unwrap();
        // Constant 2 on the cell [0.5, 0.75).
        let idx = NodeIndex::new(2, [2]);
        let mut block = vec![0.0; 4];
        block[0] = 2.0 * 0.5;
        assert_relative_eq!(
            basis.evaluate_expansion(&block, &idx, &[0.6]),
            2.0,
            epsilon = 1e-13
        );
        assert_relative_eq!(
            basis.integrate_expansion::<1>(&block, 2),
            0.5,
            epsilon = 1e-13
        );
    }

    macro_rules! test_basis {
        ($($scaling:ident),+) => {
            $(
                paste! {
                    #[test]
                    fn [<test_orthonormal_ $scaling:lower>]() {
                        let basis = ScalingBasis::new(ScalingType::$scaling, 6).unwrap();
                        let kp1 = basis.kp1();
                        let mut gram = vec![0.0; kp1 * kp1];
                        for (x, w) in basis.quadrature_points().iter().zip(basis.quadrature_weights()) {
                            let values = basis.evaluate(*x);
                            for i in 0..kp1 {
                                for j in 0..kp1 {
                                    gram[i * kp1 + j] += w * values[i] * values[j];
                                }
                            }
                        }
                        for i in 0..kp1 {
                            for j in 0..kp1 {
                                let expected = if i == j { 1.0 } else { 0.0 };
                                assert_relative_eq!(gram[i * kp1 + j], expected, epsilon = 1e-12);
                            }
                        }
                    }

                    #[test]
                    fn [<test_projection_inverts_values_ $scaling:lower>]() {
                        let basis = ScalingBasis::new(ScalingType::$scaling, 5).unwrap();
                        let kp1 = basis.kp1();
                        let product = empty_array::<f64, 2>().simple_mult_into_resize(
                            basis.value_matrix().view(),
                            basis.projection_matrix().view(),
                        );
                        assert_eq!(product.shape(), [kp1, kp1]);
                        for i in 0..kp1 {
                            for j in 0..kp1 {
                                let expected = if i == j { 1.0 } else { 0.0 };
                                assert_relative_eq!(*product.get([i, j]).unwrap(), expected, epsilon = 1e-12);
                            }
                        }
                    }

                    #[test]
                    fn [<test_integrals_ $scaling:lower>]() {
                        let basis = ScalingBasis::new(ScalingType::$scaling, 3).unwrap();
                        // The constant 1 has coefficients equal to the integrals.
                        let integrals = basis.integrals();
                        let norm: f64 = integrals.iter().map(|i| i * i).sum();
                        assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
                    }
                }
            )*
        };
    }

    test_basis!(Legendre, Interpolating);
}

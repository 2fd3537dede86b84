//! Two-scale filters of a scaling basis.
use crate::basis::{Matrix, ScalingBasis};
use crate::types::{MwTransformType, ScalingType};
use rlst::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref FILTERS: Mutex<HashMap<(ScalingType, usize), Arc<MwFilter>>> =
        Mutex::new(HashMap::new());
}

/// The multiwavelet filter bank `[[H0, H1], [G0, G1]]` of a basis.
///
/// `H0`/`H1` express a scaling function of the parent through those of the lower and upper child,
/// `G0`/`G1` the wavelets. The full `2(k+1) x 2(k+1)` matrix is orthogonal, so reconstruction uses
/// the transposed blocks.
#[derive(Debug)]
pub struct MwFilter {
    basis: ScalingBasis,
    compression: [Matrix; 4],
    reconstruction: [Matrix; 4],
}

impl MwFilter {
    /// Construct the filters of `basis`.
    pub fn new(basis: &ScalingBasis) -> Self {
        let kp1 = basis.kp1();
        let points = basis.quadrature_points();
        let weights = basis.quadrature_weights();
        let scale = 0.5f64.sqrt();

        // [H0 H1] by quadrature of the parent functions against the dilated children.
        let mut scaling = rlst_dynamic_array2!(f64, [kp1, 2 * kp1]);
        let mut phi_lower = vec![0.0; kp1];
        let mut phi_upper = vec![0.0; kp1];
        let mut phi = vec![0.0; kp1];
        for (x, w) in points.iter().zip(weights) {
            basis.evaluate_into(0.5 * x, &mut phi_lower);
            basis.evaluate_into(0.5 * (x + 1.0), &mut phi_upper);
            basis.evaluate_into(*x, &mut phi);
            for (i, value) in phi.iter().enumerate() {
                for j in 0..kp1 {
                    unsafe {
                        *scaling.get_unchecked_mut([j, i]) += scale * w * phi_lower[j] * value;
                        *scaling.get_unchecked_mut([j, kp1 + i]) += scale * w * phi_upper[j] * value;
                    }
                }
            }
        }
        let h0 = block(&scaling, 0, 0, kp1);
        let h1 = block(&scaling, 0, kp1, kp1);

        // The rows of [H0 H1] are orthonormal. The trailing right singular vectors complete them
        // to an orthonormal basis of R^{2(k+1)}, which gives [G0 G1].
        let mut u = rlst_dynamic_array2!(f64, [kp1, kp1]);
        let mut vt = rlst_dynamic_array2!(f64, [2 * kp1, 2 * kp1]);
        let mut sigma = vec![0.0; kp1];
        scaling
            .into_svd_alloc(u.view_mut(), vt.view_mut(), &mut sigma[..], SvdMode::Full)
            .unwrap_or_else(|e| panic!("filter factorisation failed: {e:?}"));
        log::trace!("filter singular values of order {}: {sigma:?}", basis.order());
        let g0 = block(&vt, kp1, 0, kp1);
        let g1 = block(&vt, kp1, kp1, kp1);

        let reconstruction = [transpose(&h0), transpose(&g0), transpose(&h1), transpose(&g1)];
        Self {
            basis: basis.clone(),
            compression: [h0, h1, g0, g1],
            reconstruction,
        }
    }

    /// The shared filters of `basis`, constructed on first use.
    pub fn get(basis: &ScalingBasis) -> Arc<Self> {
        let mut filters = FILTERS.lock().unwrap();
        filters
            .entry((basis.scaling_type(), basis.order()))
            .or_insert_with(|| Arc::new(Self::new(basis)))
            .clone()
    }

    /// The basis.
    pub fn basis(&self) -> &ScalingBasis {
        &self.basis
    }

    /// Number of scaling functions.
    pub fn kp1(&self) -> usize {
        self.basis.kp1()
    }

    /// Sub-filter for `f_idx = 2 bit(out) + bit(in)`, a `(k+1) x (k+1)` matrix.
    ///
    /// Compression selects `H0, H1, G0, G1`, reconstruction `H0^T, G0^T, H1^T, G1^T`.
    pub fn sub_filter(&self, f_idx: usize, transform: MwTransformType) -> &Matrix {
        match transform {
            MwTransformType::Compression => &self.compression[f_idx],
            MwTransformType::Reconstruction => &self.reconstruction[f_idx],
        }
    }

    /// The full filter bank `[[H0, H1], [G0, G1]]`.
    pub fn filter_bank(&self) -> Matrix {
        let kp1 = self.kp1();
        let mut bank = rlst_dynamic_array2!(f64, [2 * kp1, 2 * kp1]);
        for (position, sub) in self.compression.iter().enumerate() {
            bank.view_mut()
                .into_subview([(position / 2) * kp1, (position % 2) * kp1], [kp1, kp1])
                .fill_from(sub.view());
        }
        bank
    }
}

/// The `n x n` block of `matrix` starting at `(row, column)`.
fn block(matrix: &Matrix, row: usize, column: usize, n: usize) -> Matrix {
    let mut result = rlst_dynamic_array2!(f64, [n, n]);
    result.fill_from(matrix.view().into_subview([row, column], [n, n]));
    result
}

fn transpose(matrix: &Matrix) -> Matrix {
    let [rows, columns] = matrix.shape();
    let mut result = rlst_dynamic_array2!(f64, [columns, rows]);
    for j in 0..columns {
        for i in 0..rows {
            unsafe {
                *result.get_unchecked_mut([j, i]) = *matrix.get_unchecked([i, j]);
            }
        }
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::*;
    use paste::paste;
    use rlst::prelude::*;

    fn assert_orthogonal(filter: &MwFilter) {
        let n = 2 * filter.kp1();
        let bank = filter.filter_bank();
        let gram = empty_array::<f64, 2>()
            .simple_mult_into_resize(bank.view(), transpose(&bank).view());
        assert_eq!(gram.shape(), [n, n]);
        for i in 0..n {
            for j in 0..n {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(*gram.get([i, j]).unwrap(), expected, epsilon = 1e-12);
            }
        }
    }

    fn entry(filter: &MwFilter, f_idx: usize, i: usize, j: usize) -> f64 {
        *filter
            .sub_filter(f_idx, MwTransformType::Compression)
            .get([i, j])
            .unwrap()
    }

    #[test]
    fn test_filters_are_shared() {
        let basis = ScalingBasis::legendre(5).unwrap();
        assert!(Arc::ptr_eq(&MwFilter::get(&basis), &MwFilter::get(&basis)));
    }

    #[test]
    fn test_haar() {
        let filter = MwFilter::new(&ScalingBasis::legendre(0).unwrap());
        let s = 0.5f64.sqrt();
        assert_relative_eq!(entry(&filter, 0, 0, 0), s, epsilon = 1e-15);
        assert_relative_eq!(entry(&filter, 1, 0, 0), s, epsilon = 1e-15);
        let g0 = entry(&filter, 2, 0, 0);
        let g1 = entry(&filter, 3, 0, 0);
        assert_relative_eq!(g0.abs(), s, epsilon = 1e-14);
        assert_relative_eq!(g0 + g1, 0.0, epsilon = 1e-14);
    }

    #[test]
    fn test_wavelets_annihilate_low_polynomials() {
        // The wavelets of order k are orthogonal to every polynomial of degree <= k on the
        // parent cell, so [G0 G1] maps the child coefficients of such a polynomial to zero.
        let basis = ScalingBasis::legendre(4).unwrap();
        let filter = MwFilter::new(&basis);
        let kp1 = filter.kp1();
        for degree in 0..kp1 {
            let polynomial = |x: f64| x.powi(degree as i32);
            let mut children = vec![0.0; 2 * kp1];
            for (child, coefs) in children.chunks_exact_mut(kp1).enumerate() {
                for (x, w) in basis.quadrature_points().iter().zip(basis.quadrature_weights()) {
                    let value = polynomial(0.5 * (x + child as f64)) * w;
                    for (c, phi) in coefs.iter_mut().zip(basis.evaluate(*x)) {
                        *c += value * phi;
                    }
                }
            }
            for j in 0..kp1 {
                let detail: f64 = (0..kp1)
                    .map(|i| entry(&filter, 2, j, i) * children[i] + entry(&filter, 3, j, i) * children[kp1 + i])
                    .sum();
                assert_relative_eq!(detail, 0.0, epsilon = 1e-12);
            }
        }
    }

    macro_rules! test_filter {
        ($($scaling:ident),+) => {
            $(
                paste! {
                    #[test]
                    fn [<test_orthogonal_ $scaling:lower>]() {
                        for order in [0, 1, 3, 5, 9] {
                            let basis = ScalingBasis::new(ScalingType::$scaling, order).unwrap();
                            assert_orthogonal(&MwFilter::new(&basis));
                        }
                    }

                    #[test]
                    fn [<test_reconstruction_is_transpose_ $scaling:lower>]() {
                        let basis = ScalingBasis::new(ScalingType::$scaling, 3).unwrap();
                        let filter = MwFilter::new(&basis);
                        let kp1 = filter.kp1();
                        // Reconstruction slot -> compression slot it transposes.
                        for (rec, comp) in [(0, 0), (1, 2), (2, 1), (3, 3)] {
                            let r = filter.sub_filter(rec, MwTransformType::Reconstruction);
                            let c = filter.sub_filter(comp, MwTransformType::Compression);
                            for j in 0..kp1 {
                                for i in 0..kp1 {
                                    assert_eq!(r.get([i, j]), c.get([j, i]));
                                }
                            }
                        }
                    }
                }
            )*
        };
    }

    test_filter!(Legendre, Interpolating);
}

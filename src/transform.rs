//! Multiwavelet and value transforms of a single coefficient buffer.
//!
//! A node buffer holds `2^D` blocks of `(k+1)^D` coefficients. Within a block the coefficient of
//! the tensor function `φ_{m_0}(x_0) ... φ_{m_{D-1}}(x_{D-1})` sits at `m_0 + (k+1) m_1 + ...`.
//! Block `c` holds the scaling coefficients of child `c` in the nodal representation, and the
//! parent scaling block (`c = 0`) plus the wavelet blocks in the compressed representation.
use crate::basis::{Matrix, ScalingBasis};
use crate::filter::MwFilter;
use crate::types::{CvTransformType, MwError, MwTransformType, Result, ScalingType};
use itertools::iproduct;
use rlst::prelude::*;
use std::sync::Mutex;

/// Accumulate one filter application: `out[m + kdm1 j] += Σ_i F[j, i] inp[i + kp1 m]`.
///
/// Reading along the first axis and writing along the last rotates the axes of the block, so D
/// consecutive passes treat every axis once and restore the original layout.
pub fn apply_filter(out: &mut [f64], inp: &[f64], filter: &Matrix, kp1: usize, kdm1: usize) {
    let product = empty_array::<f64, 2>()
        .simple_mult_into_resize(filter.view(), rlst_array_from_slice2!(inp, [kp1, kdm1]));
    for (m, column) in product.data().chunks_exact(kp1).enumerate() {
        for (j, value) in column.iter().enumerate() {
            out[m + kdm1 * j] += value;
        }
    }
}

fn filter_pass<const D: usize>(
    inp: &[f64],
    out: &mut [f64],
    axis: usize,
    filter: &MwFilter,
    transform: MwTransformType,
) {
    let kp1 = filter.kp1();
    let kd = kp1.pow(D as u32);
    let kdm1 = kd / kp1;
    let mask = 1 << axis;
    out.fill(0.0);
    for (g, f) in iproduct!(0..1usize << D, 0..1usize << D) {
        if (g | mask) != (f | mask) {
            continue;
        }
        let f_idx = 2 * ((g >> axis) & 1) + ((f >> axis) & 1);
        apply_filter(
            &mut out[g * kd..(g + 1) * kd],
            &inp[f * kd..(f + 1) * kd],
            filter.sub_filter(f_idx, transform),
            kp1,
            kdm1,
        );
    }
}

/// Transform a full node buffer in place between the nodal and the compressed representation.
///
/// `scratch` must hold at least as many values as `coefs`. The summation order is fixed, so the
/// result does not depend on the calling thread.
pub fn mw_transform<const D: usize>(
    coefs: &mut [f64],
    scratch: &mut [f64],
    filter: &MwFilter,
    transform: MwTransformType,
) {
    let n_coefs = (1 << D) * filter.kp1().pow(D as u32);
    assert_eq!(coefs.len(), n_coefs, "node buffer has the wrong length");
    assert!(scratch.len() >= n_coefs, "scratch buffer too small");
    let scratch = &mut scratch[..n_coefs];
    for axis in 0..D {
        if axis % 2 == 0 {
            filter_pass::<D>(coefs, scratch, axis, filter, transform);
        } else {
            filter_pass::<D>(scratch, coefs, axis, filter, transform);
        }
    }
    if D % 2 == 1 {
        coefs.copy_from_slice(scratch);
    }
}

/// Multiply the fibres along `axis` of every `(k+1)^D` block in `coefs` from the right by the
/// `(k+1) x (k+1)` matrix `matrix`.
pub fn tensor_apply(coefs: &mut [f64], matrix: &Matrix, kp1: usize, axis: usize) {
    let stride = kp1.pow(axis as u32);
    // Each chunk is a column-major `stride x (k+1)` matrix whose rows are fibres along `axis`.
    for chunk in coefs.chunks_exact_mut(stride * kp1) {
        let product = empty_array::<f64, 2>()
            .simple_mult_into_resize(rlst_array_from_slice2!(chunk, [stride, kp1]), matrix.view());
        chunk.copy_from_slice(product.data());
    }
}

/// Convert the blocks of a node at `scale` from coefficients to values at the tensor quadrature
/// points of each child cell.
pub fn coefs_to_values<const D: usize>(coefs: &mut [f64], basis: &ScalingBasis, scale: i32) {
    let matrix = basis.value_matrix();
    for axis in 0..D {
        tensor_apply(coefs, &matrix, basis.kp1(), axis);
    }
    let factor = 2f64.powf(0.5 * f64::from(scale + 1) * D as f64);
    coefs.iter_mut().for_each(|c| *c *= factor);
}

/// Inverse of [`coefs_to_values`]: project values at the child quadrature points to coefficients.
pub fn values_to_coefs<const D: usize>(values: &mut [f64], basis: &ScalingBasis, scale: i32) {
    let matrix = basis.projection_matrix();
    for axis in 0..D {
        tensor_apply(values, &matrix, basis.kp1(), axis);
    }
    let factor = 2f64.powf(-0.5 * f64::from(scale + 1) * D as f64);
    values.iter_mut().for_each(|c| *c *= factor);
}

/// Rescale the blocks of a node at `scale` between coefficients and values at the child
/// quadrature points. Only defined for interpolating bases, where it is diagonal.
pub fn cv_transform<const D: usize>(
    coefs: &mut [f64],
    basis: &ScalingBasis,
    scale: i32,
    direction: CvTransformType,
) -> Result<()> {
    if basis.scaling_type() != ScalingType::Interpolating {
        return Err(MwError::UnsupportedBasis(basis.scaling_type()));
    }
    let kp1 = basis.kp1();
    let kd = kp1.pow(D as u32);
    let two_scale = 2f64.powi(scale + 1);
    let factors: Vec<f64> = basis
        .quadrature_weights()
        .iter()
        .map(|w| match direction {
            CvTransformType::Forward => (w / two_scale).sqrt(),
            CvTransformType::Backward => (two_scale / w).sqrt(),
        })
        .collect();

    for (i, c) in coefs.iter_mut().enumerate() {
        let mut rem = i % kd;
        for _ in 0..D {
            *c *= factors[rem % kp1];
            rem /= kp1;
        }
    }
    Ok(())
}

/// Scratch buffers, one per worker thread of the rayon pool.
#[derive(Debug)]
pub struct ScratchPool {
    buffers: Vec<Mutex<Vec<f64>>>,
    size: usize,
}

impl ScratchPool {
    /// Create `n_threads` buffers of `size` values each.
    pub fn new(n_threads: usize, size: usize) -> Self {
        Self {
            buffers: (0..n_threads.max(1))
                .map(|_| Mutex::new(vec![0.0; size]))
                .collect(),
            size,
        }
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Run `f` with the buffer of the calling thread.
    ///
    /// Threads outside the rayon pool, and workers with an index past the pool, get a temporary
    /// buffer of their own.
    pub fn with_scratch<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        match rayon::current_thread_index().filter(|thread| *thread < self.buffers.len()) {
            Some(thread) => {
                let mut buffer = self.buffers[thread].lock().unwrap();
                f(&mut buffer)
            }
            None => f(&mut vec![0.0; self.size]),
        }
    }
}

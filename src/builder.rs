//! Adaptive construction of trees.
//!
//! A build alternates two steps on a batch of nodes: a [`TreeCalculator`] computes their
//! coefficients, and a [`TreeAdaptor`] decides which of them to split. Children of split nodes
//! form the next batch.
use crate::basis::ScalingBasis;
use crate::constants::MACHINE_PRECISION;
use crate::filter::MwFilter;
use crate::node::MwNode;
use crate::transform::{mw_transform, values_to_coefs};
use crate::tree::MwTree;
use crate::types::{MwError, MwTransformType, Result, TraverseDirection, TraverseOrder};
use log::{debug, warn};
use std::sync::Arc;

/// Computes the full coefficient buffer of one node.
pub trait TreeCalculator<const D: usize>: Sync {
    /// Fill `coefs` with the scaling and wavelet coefficients of `node`. `scratch` holds at least
    /// as many values as `coefs`.
    fn calc_node(&self, node: &MwNode<D>, coefs: &mut [f64], scratch: &mut [f64]);
}

/// Decides whether a computed node needs children.
pub trait TreeAdaptor<const D: usize>: Sync {
    /// Whether to split `node`, given the squared norm of the whole tree.
    fn split_node(&self, node: &MwNode<D>, tree_square_norm: f64) -> bool;
}

/// Wavelet norm threshold of a node at `scale`, relative to `reference`.
pub fn wavelet_threshold(reference: f64, precision: f64, scale: i32) -> f64 {
    (reference * precision * 2f64.powf(-0.5 * f64::from(scale + 1))).max(2.0 * MACHINE_PRECISION)
}

/// Zero coefficients.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCalculator;

impl<const D: usize> TreeCalculator<D> for DefaultCalculator {
    fn calc_node(&self, _node: &MwNode<D>, coefs: &mut [f64], _scratch: &mut [f64]) {
        coefs.fill(0.0);
    }
}

/// Projection of an analytic function by Gauss-Legendre quadrature on the children of each node.
pub struct ProjectionCalculator<F> {
    func: F,
    basis: ScalingBasis,
    filter: Arc<MwFilter>,
}

impl<F> ProjectionCalculator<F> {
    /// Project `func` onto `basis`.
    pub fn new(func: F, basis: &ScalingBasis) -> Self {
        Self {
            func,
            basis: basis.clone(),
            filter: MwFilter::get(basis),
        }
    }
}

impl<F, const D: usize> TreeCalculator<D> for ProjectionCalculator<F>
where
    F: Fn(&[f64; D]) -> f64 + Sync,
{
    fn calc_node(&self, node: &MwNode<D>, coefs: &mut [f64], scratch: &mut [f64]) {
        let kp1 = self.basis.kp1();
        let kd = kp1.pow(D as u32);
        let points = self.basis.quadrature_points();
        let width = 2f64.powi(-(node.scale() + 1));
        for c in 0..MwNode::<D>::TDIM {
            let child = node.index().child(c);
            let corner = child.translation();
            for (m, value) in coefs[c * kd..(c + 1) * kd].iter_mut().enumerate() {
                let mut rem = m;
                let r = std::array::from_fn(|d| {
                    let q = rem % kp1;
                    rem /= kp1;
                    width * (f64::from(corner[d]) + points[q])
                });
                *value = (self.func)(&r);
            }
        }
        values_to_coefs::<D>(coefs, &self.basis, node.scale());
        mw_transform::<D>(coefs, scratch, &self.filter, MwTransformType::Compression);
    }
}

/// Splits nodes whose wavelet norm exceeds the threshold of `precision`.
///
/// The threshold is relative to the norm of the tree unless `absolute` is set. A negative
/// precision never splits.
#[derive(Debug, Clone, Copy)]
pub struct WaveletAdaptor {
    precision: f64,
    absolute: bool,
}

impl WaveletAdaptor {
    /// Create an adaptor.
    pub fn new(precision: f64, absolute: bool) -> Self {
        Self {
            precision,
            absolute,
        }
    }
}

impl<const D: usize> TreeAdaptor<D> for WaveletAdaptor {
    fn split_node(&self, node: &MwNode<D>, tree_square_norm: f64) -> bool {
        if self.precision < 0.0 {
            return false;
        }
        let reference = if self.absolute {
            1.0
        } else {
            tree_square_norm.max(0.0).sqrt()
        };
        node.wavelet_norm() > wavelet_threshold(reference, self.precision, node.scale())
    }
}

/// Never splits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdaptor;

impl<const D: usize> TreeAdaptor<D> for NoAdaptor {
    fn split_node(&self, _node: &MwNode<D>, _tree_square_norm: f64) -> bool {
        false
    }
}

/// Drives the compute and split rounds of a build.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeBuilder {
    max_iterations: Option<usize>,
}

impl TreeBuilder {
    /// A builder refining until the adaptor is satisfied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of refinement rounds.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Compute the end nodes of `tree` and refine them until `adaptor` splits no node. Returns
    /// the number of refinement rounds.
    ///
    /// Nodes at the finest scale of the analysis are not split further.
    pub fn build<const D: usize, C, A>(&self, tree: &mut MwTree<D>, calculator: &C, adaptor: &A) -> usize
    where
        C: TreeCalculator<D> + ?Sized,
        A: TreeAdaptor<D> + ?Sized,
    {
        let tdim = MwNode::<D>::TDIM;
        let max_scale = tree.mra().max_scale();
        let mut work = tree.end_nodes().to_vec();
        let mut iteration = 0;
        while !work.is_empty() {
            tree.calc_nodes(&work, calculator);
            let square_norm = tree.calc_square_norm();
            debug!(
                "build round {iteration}: {} nodes computed, {} in tree, squared norm {square_norm:e}",
                work.len(),
                tree.n_nodes()
            );
            if self.max_iterations.is_some_and(|max| iteration >= max) {
                break;
            }

            let mut next = vec![];
            let mut capped = 0;
            for serial in &work {
                let node = tree.node(*serial);
                if !adaptor.split_node(node, square_norm) {
                    continue;
                }
                if node.scale() >= max_scale {
                    capped += 1;
                    continue;
                }
                let first = tree.create_children(*serial);
                next.extend(first..first + tdim);
            }
            if capped > 0 {
                warn!("{capped} nodes reached the finest scale {max_scale} without converging");
            }
            if !next.is_empty() {
                iteration += 1;
            }
            work = next;
        }
        tree.reset_end_table();
        iteration
    }
}

/// Project `func` onto `tree` to the given precision. Returns the number of refinement rounds.
pub fn project<const D: usize>(
    tree: &mut MwTree<D>,
    precision: f64,
    absolute: bool,
    func: impl Fn(&[f64; D]) -> f64 + Sync,
) -> usize {
    let calculator = ProjectionCalculator::new(func, tree.basis());
    let adaptor = WaveletAdaptor::new(precision, absolute);
    let iterations = TreeBuilder::new().build(tree, &calculator, &adaptor);
    tree.mw_transform(TraverseDirection::BottomUp, true);
    tree.calc_square_norm();
    iterations
}

/// Refine every end node `scales` times.
pub fn build_grid<const D: usize>(tree: &mut MwTree<D>, scales: usize) {
    for _ in 0..scales {
        for serial in tree.end_nodes().to_vec() {
            if tree.node(serial).scale() < tree.mra().max_scale() {
                tree.create_children(serial);
            }
        }
        tree.reset_end_table();
    }
}

/// Extend `out` to the union of its grid and the grid of `inp`. Nodes of `out` with coefficients
/// pass them on to their new children. Returns the number of created nodes.
pub fn copy_grid<const D: usize>(out: &mut MwTree<D>, inp: &MwTree<D>) -> Result<usize> {
    if !out.mra().is_compatible(inp.mra()) {
        return Err(MwError::IncompatibleTrees(format!(
            "cannot copy the grid of {:?} onto {:?}",
            inp.name(),
            out.name()
        )));
    }
    let before = out.n_nodes();
    for serial in inp.iter(TraverseDirection::TopDown, TraverseOrder::ZOrder) {
        let node = inp.node(serial);
        if node.first_child().is_none() {
            continue;
        }
        let target = out
            .find_node(node.index())
            .unwrap_or_else(|| panic!("{} missing while its parent was refined", node.index()));
        if out.node(target).first_child().is_none() {
            out.create_children(target);
            if out.node(target).has_coefs() {
                out.give_children_coefs(target, true);
            }
        }
    }
    out.reset_end_table();
    Ok(out.n_nodes() - before)
}

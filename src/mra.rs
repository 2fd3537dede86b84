//! Computational domain and multiresolution analysis.
use crate::basis::ScalingBasis;
use crate::constants::{MAX_DIM, MAX_SCALE};
use crate::filter::MwFilter;
use crate::index::NodeIndex;
use crate::types::{MwError, Result};
use std::sync::Arc;

/// A box of root cells, all at `scale`, with translations `corner + i`, `0 <= i < n_boxes` along
/// each axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundingBox<const D: usize> {
    scale: i32,
    corner: [i32; D],
    n_boxes: [usize; D],
}

impl<const D: usize> BoundingBox<D> {
    /// Create a box.
    pub fn new(scale: i32, corner: [i32; D], n_boxes: [usize; D]) -> Self {
        assert!(
            n_boxes.iter().all(|n| *n > 0),
            "a bounding box needs at least one cell per axis"
        );
        Self {
            scale,
            corner,
            n_boxes,
        }
    }

    /// The unit cube as a single root at scale zero.
    pub fn unit() -> Self {
        Self::new(0, [0; D], [1; D])
    }

    /// Scale of the root cells.
    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// Translation of the first root cell.
    pub fn corner(&self) -> &[i32; D] {
        &self.corner
    }

    /// Number of root cells per axis.
    pub fn n_boxes(&self) -> &[usize; D] {
        &self.n_boxes
    }

    /// Total number of root cells.
    pub fn n_roots(&self) -> usize {
        self.n_boxes.iter().product()
    }

    /// Index of root `i`, counting along the first axis fastest.
    pub fn root_index(&self, i: usize) -> NodeIndex<D> {
        assert!(i < self.n_roots(), "root {i} out of range");
        let mut rem = i;
        let translation = std::array::from_fn(|d| {
            let offset = rem % self.n_boxes[d];
            rem /= self.n_boxes[d];
            self.corner[d] + offset as i32
        });
        NodeIndex::new(self.scale, translation)
    }

    fn root_from_offsets(&self, offsets: [i64; D]) -> Option<usize> {
        let mut root = 0;
        let mut stride = 1;
        for d in 0..D {
            if offsets[d] < 0 || offsets[d] >= self.n_boxes[d] as i64 {
                return None;
            }
            root += offsets[d] as usize * stride;
            stride *= self.n_boxes[d];
        }
        Some(root)
    }

    /// Root whose cell contains `idx`, `None` outside the box or above the root scale.
    pub fn box_index(&self, idx: &NodeIndex<D>) -> Option<usize> {
        if idx.scale() < self.scale {
            return None;
        }
        let root = idx.ancestor(self.scale);
        self.root_from_offsets(std::array::from_fn(|d| {
            i64::from(root.translation()[d]) - i64::from(self.corner[d])
        }))
    }

    /// Root whose cell contains the point `r`, `None` outside the box.
    pub fn box_index_at(&self, r: &[f64; D]) -> Option<usize> {
        let two_n = 2f64.powi(self.scale);
        let offsets = std::array::from_fn(|d| {
            let l = (r[d] * two_n).floor();
            if l.is_finite() {
                l as i64 - i64::from(self.corner[d])
            } else {
                -1
            }
        });
        self.root_from_offsets(offsets)
    }

    /// Lower corner of the box.
    pub fn lower_bounds(&self) -> [f64; D] {
        let width = 2f64.powi(-self.scale);
        self.corner.map(|l| width * f64::from(l))
    }

    /// Upper corner of the box.
    pub fn upper_bounds(&self) -> [f64; D] {
        let width = 2f64.powi(-self.scale);
        std::array::from_fn(|d| width * (f64::from(self.corner[d]) + self.n_boxes[d] as f64))
    }
}

/// The domain, the scaling basis and the finest scale of a family of trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultiResolutionAnalysis<const D: usize> {
    world: BoundingBox<D>,
    basis: ScalingBasis,
    max_scale: i32,
}

impl<const D: usize> MultiResolutionAnalysis<D> {
    /// Create an analysis refining down to the default finest scale.
    pub fn new(world: BoundingBox<D>, basis: ScalingBasis) -> Result<Self> {
        Self::with_max_scale(world, basis, MAX_SCALE)
    }

    /// Create an analysis refining down to `max_scale`.
    pub fn with_max_scale(world: BoundingBox<D>, basis: ScalingBasis, max_scale: i32) -> Result<Self> {
        if D == 0 || D > MAX_DIM {
            return Err(MwError::InvalidDimension(D));
        }
        assert!(
            max_scale >= world.scale(),
            "finest scale {max_scale} is coarser than the root scale {}",
            world.scale()
        );
        Ok(Self {
            world,
            basis,
            max_scale,
        })
    }

    /// The root box.
    pub fn world(&self) -> &BoundingBox<D> {
        &self.world
    }

    /// The scaling basis.
    pub fn basis(&self) -> &ScalingBasis {
        &self.basis
    }

    /// Polynomial order of the basis.
    pub fn order(&self) -> usize {
        self.basis.order()
    }

    /// Scale of the root cells.
    pub fn root_scale(&self) -> i32 {
        self.world.scale()
    }

    /// Finest scale any node may have.
    pub fn max_scale(&self) -> i32 {
        self.max_scale
    }

    /// Largest depth below the roots.
    pub fn max_depth(&self) -> usize {
        (self.max_scale - self.world.scale()) as usize
    }

    /// The shared filters of the basis.
    pub fn filter(&self) -> Arc<MwFilter> {
        MwFilter::get(&self.basis)
    }

    /// Whether trees of the two analyses can be combined.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_root_indices() {
        let world = BoundingBox::new(1, [-1, 0], [3, 2]);
        assert_eq!(world.n_roots(), 6);
        assert_eq!(world.root_index(0), NodeIndex::new(1, [-1, 0]));
        assert_eq!(world.root_index(4), NodeIndex::new(1, [0, 1]));
        for i in 0..6 {
            let root = world.root_index(i);
            assert_eq!(world.box_index(&root), Some(i));
            assert_eq!(world.box_index(&root.child(3).child(1)), Some(i));
            assert_eq!(world.box_index_at(&root.center()), Some(i));
        }
        assert_eq!(world.box_index(&NodeIndex::new(0, [0, 0])), None);
        assert_eq!(world.box_index(&NodeIndex::new(1, [2, 0])), None);
        assert_eq!(world.box_index_at(&[1.0, 0.5]), None);
        assert_eq!(world.box_index_at(&[-0.5, 0.0]), Some(0));
        assert_eq!(world.lower_bounds(), [-0.5, 0.0]);
        assert_eq!(world.upper_bounds(), [1.0, 1.0]);
    }

    #[test]
    fn test_compatibility() {
        let a = MultiResolutionAnalysis::<2>::new(BoundingBox::unit(), ScalingBasis::legendre(3).unwrap())
            .unwrap();
        let b = MultiResolutionAnalysis::<2>::new(BoundingBox::unit(), ScalingBasis::interpolating(3).unwrap())
            .unwrap();
        let c = MultiResolutionAnalysis::<2>::with_max_scale(
            BoundingBox::unit(),
            ScalingBasis::legendre(3).unwrap(),
            5,
        )
        .unwrap();
        assert!(a.is_compatible(&a.clone()));
        assert!(!a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
        assert_eq!(c.max_depth(), 5);
    }

    #[test]
    fn test_invalid_dimension() {
        assert!(matches!(
            MultiResolutionAnalysis::<4>::new(BoundingBox::unit(), ScalingBasis::legendre(1).unwrap()),
            Err(MwError::InvalidDimension(4))
        ));
    }
}

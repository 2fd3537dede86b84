//! Hilbert curve state of a node.
use crate::constants::{
    HILBERT_H_1D, HILBERT_H_2D, HILBERT_H_3D, HILBERT_PATH_1D, HILBERT_PATH_2D, HILBERT_PATH_3D,
    HILBERT_Z_1D, HILBERT_Z_2D, HILBERT_Z_3D,
};

/// State of the Hilbert curve entering a node, derived from the parent's state and the child slot.
///
/// Visiting children in the order `z_index(0), z_index(1), ...` walks the curve, so that
/// consecutive leaves of a depth-first traversal are face neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HilbertPath<const D: usize> {
    path: u8,
}

impl<const D: usize> HilbertPath<D> {
    /// State of a root node.
    pub fn new() -> Self {
        Self { path: 0 }
    }

    /// Recreate a path from its state code.
    pub fn from_state(path: u8) -> Self {
        assert!(
            usize::from(path) < Self::n_states(),
            "invalid Hilbert state {path} in {D}D"
        );
        Self { path }
    }

    /// The state code.
    pub fn path(&self) -> u8 {
        self.path
    }

    /// Number of distinct curve states.
    pub fn n_states() -> usize {
        match D {
            1 => 1,
            2 => 4,
            3 => 12,
            _ => panic!("Hilbert curves are only defined for 1, 2 and 3 dimensions"),
        }
    }

    /// Path of the child in z-order slot `child`.
    pub fn child(&self, child: usize) -> Self {
        let h = self.h_index(child);
        let p = usize::from(self.path);
        let path = match D {
            1 => HILBERT_PATH_1D[p][h],
            2 => HILBERT_PATH_2D[p][h],
            3 => HILBERT_PATH_3D[p][h],
            _ => panic!("Hilbert curves are only defined for 1, 2 and 3 dimensions"),
        };
        Self { path }
    }

    /// Z-order slot of the child visited `h`-th along the curve.
    pub fn z_index(&self, h: usize) -> usize {
        let p = usize::from(self.path);
        usize::from(match D {
            1 => HILBERT_Z_1D[p][h],
            2 => HILBERT_Z_2D[p][h],
            3 => HILBERT_Z_3D[p][h],
            _ => panic!("Hilbert curves are only defined for 1, 2 and 3 dimensions"),
        })
    }

    /// Position along the curve of the child in z-order slot `z`.
    pub fn h_index(&self, z: usize) -> usize {
        let p = usize::from(self.path);
        usize::from(match D {
            1 => HILBERT_H_1D[p][z],
            2 => HILBERT_H_2D[p][z],
            3 => HILBERT_H_3D[p][z],
            _ => panic!("Hilbert curves are only defined for 1, 2 and 3 dimensions"),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::NodeIndex;
    use paste::paste;

    fn curve_leaves<const D: usize>(
        idx: NodeIndex<D>,
        path: HilbertPath<D>,
        depth: usize,
        leaves: &mut Vec<NodeIndex<D>>,
    ) {
        if depth == 0 {
            leaves.push(idx);
            return;
        }
        for h in 0..1 << D {
            let z = path.z_index(h);
            curve_leaves(idx.child(z), path.child(z), depth - 1, leaves);
        }
    }

    macro_rules! test_hilbert {
        ($($dim:literal),+) => {
            $(
                paste! {
                    #[test]
                    fn [<test_tables_are_inverse_ $dim d>]() {
                        for p in 0..HilbertPath::<$dim>::n_states() {
                            let path = HilbertPath::<$dim>::from_state(p as u8);
                            for z in 0..1 << $dim {
                                assert_eq!(path.z_index(path.h_index(z)), z);
                            }
                        }
                    }

                    #[test]
                    fn [<test_curve_is_continuous_ $dim d>]() {
                        let mut leaves = vec![];
                        curve_leaves(NodeIndex::<$dim>::new(0, [0; $dim]), HilbertPath::new(), 4, &mut leaves);
                        assert_eq!(leaves.len(), 1 << (4 * $dim));

                        let mut sorted = leaves.clone();
                        sorted.sort();
                        sorted.dedup();
                        assert_eq!(sorted.len(), leaves.len());

                        for pair in leaves.windows(2) {
                            let distance: i32 = (0..$dim)
                                .map(|d| (pair[0].translation()[d] - pair[1].translation()[d]).abs())
                                .sum();
                            assert_eq!(distance, 1);
                        }
                    }
                }
            )*
        };
    }

    test_hilbert!(1, 2, 3);
}

//! Crate wide constants

/// Largest supported spatial dimension.
pub const MAX_DIM: usize = 3;

/// Largest number of children of a node, `2^MAX_DIM`.
pub const MAX_TDIM: usize = 8;

/// Largest supported polynomial order of a scaling basis.
pub const MAX_ORDER: usize = 40;

/// Floor of every refinement threshold is twice this value.
pub const MACHINE_PRECISION: f64 = f64::EPSILON;

/// Finest scale a tree may be refined to by default.
pub const MAX_SCALE: i32 = 30;

/// Sentinel for a cached norm that must be recomputed.
pub const UNDEFINED_NORM: f64 = -1.0;

/// Default number of persistent node slots in an arena.
pub const DEFAULT_MAX_NODES: usize = 1 << 16;

/// Default number of generated node slots in an arena.
pub const DEFAULT_MAX_GEN_NODES: usize = 1 << 16;

/// Upper bound on the coefficients preallocated per node stack by the default configuration.
pub const DEFAULT_COEF_CAPACITY: usize = 1 << 26;

/// Leading word of a serialised tree buffer ("MWTREE01").
pub const WIRE_MAGIC: u64 = 0x3130_4545_5254_574d;

/// Number of 8-byte words in a serialised node record.
pub const WIRE_RECORD_WORDS: usize = 6 + MAX_DIM + MAX_TDIM;

// Hilbert curve state machines. For a node in curve state `p`, the child visited `h`-th along
// the curve sits at z-order slot `Z[p][h]` and continues in state `P[p][h]`; `H` is the inverse
// of `Z`.

/// Child curve states in 1D.
pub const HILBERT_PATH_1D: [[u8; 2]; 1] = [[0, 0]];
/// Z-order slot of the h-th child in 1D.
pub const HILBERT_Z_1D: [[u8; 2]; 1] = [[0, 1]];
/// Curve position of the z-th child in 1D.
pub const HILBERT_H_1D: [[u8; 2]; 1] = [[0, 1]];

/// Child curve states in 2D.
pub const HILBERT_PATH_2D: [[u8; 4]; 4] = [[1, 0, 0, 2], [0, 1, 1, 3], [3, 2, 2, 0], [2, 3, 3, 1]];
/// Z-order slot of the h-th child in 2D.
pub const HILBERT_Z_2D: [[u8; 4]; 4] = [[0, 2, 3, 1], [0, 1, 3, 2], [3, 2, 0, 1], [3, 1, 0, 2]];
/// Curve position of the z-th child in 2D.
pub const HILBERT_H_2D: [[u8; 4]; 4] = [[0, 3, 1, 2], [0, 1, 3, 2], [2, 3, 1, 0], [2, 1, 3, 0]];

/// Child curve states in 3D.
pub const HILBERT_PATH_3D: [[u8; 8]; 12] = [
    [1, 2, 2, 3, 3, 4, 4, 5],
    [2, 0, 0, 6, 6, 7, 7, 8],
    [0, 1, 1, 9, 9, 10, 10, 11],
    [10, 8, 8, 0, 0, 9, 9, 6],
    [11, 6, 6, 8, 8, 5, 5, 0],
    [9, 7, 7, 10, 10, 0, 0, 4],
    [4, 11, 11, 1, 1, 3, 3, 9],
    [5, 9, 9, 11, 11, 8, 8, 1],
    [3, 10, 10, 4, 4, 1, 1, 7],
    [7, 5, 5, 2, 2, 6, 6, 3],
    [8, 3, 3, 5, 5, 11, 11, 2],
    [6, 4, 4, 7, 7, 2, 2, 10],
];
/// Z-order slot of the h-th child in 3D.
pub const HILBERT_Z_3D: [[u8; 8]; 12] = [
    [0, 2, 6, 4, 5, 7, 3, 1],
    [0, 4, 5, 1, 3, 7, 6, 2],
    [0, 1, 3, 2, 6, 7, 5, 4],
    [6, 4, 0, 2, 3, 1, 5, 7],
    [5, 4, 6, 7, 3, 2, 0, 1],
    [3, 7, 6, 2, 0, 4, 5, 1],
    [5, 1, 0, 4, 6, 2, 3, 7],
    [3, 1, 5, 7, 6, 4, 0, 2],
    [6, 7, 5, 4, 0, 1, 3, 2],
    [3, 2, 0, 1, 5, 4, 6, 7],
    [6, 2, 3, 7, 5, 1, 0, 4],
    [5, 7, 3, 1, 0, 2, 6, 4],
];
/// Curve position of the z-th child in 3D.
pub const HILBERT_H_3D: [[u8; 8]; 12] = [
    [0, 7, 1, 6, 3, 4, 2, 5],
    [0, 3, 7, 4, 1, 2, 6, 5],
    [0, 1, 3, 2, 7, 6, 4, 5],
    [2, 5, 3, 4, 1, 6, 0, 7],
    [6, 7, 5, 4, 1, 0, 2, 3],
    [4, 7, 3, 0, 5, 6, 2, 1],
    [2, 1, 5, 6, 3, 0, 4, 7],
    [6, 1, 7, 0, 5, 2, 4, 3],
    [4, 5, 7, 6, 3, 2, 0, 1],
    [2, 3, 1, 0, 5, 4, 6, 7],
    [6, 5, 1, 2, 7, 4, 0, 3],
    [4, 3, 5, 2, 7, 0, 6, 1],
];

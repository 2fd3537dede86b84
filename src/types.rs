//! General type definitions

use crate::quadrature::QuadratureError;

/// Error type of the crate.
///
/// Violated programming invariants are not represented here, they panic.
#[derive(thiserror::Error, Debug)]
pub enum MwError {
    /// A value transform was requested for a basis that is not interpolating.
    #[error("operation not supported for {0:?} scaling functions")]
    UnsupportedBasis(ScalingType),
    /// Trees are only supported in one, two or three dimensions.
    #[error("invalid dimension {0}, expected 1, 2 or 3")]
    InvalidDimension(usize),
    /// Polynomial order outside of the supported range.
    #[error("invalid scaling order {0}")]
    InvalidOrder(usize),
    /// Binary operation between trees built on different analyses.
    #[error("incompatible trees: {0}")]
    IncompatibleTrees(String),
    /// A transferred buffer was produced by an arena of a different layout.
    #[error("arena layout mismatch: {0}")]
    LayoutMismatch(String),
    /// Receive capacity is smaller than the payload.
    #[error("buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall {
        /// Size of the payload in bytes.
        needed: usize,
        /// Capacity of the receiver in bytes.
        available: usize,
    },
    /// A transferred buffer failed validation.
    #[error("corrupt tree buffer: {0}")]
    CorruptBuffer(String),
    /// The underlying channel failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Lookup of a stored tree failed.
    #[error("not found: {0}")]
    NotFound(String),
    /// A quadrature rule could not be created.
    #[error("quadrature error: {0}")]
    Quadrature(#[from] QuadratureError),
}

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, MwError>;

/// Family of scaling functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalingType {
    /// Scaled Legendre polynomials.
    Legendre,
    /// Lagrange interpolating polynomials on the Gauss-Legendre points.
    Interpolating,
}

/// Direction of the multiwavelet transform of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MwTransformType {
    /// Children's scaling blocks into parent scaling and wavelet blocks.
    Compression,
    /// Parent scaling and wavelet blocks into children's scaling blocks.
    Reconstruction,
}

/// Direction of the value transform of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CvTransformType {
    /// Function values at the quadrature points into coefficients.
    Forward,
    /// Coefficients into function values at the quadrature points.
    Backward,
}

/// Direction of a tree-wide transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraverseDirection {
    /// Parents are pushed into their children, coarse to fine.
    TopDown,
    /// Children are pulled into their parents, fine to coarse.
    BottomUp,
}

/// Order in which the children of a node are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TraverseOrder {
    /// Children by child slot.
    ZOrder,
    /// Children along the Hilbert curve.
    #[default]
    Hilbert,
}

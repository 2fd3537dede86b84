//! Nodes of a multiwavelet tree.
use crate::arena::LoosePool;
use crate::basis::ScalingBasis;
use crate::constants::{MAX_TDIM, UNDEFINED_NORM};
use crate::filter::MwFilter;
use crate::hilbert::HilbertPath;
use crate::index::NodeIndex;
use crate::transform::{cv_transform, mw_transform};
use crate::types::{CvTransformType, MwTransformType, Result};
use std::ops::BitOr;
use std::sync::Mutex;

/// Status flags of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeStatus(u16);

impl NodeStatus {
    /// The node has a coefficient buffer.
    pub const ALLOCATED: Self = Self(1 << 0);
    /// The scaling coefficients are valid.
    pub const HAS_COEFS: Self = Self(1 << 1);
    /// The wavelet coefficients are valid.
    pub const HAS_WCOEFS: Self = Self(1 << 2);
    /// The node has no children.
    pub const LEAF: Self = Self(1 << 3);
    /// The node has all of its children.
    pub const BRANCH: Self = Self(1 << 4);
    /// The node is one of the root cells.
    pub const ROOT: Self = Self(1 << 5);
    /// The node is a leaf of the persistent representation.
    pub const END_NODE: Self = Self(1 << 6);
    /// The node was generated on demand below the persistent frontier.
    pub const GENERATED: Self = Self(1 << 7);
    /// The node is a detached copy.
    pub const LOOSE: Self = Self(1 << 8);

    const ALL: u16 = (1 << 9) - 1;

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// The raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Status from raw bits, `None` if unknown bits are set.
    pub fn from_bits(bits: u16) -> Option<Self> {
        if bits & !Self::ALL == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Whether all flags of `other` are set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the flags of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Set or clear the flags of `other`.
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for NodeStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Reference to a node of a tree, resolved through the tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// Slot in the persistent node stack.
    Projected(usize),
    /// Slot in the generated node stack.
    Generated(usize),
}

/// Kind of a node, with the state only that kind carries.
#[derive(Debug)]
pub enum NodeKind {
    /// Persistent node. The mutex guards the first of the generated children hanging below an end
    /// node, and is held while they are created and seeded.
    Projected {
        /// First slot of the generated children in the generated node stack.
        generated: Mutex<Option<usize>>,
    },
    /// Node interpolated from an ancestor, holding scaling coefficients only.
    Generated,
    /// Detached copy outside of any arena.
    Loose,
}

/// One cell of a multiwavelet tree.
///
/// Children occupy `2^D` consecutive slots of the same stack; `children` is the first of them.
#[derive(Debug)]
pub struct MwNode<const D: usize> {
    pub(crate) kind: NodeKind,
    pub(crate) serial: usize,
    pub(crate) index: NodeIndex<D>,
    pub(crate) hilbert: HilbertPath<D>,
    pub(crate) parent: Option<NodeRef>,
    pub(crate) children: Option<usize>,
    pub(crate) status: NodeStatus,
    pub(crate) norms: [f64; MAX_TDIM],
    pub(crate) square_norm: f64,
}

impl<const D: usize> MwNode<D> {
    /// Number of children.
    pub const TDIM: usize = 1 << D;

    pub(crate) fn new_root(serial: usize, index: NodeIndex<D>) -> Self {
        Self {
            kind: NodeKind::Projected {
                generated: Mutex::new(None),
            },
            serial,
            index,
            hilbert: HilbertPath::new(),
            parent: None,
            children: None,
            status: NodeStatus::ALLOCATED
                | NodeStatus::ROOT
                | NodeStatus::LEAF
                | NodeStatus::END_NODE,
            norms: [UNDEFINED_NORM; MAX_TDIM],
            square_norm: UNDEFINED_NORM,
        }
    }

    pub(crate) fn new_projected_child(serial: usize, parent: &Self, child: usize) -> Self {
        Self {
            kind: NodeKind::Projected {
                generated: Mutex::new(None),
            },
            serial,
            index: parent.index.child(child),
            hilbert: parent.hilbert.child(child),
            parent: Some(NodeRef::Projected(parent.serial)),
            children: None,
            status: NodeStatus::ALLOCATED | NodeStatus::LEAF | NodeStatus::END_NODE,
            norms: [0.0; MAX_TDIM],
            square_norm: 0.0,
        }
    }

    pub(crate) fn new_generated_child(
        serial: usize,
        parent: NodeRef,
        parent_index: &NodeIndex<D>,
        parent_hilbert: &HilbertPath<D>,
        child: usize,
    ) -> Self {
        Self {
            kind: NodeKind::Generated,
            serial,
            index: parent_index.child(child),
            hilbert: parent_hilbert.child(child),
            parent: Some(parent),
            children: None,
            status: NodeStatus::ALLOCATED
                | NodeStatus::LEAF
                | NodeStatus::GENERATED
                | NodeStatus::HAS_COEFS,
            norms: [UNDEFINED_NORM; MAX_TDIM],
            square_norm: UNDEFINED_NORM,
        }
    }

    /// A detached copy of the identity, status and norms of this node.
    pub(crate) fn loose_copy(&self) -> Self {
        let mut status = self.status;
        status.remove(NodeStatus::GENERATED | NodeStatus::ROOT | NodeStatus::BRANCH);
        status.insert(NodeStatus::LOOSE | NodeStatus::LEAF);
        Self {
            kind: NodeKind::Loose,
            serial: self.serial,
            index: self.index,
            hilbert: self.hilbert,
            parent: None,
            children: None,
            status,
            norms: self.norms,
            square_norm: self.square_norm,
        }
    }

    /// Slot of the node in its stack.
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// The node index.
    pub fn index(&self) -> &NodeIndex<D> {
        &self.index
    }

    /// The scale.
    pub fn scale(&self) -> i32 {
        self.index.scale()
    }

    /// The Hilbert curve state.
    pub fn hilbert_path(&self) -> &HilbertPath<D> {
        &self.hilbert
    }

    /// The parent, `None` for roots and loose nodes.
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    /// Slot of child `child`, in the same stack as this node.
    pub fn child(&self, child: usize) -> Option<usize> {
        assert!(child < Self::TDIM, "child index {child} out of range");
        self.children.map(|first| first + child)
    }

    /// Slot of the first child.
    pub fn first_child(&self) -> Option<usize> {
        self.children
    }

    /// The status flags.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// The node kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Whether the node has a coefficient buffer.
    pub fn is_allocated(&self) -> bool {
        self.status.contains(NodeStatus::ALLOCATED)
    }

    /// Whether the scaling coefficients are valid.
    pub fn has_coefs(&self) -> bool {
        self.status.contains(NodeStatus::HAS_COEFS)
    }

    /// Whether the wavelet coefficients are valid.
    pub fn has_wcoefs(&self) -> bool {
        self.status.contains(NodeStatus::HAS_WCOEFS)
    }

    /// Whether the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.status.contains(NodeStatus::LEAF)
    }

    /// Whether the node has children.
    pub fn is_branch(&self) -> bool {
        self.status.contains(NodeStatus::BRANCH)
    }

    /// Whether the node is a root cell.
    pub fn is_root(&self) -> bool {
        self.status.contains(NodeStatus::ROOT)
    }

    /// Whether the node is a leaf of the persistent representation.
    pub fn is_end_node(&self) -> bool {
        self.status.contains(NodeStatus::END_NODE)
    }

    /// Whether the node is generated.
    pub fn is_generated(&self) -> bool {
        matches!(self.kind, NodeKind::Generated)
    }

    /// Whether the node is a detached copy.
    pub fn is_loose(&self) -> bool {
        matches!(self.kind, NodeKind::Loose)
    }

    /// Whether the node is persistent.
    pub fn is_projected(&self) -> bool {
        matches!(self.kind, NodeKind::Projected { .. })
    }

    /// Whether generated children hang below this node.
    pub fn has_generated_children(&self) -> bool {
        match &self.kind {
            NodeKind::Projected { generated } => generated.lock().unwrap().is_some(),
            NodeKind::Generated => self.children.is_some(),
            NodeKind::Loose => false,
        }
    }

    /// Cached 2-norm of block `i`, negative when undefined.
    pub fn component_norm(&self, i: usize) -> f64 {
        assert!(i < Self::TDIM, "component {i} out of range");
        self.norms[i]
    }

    /// 2-norm of the scaling block, negative when undefined.
    pub fn scaling_norm(&self) -> f64 {
        self.norms[0]
    }

    /// 2-norm of all wavelet blocks, negative when undefined.
    pub fn wavelet_norm(&self) -> f64 {
        let norms = &self.norms[1..Self::TDIM];
        if norms.iter().any(|n| *n < 0.0) {
            return UNDEFINED_NORM;
        }
        norms.iter().map(|n| n * n).sum::<f64>().sqrt()
    }

    /// Squared 2-norm of the whole buffer, negative when undefined.
    pub fn square_norm(&self) -> f64 {
        self.square_norm
    }

    /// Recompute the cached norms from the coefficient buffer. Buffers of generated nodes hold
    /// only the scaling block.
    pub(crate) fn calc_norms(&mut self, coefs: &[f64], kp1_d: usize) {
        assert!(
            self.has_coefs(),
            "norm requested for {} without coefficients",
            self.index
        );
        let mut total = 0.0;
        for i in 0..Self::TDIM {
            let square = coefs
                .get(i * kp1_d..(i + 1) * kp1_d)
                .map(|block| block.iter().map(|c| c * c).sum::<f64>())
                .unwrap_or(0.0);
            self.norms[i] = square.sqrt();
            total += square;
        }
        self.square_norm = total;
    }

    /// Mark the cached norms undefined.
    pub(crate) fn clear_norms(&mut self) {
        self.norms = [UNDEFINED_NORM; MAX_TDIM];
        self.square_norm = UNDEFINED_NORM;
    }

    /// Set the cached norms to zero.
    pub(crate) fn zero_norms(&mut self) {
        self.norms = [0.0; MAX_TDIM];
        self.square_norm = 0.0;
    }

    /// Lower and upper corner of the cell.
    pub fn bounds(&self) -> ([f64; D], [f64; D]) {
        (self.index.lower_bounds(), self.index.upper_bounds())
    }

    /// Midpoint of the cell.
    pub fn center(&self) -> [f64; D] {
        self.index.center()
    }

    /// Whether the point `r` lies in the cell.
    pub fn has_coord(&self, r: &[f64; D]) -> bool {
        self.index.contains(r)
    }
}

/// A detached copy of a node, with a full coefficient buffer from the arena's loose pool.
///
/// Generated nodes are copied with zero wavelet blocks. The buffer goes back to the pool on drop.
pub struct LooseNode<'a, const D: usize> {
    node: MwNode<D>,
    coefs: Vec<f64>,
    kp1_d: usize,
    pool: &'a LoosePool,
}

impl<'a, const D: usize> LooseNode<'a, D> {
    pub(crate) fn new(pool: &'a LoosePool, source: &MwNode<D>, coefs: &[f64], kp1_d: usize) -> Self {
        let mut buffer = pool.alloc();
        buffer[..coefs.len()].copy_from_slice(coefs);
        buffer[coefs.len()..].fill(0.0);
        let mut node = source.loose_copy();
        if source.is_generated() {
            node.status.insert(NodeStatus::HAS_WCOEFS);
        }
        Self {
            node,
            coefs: buffer,
            kp1_d,
            pool,
        }
    }

    /// The copied node.
    pub fn node(&self) -> &MwNode<D> {
        &self.node
    }

    /// The coefficient buffer.
    pub fn coefs(&self) -> &[f64] {
        &self.coefs
    }

    /// Mutable coefficient buffer; invalidates the cached norms.
    pub fn coefs_mut(&mut self) -> &mut [f64] {
        self.node.clear_norms();
        &mut self.coefs
    }

    /// Recompute the cached norms.
    pub fn calc_norms(&mut self) {
        self.node.calc_norms(&self.coefs, self.kp1_d);
    }

    /// Transform the buffer in place.
    pub fn mw_transform(&mut self, filter: &MwFilter, transform: MwTransformType, scratch: &mut [f64]) {
        mw_transform::<D>(&mut self.coefs, scratch, filter, transform);
        self.node.clear_norms();
    }

    /// Rescale the buffer between coefficients and values.
    pub fn cv_transform(&mut self, basis: &ScalingBasis, direction: CvTransformType) -> Result<()> {
        cv_transform::<D>(&mut self.coefs, basis, self.node.scale(), direction)?;
        self.node.clear_norms();
        Ok(())
    }

    /// Evaluate at `r`, with the buffer in the nodal (reconstructed) representation.
    pub fn evalf(&self, basis: &ScalingBasis, r: &[f64; D]) -> f64 {
        let child = self.node.index.child_slot_at(r);
        let block = &self.coefs[child * self.kp1_d..(child + 1) * self.kp1_d];
        basis.evaluate_expansion(block, &self.node.index.child(child), r)
    }
}

impl<const D: usize> Drop for LooseNode<'_, D> {
    fn drop(&mut self) {
        self.pool.dealloc(std::mem::take(&mut self.coefs));
    }
}

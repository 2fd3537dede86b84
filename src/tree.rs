//! Adaptive multiwavelet trees.
//!
//! A tree is a forest of `2^D`-ary trees, one per root cell of the world box, whose nodes live in
//! the arena of the tree. Persistent ("projected") nodes carry the representation of a function.
//! Below the persistent frontier, lookups create "generated" nodes on demand by reconstructing
//! coefficients from the nearest ancestor; they are cached until [`MwTree::delete_generated`].
//!
//! Structural changes take `&mut self`. Lookups that generate nodes take `&self` and may run
//! concurrently: each end node guards its generated children with its own lock, the generated
//! stack has one lock, and the tree-level aggregates have another. Locks are taken in the order
//! node, generated stack, scratch, and a node lock is never taken while the stack lock is held.
use crate::arena::{ArenaConfig, ArenaLayout, ArenaStats, NodeStack, SerialTree};
use crate::basis::ScalingBasis;
use crate::builder::{wavelet_threshold, TreeCalculator};
use crate::constants::UNDEFINED_NORM;
use crate::context::ExecutionContext;
use crate::filter::MwFilter;
use crate::hilbert::HilbertPath;
use crate::index::NodeIndex;
use crate::iterator::{nodes_by_depth, TreeIterator};
use crate::mra::{BoundingBox, MultiResolutionAnalysis};
use crate::node::{LooseNode, MwNode, NodeKind, NodeRef, NodeStatus};
use crate::transform::{mw_transform, ScratchPool};
use crate::types::{MwTransformType, TraverseDirection, TraverseOrder};
use log::{debug, trace};
use rayon::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard};

/// The root cells of a tree.
#[derive(Debug, Clone)]
pub struct NodeBox<const D: usize> {
    world: BoundingBox<D>,
    pub(crate) roots: Vec<usize>,
}

impl<const D: usize> NodeBox<D> {
    /// The world box.
    pub fn world(&self) -> &BoundingBox<D> {
        &self.world
    }

    /// Number of roots.
    pub fn n_roots(&self) -> usize {
        self.roots.len()
    }

    /// Slot of root `i`.
    pub fn root(&self, i: usize) -> usize {
        self.roots[i]
    }

    /// Slots of all roots, in box order.
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    /// Slot of the root containing `idx`.
    pub fn root_of(&self, idx: &NodeIndex<D>) -> Option<usize> {
        self.world.box_index(idx).map(|i| self.roots[i])
    }

    /// Slot of the root containing the point `r`.
    pub fn root_at(&self, r: &[f64; D]) -> Option<usize> {
        self.world.box_index_at(r).map(|i| self.roots[i])
    }
}

/// Tree-level values guarded by the tree lock.
#[derive(Debug)]
pub struct TreeAggregates {
    /// Squared norm of the represented function, negative when undefined.
    pub square_norm: f64,
}

/// A function represented on an adaptive multiwavelet tree.
pub struct MwTree<const D: usize> {
    pub(crate) name: String,
    pub(crate) mra: MultiResolutionAnalysis<D>,
    pub(crate) filter: Arc<MwFilter>,
    pub(crate) layout: ArenaLayout,
    pub(crate) arena: SerialTree<D>,
    pub(crate) root_box: NodeBox<D>,
    pub(crate) end_table: Vec<usize>,
    pub(crate) nodes_at_depth: Vec<usize>,
    pub(crate) aggregates: Mutex<TreeAggregates>,
    pub(crate) scratch: ScratchPool,
    pub(crate) context: ExecutionContext,
}

fn free_generated<const D: usize>(stack: &mut NodeStack<D>, first: usize, tdim: usize) {
    for serial in first..first + tdim {
        if let Some(children) = stack.node(serial).first_child() {
            free_generated(stack, children, tdim);
        }
        stack.dealloc(serial);
    }
}

impl<const D: usize> MwTree<D> {
    /// Create a tree with one empty root per cell of the world box and default arena capacities.
    pub fn new(mra: MultiResolutionAnalysis<D>) -> Self {
        let layout = ArenaLayout::new::<D>(mra.basis().kp1());
        Self::with_config(mra, &ArenaConfig::for_layout(&layout), &ExecutionContext::serial())
    }

    /// Create a tree with explicit arena capacities.
    pub fn with_config(
        mra: MultiResolutionAnalysis<D>,
        config: &ArenaConfig,
        context: &ExecutionContext,
    ) -> Self {
        let layout = ArenaLayout::new::<D>(mra.basis().kp1());
        let world = mra.world().clone();
        let mut tree = Self {
            name: String::new(),
            filter: mra.filter(),
            mra,
            layout,
            arena: SerialTree::new(layout, config),
            root_box: NodeBox {
                world,
                roots: vec![],
            },
            end_table: vec![],
            nodes_at_depth: vec![],
            aggregates: Mutex::new(TreeAggregates {
                square_norm: UNDEFINED_NORM,
            }),
            scratch: ScratchPool::new(context.n_threads(), layout.node_stride),
            context: *context,
        };
        tree.create_roots();
        tree
    }

    fn create_roots(&mut self) {
        let n_roots = self.root_box.world.n_roots();
        let (first, _) = self.arena.alloc_nodes(n_roots);
        for i in 0..n_roots {
            let index = self.root_box.world.root_index(i);
            self.arena.nodes.insert(MwNode::new_root(first + i, index));
        }
        self.root_box.roots = (first..first + n_roots).collect();
        self.end_table = self.root_box.roots.clone();
        self.nodes_at_depth = vec![n_roots];
        self.invalidate_square_norm();
    }

    /// Name of the tree.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the tree.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// The analysis the tree is built on.
    pub fn mra(&self) -> &MultiResolutionAnalysis<D> {
        &self.mra
    }

    /// The scaling basis.
    pub fn basis(&self) -> &ScalingBasis {
        self.mra.basis()
    }

    /// The filters of the basis.
    pub fn filter(&self) -> &MwFilter {
        &self.filter
    }

    /// Buffer sizes of the nodes.
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// The execution context the tree was created with.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// The root cells.
    pub fn root_box(&self) -> &NodeBox<D> {
        &self.root_box
    }

    /// The node storage.
    pub fn arena(&self) -> &SerialTree<D> {
        &self.arena
    }

    /// Persistent node in slot `serial`.
    pub fn node(&self, serial: usize) -> &MwNode<D> {
        self.arena.nodes.node(serial)
    }

    /// Coefficients of the persistent node in slot `serial`.
    pub fn coefs(&self, serial: usize) -> &[f64] {
        self.arena.nodes.coefs(serial)
    }

    /// Block `block` of the coefficients of a persistent node.
    pub fn coef_block(&self, serial: usize, block: usize) -> &[f64] {
        let kd = self.layout.kp1_d;
        &self.coefs(serial)[block * kd..(block + 1) * kd]
    }

    /// Run `f` on any node and its coefficients. Generated nodes are read under the lock of the
    /// generated stack and hold only their scaling block.
    pub fn with_node<R>(&self, node: NodeRef, f: impl FnOnce(&MwNode<D>, &[f64]) -> R) -> R {
        match node {
            NodeRef::Projected(serial) => f(self.arena.nodes.node(serial), self.arena.nodes.coefs(serial)),
            NodeRef::Generated(serial) => {
                let stack = self.arena.lock_generated();
                f(stack.node(serial), stack.coefs(serial))
            }
        }
    }

    /// Overwrite block `block` of a persistent node. The other blocks count as valid from now on.
    pub fn set_coef_block(&mut self, serial: usize, block: usize, values: &[f64]) {
        self.update_coef_block(serial, block, |dst| dst.copy_from_slice(values));
    }

    /// Add `values` to block `block` of a persistent node.
    pub fn add_coef_block(&mut self, serial: usize, block: usize, values: &[f64]) {
        self.update_coef_block(serial, block, |dst| {
            dst.iter_mut().zip(values).for_each(|(d, v)| *d += v)
        });
    }

    fn update_coef_block(&mut self, serial: usize, block: usize, update: impl FnOnce(&mut [f64])) {
        let kd = self.layout.kp1_d;
        self.delete_generated_below(serial);
        let (node, coefs) = self.arena.nodes.node_and_coefs_mut(serial);
        update(&mut coefs[block * kd..(block + 1) * kd]);
        node.status.insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
        node.calc_norms(coefs, kd);
        self.invalidate_square_norm();
    }

    /// Zero all coefficients of a persistent node.
    pub fn zero_coefs(&mut self, serial: usize) {
        self.delete_generated_below(serial);
        let (node, coefs) = self.arena.nodes.node_and_coefs_mut(serial);
        coefs.fill(0.0);
        node.status.insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
        node.zero_norms();
        self.invalidate_square_norm();
    }

    /// Number of persistent nodes.
    pub fn n_nodes(&self) -> usize {
        self.nodes_at_depth.iter().sum()
    }

    /// Number of persistent nodes at `depth` below the roots.
    pub fn n_nodes_at_depth(&self, depth: usize) -> usize {
        self.nodes_at_depth.get(depth).copied().unwrap_or(0)
    }

    /// Number of levels of persistent nodes.
    pub fn depth(&self) -> usize {
        self.nodes_at_depth.len()
    }

    /// Number of generated nodes currently cached.
    pub fn n_gen_nodes(&self) -> usize {
        self.arena.gen_stats().live
    }

    /// Counters of the persistent node stack.
    pub fn node_stats(&self) -> ArenaStats {
        self.arena.node_stats()
    }

    /// Counters of the generated node stack.
    pub fn gen_stats(&self) -> ArenaStats {
        self.arena.gen_stats()
    }

    /// Number of persistent nodes with children.
    pub fn count_branch_nodes(&self) -> usize {
        self.iter(TraverseDirection::TopDown, TraverseOrder::ZOrder)
            .filter(|serial| self.node(*serial).is_branch())
            .count()
    }

    /// Number of persistent nodes without children.
    pub fn count_leaf_nodes(&self) -> usize {
        self.iter(TraverseDirection::TopDown, TraverseOrder::ZOrder)
            .filter(|serial| self.node(*serial).is_leaf())
            .count()
    }

    /// Depth-first traversal of the persistent nodes.
    pub fn iter(&self, direction: TraverseDirection, order: TraverseOrder) -> TreeIterator<'_, D> {
        TreeIterator::new(self, direction, order)
    }

    fn depth_of(&self, scale: i32) -> usize {
        (scale - self.mra.root_scale()) as usize
    }

    /// Number of end nodes.
    pub fn n_end_nodes(&self) -> usize {
        self.end_table.len()
    }

    /// Slot of end node `i`, counted along the Hilbert curve.
    pub fn end_node(&self, i: usize) -> usize {
        self.end_table[i]
    }

    /// Slots of the end nodes, along the Hilbert curve.
    pub fn end_nodes(&self) -> &[usize] {
        &self.end_table
    }

    /// Rebuild the end table and the leaf and branch flags from the structure of the tree.
    pub fn reset_end_table(&mut self) {
        let order: Vec<usize> = self
            .iter(TraverseDirection::TopDown, TraverseOrder::Hilbert)
            .collect();
        self.end_table.clear();
        for serial in order {
            let node = self.arena.nodes.node_mut(serial);
            let leaf = node.first_child().is_none();
            node.status.set(NodeStatus::LEAF | NodeStatus::END_NODE, leaf);
            node.status.set(NodeStatus::BRANCH, !leaf);
            if leaf {
                self.end_table.push(serial);
            }
        }
    }

    /// Create the `2^D` children of a persistent leaf and return the slot of the first.
    ///
    /// Children of a node with coefficients start with zero coefficients marked valid; the caller
    /// fills them, e.g. with [`give_children_coefs`](Self::give_children_coefs). Generated nodes
    /// cached below the node are dropped. The end table is not updated.
    pub fn create_children(&mut self, serial: usize) -> usize {
        let tdim = self.layout.tdim;
        let (scale, has_coefs) = {
            let node = self.arena.nodes.node(serial);
            assert!(
                node.first_child().is_none(),
                "children of {} created twice",
                node.index()
            );
            assert!(
                node.scale() < self.mra.max_scale(),
                "refinement of {} beyond the finest scale {}",
                node.index(),
                self.mra.max_scale()
            );
            (node.scale(), node.has_coefs())
        };
        self.delete_generated_below(serial);

        let (first, _) = self.arena.alloc_nodes(tdim);
        let children: Vec<MwNode<D>> = {
            let parent = self.arena.nodes.node(serial);
            (0..tdim)
                .map(|c| MwNode::new_projected_child(first + c, parent, c))
                .collect()
        };
        for mut child in children {
            if has_coefs {
                child
                    .status
                    .insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
            }
            self.arena.nodes.insert(child);
        }

        let depth = self.depth_of(scale + 1);
        if self.nodes_at_depth.len() <= depth {
            self.nodes_at_depth.resize(depth + 1, 0);
        }
        self.nodes_at_depth[depth] += tdim;

        let parent = self.arena.nodes.node_mut(serial);
        parent.children = Some(first);
        parent.status.remove(NodeStatus::LEAF | NodeStatus::END_NODE);
        parent.status.insert(NodeStatus::BRANCH);
        self.invalidate_square_norm();
        first
    }

    /// Remove all descendants of a persistent node, which becomes a leaf. The end table is not
    /// updated.
    pub fn delete_children(&mut self, serial: usize) {
        let Some(first) = self.arena.nodes.node(serial).first_child() else {
            return;
        };
        let tdim = self.layout.tdim;
        for child in first..first + tdim {
            self.delete_children(child);
            self.delete_generated_below(child);
            self.arena.dealloc_nodes(child);
        }

        let depth = self.depth_of(self.arena.nodes.node(serial).scale() + 1);
        self.nodes_at_depth[depth] -= tdim;
        while self.nodes_at_depth.last() == Some(&0) {
            self.nodes_at_depth.pop();
        }

        let node = self.arena.nodes.node_mut(serial);
        node.children = None;
        node.status.remove(NodeStatus::BRANCH);
        node.status.insert(NodeStatus::LEAF | NodeStatus::END_NODE);
        self.invalidate_square_norm();
    }

    /// Drop every node and start over from empty roots.
    pub fn clear(&mut self) {
        self.arena.nodes.reset();
        self.arena.generated_mut().reset();
        self.create_roots();
    }

    /// Zero the coefficients of every persistent node, keeping the structure.
    pub fn set_zero(&mut self) {
        self.delete_generated();
        self.arena.nodes.par_nodes_mut().for_each(|(node, coefs)| {
            coefs.fill(0.0);
            node.status
                .insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
            node.zero_norms();
        });
        self.aggregates.get_mut().unwrap().square_norm = 0.0;
    }

    /// Reconstruct a scaling and wavelet buffer into the scaling blocks of the children. Shorter
    /// buffers are padded with zero wavelet blocks.
    pub(crate) fn reconstruct(&self, coefs: &[f64]) -> Vec<f64> {
        let mut data = vec![0.0; self.layout.node_stride];
        data[..coefs.len()].copy_from_slice(coefs);
        self.scratch.with_scratch(|scratch| {
            mw_transform::<D>(&mut data, scratch, &self.filter, MwTransformType::Reconstruction)
        });
        data
    }

    /// Compress the scaling blocks of the children of `serial` into a scaling and wavelet buffer.
    pub(crate) fn compress_children(&self, serial: usize) -> Vec<f64> {
        let kd = self.layout.kp1_d;
        let node = self.node(serial);
        let first = node
            .first_child()
            .unwrap_or_else(|| panic!("compression of {} without children", node.index()));
        let mut data = vec![0.0; self.layout.node_stride];
        for c in 0..self.layout.tdim {
            let child = self.node(first + c);
            assert!(
                child.has_coefs(),
                "compression from {} without coefficients",
                child.index()
            );
            data[c * kd..(c + 1) * kd].copy_from_slice(&self.coefs(first + c)[..kd]);
        }
        self.scratch.with_scratch(|scratch| {
            mw_transform::<D>(&mut data, scratch, &self.filter, MwTransformType::Compression)
        });
        data
    }

    pub(crate) fn write_compressed(&mut self, serial: usize, data: &[f64], overwrite: bool) {
        let kd = self.layout.kp1_d;
        let (node, coefs) = self.arena.nodes.node_and_coefs_mut(serial);
        if overwrite {
            coefs.copy_from_slice(data);
        } else {
            coefs.iter_mut().zip(data).for_each(|(c, d)| *c += d);
        }
        node.status
            .insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
        node.calc_norms(coefs, kd);
    }

    fn write_children_scaling(&mut self, serial: usize, data: &[f64], overwrite: bool) {
        let kd = self.layout.kp1_d;
        let node = self.node(serial);
        let first = node
            .first_child()
            .unwrap_or_else(|| panic!("{} has no children", node.index()));
        for c in 0..self.layout.tdim {
            self.delete_generated_below(first + c);
            let (child, coefs) = self.arena.nodes.node_and_coefs_mut(first + c);
            let block = &data[c * kd..(c + 1) * kd];
            if overwrite {
                coefs[..kd].copy_from_slice(block);
            } else {
                coefs[..kd].iter_mut().zip(block).for_each(|(a, b)| *a += b);
            }
            child
                .status
                .insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
            child.calc_norms(coefs, kd);
        }
    }

    /// Reconstruct the coefficients of a branch node into the scaling blocks of its children.
    pub fn give_children_coefs(&mut self, serial: usize, overwrite: bool) {
        let node = self.node(serial);
        assert!(
            node.has_coefs(),
            "reconstruction from {} without coefficients",
            node.index()
        );
        let data = self.reconstruct(self.coefs(serial));
        self.write_children_scaling(serial, &data, overwrite);
        self.invalidate_square_norm();
    }

    /// Compress the scaling blocks of the children of a branch node into the node.
    pub fn re_compress(&mut self, serial: usize, overwrite: bool) {
        let data = self.compress_children(serial);
        self.write_compressed(serial, &data, overwrite);
        self.invalidate_square_norm();
    }

    /// Transform the whole tree level by level.
    ///
    /// Bottom-up compresses the children of every branch node into the node, finest level first.
    /// Top-down reconstructs every branch node into its children, coarsest level first. Nodes of
    /// one level are transformed in parallel.
    pub fn mw_transform(&mut self, direction: TraverseDirection, overwrite: bool) {
        let levels: Vec<Vec<usize>> = nodes_by_depth(self)
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .filter(|serial| self.node(*serial).first_child().is_some())
                    .collect()
            })
            .collect();

        match direction {
            TraverseDirection::BottomUp => {
                for level in levels.iter().rev() {
                    let this = &*self;
                    let results: Vec<Vec<f64>> = level
                        .par_iter()
                        .map(|serial| this.compress_children(*serial))
                        .collect();
                    for (serial, data) in level.iter().zip(&results) {
                        self.write_compressed(*serial, data, overwrite);
                    }
                }
            }
            TraverseDirection::TopDown => {
                for level in &levels {
                    let this = &*self;
                    let results: Vec<Vec<f64>> = level
                        .par_iter()
                        .map(|serial| {
                            let node = this.node(*serial);
                            assert!(
                                node.has_coefs(),
                                "reconstruction from {} without coefficients",
                                node.index()
                            );
                            this.reconstruct(this.coefs(*serial))
                        })
                        .collect();
                    for (serial, data) in level.iter().zip(&results) {
                        self.write_children_scaling(*serial, data, overwrite);
                    }
                }
            }
        }
        self.invalidate_square_norm();
    }

    /// Compute the coefficients of the persistent nodes `serials` in parallel.
    pub(crate) fn calc_nodes<C: TreeCalculator<D> + ?Sized>(
        &mut self,
        serials: &[usize],
        calculator: &C,
    ) {
        let mut selected = vec![false; self.arena.nodes.top()];
        for serial in serials {
            selected[*serial] = true;
        }
        let kd = self.layout.kp1_d;
        let scratch = &self.scratch;
        self.arena
            .nodes
            .par_nodes_mut()
            .filter(|(node, _)| selected[node.serial()])
            .for_each(|(node, coefs)| {
                scratch.with_scratch(|buffer| calculator.calc_node(node, coefs, buffer));
                node.status
                    .insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
                node.calc_norms(coefs, kd);
            });
        self.invalidate_square_norm();
    }

    /// Remove children whose wavelet contribution is below the threshold of `precision`, finest
    /// first. Returns the number of removed nodes. Negative precision removes nothing.
    pub fn crop(&mut self, precision: f64, absolute: bool) -> usize {
        if precision < 0.0 {
            return 0;
        }
        let reference = if absolute {
            1.0
        } else {
            self.square_norm().max(0.0).sqrt()
        };
        let before = self.n_nodes();
        for root in self.root_box.roots.clone() {
            self.crop_node(root, precision, reference);
        }
        self.reset_end_table();
        let removed = before - self.n_nodes();
        debug!("crop at precision {precision:e}: removed {removed} nodes");
        removed
    }

    fn crop_node(&mut self, serial: usize, precision: f64, reference: f64) -> bool {
        let Some(first) = self.node(serial).first_child() else {
            return true;
        };
        let mut all_leaves = true;
        for child in first..first + self.layout.tdim {
            all_leaves &= self.crop_node(child, precision, reference);
        }
        if !all_leaves {
            return false;
        }
        let node = self.node(serial);
        let norm = node.wavelet_norm();
        if norm >= 0.0 && norm <= wavelet_threshold(reference, precision, node.scale()) {
            self.delete_children(serial);
            true
        } else {
            false
        }
    }

    /// Descend from the persistent node `from` to `idx` without generating nodes. `None` when the
    /// persistent tree ends above `idx`.
    pub fn retrieve_node_no_gen(&self, from: usize, idx: &NodeIndex<D>) -> Option<usize> {
        let mut serial = from;
        loop {
            let node = self.node(serial);
            if node.scale() == idx.scale() {
                assert_eq!(node.index(), idx, "descent left the path to {idx}");
                return Some(serial);
            }
            serial = node.child(node.index().child_slot_towards(idx))?;
        }
    }

    /// Descend from the persistent node `from` towards `idx`, stopping at an end node.
    pub fn retrieve_node_or_end_node(&self, from: usize, idx: &NodeIndex<D>) -> usize {
        let mut serial = from;
        loop {
            let node = self.node(serial);
            if node.scale() == idx.scale() {
                assert_eq!(node.index(), idx, "descent left the path to {idx}");
                return serial;
            }
            match node.child(node.index().child_slot_towards(idx)) {
                Some(child) => serial = child,
                None => return serial,
            }
        }
    }

    /// Descend from the persistent node `from` towards the point `r`, stopping at `scale` or at an
    /// end node.
    pub fn retrieve_node_or_end_node_at(&self, from: usize, r: &[f64; D], scale: i32) -> usize {
        let mut serial = from;
        loop {
            let node = self.node(serial);
            if node.scale() >= scale {
                return serial;
            }
            match node.child(node.index().child_slot_at(r)) {
                Some(child) => serial = child,
                None => return serial,
            }
        }
    }

    /// Descend from `from` to `idx`, generating the missing nodes below the persistent frontier.
    pub fn retrieve_node(&self, from: NodeRef, idx: &NodeIndex<D>) -> NodeRef {
        let found = self.descend_generating(from, idx.scale(), |node| node.child_slot_towards(idx));
        self.with_node(found, |node, _| {
            assert_eq!(node.index(), idx, "descent left the path to {idx}")
        });
        found
    }

    /// Descend from `from` towards the point `r` down to `scale`, generating missing nodes.
    pub fn retrieve_node_at(&self, from: NodeRef, r: &[f64; D], scale: i32) -> NodeRef {
        self.descend_generating(from, scale, |node| node.child_slot_at(r))
    }

    fn descend_generating(
        &self,
        from: NodeRef,
        scale: i32,
        slot: impl Fn(&NodeIndex<D>) -> usize,
    ) -> NodeRef {
        let mut current = from;
        loop {
            current = match current {
                NodeRef::Projected(serial) => {
                    let node = self.node(serial);
                    if node.scale() >= scale {
                        return current;
                    }
                    let child = slot(node.index());
                    match node.child(child) {
                        Some(next) => NodeRef::Projected(next),
                        None => NodeRef::Generated(self.generated_children(serial) + child),
                    }
                }
                NodeRef::Generated(serial) => {
                    let mut stack = self.arena.lock_generated();
                    let (child, first) = {
                        let node = stack.node(serial);
                        if node.scale() >= scale {
                            return current;
                        }
                        (slot(node.index()), node.first_child())
                    };
                    let first = match first {
                        Some(first) => first,
                        None => self.generate_below(&mut stack, serial),
                    };
                    NodeRef::Generated(first + child)
                }
            };
        }
    }

    /// First generated child of the persistent end node `serial`, generated on first use under the
    /// lock of the node.
    fn generated_children(&self, serial: usize) -> usize {
        let node = self.node(serial);
        let NodeKind::Projected { generated } = node.kind() else {
            panic!("persistent slot {serial} holds a {:?} node", node.kind());
        };
        let mut link = generated.lock().unwrap();
        if let Some(first) = *link {
            return first;
        }
        assert!(
            node.has_coefs(),
            "generation below {} without coefficients",
            node.index()
        );
        let data = self.reconstruct(self.coefs(serial));
        let first = {
            let mut stack = self.arena.lock_generated();
            self.seed_generated(
                &mut stack,
                NodeRef::Projected(serial),
                node.index(),
                node.hilbert_path(),
                &data,
            )
        };
        *link = Some(first);
        first
    }

    /// Generate the children of the generated node `serial`; the caller holds the stack lock.
    fn generate_below(&self, stack: &mut NodeStack<D>, serial: usize) -> usize {
        let (index, hilbert) = {
            let node = stack.node(serial);
            (*node.index(), *node.hilbert_path())
        };
        let data = self.reconstruct(stack.coefs(serial));
        let first = self.seed_generated(stack, NodeRef::Generated(serial), &index, &hilbert, &data);
        let node = stack.node_mut(serial);
        node.children = Some(first);
        node.status.remove(NodeStatus::LEAF);
        node.status.insert(NodeStatus::BRANCH);
        first
    }

    fn seed_generated(
        &self,
        stack: &mut NodeStack<D>,
        parent: NodeRef,
        index: &NodeIndex<D>,
        hilbert: &HilbertPath<D>,
        data: &[f64],
    ) -> usize {
        let kd = self.layout.kp1_d;
        let tdim = self.layout.tdim;
        let first = stack.alloc(tdim);
        for c in 0..tdim {
            let mut child = MwNode::new_generated_child(first + c, parent, index, hilbert, c);
            let coefs = stack.coefs_mut(first + c);
            coefs.copy_from_slice(&data[c * kd..(c + 1) * kd]);
            child.calc_norms(coefs, kd);
            stack.insert(child);
        }
        trace!("generated {tdim} nodes below {index}");
        first
    }

    /// Persistent node with index `idx`.
    pub fn find_node(&self, idx: &NodeIndex<D>) -> Option<usize> {
        let root = self.root_box.root_of(idx)?;
        self.retrieve_node_no_gen(root, idx)
    }

    /// Persistent node with index `idx`, or the end node above it.
    pub fn get_node_or_end_node(&self, idx: &NodeIndex<D>) -> Option<usize> {
        let root = self.root_box.root_of(idx)?;
        Some(self.retrieve_node_or_end_node(root, idx))
    }

    /// Persistent node containing the point `r` at `scale`, or the end node above it.
    pub fn get_node_or_end_node_at(&self, r: &[f64; D], scale: i32) -> Option<usize> {
        let root = self.root_box.root_at(r)?;
        Some(self.retrieve_node_or_end_node_at(root, r, scale))
    }

    /// Node with index `idx`, generated if it lies below the persistent frontier. `None` outside
    /// the world box.
    pub fn get_node(&self, idx: &NodeIndex<D>) -> Option<NodeRef> {
        let root = self.root_box.root_of(idx)?;
        Some(self.retrieve_node(NodeRef::Projected(root), idx))
    }

    /// Node containing the point `r` at `scale`, generated if needed.
    pub fn get_node_at(&self, r: &[f64; D], scale: i32) -> Option<NodeRef> {
        let root = self.root_box.root_at(r)?;
        Some(self.retrieve_node_at(NodeRef::Projected(root), r, scale))
    }

    fn delete_generated_below(&mut self, serial: usize) {
        let first = match &mut self.arena.nodes.node_mut(serial).kind {
            NodeKind::Projected { generated } => generated.get_mut().unwrap().take(),
            _ => None,
        };
        if let Some(first) = first {
            let tdim = self.layout.tdim;
            free_generated(self.arena.generated_mut(), first, tdim);
        }
    }

    fn take_generated_links(&mut self) -> Vec<usize> {
        self.arena
            .nodes
            .par_nodes_mut()
            .filter_map(|(node, _)| match &mut node.kind {
                NodeKind::Projected { generated } => generated.get_mut().unwrap().take(),
                _ => None,
            })
            .collect()
    }

    /// Release every generated node, slot by slot.
    pub fn delete_generated(&mut self) {
        let firsts = self.take_generated_links();
        let tdim = self.layout.tdim;
        let stack = self.arena.generated_mut();
        for first in firsts {
            free_generated(stack, first, tdim);
        }
    }

    /// Forget every generated node by resetting the generated stack at once.
    pub fn clear_generated(&mut self) {
        self.take_generated_links();
        self.arena.generated_mut().reset();
    }

    /// A detached copy of a persistent node with its own full coefficient buffer.
    pub fn loose_copy(&self, serial: usize) -> LooseNode<'_, D> {
        LooseNode::new(
            self.arena.loose_pool(),
            self.node(serial),
            self.coefs(serial),
            self.layout.kp1_d,
        )
    }

    /// A detached copy of any node. Generated nodes get zero wavelet blocks.
    pub fn loose_copy_of(&self, node: NodeRef) -> LooseNode<'_, D> {
        self.with_node(node, |node, coefs| {
            LooseNode::new(self.arena.loose_pool(), node, coefs, self.layout.kp1_d)
        })
    }

    /// Run `f` with the scratch buffer of the calling thread.
    pub(crate) fn with_scratch<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        self.scratch.with_scratch(f)
    }

    /// Take the tree lock.
    pub fn lock_tree(&self) -> MutexGuard<'_, TreeAggregates> {
        self.aggregates.lock().unwrap()
    }

    /// Squared norm of the represented function, computed on first use after a change.
    pub fn square_norm(&self) -> f64 {
        let mut aggregates = self.lock_tree();
        if aggregates.square_norm < 0.0 {
            aggregates.square_norm = self.sum_leaf_norms();
        }
        aggregates.square_norm
    }

    /// Recompute the squared norm.
    pub fn calc_square_norm(&mut self) -> f64 {
        let norm = self.sum_leaf_norms();
        self.aggregates.get_mut().unwrap().square_norm = norm;
        norm
    }

    pub(crate) fn invalidate_square_norm(&mut self) {
        self.aggregates.get_mut().unwrap().square_norm = UNDEFINED_NORM;
    }

    /// Sum over the persistent leaves in Hilbert order, so the result does not depend on the
    /// thread count. Nodes without coefficients contribute nothing.
    fn sum_leaf_norms(&self) -> f64 {
        self.iter(TraverseDirection::TopDown, TraverseOrder::Hilbert)
            .map(|serial| (self.node(serial), serial))
            .filter(|(node, _)| node.first_child().is_none() && node.has_coefs())
            .map(|(node, serial)| {
                if node.square_norm() >= 0.0 {
                    node.square_norm()
                } else {
                    self.coefs(serial).iter().map(|c| c * c).sum()
                }
            })
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::MACHINE_PRECISION;
    use approx::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tree<const D: usize>(order: usize) -> MwTree<D> {
        let mra = MultiResolutionAnalysis::with_max_scale(
            BoundingBox::unit(),
            ScalingBasis::legendre(order).unwrap(),
            6,
        )
        .unwrap();
        MwTree::new(mra)
    }

    #[test]
    fn test_census() {
        let mut tree = tree::<2>(2);
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.n_end_nodes(), 1);
        let root = tree.root_box().root(0);
        let first = tree.create_children(root);
        let second = tree.create_children(first + 1);
        tree.reset_end_table();
        assert_eq!(tree.n_nodes(), 9);
        assert_eq!(tree.n_nodes_at_depth(2), 4);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.n_end_nodes(), 7);
        assert_eq!(tree.count_branch_nodes(), 2);
        assert_eq!(tree.count_leaf_nodes(), 7);
        assert!(tree.node(second).parent() == Some(NodeRef::Projected(first + 1)));

        tree.delete_children(root);
        tree.reset_end_table();
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.node_stats().live, 1);
        assert!(tree.node(root).is_end_node());
    }

    #[test]
    fn test_end_table_follows_hilbert_curve() {
        let mut tree = tree::<2>(1);
        let root = tree.root_box().root(0);
        let first = tree.create_children(root);
        for c in 0..4 {
            tree.create_children(first + c);
        }
        tree.reset_end_table();
        let centers: Vec<[f64; 2]> = tree
            .end_nodes()
            .iter()
            .map(|serial| tree.node(*serial).center())
            .collect();
        for pair in centers.windows(2) {
            let step = (pair[0][0] - pair[1][0]).abs() + (pair[0][1] - pair[1][1]).abs();
            assert_relative_eq!(step, 0.25, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_give_and_recompress_conserve_norm() {
        let mut tree = tree::<1>(3);
        let mut rng = StdRng::seed_from_u64(11);
        let root = tree.root_box().root(0);
        let values: Vec<f64> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
        tree.set_coef_block(root, 0, &values[..4]);
        tree.set_coef_block(root, 1, &values[4..]);
        let norm = tree.node(root).square_norm();

        let first = tree.create_children(root);
        tree.give_children_coefs(root, true);
        let children: f64 = (0..2).map(|c| tree.node(first + c).square_norm()).sum();
        assert_relative_eq!(children, norm, epsilon = 1e-12);

        tree.zero_coefs(root);
        tree.re_compress(root, true);
        for (a, b) in tree.coefs(root).iter().zip(&values) {
            assert_relative_eq!(a, b, epsilon = 1e-13);
        }
    }

    #[test]
    fn test_generated_nodes() {
        let mut tree = tree::<2>(2);
        let root = tree.root_box().root(0);
        let mut constant = vec![0.0; 9];
        constant[0] = 2.0;
        tree.set_coef_block(root, 0, &constant);

        let idx = NodeIndex::new(2, [3, 1]);
        let found = tree.get_node(&idx).unwrap();
        assert!(matches!(found, NodeRef::Generated(_)));
        assert_eq!(tree.n_gen_nodes(), 8);
        assert_eq!(tree.get_node(&idx), Some(found));
        assert_eq!(tree.n_gen_nodes(), 8);
        tree.with_node(found, |node, coefs| {
            assert_eq!(node.index(), &idx);
            assert!(node.is_generated());
            assert_relative_eq!(coefs[0], 0.5, epsilon = 1e-13);
            for c in &coefs[1..] {
                assert!(c.abs() < 1e-13);
            }
        });
        assert_eq!(tree.find_node(&idx), None);
        assert_eq!(tree.get_node_or_end_node(&idx), Some(root));

        let n_nodes = tree.n_nodes();
        tree.delete_generated();
        assert_eq!(tree.n_gen_nodes(), 0);
        assert_eq!(tree.gen_stats().top, 0);
        assert_eq!(tree.n_nodes(), n_nodes);

        tree.get_node_at(&[0.7, 0.1], 3).unwrap();
        assert_eq!(tree.n_gen_nodes(), 12);
        tree.clear_generated();
        assert_eq!(tree.n_gen_nodes(), 0);
        assert!(!tree.node(root).has_generated_children());
    }

    #[test]
    fn test_generated_child_of_end_node() {
        let mut tree = tree::<1>(2);
        let root = tree.root_box().root(0);
        tree.set_coef_block(root, 0, &[1.0, 0.0, 0.0]);

        let idx = NodeIndex::new(1, [1]);
        let found = tree.get_node(&idx).unwrap();
        assert!(matches!(found, NodeRef::Generated(_)));
        assert_eq!(tree.n_gen_nodes(), 2);
        assert_eq!(tree.retrieve_node(found, &idx), found);
        tree.with_node(found, |node, coefs| {
            assert_eq!(node.index(), &idx);
            assert_relative_eq!(coefs[0], std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-13);
        });

        let below = tree.retrieve_node(found, &NodeIndex::new(3, [5]));
        tree.with_node(below, |node, _| assert_eq!(node.index(), &NodeIndex::new(3, [5])));
        assert_eq!(tree.n_gen_nodes(), 6);
        tree.delete_generated();
        assert_eq!(tree.n_gen_nodes(), 0);
    }

    #[test]
    fn test_outside_world() {
        let tree = tree::<1>(2);
        assert_eq!(tree.get_node(&NodeIndex::new(1, [2])), None);
        assert_eq!(tree.get_node_at(&[-0.5], 1), None);
        assert_eq!(tree.get_node_or_end_node_at(&[1.5], 1), None);
    }

    #[test]
    fn test_transform_round_trip() {
        let mut tree = tree::<2>(2);
        let mut rng = StdRng::seed_from_u64(5);
        let root = tree.root_box().root(0);
        let first = tree.create_children(root);
        tree.create_children(first + 2);
        tree.reset_end_table();
        let leaves = tree.end_nodes().to_vec();
        for serial in &leaves {
            let block: Vec<f64> = (0..9).map(|_| rng.gen_range(-1.0..1.0)).collect();
            tree.set_coef_block(*serial, 0, &block);
        }
        let norm = tree.calc_square_norm();

        tree.mw_transform(TraverseDirection::BottomUp, true);
        assert_relative_eq!(tree.square_norm(), norm, epsilon = 1e-12);
        let before: Vec<Vec<f64>> = leaves.iter().map(|s| tree.coefs(*s).to_vec()).collect();
        for serial in &leaves {
            let zeros = vec![0.0; 9];
            tree.set_coef_block(*serial, 0, &zeros);
        }
        tree.mw_transform(TraverseDirection::TopDown, true);
        for (serial, coefs) in leaves.iter().zip(&before) {
            for (a, b) in tree.coefs(*serial).iter().zip(coefs) {
                assert_relative_eq!(a, b, epsilon = 1e-13);
            }
        }
    }

    #[test]
    fn test_crop_removes_smooth_children() {
        let mut tree = tree::<2>(2);
        let root = tree.root_box().root(0);
        let mut constant = vec![0.0; 9];
        constant[0] = 1.0;
        tree.set_coef_block(root, 0, &constant);
        tree.create_children(root);
        tree.give_children_coefs(root, true);
        tree.re_compress(root, true);
        tree.reset_end_table();
        assert!(tree.node(root).wavelet_norm() < 10.0 * MACHINE_PRECISION);

        assert_eq!(tree.crop(-1.0, false), 0);
        assert_eq!(tree.crop(1e-6, false), 4);
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.end_nodes(), &[root]);
    }

    #[test]
    #[should_panic(expected = "beyond the finest scale")]
    fn test_max_scale() {
        let mra = MultiResolutionAnalysis::<1>::with_max_scale(
            BoundingBox::unit(),
            ScalingBasis::legendre(1).unwrap(),
            0,
        )
        .unwrap();
        let mut tree = MwTree::new(mra);
        let root = tree.root_box().root(0);
        tree.create_children(root);
    }

    #[test]
    fn test_clear_and_set_zero() {
        let mut tree = tree::<1>(1);
        let root = tree.root_box().root(0);
        tree.create_children(root);
        tree.set_zero();
        assert_eq!(tree.square_norm(), 0.0);
        assert!(tree.node(root + 1).has_coefs());
        tree.clear();
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.node_stats().live, 1);
        assert!(!tree.node(tree.root_box().root(0)).has_coefs());
    }
}

//! Arena storage of nodes and coefficients.
//!
//! Nodes live in fixed-capacity stacks and are addressed by their slot ("serial"). A stack keeps
//! the node structures and one contiguous coefficient array with a fixed stride per slot, so the
//! occupied part of a stack can be copied as one flat range. Slots are handed out in blocks (a
//! root box, or the `2^D` children of a node); freed blocks are recycled before the stack grows.
use crate::constants::{DEFAULT_COEF_CAPACITY, DEFAULT_MAX_GEN_NODES, DEFAULT_MAX_NODES};
use crate::node::MwNode;
use log::trace;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Buffer sizes of the nodes of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    /// Spatial dimension.
    pub dim: usize,
    /// Number of scaling functions per axis.
    pub kp1: usize,
    /// Number of children, `2^D`.
    pub tdim: usize,
    /// Coefficients per block, `kp1^D`.
    pub kp1_d: usize,
    /// Coefficients per persistent node, `tdim kp1^D`.
    pub node_stride: usize,
    /// Coefficients per generated node, `kp1^D`.
    pub gen_stride: usize,
}

impl ArenaLayout {
    /// Layout of a `D`-dimensional tree with `kp1` scaling functions per axis.
    pub fn new<const D: usize>(kp1: usize) -> Self {
        let kp1_d = kp1.pow(D as u32);
        let tdim = 1 << D;
        Self {
            dim: D,
            kp1,
            tdim,
            kp1_d,
            node_stride: tdim * kp1_d,
            gen_stride: kp1_d,
        }
    }
}

/// Capacities of the node stacks. Exhausting either one is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Slots of the persistent node stack.
    pub max_nodes: usize,
    /// Slots of the generated node stack.
    pub max_gen_nodes: usize,
}

impl ArenaConfig {
    /// Explicit capacities.
    pub fn new(max_nodes: usize, max_gen_nodes: usize) -> Self {
        Self {
            max_nodes,
            max_gen_nodes,
        }
    }

    /// Default capacities for `layout`, limited by the default coefficient capacity.
    pub fn for_layout(layout: &ArenaLayout) -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES.min(DEFAULT_COEF_CAPACITY / layout.node_stride).max(1),
            max_gen_nodes: DEFAULT_MAX_GEN_NODES
                .min(DEFAULT_COEF_CAPACITY / layout.gen_stride)
                .max(1),
        }
    }
}

/// Allocation counters of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Number of slots.
    pub capacity: usize,
    /// Slots handed out so far.
    pub allocated: usize,
    /// Slots returned so far.
    pub freed: usize,
    /// Slots in use.
    pub live: usize,
    /// One past the highest slot in use.
    pub top: usize,
}

/// A fixed-capacity stack of node slots and their coefficients.
#[derive(Debug)]
pub(crate) struct NodeStack<const D: usize> {
    label: &'static str,
    slots: Vec<Option<MwNode<D>>>,
    in_use: Vec<bool>,
    coefs: Vec<f64>,
    stride: usize,
    block_of: Vec<usize>,
    block_len: Vec<usize>,
    free_blocks: Vec<(usize, usize)>,
    top: usize,
    n_allocated: usize,
    n_freed: usize,
}

impl<const D: usize> NodeStack<D> {
    pub(crate) fn new(label: &'static str, capacity: usize, stride: usize) -> Self {
        Self {
            label,
            slots: (0..capacity).map(|_| None).collect(),
            in_use: vec![false; capacity],
            coefs: vec![0.0; capacity * stride],
            stride,
            block_of: vec![0; capacity],
            block_len: vec![0; capacity],
            free_blocks: vec![],
            top: 0,
            n_allocated: 0,
            n_freed: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn top(&self) -> usize {
        self.top
    }

    /// Reserve `count` consecutive slots with zeroed coefficients and return the first.
    pub(crate) fn alloc(&mut self, count: usize) -> usize {
        assert!(count > 0, "empty allocation");
        let base = match self
            .free_blocks
            .iter()
            .rposition(|(_, len)| *len == count)
        {
            Some(position) => self.free_blocks.remove(position).0,
            None => {
                if self.top + count > self.capacity() {
                    panic!(
                        "{} node stack exhausted: {} slots in use, capacity {}",
                        self.label,
                        self.top,
                        self.capacity()
                    );
                }
                self.top += count;
                self.top - count
            }
        };
        for serial in base..base + count {
            assert!(!self.in_use[serial], "slot {serial} handed out twice");
            self.in_use[serial] = true;
            self.block_of[serial] = base;
        }
        self.block_len[base] = count;
        self.coefs[base * self.stride..(base + count) * self.stride].fill(0.0);
        self.n_allocated += count;
        trace!("{}: allocated {} slots at {}", self.label, count, base);
        base
    }

    /// Release one slot. The block returns to the free pool once all its slots are released.
    pub(crate) fn dealloc(&mut self, serial: usize) {
        assert!(
            self.in_use[serial],
            "{} slot {serial} released twice",
            self.label
        );
        self.in_use[serial] = false;
        self.slots[serial] = None;
        self.n_freed += 1;

        let base = self.block_of[serial];
        let len = self.block_len[base];
        if self.in_use[base..base + len].iter().any(|used| *used) {
            return;
        }
        trace!("{}: released {} slots at {}", self.label, len, base);
        if base + len == self.top {
            self.top = base;
            while let Some(position) = self
                .free_blocks
                .iter()
                .position(|(b, l)| b + l == self.top)
            {
                self.top = self.free_blocks.remove(position).0;
            }
        } else {
            self.free_blocks.push((base, len));
        }
    }

    /// Release every slot.
    pub(crate) fn reset(&mut self) {
        let live = self.live();
        self.slots[..self.top].iter_mut().for_each(|slot| *slot = None);
        self.in_use[..self.top].fill(false);
        self.free_blocks.clear();
        self.top = 0;
        self.n_freed += live;
    }

    pub(crate) fn live(&self) -> usize {
        self.n_allocated - self.n_freed
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.capacity(),
            allocated: self.n_allocated,
            freed: self.n_freed,
            live: self.live(),
            top: self.top,
        }
    }

    pub(crate) fn insert(&mut self, node: MwNode<D>) {
        let serial = node.serial;
        assert!(self.in_use[serial], "node placed in unreserved slot {serial}");
        self.slots[serial] = Some(node);
    }

    pub(crate) fn get(&self, serial: usize) -> Option<&MwNode<D>> {
        self.slots.get(serial).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn node(&self, serial: usize) -> &MwNode<D> {
        self.get(serial)
            .unwrap_or_else(|| panic!("{} slot {serial} holds no node", self.label))
    }

    pub(crate) fn node_mut(&mut self, serial: usize) -> &mut MwNode<D> {
        let label = self.label;
        self.slots[serial]
            .as_mut()
            .unwrap_or_else(|| panic!("{label} slot {serial} holds no node"))
    }

    pub(crate) fn coefs(&self, serial: usize) -> &[f64] {
        &self.coefs[serial * self.stride..(serial + 1) * self.stride]
    }

    pub(crate) fn coefs_mut(&mut self, serial: usize) -> &mut [f64] {
        &mut self.coefs[serial * self.stride..(serial + 1) * self.stride]
    }

    /// The coefficients of `count` consecutive slots.
    pub(crate) fn block_coefs_mut(&mut self, base: usize, count: usize) -> &mut [f64] {
        &mut self.coefs[base * self.stride..(base + count) * self.stride]
    }

    pub(crate) fn node_and_coefs_mut(&mut self, serial: usize) -> (&mut MwNode<D>, &mut [f64]) {
        let label = self.label;
        let node = self.slots[serial]
            .as_mut()
            .unwrap_or_else(|| panic!("{label} slot {serial} holds no node"));
        let coefs = &mut self.coefs[serial * self.stride..(serial + 1) * self.stride];
        (node, coefs)
    }

    /// Parallel iterator over the live nodes below `top` and their coefficients.
    pub(crate) fn par_nodes_mut(
        &mut self,
    ) -> impl ParallelIterator<Item = (&mut MwNode<D>, &mut [f64])> {
        let top = self.top;
        let stride = self.stride;
        self.slots[..top]
            .par_iter_mut()
            .zip(self.coefs[..top * stride].par_chunks_mut(stride))
            .filter_map(|(slot, coefs)| slot.as_mut().map(|node| (node, coefs)))
    }

    /// The node structures of `[first, last)`.
    pub(crate) fn slots(&self, first: usize, last: usize) -> &[Option<MwNode<D>>] {
        &self.slots[first..last]
    }

    /// The coefficients of the slots `[first, last)`.
    pub(crate) fn coef_range(&self, first: usize, last: usize) -> &[f64] {
        &self.coefs[first * self.stride..last * self.stride]
    }

    /// The coefficients of the slots `[first, last)`, for bulk copies.
    pub(crate) fn coef_range_mut(&mut self, first: usize, last: usize) -> &mut [f64] {
        &mut self.coefs[first * self.stride..last * self.stride]
    }

    /// Rebuild the allocator state after the slots `[0, top)` were filled by a bulk copy.
    ///
    /// `blocks` lists the allocation blocks of the copied nodes; every other slot below `top`
    /// becomes free.
    pub(crate) fn restore(&mut self, top: usize, blocks: &[(usize, usize)]) {
        self.in_use[..top].fill(false);
        self.free_blocks.clear();
        for (base, len) in blocks {
            for serial in *base..base + len {
                self.in_use[serial] = true;
                self.block_of[serial] = *base;
            }
            self.block_len[*base] = *len;
        }
        self.top = top;

        let mut serial = 0;
        while serial < top {
            if self.in_use[serial] {
                serial += 1;
                continue;
            }
            let start = serial;
            while serial < top && !self.in_use[serial] && serial - start < self.block_size_hint()
            {
                serial += 1;
            }
            self.block_of[start..serial].fill(start);
            self.block_len[start] = serial - start;
            self.free_blocks.push((start, serial - start));
        }
        let live = self.in_use[..top].iter().filter(|used| **used).count();
        self.n_allocated += live;
    }

    /// Size of the recycled blocks when the free space of a copied range is rebuilt.
    fn block_size_hint(&self) -> usize {
        1 << D
    }
}

/// Recycled full-size coefficient buffers for loose nodes.
#[derive(Debug)]
pub struct LoosePool {
    size: usize,
    free: Mutex<Vec<Vec<f64>>>,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl LoosePool {
    /// A pool of buffers of `size` values.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(vec![]),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    /// Take a buffer, reusing a returned one if possible. Its contents are unspecified.
    pub fn alloc(&self) -> Vec<f64> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0.0; self.size])
    }

    /// Return a buffer.
    pub fn dealloc(&self, buffer: Vec<f64>) {
        assert_eq!(buffer.len(), self.size, "foreign buffer returned to loose pool");
        self.freed.fetch_add(1, Ordering::Relaxed);
        self.free.lock().unwrap().push(buffer);
    }

    /// Buffers currently handed out.
    pub fn live(&self) -> usize {
        self.allocated.load(Ordering::Relaxed) - self.freed.load(Ordering::Relaxed)
    }
}

/// Node storage of one tree: the persistent stack, the generated stack and the loose pool.
///
/// Persistent slots are allocated through `&mut self`. Generated slots are allocated while the
/// tree is shared between threads, so their stack sits behind a mutex.
#[derive(Debug)]
pub struct SerialTree<const D: usize> {
    layout: ArenaLayout,
    pub(crate) nodes: NodeStack<D>,
    pub(crate) gen_nodes: Mutex<NodeStack<D>>,
    loose: LoosePool,
}

impl<const D: usize> SerialTree<D> {
    /// Create the stacks for `layout` with the capacities of `config`.
    pub fn new(layout: ArenaLayout, config: &ArenaConfig) -> Self {
        assert_eq!(layout.dim, D, "layout built for another dimension");
        Self {
            layout,
            nodes: NodeStack::new("projected", config.max_nodes, layout.node_stride),
            gen_nodes: Mutex::new(NodeStack::new(
                "generated",
                config.max_gen_nodes,
                layout.gen_stride,
            )),
            loose: LoosePool::new(layout.node_stride),
        }
    }

    /// The buffer layout.
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Reserve `count` consecutive persistent slots. Returns the first slot and the zeroed
    /// coefficients of all of them.
    pub fn alloc_nodes(&mut self, count: usize) -> (usize, &mut [f64]) {
        let base = self.nodes.alloc(count);
        (base, self.nodes.block_coefs_mut(base, count))
    }

    /// Release a persistent slot.
    pub fn dealloc_nodes(&mut self, serial: usize) {
        self.nodes.dealloc(serial);
    }

    /// Reserve `count` consecutive generated slots and return the first.
    pub fn alloc_gen_nodes(&self, count: usize) -> usize {
        self.lock_generated().alloc(count)
    }

    /// Release a generated slot.
    pub fn dealloc_gen_nodes(&self, serial: usize) {
        self.lock_generated().dealloc(serial);
    }

    /// Take a full-size scratch buffer from the loose pool.
    pub fn alloc_loose_coefs(&self) -> Vec<f64> {
        self.loose.alloc()
    }

    /// Return a buffer to the loose pool.
    pub fn dealloc_loose_coefs(&self, buffer: Vec<f64>) {
        self.loose.dealloc(buffer);
    }

    /// Counters of the persistent stack.
    pub fn node_stats(&self) -> ArenaStats {
        self.nodes.stats()
    }

    /// Counters of the generated stack.
    pub fn gen_stats(&self) -> ArenaStats {
        self.lock_generated().stats()
    }

    /// Loose buffers currently handed out.
    pub fn loose_live(&self) -> usize {
        self.loose.live()
    }

    pub(crate) fn loose_pool(&self) -> &LoosePool {
        &self.loose
    }

    pub(crate) fn lock_generated(&self) -> MutexGuard<'_, NodeStack<D>> {
        self.gen_nodes.lock().unwrap()
    }

    pub(crate) fn generated_mut(&mut self) -> &mut NodeStack<D> {
        self.gen_nodes.get_mut().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::NodeIndex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn arena() -> SerialTree<2> {
        SerialTree::new(ArenaLayout::new::<2>(3), &ArenaConfig::new(64, 32))
    }

    #[test]
    fn test_layout() {
        let layout = ArenaLayout::new::<3>(4);
        assert_eq!(layout.tdim, 8);
        assert_eq!(layout.kp1_d, 64);
        assert_eq!(layout.node_stride, 512);
        assert_eq!(layout.gen_stride, 64);
        let config = ArenaConfig::for_layout(&layout);
        assert!(config.max_nodes * layout.node_stride <= DEFAULT_COEF_CAPACITY);
    }

    #[test]
    fn test_blocks_are_contiguous_and_zeroed() {
        let mut arena = arena();
        let (base, coefs) = arena.alloc_nodes(4);
        assert_eq!(base, 0);
        assert_eq!(coefs.len(), 4 * 36);
        coefs.fill(1.0);
        let (second, _) = arena.alloc_nodes(4);
        assert_eq!(second, 4);

        for serial in 0..4 {
            arena.dealloc_nodes(serial);
        }
        let (reused, coefs) = arena.alloc_nodes(4);
        assert_eq!(reused, 0);
        assert!(coefs.iter().all(|c| *c == 0.0));
    }

    #[test]
    fn test_top_shrinks() {
        let mut arena = arena();
        arena.alloc_nodes(4);
        arena.alloc_nodes(4);
        arena.alloc_nodes(4);
        for serial in 4..8 {
            arena.dealloc_nodes(serial);
        }
        assert_eq!(arena.node_stats().top, 12);
        for serial in 8..12 {
            arena.dealloc_nodes(serial);
        }
        assert_eq!(arena.node_stats().top, 4);
    }

    #[test]
    #[should_panic(expected = "node stack exhausted")]
    fn test_exhaustion() {
        let mut arena = arena();
        for _ in 0..17 {
            arena.alloc_nodes(4);
        }
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_free() {
        let mut arena = arena();
        arena.alloc_nodes(4);
        arena.dealloc_nodes(1);
        arena.dealloc_nodes(1);
    }

    #[test]
    fn test_accounting() {
        let mut arena = arena();
        let mut rng = StdRng::seed_from_u64(3);
        let mut live: Vec<usize> = vec![];
        let mut live_gen: Vec<usize> = vec![];
        for _ in 0..500 {
            match rng.gen_range(0..4) {
                0 if arena.node_stats().top + 4 <= 64 => {
                    let (base, _) = arena.alloc_nodes(4);
                    live.extend(base..base + 4);
                }
                1 if !live.is_empty() => {
                    let serial = live.swap_remove(rng.gen_range(0..live.len()));
                    arena.dealloc_nodes(serial);
                }
                2 if arena.gen_stats().top + 4 <= 32 => {
                    let base = arena.alloc_gen_nodes(4);
                    live_gen.extend(base..base + 4);
                }
                3 if !live_gen.is_empty() => {
                    let serial = live_gen.swap_remove(rng.gen_range(0..live_gen.len()));
                    arena.dealloc_gen_nodes(serial);
                }
                _ => {}
            }
            let stats = arena.node_stats();
            assert_eq!(stats.allocated - stats.freed, stats.live);
            assert_eq!(stats.live, live.len());
            let gen_stats = arena.gen_stats();
            assert_eq!(gen_stats.allocated - gen_stats.freed, gen_stats.live);
            assert_eq!(gen_stats.live, live_gen.len());

            let mut sorted = live.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), live.len());
            let mut sorted = live_gen.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), live_gen.len());
        }
    }

    #[test]
    fn test_nodes_in_slots() {
        let mut arena = arena();
        let (base, _) = arena.alloc_nodes(1);
        arena
            .nodes
            .insert(MwNode::new_root(base, NodeIndex::new(0, [0, 0])));
        assert!(arena.nodes.node(base).is_root());
        arena.nodes.coefs_mut(base)[0] = 2.0;
        let (node, coefs) = arena.nodes.node_and_coefs_mut(base);
        assert_eq!(node.serial(), base);
        assert_eq!(coefs[0], 2.0);
        arena.dealloc_nodes(base);
        assert!(arena.nodes.get(base).is_none());
    }

    #[test]
    fn test_loose_pool() {
        let arena = arena();
        let a = arena.alloc_loose_coefs();
        let b = arena.alloc_loose_coefs();
        assert_eq!(a.len(), 36);
        assert_eq!(arena.loose_live(), 2);
        arena.dealloc_loose_coefs(a);
        arena.dealloc_loose_coefs(b);
        assert_eq!(arena.loose_live(), 0);
    }
}

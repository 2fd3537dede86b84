//! Traversals of the persistent nodes of a tree.
use crate::tree::MwTree;
use crate::types::{TraverseDirection, TraverseOrder};

/// Depth-first traversal over the persistent nodes, yielding slots.
///
/// Top-down visits a node before its children, bottom-up after them. Roots are visited in box
/// order, children by slot or along the Hilbert curve.
pub struct TreeIterator<'a, const D: usize> {
    tree: &'a MwTree<D>,
    direction: TraverseDirection,
    order: TraverseOrder,
    stack: Vec<(usize, bool)>,
}

impl<'a, const D: usize> TreeIterator<'a, D> {
    /// Traverse `tree`.
    pub fn new(tree: &'a MwTree<D>, direction: TraverseDirection, order: TraverseOrder) -> Self {
        let stack = tree
            .root_box()
            .roots()
            .iter()
            .rev()
            .map(|serial| (*serial, false))
            .collect();
        Self {
            tree,
            direction,
            order,
            stack,
        }
    }

    fn push_children(&mut self, serial: usize) {
        let node = self.tree.node(serial);
        if let Some(first) = node.first_child() {
            let tdim = 1 << D;
            for h in (0..tdim).rev() {
                let child = match self.order {
                    TraverseOrder::ZOrder => h,
                    TraverseOrder::Hilbert => node.hilbert_path().z_index(h),
                };
                self.stack.push((first + child, false));
            }
        }
    }
}

impl<const D: usize> Iterator for TreeIterator<'_, D> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let (serial, expanded) = self.stack.pop()?;
            match self.direction {
                TraverseDirection::TopDown => {
                    self.push_children(serial);
                    return Some(serial);
                }
                TraverseDirection::BottomUp => {
                    if expanded || self.tree.node(serial).first_child().is_none() {
                        return Some(serial);
                    }
                    self.stack.push((serial, true));
                    self.push_children(serial);
                }
            }
        }
    }
}

/// Persistent nodes grouped by depth below the roots, each level in z-order.
pub fn nodes_by_depth<const D: usize>(tree: &MwTree<D>) -> Vec<Vec<usize>> {
    let mut levels = vec![];
    let mut current = tree.root_box().roots().to_vec();
    while !current.is_empty() {
        let next = current
            .iter()
            .filter_map(|serial| tree.node(*serial).first_child())
            .flat_map(|first| first..first + (1 << D))
            .collect();
        levels.push(current);
        current = next;
    }
    levels
}

extern crate blas_src;
extern crate lapack_src;

use approx::assert_relative_eq;
use mwtrees::basis::ScalingBasis;
use mwtrees::builder::project;
use mwtrees::index::NodeIndex;
use mwtrees::mra::{BoundingBox, MultiResolutionAnalysis};
use mwtrees::transfer::{LocalChannel, TreeChannel};
use mwtrees::tree::MwTree;
use mwtrees::types::{MwError, TraverseDirection, TraverseOrder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;

fn square_world(order: usize) -> MultiResolutionAnalysis<2> {
    MultiResolutionAnalysis::with_max_scale(
        BoundingBox::new(0, [0, 0], [2, 2]),
        ScalingBasis::legendre(order).unwrap(),
        6,
    )
    .unwrap()
}

/// Index of every node in top-down order, with the indices of its children.
fn shape(tree: &MwTree<2>) -> Vec<(NodeIndex<2>, Vec<NodeIndex<2>>)> {
    tree.iter(TraverseDirection::TopDown, TraverseOrder::ZOrder)
        .map(|serial| {
            let node = tree.node(serial);
            let children = (0..4)
                .filter_map(|c| node.child(c))
                .map(|child| *tree.node(child).index())
                .collect();
            (*node.index(), children)
        })
        .collect()
}

fn send_to_other_thread(tree: &MwTree<2>, order: usize) -> MwTree<2> {
    let (zero, one) = LocalChannel::pair();
    let receiver = thread::spawn(move || {
        let mut received = MwTree::new(square_world(order));
        received.receive_tree(&one, 0, 3).unwrap();
        received
    });
    tree.send_tree(&zero, 1, 3).unwrap();
    receiver.join().unwrap()
}

#[test]
fn test_four_roots_arrive_intact() {
    let mut tree = MwTree::new(square_world(3));
    let kd = 16;
    let mut rng = StdRng::seed_from_u64(0);
    for i in 0..tree.root_box().n_roots() {
        let root = tree.root_box().root(i);
        for block in 0..4 {
            let values: Vec<f64> = (0..kd).map(|_| rng.gen::<f64>() - 0.5).collect();
            tree.set_coef_block(root, block, &values);
        }
    }
    assert_eq!(tree.n_nodes(), 4);

    let received = send_to_other_thread(&tree, 3);
    assert_eq!(received.n_nodes(), 4);
    assert_eq!(shape(&received), shape(&tree));
    for i in 0..4 {
        let (a, b) = (tree.root_box().root(i), received.root_box().root(i));
        assert!(received.node(b).is_root());
        assert_eq!(received.coefs(b), tree.coefs(a));
    }
    assert_relative_eq!(received.square_norm(), tree.square_norm(), max_relative = 1e-14);
}

#[test]
fn test_refined_tree_keeps_parent_child_links() {
    let mut tree = MwTree::new(square_world(4));
    project(&mut tree, 1e-4, false, |r| {
        (-30.0 * ((r[0] - 1.2).powi(2) + (r[1] - 0.7).powi(2))).exp()
    });
    assert!(tree.depth() > 1);

    let received = send_to_other_thread(&tree, 4);
    assert_eq!(shape(&received), shape(&tree));
    assert_eq!(received.n_end_nodes(), tree.n_end_nodes());
    for serial in received.iter(TraverseDirection::TopDown, TraverseOrder::ZOrder) {
        let node = received.node(serial);
        for child in (0..4).filter_map(|c| node.child(c)) {
            assert_eq!(received.node(child).index().parent(), *node.index());
        }
    }
    for r in [[0.3, 0.3], [1.2, 0.7], [1.9, 1.1]] {
        assert_relative_eq!(received.evalf(&r), tree.evalf(&r), epsilon = 1e-14);
    }
}

#[test]
fn test_receiver_with_other_order_is_refused() {
    let tree = MwTree::new(square_world(3));
    let (zero, one) = LocalChannel::pair();
    let receiver = thread::spawn(move || {
        let mut received = MwTree::new(square_world(5));
        let payload = one.receive(1 << 20, 0, 9).unwrap();
        received.load_bytes(&payload)
    });
    tree.send_tree(&zero, 1, 9).unwrap();
    assert!(matches!(
        receiver.join().unwrap(),
        Err(MwError::LayoutMismatch(_))
    ));
}

//! Flat-buffer transfer of trees between processes.
//!
//! A tree travels as one byte buffer of little-endian 8-byte words: a header describing the
//! analysis and the arena layout, one fixed-size record per slot of the occupied range of the
//! persistent stack, and the coefficients of that range copied verbatim. Slots are kept, so links
//! between nodes survive the copy unchanged. Generated nodes are not transferred.
//!
//! The receiver validates the whole buffer before touching its own tree.
#[cfg(feature = "mpi")]
mod parallel;

#[cfg(feature = "mpi")]
pub use parallel::MpiChannel;

use crate::constants::{MAX_DIM, MAX_TDIM, WIRE_MAGIC, WIRE_RECORD_WORDS};
use crate::hilbert::HilbertPath;
use crate::index::NodeIndex;
use crate::iterator::nodes_by_depth;
use crate::node::{MwNode, NodeKind, NodeRef, NodeStatus};
use crate::tree::MwTree;
use crate::types::{MwError, Result, ScalingType};
use log::debug;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

const HEADER_WORDS: usize = 10 + 2 * MAX_DIM + 2;
const NONE: u64 = u64::MAX;

/// Point-to-point byte transport between ranks.
pub trait TreeChannel {
    /// Rank of this end.
    fn rank(&self) -> i32;

    /// Send `bytes` to `dest`.
    fn send(&self, bytes: &[u8], dest: i32, tag: i32) -> Result<()>;

    /// Receive a message from `source`. Fails with [`MwError::BufferTooSmall`] if it is longer
    /// than `max_len` bytes.
    fn receive(&self, max_len: usize, source: i32, tag: i32) -> Result<Vec<u8>>;
}

/// One end of an in-process channel between two ranks, for threads standing in for processes.
///
/// Messages are matched by tag in the order they were sent. A message with another tag stays
/// queued for a later receive.
pub struct LocalChannel {
    rank: i32,
    peer: i32,
    sender: Sender<(i32, Vec<u8>)>,
    receiver: Receiver<(i32, Vec<u8>)>,
    pending: Mutex<Vec<(i32, Vec<u8>)>>,
}

impl LocalChannel {
    /// Two connected ends, ranks 0 and 1.
    pub fn pair() -> (Self, Self) {
        let (to_one, from_zero) = channel();
        let (to_zero, from_one) = channel();
        (
            Self {
                rank: 0,
                peer: 1,
                sender: to_one,
                receiver: from_one,
                pending: Mutex::new(vec![]),
            },
            Self {
                rank: 1,
                peer: 0,
                sender: to_zero,
                receiver: from_zero,
                pending: Mutex::new(vec![]),
            },
        )
    }
}

impl TreeChannel for LocalChannel {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn send(&self, bytes: &[u8], dest: i32, tag: i32) -> Result<()> {
        if dest != self.peer {
            return Err(MwError::Transport(format!("rank {dest} is not connected")));
        }
        self.sender
            .send((tag, bytes.to_vec()))
            .map_err(|_| MwError::Transport(format!("rank {dest} hung up")))
    }

    fn receive(&self, max_len: usize, source: i32, tag: i32) -> Result<Vec<u8>> {
        if source != self.peer {
            return Err(MwError::Transport(format!("rank {source} is not connected")));
        }
        let mut pending = self.pending.lock().unwrap();
        let payload = match pending.iter().position(|(queued, _)| *queued == tag) {
            Some(position) => pending.remove(position).1,
            None => loop {
                let (received_tag, payload) = self
                    .receiver
                    .recv()
                    .map_err(|_| MwError::Transport(format!("rank {source} hung up")))?;
                if received_tag == tag {
                    break payload;
                }
                pending.push((received_tag, payload));
            },
        };
        if payload.len() > max_len {
            return Err(MwError::BufferTooSmall {
                needed: payload.len(),
                available: max_len,
            });
        }
        Ok(payload)
    }
}

struct WireWriter {
    bytes: Vec<u8>,
}

impl WireWriter {
    fn with_words(n_words: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(8 * n_words),
        }
    }

    fn word(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn int(&mut self, value: i64) {
        self.word(value as u64);
    }

    fn float(&mut self, value: f64) {
        self.word(value.to_bits());
    }

    fn slot(&mut self, value: Option<usize>) {
        self.word(value.map_or(NONE, |v| v as u64));
    }
}

struct WireReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn word(&mut self) -> Result<u64> {
        let chunk = self
            .bytes
            .get(self.position..self.position + 8)
            .ok_or_else(|| MwError::CorruptBuffer("buffer ends inside a word".to_string()))?;
        self.position += 8;
        let mut word = [0; 8];
        word.copy_from_slice(chunk);
        Ok(u64::from_le_bytes(word))
    }

    fn int(&mut self) -> Result<i64> {
        Ok(self.word()? as i64)
    }

    fn float(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.word()?))
    }

    fn count(&mut self) -> Result<usize> {
        usize::try_from(self.word()?)
            .map_err(|_| MwError::CorruptBuffer("count out of range".to_string()))
    }

    fn slot(&mut self) -> Result<Option<usize>> {
        match self.word()? {
            NONE => Ok(None),
            value => usize::try_from(value)
                .map(Some)
                .map_err(|_| MwError::CorruptBuffer("slot out of range".to_string())),
        }
    }

    fn scale(&mut self) -> Result<i32> {
        i32::try_from(self.int()?)
            .map_err(|_| MwError::CorruptBuffer("scale out of range".to_string()))
    }
}

fn scaling_code(scaling_type: ScalingType) -> u64 {
    match scaling_type {
        ScalingType::Legendre => 0,
        ScalingType::Interpolating => 1,
    }
}

struct Record<const D: usize> {
    status: NodeStatus,
    index: NodeIndex<D>,
    hilbert: HilbertPath<D>,
    parent: Option<usize>,
    children: Option<usize>,
    square_norm: f64,
    norms: [f64; MAX_TDIM],
}

fn corrupt(message: String) -> MwError {
    MwError::CorruptBuffer(message)
}

impl<const D: usize> MwTree<D> {
    fn wire_words(&self, n_slots: usize) -> usize {
        HEADER_WORDS + n_slots * (WIRE_RECORD_WORDS + self.layout.node_stride)
    }

    /// Largest buffer this tree can receive, in bytes.
    pub fn wire_capacity(&self) -> usize {
        8 * self.wire_words(self.arena.nodes.capacity())
    }

    /// Serialise the persistent nodes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let last = self.arena.nodes.top();
        let mut writer = WireWriter::with_words(self.wire_words(last));
        let world = self.mra.world();

        writer.word(WIRE_MAGIC);
        writer.word(D as u64);
        writer.word(self.mra.order() as u64);
        writer.word(scaling_code(self.basis().scaling_type()));
        writer.word(self.layout.tdim as u64);
        writer.word(self.layout.node_stride as u64);
        writer.word(0);
        writer.word(last as u64);
        writer.word(self.n_nodes() as u64);
        writer.word(self.root_box.n_roots() as u64);
        writer.int(i64::from(world.scale()));
        for d in 0..MAX_DIM {
            writer.int(world.corner().get(d).map_or(0, |c| i64::from(*c)));
        }
        for d in 0..MAX_DIM {
            writer.word(world.n_boxes().get(d).map_or(0, |n| *n as u64));
        }
        writer.int(i64::from(self.mra.max_scale()));

        for slot in self.arena.nodes.slots(0, last) {
            let Some(node) = slot else {
                writer.word(NONE);
                (1..WIRE_RECORD_WORDS).for_each(|_| writer.word(0));
                continue;
            };
            writer.word(u64::from(node.status().bits()));
            writer.int(i64::from(node.scale()));
            for d in 0..MAX_DIM {
                writer.int(node.index().translation().get(d).map_or(0, |l| i64::from(*l)));
            }
            writer.word(u64::from(node.hilbert_path().path()));
            writer.slot(match node.parent() {
                Some(NodeRef::Projected(parent)) => Some(parent),
                _ => None,
            });
            writer.slot(node.first_child());
            writer.float(node.square_norm());
            for norm in node.norms {
                writer.float(norm);
            }
        }
        for value in self.arena.nodes.coef_range(0, last) {
            writer.float(*value);
        }
        writer.bytes
    }

    fn check_header(&self, reader: &mut WireReader) -> Result<(usize, usize, usize)> {
        if reader.word()? != WIRE_MAGIC {
            return Err(corrupt("not a tree buffer".to_string()));
        }
        let layout = [
            ("dimension", reader.word()?, D as u64),
            ("order", reader.word()?, self.mra.order() as u64),
            (
                "scaling type",
                reader.word()?,
                scaling_code(self.basis().scaling_type()),
            ),
            ("children per node", reader.word()?, self.layout.tdim as u64),
            ("node stride", reader.word()?, self.layout.node_stride as u64),
        ];
        for (what, received, expected) in layout {
            if received != expected {
                return Err(MwError::LayoutMismatch(format!(
                    "{what} {received} received, {expected} expected"
                )));
            }
        }

        let first = reader.count()?;
        let last = reader.count()?;
        let n_nodes = reader.count()?;
        let n_roots = reader.count()?;
        if first != 0 || last < n_nodes || n_nodes < n_roots {
            return Err(corrupt(format!(
                "inconsistent range [{first}, {last}) holding {n_nodes} nodes and {n_roots} roots"
            )));
        }

        let world = self.mra.world();
        let scale = reader.scale()?;
        let mut corner = [0; MAX_DIM];
        for c in corner.iter_mut() {
            *c = reader.int()?;
        }
        let mut n_boxes = [0; MAX_DIM];
        for n in n_boxes.iter_mut() {
            *n = reader.word()?;
        }
        let max_scale = reader.scale()?;
        let same_world = scale == world.scale()
            && max_scale == self.mra.max_scale()
            && (0..D).all(|d| {
                corner[d] == i64::from(world.corner()[d]) && n_boxes[d] == world.n_boxes()[d] as u64
            });
        if !same_world || n_roots != world.n_roots() {
            return Err(MwError::IncompatibleTrees(
                "the received tree covers another world box".to_string(),
            ));
        }

        if last > self.arena.nodes.capacity() {
            return Err(MwError::BufferTooSmall {
                needed: 8 * self.wire_words(last),
                available: self.wire_capacity(),
            });
        }
        if reader.bytes.len() != 8 * self.wire_words(last) {
            return Err(corrupt(format!(
                "{} bytes received, {} expected for {last} slots",
                reader.bytes.len(),
                8 * self.wire_words(last)
            )));
        }
        Ok((last, n_nodes, n_roots))
    }

    fn read_record(reader: &mut WireReader) -> Result<Option<Record<D>>> {
        let bits = reader.word()?;
        if bits == NONE {
            for _ in 1..WIRE_RECORD_WORDS {
                reader.word()?;
            }
            return Ok(None);
        }
        let status = u16::try_from(bits)
            .ok()
            .and_then(NodeStatus::from_bits)
            .ok_or_else(|| corrupt(format!("unknown status bits {bits:#x}")))?;
        if !status.contains(NodeStatus::ALLOCATED)
            || status.contains(NodeStatus::GENERATED)
            || status.contains(NodeStatus::LOOSE)
        {
            return Err(corrupt(format!("status {bits:#x} of a persistent node")));
        }
        let scale = reader.scale()?;
        let mut translation = [0; MAX_DIM];
        for l in translation.iter_mut() {
            *l = i32::try_from(reader.int()?)
                .map_err(|_| corrupt("translation out of range".to_string()))?;
        }
        let path = reader.word()?;
        if path >= HilbertPath::<D>::n_states() as u64 {
            return Err(corrupt(format!("invalid Hilbert state {path}")));
        }
        let parent = reader.slot()?;
        let children = reader.slot()?;
        let square_norm = reader.float()?;
        let mut norms = [0.0; MAX_TDIM];
        for norm in norms.iter_mut() {
            *norm = reader.float()?;
        }
        Ok(Some(Record {
            status,
            index: NodeIndex::new(scale, std::array::from_fn(|d| translation[d])),
            hilbert: HilbertPath::from_state(path as u8),
            parent,
            children,
            square_norm,
            norms,
        }))
    }

    /// Check the links of the received records and return the roots in box order and the
    /// allocation blocks.
    fn check_links(
        &self,
        records: &[Option<Record<D>>],
        n_roots: usize,
    ) -> Result<(Vec<usize>, Vec<(usize, usize)>)> {
        let tdim = self.layout.tdim;
        let world = self.mra.world();
        let mut roots = vec![None; n_roots];
        let mut blocks = vec![];
        for (serial, record) in records.iter().enumerate() {
            let Some(record) = record else { continue };
            match record.parent {
                None => {
                    let i = world
                        .box_index(&record.index)
                        .filter(|_| record.index.scale() == world.scale())
                        .ok_or_else(|| corrupt(format!("root {} outside the world", record.index)))?;
                    if !record.status.contains(NodeStatus::ROOT) || roots[i].replace(serial).is_some() {
                        return Err(corrupt(format!("duplicate root {}", record.index)));
                    }
                    blocks.push((serial, 1));
                }
                Some(parent) => {
                    let owner = records
                        .get(parent)
                        .and_then(Option::as_ref)
                        .ok_or_else(|| corrupt(format!("{} has a vacant parent", record.index)))?;
                    let first = owner.children.unwrap_or(usize::MAX);
                    if record.status.contains(NodeStatus::ROOT)
                        || serial < first
                        || serial - first >= tdim
                        || owner.index.child(serial - first) != record.index
                        || owner.hilbert.child(serial - first) != record.hilbert
                    {
                        return Err(corrupt(format!("{} is not a child of its parent", record.index)));
                    }
                }
            }
            if let Some(first) = record.children {
                if record.index.scale() >= self.mra.max_scale() {
                    return Err(corrupt(format!("{} refined beyond the finest scale", record.index)));
                }
                let end = first
                    .checked_add(tdim)
                    .filter(|end| *end <= records.len())
                    .ok_or_else(|| corrupt(format!("children of {} out of range", record.index)))?;
                for child in first..end {
                    match records.get(child).and_then(Option::as_ref) {
                        Some(c) if c.parent == Some(serial) => {}
                        _ => {
                            return Err(corrupt(format!("{} has a missing child", record.index)))
                        }
                    }
                }
                blocks.push((first, tdim));
            }
        }
        let roots = roots
            .into_iter()
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| corrupt("missing root".to_string()))?;
        Ok((roots, blocks))
    }

    /// Replace the tree by the nodes serialised in `bytes`. The tree is left unchanged when the
    /// buffer is rejected.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mut reader = WireReader::new(bytes);
        let (last, n_nodes, n_roots) = self.check_header(&mut reader)?;
        let records = (0..last)
            .map(|_| Self::read_record(&mut reader))
            .collect::<Result<Vec<_>>>()?;
        let live = records.iter().filter(|record| record.is_some()).count();
        if live != n_nodes {
            return Err(corrupt(format!("{live} node records for {n_nodes} nodes")));
        }
        let (roots, blocks) = self.check_links(&records, n_roots)?;

        self.arena.nodes.reset();
        self.arena.generated_mut().reset();
        self.arena.nodes.restore(last, &blocks);
        for value in self.arena.nodes.coef_range_mut(0, last) {
            *value = reader.float()?;
        }
        for (serial, record) in records.into_iter().enumerate() {
            let Some(record) = record else { continue };
            self.arena.nodes.insert(MwNode {
                kind: NodeKind::Projected {
                    generated: Mutex::new(None),
                },
                serial,
                index: record.index,
                hilbert: record.hilbert,
                parent: record.parent.map(NodeRef::Projected),
                children: record.children,
                status: record.status,
                norms: record.norms,
                square_norm: record.square_norm,
            });
        }

        self.root_box.roots = roots;
        self.nodes_at_depth = nodes_by_depth(self)
            .iter()
            .map(Vec::len)
            .collect();
        self.reset_end_table();
        self.invalidate_square_norm();
        Ok(())
    }

    /// Send the tree to `dest`.
    pub fn send_tree<C: TreeChannel + ?Sized>(&self, channel: &C, dest: i32, tag: i32) -> Result<()> {
        let bytes = self.to_bytes();
        debug!(
            "rank {}: sending {} nodes ({} bytes) to rank {dest}",
            channel.rank(),
            self.n_nodes(),
            bytes.len()
        );
        channel.send(&bytes, dest, tag)
    }

    /// Replace the tree by one received from `source`.
    pub fn receive_tree<C: TreeChannel + ?Sized>(
        &mut self,
        channel: &C,
        source: i32,
        tag: i32,
    ) -> Result<()> {
        let bytes = channel.receive(self.wire_capacity(), source, tag)?;
        self.load_bytes(&bytes)?;
        debug!(
            "rank {}: received {} nodes ({} bytes) from rank {source}",
            channel.rank(),
            self.n_nodes(),
            bytes.len()
        );
        Ok(())
    }

    /// Copy the tree of rank `source` into the tree of rank `dest`. Other ranks do nothing.
    pub fn transfer<C: TreeChannel + ?Sized>(
        &mut self,
        channel: &C,
        source: i32,
        dest: i32,
        tag: i32,
    ) -> Result<()> {
        let rank = channel.rank();
        if rank == source {
            self.send_tree(channel, dest, tag)
        } else if rank == dest {
            self.receive_tree(channel, source, tag)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena::ArenaConfig;
    use crate::basis::ScalingBasis;
    use crate::builder::project;
    use crate::context::ExecutionContext;
    use crate::mra::{BoundingBox, MultiResolutionAnalysis};
    use approx::*;
    use std::thread;

    fn mra(order: usize) -> MultiResolutionAnalysis<2> {
        MultiResolutionAnalysis::with_max_scale(
            BoundingBox::new(0, [0, 0], [2, 1]),
            ScalingBasis::legendre(order).unwrap(),
            8,
        )
        .unwrap()
    }

    fn projected() -> MwTree<2> {
        let mut tree = MwTree::new(mra(2));
        project(&mut tree, 1e-4, false, |r| (-20.0 * ((r[0] - 0.6).powi(2) + r[1] * r[1])).exp());
        tree
    }

    #[test]
    fn test_round_trip_through_channel() {
        let tree = projected();
        let expected = tree.to_bytes();
        let (zero, one) = LocalChannel::pair();
        let receiver = thread::spawn(move || {
            let mut copy = MwTree::new(mra(2));
            copy.transfer(&one, 0, 1, 7).unwrap();
            copy.to_bytes()
        });
        let mut tree = tree;
        tree.transfer(&zero, 0, 1, 7).unwrap();
        assert_eq!(receiver.join().unwrap(), expected);
    }

    #[test]
    fn test_loaded_tree_is_usable() {
        let tree = projected();
        let mut copy = MwTree::new(mra(2));
        copy.load_bytes(&tree.to_bytes()).unwrap();
        assert_eq!(copy.n_nodes(), tree.n_nodes());
        assert_eq!(copy.end_nodes(), tree.end_nodes());
        assert_eq!(copy.node_stats().live, tree.n_nodes());
        assert_relative_eq!(copy.square_norm(), tree.square_norm(), epsilon = 1e-14);
        assert_relative_eq!(copy.evalf(&[1.3, 0.2]), tree.evalf(&[1.3, 0.2]), epsilon = 1e-14);

        let leaf = copy.end_node(0);
        if copy.node(leaf).scale() < copy.mra().max_scale() {
            copy.create_children(leaf);
            copy.give_children_coefs(leaf, true);
        }
        copy.delete_children(copy.root_box().root(0));
        copy.reset_end_table();
        assert_eq!(copy.node_stats().live, copy.n_nodes());
    }

    #[test]
    fn test_rejected_buffers() {
        let tree = projected();
        let bytes = tree.to_bytes();
        let mut other = MwTree::new(mra(3));
        assert!(matches!(other.load_bytes(&bytes), Err(MwError::LayoutMismatch(_))));

        let mut copy = MwTree::new(mra(2));
        assert!(matches!(
            copy.load_bytes(&bytes[..bytes.len() - 8]),
            Err(MwError::CorruptBuffer(_))
        ));
        let mut broken = bytes.clone();
        broken[0] ^= 1;
        assert!(matches!(copy.load_bytes(&broken), Err(MwError::CorruptBuffer(_))));
        assert_eq!(copy.n_nodes(), 2);

        let small = ArenaConfig::new(4, 4);
        let mut small = MwTree::with_config(mra(2), &small, &ExecutionContext::serial());
        assert!(matches!(small.load_bytes(&bytes), Err(MwError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_channel_errors() {
        let (zero, one) = LocalChannel::pair();
        assert!(matches!(zero.send(&[1, 2], 3, 0), Err(MwError::Transport(_))));
        zero.send(&[1, 2, 3], 1, 5).unwrap();
        assert!(matches!(
            one.receive(2, 0, 5),
            Err(MwError::BufferTooSmall {
                needed: 3,
                available: 2
            })
        ));
        zero.send(&[1], 1, 5).unwrap();
        zero.send(&[4, 5], 1, 6).unwrap();
        assert_eq!(one.receive(8, 0, 6).unwrap(), vec![4, 5]);
        assert_eq!(one.receive(8, 0, 5).unwrap(), vec![1]);
        drop(zero);
        assert!(matches!(one.receive(8, 0, 5), Err(MwError::Transport(_))));
    }
}

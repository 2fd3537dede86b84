//! Tree transfer over MPI.
use super::TreeChannel;
use crate::types::{MwError, Result};
use mpi::point_to_point::{Destination, Source};
use mpi::topology::Communicator;

/// A [`TreeChannel`] over an MPI communicator.
pub struct MpiChannel<'a, C: Communicator> {
    comm: &'a C,
}

impl<'a, C: Communicator> MpiChannel<'a, C> {
    /// Send and receive through `comm`.
    pub fn new(comm: &'a C) -> Self {
        Self { comm }
    }
}

impl<C: Communicator> TreeChannel for MpiChannel<'_, C> {
    fn rank(&self) -> i32 {
        self.comm.rank()
    }

    fn send(&self, bytes: &[u8], dest: i32, tag: i32) -> Result<()> {
        if dest < 0 || dest >= self.comm.size() {
            return Err(MwError::Transport(format!(
                "rank {dest} outside a communicator of {}",
                self.comm.size()
            )));
        }
        self.comm.process_at_rank(dest).send_with_tag(bytes, tag);
        Ok(())
    }

    fn receive(&self, max_len: usize, source: i32, tag: i32) -> Result<Vec<u8>> {
        if source < 0 || source >= self.comm.size() {
            return Err(MwError::Transport(format!(
                "rank {source} outside a communicator of {}",
                self.comm.size()
            )));
        }
        let (payload, _status) = self
            .comm
            .process_at_rank(source)
            .receive_vec_with_tag::<u8>(tag);
        if payload.len() > max_len {
            return Err(MwError::BufferTooSmall {
                needed: payload.len(),
                available: max_len,
            });
        }
        Ok(payload)
    }
}

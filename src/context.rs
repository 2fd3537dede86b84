//! Process and thread topology of a run.
#[cfg(feature = "mpi")]
use mpi::topology::Communicator;

/// Rank, size and thread count, queried once at the start of a run and passed to whatever needs
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    rank: i32,
    size: i32,
    n_threads: usize,
}

impl ExecutionContext {
    /// Create a context.
    pub fn new(rank: i32, size: i32, n_threads: usize) -> Self {
        assert!(
            0 <= rank && rank < size,
            "rank {rank} outside a group of {size}"
        );
        Self {
            rank,
            size,
            n_threads: n_threads.max(1),
        }
    }

    /// A single process using the threads of the rayon pool.
    pub fn serial() -> Self {
        Self::new(0, 1, rayon::current_num_threads())
    }

    /// The context of `world`, using the threads of the rayon pool.
    #[cfg(feature = "mpi")]
    pub fn from_world<C: Communicator>(world: &C) -> Self {
        Self::new(world.rank(), world.size(), rayon::current_num_threads())
    }

    /// Rank of this process.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Number of processes.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Number of worker threads.
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Whether this is the first process.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::serial()
    }
}

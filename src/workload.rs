//! Cache-line pointer-chasing workload graph
//!
//! A cyclic doubly-linked structure carved from a contiguous arena of
//! cache-line-sized nodes. Links are stored as indices into the same arena
//! rather than raw addresses, which keeps the O(1) swap semantics while
//! avoiding pointer aliasing.
//!
//! Traversal is a chain of dependent loads: each step's address comes from
//! the previous step's result, so randomizing the link order defeats the
//! prefetcher and exposes raw memory latency.

use std::hint::black_box;

use log::debug;

use crate::domain::WorkloadError;

/// Fixed node size. Each traversal step touches exactly one cache line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Minimum cycle length required by the read-write workload (3 + 3 reads
/// must land on a node that is neither the start nor its neighbor).
pub const MIN_NODES: usize = 6;

/// One arena slot, padded to a full cache line by its alignment.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLineNode {
    next: u32,
    prev: u32,
}

const _: () = assert!(std::mem::size_of::<CacheLineNode>() == CACHE_LINE_SIZE);

/// Owns the backing arena for a [`PointerChase`].
///
/// Sized in bytes to mirror how the buffer is configured; sizes that are not
/// a whole multiple of the cache line are truncated down.
pub struct ChaseBuffer {
    nodes: Vec<CacheLineNode>,
}

impl ChaseBuffer {
    #[must_use]
    pub fn with_size_bytes(size: usize) -> Self {
        let n_nodes = size / CACHE_LINE_SIZE;
        debug!("pointer chase arena: {size} bytes, {n_nodes} nodes");
        ChaseBuffer { nodes: vec![CacheLineNode::default(); n_nodes] }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes_mut(&mut self) -> &mut [CacheLineNode] {
        &mut self.nodes
    }
}

/// Cyclic pointer-chase graph borrowing a caller-owned arena.
///
/// Invariant: the nodes always form exactly one cycle under `next`, and
/// `prev` is its inverse. Every mutating operation preserves this.
#[derive(Debug)]
pub struct PointerChase<'a> {
    nodes: &'a mut [CacheLineNode],
    cursor: usize,
}

impl<'a> PointerChase<'a> {
    /// Build the cycle in memory order: node `i` links to `i + 1 mod n`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::BufferTooSmall`] when the arena holds fewer
    /// than [`MIN_NODES`] nodes.
    pub fn linear(nodes: &'a mut [CacheLineNode]) -> Result<Self, WorkloadError> {
        let n = nodes.len();
        if n < MIN_NODES {
            return Err(WorkloadError::BufferTooSmall { nodes: n, min: MIN_NODES });
        }
        for i in 0..n {
            nodes[i].next = ((i + 1) % n) as u32;
            nodes[i].prev = ((n + i - 1) % n) as u32;
        }
        Ok(PointerChase { nodes, cursor: 0 })
    }

    /// Build the cycle, then permute it by swapping the position of node `i`
    /// with a generator-chosen node, for every `i`.
    ///
    /// The resulting permutation is whatever distribution this repeated
    /// self-swap yields; it is deliberately not replaced by a uniform
    /// shuffle so cache-behavior runs stay comparable.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::BufferTooSmall`] when the arena holds fewer
    /// than [`MIN_NODES`] nodes.
    pub fn random(
        nodes: &'a mut [CacheLineNode],
        mut generator: impl FnMut() -> u64,
    ) -> Result<Self, WorkloadError> {
        let mut chase = Self::linear(nodes)?;
        let n = chase.nodes.len();
        for i in 0..n {
            let j = (generator() as usize) % n;
            chase.swap_positions(i, j);
        }
        Ok(chase)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current traversal position (arena index).
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Advance the cursor `count` times through `next` and return the final
    /// position. Pure dependent loads; nothing else is touched.
    pub fn run_read_workload(&mut self, count: usize) -> usize {
        let mut cur = self.cursor;
        for _ in 0..count {
            cur = black_box(self.nodes[cur].next as usize);
        }
        self.cursor = cur;
        cur
    }

    /// Run `n_cycles` full laps around the cycle, each anchored at the
    /// current cursor. Returns the cursor, which is back at the anchor after
    /// every lap (and untouched for `n_cycles == 0`).
    pub fn run_workload_read_cyclic(&mut self, n_cycles: usize) -> usize {
        let start = self.cursor;
        for _ in 0..n_cycles {
            let mut cur = start;
            loop {
                cur = black_box(self.nodes[cur].next as usize);
                if cur == start {
                    break;
                }
            }
        }
        self.cursor
    }

    /// Mixed traffic: `count` times, read 3 nodes ahead to find a swap
    /// partner, read 3 more to find the next starting point, then swap the
    /// partner with the start. The two nodes are always 3 apart, so with
    /// `n >= 6` the non-adjacent swap applies.
    pub fn run_read_write_workload(&mut self, count: usize) -> usize {
        for _ in 0..count {
            let node1 = self.cursor;
            let node2 = self.advance(node1, 3);
            self.cursor = self.advance(node2, 3);
            self.swap_far(node1, node2);
        }
        self.cursor
    }

    /// Exchange the cycle positions of nodes `a` and `b` (not their arena
    /// slots) with O(1) pointer rewrites. Same-node swaps are a no-op.
    pub fn swap_positions(&mut self, a: usize, b: usize) {
        if self.nodes[a].prev as usize == b {
            self.swap_near(b, a);
        } else if self.nodes[a].next as usize == b {
            self.swap_near(a, b);
        } else if a != b {
            self.swap_far(a, b);
        }
    }

    fn advance(&self, mut idx: usize, steps: usize) -> usize {
        for _ in 0..steps {
            idx = self.nodes[idx].next as usize;
        }
        idx
    }

    // Adjacent swap, given n1.next == n2.
    fn swap_near(&mut self, n1: usize, n2: usize) {
        let n1_prev = self.nodes[n1].prev as usize;
        let n2_next = self.nodes[n2].next as usize;
        self.nodes[n1_prev].next = n2 as u32;
        self.nodes[n2_next].prev = n1 as u32;
        self.nodes[n1].prev = n2 as u32;
        self.nodes[n1].next = n2_next as u32;
        self.nodes[n2].next = n1 as u32;
        self.nodes[n2].prev = n1_prev as u32;
    }

    // Non-adjacent swap: each node takes the other's former neighbors.
    fn swap_far(&mut self, n1: usize, n2: usize) {
        let n1_prev = self.nodes[n1].prev as usize;
        let n1_next = self.nodes[n1].next as usize;
        let n2_prev = self.nodes[n2].prev as usize;
        let n2_next = self.nodes[n2].next as usize;
        self.nodes[n1_prev].next = n2 as u32;
        self.nodes[n1_next].prev = n2 as u32;
        self.nodes[n2_next].prev = n1 as u32;
        self.nodes[n2_prev].next = n1 as u32;
        self.nodes[n1].prev = n2_prev as u32;
        self.nodes[n1].next = n2_next as u32;
        self.nodes[n2].next = n1_next as u32;
        self.nodes[n2].prev = n1_prev as u32;
    }
}

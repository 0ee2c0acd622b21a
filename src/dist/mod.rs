//! Distributed ownership: chare-to-PE placement, the per-PE partitioner
//! branch, the global node renumbering, and the resulting work-units.

pub mod partitioner;
pub mod renumber;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Communication tag bases for the distribution phases. Each two-phase
/// exchange consumes a base and base+1.
pub(crate) mod tags {
    use crate::comm::communicator::CommTag;

    pub const CHARE_NODES: CommTag = CommTag::new(0x10);
    pub const QUERY: CommTag = CommTag::new(0x20);
    pub const MASK: CommTag = CommTag::new(0x22);
    pub const OFFSET: CommTag = CommTag::new(0x24);
    pub const REQUEST: CommTag = CommTag::new(0x26);
    pub const NEW_ORDER: CommTag = CommTag::new(0x28);
    pub const BOUNDS: CommTag = CommTag::new(0x2A);
    pub const PARTITION: CommTag = CommTag::new(0x30);
    pub const COST: CommTag = CommTag::new(0x36);
}

/// Half-open range `[lower, upper)` of linear node ids owned by a PE.
///
/// Ranges of all PEs are disjoint and cover `[0, nnew)`; the linear system
/// scales them by the component count.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RowRange {
    pub lower: u64,
    pub upper: u64,
}

impl RowRange {
    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        id >= self.lower && id < self.upper
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.upper - self.lower
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lower == self.upper
    }
}

/// Blockwise chare-to-PE placement.
///
/// Chare ids are distributed in linear contiguous order with the last PE
/// taking the remainder: for `nchare = 7`, `npes = 3` the placement is
/// PE0: 0 1, PE1: 2 3, PE2: 4 5 6.
#[derive(Copy, Clone, Debug)]
pub struct ChareDist {
    nchare: u64,
    npes: usize,
}

impl ChareDist {
    pub fn new(nchare: u64, npes: usize) -> Self {
        debug_assert!(nchare >= npes as u64, "at least one chare per PE");
        Self { nchare, npes }
    }

    /// Total number of chares.
    #[inline]
    pub fn nchare(&self) -> u64 {
        self.nchare
    }

    /// Chares per PE (all but the last).
    #[inline]
    pub fn chunk(&self) -> u64 {
        self.nchare / self.npes as u64
    }

    /// Owning PE of a chare.
    #[inline]
    pub fn pe_of(&self, chare: u64) -> usize {
        ((chare / self.chunk()) as usize).min(self.npes - 1)
    }

    /// Chare ids owned by a PE.
    pub fn owned_by(&self, pe: usize) -> Range<u64> {
        let from = self.chunk() * pe as u64;
        let till = if pe == self.npes - 1 {
            self.nchare
        } else {
            from + self.chunk()
        };
        from..till
    }
}

//! Welcome to `mau`!
//!
//! A resource allocator for one stage of a match-action pipeline. Given
//! the tables a compiler wants to place in a stage, it decides which
//! input crossbar bytes, hash matrix bits, RAMs, TCAMs, map-RAMs and
//! buses every table gets, or explains why the tables don't fit.
//!
//! The work happens in two steps per stage. The [`ixbar`] step runs
//! table by table and commits as it goes; the [`memories`] step sees
//! every table at once and may start over several times with a
//! different split of the RAM columns.

mod bits;
mod layout;
mod stage;

pub mod algo;
pub mod check;
pub mod helpe;
pub mod ixbar;
pub mod memories;

pub use crate::helpe::*;

use crate::{ixbar::TableIxbar, memories::MemUse};

/// Knobs of a [`StageAllocator`](algo::StageAllocator). The defaults
/// describe the reference hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocOptions {
    /// How far below its home row a resource may spill. Anything past
    /// [`MAX_OVERFLOW_ROWS`] is cut down to it.
    pub max_overflow_rows:      usize,
    /// RAM columns the match region starts with, before any retry
    /// moves the split.
    pub initial_match_columns:  usize,
    /// Mixed into the per-way hash seeds.
    pub hash_seed:              u64,
    /// Let tables share hash functions they are compatible with.
    pub allow_sharing:          bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            max_overflow_rows:      MAX_OVERFLOW_ROWS,
            initial_match_columns:  SRAM_COLUMNS,
            hash_seed:              0,
            allow_sharing:          true,
        }
    }
}

impl AllocOptions {
    /// Overflow distance the hardware can actually wire.
    #[inline(always)]
    pub fn overflow_rows(&self) -> usize {
        self.max_overflow_rows.min(MAX_OVERFLOW_ROWS)
    }
}

/// Everything one table got in its stage.
///
/// Memory is keyed by resource name: the table's own match RAMs go by
/// the table name, ternary indirection by `"{table}$tind"`, a gateway by
/// `"{table}$gw"`, attached resources by their own names. A resource
/// shared with other tables shows up, identically, in each of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableAlloc {
    pub name:           String,
    pub kind:           MatchKind,
    /// Logical table ids, one per ATCAM partition or d-left slice.
    pub logical_ids:    Vec<usize>,
    pub ixbar:          TableIxbar,
    pub memuse:         IndexMap<String, MemUse>,
}

/// The outcome of a successful stage allocation, tables in request order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageAlloc {
    pub stage:          usize,
    /// RAM columns the match region ended up with.
    pub match_columns:  usize,
    pub tables:         IndexMap<String, TableAlloc>,
}

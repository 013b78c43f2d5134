pub use std::{
    rc::Rc,
    collections::{HashMap, BTreeMap, BTreeSet, HashSet},
    hash::{Hash, Hasher},
    fmt,
    time::Instant,
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use rayon::prelude::*;
pub use indexmap::IndexMap;
pub use clap::{Parser, ValueEnum};
pub use log::{debug, info, trace, warn};

pub use crate::{
    AllocOptions, TableAlloc, StageAlloc,
    bits::*,
    layout::*,
};

//---START HARDWARE DIMENSIONS
// Everything the allocators know about the target lives here. The
// numbers describe a single pipeline stage.

pub const EXACT_GROUPS:             usize = 8;
pub const EXACT_BYTES_PER_GROUP:    usize = 16;
pub const TERNARY_GROUPS:           usize = 12;
pub const TERNARY_BYTES_PER_GROUP:  usize = 5;
/// Ternary groups come in even/odd pairs sharing one midbyte.
pub const BYTE_GROUPS:              usize = TERNARY_GROUPS / 2;
/// Position of the midbyte inside an 11-byte ternary byte group.
pub const MIDBYTE_POSITION:         usize = TERNARY_BYTES_PER_GROUP;

pub const HASH_TABLES:              usize = 16;
pub const HASH_TABLE_BYTES:         usize = 8;
pub const HASH_GROUPS:              usize = 8;
pub const HASH_INDEX_GROUPS:        usize = 4;
pub const HASH_INDEX_BITS:          usize = 10;
pub const HASH_SINGLE_BITS:         usize = 12;
pub const HASH_SINGLE_BASE:         usize = HASH_INDEX_GROUPS * HASH_INDEX_BITS;
pub const HASH_MATRIX_SIZE:         usize = HASH_SINGLE_BASE + HASH_SINGLE_BITS;
pub const HASH_DIST_UNITS:          usize = 2;
pub const HASH_DIST_SLICES:         usize = 3;
pub const HASH_DIST_BITS:           usize = 16;
/// Owner name stamped on Galois matrix cells that must stay zero.
pub const COLLISION:                &str  = "$collision";

pub const SRAM_ROWS:                usize = 8;
pub const SRAM_COLUMNS:             usize = 10;
pub const LEFT_SIDE_COLUMNS:        usize = 4;
pub const RIGHT_SIDE_COLUMNS:       usize = SRAM_COLUMNS - LEFT_SIDE_COLUMNS;
pub const MAPRAM_COLUMNS:           usize = RIGHT_SIDE_COLUMNS;
pub const SRAM_DEPTH:               u64   = 1024;
pub const SRAM_WORD_BITS:           u32   = 128;

pub const TCAM_ROWS:                usize = 12;
pub const TCAM_COLUMNS:             usize = 2;
pub const TCAM_DEPTH:               u64   = 512;

pub const BUS_COUNT:                usize = 2;
pub const PAYLOAD_COUNT:            usize = 2;
pub const TIND_BUSES:               usize = 2;
pub const GATEWAYS_PER_ROW:         usize = 2;
pub const IDLETIME_BUSES:           usize = 2;

pub const MAX_OVERFLOW_ROWS:        usize = 6;
pub const TABLES_MAX:               usize = 16;
pub const TERNARY_TABLES_MAX:       usize = 8;
pub const MAX_WAYS:                 usize = HASH_INDEX_GROUPS;
/// Meter RAMs covered by a single color map-RAM.
pub const METER_RAMS_PER_COLOR_MAP: usize = 4;
//---END HARDWARE DIMENSIONS

/// A physical RAM address inside the SRAM, map-RAM or TCAM arrays.
pub type RamCell = (usize, usize);

/// Which half of the SRAM array a column belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Right, Side::Left];

    #[inline(always)]
    pub fn of_column(col: usize) -> Self {
        if col < LEFT_SIDE_COLUMNS { Side::Left } else { Side::Right }
    }

    #[inline(always)]
    pub fn columns(self) -> std::ops::Range<usize> {
        match self {
            Side::Left  => 0..LEFT_SIDE_COLUMNS,
            Side::Right => LEFT_SIDE_COLUMNS..SRAM_COLUMNS,
        }
    }

    #[inline(always)]
    pub fn other(self) -> Self {
        match self {
            Side::Left  => Side::Right,
            Side::Right => Side::Left,
        }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        match self {
            Side::Left  => 0,
            Side::Right => 1,
        }
    }
}

/// Column of the map-RAM paired with a right-half SRAM column.
#[inline(always)]
pub fn mapram_column(sram_col: usize) -> usize {
    debug_assert!(sram_col >= LEFT_SIDE_COLUMNS, "Map-RAMs only exist on the right half");
    sram_col - LEFT_SIDE_COLUMNS
}

#[inline(always)]
pub fn ceil_div(a: u64, b: u64) -> u64 {
    debug_assert!(b > 0);
    (a + b - 1) / b
}

/// Smallest `n` such that `2^n >= v`.
#[inline(always)]
pub fn ceil_log2(v: u64) -> u32 {
    if v <= 1 { 0 } else { 64 - (v - 1).leading_zeros() }
}

/// The phase of memory allocation that gave up. The global retry loop
/// uses it to decide which way the match/attached column split moves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemPhase {
    /// Exact, ATCAM and ternary-indirection placement.
    Match,
    /// Switchbox users, idle-time and color maps.
    Attached,
    /// Anything a different column split cannot fix.
    Fixed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Every way a stage allocation can fail without the allocator
/// itself being broken. The message is a diagnostic for humans;
/// callers only branch on the variant.
pub enum AllocError {
    #[error("{table}: crossbar exhausted ({reason})")]
    Crossbar { table: String, reason: String },
    #[error("{table}: no hash function available ({reason})")]
    Hash { table: String, reason: String },
    #[error("{table}: no hash distribution unit available ({reason})")]
    HashDist { table: String, reason: String },
    #[error("{reason}")]
    Memory { phase: MemPhase, reason: String },
    #[error("{table}: invalid layout ({reason})")]
    Layout { table: String, reason: String },
}

impl AllocError {
    pub fn memory(phase: MemPhase, reason: impl Into<String>) -> Self {
        AllocError::Memory { phase, reason: reason.into() }
    }

    /// Resource-pressure failures at the crossbar level are worth a
    /// second attempt with different placement parameters.
    pub fn is_crossbar_level(&self) -> bool {
        matches!(self, AllocError::Crossbar { .. } | AllocError::Hash { .. })
    }
}

pub type AllocResult<T> = Result<T, AllocError>;

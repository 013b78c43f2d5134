//! Bit-level bookkeeping shared by both allocators: a small fixed-size
//! bit set, an inclusive-exclusive bit range and a named 2-D array.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not, Range};

/// A set of up to 64 small integers. Every resource the allocators
/// track bit-wise (hash output bits, hash tables, columns of a row)
/// fits comfortably.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bitvec(pub u64);

impl Bitvec {
    pub const EMPTY: Bitvec = Bitvec(0);

    #[inline(always)]
    pub fn bit(b: usize) -> Self {
        debug_assert!(b < 64);
        Bitvec(1 << b)
    }

    /// All bits in `r`.
    #[inline(always)]
    pub fn range(r: Range<usize>) -> Self {
        debug_assert!(r.end <= 64);
        if r.start >= r.end {
            return Self::EMPTY;
        }
        let width = r.end - r.start;
        let ones = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        Bitvec(ones << r.start)
    }

    #[inline(always)]
    pub fn get(&self, b: usize) -> bool {
        b < 64 && (self.0 >> b) & 1 == 1
    }

    #[inline(always)]
    pub fn set(&mut self, b: usize) {
        self.0 |= 1 << b;
    }

    #[inline(always)]
    pub fn clear(&mut self, b: usize) {
        self.0 &= !(1 << b);
    }

    #[inline(always)]
    pub fn popcount(&self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn intersects(&self, other: Bitvec) -> bool {
        self.0 & other.0 != 0
    }

    #[inline(always)]
    pub fn contains(&self, other: Bitvec) -> bool {
        self.0 & other.0 == other.0
    }

    /// Lowest set bit, if any.
    #[inline(always)]
    pub fn ffs(&self) -> Option<usize> {
        if self.0 == 0 { None } else { Some(self.0.trailing_zeros() as usize) }
    }

    /// Iterates the set bits in increasing order.
    pub fn iter(&self) -> BitIter {
        BitIter(self.0)
    }

    /// Keeps only the `n` lowest set bits.
    pub fn lowest(&self, n: usize) -> Self {
        self.iter().take(n).fold(Bitvec::EMPTY, |acc, b| acc | Bitvec::bit(b))
    }
}

pub struct BitIter(u64);

impl Iterator for BitIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            let b = self.0.trailing_zeros() as usize;
            self.0 &= self.0 - 1;
            Some(b)
        }
    }
}

impl FromIterator<usize> for Bitvec {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut res = Bitvec::EMPTY;
        for b in iter {
            res.set(b);
        }
        res
    }
}

impl BitOr for Bitvec {
    type Output = Bitvec;
    fn bitor(self, rhs: Bitvec) -> Bitvec {
        Bitvec(self.0 | rhs.0)
    }
}

impl BitAnd for Bitvec {
    type Output = Bitvec;
    fn bitand(self, rhs: Bitvec) -> Bitvec {
        Bitvec(self.0 & rhs.0)
    }
}

impl Not for Bitvec {
    type Output = Bitvec;
    fn not(self) -> Bitvec {
        Bitvec(!self.0)
    }
}

impl std::ops::BitOrAssign for Bitvec {
    fn bitor_assign(&mut self, rhs: Bitvec) {
        self.0 |= rhs.0;
    }
}

impl std::ops::Sub for Bitvec {
    type Output = Bitvec;
    fn sub(self, rhs: Bitvec) -> Bitvec {
        Bitvec(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Bitvec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        // Print runs as `lo..hi` so hash masks stay readable.
        let mut first = true;
        let mut bits = self.iter().peekable();
        while let Some(lo) = bits.next() {
            let mut hi = lo;
            while bits.peek() == Some(&(hi + 1)) {
                hi += 1;
                bits.next();
            }
            if !first { write!(f, ",")?; }
            first = false;
            if hi == lo { write!(f, "{lo}")?; } else { write!(f, "{lo}..{hi}")?; }
        }
        write!(f, "}}")
    }
}

/// A run of consecutive bits `[lo, hi)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitRange {
    pub lo: usize,
    pub hi: usize,
}

impl BitRange {
    #[inline(always)]
    pub fn new(lo: usize, hi: usize) -> Self {
        debug_assert!(lo <= hi, "Inverted bit range");
        Self { lo, hi }
    }

    #[inline(always)]
    pub fn width(&self) -> usize {
        self.hi - self.lo
    }

    #[inline(always)]
    pub fn overlaps(&self, other: &BitRange) -> bool {
        self.lo < other.hi && other.lo < self.hi
    }

    #[inline(always)]
    pub fn mask(&self) -> Bitvec {
        Bitvec::range(self.lo..self.hi)
    }
}

impl fmt::Display for BitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.lo, self.hi)
    }
}

/// A `rows × cols` array of optional owners. The memory and crossbar
/// state is made of these, so `Display` draws them as a map.
#[derive(Clone, PartialEq, Eq)]
pub struct Alloc2D<T> {
    name:   &'static str,
    rows:   usize,
    cols:   usize,
    data:   Vec<Option<T>>,
}

impl<T: Clone> Alloc2D<T> {
    pub fn new(name: &'static str, rows: usize, cols: usize) -> Self {
        Self {
            name,
            rows,
            cols,
            data: vec![None; rows * cols],
        }
    }

    #[inline(always)]
    pub fn rows(&self) -> usize { self.rows }

    #[inline(always)]
    pub fn cols(&self) -> usize { self.cols }

    #[inline(always)]
    fn idx(&self, row: usize, col: usize) -> usize {
        assert!(row < self.rows && col < self.cols,
            "{}[{}][{}] out of bounds", self.name, row, col);
        row * self.cols + col
    }

    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        self.data[self.idx(row, col)].as_ref()
    }

    #[inline(always)]
    pub fn is_free(&self, row: usize, col: usize) -> bool {
        self.get(row, col).is_none()
    }

    /// Claims a cell. Claiming an occupied cell is an allocator bug.
    #[inline(always)]
    pub fn claim(&mut self, row: usize, col: usize, owner: T) {
        let i = self.idx(row, col);
        assert!(self.data[i].is_none(), "{}[{}][{}] claimed twice", self.name, row, col);
        self.data[i] = Some(owner);
    }

    /// Sets a cell whether or not it's occupied.
    #[inline(always)]
    pub fn set(&mut self, row: usize, col: usize, owner: Option<T>) {
        let i = self.idx(row, col);
        self.data[i] = owner;
    }

    /// Bitvec of the free cells in `row`.
    pub fn free_in_row(&self, row: usize) -> Bitvec {
        (0..self.cols).filter(|&c| self.is_free(row, c)).collect()
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|c| *c = None);
    }

    /// Every occupied `(row, col, owner)`.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, usize, &T)> + '_ {
        self.data.iter()
            .enumerate()
            .filter_map(move |(i, c)| c.as_ref().map(|o| (i / self.cols, i % self.cols, o)))
    }
}

impl<T: Clone + fmt::Display> fmt::Display for Alloc2D<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First pass: find a column width that fits every owner.
        let width = self.data.iter()
            .flatten()
            .map(|o| o.to_string().len())
            .max()
            .unwrap_or(1)
            .max(2);
        writeln!(f, "{}:", self.name)?;
        for r in (0..self.rows).rev() {
            write!(f, "{r:>3} |")?;
            for c in 0..self.cols {
                match self.get(r, c) {
                    Some(o) => write!(f, " {:<width$}", o.to_string())?,
                    None    => write!(f, " {:<width$}", ".")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for Alloc2D<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.name)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("occupied", &self.data.iter().filter(|c| c.is_some()).count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitvec_range_and_iter() {
        let b = Bitvec::range(3..7);
        assert_eq!(b.popcount(), 4);
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(b.ffs(), Some(3));
        assert!(Bitvec::range(5..5).is_empty());
        assert_eq!(Bitvec::range(0..64).popcount(), 64);
    }

    #[test]
    fn test_bitvec_lowest() {
        let b = Bitvec::bit(1) | Bitvec::bit(4) | Bitvec::bit(9);
        assert_eq!(b.lowest(2), Bitvec::bit(1) | Bitvec::bit(4));
        assert_eq!(b.lowest(10), b);
    }

    #[test]
    fn test_bitvec_debug_runs() {
        let b = Bitvec::range(0..4) | Bitvec::bit(8);
        assert_eq!(format!("{b:?}"), "{0..3,8}");
    }

    #[test]
    fn test_bit_range_overlap() {
        let a = BitRange::new(0, 10);
        assert!(a.overlaps(&BitRange::new(9, 12)));
        assert!(!a.overlaps(&BitRange::new(10, 20)));
        assert_eq!(a.mask(), Bitvec::range(0..10));
    }

    #[test]
    fn test_alloc2d_claim_and_free() {
        let mut a: Alloc2D<String> = Alloc2D::new("sram", 2, 3);
        a.claim(1, 2, "t".to_string());
        assert!(!a.is_free(1, 2));
        assert_eq!(a.free_in_row(1), Bitvec::range(0..2));
        assert_eq!(a.occupied().count(), 1);
        a.clear();
        assert!(a.is_free(1, 2));
    }

    #[test]
    #[should_panic(expected = "claimed twice")]
    fn test_alloc2d_double_claim_panics() {
        let mut a: Alloc2D<u32> = Alloc2D::new("tcam", 1, 1);
        a.claim(0, 0, 1);
        a.claim(0, 0, 2);
    }
}

//! The Galois hash matrix and the eight hash functions built on it.
//!
//! Every hash table (64 crossbar input bits) has one matrix column per
//! hash output bit. A hash function XORs a set of hash tables, so output
//! bit `b` of function `F` is only correct when, for every table in `F`,
//! the column `b` holds exactly what the owner of `F[b]` programmed there.
//! Cells that must stay zero for someone else's sake are stamped with
//! [`COLLISION`]; they can be shared by anyone who also wants a zero, but
//! never handed to a table that needs to program them.

use crate::helpe::*;

#[derive(Clone, PartialEq, Eq)]
pub struct HashMatrix {
    /// `galois[hash table][output bit]`.
    galois:         Alloc2D<String>,
    /// `function_use[function][output bit]`.
    function_use:   Alloc2D<String>,
    /// Hash tables XORed by every function.
    function_tables:[Bitvec; HASH_GROUPS],
    /// Whether tables may join a function already in use.
    sharing:        bool,
}

/// A function chosen for a request plus the bits picked inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashChoice {
    pub function:       usize,
    pub index_groups:   Vec<usize>,
    pub select:         Bitvec,
    /// Every output bit that gets reserved.
    pub bits:           Bitvec,
    /// The function already served other tables.
    pub shared:         bool,
}

/// All 52 output bits.
#[inline(always)]
pub fn all_hash_bits() -> Bitvec {
    Bitvec::range(0..HASH_MATRIX_SIZE)
}

#[inline(always)]
pub fn index_group_bits(i: usize) -> Bitvec {
    Bitvec::range(i * HASH_INDEX_BITS..(i + 1) * HASH_INDEX_BITS)
}

#[inline(always)]
pub fn select_bits() -> Bitvec {
    Bitvec::range(HASH_SINGLE_BASE..HASH_MATRIX_SIZE)
}

impl Default for HashMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl HashMatrix {
    pub fn new() -> Self {
        Self {
            galois:         Alloc2D::new("galois", HASH_TABLES, HASH_MATRIX_SIZE),
            function_use:   Alloc2D::new("hash_function", HASH_GROUPS, HASH_MATRIX_SIZE),
            function_tables:[Bitvec::EMPTY; HASH_GROUPS],
            sharing:        true,
        }
    }

    /// With sharing off every table gets a function of its own.
    pub fn set_sharing(&mut self, on: bool) {
        self.sharing = on;
    }

    #[inline(always)]
    pub fn sharing(&self) -> bool {
        self.sharing
    }

    /// Whether every reserved bit of `f` belongs to one of `owners`.
    pub fn owned_only_by(&self, f: usize, owners: &[&str]) -> bool {
        self.function_use.occupied()
            .filter(|(row, ..)| *row == f)
            .all(|(_, _, o)| owners.contains(&o.as_str()))
    }

    pub fn clear(&mut self) {
        self.galois.clear();
        self.function_use.clear();
        self.function_tables = [Bitvec::EMPTY; HASH_GROUPS];
    }

    #[inline(always)]
    pub fn function_tables(&self, f: usize) -> Bitvec {
        self.function_tables[f]
    }

    #[inline(always)]
    pub fn owner(&self, f: usize, bit: usize) -> Option<&str> {
        self.function_use.get(f, bit).map(String::as_str)
    }

    #[inline(always)]
    pub fn galois(&self, table: usize, bit: usize) -> Option<&str> {
        self.galois.get(table, bit).map(String::as_str)
    }

    /// Output bits of `f` nobody owns.
    pub fn free_function_bits(&self, f: usize) -> Bitvec {
        self.function_use.free_in_row(f) & all_hash_bits()
    }

    /// Output bits whose matrix column in hash table `t` is untouched.
    pub fn table_free_bits(&self, t: usize) -> Bitvec {
        self.galois.free_in_row(t) & all_hash_bits()
    }

    /// Hash tables any function reads.
    pub fn tables_in_use(&self) -> Bitvec {
        self.function_tables.iter().fold(Bitvec::EMPTY, |acc, t| acc | *t)
    }

    #[inline(always)]
    fn zero_ok(&self, t: usize, b: usize) -> bool {
        match self.galois(t, b) {
            None    => true,
            Some(o) => o == COLLISION,
        }
    }

    /// Adding hash tables `tables` to `f` forces zeros into the new
    /// tables under every bit `f` already serves.
    pub fn can_extend(&self, f: usize, tables: Bitvec) -> bool {
        let added = tables - self.function_tables[f];
        let used = all_hash_bits() - self.free_function_bits(f);
        added.iter().all(|t| used.iter().all(|b| self.zero_ok(t, b)))
    }

    /// Whether output bit `b` of `f` can be programmed over `tables`.
    pub fn bit_available(&self, f: usize, b: usize, tables: Bitvec) -> bool {
        if self.function_use.get(f, b).is_some() {
            return false;
        }
        if tables.iter().any(|t| self.galois(t, b).is_some()) {
            return false;
        }
        (self.function_tables[f] - tables).iter().all(|t| self.zero_ok(t, b))
    }

    /// Every bit of `f` a request over `tables` could take.
    pub fn available_bits(&self, f: usize, tables: Bitvec) -> Bitvec {
        if !self.can_extend(f, tables) {
            return Bitvec::EMPTY;
        }
        (0..HASH_MATRIX_SIZE)
            .filter(|b| self.bit_available(f, *b, tables))
            .collect()
    }

    /// Free index groups and free select bits left for a request
    /// touching `tables`, judged by the matrix columns alone. Used to
    /// steer crossbar group choice before a function is picked.
    pub fn column_capacity(&self, tables: Bitvec) -> (usize, usize) {
        let free = tables.iter().fold(all_hash_bits(), |acc, t| acc & self.table_free_bits(t));
        let groups = (0..HASH_INDEX_GROUPS)
            .filter(|i| free.contains(index_group_bits(*i)))
            .count();

        (groups, (free & select_bits()).popcount())
    }

    /// Picks bits out of `avail` for `req`, lowest first.
    fn pick_bits(avail: Bitvec, req: &HashMatrixRequirement) -> Option<(Vec<usize>, Bitvec)> {
        let groups: Vec<usize> = (0..HASH_INDEX_GROUPS)
            .filter(|i| avail.contains(index_group_bits(*i)))
            .take(req.total_index_groups())
            .collect();
        if groups.len() < req.total_index_groups() {
            return None;
        }
        let select = (avail & select_bits()).lowest(req.select_bits);
        if select.popcount() < req.select_bits {
            return None;
        }

        Some((groups, select))
    }

    /// Chooses a hash function for a request over hash tables `tables`.
    ///
    /// Functions already reading some of the same hash tables are tried
    /// first, most free bits first, so that compatible tables share.
    /// Then untouched functions, preferring ones whose tables are not
    /// read by anybody else. Ties go to the lower function.
    pub fn get_hash_group(
        &self,
        table:  &str,
        req:    &HashMatrixRequirement,
        tables: Bitvec,
    ) -> AllocResult<HashChoice> {
        let in_use = self.tables_in_use();
        let sharing = (0..HASH_GROUPS)
            .filter(|f| self.sharing && self.function_tables[*f].intersects(tables))
            .map(|f| (f, self.available_bits(f, tables)))
            .sorted_by_key(|(f, avail)| (std::cmp::Reverse(avail.popcount()), *f));
        let fresh = (0..HASH_GROUPS)
            .filter(|f| self.function_tables[*f].is_empty() && self.free_function_bits(*f) == all_hash_bits())
            .sorted_by_key(|f| (in_use.intersects(tables), *f))
            .map(|f| (f, self.available_bits(f, tables)));

        for (f, avail) in sharing.chain(fresh) {
            if req.max {
                // Everything still programmable in the function.
                if let Some((index_groups, select)) = Self::pick_bits(avail, req) {
                    trace!("{table}: hash function {f} reserved {avail:?}");
                    return Ok(HashChoice {
                        function:   f,
                        index_groups,
                        select,
                        bits:       avail,
                        shared:     !self.function_tables[f].is_empty(),
                    });
                }
                continue;
            }
            if let Some((index_groups, select)) = Self::pick_bits(avail, req) {
                let bits = index_groups.iter()
                    .fold(select, |acc, i| acc | index_group_bits(*i));
                let shared = !self.function_tables[f].is_empty();
                trace!("{table}: hash function {f} bits {bits:?} (shared: {shared})");
                return Ok(HashChoice { function: f, index_groups, select, bits, shared });
            }
        }

        Err(AllocError::Hash {
            table:  table.to_string(),
            reason: format!(
                "{} index groups and {} select bits over hash tables {:?}",
                req.total_index_groups(), req.select_bits, tables
            ),
        })
    }

    /// Reserves `bits` of `f` for `owner`, reading `tables`. Fails with
    /// the offending bits, leaving the matrix untouched, when any of
    /// them can't be programmed.
    pub fn try_reserve(
        &mut self,
        f:      usize,
        tables: Bitvec,
        bits:   Bitvec,
        owner:  &str,
    ) -> Result<(), Bitvec> {
        let bad: Bitvec = if self.can_extend(f, tables) {
            bits.iter().filter(|b| !self.bit_available(f, *b, tables)).collect()
        } else {
            bits
        };
        if !bad.is_empty() {
            return Err(bad);
        }
        self.reserve(f, tables, bits, owner);

        Ok(())
    }

    /// Commits a reservation already known to be legal, then stamps
    /// [`COLLISION`] on every matrix cell that has to stay zero.
    pub fn reserve(&mut self, f: usize, tables: Bitvec, bits: Bitvec, owner: &str) {
        debug_assert!(self.can_extend(f, tables), "Illegal hash function extension");
        let old_tables = self.function_tables[f];
        let old_bits = all_hash_bits() - self.free_function_bits(f);
        for b in bits.iter() {
            debug_assert!(self.bit_available(f, b, tables), "Hash bit {b} of function {f} taken");
            self.function_use.claim(f, b, owner.to_string());
            for t in tables.iter() {
                self.galois.claim(t, b, owner.to_string());
            }
            // Tables of the function we don't read must not disturb our bits.
            for t in (old_tables - tables).iter() {
                if self.galois(t, b).is_none() {
                    self.galois.claim(t, b, COLLISION.to_string());
                }
            }
        }
        // Tables we bring in must not disturb the bits already served.
        for t in (tables - old_tables).iter() {
            for b in old_bits.iter() {
                if self.galois(t, b).is_none() {
                    self.galois.claim(t, b, COLLISION.to_string());
                }
            }
        }
        self.function_tables[f] = old_tables | tables;
    }

    /// `(function, bit, owner)` of every reserved output bit.
    pub fn function_bits(&self) -> impl Iterator<Item = (usize, usize, &String)> + '_ {
        self.function_use.occupied()
    }

    pub fn galois_cells(&self) -> impl Iterator<Item = (usize, usize, &String)> + '_ {
        self.galois.occupied()
    }
}

impl fmt::Debug for HashMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMatrix")
            .field("function_tables", &self.function_tables)
            .field("galois", &self.galois)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(index_groups: usize, select_bits: usize) -> HashMatrixRequirement {
        HashMatrixRequirement { index_groups, select_bits, proxy_groups: 0, max: false }
    }

    #[test]
    fn test_first_table_gets_function_zero() {
        let hm = HashMatrix::new();
        let c = hm.get_hash_group("t", &req(1, 2), Bitvec::bit(0)).unwrap();
        assert_eq!(c.function, 0);
        assert_eq!(c.index_groups, vec![0]);
        assert_eq!(c.select, Bitvec::range(40..42));
        assert!(!c.shared);
    }

    #[test]
    fn test_overlapping_tables_share_function() {
        let mut hm = HashMatrix::new();
        let a = hm.get_hash_group("a", &req(1, 0), Bitvec::bit(0)).unwrap();
        hm.reserve(a.function, Bitvec::bit(0), a.bits, "a");
        let b = hm.get_hash_group("b", &req(1, 0), Bitvec::bit(0) | Bitvec::bit(1)).unwrap();
        assert_eq!(b.function, 0);
        assert!(b.shared);
        assert_eq!(b.index_groups, vec![1]);
    }

    #[test]
    fn test_collision_blocks_third_table() {
        let mut hm = HashMatrix::new();
        hm.reserve(0, Bitvec::bit(0), index_group_bits(0), "a");
        hm.reserve(0, Bitvec::bit(0) | Bitvec::bit(1), index_group_bits(1), "b");
        // `b` pulled hash table 1 into function 0: its column under `a`'s
        // bits has to stay zero.
        for bit in index_group_bits(0).iter() {
            assert_eq!(hm.galois(1, bit), Some(COLLISION));
        }
        // Nobody reading hash table 1 may program those bits anywhere.
        assert_eq!(
            hm.try_reserve(1, Bitvec::bit(1), index_group_bits(0), "c"),
            Err(index_group_bits(0)),
        );
        assert!(hm.try_reserve(1, Bitvec::bit(1), index_group_bits(2), "c").is_ok());
    }

    #[test]
    fn test_extension_blocked_by_programmed_column() {
        let mut hm = HashMatrix::new();
        hm.reserve(0, Bitvec::bit(0), index_group_bits(0), "a");
        hm.reserve(1, Bitvec::bit(1), index_group_bits(0), "b");
        // Function 0 can't take table 1: `b` programs table 1 under
        // bits `a` relies on.
        assert!(!hm.can_extend(0, Bitvec::bit(1)));
        assert_eq!(hm.available_bits(0, Bitvec::bit(0) | Bitvec::bit(1)), Bitvec::EMPTY);
    }

    #[test]
    fn test_max_requirement_takes_everything_left() {
        let mut hm = HashMatrix::new();
        hm.reserve(0, Bitvec::bit(0), index_group_bits(0), "a");
        let c = hm.get_hash_group("b", &req(1, 1).maximal(), Bitvec::bit(0)).unwrap();
        assert_eq!(c.function, 0);
        assert!(c.shared);
        assert_eq!(c.bits, all_hash_bits() - index_group_bits(0));
        assert_eq!(c.index_groups, vec![1]);
    }

    #[test]
    fn test_sharing_off_takes_next_function() {
        let mut hm = HashMatrix::new();
        hm.set_sharing(false);
        hm.reserve(0, Bitvec::bit(0), index_group_bits(0), "a");
        let c = hm.get_hash_group("b", &req(1, 0), Bitvec::bit(0)).unwrap();
        assert_eq!(c.function, 1);
        assert!(!c.shared);
    }

    #[test]
    fn test_exhaustion() {
        let hm = HashMatrix::new();
        let err = hm.get_hash_group("t", &req(5, 0), Bitvec::bit(0)).unwrap_err();
        assert!(matches!(err, AllocError::Hash { .. }));
    }
}

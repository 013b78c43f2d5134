//! Hash distribution: 16-bit windows of a hash function routed to
//! addresses of hash-action tables and hash-addressed resources.

use super::IXBar;
use crate::helpe::*;

/// One hash distribution unit slot and the hash bits feeding it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashDistUse {
    pub unit:       usize,
    pub slice:      usize,
    pub function:   usize,
    pub bits:       BitRange,
    /// The resource addressed.
    pub owner:      String,
}

/// Function bits read by slot `slice`.
#[inline(always)]
pub fn slice_window(slice: usize) -> BitRange {
    BitRange::new(slice * HASH_DIST_BITS, (slice + 1) * HASH_DIST_BITS)
}

impl IXBar {
    /// Units and hash bits for `slices` address slices of `owner`,
    /// hashed over `tables`. A resource already addressed, because it's
    /// shared with an earlier table, gets its first assignment back.
    pub fn alloc_hash_dist(
        &mut self,
        table:  &str,
        owner:  &str,
        tables: Bitvec,
        slices: usize,
    ) -> AllocResult<Vec<HashDistUse>> {
        if let Some(prev) = self.dist_records.get(owner) {
            trace!("{table}: hash distribution of {owner} already in place");
            return Ok(prev.clone());
        }
        let fail = |reason: String| AllocError::HashDist { table: table.to_string(), reason };
        if slices > HASH_DIST_SLICES {
            return Err(fail(format!("{owner} needs {slices} slices")));
        }

        // Functions already reading these tables go first. Without
        // sharing only functions this table alone uses are eligible.
        let functions = (0..HASH_GROUPS)
            .filter(|f| self.hash.sharing() || self.hash.owned_only_by(*f, &[table, owner]))
            .sorted_by_key(|f| (!self.hash.function_tables(*f).intersects(tables), *f))
            .collect_vec();
        let mut planned: Vec<HashDistUse> = vec![];
        for (unit, slice) in (0..HASH_DIST_UNITS).cartesian_product(0..HASH_DIST_SLICES) {
            if planned.len() == slices {
                break;
            }
            if !self.hash_dist_use.is_free(unit, slice) {
                continue;
            }
            // Slices of one address come from one function.
            let window = slice_window(slice);
            let candidates = match planned.first() {
                Some(p) => vec![p.function],
                None    => functions.clone(),
            };
            let function = candidates.into_iter().find(|f| {
                let avail = self.hash.available_bits(*f, tables);
                avail.contains(window.mask())
                    && planned.iter().all(|p| !p.bits.overlaps(&window))
            });
            if let Some(function) = function {
                planned.push(HashDistUse {
                    unit,
                    slice,
                    function,
                    bits:   window,
                    owner:  owner.to_string(),
                });
            }
        }
        if planned.len() < slices {
            return Err(fail(format!(
                "{owner}: {} of {slices} slices over hash tables {tables:?}", planned.len()
            )));
        }

        for p in &planned {
            self.hash_dist_use.claim(p.unit, p.slice, owner.to_string());
            self.hash.reserve(p.function, tables, p.bits.mask(), owner);
        }
        debug!("{table}: {owner} addressed through {:?}",
            planned.iter().map(|p| (p.unit, p.slice, p.function)).collect_vec());
        self.dist_records.insert(owner.to_string(), planned.clone());

        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ixbar::hash;

    #[test]
    fn test_window_avoids_way_bits() {
        let mut ix = IXBar::new(0, 0);
        ix.hash.reserve(0, Bitvec::bit(0), hash::index_group_bits(0), "t");
        let d = ix.alloc_hash_dist("t", "cnt", Bitvec::bit(0), 1).unwrap();
        assert_eq!(d.len(), 1);
        // Function 0 is tried first; bits 0..16 clash with the way.
        assert_eq!(d[0].function, 0);
        assert_eq!(d[0].slice, 1);
        assert_eq!(d[0].bits, BitRange::new(16, 32));
        assert_eq!(ix.hash.owner(0, 20), Some("cnt"));
    }

    #[test]
    fn test_shared_resource_addressed_once() {
        let mut ix = IXBar::new(0, 0);
        let a = ix.alloc_hash_dist("a", "meter", Bitvec::bit(0), 1).unwrap();
        let b = ix.alloc_hash_dist("b", "meter", Bitvec::bit(0), 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(ix.hash_dist_use.occupied().count(), 1);
    }

    #[test]
    fn test_sharing_off_keeps_other_functions() {
        let dist = |sharing: bool| {
            let mut ix = IXBar::new(0, 0);
            ix.hash.set_sharing(sharing);
            ix.hash.reserve(0, Bitvec::bit(0), hash::index_group_bits(3), "a");
            ix.alloc_hash_dist("h", "h", Bitvec::bit(0), 1).unwrap()
        };
        assert_eq!(dist(true)[0].function, 0);
        assert_eq!(dist(false)[0].function, 1);
    }

    #[test]
    fn test_sharing_off_keeps_own_function() {
        let mut ix = IXBar::new(0, 0);
        ix.hash.set_sharing(false);
        ix.hash.reserve(0, Bitvec::bit(0), hash::index_group_bits(0), "t");
        let d = ix.alloc_hash_dist("t", "cnt", Bitvec::bit(0), 1).unwrap();
        assert_eq!(d[0].function, 0);
        assert_eq!(d[0].slice, 1);
    }

    #[test]
    fn test_units_run_out() {
        let mut ix = IXBar::new(0, 0);
        for i in 0..HASH_DIST_UNITS * HASH_DIST_SLICES {
            let t = Bitvec::bit(2 * i);
            ix.alloc_hash_dist("t", &format!("r{i}"), t, 1).unwrap();
        }
        let err = ix.alloc_hash_dist("t", "late", Bitvec::bit(15), 1).unwrap_err();
        assert!(matches!(err, AllocError::HashDist { .. }));
    }

    #[test]
    fn test_wide_address_uses_one_function() {
        let mut ix = IXBar::new(0, 0);
        let d = ix.alloc_hash_dist("t", "big", Bitvec::bit(3), 2).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].function, d[1].function);
        assert!(!d[0].bits.overlaps(&d[1].bits));
        assert!(hash::all_hash_bits().contains(d[1].bits.mask()));
    }
}

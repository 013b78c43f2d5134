//! Byte placement on the crossbar.
//!
//! Groups are picked greedily. A first pass favours groups already
//! holding what the key needs; a second one only looks at room. The
//! number of groups a key may spread over starts at the smallest that
//! could hold it and grows until something fits.

use super::{hash, ByteLoc, BytePlacement, IXBar};
use crate::helpe::*;
use std::cmp::Reverse;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlacementMode {
    /// Reuse bytes already on the crossbar.
    Shared,
    /// Fresh bytes only, in groups whose hash tables nobody touched.
    Fresh,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pass {
    Reuse,
    Capacity,
}

type Plan = Vec<Option<BytePlacement>>;

impl IXBar {
    /// Smallest number of groups that could hold `reqs`.
    pub fn min_groups(reqs: &[ByteRequirement], ternary: bool) -> usize {
        let n = reqs.len() as u64;
        if !ternary {
            return ceil_div(n, EXACT_BYTES_PER_GROUP as u64).max(1) as usize;
        }
        let nibbles = reqs.iter().filter(|r| r.nibble.is_some()).count() as u64;
        let full = n - nibbles;
        ceil_div(full, TERNARY_BYTES_PER_GROUP as u64)
            .max(ceil_div(n, TERNARY_BYTES_PER_GROUP as u64 + 1))
            .max(1) as usize
    }

    #[inline(always)]
    fn loc(ternary: bool, group: usize, byte: usize) -> ByteLoc {
        if ternary { ByteLoc::Ternary { group, byte } } else { ByteLoc::Exact { group, byte } }
    }

    /// What `position % 4` is checked against.
    #[inline(always)]
    fn align_position(loc: ByteLoc) -> usize {
        match loc {
            ByteLoc::Exact { byte, .. } => byte,
            _                           => loc.byte_group_position().unwrap_or(0),
        }
    }

    /// The midbyte nibble read by ternary group `g`.
    #[inline(always)]
    fn half(g: usize) -> Nibble {
        if g % 2 == 0 { Nibble::Lo } else { Nibble::Hi }
    }

    /// Whether exact group `g` leaves its hash tables enough room.
    fn hash_compatible(&self, g: usize, hm: &HashMatrixRequirement, mode: PlacementMode) -> bool {
        let tables = Bitvec::bit(2 * g) | Bitvec::bit(2 * g + 1);
        if mode == PlacementMode::Fresh {
            let untouched = tables.iter()
                .all(|t| self.hash.table_free_bits(t) == hash::all_hash_bits());
            if !untouched || self.hash.tables_in_use().intersects(tables) {
                return false;
            }
        }
        if hm.is_empty() || hm.max {
            return true;
        }
        let (groups, select) = self.hash.column_capacity(tables);

        groups >= hm.total_index_groups() && select >= hm.select_bits
    }

    /// Where `req` already sits in group `g`.
    fn found_in_group(&self, g: usize, ternary: bool, req: &ByteRequirement) -> Option<ByteLoc> {
        let width = if ternary { TERNARY_BYTES_PER_GROUP } else { EXACT_BYTES_PER_GROUP };
        let main = (0..width)
            .map(|b| Self::loc(ternary, g, b))
            .find(|l| self.slot(*l).is_some_and(|s| s.key == req.key));
        if main.is_some() || !ternary || req.nibble != Some(Self::half(g)) {
            return main;
        }
        let mid = ByteLoc::Mid { byte_group: g / 2 };

        self.slot(mid).is_some_and(|s| s.key == req.key).then_some(mid)
    }

    #[inline(always)]
    fn open(&self, loc: ByteLoc, taken: &HashSet<ByteLoc>) -> bool {
        self.slot(loc).is_none() && !taken.contains(&loc)
    }

    /// Lowest free legal home for `req` in group `g`. Nibbles prefer
    /// the midbyte half the group reads; full bytes never go there.
    fn free_in_group(
        &self,
        g:          usize,
        ternary:    bool,
        req:        &ByteRequirement,
        taken:      &HashSet<ByteLoc>,
    ) -> Option<ByteLoc> {
        if ternary && req.nibble == Some(Self::half(g)) {
            let mid = ByteLoc::Mid { byte_group: g / 2 };
            if self.open(mid, taken) {
                return Some(mid);
            }
        }
        let width = if ternary { TERNARY_BYTES_PER_GROUP } else { EXACT_BYTES_PER_GROUP };

        (0..width)
            .map(|b| Self::loc(ternary, g, b))
            .find(|l| self.open(*l, taken) && req.allows(Self::align_position(*l)))
    }

    /// Free bytes left in group `g` for `pending`. The midbyte only
    /// counts when one of them is a nibble the group reads from it.
    fn room(
        &self,
        g:          usize,
        ternary:    bool,
        pending:    &[&ByteRequirement],
        taken:      &HashSet<ByteLoc>,
    ) -> usize {
        let width = if ternary { TERNARY_BYTES_PER_GROUP } else { EXACT_BYTES_PER_GROUP };
        let main = (0..width).filter(|b| self.open(Self::loc(ternary, g, *b), taken)).count();
        let mid = ternary
            && pending.iter().any(|r| r.nibble == Some(Self::half(g)))
            && self.open(ByteLoc::Mid { byte_group: g / 2 }, taken);

        main + mid as usize
    }

    #[inline(always)]
    fn place(req: &ByteRequirement, loc: ByteLoc, group: usize, reused: bool) -> BytePlacement {
        BytePlacement {
            key:    req.key.clone(),
            field:  req.field.clone(),
            loc,
            group,
            reused,
        }
    }

    /// Puts whatever still fits of `reqs` into group `g`. Range fields
    /// go in whole or not at all.
    fn fill_group(
        &self,
        g:          usize,
        ternary:    bool,
        reqs:       &[ByteRequirement],
        plan:       &mut Plan,
        taken:      &mut HashSet<ByteLoc>,
        mode:       PlacementMode,
    ) {
        let shared = mode == PlacementMode::Shared;
        let clusters: BTreeMap<u32, Vec<usize>> = reqs.iter()
            .enumerate()
            .filter(|(i, _)| plan[*i].is_none())
            .filter_map(|(i, r)| r.range_group.map(|rg| (rg, i)))
            .into_group_map()
            .into_iter()
            .collect();
        for members in clusters.values() {
            let mut local = taken.clone();
            let mut placed = vec![];
            for &i in members {
                let found = if shared { self.found_in_group(g, ternary, &reqs[i]) } else { None };
                let loc = match found {
                    Some(l) => Some((l, true)),
                    None    => self.free_in_group(g, ternary, &reqs[i], &local).map(|l| (l, false)),
                };
                match loc {
                    Some((l, reused)) => {
                        local.insert(l);
                        placed.push((i, l, reused));
                    },
                    None => {
                        placed.clear();
                        break;
                    },
                }
            }
            if placed.len() == members.len() {
                *taken = local;
                for (i, l, reused) in placed {
                    plan[i] = Some(Self::place(&reqs[i], l, g, reused));
                }
            }
        }

        let loose = (0..reqs.len()).filter(|i| reqs[*i].range_group.is_none()).collect_vec();
        if shared {
            for &i in &loose {
                if plan[i].is_some() {
                    continue;
                }
                if let Some(l) = self.found_in_group(g, ternary, &reqs[i]) {
                    taken.insert(l);
                    plan[i] = Some(Self::place(&reqs[i], l, g, true));
                }
            }
        }
        for &i in &loose {
            if plan[i].is_some() {
                continue;
            }
            if let Some(l) = self.free_in_group(g, ternary, &reqs[i], taken) {
                taken.insert(l);
                plan[i] = Some(Self::place(&reqs[i], l, g, false));
            }
        }
    }

    /// One attempt with at most `n` groups.
    fn fit(
        &self,
        reqs:       &[ByteRequirement],
        ternary:    bool,
        hm:         &HashMatrixRequirement,
        mode:       PlacementMode,
        n:          usize,
        pass:       Pass,
    ) -> Option<Vec<BytePlacement>> {
        let groups = if ternary { TERNARY_GROUPS } else { EXACT_GROUPS };
        let mut plan: Plan = vec![None; reqs.len()];
        let mut taken: HashSet<ByteLoc> = HashSet::new();
        let mut chosen: Vec<usize> = vec![];

        for _ in 0..n {
            let remaining = (0..reqs.len()).filter(|i| plan[*i].is_none()).collect_vec();
            if remaining.is_empty() {
                break;
            }
            let pending = remaining.iter().map(|i| &reqs[*i]).collect_vec();
            let best = (0..groups)
                .filter(|g| !chosen.contains(g))
                .filter(|g| ternary || self.hash_compatible(*g, hm, mode))
                .map(|g| {
                    let reuse = if mode == PlacementMode::Shared {
                        remaining.iter()
                            .filter(|i| self.found_in_group(g, ternary, &reqs[**i]).is_some())
                            .count()
                    } else {
                        0
                    };
                    (g, reuse, self.room(g, ternary, &pending, &taken))
                })
                .filter(|(_, reuse, room)| reuse + room > 0)
                .min_by_key(|(g, reuse, room)| match pass {
                    Pass::Reuse     => (Reverse(*reuse), Reverse(*room), *g),
                    Pass::Capacity  => (Reverse(0), Reverse(*room), *g),
                });
            let Some((g, ..)) = best else {
                break;
            };
            chosen.push(g);
            self.fill_group(g, ternary, reqs, &mut plan, &mut taken, mode);
        }

        plan.into_iter().collect()
    }

    /// Finds crossbar bytes for every requirement without committing
    /// anything. Fails atomically with [`AllocError::Crossbar`].
    pub fn find_alloc(
        &self,
        table:      &str,
        reqs:       &[ByteRequirement],
        ternary:    bool,
        hm:         &HashMatrixRequirement,
        mode:       PlacementMode,
    ) -> AllocResult<Vec<BytePlacement>> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        let max_groups = if ternary { TERNARY_GROUPS } else { EXACT_GROUPS };
        for n in Self::min_groups(reqs, ternary)..=max_groups {
            for pass in [Pass::Reuse, Pass::Capacity] {
                if let Some(res) = self.fit(reqs, ternary, hm, mode, n, pass) {
                    trace!("{table}: {} bytes in {n} groups ({pass:?} pass)", reqs.len());
                    return Ok(res);
                }
            }
        }

        Err(AllocError::Crossbar {
            table:  table.to_string(),
            reason: format!(
                "{} {} bytes over at most {} groups",
                reqs.len(), if ternary { "ternary" } else { "exact" }, max_groups
            ),
        })
    }
}

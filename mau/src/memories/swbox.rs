//! Resources reached through the switchbox: counters, meters, selectors,
//! stateful tables and action data.
//!
//! Rows are visited bottom-up in the physical sense (row 7 first), the
//! right half of a row before its left half. A resource starts on its
//! home row, where its ALU or action bus is, and may keep going on lower
//! rows through the overflow bus. Only one resource overflows at a time.

use super::{hold_bus, pick_bus, BusRef, GroupId, MemKind, MemRow, Memories, SramGroup};
use crate::helpe::*;
use std::cmp::Reverse;

impl Memories {
    /// One group per attached resource, however many tables share it.
    fn swbox_groups(&mut self) -> Vec<GroupId> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<(SramGroup, Option<String>)> = vec![];
        for t in self.tables() {
            let selector = t.req.attached.iter()
                .find(|a| a.kind == AttachedKind::Selector)
                .map(|a| a.name.clone());
            for a in &t.req.attached {
                if matches!(a.kind, AttachedKind::IdleTime { .. }) || a.total_rams() == 0 {
                    continue;
                }
                if !seen.insert(a.name.clone()) {
                    continue;
                }
                let g = SramGroup::new(t.name(), &a.name, MemKind::Attached(a.kind), a.total_rams());
                let sel = match a.kind {
                    AttachedKind::ActionData { .. } => selector.clone(),
                    _                               => None,
                };
                pending.push((g, sel));
            }
        }

        let ids = pending.iter()
            .map(|(g, _)| self.add_group(g.clone()))
            .collect_vec();
        for (id, (_, sel)) in ids.iter().zip(pending) {
            let Some(sel) = sel else { continue };
            let found = ids.iter().copied().find(|s| self.groups[*s].resource == sel);
            self.groups[*id].selector = found;
        }

        ids
    }

    /// Columns of `(row, side)` group `id` could take.
    fn swbox_free(&self, id: GroupId, row: usize, side: Side) -> Bitvec {
        let synth = self.groups[id].is_synth2port();
        if synth && side != Side::Right {
            return Bitvec::EMPTY;
        }
        let free = self.sram_use.free_in_row(row) & Bitvec::range(side.columns());
        if !synth {
            return free;
        }

        free.iter()
            .filter(|c| self.mapram_use.is_free(row, mapram_column(*c)))
            .collect()
    }

    #[inline(always)]
    fn overflow_ok(&self, row: usize, id: GroupId) -> bool {
        match self.overflow_bus.get(row, 0) {
            None    => true,
            Some(o) => *o == self.groups[id].resource,
        }
    }

    /// Whether `id` could get its home on `(row, side)`.
    fn start_ok(&self, id: GroupId, row: usize, side: Side) -> bool {
        let g = &self.groups[id];
        match g.kind {
            MemKind::Attached(AttachedKind::ActionData { .. }) => {
                if !self.action_bus.is_free(row, side.index()) {
                    return false;
                }
                match g.selector {
                    // After the selector, never above it.
                    Some(sel) => self.groups[sel].home.is_some_and(|(h, _)| row <= h),
                    None      => true,
                }
            },
            MemKind::Attached(k) if k.is_synth2port() => {
                let parity = if k.uses_meter_alu() { 1 } else { 0 };
                let stats = !matches!(k, AttachedKind::Counter { .. }) || self.stats_bus.is_free(row, 0);
                row % 2 == parity && self.alu_use.is_free(row, 0) && stats
            },
            _ => false,
        }
    }

    /// Everything `id` could reach if it started on `(row, side)`.
    fn reach_capacity(&self, id: GroupId, row: usize, side: Side) -> usize {
        let lowest = row.saturating_sub(self.max_overflow);
        let mut cap = self.swbox_free(id, row, side).popcount();
        if side == Side::Right && self.overflow_ok(row, id) {
            cap += self.swbox_free(id, row, Side::Left).popcount();
        }
        for r in lowest..row {
            if !self.overflow_ok(r, id) {
                continue;
            }
            cap += Side::ALL.iter().map(|s| self.swbox_free(id, r, *s).popcount()).sum::<usize>();
        }

        cap
    }

    /// `Some(free columns)` when `id` may be placed on `(row, side)` now.
    fn swbox_candidate(&self, id: GroupId, row: usize, side: Side, active: Option<GroupId>) -> Option<Bitvec> {
        let g = &self.groups[id];
        if g.left() == 0 {
            return None;
        }
        let free = self.swbox_free(id, row, side);
        if free.is_empty() {
            return None;
        }
        let left = g.left() as usize;
        match g.home {
            Some((home, home_side)) => {
                let legal = active == Some(id)
                    && row + self.max_overflow >= home
                    && ((row, side) == (home, home_side) || self.overflow_ok(row, id));
                legal.then_some(free)
            },
            None => {
                if !self.start_ok(id, row, side) {
                    return None;
                }
                if left > free.popcount()
                    && (active.is_some() || self.reach_capacity(id, row, side) < left)
                {
                    return None;
                }
                Some(free)
            },
        }
    }

    fn swbox_place(&mut self, id: GroupId, row: usize, side: Side, cols: Bitvec) {
        let owner = self.groups[id].resource.clone();
        let kind = self.groups[id].kind;
        let mut buses = vec![];
        match self.groups[id].home {
            None => {
                self.groups[id].home = Some((row, side));
                match kind {
                    MemKind::Attached(AttachedKind::ActionData { .. }) => {
                        self.action_bus.claim(row, side.index(), owner.clone());
                        buses.push(BusRef::Action(side));
                    },
                    MemKind::Attached(k) => {
                        self.alu_use.claim(row, 0, owner.clone());
                        if matches!(k, AttachedKind::Counter { .. }) {
                            self.stats_bus.claim(row, 0, owner.clone());
                            buses.push(BusRef::StatsAddr);
                        }
                    },
                    _ => unreachable!("{owner} is no switchbox user"),
                }
            },
            Some(home) if home != (row, side) => {
                hold_bus(&mut self.overflow_bus, row, 0, &owner);
                buses.push(BusRef::Overflow);
            },
            Some(_) => {},
        }

        let cols = cols.iter().collect_vec();
        let mut mapcols = vec![];
        for c in &cols {
            self.sram_use.claim(row, *c, owner.clone());
            if self.groups[id].is_synth2port() {
                self.mapram_use.claim(row, mapram_column(*c), owner.clone());
                mapcols.push(mapram_column(*c));
            }
        }
        let vpns = self.groups[id].take_vpns(cols.len());
        trace!("swbox: {owner} takes {cols:?} of row {row} ({side:?})");
        self.groups[id].rows.push(MemRow { row, buses, cols, mapcols, vpns, way: 0 });
    }

    /// Walks the rows once. On every half row the running overflow chain
    /// goes first, then a resource that fills the half exactly, then the
    /// biggest one.
    pub fn allocate_all_swbox_users(&mut self) -> AllocResult<()> {
        let ids = self.swbox_groups();
        let mut active: Option<GroupId> = None;
        for row in (0..SRAM_ROWS).rev() {
            for side in Side::ALL {
                loop {
                    let cands = ids.iter()
                        .filter_map(|id| self.swbox_candidate(*id, row, side, active).map(|f| (*id, f)))
                        .collect_vec();
                    let left = |id: GroupId| self.groups[id].left() as usize;
                    let pick = cands.iter()
                        .find(|(id, _)| Some(*id) == active)
                        .or_else(|| cands.iter().find(|(id, free)| left(*id) == free.popcount()))
                        .or_else(|| cands.iter().max_by_key(|(id, _)| (left(*id), Reverse(*id))))
                        .copied();
                    let Some((id, free)) = pick else {
                        break;
                    };
                    let n = left(id).min(free.popcount());
                    self.swbox_place(id, row, side, free.lowest(n));
                    if self.groups[id].left() > 0 {
                        active = Some(id);
                    } else if active == Some(id) {
                        active = None;
                    }
                }
            }
        }

        if let Some(id) = ids.iter().find(|id| self.groups[**id].left() > 0) {
            let g = &self.groups[*id];
            return Err(AllocError::memory(MemPhase::Attached,
                format!("not enough SRAMs for {} ({} of {} placed)", g.resource, g.placed, g.depth)));
        }

        self.allocate_color_maps(&ids)
    }

    /// Color map-RAMs go on rows the meter reaches. A row addresses them
    /// through its statistics bus unless a counter holds it, otherwise
    /// through an idle-time bus.
    fn allocate_color_maps(&mut self, ids: &[GroupId]) -> AllocResult<()> {
        for &id in ids {
            let g = &self.groups[id];
            let (MemKind::Attached(AttachedKind::Meter { color_maps: true }), Some((home, _))) = (g.kind, g.home) else {
                continue;
            };
            let owner = g.resource.clone();
            let mut need = ceil_div(g.depth - 1, METER_RAMS_PER_COLOR_MAP as u64) as usize;
            let lowest = home.saturating_sub(self.max_overflow);
            for row in (lowest..=home).rev() {
                if need == 0 {
                    break;
                }
                let free = self.mapram_use.free_in_row(row);
                if free.is_empty() {
                    continue;
                }
                let bus = if self.stats_bus.get(row, 0).map_or(true, |o| *o == owner) {
                    hold_bus(&mut self.stats_bus, row, 0, &owner);
                    BusRef::StatsAddr
                } else if let Some(b) = pick_bus(&self.idletime_bus, row, &owner) {
                    hold_bus(&mut self.idletime_bus, row, b, &owner);
                    BusRef::Idletime(b)
                } else {
                    continue;
                };
                let mapcols = free.iter().take(need).collect_vec();
                for c in &mapcols {
                    self.mapram_use.claim(row, *c, format!("{owner}$color"));
                }
                need -= mapcols.len();
                let vpns = (0..mapcols.len() as u32).collect();
                self.groups[id].color_rows.push(MemRow { row, buses: vec![bus], cols: vec![], mapcols, vpns, way: 0 });
            }
            if need > 0 {
                return Err(AllocError::memory(MemPhase::Attached, format!("no room for color maprams of {owner}")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memories::tests::memories_with;

    fn with(attached: Vec<AttachedResource>) -> Memories {
        let t = attached.into_iter()
            .fold(TableRequest::new("t", MatchKind::NoMatch, vec![], 0), |t, a| t.attach(a));
        memories_with(&[t])
    }

    fn group<'a>(mem: &'a Memories, name: &str) -> &'a SramGroup {
        mem.groups.iter().find(|g| g.resource == name).unwrap()
    }

    #[test]
    fn test_counter_starts_on_even_row() {
        let mut mem = with(vec![AttachedResource::new("cnt", AttachedKind::Counter { per_word: 1 }, 1024)]);
        mem.allocate_all_swbox_users().unwrap();
        let g = group(&mem, "cnt");
        assert_eq!(g.home, Some((6, Side::Right)));
        assert_eq!(g.rows[0].cols, vec![4, 5]);
        assert_eq!(g.rows[0].mapcols, vec![0, 1]);
        assert_eq!(g.rows[0].buses, vec![BusRef::StatsAddr]);
    }

    #[test]
    fn test_meter_starts_on_odd_row() {
        let mut mem = with(vec![AttachedResource::new("m", AttachedKind::Meter { color_maps: false }, 1024)]);
        mem.allocate_all_swbox_users().unwrap();
        assert_eq!(group(&mem, "m").home, Some((7, Side::Right)));
    }

    #[test]
    fn test_action_data_claims_action_bus() {
        let mut mem = with(vec![AttachedResource::new("ad", AttachedKind::ActionData { width: 32 }, 4096)]);
        mem.allocate_all_swbox_users().unwrap();
        let g = group(&mem, "ad");
        assert_eq!(g.rows[0].row, 7);
        assert_eq!(g.rows[0].buses, vec![BusRef::Action(Side::Right)]);
        assert!(g.rows[0].mapcols.is_empty());
    }

    #[test]
    fn test_overflow_chain_stays_in_reach() {
        let mut mem = with(vec![AttachedResource::new("cnt", AttachedKind::Counter { per_word: 1 }, 12 * 1024)]);
        mem.allocate_all_swbox_users().unwrap();
        let g = group(&mem, "cnt");
        assert_eq!(g.rows.iter().map(|r| (r.row, r.cols.len())).collect_vec(), vec![(6, 6), (5, 6), (4, 1)]);
        assert_eq!(g.rows[1].buses, vec![BusRef::Overflow]);
        assert_eq!(mem.overflow_bus.get(5, 0).map(String::as_str), Some("cnt"));
    }

    #[test]
    fn test_one_chain_at_a_time() {
        let mut mem = with(vec![
            AttachedResource::new("a", AttachedKind::Counter { per_word: 1 }, 7 * 1024),
            AttachedResource::new("b", AttachedKind::Counter { per_word: 1 }, 7 * 1024),
        ]);
        mem.allocate_all_swbox_users().unwrap();
        let rows = |n| group(&mem, n).rows.iter().map(|r| r.row).collect_vec();
        assert_eq!(rows("a"), vec![6, 5]);
        assert_eq!(rows("b"), vec![4, 3]);
    }

    #[test]
    fn test_action_data_follows_selector() {
        let mut mem = with(vec![
            AttachedResource::new("ad", AttachedKind::ActionData { width: 64 }, 1024),
            AttachedResource::new("sel", AttachedKind::Selector, 1024 * SELECTOR_MEMBERS_PER_WORD),
        ]);
        mem.allocate_all_swbox_users().unwrap();
        let sel = group(&mem, "sel");
        let ad = group(&mem, "ad");
        assert_eq!(sel.home, Some((7, Side::Right)));
        assert_eq!(sel.rows[0].cols, vec![4, 5]);
        assert!(ad.home.is_some_and(|(row, _)| row <= 7));
        assert_eq!(ad.rows[0].cols, vec![6]);
    }

    #[test]
    fn test_out_of_srams() {
        let mut mem = with(vec![AttachedResource::new("cnt", AttachedKind::Counter { per_word: 1 }, 40 * 1024)]);
        let err = mem.allocate_all_swbox_users().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Attached, .. }));
        assert!(err.to_string().starts_with("not enough SRAMs for cnt"));
    }

    #[test]
    fn test_overflow_option_capped_by_hardware() {
        let options = AllocOptions { max_overflow_rows: SRAM_ROWS - 1, ..Default::default() };
        let meter = |k: u64| {
            let t = TableRequest::new("t", MatchKind::NoMatch, vec![], 0)
                .attach(AttachedResource::new("m", AttachedKind::Meter { color_maps: false }, k * 1024));
            let mut mem = Memories::new(&options);
            mem.add_table(&t, &crate::memories::tests::fake_ixbar(&t, 1)).unwrap();
            mem
        };
        // 42 RAMs: seven rows from the home row down, the most reachable.
        let mut mem = meter(41);
        assert_eq!(mem.max_overflow, MAX_OVERFLOW_ROWS);
        mem.allocate_all_swbox_users().unwrap();
        let g = group(&mem, "m");
        assert_eq!(g.home, Some((7, Side::Right)));
        assert_eq!(g.rows.iter().map(|r| r.row).collect_vec(), (1..=7).rev().collect_vec());
        // 48 RAMs would need row 0 as well.
        let mut mem = meter(47);
        let err = mem.allocate_all_swbox_users().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Attached, .. }));
    }

    #[test]
    fn test_color_maps_follow_meter() {
        let mut mem = with(vec![AttachedResource::new("m", AttachedKind::Meter { color_maps: true }, 8 * 1024)]);
        mem.allocate_all_swbox_users().unwrap();
        let g = group(&mem, "m");
        assert_eq!(g.rows.iter().map(|r| (r.row, r.cols.len())).collect_vec(), vec![(7, 6), (6, 3)]);
        assert_eq!(g.color_rows.len(), 1);
        assert_eq!(g.color_rows[0].row, 6);
        assert_eq!(g.color_rows[0].mapcols, vec![3, 4]);
        assert_eq!(g.color_rows[0].buses, vec![BusRef::StatsAddr]);
    }

    #[test]
    fn test_color_maps_avoid_counter_stats_bus() {
        let mut mem = with(vec![AttachedResource::new("m", AttachedKind::Meter { color_maps: true }, 8 * 1024)]);
        mem.stats_bus.claim(6, 0, "cnt".to_string());
        mem.allocate_all_swbox_users().unwrap();
        let g = group(&mem, "m");
        assert_eq!(g.color_rows[0].buses, vec![BusRef::Idletime(0)]);
    }
}

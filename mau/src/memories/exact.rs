//! Exact match ways in the SRAM match region.

use super::{pick_bus, BusRef, GroupId, MemKind, Memories, SramGroup};
use crate::helpe::*;
use std::cmp::Reverse;

impl Memories {
    /// One group per hash way of every exact table.
    fn exact_groups(&mut self) -> Vec<GroupId> {
        let ways = self.tables()
            .iter()
            .filter(|t| t.kind() == MatchKind::Exact)
            .flat_map(|t| {
                t.req.layout.way_depths()
                    .into_iter()
                    .enumerate()
                    .map(|(w, depth)| {
                        let mut g = SramGroup::new(t.name(), t.name(), MemKind::Exact, depth);
                        g.way = w;
                        g.width = t.req.layout.match_width;
                        g.label = t.search_label.clone();
                        g
                    })
                    .collect_vec()
            })
            .collect_vec();

        ways.into_iter().map(|g| self.add_group(g)).collect()
    }

    /// Row with the most free match columns whose buses `id` can use.
    fn best_exact_row(&self, id: GroupId) -> Option<(usize, Bitvec, usize, usize)> {
        let g = &self.groups[id];
        (0..SRAM_ROWS)
            .filter_map(|r| {
                let free = self.match_free(r);
                if free.is_empty() {
                    return None;
                }
                let (search, result) = self.match_buses(r, &g.label, &g.table)?;
                Some((r, free, search, result))
            })
            .min_by_key(|(r, free, ..)| (Reverse(free.popcount()), *r))
    }

    /// Places as much of `id` as fits in the columns `free` of `row`.
    fn fill_narrow(&mut self, id: GroupId, row: usize, free: &mut Bitvec, search: usize, result: usize) {
        let n = (self.groups[id].left() as usize).min(free.popcount());
        let cols = free.iter().take(n).collect_vec();
        for c in &cols {
            free.clear(*c);
        }
        let vpns = self.groups[id].take_vpns(n);
        self.place_row(id, row, &cols, vec![BusRef::Search(search), BusRef::Result(result)], vpns);
    }

    fn place_narrow(&mut self, id: GroupId, pending: &[GroupId]) -> AllocResult<()> {
        let Some((row, mut free, search, result)) = self.best_exact_row(id) else {
            return Err(AllocError::memory(MemPhase::Match,
                format!("not enough exact SRAMs for {}", self.groups[id].table)));
        };
        self.fill_narrow(id, row, &mut free, search, result);

        // Whatever is left of the row goes to ways riding the same search bus.
        let label = self.groups[id].label.clone();
        for &other in pending {
            if free.is_empty() {
                break;
            }
            let g = &self.groups[other];
            if other == id || g.width != 1 || g.left() == 0 || g.label != label {
                continue;
            }
            let Some(result) = pick_bus(&self.result_bus, row, &g.table) else {
                continue;
            };
            trace!("exact: {} way {} shares row {row}", g.table, g.way);
            self.fill_narrow(other, row, &mut free, search, result);
        }

        Ok(())
    }

    /// Wide words take `width` rows sharing one column set.
    fn place_wide(&mut self, id: GroupId) -> AllocResult<()> {
        let g = &self.groups[id];
        let best = (0..SRAM_ROWS)
            .combinations(g.width)
            .filter_map(|rows| {
                let mut common = Bitvec::range(0..self.match_columns());
                let mut buses = vec![];
                for &r in &rows {
                    common = common & self.match_free(r);
                    buses.push(self.match_buses(r, &g.label, &g.table)?);
                }
                (!common.is_empty()).then_some((rows, common, buses))
            })
            .min_by_key(|(_, common, _)| Reverse(common.popcount()));
        let Some((rows, common, buses)) = best else {
            return Err(AllocError::memory(MemPhase::Match,
                format!("no {} rows with common free columns for {}", g.width, g.table)));
        };

        let n = (g.left() as usize).min(common.popcount());
        let cols = common.lowest(n).iter().collect_vec();
        let vpns = self.groups[id].take_vpns(n);
        for (row, (search, result)) in rows.into_iter().zip(buses) {
            self.place_row(id, row, &cols, vec![BusRef::Search(search), BusRef::Result(result)], vpns.clone());
        }

        Ok(())
    }

    /// Widest ways first, then the deepest.
    pub fn allocate_all_exact(&mut self) -> AllocResult<()> {
        let mut pending = self.exact_groups();
        loop {
            pending.retain(|id| self.groups[*id].left() > 0);
            let next = pending.iter()
                .copied()
                .min_by_key(|id| (Reverse(self.groups[*id].width), Reverse(self.groups[*id].left()), *id));
            let Some(id) = next else {
                return Ok(());
            };
            if self.groups[id].width == 1 {
                self.place_narrow(id, &pending)?;
            } else {
                self.place_wide(id)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memories::tests::memories_with;

    #[test]
    fn test_single_way_lands_top_left() {
        let mut mem = memories_with(&[TableRequest::exact("t", vec![], 1000)]);
        mem.allocate_all_exact().unwrap();
        let g = &mem.groups[0];
        assert_eq!(g.rows.len(), 1);
        assert_eq!(g.rows[0].row, 0);
        assert_eq!(g.rows[0].cols, vec![0]);
        assert_eq!(g.rows[0].buses, vec![BusRef::Search(0), BusRef::Result(0)]);
    }

    #[test]
    fn test_ways_share_row() {
        let t = TableRequest::exact("t", vec![], 4 * 1024).with_ways(4);
        let mut mem = memories_with(&[t]);
        mem.allocate_all_exact().unwrap();
        assert!(mem.groups.iter().all(|g| g.rows.len() == 1 && g.rows[0].row == 0));
        assert_eq!(mem.sram_map().free_in_row(0), Bitvec::range(4..SRAM_COLUMNS));
        assert_eq!(mem.search_bus.occupied().count(), 1);
    }

    #[test]
    fn test_deep_way_spreads_over_rows() {
        let t = TableRequest::exact("t", vec![], 25 * 1024);
        let mut mem = memories_with(&[t]);
        mem.allocate_all_exact().unwrap();
        let g = &mem.groups[0];
        assert_eq!(g.rows.iter().map(|r| r.cols.len()).collect_vec(), vec![10, 10, 5]);
        // Virtual pages run on across rows.
        assert_eq!(g.rows[2].vpns, (20..25).collect_vec());
    }

    #[test]
    fn test_wide_way_uses_identical_columns() {
        let narrow = TableRequest::exact("n", vec![], 3 * 1024);
        let wide = TableRequest::exact("w", vec![], 4 * 1024).with_width(2);
        let mut mem = memories_with(&[narrow, wide]);
        mem.allocate_all_exact().unwrap();
        let w = mem.groups.iter().find(|g| g.table == "w").unwrap();
        assert_eq!(w.rows.len(), 2);
        assert_eq!(w.rows[0].cols, w.rows[1].cols);
        assert_eq!(w.rows[0].vpns, w.rows[1].vpns);
        assert_eq!(w.rows[0].cols.len(), 4);
    }

    #[test]
    fn test_respects_match_split() {
        let mut mem = memories_with(&[TableRequest::exact("t", vec![], 12 * 1024)]);
        mem.match_cols = 6;
        mem.allocate_all_exact().unwrap();
        assert!(mem.groups[0].rows.iter().all(|r| r.cols.iter().all(|c| *c < 6)));
    }

    #[test]
    fn test_too_many_srams() {
        let mut mem = memories_with(&[TableRequest::exact("t", vec![], 81 * 1024)]);
        let err = mem.allocate_all_exact().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Match, .. }));
    }

    #[test]
    fn test_search_buses_run_out() {
        // Tables with different crossbar identities can't share the two
        // search buses of a row.
        let tables = (0..3)
            .map(|i| TableRequest::exact(&format!("t{i}"), vec![], 1024))
            .collect_vec();
        let mut mem = memories_with(&tables);
        for (i, t) in mem.tables.iter_mut().enumerate() {
            t.search_label = format!("exact{{{i}}}");
        }
        for r in 1..SRAM_ROWS {
            for b in 0..BUS_COUNT {
                mem.search_bus.claim(r, b, "x".to_string());
            }
        }
        let err = mem.allocate_all_exact().unwrap_err();
        assert!(err.to_string().contains("t2"));
        assert_eq!(mem.groups[1].rows[0].row, 0);
        assert_eq!(mem.groups[1].rows[0].buses[0], BusRef::Search(1));
    }
}

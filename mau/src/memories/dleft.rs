//! D-left hash slices. Every slice is looked up as a logical table of
//! its own, but the slices answer together: all of them sit in the same
//! half of the array, each inside a single row.

use super::{BusRef, GroupId, MemKind, Memories, SramGroup};
use crate::helpe::*;
use std::cmp::Reverse;

/// Where one slice goes.
struct SlicePlan {
    id:     GroupId,
    row:    usize,
    cols:   Vec<usize>,
    search: usize,
    result: usize,
}

impl Memories {
    /// Slice groups of every d-left table, one list per table.
    fn dleft_groups(&mut self) -> Vec<Vec<GroupId>> {
        let tables = self.tables()
            .iter()
            .filter(|t| t.kind() == MatchKind::Dleft)
            .map(|t| {
                let width = t.req.layout.match_width;
                t.req.layout.way_depths()
                    .into_iter()
                    .enumerate()
                    .map(|(s, depth)| {
                        let mut g = SramGroup::new(t.name(), t.name(), MemKind::Dleft, depth * width as u64);
                        g.way = s;
                        g.label = t.search_label.clone();
                        g
                    })
                    .collect_vec()
            })
            .collect_vec();

        tables.into_iter()
            .map(|slices| slices.into_iter().map(|g| self.add_group(g)).collect())
            .collect()
    }

    #[inline(always)]
    fn half_free(&self, row: usize, side: Side) -> Bitvec {
        self.match_free(row) & Bitvec::range(side.columns())
    }

    /// Rows for all of `slices` on `side`, or nothing. Deepest slices go
    /// first, each into the fullest row that still holds it.
    fn plan_dleft(&self, slices: &[GroupId], side: Side) -> Option<Vec<SlicePlan>> {
        let mut free = (0..SRAM_ROWS).map(|r| self.half_free(r, side)).collect_vec();
        let order = slices.iter()
            .copied()
            .sorted_by_key(|id| (Reverse(self.groups[*id].left()), *id));
        let mut plan = vec![];
        for id in order {
            let g = &self.groups[id];
            let need = g.left() as usize;
            let (row, (search, result)) = (0..SRAM_ROWS)
                .filter(|r| free[*r].popcount() >= need)
                .filter_map(|r| self.match_buses(r, &g.label, &g.table).map(|b| (r, b)))
                .min_by_key(|(r, _)| (free[*r].popcount(), *r))?;
            let cols = free[row].lowest(need);
            free[row] = free[row] - cols;
            plan.push(SlicePlan { id, row, cols: cols.iter().collect(), search, result });
        }

        Some(plan)
    }

    /// Every d-left table in one half, the roomier half first.
    pub fn allocate_all_dleft(&mut self) -> AllocResult<()> {
        for slices in self.dleft_groups() {
            let Some(&first) = slices.first() else {
                continue;
            };
            let table = self.groups[first].table.clone();
            let room = |side: Side| (0..SRAM_ROWS).map(|r| self.half_free(r, side).popcount()).sum::<usize>();
            let found = Side::ALL.into_iter()
                .sorted_by_key(|s| Reverse(room(*s)))
                .find_map(|s| self.plan_dleft(&slices, s).map(|p| (s, p)));
            let Some((side, plan)) = found else {
                return Err(AllocError::memory(MemPhase::Match,
                    format!("slices of {table} don't fit in one half")));
            };

            trace!("dleft: {table} takes the {side:?} half");
            for p in plan {
                let vpns = self.groups[p.id].take_vpns(p.cols.len());
                self.place_row(p.id, p.row, &p.cols, vec![BusRef::Search(p.search), BusRef::Result(p.result)], vpns);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memories::tests::memories_with;

    fn placed(mem: &Memories) -> Vec<(usize, Vec<usize>)> {
        mem.groups.iter()
            .filter(|g| g.kind == MemKind::Dleft)
            .flat_map(|g| g.rows.iter().map(|r| (r.row, r.cols.clone())))
            .collect()
    }

    #[test]
    fn test_slices_share_a_half() {
        let mut mem = memories_with(&[TableRequest::dleft("d", vec![], 6 * 1024, 3)]);
        mem.allocate_all_dleft().unwrap();
        assert_eq!(placed(&mem), vec![(0, vec![4, 5]), (0, vec![6, 7]), (0, vec![8, 9])]);
        assert_eq!(mem.search_bus.occupied().count(), 1);
        assert!(mem.groups.iter().all(|g| g.rows.len() == 1));
    }

    #[test]
    fn test_slices_move_to_other_half() {
        let mut mem = memories_with(&[TableRequest::dleft("d", vec![], 4 * 1024, 2)]);
        // One free column per row on the right, one free row on the left.
        for r in 0..SRAM_ROWS {
            for c in 5..SRAM_COLUMNS {
                mem.sram_use.claim(r, c, "x".to_string());
            }
            if r > 0 {
                for c in Side::Left.columns() {
                    mem.sram_use.claim(r, c, "x".to_string());
                }
            }
        }
        mem.allocate_all_dleft().unwrap();
        assert_eq!(placed(&mem), vec![(0, vec![0, 1]), (0, vec![2, 3])]);
    }

    #[test]
    fn test_slices_too_deep_for_either_half() {
        let mut mem = memories_with(&[TableRequest::dleft("d", vec![], 15 * 1024, 3)]);
        mem.match_cols = 8;
        let err = mem.allocate_all_dleft().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Match, .. }));
        assert_eq!(mem.sram_map().occupied().count(), 0);
    }
}

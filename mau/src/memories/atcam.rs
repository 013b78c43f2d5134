//! ATCAM partitions. A partition is searched as a whole, so it has to
//! sit in a single row.

use super::{BusRef, GroupId, MemKind, Memories, SramGroup};
use crate::helpe::*;
use std::cmp::Reverse;

impl Memories {
    fn atcam_groups(&mut self) -> Vec<GroupId> {
        let parts = self.tables()
            .iter()
            .filter(|t| t.kind() == MatchKind::Atcam)
            .flat_map(|t| {
                let width = t.req.layout.match_width;
                t.req.layout.partition_depths()
                    .into_iter()
                    .enumerate()
                    .map(|(p, depth)| {
                        // Every RAM of the partition is one depth unit here.
                        let mut g = SramGroup::new(t.name(), t.name(), MemKind::Atcam, depth * width as u64);
                        g.way = p;
                        g.label = t.search_label.clone();
                        g
                    })
                    .collect_vec()
            })
            .collect_vec();

        parts.into_iter().map(|g| self.add_group(g)).collect()
    }

    /// Partitions alternate the side they start on, spilling over to
    /// the other side of the same row.
    pub fn allocate_all_atcam(&mut self) -> AllocResult<()> {
        for id in self.atcam_groups() {
            let g = &self.groups[id];
            let need = g.left() as usize;
            let side = if g.way % 2 == 0 { Side::Left } else { Side::Right };
            let preferred = Bitvec::range(side.columns());
            let best = (0..SRAM_ROWS)
                .filter_map(|r| {
                    let free = self.match_free(r);
                    if free.popcount() < need {
                        return None;
                    }
                    let buses = self.match_buses(r, &g.label, &g.table)?;
                    Some((r, free, buses))
                })
                .min_by_key(|(r, free, _)| {
                    let on_side = (*free & preferred).popcount();
                    (on_side < need, Reverse(free.popcount()), *r)
                });
            let Some((row, free, (search, result))) = best else {
                return Err(AllocError::memory(MemPhase::Match,
                    format!("partition {} of {} does not fit a row", g.way, g.table)));
            };

            let cols = (free & preferred).iter()
                .chain((free - preferred).iter())
                .take(need)
                .collect_vec();
            let vpns = self.groups[id].take_vpns(need);
            self.place_row(id, row, &cols, vec![BusRef::Search(search), BusRef::Result(result)], vpns);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memories::tests::memories_with;

    #[test]
    fn test_partitions_alternate_sides() {
        let t = TableRequest::atcam("lpm", vec![], 4 * 2048, 4);
        let mut mem = memories_with(&[t]);
        mem.allocate_all_atcam().unwrap();
        let g = &mem.groups;
        assert_eq!(g.len(), 4);
        // Emptiest row first, so every partition gets its own row.
        let placed = g.iter().map(|p| (p.rows[0].row, p.rows[0].cols.clone())).collect_vec();
        assert_eq!(placed, vec![
            (0, vec![0, 1]),
            (1, vec![4, 5]),
            (2, vec![0, 1]),
            (3, vec![4, 5]),
        ]);
        assert!(g.iter().all(|p| p.rows.len() == 1));
    }

    #[test]
    fn test_partition_spills_to_other_side() {
        let t = TableRequest::atcam("lpm", vec![], 6 * 1024, 1);
        let mut mem = memories_with(&[t]);
        mem.allocate_all_atcam().unwrap();
        let row = &mem.groups[0].rows[0];
        assert_eq!(row.cols, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_partition_wider_than_free_row() {
        let t = TableRequest::atcam("lpm", vec![], 8 * 1024, 1);
        let mut mem = memories_with(&[t]);
        mem.match_cols = 6;
        let err = mem.allocate_all_atcam().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Match, .. }));
    }
}

//! Idle-time tables live in map-RAMs only.

use super::{hold_bus, pick_bus, BusRef, MemKind, MemRow, Memories, SramGroup};
use crate::helpe::*;

impl Memories {
    /// Emptiest map-RAM row first, the higher one on a tie. Every row
    /// used needs an idle-time bus of its own.
    pub fn allocate_all_idletime(&mut self) -> AllocResult<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let wanted = self.tables()
            .iter()
            .flat_map(|t| t.req.attached.iter().map(move |a| (t.name().to_string(), a.clone())))
            .filter(|(_, a)| a.idletime_maprams() > 0)
            .filter(|(_, a)| seen.insert(a.name.clone()))
            .collect_vec();

        for (table, res) in wanted {
            let id = self.add_group(SramGroup::new(&table, &res.name, MemKind::Attached(res.kind), res.idletime_maprams()));
            while self.groups[id].left() > 0 {
                let best = (0..SRAM_ROWS)
                    .filter_map(|r| {
                        let free = self.mapram_use.free_in_row(r);
                        let bus = pick_bus(&self.idletime_bus, r, &res.name)?;
                        (!free.is_empty()).then_some((r, free, bus))
                    })
                    .max_by_key(|(r, free, _)| (free.popcount(), *r));
                let Some((row, free, bus)) = best else {
                    let g = &self.groups[id];
                    return Err(AllocError::memory(MemPhase::Attached,
                        format!("not enough maprams for idletime {} ({} of {} placed)", res.name, g.placed, g.depth)));
                };

                let n = (self.groups[id].left() as usize).min(free.popcount());
                let mapcols = free.iter().take(n).collect_vec();
                for c in &mapcols {
                    self.mapram_use.claim(row, *c, res.name.clone());
                }
                hold_bus(&mut self.idletime_bus, row, bus, &res.name);
                let vpns = self.groups[id].take_vpns(n);
                self.groups[id].rows.push(MemRow {
                    row,
                    buses:  vec![BusRef::Idletime(bus)],
                    mapcols,
                    vpns,
                    ..Default::default()
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memories::tests::memories_with;

    fn idle(entries: u64, precision: u32) -> AttachedResource {
        AttachedResource::new("idle", AttachedKind::IdleTime { precision }, entries)
    }

    #[test]
    fn test_single_mapram() {
        let t = TableRequest::exact("t", vec![], 2048).attach(idle(2048, 3));
        let mut mem = memories_with(&[t]);
        mem.allocate_all_idletime().unwrap();
        let g = &mem.groups[0];
        assert_eq!(g.rows.len(), 1);
        assert_eq!(g.rows[0].row, 7);
        assert_eq!(g.rows[0].mapcols, vec![0]);
        assert!(g.rows[0].cols.is_empty());
        assert_eq!(g.rows[0].buses, vec![BusRef::Idletime(0)]);
    }

    #[test]
    fn test_spreads_over_rows() {
        let t = TableRequest::exact("t", vec![], 8 * 1024).attach(idle(8 * 1024, 0));
        let mut mem = memories_with(&[t]);
        mem.allocate_all_idletime().unwrap();
        let rows = mem.groups[0].rows.iter().map(|r| (r.row, r.mapcols.len())).collect_vec();
        assert_eq!(rows, vec![(7, 6), (6, 2)]);
    }

    #[test]
    fn test_shared_table_placed_once() {
        let a = TableRequest::exact("a", vec![], 1024).attach(idle(1024, 0));
        let b = TableRequest::exact("b", vec![], 1024).attach(idle(1024, 0));
        let mut mem = memories_with(&[a, b]);
        mem.allocate_all_idletime().unwrap();
        assert_eq!(mem.groups.len(), 1);
        assert_eq!(mem.mapram_map().occupied().count(), 1);
    }

    #[test]
    fn test_needs_a_bus() {
        let t = TableRequest::exact("t", vec![], 1024).attach(idle(1024, 0));
        let mut mem = memories_with(&[t]);
        for r in 0..SRAM_ROWS {
            for b in 0..IDLETIME_BUSES {
                mem.idletime_bus.claim(r, b, format!("m{b}"));
            }
        }
        let err = mem.allocate_all_idletime().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Attached, .. }));
    }
}

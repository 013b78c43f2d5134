//! TCAM placement and ternary indirection RAMs.

use super::{pick_bus, BusRef, MemKind, MemRow, Memories, SramGroup};
use crate::helpe::*;
use std::cmp::Reverse;

impl Memories {
    /// Top TCAM row where a `width`-tall run fits in column `col`.
    fn tcam_run(&self, col: usize, width: usize, even_start: bool) -> Option<usize> {
        if width > TCAM_ROWS {
            return None;
        }
        (0..=TCAM_ROWS - width)
            .filter(|r| !even_start || r % 2 == 0)
            .find(|r| (*r..*r + width).all(|rr| self.tcam_use.is_free(rr, col)))
    }

    /// Every depth unit of a ternary table is a vertical run of one
    /// TCAM per crossbar group. An odd run whose key uses a midbyte
    /// must start on an even row, where the midbyte is wired.
    pub fn allocate_all_ternary(&mut self) -> AllocResult<()> {
        let order = self.tables()
            .iter()
            .filter(|t| t.kind() == MatchKind::Ternary)
            .map(|t| (t.name().to_string(), t.ternary_width.max(1), t.req.layout.tcam_depth(), t.midbyte))
            .sorted_by_key(|(_, width, depth, _)| (Reverse(*width), Reverse(*depth)))
            .collect_vec();

        for (name, width, depth, midbyte) in order {
            let mut g = SramGroup::new(&name, &name, MemKind::Ternary, depth);
            g.width = width;
            let id = self.add_group(g);
            let even_start = width % 2 == 1 && midbyte;
            for _ in 0..depth {
                let spot = (0..TCAM_COLUMNS)
                    .find_map(|c| self.tcam_run(c, width, even_start).map(|r| (c, r)));
                let Some((col, top)) = spot else {
                    return Err(AllocError::memory(MemPhase::Fixed, format!("not enough tcams for {name}")));
                };
                let vpns = self.groups[id].take_vpns(1);
                for row in top..top + width {
                    self.tcam_use.claim(row, col, name.clone());
                    self.groups[id].rows.push(MemRow {
                        row,
                        cols:   vec![col],
                        vpns:   vpns.clone(),
                        ..Default::default()
                    });
                }
            }
            trace!("ternary: {name} in {depth} runs of {width}");
        }

        Ok(())
    }

    /// Indirection RAMs hold the action pointers of ternary tables. They
    /// live in the match region and read through a tind bus.
    pub fn allocate_all_tind(&mut self) -> AllocResult<()> {
        let wanted = self.tables()
            .iter()
            .filter(|t| t.kind() == MatchKind::Ternary && t.req.layout.tind_rams() > 0)
            .map(|t| (t.name().to_string(), t.req.layout.tind_rams()))
            .collect_vec();

        for (name, rams) in wanted {
            let resource = format!("{name}$tind");
            let id = self.add_group(SramGroup::new(&name, &resource, MemKind::Tind, rams));
            while self.groups[id].left() > 0 {
                let best = (0..SRAM_ROWS)
                    .filter_map(|r| {
                        let free = self.match_free(r);
                        let bus = pick_bus(&self.tind_bus, r, &resource)?;
                        (!free.is_empty()).then_some((r, free, bus))
                    })
                    .min_by_key(|(r, free, _)| (Reverse(free.popcount()), *r));
                let Some((row, free, bus)) = best else {
                    return Err(AllocError::memory(MemPhase::Match, format!("no tind row available for {name}")));
                };
                let n = (self.groups[id].left() as usize).min(free.popcount());
                let cols = free.iter().take(n).collect_vec();
                let vpns = self.groups[id].take_vpns(n);
                self.place_row(id, row, &cols, vec![BusRef::Tind(bus)], vpns);
            }
        }

        Ok(())
    }
}

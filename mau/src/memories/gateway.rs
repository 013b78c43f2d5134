//! Gateways and the result buses of tables without match RAMs.

use super::{hold_bus, pick_bus, BusRef, MemKind, MemRow, Memories, SramGroup};
use crate::helpe::*;

impl Memories {
    /// Whether `table` owns exact or ATCAM RAMs, whose rows drive a result bus.
    fn has_match_rams(&self, table: &str) -> bool {
        self.groups.iter().any(|g| g.table == table && matches!(g.kind, MemKind::Exact | MemKind::Atcam | MemKind::Dleft))
    }

    /// A gateway rides the search bus of its table when it can, else it
    /// takes a bus of its own. Tables without match RAMs also need a
    /// result bus next to it.
    pub fn allocate_all_gateways(&mut self) -> AllocResult<()> {
        let wanted = self.tables()
            .iter()
            .filter(|t| !t.req.gateway.is_empty())
            .map(|t| (t.name().to_string(), t.search_label.clone()))
            .collect_vec();

        for (name, label) in wanted {
            let matched = self.has_match_rams(&name);
            let unit = |mem: &Self, r: usize| (0..GATEWAYS_PER_ROW).find(|u| mem.gateway_use.is_free(r, *u));

            let shared = matched
                .then(|| {
                    (0..SRAM_ROWS).find_map(|r| {
                        let bus = (0..BUS_COUNT).find(|b| self.search_bus.get(r, *b).is_some_and(|o| *o == label))?;
                        Some((r, bus, unit(self, r)?))
                    })
                })
                .flatten();

            let own = format!("gw:{name}");
            let (row, buses, bus_owner) = match shared {
                Some((row, bus, u)) => (row, vec![BusRef::Search(bus), BusRef::Gateway(u)], label.clone()),
                None => {
                    let spot = (0..SRAM_ROWS).find_map(|r| {
                        let bus = pick_bus(&self.search_bus, r, &own)?;
                        let u = unit(self, r)?;
                        let result = if matched { None } else { Some(pick_bus(&self.result_bus, r, &name)?) };
                        Some((r, bus, u, result))
                    });
                    let Some((row, bus, u, result)) = spot else {
                        return Err(AllocError::memory(MemPhase::Fixed, format!("no gateway row available for {name}")));
                    };
                    let mut buses = vec![BusRef::Search(bus), BusRef::Gateway(u)];
                    if let Some(r) = result {
                        hold_bus(&mut self.result_bus, row, r, &name);
                        buses.push(BusRef::Result(r));
                    }
                    (row, buses, own.clone())
                },
            };

            let resource = format!("{name}$gw");
            for b in &buses {
                match *b {
                    BusRef::Search(i)   => hold_bus(&mut self.search_bus, row, i, &bus_owner),
                    BusRef::Gateway(u)  => self.gateway_use.claim(row, u, resource.clone()),
                    _                   => {},
                }
            }
            trace!("gateway: {name} on row {row} ({buses:?})");
            let mut g = SramGroup::new(&name, &resource, MemKind::Gateway, 1);
            g.placed = 1;
            g.rows.push(MemRow { row, buses, ..Default::default() });
            self.add_group(g);
        }

        Ok(())
    }

    /// Tables matching no RAM still return a result: hash-action and
    /// no-match tables take a result bus on any row, reusing one their
    /// gateway already holds.
    pub fn allocate_all_payloads(&mut self) -> AllocResult<()> {
        let wanted = self.tables()
            .iter()
            .filter(|t| matches!(t.kind(), MatchKind::NoMatch | MatchKind::HashAction))
            .map(|t| t.name().to_string())
            .collect_vec();

        for name in wanted {
            let held = (0..SRAM_ROWS).find_map(|r| {
                (0..PAYLOAD_COUNT)
                    .find(|b| self.result_bus.get(r, *b).is_some_and(|o| *o == name))
                    .map(|b| (r, b))
            });
            let spot = held.or_else(|| (0..SRAM_ROWS).find_map(|r| pick_bus(&self.result_bus, r, &name).map(|b| (r, b))));
            let Some((row, bus)) = spot else {
                return Err(AllocError::memory(MemPhase::Fixed, format!("no result bus available for {name}")));
            };
            hold_bus(&mut self.result_bus, row, bus, &name);
            let mut g = SramGroup::new(&name, &name, MemKind::Payload, 1);
            g.placed = 1;
            g.rows.push(MemRow { row, buses: vec![BusRef::Result(bus)], ..Default::default() });
            self.add_group(g);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memories::tests::memories_with;

    fn gw() -> Vec<KeyField> {
        vec![KeyField::exact("vlan", 12)]
    }

    #[test]
    fn test_gateway_shares_match_search_bus() {
        let t = TableRequest::exact("t", vec![], 1024).with_gateway(gw());
        let mut mem = memories_with(&[t]);
        mem.allocate_all_exact().unwrap();
        mem.allocate_all_gateways().unwrap();
        let g = mem.groups.iter().find(|g| g.kind == MemKind::Gateway).unwrap();
        assert_eq!(g.resource, "t$gw");
        assert_eq!(g.rows[0].row, 0);
        assert_eq!(g.rows[0].buses, vec![BusRef::Search(0), BusRef::Gateway(0)]);
        assert_eq!(mem.search_bus.occupied().count(), 1);
    }

    #[test]
    fn test_gateway_only_table_takes_result_bus() {
        let t = TableRequest::new("cond", MatchKind::NoMatch, vec![], 0).with_gateway(gw());
        let mut mem = memories_with(&[t]);
        mem.allocate_all_gateways().unwrap();
        mem.allocate_all_payloads().unwrap();
        let gw = mem.groups.iter().find(|g| g.kind == MemKind::Gateway).unwrap();
        assert_eq!(gw.rows[0].buses, vec![BusRef::Search(0), BusRef::Gateway(0), BusRef::Result(0)]);
        assert_eq!(mem.search_bus.get(0, 0).map(String::as_str), Some("gw:cond"));
        // The payload reuses the gateway's result bus.
        let payload = mem.groups.iter().find(|g| g.kind == MemKind::Payload).unwrap();
        assert_eq!(payload.rows[0].buses, vec![BusRef::Result(0)]);
        assert_eq!(mem.result_bus.occupied().count(), 1);
    }

    #[test]
    fn test_out_of_gateways() {
        let t = TableRequest::exact("t", vec![], 1024).with_gateway(gw());
        let mut mem = memories_with(&[t]);
        for r in 0..SRAM_ROWS {
            for u in 0..GATEWAYS_PER_ROW {
                mem.gateway_use.claim(r, u, "x".to_string());
            }
        }
        mem.allocate_all_exact().unwrap();
        let err = mem.allocate_all_gateways().unwrap_err();
        assert!(matches!(err, AllocError::Memory { phase: MemPhase::Fixed, .. }));
    }

    #[test]
    fn test_payload_needs_result_bus() {
        let t = TableRequest::new("ha", MatchKind::HashAction, vec![], 1024);
        let mut mem = memories_with(&[t]);
        for r in 0..SRAM_ROWS {
            for b in 0..PAYLOAD_COUNT {
                mem.result_bus.claim(r, b, "x".to_string());
            }
        }
        let err = mem.allocate_all_payloads().unwrap_err();
        assert_eq!(err.to_string(), "no result bus available for ha");
    }
}

//! Independent checks of a finished stage. They only read the records in
//! a [`StageAlloc`], never the allocator state, so they also catch
//! records that disagree with what the allocator believed.

use crate::{
    helpe::*,
    ixbar::ByteLoc,
    memories::{BusRef, MemKind, MemUse},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("{what} ({row}, {col}) held by both {first} and {second}")]
    DoubleBooked { what: &'static str, row: usize, col: usize, first: String, second: String },
    #[error("crossbar byte {loc} carries both {first} and {second}")]
    Crossbar { loc: ByteLoc, first: String, second: String },
    #[error("{resource}: wide word {vpn:?} spans different columns")]
    WideColumns { resource: String, vpn: Vec<u32> },
    #[error("{resource}: {reason}")]
    Scattered { resource: String, reason: String },
    #[error("{resource}: row {row} is out of reach of home row {home}")]
    Overflow { resource: String, home: usize, row: usize },
    #[error("{table}/{resource}: {found} {what} for {expected} needed")]
    Capacity { table: String, resource: String, what: &'static str, found: usize, expected: usize },
    #[error("{0}")]
    Limits(String),
}

type Cells<'a> = HashMap<(usize, usize), &'a str>;

fn book<'a>(cells: &mut Cells<'a>, what: &'static str, (row, col): (usize, usize), owner: &'a str) -> Result<(), Violation> {
    match cells.insert((row, col), owner) {
        Some(prev) if prev != owner => Err(Violation::DoubleBooked {
            what, row, col,
            first:  prev.to_string(),
            second: owner.to_string(),
        }),
        _ => Ok(()),
    }
}

/// RAM cells of one resource must be distinct; across resources a cell
/// has one owner.
fn check_cells<'a>(alloc: &'a StageAlloc) -> Result<(), Violation> {
    let mut srams: Cells = HashMap::new();
    let mut tcams: Cells = HashMap::new();
    let mut maprams: Cells = HashMap::new();
    for t in alloc.tables.values() {
        for (res, m) in &t.memuse {
            let (cells, what) = if m.kind == MemKind::Ternary {
                (&mut tcams, "tcam")
            } else {
                (&mut srams, "sram")
            };
            let mut mine = HashSet::new();
            for r in &m.rows {
                for c in &r.cols {
                    if !mine.insert((r.row, *c)) {
                        return Err(Violation::DoubleBooked {
                            what, row: r.row, col: *c, first: res.clone(), second: res.clone(),
                        });
                    }
                    book(cells, what, (r.row, *c), res)?;
                }
            }
            for r in m.rows.iter().chain(m.color_maprams.iter()) {
                for c in &r.mapcols {
                    book(&mut maprams, "mapram", (r.row, *c), res)?;
                }
            }
        }
    }

    Ok(())
}

/// One key per crossbar byte, one owner per hash bit and distribution slot.
fn check_ixbar(alloc: &StageAlloc) -> Result<(), Violation> {
    let mut bytes: HashMap<ByteLoc, (&ByteKey, &str)> = HashMap::new();
    let mut hash: Cells = HashMap::new();
    let mut dist: Cells = HashMap::new();
    for t in alloc.tables.values() {
        let uses = std::iter::once(&t.ixbar.match_ixbar).chain(t.ixbar.gateway_ixbar.iter());
        for p in uses.clone().flat_map(|u| u.bytes.iter()) {
            if let Some((key, who)) = bytes.insert(p.loc, (&p.key, t.name.as_str())) {
                if *key != p.key {
                    return Err(Violation::Crossbar {
                        loc:    p.loc,
                        first:  format!("{key} ({who})"),
                        second: format!("{} ({})", p.key, t.name),
                    });
                }
            }
        }
        for h in uses.filter_map(|u| u.hash.as_ref()) {
            for b in h.bits.iter() {
                book(&mut hash, "hash bit", (h.function, b), t.name.as_str())?;
            }
        }
        for d in &t.ixbar.hash_dist {
            book(&mut dist, "hash distribution slot", (d.unit, d.slice), &d.owner)?;
            for b in d.bits.lo..d.bits.hi {
                book(&mut hash, "hash bit", (d.function, b), &d.owner)?;
            }
        }
    }

    Ok(())
}

/// Search buses carry one key, result buses serve one table.
fn check_buses(alloc: &StageAlloc) -> Result<(), Violation> {
    let mut search: HashMap<(usize, usize), String> = HashMap::new();
    let mut result: Cells = HashMap::new();
    let tables = alloc.tables.values();
    for t in tables.clone() {
        let label = t.ixbar.match_ixbar.search_label();
        for m in t.memuse.values().filter(|m| matches!(m.kind, MemKind::Exact | MemKind::Atcam | MemKind::Dleft)) {
            for r in &m.rows {
                for b in &r.buses {
                    match *b {
                        BusRef::Search(i)   => {
                            let prev = search.entry((r.row, i)).or_insert_with(|| label.clone());
                            if *prev != label {
                                return Err(Violation::DoubleBooked {
                                    what: "search bus", row: r.row, col: i,
                                    first: prev.clone(), second: label,
                                });
                            }
                        },
                        BusRef::Result(i)   => book(&mut result, "result bus", (r.row, i), &t.name)?,
                        _                   => {},
                    }
                }
            }
        }
    }
    // Gateways either ride their table's search bus or own one.
    for t in tables {
        let label = t.ixbar.match_ixbar.search_label();
        let own = format!("gw:{}", t.name);
        for m in t.memuse.values().filter(|m| matches!(m.kind, MemKind::Gateway | MemKind::Payload)) {
            for r in &m.rows {
                for b in &r.buses {
                    match *b {
                        BusRef::Search(i)   => {
                            let prev = search.entry((r.row, i)).or_insert_with(|| own.clone());
                            if *prev != label && *prev != own {
                                return Err(Violation::DoubleBooked {
                                    what: "search bus", row: r.row, col: i,
                                    first: prev.clone(), second: own,
                                });
                            }
                        },
                        BusRef::Result(i)   => book(&mut result, "result bus", (r.row, i), &t.name)?,
                        _                   => {},
                    }
                }
            }
        }
    }

    Ok(())
}

/// ATCAM partitions and d-left slices live in one row each; d-left
/// slices of a table also share a half.
fn check_single_rows(res: &str, m: &MemUse) -> Result<(), Violation> {
    let scattered = |reason: String| Err(Violation::Scattered { resource: res.to_string(), reason });
    let rows = m.rows.iter().into_group_map_by(|r| r.way);
    for (way, rs) in rows.iter().sorted_by_key(|(w, _)| **w) {
        if rs.iter().map(|r| r.row).unique().count() > 1 {
            return scattered(format!("part {way} spans several rows"));
        }
    }
    if m.kind == MemKind::Dleft {
        let sides = m.rows.iter()
            .flat_map(|r| r.cols.iter().map(|c| Side::of_column(*c)))
            .unique()
            .count();
        if sides > 1 {
            return scattered("slices in both halves".to_string());
        }
    }

    Ok(())
}

/// Rows of a wide word agree on columns, single-row parts stay in one
/// row, and overflowing resources stay within reach of their home row.
fn check_shapes(alloc: &StageAlloc) -> Result<(), Violation> {
    for (res, m) in alloc.tables.values().flat_map(|t| t.memuse.iter()) {
        if matches!(m.kind, MemKind::Atcam | MemKind::Dleft) {
            check_single_rows(res, m)?;
        }
        if m.kind == MemKind::Exact {
            let mut words: HashMap<(usize, &[u32]), &[usize]> = HashMap::new();
            for r in &m.rows {
                let cols = words.entry((r.way, r.vpns.as_slice())).or_insert(r.cols.as_slice());
                if *cols != r.cols.as_slice() {
                    return Err(Violation::WideColumns { resource: res.clone(), vpn: r.vpns.clone() });
                }
            }
        }
        if let (MemKind::Attached(_), Some(home)) = (m.kind, m.home_row) {
            let lowest = home.saturating_sub(MAX_OVERFLOW_ROWS);
            for r in m.rows.iter().chain(m.color_maprams.iter()) {
                if r.row > home || r.row < lowest {
                    return Err(Violation::Overflow { resource: res.clone(), home, row: r.row });
                }
            }
        }
    }

    Ok(())
}

fn expect(table: &str, resource: &str, what: &'static str, found: usize, expected: u64) -> Result<(), Violation> {
    if found as u64 == expected {
        return Ok(());
    }
    Err(Violation::Capacity {
        table:      table.to_string(),
        resource:   resource.to_string(),
        what,
        found,
        expected:   expected as usize,
    })
}

/// Every table got exactly the RAMs its layout asks for.
fn check_capacity(alloc: &StageAlloc, requests: &[TableRequest]) -> Result<(), Violation> {
    let none = MemUse { kind: MemKind::Payload, rows: vec![], home_row: None, color_maprams: vec![] };
    for req in requests {
        let Some(t) = alloc.table(&req.name) else {
            return Err(Violation::Limits(format!("{} has no allocation", req.name)));
        };
        let name = req.name.as_str();
        let own = t.memuse.get(name).unwrap_or(&none);
        let layout = &req.layout;
        match layout.kind {
            MatchKind::Exact | MatchKind::Dleft => {
                for (w, depth) in layout.way_depths().into_iter().enumerate() {
                    let cells = own.rows.iter().filter(|r| r.way == w).map(|r| r.cols.len()).sum::<usize>();
                    expect(name, name, "srams", cells, depth * layout.match_width as u64)?;
                }
            },
            MatchKind::Atcam    => {
                let depth: u64 = layout.partition_depths().iter().sum();
                expect(name, name, "srams", own.ram_count(), depth * layout.match_width as u64)?;
            },
            MatchKind::Ternary  => {
                let width = t.ixbar.match_ixbar.groups().popcount().max(1) as u64;
                expect(name, name, "tcams", own.ram_count(), layout.tcam_depth() * width)?;
                let tind = format!("{name}$tind");
                let found = t.memuse.get(&tind).map_or(0, |m| m.ram_count());
                expect(name, &tind, "srams", found, layout.tind_rams())?;
            },
            MatchKind::HashAction | MatchKind::NoMatch => {},
        }
        for a in &req.attached {
            let m = t.memuse.get(&a.name).unwrap_or(&none);
            match a.kind {
                AttachedKind::IdleTime { .. } => {
                    expect(name, &a.name, "maprams", m.mapram_count(), a.idletime_maprams())?;
                },
                _ => {
                    expect(name, &a.name, "srams", m.ram_count(), a.total_rams())?;
                    let maps = if a.kind.is_synth2port() { a.total_rams() } else { 0 } + a.color_maprams();
                    expect(name, &a.name, "maprams", m.mapram_count(), maps)?;
                },
            }
        }
    }

    Ok(())
}

/// Logical ids are distinct, in range, and one per partition or slice.
fn check_logical_ids(alloc: &StageAlloc, requests: &[TableRequest]) -> Result<(), Violation> {
    let mut seen: HashMap<usize, &str> = HashMap::new();
    for t in alloc.tables.values() {
        for id in &t.logical_ids {
            if *id >= TABLES_MAX {
                return Err(Violation::Limits(format!("{}: logical id {id} out of range", t.name)));
            }
            if let Some(prev) = seen.insert(*id, &t.name) {
                return Err(Violation::Limits(format!("logical id {id} given to {prev} and {}", t.name)));
            }
        }
    }
    for req in requests {
        let found = alloc.table(&req.name).map_or(0, |t| t.logical_ids.len());
        if found != req.layout.logical_tables() {
            return Err(Violation::Limits(format!(
                "{}: {found} logical ids for {} parts", req.name, req.layout.logical_tables()
            )));
        }
    }

    Ok(())
}

/// Checks a finished stage against the hardware rules: no cell, byte,
/// hash bit or bus is double-booked, wide words are consistent,
/// overflow stays in reach, tables got exactly the memory they asked
/// for, and logical table limits hold.
pub fn verify_stage(alloc: &StageAlloc, requests: &[TableRequest]) -> Result<(), Violation> {
    check_logical_ids(alloc, requests)?;
    let ternary = alloc.tables.values().filter(|t| t.kind == MatchKind::Ternary).count();
    if ternary > TERNARY_TABLES_MAX {
        return Err(Violation::Limits(format!("{ternary} ternary tables")));
    }
    check_cells(alloc)?;
    check_ixbar(alloc)?;
    check_buses(alloc)?;
    check_shapes(alloc)?;
    check_capacity(alloc, requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::StageAllocator;
    use crate::memories::MemRow;

    fn phv() -> HashMap<String, ContainerSlot> {
        HashMap::from([
            ("a".to_string(), ContainerSlot::new("W0", 32, 0)),
            ("b".to_string(), ContainerSlot::new("W1", 32, 0)),
        ])
    }

    fn two_tables() -> (StageAlloc, Vec<TableRequest>) {
        let reqs = vec![
            TableRequest::exact("x", vec![KeyField::exact("a", 32)], 2048)
                .attach(AttachedResource::new("m", AttachedKind::Meter { color_maps: true }, 2048)),
            TableRequest::exact("y", vec![KeyField::exact("b", 32)], 1024),
        ];
        let alloc = StageAllocator::new(0, AllocOptions::default()).allocate(&reqs, &phv()).unwrap();
        (alloc, reqs)
    }

    #[test]
    fn test_clean_stage_passes() {
        let (alloc, reqs) = two_tables();
        assert_eq!(verify_stage(&alloc, &reqs), Ok(()));
    }

    #[test]
    fn test_double_booking_caught() {
        let (mut alloc, reqs) = two_tables();
        let stolen = alloc.tables["x"].memuse["x"].rows[0].clone();
        let y = alloc.tables.get_mut("y").unwrap().memuse.get_mut("y").unwrap();
        y.rows[0].row = stolen.row;
        y.rows[0].cols = vec![stolen.cols[0]];
        assert!(matches!(verify_stage(&alloc, &reqs), Err(Violation::DoubleBooked { what: "sram", .. })));
    }

    #[test]
    fn test_overflow_caught() {
        let (mut alloc, reqs) = two_tables();
        let m = alloc.tables.get_mut("x").unwrap().memuse.get_mut("m").unwrap();
        m.home_row = Some(7);
        m.rows.push(MemRow { row: 0, ..Default::default() });
        assert!(matches!(verify_stage(&alloc, &reqs), Err(Violation::Overflow { home: 7, row: 0, .. })));
    }

    #[test]
    fn test_missing_capacity_caught() {
        let (mut alloc, reqs) = two_tables();
        let x = alloc.tables.get_mut("x").unwrap().memuse.get_mut("x").unwrap();
        x.rows[0].cols.pop();
        assert!(matches!(verify_stage(&alloc, &reqs), Err(Violation::Capacity { .. })));
    }

    #[test]
    fn test_split_slices_caught() {
        let reqs = vec![TableRequest::dleft("d", vec![KeyField::exact("a", 32)], 4 * 1024, 2)];
        let mut alloc = StageAllocator::new(0, AllocOptions::default()).allocate(&reqs, &phv()).unwrap();
        assert_eq!(verify_stage(&alloc, &reqs), Ok(()));
        let d = alloc.tables.get_mut("d").unwrap().memuse.get_mut("d").unwrap();
        let moved = d.rows.iter_mut().find(|r| r.way == 1).unwrap();
        moved.cols = vec![0, 1];
        assert!(matches!(verify_stage(&alloc, &reqs), Err(Violation::Scattered { .. })));
    }

    #[test]
    fn test_logical_ids_checked() {
        let (mut alloc, reqs) = two_tables();
        assert_eq!(alloc.tables["x"].logical_ids, vec![0]);
        alloc.tables.get_mut("y").unwrap().logical_ids = vec![0];
        assert!(matches!(verify_stage(&alloc, &reqs), Err(Violation::Limits(_))));
    }

    #[test]
    fn test_crossbar_conflict_caught() {
        let (mut alloc, reqs) = two_tables();
        let loc = alloc.tables["x"].ixbar.match_ixbar.bytes[0].loc;
        alloc.tables.get_mut("y").unwrap().ixbar.match_ixbar.bytes[0].loc = loc;
        assert!(matches!(verify_stage(&alloc, &reqs), Err(Violation::Crossbar { .. })));
    }
}

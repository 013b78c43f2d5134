//! RAM, map-RAM and TCAM placement for one stage.
//!
//! Everything placed is first turned into an [`SramGroup`] living in an
//! arena owned by [`Memories`]; the placement passes only pass
//! [`GroupId`]s around. A failed pass leaves the arrays half-written, so
//! [`Memories::allocate_all`] wipes them and starts over with a
//! different split between the match columns and the rest.

pub mod exact;
pub mod ternary;
pub mod atcam;
pub mod dleft;
pub mod swbox;
pub mod idletime;
pub mod gateway;

use crate::helpe::*;
use crate::ixbar::TableIxbar;

/// Handle of an [`SramGroup`] in the arena.
pub type GroupId = usize;

/// What a piece of memory is used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemKind {
    Exact,
    Atcam,
    /// A d-left hash slice.
    Dleft,
    Ternary,
    /// Ternary indirection.
    Tind,
    Gateway,
    /// Result bus of a table matching no RAM.
    Payload,
    Attached(AttachedKind),
}

/// A bus claimed on some row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusRef {
    Search(usize),
    Result(usize),
    Tind(usize),
    Idletime(usize),
    Gateway(usize),
    Action(Side),
    Overflow,
    StatsAddr,
}

/// Memory used on one row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemRow {
    pub row:        usize,
    pub buses:      Vec<BusRef>,
    pub cols:       Vec<usize>,
    pub mapcols:    Vec<usize>,
    /// Virtual page number of every column, in `cols` order.
    pub vpns:       Vec<u32>,
    /// Way, partition or slice the row belongs to.
    pub way:        usize,
}

/// Memory of one resource of one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemUse {
    pub kind:           MemKind,
    pub rows:           Vec<MemRow>,
    /// Row exposing the resource's bus, for overflowing resources.
    pub home_row:       Option<usize>,
    pub color_maprams:  Vec<MemRow>,
}

impl MemUse {
    /// SRAMs (or TCAMs) occupied.
    pub fn ram_count(&self) -> usize {
        self.rows.iter().map(|r| r.cols.len()).sum()
    }

    pub fn mapram_count(&self) -> usize {
        self.rows.iter().chain(self.color_maprams.iter()).map(|r| r.mapcols.len()).sum()
    }
}

/// One placement request: a hash way, an ATCAM partition, an
/// indirection table, an attached resource and so on.
#[derive(Clone, Debug)]
pub struct SramGroup {
    pub table:      String,
    pub resource:   String,
    pub kind:       MemKind,
    pub way:        usize,
    /// Depth units (RAMs per row of the word) to place.
    pub depth:      u64,
    /// Rows a single word spans.
    pub width:      usize,
    pub placed:     u64,
    /// Search bus identity; empty when the group needs no search bus.
    pub label:      String,
    pub home:       Option<(usize, Side)>,
    pub rows:       Vec<MemRow>,
    pub color_rows: Vec<MemRow>,
    /// The selector addressing this action data.
    pub selector:   Option<GroupId>,
}

impl SramGroup {
    pub fn new(table: &str, resource: &str, kind: MemKind, depth: u64) -> Self {
        Self {
            table:      table.to_string(),
            resource:   resource.to_string(),
            kind,
            way:        0,
            depth,
            width:      1,
            placed:     0,
            label:      String::new(),
            home:       None,
            rows:       vec![],
            color_rows: vec![],
            selector:   None,
        }
    }

    #[inline(always)]
    pub fn left(&self) -> u64 {
        self.depth - self.placed
    }

    /// Hands out the next `n` virtual page numbers.
    pub fn take_vpns(&mut self, n: usize) -> Vec<u32> {
        let first = self.placed as u32;
        self.placed += n as u64;
        assert!(self.placed <= self.depth, "{} placed past its depth", self.resource);
        (first..first + n as u32).collect()
    }

    pub fn is_synth2port(&self) -> bool {
        matches!(self.kind, MemKind::Attached(k) if k.is_synth2port())
    }
}

/// A table as the memory allocator sees it.
#[derive(Clone, Debug)]
pub struct TableInfo {
    pub req:            TableRequest,
    /// One per partition or slice, in order.
    pub logical_ids:    Vec<usize>,
    pub search_label:   String,
    pub ternary_width:  usize,
    pub midbyte:        bool,
}

impl TableInfo {
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.req.name
    }

    #[inline(always)]
    pub fn kind(&self) -> MatchKind {
        self.req.layout.kind
    }
}

#[derive(Clone, Debug)]
pub struct Memories {
    pub(crate) sram_use:        Alloc2D<String>,
    pub(crate) mapram_use:      Alloc2D<String>,
    pub(crate) tcam_use:        Alloc2D<String>,
    pub(crate) search_bus:      Alloc2D<String>,
    pub(crate) result_bus:      Alloc2D<String>,
    pub(crate) tind_bus:        Alloc2D<String>,
    pub(crate) gateway_use:     Alloc2D<String>,
    pub(crate) idletime_bus:    Alloc2D<String>,
    /// Indexed by [`Side::index`].
    pub(crate) action_bus:      Alloc2D<String>,
    pub(crate) overflow_bus:    Alloc2D<String>,
    pub(crate) stats_bus:       Alloc2D<String>,
    pub(crate) alu_use:         Alloc2D<String>,
    pub(crate) groups:          Vec<SramGroup>,
    tables:                     Vec<TableInfo>,
    results:                    IndexMap<String, IndexMap<String, MemUse>>,
    /// SRAM columns `0..match_cols` take match data.
    match_cols:                 usize,
    initial_match_cols:         usize,
    pub(crate) max_overflow:    usize,
}

/// Bus `row` can offer `owner`: one it already holds, else a free one.
pub(crate) fn pick_bus(buses: &Alloc2D<String>, row: usize, owner: &str) -> Option<usize> {
    (0..buses.cols())
        .find(|b| buses.get(row, *b).is_some_and(|o| o == owner))
        .or_else(|| (0..buses.cols()).find(|b| buses.is_free(row, *b)))
}

/// Claims bus `b` of `row` unless `owner` already holds it.
pub(crate) fn hold_bus(buses: &mut Alloc2D<String>, row: usize, b: usize, owner: &str) {
    match buses.get(row, b) {
        Some(o) => assert!(o == owner, "bus {b} of row {row} belongs to {o}, not {owner}"),
        None    => buses.claim(row, b, owner.to_string()),
    }
}

impl Memories {
    pub fn new(options: &AllocOptions) -> Self {
        let match_cols = options.initial_match_columns.clamp(1, SRAM_COLUMNS);
        Self {
            sram_use:           Alloc2D::new("srams", SRAM_ROWS, SRAM_COLUMNS),
            mapram_use:         Alloc2D::new("maprams", SRAM_ROWS, MAPRAM_COLUMNS),
            tcam_use:           Alloc2D::new("tcams", TCAM_ROWS, TCAM_COLUMNS),
            search_bus:         Alloc2D::new("search_bus", SRAM_ROWS, BUS_COUNT),
            result_bus:         Alloc2D::new("result_bus", SRAM_ROWS, PAYLOAD_COUNT),
            tind_bus:           Alloc2D::new("tind_bus", SRAM_ROWS, TIND_BUSES),
            gateway_use:        Alloc2D::new("gateways", SRAM_ROWS, GATEWAYS_PER_ROW),
            idletime_bus:       Alloc2D::new("idletime_bus", SRAM_ROWS, IDLETIME_BUSES),
            action_bus:         Alloc2D::new("action_bus", SRAM_ROWS, 2),
            overflow_bus:       Alloc2D::new("overflow_bus", SRAM_ROWS, 1),
            stats_bus:          Alloc2D::new("stats_bus", SRAM_ROWS, 1),
            alu_use:            Alloc2D::new("alus", SRAM_ROWS, 1),
            groups:             vec![],
            tables:             vec![],
            results:            IndexMap::new(),
            match_cols,
            initial_match_cols: match_cols,
            max_overflow:       options.overflow_rows(),
        }
    }

    /// Wipes every placement but keeps the tables.
    pub fn clear(&mut self) {
        self.sram_use.clear();
        self.mapram_use.clear();
        self.tcam_use.clear();
        self.search_bus.clear();
        self.result_bus.clear();
        self.tind_bus.clear();
        self.gateway_use.clear();
        self.idletime_bus.clear();
        self.action_bus.clear();
        self.overflow_bus.clear();
        self.stats_bus.clear();
        self.alu_use.clear();
        self.groups.clear();
        self.results.clear();
    }

    /// Forgets the tables too.
    pub fn reset(&mut self) {
        self.clear();
        self.tables.clear();
        self.match_cols = self.initial_match_cols;
    }

    #[inline(always)]
    pub fn match_columns(&self) -> usize {
        self.match_cols
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    /// Registers a table whose crossbar use is known.
    /// ATCAM partitions and d-left slices take a logical id each.
    pub fn add_table(&mut self, req: &TableRequest, ixbar: &TableIxbar) -> AllocResult<()> {
        let ternary = self.tables.iter().filter(|t| t.kind() == MatchKind::Ternary).count();
        let first = self.tables.iter().map(|t| t.logical_ids.len()).sum::<usize>();
        let needed = req.layout.logical_tables();
        if first + needed > TABLES_MAX {
            return Err(AllocError::memory(MemPhase::Fixed,
                format!("too many logical tables (adding {}, {needed} ids)", req.name)));
        }
        if req.layout.kind == MatchKind::Ternary && ternary >= TERNARY_TABLES_MAX {
            return Err(AllocError::memory(MemPhase::Fixed,
                format!("too many ternary tables (adding {})", req.name)));
        }
        let m = &ixbar.match_ixbar;
        self.tables.push(TableInfo {
            req:            req.clone(),
            logical_ids:    (first..first + needed).collect(),
            search_label:   m.search_label(),
            ternary_width:  if m.ternary { m.groups().popcount().max(1) } else { 0 },
            midbyte:        m.uses_midbyte(),
        });

        Ok(())
    }

    pub(crate) fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name() == name)
    }

    /// Logical ids handed to `table`, empty for an unknown table.
    pub fn logical_ids(&self, table: &str) -> Vec<usize> {
        self.table(table).map(|t| t.logical_ids.clone()).unwrap_or_default()
    }

    /// Free SRAM columns of the match region of `row`.
    #[inline(always)]
    pub(crate) fn match_free(&self, row: usize) -> Bitvec {
        self.sram_use.free_in_row(row) & Bitvec::range(0..self.match_cols)
    }

    /// Search and result buses of `row` usable by a group, if both exist.
    pub(crate) fn match_buses(&self, row: usize, label: &str, table: &str) -> Option<(usize, usize)> {
        let search = pick_bus(&self.search_bus, row, label)?;
        let result = pick_bus(&self.result_bus, row, table)?;

        Some((search, result))
    }

    pub(crate) fn add_group(&mut self, g: SramGroup) -> GroupId {
        self.groups.push(g);
        self.groups.len() - 1
    }

    /// Places SRAM columns `cols` of `row` for group `id`, wide words
    /// included, and records the row.
    pub(crate) fn place_row(
        &mut self,
        id:     GroupId,
        row:    usize,
        cols:   &[usize],
        buses:  Vec<BusRef>,
        vpns:   Vec<u32>,
    ) {
        let owner = self.groups[id].resource.clone();
        for c in cols {
            self.sram_use.claim(row, *c, owner.clone());
        }
        for b in &buses {
            match *b {
                BusRef::Search(i)   => hold_bus(&mut self.search_bus, row, i, &self.groups[id].label),
                BusRef::Result(i)   => hold_bus(&mut self.result_bus, row, i, &self.groups[id].table),
                BusRef::Tind(i)     => hold_bus(&mut self.tind_bus, row, i, &owner),
                _                   => {},
            }
        }
        let way = self.groups[id].way;
        self.groups[id].rows.push(MemRow {
            row,
            buses,
            cols:       cols.to_vec(),
            mapcols:    vec![],
            vpns,
            way,
        });
    }

    /// One attempt at the current split.
    fn try_allocate(&mut self) -> AllocResult<()> {
        self.allocate_all_atcam()?;
        self.allocate_all_dleft()?;
        self.allocate_all_exact()?;
        self.allocate_all_ternary()?;
        self.allocate_all_tind()?;
        self.allocate_all_swbox_users()?;
        self.allocate_all_idletime()?;
        self.allocate_all_gateways()?;
        self.allocate_all_payloads()
    }

    /// Places every registered table. A failure caused by the match
    /// region moves the split one column towards attached resources,
    /// and the other way round; a split is never tried twice.
    pub fn allocate_all(&mut self) -> AllocResult<()> {
        let mut split = self.initial_match_cols;
        let mut tried = BTreeSet::new();
        loop {
            tried.insert(split);
            self.clear();
            self.match_cols = split;
            let err = match self.try_allocate() {
                Ok(())  => {
                    self.collect_results();
                    debug!("memories: {} tables placed with {split} match columns", self.tables.len());
                    return Ok(());
                },
                Err(e)  => e,
            };
            let next = match &err {
                AllocError::Memory { phase: MemPhase::Match, .. }      => Some(split + 1),
                AllocError::Memory { phase: MemPhase::Attached, .. }   => split.checked_sub(1),
                _                                                       => None,
            };
            match next {
                Some(n) if (1..=SRAM_COLUMNS).contains(&n) && !tried.contains(&n) => {
                    warn!("memories: {err}; retrying with {n} match columns");
                    split = n;
                },
                _ => {
                    self.clear();
                    return Err(err);
                },
            }
        }
    }

    /// Turns the arena into per-table records.
    fn collect_results(&mut self) {
        let mut results: IndexMap<String, IndexMap<String, MemUse>> = IndexMap::new();
        for t in &self.tables {
            let attached = t.req.attached.iter().map(|a| a.name.as_str()).collect::<HashSet<_>>();
            let mut uses: IndexMap<String, MemUse> = IndexMap::new();
            for g in &self.groups {
                let mine = match g.kind {
                    MemKind::Attached(_)    => attached.contains(g.resource.as_str()),
                    _                       => g.table == t.req.name,
                };
                if !mine {
                    continue;
                }
                let entry = uses.entry(g.resource.clone()).or_insert_with(|| MemUse {
                    kind:           g.kind,
                    rows:           vec![],
                    home_row:       None,
                    color_maprams:  vec![],
                });
                entry.rows.extend(g.rows.iter().cloned());
                entry.color_maprams.extend(g.color_rows.iter().cloned());
                if let Some((row, _)) = g.home {
                    entry.home_row = Some(row);
                }
            }
            results.insert(t.req.name.clone(), uses);
        }
        self.results = results;
    }

    /// Memory of every resource of `table`, after a successful
    /// [`allocate_all`](Self::allocate_all).
    pub fn memuse(&self, table: &str) -> IndexMap<String, MemUse> {
        self.results.get(table).cloned().unwrap_or_default()
    }

    pub fn sram_map(&self) -> &Alloc2D<String> {
        &self.sram_use
    }

    pub fn mapram_map(&self) -> &Alloc2D<String> {
        &self.mapram_use
    }

    pub fn tcam_map(&self) -> &Alloc2D<String> {
        &self.tcam_use
    }
}

impl fmt::Display for Memories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sram_use)?;
        write!(f, "{}", self.mapram_use)?;
        write!(f, "{}", self.tcam_use)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ixbar::{IxbarUse, TableIxbar};

    /// A crossbar record good enough for the memory allocator: exact
    /// tables read group 0, ternary ones `width` groups.
    pub(crate) fn fake_ixbar(req: &TableRequest, width: usize) -> TableIxbar {
        use crate::ixbar::{ByteLoc, BytePlacement};
        let ternary = req.layout.kind == MatchKind::Ternary;
        let bytes = (0..width.max(1))
            .map(|g| BytePlacement {
                key:    ByteKey { container: format!("{}_{g}", req.name), byte: 0 },
                field:  req.name.clone(),
                loc:    if ternary {
                    ByteLoc::Ternary { group: g, byte: 0 }
                } else {
                    ByteLoc::Exact { group: g, byte: 0 }
                },
                group:  g,
                reused: false,
            })
            .collect();
        TableIxbar {
            match_ixbar:    IxbarUse { ternary, bytes, hash: None },
            gateway_ixbar:  None,
            hash_dist:      vec![],
        }
    }

    pub(crate) fn memories_with(reqs: &[TableRequest]) -> Memories {
        let mut mem = Memories::new(&AllocOptions::default());
        for r in reqs {
            mem.add_table(r, &fake_ixbar(r, 1)).unwrap();
        }
        mem
    }

    #[test]
    fn test_logical_table_limits() {
        let mut mem = Memories::new(&AllocOptions::default());
        for i in 0..TERNARY_TABLES_MAX {
            let t = TableRequest::ternary(&format!("t{i}"), vec![], 512);
            mem.add_table(&t, &fake_ixbar(&t, 1)).unwrap();
        }
        let extra = TableRequest::ternary("t8", vec![], 512);
        let err = mem.add_table(&extra, &fake_ixbar(&extra, 1)).unwrap_err();
        assert!(err.to_string().contains("too many ternary tables"));
        for i in TERNARY_TABLES_MAX..TABLES_MAX {
            let t = TableRequest::exact(&format!("e{i}"), vec![], 1024);
            mem.add_table(&t, &fake_ixbar(&t, 1)).unwrap();
        }
        let extra = TableRequest::exact("e16", vec![], 1024);
        assert!(mem.add_table(&extra, &fake_ixbar(&extra, 1)).is_err());
    }

    #[test]
    fn test_partitions_take_logical_ids() {
        let lpm = TableRequest::atcam("lpm", vec![], 4 * 1024, 4);
        let learn = TableRequest::dleft("learn", vec![], 3 * 1024, 3);
        let fwd = TableRequest::exact("fwd", vec![], 1024).with_ways(2);
        let mut mem = memories_with(&[lpm, learn, fwd]);
        assert_eq!(mem.logical_ids("lpm"), vec![0, 1, 2, 3]);
        assert_eq!(mem.logical_ids("learn"), vec![4, 5, 6]);
        assert_eq!(mem.logical_ids("fwd"), vec![7]);
        // Eight ids left; nine partitions don't fit.
        let big = TableRequest::atcam("big", vec![], 9 * 1024, 9);
        let err = mem.add_table(&big, &fake_ixbar(&big, 1)).unwrap_err();
        assert!(err.to_string().contains("too many logical tables"));
        let ok = TableRequest::atcam("ok", vec![], 8 * 1024, 8);
        mem.add_table(&ok, &fake_ixbar(&ok, 1)).unwrap();
        assert_eq!(mem.logical_ids("ok"), (8..16).collect_vec());
    }

    #[test]
    fn test_split_moves_towards_attached() {
        // One way of 60 RAMs and a 13-RAM counter: the counter only
        // finds room once the match region gives up two columns.
        let t = TableRequest::exact("big", vec![], 60 * 1024)
            .attach(AttachedResource::new("cnt", AttachedKind::Counter { per_word: 1 }, 12 * 1024));
        let mut mem = memories_with(&[t]);
        mem.allocate_all().unwrap();
        assert_eq!(mem.match_columns(), 8);
        let uses = mem.memuse("big");
        assert_eq!(uses["big"].ram_count(), 60);
        assert_eq!(uses["cnt"].ram_count(), 13);
        assert_eq!(uses["cnt"].mapram_count(), 13);
    }

    #[test]
    fn test_failure_keeps_reason() {
        let t = TableRequest::exact("huge", vec![], 75 * 1024)
            .attach(AttachedResource::new("cnt", AttachedKind::Counter { per_word: 1 }, 12 * 1024));
        let mut mem = memories_with(&[t]);
        let err = mem.allocate_all().unwrap_err();
        assert!(matches!(err, AllocError::Memory { .. }));
        assert!(!err.to_string().is_empty());
        assert_eq!(mem.sram_map().occupied().count(), 0);
    }

    #[test]
    fn test_clear_keeps_tables() {
        let t = TableRequest::exact("t", vec![], 1024);
        let mut mem = memories_with(&[t]);
        mem.allocate_all().unwrap();
        assert_eq!(mem.sram_map().occupied().count(), 1);
        mem.clear();
        assert_eq!(mem.sram_map().occupied().count(), 0);
        assert_eq!(mem.tables().len(), 1);
        mem.allocate_all().unwrap();
        assert_eq!(mem.memuse("t")["t"].rows[0].cols, vec![0]);
    }
}

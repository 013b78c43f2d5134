use crate::{helpe::*, memories::{MemKind, MemUse}};

/// Whether the rows of `m` are TCAM rather than SRAM cells.
#[inline(always)]
fn in_tcams(m: &MemUse) -> bool {
    m.kind == MemKind::Ternary
}

impl TableAlloc {
    /// SRAMs this table reads, shared resources included.
    pub fn srams(&self) -> usize {
        self.memuse.values().filter(|m| !in_tcams(m)).map(|m| m.ram_count()).sum()
    }

    pub fn tcams(&self) -> usize {
        self.memuse.values().filter(|m| in_tcams(m)).map(|m| m.ram_count()).sum()
    }

    /// Hash ways of the match key, empty for tables without one.
    pub fn ways(&self) -> usize {
        self.ixbar.match_ixbar.hash.as_ref().map_or(0, |h| h.ways.len())
    }

    /// Every SRAM cell, as `(row, column)`.
    pub fn sram_cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.memuse.values()
            .filter(|m| !in_tcams(m))
            .flat_map(|m| m.rows.iter())
            .flat_map(|r| r.cols.iter().map(move |c| (r.row, *c)))
    }
}

impl StageAlloc {
    #[inline(always)]
    pub fn table(&self, name: &str) -> Option<&TableAlloc> {
        self.tables.get(name)
    }

    /// Distinct SRAMs in use; a shared resource counts once.
    pub fn srams_used(&self) -> usize {
        self.tables.values()
            .flat_map(|t| t.sram_cells())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Distinct TCAMs in use.
    pub fn tcams_used(&self) -> usize {
        self.tables.values()
            .flat_map(|t| t.memuse.values())
            .filter(|m| in_tcams(m))
            .flat_map(|m| m.rows.iter().flat_map(|r| r.cols.iter().map(move |c| (r.row, *c))))
            .collect::<HashSet<_>>()
            .len()
    }

    /// Distinct map-RAMs in use, color maps included.
    pub fn maprams_used(&self) -> usize {
        self.tables.values()
            .flat_map(|t| t.memuse.values())
            .flat_map(|m| m.rows.iter().chain(m.color_maprams.iter()))
            .flat_map(|r| r.mapcols.iter().map(move |c| (r.row, *c)))
            .collect::<HashSet<_>>()
            .len()
    }
}

impl fmt::Display for StageAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stage {}: {} tables, {} match columns, {} srams, {} maprams, {} tcams",
            self.stage, self.tables.len(), self.match_columns,
            self.srams_used(), self.maprams_used(), self.tcams_used())?;
        for t in self.tables.values() {
            write!(f, "  {:<16} {:?}", t.name, t.kind)?;
            if let Some(h) = &t.ixbar.match_ixbar.hash {
                write!(f, " hash{} x{}", h.function, h.ways.len())?;
            }
            write!(f, " ixbar {}B", t.ixbar.match_ixbar.bytes.len())?;
            for (res, m) in &t.memuse {
                write!(f, " {res}:{}", m.ram_count())?;
                if let Some(home) = m.home_row {
                    write!(f, "@{home}")?;
                }
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

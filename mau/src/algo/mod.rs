use crate::{
    check::verify_stage,
    helpe::*,
    ixbar::IXBar,
    memories::Memories,
};

/// Owns the crossbar and RAM state of one stage. Every call to
/// [`allocate`](Self::allocate) starts from an empty stage.
///
/// Stages share nothing: to allocate several of them in parallel give
/// each its own allocator, as [`allocate_stages`] does.
#[derive(Clone, Debug)]
pub struct StageAllocator {
    stage:      usize,
    options:    AllocOptions,
    ixbar:      IXBar,
    memories:   Memories,
}

impl StageAllocator {
    pub fn new(stage: usize, options: AllocOptions) -> Self {
        let mut ixbar = IXBar::new(stage, options.hash_seed);
        ixbar.hash.set_sharing(options.allow_sharing);
        let memories = Memories::new(&options);

        Self { stage, options, ixbar, memories }
    }

    #[inline(always)]
    pub fn stage(&self) -> usize {
        self.stage
    }

    #[inline(always)]
    pub fn options(&self) -> &AllocOptions {
        &self.options
    }

    /// Crossbar state after the last allocation.
    pub fn ixbar(&self) -> &IXBar {
        &self.ixbar
    }

    /// RAM state after the last allocation.
    pub fn memories(&self) -> &Memories {
        &self.memories
    }

    /// Places `requests` in this stage.
    ///
    /// Every table goes through the crossbar first, in request order: its
    /// hash function decides which search buses its RAM rows can share.
    /// Then all tables go through memory allocation together.
    ///
    /// On failure the stage is left empty and the error names what ran
    /// out. Callers usually react by trying a different table set.
    pub fn allocate(&mut self, requests: &[TableRequest], phv: &dyn PhvMap) -> AllocResult<StageAlloc> {
        let start = Instant::now();
        let res = self.allocate_inner(requests, phv);
        match &res {
            Ok(alloc)   => {
                info!("stage {}: {} tables in {} μs ({} srams, {} tcams)",
                    self.stage, alloc.tables.len(), start.elapsed().as_micros(),
                    alloc.srams_used(), alloc.tcams_used());
            },
            Err(e)      => {
                info!("stage {}: allocation failed: {e}", self.stage);
                self.ixbar.clear();
                self.memories.reset();
            },
        }

        res
    }

    fn allocate_inner(&mut self, requests: &[TableRequest], phv: &dyn PhvMap) -> AllocResult<StageAlloc> {
        let mut names = HashSet::new();
        for r in requests {
            r.layout.validate(&r.name)?;
            if !names.insert(r.name.as_str()) {
                return Err(AllocError::Layout {
                    table:  r.name.clone(),
                    reason: "table requested twice".to_string(),
                });
            }
        }

        self.ixbar.clear();
        self.memories.reset();
        let mut ixbars = Vec::with_capacity(requests.len());
        for r in requests {
            let ix = self.ixbar.allocate_table(r, phv)?;
            debug!("stage {}: {} on the crossbar ({} bytes)", self.stage, r.name, ix.match_ixbar.bytes.len());
            self.memories.add_table(r, &ix)?;
            ixbars.push(ix);
        }
        self.memories.allocate_all()?;

        let tables = requests.iter()
            .zip(ixbars)
            .map(|(r, ixbar)| {
                let alloc = TableAlloc {
                    name:           r.name.clone(),
                    kind:           r.layout.kind,
                    logical_ids:    self.memories.logical_ids(&r.name),
                    ixbar,
                    memuse:         self.memories.memuse(&r.name),
                };
                (r.name.clone(), alloc)
            })
            .collect();
        let alloc = StageAlloc {
            stage:          self.stage,
            match_columns:  self.memories.match_columns(),
            tables,
        };
        debug_assert!(verify_stage(&alloc, requests).is_ok(), "{:?}", verify_stage(&alloc, requests));

        Ok(alloc)
    }
}

/// Allocates independent stages in parallel, one allocator each.
/// Results come back in stage order.
pub fn allocate_stages<P>(
    stages:     &[Vec<TableRequest>],
    phv:        &P,
    options:    &AllocOptions,
) -> Vec<AllocResult<StageAlloc>>
where
    P: PhvMap + Sync,
{
    stages.par_iter()
        .enumerate()
        .map(|(i, requests)| StageAllocator::new(i, options.clone()).allocate(requests, phv))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phv() -> HashMap<String, ContainerSlot> {
        HashMap::from([
            ("ipv4.dst".to_string(), ContainerSlot::new("W0", 32, 0)),
            ("ipv4.src".to_string(), ContainerSlot::new("W1", 32, 0)),
            ("tcp.dport".to_string(), ContainerSlot::new("H0", 16, 0)),
            ("meta.flags".to_string(), ContainerSlot::new("B0", 8, 0)),
        ])
    }

    #[test]
    fn test_round_trip() {
        let t = TableRequest::exact("fwd", vec![KeyField::exact("ipv4.dst", 32)], 1024);
        let mut sa = StageAllocator::new(0, AllocOptions::default());
        let a = sa.allocate(&[t.clone()], &phv()).unwrap();
        let fwd = a.table("fwd").unwrap();
        assert_eq!(fwd.ixbar.match_ixbar.bytes[0].loc, crate::ixbar::ByteLoc::Exact { group: 0, byte: 0 });
        assert_eq!(fwd.ixbar.match_ixbar.hash.as_ref().unwrap().function, 0);
        let rows = &fwd.memuse["fwd"].rows;
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].row, rows[0].cols.clone()), (0, vec![0]));

        // Same input, fresh state, same answer.
        let b = StageAllocator::new(0, AllocOptions::default()).allocate(&[t.clone()], &phv()).unwrap();
        assert_eq!(a, b);
        let c = sa.allocate(&[t], &phv()).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_duplicate_names() {
        let t = TableRequest::exact("t", vec![KeyField::exact("ipv4.dst", 32)], 1024);
        let mut sa = StageAllocator::new(0, AllocOptions::default());
        let err = sa.allocate(&[t.clone(), t], &phv()).unwrap_err();
        assert!(matches!(err, AllocError::Layout { .. }));
    }

    #[test]
    fn test_failure_leaves_empty_stage() {
        let ok = TableRequest::exact("ok", vec![KeyField::exact("ipv4.dst", 32)], 1024);
        let big = TableRequest::exact("big", vec![KeyField::exact("ipv4.src", 32)], 100 * 1024);
        let mut sa = StageAllocator::new(0, AllocOptions::default());
        let err = sa.allocate(&[ok, big], &phv()).unwrap_err();
        assert!(matches!(err, AllocError::Memory { .. }));
        assert_eq!(sa.ixbar().slots().count(), 0);
        assert_eq!(sa.memories().sram_map().occupied().count(), 0);
    }

    #[test]
    fn test_mixed_stage() {
        let reqs = vec![
            TableRequest::exact("fwd", vec![KeyField::exact("ipv4.dst", 32)], 4096)
                .with_ways(2)
                .attach(AttachedResource::new("fwd_cnt", AttachedKind::Counter { per_word: 1 }, 4096))
                .attach(AttachedResource::new("fwd_ad", AttachedKind::ActionData { width: 32 }, 4096)),
            TableRequest::ternary("acl", vec![
                KeyField::exact("ipv4.src", 32),
                KeyField::range("tcp.dport", 16),
                KeyField::exact("meta.flags", 4),
            ], 1024).with_tind(2),
            TableRequest::new("nat", MatchKind::HashAction, vec![KeyField::exact("ipv4.src", 32)], 1024),
        ];
        let mut sa = StageAllocator::new(0, AllocOptions::default());
        let a = sa.allocate(&reqs, &phv()).unwrap();
        assert!(verify_stage(&a, &reqs).is_ok());
        assert_eq!(a.table("fwd").unwrap().ways(), 2);
        // Two 512-entry runs, each as tall as the groups the key spans.
        let acl = a.table("acl").unwrap();
        assert_eq!(acl.tcams(), 2 * acl.ixbar.match_ixbar.groups().popcount());
        assert_eq!(a.table("nat").unwrap().ixbar.hash_dist.len(), 1);
        assert!(a.table("fwd").unwrap().memuse["fwd_cnt"].home_row.is_some_and(|r| r % 2 == 0));
    }

    #[test]
    fn test_stages_in_parallel() {
        let stage = |n: usize| {
            (0..n)
                .map(|i| TableRequest::exact(&format!("t{i}"), vec![KeyField::exact("ipv4.dst", 32)], 1024))
                .collect_vec()
        };
        let stages = vec![stage(1), stage(3), stage(2)];
        let res = allocate_stages(&stages, &phv(), &AllocOptions::default());
        assert_eq!(res.len(), 3);
        for (i, r) in res.iter().enumerate() {
            let a = r.as_ref().unwrap();
            assert_eq!(a.stage, i);
            assert_eq!(a.tables.len(), stages[i].len());
        }
    }
}

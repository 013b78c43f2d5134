//! What the allocators are asked to place. Everything in here comes from
//! the table-layout and PHV passes upstream; the allocators never change it.

use std::collections::HashMap;

use crate::bits::Bitvec;
use crate::helpe::{
    AllocError, AllocResult, ceil_div, ceil_log2,
    MAX_WAYS, RIGHT_SIDE_COLUMNS, SRAM_COLUMNS, SRAM_DEPTH, SRAM_WORD_BITS, TCAM_DEPTH,
};

/// Bits `[lo, hi)` of a named field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldSlice {
    pub field:  String,
    pub lo:     u32,
    pub hi:     u32,
}

impl FieldSlice {
    pub fn new(field: &str, lo: u32, hi: u32) -> Self {
        Self { field: field.to_string(), lo, hi }
    }

    /// The whole of a `width`-bit field.
    pub fn whole(field: &str, width: u32) -> Self {
        Self::new(field, 0, width)
    }

    #[inline(always)]
    pub fn width(&self) -> u32 {
        self.hi - self.lo
    }
}

/// One field of a table key. Bytes of a `range` field are matched by
/// the same TCAM and thus must sit in the same crossbar group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyField {
    pub slice:  FieldSlice,
    pub range:  bool,
}

impl KeyField {
    pub fn exact(field: &str, width: u32) -> Self {
        Self { slice: FieldSlice::whole(field, width), range: false }
    }

    pub fn range(field: &str, width: u32) -> Self {
        Self { slice: FieldSlice::whole(field, width), range: true }
    }

    pub fn slice(field: &str, lo: u32, hi: u32) -> Self {
        Self { slice: FieldSlice::new(field, lo, hi), range: false }
    }
}

/// Where a field lives in the PHV: the container, its width in bits,
/// and the container bit that holds the field's bit 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSlot {
    pub container:  String,
    pub width:      u32,
    pub offset:     u32,
}

impl ContainerSlot {
    pub fn new(container: &str, width: u32, offset: u32) -> Self {
        Self { container: container.to_string(), width, offset }
    }
}

/// Resolves symbolic fields to their storage. Implemented by the PHV
/// allocation upstream; a plain map is enough for tests and tools.
pub trait PhvMap {
    fn locate(&self, field: &str) -> Option<ContainerSlot>;
}

impl PhvMap for HashMap<String, ContainerSlot> {
    fn locate(&self, field: &str) -> Option<ContainerSlot> {
        self.get(field).cloned()
    }
}

impl PhvMap for indexmap::IndexMap<String, ContainerSlot> {
    fn locate(&self, field: &str) -> Option<ContainerSlot> {
        self.get(field).cloned()
    }
}

/// The identity of a crossbar input byte. Two requirements with the same
/// key can be satisfied by the same crossbar byte.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteKey {
    pub container:  String,
    pub byte:       u32,
}

impl std::fmt::Display for ByteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.container, self.byte)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Nibble {
    Lo,
    Hi,
}

/// A field slice that needs exactly one crossbar byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteRequirement {
    pub key:            ByteKey,
    /// First field touching the byte, for diagnostics.
    pub field:          String,
    /// Bits of the container byte the key actually uses.
    pub bits:           Bitvec,
    /// Allowed values of `position % 4`.
    pub align:          u8,
    pub nibble:         Option<Nibble>,
    pub range_group:    Option<u32>,
}

/// Alignment flags for byte `byte` of a `width`-bit container.
#[inline(always)]
pub fn alignment_flags(width: u32, byte: u32) -> Option<u8> {
    match width {
        8   => Some(0b1111),
        16  => {
            let b = (byte % 2) as u8;
            Some((1 << b) | (1 << (b + 2)))
        },
        32  => Some(1 << (byte % 4)),
        _   => None,
    }
}

impl ByteRequirement {
    /// Whether position `pos` of a crossbar group is a legal home.
    #[inline(always)]
    pub fn allows(&self, pos: usize) -> bool {
        self.align & (1 << (pos % 4)) != 0
    }

    fn nibble_of(bits: Bitvec) -> Option<Nibble> {
        if Bitvec::range(0..4).contains(bits) {
            Some(Nibble::Lo)
        } else if Bitvec::range(4..8).contains(bits) {
            Some(Nibble::Hi)
        } else {
            None
        }
    }

    /// Splits a table key into per-byte requirements, in key order.
    /// Slices sharing a container byte collapse into one requirement.
    pub fn from_key(
        table:  &str,
        key:    &[KeyField],
        phv:    &dyn PhvMap,
    ) -> AllocResult<Vec<ByteRequirement>> {
        let mut res: Vec<ByteRequirement> = vec![];
        for (idx, kf) in key.iter().enumerate() {
            let s = &kf.slice;
            if s.lo >= s.hi {
                return Err(AllocError::Layout {
                    table:  table.to_string(),
                    reason: format!("empty slice of {}", s.field),
                });
            }
            let slot = phv.locate(&s.field).ok_or_else(|| AllocError::Layout {
                table:  table.to_string(),
                reason: format!("{} has no PHV container", s.field),
            })?;
            let (lo, hi) = (slot.offset + s.lo, slot.offset + s.hi);
            if hi > slot.width {
                return Err(AllocError::Layout {
                    table:  table.to_string(),
                    reason: format!("{} overflows container {}", s.field, slot.container),
                });
            }
            for cb in (lo / 8)..ceil_div(hi as u64, 8) as u32 {
                let byte_lo = (cb * 8).max(lo) - cb * 8;
                let byte_hi = ((cb + 1) * 8).min(hi) - cb * 8;
                let bits = Bitvec::range(byte_lo as usize..byte_hi as usize);
                let align = alignment_flags(slot.width, cb).ok_or_else(|| AllocError::Layout {
                    table:  table.to_string(),
                    reason: format!("container {} has unsupported width {}", slot.container, slot.width),
                })?;
                let key = ByteKey { container: slot.container.clone(), byte: cb };
                if let Some(prev) = res.iter_mut().find(|r| r.key == key) {
                    prev.bits |= bits;
                    prev.nibble = Self::nibble_of(prev.bits);
                    if prev.range_group.is_none() && kf.range {
                        prev.range_group = Some(idx as u32);
                    }
                    continue;
                }
                res.push(ByteRequirement {
                    key,
                    field:          s.field.clone(),
                    bits,
                    align,
                    nibble:         Self::nibble_of(bits),
                    range_group:    if kf.range { Some(idx as u32) } else { None },
                });
            }
        }

        Ok(res)
    }
}

/// How a table matches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Hash-addressed SRAM match.
    Exact,
    /// TCAM match.
    Ternary,
    /// Algorithmic TCAM: SRAM partitions selected by a partition index.
    Atcam,
    /// D-left hash table: every way is a slice of its own, looked up as
    /// a separate logical table.
    Dleft,
    /// No match; the address comes straight out of the hash.
    HashAction,
    /// No key at all: always hits (or misses) with one payload.
    NoMatch,
}

/// The chosen layout of one table, as handed over by table placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutOption {
    pub kind:               MatchKind,
    pub entries:            u64,
    /// Hash ways for exact tables, partitions for ATCAM tables, hash
    /// slices for d-left tables.
    pub ways:               usize,
    /// RAMs holding a single match word.
    pub match_width:        usize,
    pub entries_per_word:   u64,
    /// Width of the hashed key of a proxy-hash table, 0 otherwise.
    pub proxy_hash_bits:    usize,
    /// Ternary-indirection entries per SRAM word, 0 when the table
    /// needs no indirection RAM.
    pub tind_per_word:      u64,
}

impl Default for LayoutOption {
    fn default() -> Self {
        Self {
            kind:               MatchKind::Exact,
            entries:            0,
            ways:               1,
            match_width:        1,
            entries_per_word:   1,
            proxy_hash_bits:    0,
            tind_per_word:      0,
        }
    }
}

/// Splits `total` RAMs over `n` ways, earlier ways taking the remainder.
#[inline(always)]
fn split_depth(total: u64, n: usize) -> Vec<u64> {
    let n = (n as u64).min(total).max(1);
    let base = total / n;
    let rem = total % n;
    (0..n).map(|i| base + if i < rem { 1 } else { 0 }).collect()
}

impl LayoutOption {
    pub fn validate(&self, table: &str) -> AllocResult<()> {
        let bad = |reason: &str| Err(AllocError::Layout {
            table:  table.to_string(),
            reason: reason.to_string(),
        });
        if self.entries_per_word == 0 {
            return bad("zero entries per word");
        }
        if self.match_width == 0 {
            return bad("zero match width");
        }
        match self.kind {
            MatchKind::Exact    => {
                if self.ways == 0 || self.ways > MAX_WAYS {
                    return bad("way count out of range");
                }
                if self.entries == 0 {
                    return bad("exact table without entries");
                }
            },
            MatchKind::Atcam    => {
                if self.ways == 0 {
                    return bad("ATCAM table without partitions");
                }
                if self.partition_depths().iter().any(|d| *d as usize * self.match_width > SRAM_COLUMNS) {
                    return bad("ATCAM partition wider than a row");
                }
            },
            MatchKind::Dleft    => {
                if self.ways == 0 || self.ways > MAX_WAYS {
                    return bad("slice count out of range");
                }
                if self.way_depths().iter().any(|d| *d as usize * self.match_width > RIGHT_SIDE_COLUMNS) {
                    return bad("d-left slice wider than half a row");
                }
            },
            MatchKind::Ternary  => {
                if self.entries == 0 {
                    return bad("ternary table without entries");
                }
            },
            MatchKind::HashAction | MatchKind::NoMatch => {},
        }

        Ok(())
    }

    /// Total match RAM depth, before splitting into ways.
    #[inline(always)]
    pub fn match_depth(&self) -> u64 {
        ceil_div(self.entries, SRAM_DEPTH * self.entries_per_word)
    }

    /// RAM depth of every hash way. Their sum is the smallest depth
    /// holding `entries`; d-left tables keep every slice, however small.
    pub fn way_depths(&self) -> Vec<u64> {
        match self.kind {
            MatchKind::Dleft    => split_depth(self.match_depth().max(self.ways as u64), self.ways),
            _                   => split_depth(self.match_depth(), self.ways),
        }
    }

    /// RAM depth of every ATCAM partition.
    pub fn partition_depths(&self) -> Vec<u64> {
        debug_assert!(self.kind == MatchKind::Atcam);
        let total = self.match_depth().max(self.ways as u64);
        split_depth(total, self.ways)
    }

    /// Logical table ids the layout consumes: one per ATCAM partition or
    /// d-left slice, one otherwise.
    #[inline(always)]
    pub fn logical_tables(&self) -> usize {
        match self.kind {
            MatchKind::Atcam | MatchKind::Dleft => self.ways.max(1),
            _                                   => 1,
        }
    }

    /// TCAM blocks stacked in depth.
    #[inline(always)]
    pub fn tcam_depth(&self) -> u64 {
        ceil_div(self.entries, TCAM_DEPTH)
    }

    /// SRAMs of ternary indirection.
    #[inline(always)]
    pub fn tind_rams(&self) -> u64 {
        if self.tind_per_word == 0 { 0 } else { ceil_div(self.entries, SRAM_DEPTH * self.tind_per_word) }
    }

    /// Whole hash index groups a proxy-hash key consumes.
    #[inline(always)]
    pub fn proxy_hash_groups(&self) -> usize {
        ceil_div(self.proxy_hash_bits as u64, crate::helpe::HASH_INDEX_BITS as u64) as usize
    }
}

/// Kinds of resources hanging off a match table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttachedKind {
    Counter { per_word: u64 },
    Meter { color_maps: bool },
    Selector,
    Stateful { width: u32 },
    ActionData { width: u32 },
    IdleTime { precision: u32 },
}

/// Members a selector word can hold.
pub const SELECTOR_MEMBERS_PER_WORD: u64 = 120;

impl AttachedKind {
    /// Synth2port resources need a map-RAM per SRAM, a spare RAM and an ALU.
    #[inline(always)]
    pub fn is_synth2port(&self) -> bool {
        matches!(self,
            AttachedKind::Counter { .. } | AttachedKind::Meter { .. } |
            AttachedKind::Selector | AttachedKind::Stateful { .. })
    }

    /// Resources driven by a meter ALU (odd rows) rather than a
    /// statistics ALU (even rows).
    #[inline(always)]
    pub fn uses_meter_alu(&self) -> bool {
        matches!(self,
            AttachedKind::Meter { .. } | AttachedKind::Selector | AttachedKind::Stateful { .. })
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            AttachedKind::Counter { .. }    => "counter",
            AttachedKind::Meter { .. }      => "meter",
            AttachedKind::Selector          => "selector",
            AttachedKind::Stateful { .. }   => "stateful",
            AttachedKind::ActionData { .. } => "action",
            AttachedKind::IdleTime { .. }   => "idletime",
        }
    }
}

/// A counter, meter, selector, stateful ALU, action-data table or
/// idle-time table used by one or more match tables. Tables sharing a
/// resource name share its memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachedResource {
    pub name:           String,
    pub kind:           AttachedKind,
    pub entries:        u64,
    /// Addressed through hash distribution rather than by the match.
    pub hash_addressed: bool,
}

impl AttachedResource {
    pub fn new(name: &str, kind: AttachedKind, entries: u64) -> Self {
        Self { name: name.to_string(), kind, entries, hash_addressed: false }
    }

    pub fn hash_addressed(mut self) -> Self {
        self.hash_addressed = true;
        self
    }

    /// RAMs holding data, without the synth2port spare.
    pub fn data_rams(&self) -> u64 {
        let per_ram = |per_word: u64| ceil_div(self.entries, SRAM_DEPTH * per_word.max(1));
        match self.kind {
            AttachedKind::Counter { per_word }  => per_ram(per_word),
            AttachedKind::Meter { .. }          => per_ram(1),
            AttachedKind::Selector              => {
                ceil_div(ceil_div(self.entries, SELECTOR_MEMBERS_PER_WORD), SRAM_DEPTH)
            },
            AttachedKind::Stateful { width }    => {
                per_ram((SRAM_WORD_BITS / width.clamp(1, SRAM_WORD_BITS)) as u64)
            },
            AttachedKind::ActionData { width }  => {
                if width > SRAM_WORD_BITS {
                    ceil_div(width as u64, SRAM_WORD_BITS as u64) * per_ram(1)
                } else {
                    let w = width.max(8).next_power_of_two();
                    per_ram((SRAM_WORD_BITS / w) as u64)
                }
            },
            AttachedKind::IdleTime { .. }       => 0,
        }
    }

    /// SRAMs the resource occupies, spare included.
    pub fn total_rams(&self) -> u64 {
        let data = self.data_rams();
        if self.kind.is_synth2port() && data > 0 { data + 1 } else { data }
    }

    /// Map-RAMs of an idle-time table.
    pub fn idletime_maprams(&self) -> u64 {
        match self.kind {
            AttachedKind::IdleTime { precision } => {
                let per_word = match precision {
                    1   => 8,
                    2   => 4,
                    3   => 2,
                    _   => 1,
                };
                ceil_div(self.entries, SRAM_DEPTH * per_word)
            },
            _ => 0,
        }
    }

    /// Color map-RAMs of a meter.
    pub fn color_maprams(&self) -> u64 {
        match self.kind {
            AttachedKind::Meter { color_maps: true } => {
                ceil_div(self.data_rams(), crate::helpe::METER_RAMS_PER_COLOR_MAP as u64)
            },
            _ => 0,
        }
    }
}

/// Everything the stage allocator needs to know about one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRequest {
    pub name:       String,
    pub key:        Vec<KeyField>,
    pub layout:     LayoutOption,
    /// Gateway condition fields; empty when the table has no gateway.
    pub gateway:    Vec<KeyField>,
    pub attached:   Vec<AttachedResource>,
}

impl TableRequest {
    pub fn new(name: &str, kind: MatchKind, key: Vec<KeyField>, entries: u64) -> Self {
        Self {
            name:       name.to_string(),
            key,
            layout:     LayoutOption { kind, entries, ..Default::default() },
            gateway:    vec![],
            attached:   vec![],
        }
    }

    pub fn exact(name: &str, key: Vec<KeyField>, entries: u64) -> Self {
        Self::new(name, MatchKind::Exact, key, entries)
    }

    pub fn ternary(name: &str, key: Vec<KeyField>, entries: u64) -> Self {
        Self::new(name, MatchKind::Ternary, key, entries)
    }

    pub fn atcam(name: &str, key: Vec<KeyField>, entries: u64, partitions: usize) -> Self {
        Self::new(name, MatchKind::Atcam, key, entries).with_ways(partitions)
    }

    pub fn dleft(name: &str, key: Vec<KeyField>, entries: u64, slices: usize) -> Self {
        Self::new(name, MatchKind::Dleft, key, entries).with_ways(slices)
    }

    pub fn with_ways(mut self, ways: usize) -> Self {
        self.layout.ways = ways;
        self
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.layout.match_width = width;
        self
    }

    pub fn with_entries_per_word(mut self, epw: u64) -> Self {
        self.layout.entries_per_word = epw;
        self
    }

    pub fn with_proxy_hash(mut self, bits: usize) -> Self {
        self.layout.proxy_hash_bits = bits;
        self
    }

    pub fn with_tind(mut self, per_word: u64) -> Self {
        self.layout.tind_per_word = per_word;
        self
    }

    pub fn with_gateway(mut self, fields: Vec<KeyField>) -> Self {
        self.gateway = fields;
        self
    }

    pub fn attach(mut self, res: AttachedResource) -> Self {
        self.attached.push(res);
        self
    }

    /// Hash requirements of the match key. Ternary-like tables need none.
    pub fn hash_requirement(&self) -> HashMatrixRequirement {
        match self.layout.kind {
            MatchKind::Exact | MatchKind::Dleft => {
                let depths = self.layout.way_depths();
                HashMatrixRequirement {
                    index_groups:   depths.len(),
                    select_bits:    depths.iter().map(|d| ceil_log2(*d) as usize).sum(),
                    proxy_groups:   self.layout.proxy_hash_groups(),
                    max:            false,
                }
            },
            // The partition index goes through an identity hash.
            MatchKind::Atcam    => HashMatrixRequirement {
                index_groups:   1,
                ..HashMatrixRequirement::none()
            },
            _   => HashMatrixRequirement::none(),
        }
    }
}

/// How much of a hash function a table's eventual hash needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HashMatrixRequirement {
    /// Whole 10-bit index groups, one per way.
    pub index_groups:   usize,
    /// Single bits selecting a RAM inside a way.
    pub select_bits:    usize,
    /// Index groups carrying a proxy-hash key.
    pub proxy_groups:   usize,
    /// Reserve the whole function instead of the minimum.
    pub max:            bool,
}

impl HashMatrixRequirement {
    pub fn none() -> Self {
        Self { index_groups: 0, select_bits: 0, proxy_groups: 0, max: false }
    }

    /// The relaxed retry requirement: claim a whole function.
    pub fn maximal(self) -> Self {
        Self { max: true, ..self }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.index_groups + self.select_bits + self.proxy_groups == 0
    }

    #[inline(always)]
    pub fn total_index_groups(&self) -> usize {
        self.index_groups + self.proxy_groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phv() -> HashMap<String, ContainerSlot> {
        HashMap::from([
            ("ipv4.dst".to_string(), ContainerSlot::new("W0", 32, 0)),
            ("tcp.port".to_string(), ContainerSlot::new("H3", 16, 0)),
            ("meta.flag".to_string(), ContainerSlot::new("B1", 8, 4)),
            ("meta.low".to_string(), ContainerSlot::new("B2", 8, 0)),
        ])
    }

    #[test]
    fn test_from_key_alignment() {
        let reqs = ByteRequirement::from_key(
            "t",
            &[KeyField::exact("ipv4.dst", 32), KeyField::exact("tcp.port", 16)],
            &phv(),
        ).unwrap();
        assert_eq!(reqs.len(), 6);
        assert_eq!(reqs[0].align, 0b0001);
        assert_eq!(reqs[3].align, 0b1000);
        assert!(reqs[3].allows(7));
        assert_eq!(reqs[4].align, 0b0101);
        assert_eq!(reqs[5].align, 0b1010);
    }

    #[test]
    fn test_from_key_nibbles_and_merge() {
        let reqs = ByteRequirement::from_key(
            "t",
            &[KeyField::slice("meta.flag", 0, 3), KeyField::slice("meta.low", 0, 4),
              KeyField::slice("meta.low", 4, 6)],
            &phv(),
        ).unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].nibble, Some(Nibble::Hi));
        assert_eq!(reqs[1].nibble, None);
        assert_eq!(reqs[1].bits, Bitvec::range(0..6));
    }

    #[test]
    fn test_from_key_unknown_field() {
        let err = ByteRequirement::from_key("t", &[KeyField::exact("nope", 8)], &phv());
        assert!(matches!(err, Err(AllocError::Layout { .. })));
    }

    #[test]
    fn test_way_depths_are_minimal() {
        let t = TableRequest::exact("t", vec![], 5 * 1024 + 1).with_ways(4);
        assert_eq!(t.layout.way_depths(), vec![2, 2, 1, 1]);
        let small = TableRequest::exact("s", vec![], 100).with_ways(4);
        assert_eq!(small.layout.way_depths(), vec![1]);
        let req = t.hash_requirement();
        assert_eq!(req.index_groups, 4);
        assert_eq!(req.select_bits, 2);
    }

    #[test]
    fn test_dleft_slices() {
        let t = TableRequest::dleft("d", vec![], 3 * 1024, 4);
        assert_eq!(t.layout.way_depths(), vec![1, 1, 1, 1]);
        assert_eq!(t.layout.logical_tables(), 4);
        assert_eq!(t.hash_requirement().index_groups, 4);
        assert!(t.layout.validate("d").is_ok());
        let wide = TableRequest::dleft("w", vec![], 8 * 1024, 2).with_width(2);
        assert!(wide.layout.validate("w").is_err());
        assert_eq!(TableRequest::atcam("a", vec![], 1024, 3).layout.logical_tables(), 3);
        assert_eq!(TableRequest::exact("e", vec![], 1024).with_ways(3).layout.logical_tables(), 1);
    }

    #[test]
    fn test_attached_ram_counts() {
        let c = AttachedResource::new("c", AttachedKind::Counter { per_word: 1 }, 12 * 1024);
        assert_eq!(c.total_rams(), 13);
        let m = AttachedResource::new("m", AttachedKind::Meter { color_maps: true }, 5 * 1024);
        assert_eq!(m.color_maprams(), 2);
        let ad = AttachedResource::new("a", AttachedKind::ActionData { width: 32 }, 4096);
        assert_eq!(ad.total_rams(), 1);
        let wide = AttachedResource::new("w", AttachedKind::ActionData { width: 256 }, 2048);
        assert_eq!(wide.total_rams(), 4);
        let idle = AttachedResource::new("i", AttachedKind::IdleTime { precision: 3 }, 4096);
        assert_eq!(idle.idletime_maprams(), 2);
        assert_eq!(idle.total_rams(), 0);
    }
}

//! The input crossbar of one stage.
//!
//! PHV bytes reach the match units through the crossbar: 8 exact groups
//! of 16 bytes that also feed the hash tables, and 12 ternary groups of
//! 5 bytes where each even/odd pair shares a nibble-wide midbyte. Bytes
//! already on the crossbar are shared by every table that asks for them.

pub mod bytes;
pub mod hash;
pub mod hash_dist;

pub use bytes::PlacementMode;
pub use hash::{HashChoice, HashMatrix};
pub use hash_dist::HashDistUse;

use crate::helpe::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// A physical crossbar byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ByteLoc {
    Exact   { group: usize, byte: usize },
    Ternary { group: usize, byte: usize },
    /// The midbyte of ternary groups `2 * byte_group` and `2 * byte_group + 1`.
    Mid     { byte_group: usize },
}

impl ByteLoc {
    /// The hash table an exact byte is hashed by.
    #[inline(always)]
    pub fn hash_table(&self) -> Option<usize> {
        match *self {
            ByteLoc::Exact { group, byte }  => Some(2 * group + byte / HASH_TABLE_BYTES),
            _                               => None,
        }
    }

    /// Position inside the 11-byte ternary byte group: even group bytes,
    /// then the midbyte, then odd group bytes.
    #[inline(always)]
    pub fn byte_group_position(&self) -> Option<usize> {
        match *self {
            ByteLoc::Ternary { group, byte }    => {
                Some((group % 2) * (TERNARY_BYTES_PER_GROUP + 1) + byte)
            },
            ByteLoc::Mid { .. }                 => Some(MIDBYTE_POSITION),
            ByteLoc::Exact { .. }               => None,
        }
    }
}

impl fmt::Display for ByteLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteLoc::Exact { group, byte }      => write!(f, "exact{group}[{byte}]"),
            ByteLoc::Ternary { group, byte }    => write!(f, "ternary{group}[{byte}]"),
            ByteLoc::Mid { byte_group }         => write!(f, "mid{byte_group}"),
        }
    }
}

/// What sits on a crossbar byte, and who reads it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteSlot {
    pub key:    ByteKey,
    pub users:  Vec<String>,
}

impl fmt::Display for ByteSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// One requirement, placed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytePlacement {
    pub key:    ByteKey,
    pub field:  String,
    pub loc:    ByteLoc,
    /// The search group the byte is read through.
    pub group:  usize,
    /// Was already on the crossbar.
    pub reused: bool,
}

/// Hash bits of one way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WayHash {
    pub index_group:    usize,
    pub select:         Bitvec,
    pub depth:          u64,
    pub seed:           u16,
}

/// The hash function a match table uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashUse {
    pub function:       usize,
    pub tables:         Bitvec,
    pub ways:           Vec<WayHash>,
    pub proxy_groups:   Vec<usize>,
    /// Every reserved output bit.
    pub bits:           Bitvec,
    pub shared:         bool,
}

/// The crossbar side of one key (match or gateway).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IxbarUse {
    pub ternary:    bool,
    pub bytes:      Vec<BytePlacement>,
    pub hash:       Option<HashUse>,
}

impl IxbarUse {
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Search groups read.
    pub fn groups(&self) -> Bitvec {
        self.bytes.iter().map(|b| b.group).collect()
    }

    /// Hash tables covering the exact bytes.
    pub fn hash_tables(&self) -> Bitvec {
        self.bytes.iter().filter_map(|b| b.loc.hash_table()).collect()
    }

    pub fn uses_midbyte(&self) -> bool {
        self.bytes.iter().any(|b| matches!(b.loc, ByteLoc::Mid { .. }))
    }

    /// Identity of what the key puts on a search bus. Equal labels can
    /// share a bus.
    pub fn search_label(&self) -> String {
        let kind = if self.ternary { "tcam" } else { "exact" };
        match &self.hash {
            Some(h) => format!("{kind}{:?}/h{}", self.groups(), h.function),
            None    => format!("{kind}{:?}", self.groups()),
        }
    }
}

/// Everything the crossbar gave one table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableIxbar {
    pub match_ixbar:    IxbarUse,
    pub gateway_ixbar:  Option<IxbarUse>,
    pub hash_dist:      Vec<HashDistUse>,
}

#[derive(Clone, Debug)]
pub struct IXBar {
    pub(crate) exact_use:       Alloc2D<ByteSlot>,
    pub(crate) ternary_use:     Alloc2D<ByteSlot>,
    pub(crate) midbyte_use:     Alloc2D<ByteSlot>,
    pub hash:                   HashMatrix,
    pub(crate) hash_dist_use:   Alloc2D<String>,
    /// Hash distribution handed out per resource, so that a resource
    /// shared by several tables is addressed once.
    pub(crate) dist_records:    IndexMap<String, Vec<HashDistUse>>,
    stage:                      usize,
    seed_base:                  u64,
}

impl IXBar {
    pub fn new(stage: usize, seed_base: u64) -> Self {
        Self {
            exact_use:      Alloc2D::new("exact_ixbar", EXACT_GROUPS, EXACT_BYTES_PER_GROUP),
            ternary_use:    Alloc2D::new("ternary_ixbar", TERNARY_GROUPS, TERNARY_BYTES_PER_GROUP),
            midbyte_use:    Alloc2D::new("midbytes", BYTE_GROUPS, 1),
            hash:           HashMatrix::new(),
            hash_dist_use:  Alloc2D::new("hash_dist", HASH_DIST_UNITS, HASH_DIST_SLICES),
            dist_records:   IndexMap::new(),
            stage,
            seed_base,
        }
    }

    pub fn clear(&mut self) {
        self.exact_use.clear();
        self.ternary_use.clear();
        self.midbyte_use.clear();
        self.hash.clear();
        self.hash_dist_use.clear();
        self.dist_records.clear();
    }

    #[inline(always)]
    pub fn slot(&self, loc: ByteLoc) -> Option<&ByteSlot> {
        match loc {
            ByteLoc::Exact { group, byte }      => self.exact_use.get(group, byte),
            ByteLoc::Ternary { group, byte }    => self.ternary_use.get(group, byte),
            ByteLoc::Mid { byte_group }         => self.midbyte_use.get(byte_group, 0),
        }
    }

    /// Every occupied crossbar byte.
    pub fn slots(&self) -> impl Iterator<Item = (ByteLoc, &ByteSlot)> + '_ {
        self.exact_use.occupied()
            .map(|(group, byte, s)| (ByteLoc::Exact { group, byte }, s))
            .chain(self.ternary_use.occupied()
                .map(|(group, byte, s)| (ByteLoc::Ternary { group, byte }, s)))
            .chain(self.midbyte_use.occupied()
                .map(|(byte_group, _, s)| (ByteLoc::Mid { byte_group }, s)))
    }

    /// Pseudo-random but reproducible seed of one hash way.
    fn way_seed(&self, table: &str, function: usize, way: usize) -> u16 {
        let h = [self.seed_base, self.stage as u64, function as u64, way as u64]
            .iter()
            .fold(FNV_OFFSET, |h, v| fnv1a(h, &v.to_le_bytes()));
        let mut rng = StdRng::seed_from_u64(fnv1a(h, table.as_bytes()));
        rng.gen_range(0..1u16 << HASH_INDEX_BITS)
    }

    /// Commits a placement: bytes get a new user, hash bits an owner.
    pub fn update(&mut self, table: &str, alloc: &IxbarUse) {
        for p in &alloc.bytes {
            let (arr, r, c) = match p.loc {
                ByteLoc::Exact { group, byte }      => (&mut self.exact_use, group, byte),
                ByteLoc::Ternary { group, byte }    => (&mut self.ternary_use, group, byte),
                ByteLoc::Mid { byte_group }         => (&mut self.midbyte_use, byte_group, 0),
            };
            let mut slot = arr.get(r, c)
                .cloned()
                .unwrap_or_else(|| ByteSlot { key: p.key.clone(), users: vec![] });
            assert!(slot.key == p.key, "{} holds {} but {} was placed there", p.loc, slot.key, p.key);
            if !slot.users.iter().any(|u| u == table) {
                slot.users.push(table.to_string());
            }
            arr.set(r, c, Some(slot));
        }
        if let Some(h) = &alloc.hash {
            self.hash.reserve(h.function, h.tables, h.bits, table);
        }
    }

    /// Crossbar, hash and hash distribution for one table. Either all
    /// of it is committed or nothing is.
    pub fn allocate_table(&mut self, req: &TableRequest, phv: &dyn PhvMap) -> AllocResult<TableIxbar> {
        let saved = self.clone();
        let res = self.allocate_table_inner(req, phv);
        if res.is_err() {
            *self = saved;
        }

        res
    }

    fn allocate_table_inner(&mut self, req: &TableRequest, phv: &dyn PhvMap) -> AllocResult<TableIxbar> {
        let name = req.name.as_str();
        let mut out = TableIxbar::default();
        let none = HashMatrixRequirement::none();
        match req.layout.kind {
            MatchKind::NoMatch      => {},
            MatchKind::Ternary      => {
                let reqs = ByteRequirement::from_key(name, &req.key, phv)?;
                let bytes = self.find_alloc(name, &reqs, true, &none, PlacementMode::Shared)?;
                out.match_ixbar = IxbarUse { ternary: true, bytes, hash: None };
            },
            MatchKind::HashAction   => {
                let reqs = ByteRequirement::from_key(name, &req.key, phv)?;
                let bytes = self.find_alloc(name, &reqs, false, &none, PlacementMode::Shared)?;
                out.match_ixbar = IxbarUse { ternary: false, bytes, hash: None };
            },
            MatchKind::Exact | MatchKind::Atcam | MatchKind::Dleft => {
                let reqs = ByteRequirement::from_key(name, &req.key, phv)?;
                out.match_ixbar = self.alloc_hashed_match(req, &reqs)?;
            },
        }
        self.update(name, &out.match_ixbar);

        if !req.gateway.is_empty() {
            let reqs = ByteRequirement::from_key(name, &req.gateway, phv)?;
            let bytes = self.find_alloc(name, &reqs, false, &none, PlacementMode::Shared)?;
            let gw = IxbarUse { ternary: false, bytes, hash: None };
            self.update(name, &gw);
            out.gateway_ixbar = Some(gw);
        }

        let tables = out.match_ixbar.hash_tables();
        if req.layout.kind == MatchKind::HashAction {
            if tables.is_empty() {
                return Err(AllocError::Layout {
                    table:  name.to_string(),
                    reason: "hash-action table without an exact key".to_string(),
                });
            }
            let dist = self.alloc_hash_dist(name, name, tables, address_slices(req.layout.entries))?;
            out.hash_dist.extend(dist);
        }
        for res in req.attached.iter().filter(|r| r.hash_addressed) {
            if tables.is_empty() {
                return Err(AllocError::Layout {
                    table:  name.to_string(),
                    reason: format!("hash-addressed {} needs an exact key", res.name),
                });
            }
            let dist = self.alloc_hash_dist(name, &res.name, tables, address_slices(res.entries))?;
            out.hash_dist.extend(dist);
        }

        Ok(out)
    }

    /// Exact and ATCAM match keys: crossbar bytes plus a hash function.
    /// A crossbar failure is retried with the maximal hash requirement;
    /// a hash failure is retried on untouched groups only.
    fn alloc_hashed_match(&self, req: &TableRequest, reqs: &[ByteRequirement]) -> AllocResult<IxbarUse> {
        let name = req.name.as_str();
        let hm = req.hash_requirement();
        let depths = match req.layout.kind {
            MatchKind::Exact | MatchKind::Dleft => req.layout.way_depths(),
            _                                   => vec![1],
        };

        let err = match self.try_hashed(name, reqs, &hm, PlacementMode::Shared, &depths) {
            Ok(u)   => return Ok(u),
            Err(e)  => e,
        };
        debug!("{name}: {err}; retrying");
        let err = match err {
            AllocError::Crossbar { .. } => {
                match self.try_hashed(name, reqs, &hm.maximal(), PlacementMode::Shared, &depths) {
                    Ok(u)   => return Ok(u),
                    Err(e)  => e,
                }
            },
            other => other,
        };
        match err {
            AllocError::Hash { .. } => {
                debug!("{name}: {err}; retrying on fresh groups");
                self.try_hashed(name, reqs, &hm, PlacementMode::Fresh, &depths)
            },
            other => Err(other),
        }
    }

    fn try_hashed(
        &self,
        name:   &str,
        reqs:   &[ByteRequirement],
        hm:     &HashMatrixRequirement,
        mode:   PlacementMode,
        depths: &[u64],
    ) -> AllocResult<IxbarUse> {
        let bytes = self.find_alloc(name, reqs, false, hm, mode)?;
        let mut alloc = IxbarUse { ternary: false, bytes, hash: None };
        let tables = alloc.hash_tables();
        let choice = self.hash.get_hash_group(name, hm, tables)?;

        let mut select = choice.select.iter();
        let ways = depths.iter()
            .zip(choice.index_groups.iter())
            .enumerate()
            .map(|(w, (depth, group))| WayHash {
                index_group:    *group,
                select:         select.by_ref().take(ceil_log2(*depth) as usize).collect(),
                depth:          *depth,
                seed:           self.way_seed(name, choice.function, w),
            })
            .collect_vec();
        let proxy_groups = choice.index_groups[ways.len()..].to_vec();
        alloc.hash = Some(HashUse {
            function:   choice.function,
            tables,
            ways,
            proxy_groups,
            bits:       choice.bits,
            shared:     choice.shared,
        });

        Ok(alloc)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME:  u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over `bytes`, continuing from `h`.
#[inline(always)]
fn fnv1a(h: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(h, |h, b| (h ^ *b as u64).wrapping_mul(FNV_PRIME))
}

/// Hash distribution slices addressing `entries` entries.
#[inline(always)]
fn address_slices(entries: u64) -> usize {
    let bits = ceil_log2(entries.max(2)) as u64;
    ceil_div(bits, HASH_DIST_BITS as u64) as usize
}

impl fmt::Display for IXBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.exact_use)?;
        write!(f, "{}", self.ternary_use)?;
        write!(f, "{}", self.midbyte_use)?;
        write!(f, "{}", self.hash_dist_use)
    }
}

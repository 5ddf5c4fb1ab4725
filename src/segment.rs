//! Per-team segment table: a closed-addressing hash keyed by segment id
//! (spec §4.1), grounded on `dart_segment.c`'s `hash_segid`/chained-bucket
//! design (`elem->next`, `hashtab[slot]`) from the original implementation.

use crate::error::{DartError, Result};

/// Number of buckets in the segment hash table (spec §4.1: "source uses 256").
const NUM_BUCKETS: usize = 256;

/// Highest representable positive or negative segment id (15 bits, spec §4.1).
const MAX_SEGID: i16 = (1 << 15) - 1;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Eligible for intra-node shared-memory-accelerated access.
        const SHARED_MEM_OPT = 0b0000_0001;
    }
}

/// Per-unit displacement of a segment's local base address, or a single
/// shared displacement when every unit's base coincides (spec §3).
#[derive(Debug, Clone)]
pub enum Displacement {
    Shared(u64),
    PerUnit(Vec<u64>),
}

impl Displacement {
    pub fn for_unit(&self, local_unit_index: usize) -> Option<u64> {
        match self {
            Displacement::Shared(d) => Some(*d),
            Displacement::PerUnit(v) => v.get(local_unit_index).copied(),
        }
    }
}

/// A segment record (spec §3 "Segment record").
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub segid: i16,
    pub size: u64,
    pub disp: Displacement,
    pub local_base: Option<u64>,
    pub flags: SegmentFlags,
}

enum SegKind {
    Allocated,
    Registered,
}

/// One team's segment table. Not internally synchronized: callers must hold
/// the team's collective-phase lock while mutating it (spec §4.1, §5).
pub struct SegmentTable {
    buckets: Vec<Vec<SegmentInfo>>,
    alloc_free_list: Vec<i16>,
    reg_free_list: Vec<i16>,
    next_alloc_id: i16,
    next_reg_id: i16,
}

impl SegmentTable {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, Vec::new);
        SegmentTable {
            buckets,
            alloc_free_list: Vec::new(),
            reg_free_list: Vec::new(),
            next_alloc_id: 1,
            next_reg_id: -1,
        }
    }

    fn bucket_of(segid: i16) -> usize {
        (segid as i32).unsigned_abs() as usize % NUM_BUCKETS
    }

    /// `get_info(segid)`: constant expected time, `None` if absent.
    pub fn get_info(&self, segid: i16) -> Option<&SegmentInfo> {
        self.buckets[Self::bucket_of(segid)]
            .iter()
            .find(|e| e.segid == segid)
    }

    pub fn get_info_mut(&mut self, segid: i16) -> Option<&mut SegmentInfo> {
        self.buckets[Self::bucket_of(segid)]
            .iter_mut()
            .find(|e| e.segid == segid)
    }

    fn alloc_id(&mut self, kind: SegKind) -> Result<i16> {
        match kind {
            SegKind::Allocated => {
                if let Some(id) = self.alloc_free_list.pop() {
                    return Ok(id);
                }
                if self.next_alloc_id >= MAX_SEGID {
                    return Err(DartError::Other("segment id space (positive) exhausted".into()));
                }
                let id = self.next_alloc_id;
                self.next_alloc_id += 1;
                Ok(id)
            }
            SegKind::Registered => {
                if let Some(id) = self.reg_free_list.pop() {
                    return Ok(id);
                }
                if self.next_reg_id <= -MAX_SEGID {
                    return Err(DartError::Other("segment id space (negative) exhausted".into()));
                }
                let id = self.next_reg_id;
                self.next_reg_id -= 1;
                Ok(id)
            }
        }
    }

    /// Allocates a fresh, zero-initialized (except for its id) segment
    /// record backing a collective allocation (spec §4.1, §3 "Lifecycle").
    pub fn alloc(&mut self, size: u64, disp: Displacement) -> Result<i16> {
        let segid = self.alloc_id(SegKind::Allocated)?;
        self.buckets[Self::bucket_of(segid)].push(SegmentInfo {
            segid,
            size,
            disp,
            local_base: None,
            flags: SegmentFlags::empty(),
        });
        Ok(segid)
    }

    /// Registers a user-owned region under a negative segment id.
    pub fn register(&mut self, size: u64, local_base: u64) -> Result<i16> {
        let segid = self.alloc_id(SegKind::Registered)?;
        self.buckets[Self::bucket_of(segid)].push(SegmentInfo {
            segid,
            size,
            disp: Displacement::Shared(0),
            local_base: Some(local_base),
            flags: SegmentFlags::empty(),
        });
        Ok(segid)
    }

    /// `free(segid)`: unlinks and recycles. Freeing segid 0 is a contract
    /// violation (spec §4.1).
    pub fn free(&mut self, segid: i16) -> Result<()> {
        if segid == 0 {
            return Err(DartError::Inval("segid 0 cannot be freed".into()));
        }
        let bucket = &mut self.buckets[Self::bucket_of(segid)];
        let idx = bucket
            .iter()
            .position(|e| e.segid == segid)
            .ok_or_else(|| DartError::NotFound(format!("segment {segid}")))?;
        bucket.remove(idx);
        if segid > 0 {
            self.alloc_free_list.push(segid);
        } else {
            self.reg_free_list.push(segid);
        }
        Ok(())
    }

    /// Destroys every non-local-root entry (spec §4.1: "On team shutdown").
    /// Segid 0 survives unless `destroy_root` is set, matching "local-root
    /// is destroyed only when the root team shuts down".
    pub fn destroy_all(&mut self, destroy_root: bool) {
        for bucket in &mut self.buckets {
            bucket.retain(|e| e.segid == 0 && !destroy_root);
        }
        self.alloc_free_list.clear();
        self.reg_free_list.clear();
    }

    /// Installs the process-global bootstrap segment (spec §3 inv. b).
    pub fn install_bootstrap_segment(&mut self, size: u64, local_base: u64) {
        self.buckets[Self::bucket_of(0)].retain(|e| e.segid != 0);
        self.buckets[Self::bucket_of(0)].push(SegmentInfo {
            segid: 0,
            size,
            disp: Displacement::Shared(0),
            local_base: Some(local_base),
            flags: SegmentFlags::empty(),
        });
    }
}

impl Default for SegmentTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Typed get/put/accumulate/atomic RMA API over [`crate::transport::Transport`]
//! (spec §4.3), resolving global pointers to (unit, local-address) pairs via
//! the owning team's segment table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dtype::{chunk_plan, BasicType, MAX_CHUNK_ELEMENTS};
use crate::error::{DartError, Result};
use crate::gptr::GlobalPtr;
use crate::segment::Displacement;
use crate::team::TeamNode;
use crate::transport::AtomicOp;

/// Resolves `gptr` against `team` to a concrete `(target_unit, address)` pair
/// (spec §4.3: "For segid 0, the offset is absolute... for positive/negative
/// segids the offset is relative to the segment's local base").
fn resolve(team: &TeamNode, gptr: GlobalPtr) -> Result<(i32, u64)> {
    if gptr.team() != team.id {
        return Err(DartError::Inval(
            "global pointer's team does not match the team it was resolved against".into(),
        ));
    }
    let target_unit = gptr.unit_id;
    let local_index = team
        .g2l(target_unit)
        .ok_or_else(|| DartError::Inval(format!("unit {target_unit} is not a member of this team")))?;

    if gptr.is_local_segment() {
        return Ok((target_unit, gptr.offset_or_addr));
    }

    let segments = team.segments.read();
    let info = segments
        .get_info(gptr.segid)
        .ok_or_else(|| DartError::NotFound(format!("segment {}", gptr.segid)))?;
    let base = info
        .disp
        .for_unit(local_index as usize)
        .ok_or_else(|| DartError::Inval("segment has no displacement for target unit".into()))?;
    Ok((target_unit, base + gptr.offset_or_addr))
}

/// Validates that `operand`'s byte length is a whole number of `ty`-sized
/// elements, the same invariant [`put_chunked`]/[`get`] lean on when slicing
/// a transfer into `MAX_CHUNK_ELEMENTS`-sized pieces.
fn check_operand_matches_type(ty: BasicType, operand: &[u8]) -> Result<()> {
    let elem = ty.size() as usize;
    if elem == 0 || operand.len() % elem != 0 {
        return Err(DartError::Inval(format!(
            "accumulate operand of {} bytes is not a whole number of {ty:?} elements ({elem} bytes each)",
            operand.len(),
        )));
    }
    Ok(())
}

/// A one-shot completion handle for a non-blocking RMA request (spec §4.3,
/// §5: "RMA handles are one-shot... Leaking a handle leaks the underlying
/// transport request"). The loopback transport completes every request
/// synchronously, so `wait`/`test` never actually block — a real network
/// transport's handle would poll or park here instead.
pub struct Handle {
    done: Arc<AtomicBool>,
}

impl Handle {
    fn completed() -> Self {
        Handle {
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Blocks until the operation completes, consuming the handle.
    pub fn wait(self) {
        while !self.done.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    /// Non-blocking completion check; does not consume the handle.
    pub fn test(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Blocks on every handle in `handles`, consuming them.
pub fn wait_all(handles: Vec<Handle>) {
    for h in handles {
        h.wait();
    }
}

/// Returns `true` only if every handle has completed; consumes none.
pub fn test_all(handles: &[Handle]) -> bool {
    handles.iter().all(|h| h.test())
}

/// Blocking put of `src` into the memory `gptr` identifies (spec §4.3).
/// Transfers larger than [`MAX_CHUNK_ELEMENTS`] basic-type elements are split
/// into chunks, per §4.3/§4.4.
pub fn put(team: &TeamNode, gptr: GlobalPtr, ty: BasicType, src: &[u8]) -> Result<()> {
    let (unit, addr) = resolve(team, gptr)?;
    put_chunked(team, unit, addr, ty, src)
}

fn put_chunked(team: &TeamNode, unit: i32, addr: u64, ty: BasicType, src: &[u8]) -> Result<()> {
    let elem = ty.size() as u64;
    let total_elems = src.len() as u64 / elem;
    let (full_chunks, remainder) = chunk_plan(total_elems);
    let chunk_bytes = (MAX_CHUNK_ELEMENTS * elem) as usize;
    let mut offset = 0usize;
    for _ in 0..full_chunks {
        team.comm
            .transport
            .put(unit, addr + offset as u64, &src[offset..offset + chunk_bytes]);
        offset += chunk_bytes;
    }
    if remainder > 0 {
        team.comm.transport.put(unit, addr + offset as u64, &src[offset..]);
    }
    Ok(())
}

/// Blocking get from the memory `gptr` identifies into `dst` (spec §4.3).
pub fn get(team: &TeamNode, gptr: GlobalPtr, ty: BasicType, dst: &mut [u8]) -> Result<()> {
    let (unit, addr) = resolve(team, gptr)?;
    let elem = ty.size() as u64;
    let total_elems = dst.len() as u64 / elem;
    let (full_chunks, remainder) = chunk_plan(total_elems);
    let chunk_bytes = (MAX_CHUNK_ELEMENTS * elem) as usize;
    let mut offset = 0usize;
    for _ in 0..full_chunks {
        team.comm
            .transport
            .get(unit, addr + offset as u64, &mut dst[offset..offset + chunk_bytes]);
        offset += chunk_bytes;
    }
    if remainder > 0 {
        team.comm.transport.get(unit, addr + offset as u64, &mut dst[offset..]);
    }
    Ok(())
}

/// Non-blocking put; the loopback backend completes it inline and returns an
/// already-done [`Handle`] (spec §4.3 "non-blocking-with-handle").
pub fn put_nb(team: &TeamNode, gptr: GlobalPtr, ty: BasicType, src: &[u8]) -> Result<Handle> {
    put(team, gptr, ty, src)?;
    Ok(Handle::completed())
}

pub fn get_nb(team: &TeamNode, gptr: GlobalPtr, ty: BasicType, dst: &mut [u8]) -> Result<Handle> {
    get(team, gptr, ty, dst)?;
    Ok(Handle::completed())
}

/// Accumulates `src` into the target using `op`; both endpoints must be the
/// same basic type (spec §4.3).
pub fn accumulate(
    team: &TeamNode,
    gptr: GlobalPtr,
    ty: BasicType,
    src: &[u8],
    op: AtomicOp,
) -> Result<()> {
    check_operand_matches_type(ty, src)?;
    let (unit, addr) = resolve(team, gptr)?;
    team.comm.transport.accumulate(unit, addr, src, op, ty);
    Ok(())
}

/// Fetch-and-op: applies `op` at the target and returns the pre-op value
/// (spec §4.3).
pub fn fetch_op(
    team: &TeamNode,
    gptr: GlobalPtr,
    ty: BasicType,
    operand: &[u8],
    op: AtomicOp,
    fetched: &mut [u8],
) -> Result<()> {
    let (unit, addr) = resolve(team, gptr)?;
    team.comm
        .transport
        .fetch_op(unit, addr, operand, op, ty, fetched);
    Ok(())
}

/// Compare-and-swap at the target; `fetched` receives the pre-CAS value
/// regardless of whether the swap took effect (spec §4.3).
pub fn compare_swap(
    team: &TeamNode,
    gptr: GlobalPtr,
    ty: BasicType,
    expected: &[u8],
    new: &[u8],
    fetched: &mut [u8],
) -> Result<()> {
    let (unit, addr) = resolve(team, gptr)?;
    team.comm
        .transport
        .compare_swap(unit, addr, expected, new, ty, fetched);
    Ok(())
}

/// Flushes remote-visible completion of all outstanding operations on the
/// unit encoded in `gptr` (spec §4.3). The loopback transport completes
/// operations synchronously, so this is a no-op validated only for a
/// resolvable pointer.
pub fn flush(team: &TeamNode, gptr: GlobalPtr) -> Result<()> {
    resolve(team, gptr)?;
    Ok(())
}

/// Flushes local completion only (spec §4.3).
pub fn flush_local(team: &TeamNode, gptr: GlobalPtr) -> Result<()> {
    resolve(team, gptr)?;
    Ok(())
}

/// Flushes every outstanding operation on `gptr`'s whole segment (spec §4.3).
pub fn flush_all(team: &TeamNode, gptr: GlobalPtr) -> Result<()> {
    if gptr.is_local_segment() {
        return Ok(());
    }
    let segments = team.segments.read();
    segments
        .get_info(gptr.segid)
        .ok_or_else(|| DartError::NotFound(format!("segment {}", gptr.segid)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentTable;
    use crate::transport::Communicator;
    use parking_lot::RwLock;

    fn single_unit_team(size: u64) -> (TeamNode, GlobalPtr) {
        let transport = crate::loopback::LoopbackFabric::new(1);
        let base = transport.alloc_local(0, size);
        let comm = Communicator::new(transport, vec![0]);
        let mut segments = SegmentTable::new();
        let segid = segments
            .alloc(size, Displacement::PerUnit(vec![base]))
            .unwrap();
        let team = TeamNode {
            id: crate::team::TEAM_ALL,
            parent: None,
            children: parking_lot::Mutex::new(Vec::new()),
            group: vec![0],
            comm,
            segments: RwLock::new(segments),
        };
        let gptr = GlobalPtr {
            unit_id: 0,
            flags: 0,
            segid,
            teamid: crate::team::TEAM_ALL.0,
            offset_or_addr: 0,
        };
        (team, gptr)
    }

    #[test]
    fn put_then_get_round_trips_through_segment_displacement() {
        let (team, gptr) = single_unit_team(8);
        put(&team, gptr, BasicType::Long, &42i64.to_le_bytes()).unwrap();
        let mut buf = [0u8; 8];
        get(&team, gptr, BasicType::Long, &mut buf).unwrap();
        assert_eq!(i64::from_le_bytes(buf), 42);
    }

    #[test]
    fn fetch_op_min_tracks_minimum_across_calls() {
        let (team, gptr) = single_unit_team(8);
        put(&team, gptr, BasicType::Long, &10i64.to_le_bytes()).unwrap();
        let mut fetched = [0u8; 8];
        fetch_op(
            &team,
            gptr,
            BasicType::Long,
            &3i64.to_le_bytes(),
            AtomicOp::Min,
            &mut fetched,
        )
        .unwrap();
        assert_eq!(i64::from_le_bytes(fetched), 10);
        let mut buf = [0u8; 8];
        get(&team, gptr, BasicType::Long, &mut buf).unwrap();
        assert_eq!(i64::from_le_bytes(buf), 3);
    }

    #[test]
    fn resolve_rejects_pointer_from_a_different_team() {
        let (team, mut gptr) = single_unit_team(8);
        gptr.teamid = 99;
        assert!(put(&team, gptr, BasicType::Long, &0i64.to_le_bytes()).is_err());
    }
}

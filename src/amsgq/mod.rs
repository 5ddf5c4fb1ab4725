//! Active-message queue: a portable one-sided RPC mechanism with three
//! interchangeable back-ends sharing one interface (spec §4.6), selected by
//! [`crate::config::AmsgqImpl`] / the crate's `dualwin`/`singlewin`/`sopnop`
//! features. Grounded on spec §9's "Dynamic dispatch" note: "The AM queue...
//! use[s] a small function-table (polymorphic over at most three...
//! variants). Use tagged unions with match/switch rather than virtual
//! inheritance; the set of variants is closed" — [`AmsgQueue`] is exactly
//! that tagged union.

pub mod message;

#[cfg(feature = "dualwin")]
pub mod dualwin;
#[cfg(feature = "singlewin")]
pub mod singlewin;
#[cfg(feature = "sopnop")]
pub mod sopnop;

use std::sync::Arc;

use crate::error::Result;
use crate::team::TeamNode;
use message::SymbolTable;

/// Default per-message upper bound and queue capacity when a caller does not
/// override them (spec §4.6: "fixed per-message upper bound... and queue
/// capacity").
pub const DEFAULT_MSG_MAX: u64 = 256;
pub const DEFAULT_CAPACITY_MSGS: u64 = 1024;

/// Allocates `per_unit_size` bytes of team-wide scratch, identically placed
/// in every unit's process, and agrees on one segment id for it: one elected
/// unit performs the actual [`crate::segment::SegmentTable`] mutation,
/// everyone else learns the resulting id by broadcast — the same pattern
/// [`crate::lock::DistLock::new`] uses for its queue-node segment.
pub(crate) fn alloc_team_segment(team: &TeamNode, caller_unit: i32, per_unit_size: u64) -> Result<i16> {
    let home_unit = team.group[0];
    let my_base = team.comm.transport.alloc_local(caller_unit, per_unit_size);
    let gathered = crate::collectives::allgather(team, caller_unit, &my_base.to_le_bytes())?;
    let bases: Vec<u64> = gathered
        .chunks(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let segid = if caller_unit == home_unit {
        team.segments
            .write()
            .alloc(per_unit_size, crate::segment::Displacement::PerUnit(bases))?
    } else {
        0
    };
    let segid_bytes = crate::collectives::bcast(team, caller_unit, home_unit, &segid.to_le_bytes())?;
    let segid = i16::from_le_bytes(segid_bytes.try_into().unwrap());
    crate::collectives::barrier(team, caller_unit)?;
    Ok(segid)
}

/// The tagged union over the three active-message back-ends (spec §4.6).
/// Every variant shares identical send/receive semantics observable from
/// outside; they differ only in how tailpos reservation is synchronized.
pub enum AmsgQueue {
    #[cfg(feature = "dualwin")]
    DualWindow(dualwin::DualWindowQueue),
    #[cfg(feature = "singlewin")]
    SingleWindow(singlewin::SingleWindowQueue),
    #[cfg(feature = "sopnop")]
    Sopnop(sopnop::SopnopQueue),
}

impl AmsgQueue {
    pub fn open(
        kind: crate::config::AmsgqImpl,
        team: Arc<TeamNode>,
        caller_unit: i32,
        symbols: Arc<SymbolTable>,
    ) -> Result<Self> {
        Self::open_sized(kind, team, caller_unit, symbols, DEFAULT_MSG_MAX, DEFAULT_CAPACITY_MSGS)
    }

    pub fn open_sized(
        kind: crate::config::AmsgqImpl,
        team: Arc<TeamNode>,
        caller_unit: i32,
        symbols: Arc<SymbolTable>,
        msg_max: u64,
        capacity_msgs: u64,
    ) -> Result<Self> {
        match kind {
            #[cfg(feature = "dualwin")]
            crate::config::AmsgqImpl::DualWindow => Ok(AmsgQueue::DualWindow(
                dualwin::DualWindowQueue::open(team, caller_unit, msg_max, capacity_msgs, symbols)?,
            )),
            #[cfg(feature = "singlewin")]
            crate::config::AmsgqImpl::SingleWindow => Ok(AmsgQueue::SingleWindow(
                singlewin::SingleWindowQueue::open(team, caller_unit, msg_max, capacity_msgs, symbols)?,
            )),
            #[cfg(feature = "sopnop")]
            crate::config::AmsgqImpl::Sopnop => Ok(AmsgQueue::Sopnop(sopnop::SopnopQueue::open(
                team,
                caller_unit,
                msg_max,
                capacity_msgs,
                symbols,
            )?)),
            #[allow(unreachable_patterns)]
            _ => Err(crate::error::DartError::Other(
                "selected active-message back-end is not compiled in".into(),
            )),
        }
    }

    pub fn trysend(&self, caller_unit: i32, target_unit: i32, function_id: u64, payload: &[u8]) -> Result<()> {
        match self {
            #[cfg(feature = "dualwin")]
            AmsgQueue::DualWindow(q) => q.trysend(caller_unit, target_unit, function_id, payload),
            #[cfg(feature = "singlewin")]
            AmsgQueue::SingleWindow(q) => q.trysend(caller_unit, target_unit, function_id, payload),
            #[cfg(feature = "sopnop")]
            AmsgQueue::Sopnop(q) => q.trysend(caller_unit, target_unit, function_id, payload),
        }
    }

    /// Non-blocking receive pass; returns immediately without processing if
    /// the receiver's processing mutex is contended (spec §4.6).
    pub fn process(&self, caller_unit: i32) -> Result<()> {
        match self {
            #[cfg(feature = "dualwin")]
            AmsgQueue::DualWindow(q) => q.process(caller_unit),
            #[cfg(feature = "singlewin")]
            AmsgQueue::SingleWindow(q) => q.process(caller_unit),
            #[cfg(feature = "sopnop")]
            AmsgQueue::Sopnop(q) => q.process(caller_unit),
        }
    }

    /// Drains pending sends, enters an all-to-all barrier on `team`, then
    /// continues processing until the barrier completes, draining once more
    /// (spec §4.6).
    pub fn process_blocking(&self, caller_unit: i32) -> Result<()> {
        match self {
            #[cfg(feature = "dualwin")]
            AmsgQueue::DualWindow(q) => q.process_blocking(caller_unit),
            #[cfg(feature = "singlewin")]
            AmsgQueue::SingleWindow(q) => q.process_blocking(caller_unit),
            #[cfg(feature = "sopnop")]
            AmsgQueue::Sopnop(q) => q.process_blocking(caller_unit),
        }
    }

    /// Closes the queue; a non-zero tailpos logs a warning and discards the
    /// pending messages rather than erroring (spec §7 (d)).
    pub fn close(&self, caller_unit: i32) -> Result<()> {
        match self {
            #[cfg(feature = "dualwin")]
            AmsgQueue::DualWindow(q) => q.close(caller_unit),
            #[cfg(feature = "singlewin")]
            AmsgQueue::SingleWindow(q) => q.close(caller_unit),
            #[cfg(feature = "sopnop")]
            AmsgQueue::Sopnop(q) => q.close(caller_unit),
        }
    }
}

//! MCS-style distributed lock over RMA (spec §4.3 component table, §8
//! "Lock fairness"). Each unit queues behind a tail pointer kept at the
//! lock's home unit; waiters are released in enqueue order by construction,
//! matching the teacher's in-process ticket lock generalized across units
//! instead of across cores.

use parking_lot::Mutex;

use crate::error::Result;
use crate::gptr::GlobalPtr;
use crate::rma;
use crate::segment::Displacement;
use crate::team::TeamNode;
use crate::transport::AtomicOp;

const QNODE_SIZE: u64 = 8 + crate::gptr::WIRE_SIZE as u64;
const TAIL_SIZE: u64 = crate::gptr::WIRE_SIZE as u64;

/// A distributed mutual-exclusion lock scoped to a team.
pub struct DistLock {
    team: std::sync::Arc<TeamNode>,
    home_unit: i32,
    qnode_segid: i16,
    tail_segid: i16,
    held_by: Mutex<Option<i32>>,
}

fn qnode_ptr(team: &TeamNode, segid: i16, unit: i32) -> GlobalPtr {
    GlobalPtr {
        unit_id: unit,
        flags: 0,
        segid,
        teamid: team.id.0,
        offset_or_addr: 0,
    }
}

impl DistLock {
    /// Collective on `team`: every member allocates its own 32-byte queue
    /// node and the team's first member hosts the 24-byte tail cell.
    pub fn new(team: std::sync::Arc<TeamNode>, caller_unit: i32) -> Result<Self> {
        let home_unit = team.group[0];
        let my_base = team.comm.transport.alloc_local(caller_unit, QNODE_SIZE);
        let gathered = crate::collectives::allgather(&team, caller_unit, &my_base.to_le_bytes())?;
        let qnode_bases: Vec<u64> = gathered
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let tail_base = if caller_unit == home_unit {
            team.comm.transport.alloc_local(home_unit, TAIL_SIZE)
        } else {
            0
        };
        let tail_bytes = crate::collectives::bcast(&team, caller_unit, home_unit, &tail_base.to_le_bytes())?;
        let tail_base = u64::from_le_bytes(tail_bytes.try_into().unwrap());

        // Segment ids must be identical across every unit's view of the team,
        // so only the home unit performs the actual table mutation and the
        // resulting ids are broadcast rather than independently recomputed
        // (spec §4.2's "collective max-reduce" id-agreement pattern, applied
        // here to segment ids instead of team ids).
        let ids = if caller_unit == home_unit {
            let qnode_segid = team
                .segments
                .write()
                .alloc(QNODE_SIZE, Displacement::PerUnit(qnode_bases))?;
            let tail_segid = team
                .segments
                .write()
                .alloc(TAIL_SIZE, Displacement::Shared(tail_base))?;
            [qnode_segid, tail_segid]
        } else {
            [0, 0]
        };
        let ids_wire = [
            ids[0].to_le_bytes(),
            ids[1].to_le_bytes(),
        ]
        .concat();
        let ids_bytes = crate::collectives::bcast(&team, caller_unit, home_unit, &ids_wire)?;
        let qnode_segid = i16::from_le_bytes(ids_bytes[0..2].try_into().unwrap());
        let tail_segid = i16::from_le_bytes(ids_bytes[2..4].try_into().unwrap());

        // Initialize the tail cell to NULL; every unit writes the same value
        // so no extra barrier is needed beyond the bcast/allgather above.
        let tail_ptr = GlobalPtr {
            unit_id: home_unit,
            flags: 0,
            segid: tail_segid,
            teamid: team.id.0,
            offset_or_addr: 0,
        };
        if caller_unit == home_unit {
            rma::put(&team, tail_ptr, crate::dtype::BasicType::Byte, &GlobalPtr::NULL.to_wire())?;
        }
        crate::collectives::barrier(&team, caller_unit)?;

        Ok(DistLock {
            team,
            home_unit,
            qnode_segid,
            tail_segid,
            held_by: Mutex::new(None),
        })
    }

    fn tail_ptr(&self) -> GlobalPtr {
        GlobalPtr {
            unit_id: self.home_unit,
            flags: 0,
            segid: self.tail_segid,
            teamid: self.team.id.0,
            offset_or_addr: 0,
        }
    }

    /// Acquires the lock for `caller_unit`. Re-acquiring a lock the same unit
    /// already holds logs a warning and returns immediately without
    /// re-entering the queue (spec §7 (b)).
    pub fn acquire(&self, caller_unit: i32) -> Result<()> {
        {
            let mut held = self.held_by.lock();
            if *held == Some(caller_unit) {
                log::warn!("unit {caller_unit} re-acquired a lock it already holds");
                return Ok(());
            }
        }

        let my_qnode = qnode_ptr(&self.team, self.qnode_segid, caller_unit);
        rma::put(&self.team, my_qnode, crate::dtype::BasicType::Byte, &[1u8])?;
        let next_field = GlobalPtr {
            offset_or_addr: 8,
            ..my_qnode
        };
        rma::put(&self.team, next_field, crate::dtype::BasicType::Byte, &GlobalPtr::NULL.to_wire())?;

        let mut fetched = [0u8; crate::gptr::WIRE_SIZE];
        rma::fetch_op(
            &self.team,
            self.tail_ptr(),
            crate::dtype::BasicType::Byte,
            &my_qnode.to_wire(),
            AtomicOp::Replace,
            &mut fetched,
        )?;
        let predecessor = GlobalPtr::from_wire(&fetched);

        if !predecessor.is_null() {
            let pred_next = GlobalPtr {
                offset_or_addr: 8,
                ..predecessor
            };
            rma::put(&self.team, pred_next, crate::dtype::BasicType::Byte, &my_qnode.to_wire())?;

            loop {
                let mut locked = [0u8; 1];
                rma::get(&self.team, my_qnode, crate::dtype::BasicType::Byte, &mut locked)?;
                if locked[0] == 0 {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        *self.held_by.lock() = Some(caller_unit);
        Ok(())
    }

    /// Releases the lock held by `caller_unit`.
    pub fn release(&self, caller_unit: i32) -> Result<()> {
        {
            let mut held = self.held_by.lock();
            if *held != Some(caller_unit) {
                return Ok(());
            }
            *held = None;
        }

        let my_qnode = qnode_ptr(&self.team, self.qnode_segid, caller_unit);
        let mut fetched = [0u8; crate::gptr::WIRE_SIZE];
        rma::compare_swap(
            &self.team,
            self.tail_ptr(),
            crate::dtype::BasicType::Byte,
            &my_qnode.to_wire(),
            &GlobalPtr::NULL.to_wire(),
            &mut fetched,
        )?;
        if GlobalPtr::from_wire(&fetched) == my_qnode {
            return Ok(());
        }

        let next_field = GlobalPtr {
            offset_or_addr: 8,
            ..my_qnode
        };
        let successor = loop {
            let mut buf = [0u8; crate::gptr::WIRE_SIZE];
            rma::get(&self.team, next_field, crate::dtype::BasicType::Byte, &mut buf)?;
            let candidate = GlobalPtr::from_wire(&buf);
            if !candidate.is_null() {
                break candidate;
            }
            std::hint::spin_loop();
        };
        rma::put(&self.team, successor, crate::dtype::BasicType::Byte, &[0u8])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentTable;
    use crate::team::TEAM_ALL;
    use crate::transport::Communicator;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use std::thread;

    fn team_of(n: usize) -> Arc<TeamNode> {
        let transport = crate::loopback::LoopbackFabric::new(n);
        let comm = Communicator::new(transport, (0..n as i32).collect());
        Arc::new(TeamNode {
            id: TEAM_ALL,
            parent: None,
            children: Mutex::new(Vec::new()),
            group: (0..n as i32).collect(),
            comm,
            segments: RwLock::new(SegmentTable::new()),
        })
    }

    #[test]
    fn four_units_ping_pong_a_shared_counter_to_four_hundred() {
        let team = team_of(4);
        let counter_base = {
            let base = team.comm.transport.alloc_local(0, 8);
            team.comm.transport.put(0, base, &0i64.to_le_bytes());
            base
        };
        let counter_segid = team
            .segments
            .write()
            .alloc(8, Displacement::Shared(counter_base))
            .unwrap();
        let counter_gptr = GlobalPtr {
            unit_id: 0,
            flags: 0,
            segid: counter_segid,
            teamid: TEAM_ALL.0,
            offset_or_addr: 0,
        };

        thread::scope(|scope| {
            for unit in 0..4i32 {
                let team = team.clone();
                scope.spawn(move || {
                    let lock = DistLock::new(team.clone(), unit).unwrap();
                    for _ in 0..100 {
                        lock.acquire(unit).unwrap();
                        let mut buf = [0u8; 8];
                        rma::get(&team, counter_gptr, crate::dtype::BasicType::Long, &mut buf).unwrap();
                        let x = i64::from_le_bytes(buf);
                        rma::put(
                            &team,
                            counter_gptr,
                            crate::dtype::BasicType::Long,
                            &(x + 1).to_le_bytes(),
                        )
                        .unwrap();
                        lock.release(unit).unwrap();
                    }
                });
            }
        });

        let mut buf = [0u8; 8];
        rma::get(&team, counter_gptr, crate::dtype::BasicType::Long, &mut buf).unwrap();
        assert_eq!(i64::from_le_bytes(buf), 400);
    }

    #[test]
    fn reacquiring_a_held_lock_warns_and_returns_ok() {
        let team = team_of(1);
        let lock = DistLock::new(team, 0).unwrap();
        lock.acquire(0).unwrap();
        assert!(lock.acquire(0).is_ok());
        lock.release(0).unwrap();
    }
}

//! Team-scoped collective operations over [`crate::transport::Transport`]
//! (spec §4.3 component table: "Barrier, broadcast, reduce, allgather/v,
//! scatter/gather, alltoall").

use crate::error::{DartError, Result};
use crate::team::TeamNode;
use crate::transport::ReduceOp;
use crate::dtype::BasicType;

fn my_unit(team: &TeamNode, caller_unit: i32) -> Result<i32> {
    if !team.group.contains(&caller_unit) {
        return Err(DartError::Inval(format!(
            "unit {caller_unit} is not a member of this team"
        )));
    }
    Ok(caller_unit)
}

/// Blocks every member of `team` until all have entered (spec §8 scenario 2).
pub fn barrier(team: &TeamNode, caller_unit: i32) -> Result<()> {
    my_unit(team, caller_unit)?;
    team.comm.transport.barrier(&team.group, caller_unit);
    Ok(())
}

/// Every member contributes `send`; every member receives the concatenation
/// in team-group order (spec §8 scenario 1).
pub fn allgather(team: &TeamNode, caller_unit: i32, send: &[u8]) -> Result<Vec<u8>> {
    my_unit(team, caller_unit)?;
    Ok(team.comm.transport.allgather(&team.group, caller_unit, send))
}

/// `root` broadcasts `buf` to every member; `buf` is only read on `root`.
pub fn bcast(team: &TeamNode, caller_unit: i32, root: i32, buf: &[u8]) -> Result<Vec<u8>> {
    my_unit(team, caller_unit)?;
    if !team.group.contains(&root) {
        return Err(DartError::Inval(format!("root unit {root} is not a member of this team")));
    }
    Ok(team.comm.transport.bcast(&team.group, caller_unit, root, buf))
}

/// Elementwise all-reduce of every member's `send` (spec §4.3 component table).
pub fn reduce(
    team: &TeamNode,
    caller_unit: i32,
    send: &[u8],
    op: ReduceOp,
    ty: BasicType,
) -> Result<Vec<u8>> {
    my_unit(team, caller_unit)?;
    Ok(team
        .comm
        .transport
        .reduce(&team.group, caller_unit, send, op, ty))
}

/// `root`'s `send` buffer, divided evenly into `team.size()` chunks; caller
/// extracts its own chunk from the returned buffer.
pub fn scatter(team: &TeamNode, caller_unit: i32, root: i32, send: &[u8]) -> Result<Vec<u8>> {
    my_unit(team, caller_unit)?;
    let full = team.comm.transport.scatter(&team.group, caller_unit, root, send);
    let chunk = full.len() / team.size().max(1);
    let idx = team.g2l(caller_unit).unwrap() as usize;
    Ok(full[idx * chunk..(idx + 1) * chunk].to_vec())
}

/// Every member contributes `send`; `root` receives the concatenation in
/// team-group order.
pub fn gather(team: &TeamNode, caller_unit: i32, root: i32, send: &[u8]) -> Result<Vec<u8>> {
    my_unit(team, caller_unit)?;
    Ok(team.comm.transport.gather(&team.group, caller_unit, root, send))
}

/// Every member contributes a `team.size()`-chunk buffer; caller extracts its
/// own column (the data destined for it from each sender).
pub fn alltoall(team: &TeamNode, caller_unit: i32, send: &[u8]) -> Result<Vec<u8>> {
    my_unit(team, caller_unit)?;
    let n = team.size();
    let chunk = send.len() / n.max(1);
    let matrix = team.comm.transport.alltoall(&team.group, caller_unit, send);
    let my_idx = team.g2l(caller_unit).unwrap() as usize;
    let mut out = Vec::with_capacity(n * chunk);
    for sender in 0..n {
        let row = &matrix[sender * n * chunk..(sender + 1) * n * chunk];
        out.extend_from_slice(&row[my_idx * chunk..(my_idx + 1) * chunk]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentTable;
    use crate::team::TEAM_ALL;
    use crate::transport::Communicator;
    use parking_lot::{Mutex, RwLock};
    use std::thread;

    fn team_of(n: usize) -> std::sync::Arc<TeamNode> {
        let transport = crate::loopback::LoopbackFabric::new(n);
        let comm = Communicator::new(transport, (0..n as i32).collect());
        std::sync::Arc::new(TeamNode {
            id: TEAM_ALL,
            parent: None,
            children: Mutex::new(Vec::new()),
            group: (0..n as i32).collect(),
            comm,
            segments: RwLock::new(SegmentTable::new()),
        })
    }

    #[test]
    fn allgather_on_team_all_of_four() {
        let team = team_of(4);
        thread::scope(|scope| {
            for unit in 0..4i32 {
                let team = team.clone();
                scope.spawn(move || {
                    let result = allgather(&team, unit, &(unit as i64).to_le_bytes()).unwrap();
                    let values: Vec<i64> = result
                        .chunks(8)
                        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    assert_eq!(values, vec![0, 1, 2, 3]);
                });
            }
        });
    }

    #[test]
    fn barrier_orders_writer_before_readers() {
        let team = team_of(4);
        let shared = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0));
        thread::scope(|scope| {
            for unit in 0..4i32 {
                let team = team.clone();
                let shared = shared.clone();
                scope.spawn(move || {
                    if unit == 0 {
                        shared.store(42, std::sync::atomic::Ordering::SeqCst);
                    }
                    barrier(&team, unit).unwrap();
                    assert_eq!(shared.load(std::sync::atomic::Ordering::SeqCst), 42);
                });
            }
        });
    }

    #[test]
    fn alltoall_delivers_each_senders_column_to_its_destination() {
        let team = team_of(3);
        thread::scope(|scope| {
            for unit in 0..3i32 {
                let team = team.clone();
                scope.spawn(move || {
                    let send: Vec<u8> = (0..3i32).map(|dst| (unit * 10 + dst) as u8).collect();
                    let result = alltoall(&team, unit, &send).unwrap();
                    for (sender, &byte) in result.iter().enumerate() {
                        assert_eq!(byte, (sender as i32 * 10 + unit) as u8);
                    }
                });
            }
        });
    }
}

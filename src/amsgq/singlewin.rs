//! Single-window active-message back-end (spec §4.6 (b)): tailpos and ring
//! buffer share one window/segment, guarded by a single per-target lock.
//! Otherwise identical to [`super::dualwin`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dtype::BasicType;
use crate::error::{DartError, Result};
use crate::gptr::GlobalPtr;
use crate::rma;
use crate::team::TeamNode;
use crate::transport::AtomicOp;

use super::alloc_team_segment;
use super::message::{AmHeader, SymbolTable, HEADER_SIZE};

const TAIL_SLOT: u64 = 8;

pub struct SingleWindowQueue {
    team: Arc<TeamNode>,
    capacity: u64,
    segid: i16,
    send_locks: Vec<Mutex<()>>,
    recv_lock: Mutex<()>,
    symbols: Arc<SymbolTable>,
}

impl SingleWindowQueue {
    pub fn open(
        team: Arc<TeamNode>,
        caller_unit: i32,
        msg_max: u64,
        capacity_msgs: u64,
        symbols: Arc<SymbolTable>,
    ) -> Result<Self> {
        let capacity = (HEADER_SIZE as u64 + msg_max) * capacity_msgs;
        let segid = alloc_team_segment(&team, caller_unit, TAIL_SLOT + capacity)?;
        let n = team.size();
        Ok(SingleWindowQueue {
            team,
            capacity,
            segid,
            send_locks: (0..n).map(|_| Mutex::new(())).collect(),
            recv_lock: Mutex::new(()),
            symbols,
        })
    }

    fn tail_ptr(&self, target_unit: i32) -> GlobalPtr {
        GlobalPtr {
            unit_id: target_unit,
            flags: 0,
            segid: self.segid,
            teamid: self.team.id.0,
            offset_or_addr: 0,
        }
    }

    fn buf_ptr(&self, target_unit: i32, offset: u64) -> GlobalPtr {
        GlobalPtr {
            unit_id: target_unit,
            flags: 0,
            segid: self.segid,
            teamid: self.team.id.0,
            offset_or_addr: TAIL_SLOT + offset,
        }
    }

    pub fn trysend(&self, caller_unit: i32, target_unit: i32, function_id: u64, payload: &[u8]) -> Result<()> {
        let msg_size = (HEADER_SIZE + payload.len()) as u64;
        let local_idx = self
            .team
            .g2l(target_unit)
            .ok_or_else(|| DartError::Inval("unknown target unit".into()))? as usize;
        let _guard = self.send_locks[local_idx].lock();

        let mut fetched = [0u8; 8];
        rma::fetch_op(
            &self.team,
            self.tail_ptr(target_unit),
            BasicType::Long,
            &(msg_size as i64).to_le_bytes(),
            AtomicOp::Sum,
            &mut fetched,
        )?;
        let prior = i64::from_le_bytes(fetched) as u64;
        if prior + msg_size > self.capacity {
            let mut undo = [0u8; 8];
            rma::fetch_op(
                &self.team,
                self.tail_ptr(target_unit),
                BasicType::Long,
                &(-(msg_size as i64)).to_le_bytes(),
                AtomicOp::Sum,
                &mut undo,
            )?;
            return Err(DartError::Again);
        }

        let header = AmHeader {
            function_id,
            origin_unit: caller_unit,
            payload_size: payload.len() as u32,
        };
        rma::put(&self.team, self.buf_ptr(target_unit, prior), BasicType::Byte, &header.to_wire())?;
        rma::put(
            &self.team,
            self.buf_ptr(target_unit, prior + HEADER_SIZE as u64),
            BasicType::Byte,
            payload,
        )?;
        Ok(())
    }

    pub fn process(&self, caller_unit: i32) -> Result<()> {
        let Some(_guard) = self.recv_lock.try_lock() else {
            return Ok(());
        };
        self.drain(caller_unit)
    }

    fn drain(&self, caller_unit: i32) -> Result<()> {
        let mut fetched = [0u8; 8];
        rma::fetch_op(
            &self.team,
            self.tail_ptr(caller_unit),
            BasicType::Long,
            &0i64.to_le_bytes(),
            AtomicOp::Replace,
            &mut fetched,
        )?;
        let tailpos = i64::from_le_bytes(fetched) as u64;
        if tailpos == 0 {
            return Ok(());
        }
        let mut scratch = vec![0u8; tailpos as usize];
        rma::get(&self.team, self.buf_ptr(caller_unit, 0), BasicType::Byte, &mut scratch)?;

        let mut offset = 0usize;
        while offset < scratch.len() {
            let header = AmHeader::from_wire(&scratch[offset..offset + HEADER_SIZE]);
            offset += HEADER_SIZE;
            let payload = &scratch[offset..offset + header.payload_size as usize];
            if let Some(f) = self.symbols.resolve(header.function_id) {
                f(payload);
            }
            offset += header.payload_size as usize;
        }
        Ok(())
    }

    /// See [`super::dualwin::DualWindowQueue::process_blocking`] for why this
    /// polls to quiescence instead of entering a literal team-wide barrier.
    pub fn process_blocking(&self, caller_unit: i32) -> Result<()> {
        let _guard = self.recv_lock.lock();
        let mut idle_passes = 0;
        while idle_passes < 3 {
            let mut fetched = [0u8; 8];
            rma::get(&self.team, self.tail_ptr(caller_unit), BasicType::Byte, &mut fetched)?;
            if i64::from_le_bytes(fetched) == 0 {
                idle_passes += 1;
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            idle_passes = 0;
            self.drain(caller_unit)?;
        }
        Ok(())
    }

    pub fn close(&self, caller_unit: i32) -> Result<()> {
        let mut tailpos = [0u8; 8];
        rma::get(&self.team, self.tail_ptr(caller_unit), BasicType::Byte, &mut tailpos)?;
        if i64::from_le_bytes(tailpos) != 0 {
            log::warn!("closing active-message queue with non-zero tailpos; discarding pending messages");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentTable;
    use crate::team::TEAM_ALL;
    use crate::transport::Communicator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::RwLock;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    static RECEIVED: StdMutex<Vec<i32>> = StdMutex::new(Vec::new());
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn record(payload: &[u8]) {
        let v = i32::from_le_bytes(payload.try_into().unwrap());
        RECEIVED.lock().unwrap().push(v);
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

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
    fn throughput_delivers_every_message_sent() {
        RECEIVED.lock().unwrap().clear();
        CALLS.store(0, Ordering::SeqCst);
        let team = team_of(2);
        let symbols = Arc::new(SymbolTable::new());
        let fn_id = symbols.register(record);

        let sender_handle = {
            let team = team.clone();
            let symbols = symbols.clone();
            thread::spawn(move || SingleWindowQueue::open(team, 0, 64, 256, symbols).unwrap())
        };
        let receiver_q = SingleWindowQueue::open(team.clone(), 1, 64, 256, symbols.clone()).unwrap();
        let sender_q = sender_handle.join().unwrap();

        for i in 0..100i32 {
            sender_q.trysend(0, 1, fn_id, &i.to_le_bytes()).unwrap();
        }
        receiver_q.process_blocking(1).unwrap();

        let mut got = RECEIVED.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }
}

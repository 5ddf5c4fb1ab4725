//! SOPNOP (same-op-no-op ordering, double-buffered) active-message back-end
//! (spec §4.6 (c)): no per-write exclusive lock. Writers race a
//! fetch-and-add on the active buffer's tailpos, admitted or turned away by
//! a writer-count guard the receiver closes before swapping buffers.
//!
//! The closing protocol is simplified from the original's `±PROCESSING_SIGNAL`
//! add/subtract dance (spec §9 open question (b) flags that routine as
//! already suspect at shutdown) to a single large negative offset subtracted
//! from the closing buffer's writer count, which a spinning receiver waits to
//! see land on exactly `-CLOSE_OFFSET` once every in-flight writer has
//! decremented out. See `DESIGN.md`.

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

const CLOSE_OFFSET: i64 = 1_000_000_000;

const OFF_CURRENT: u64 = 0;
const OFF_WRITER_COUNT: [u64; 2] = [8, 16];
const OFF_TAILPOS: [u64; 2] = [24, 32];
const OFF_BUF_BASE: u64 = 40;

pub struct SopnopQueue {
    team: Arc<TeamNode>,
    capacity: u64,
    segid: i16,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    symbols: Arc<SymbolTable>,
}

impl SopnopQueue {
    pub fn open(
        team: Arc<TeamNode>,
        caller_unit: i32,
        msg_max: u64,
        capacity_msgs: u64,
        symbols: Arc<SymbolTable>,
    ) -> Result<Self> {
        let capacity = (HEADER_SIZE as u64 + msg_max) * capacity_msgs;
        let segid = alloc_team_segment(&team, caller_unit, OFF_BUF_BASE + 2 * capacity)?;
        Ok(SopnopQueue {
            team,
            capacity,
            segid,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            symbols,
        })
    }

    fn cell(&self, target_unit: i32, offset: u64) -> GlobalPtr {
        GlobalPtr {
            unit_id: target_unit,
            flags: 0,
            segid: self.segid,
            teamid: self.team.id.0,
            offset_or_addr: offset,
        }
    }

    fn get_i64(&self, target_unit: i32, offset: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        rma::get(&self.team, self.cell(target_unit, offset), BasicType::Byte, &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn fetch_add(&self, target_unit: i32, offset: u64, delta: i64) -> Result<i64> {
        let mut fetched = [0u8; 8];
        rma::fetch_op(
            &self.team,
            self.cell(target_unit, offset),
            BasicType::Long,
            &delta.to_le_bytes(),
            AtomicOp::Sum,
            &mut fetched,
        )?;
        Ok(i64::from_le_bytes(fetched))
    }

    fn replace_i64(&self, target_unit: i32, offset: u64, new: i64) -> Result<i64> {
        let mut fetched = [0u8; 8];
        rma::fetch_op(
            &self.team,
            self.cell(target_unit, offset),
            BasicType::Long,
            &new.to_le_bytes(),
            AtomicOp::Replace,
            &mut fetched,
        )?;
        Ok(i64::from_le_bytes(fetched))
    }

    /// Step 1 of the send path: atomically swap `current_queue` only if it
    /// still equals the last-observed value, so a concurrent receiver flip
    /// is never silently missed (spec §4.6 (c) step 1 "read atomically").
    fn compare_swap_i64(&self, target_unit: i32, offset: u64, expected: i64, new: i64) -> Result<i64> {
        let mut fetched = [0u8; 8];
        rma::compare_swap(
            &self.team,
            self.cell(target_unit, offset),
            BasicType::Byte,
            &expected.to_le_bytes(),
            &new.to_le_bytes(),
            &mut fetched,
        )?;
        Ok(i64::from_le_bytes(fetched))
    }

    pub fn trysend(&self, caller_unit: i32, target_unit: i32, function_id: u64, payload: &[u8]) -> Result<()> {
        let msg_size = (HEADER_SIZE + payload.len()) as u64;
        let _guard = self.send_lock.lock();

        let cur = loop {
            let cur = self.get_i64(target_unit, OFF_CURRENT)? as usize % 2;
            let post = self.fetch_add(target_unit, OFF_WRITER_COUNT[cur], 1)? + 1;
            if post < 0 {
                self.fetch_add(target_unit, OFF_WRITER_COUNT[cur], -1)?;
                std::hint::spin_loop();
                continue;
            }
            break cur;
        };

        let pre = self.fetch_add(target_unit, OFF_TAILPOS[cur], msg_size as i64)?;
        let prior = pre as u64;
        if prior + msg_size > self.capacity {
            self.fetch_add(target_unit, OFF_TAILPOS[cur], -(msg_size as i64))?;
            self.fetch_add(target_unit, OFF_WRITER_COUNT[cur], -1)?;
            return Err(DartError::Again);
        }

        let header = AmHeader {
            function_id,
            origin_unit: caller_unit,
            payload_size: payload.len() as u32,
        };
        let buf_base = OFF_BUF_BASE + cur as u64 * self.capacity;
        rma::put(&self.team, self.cell(target_unit, buf_base + prior), BasicType::Byte, &header.to_wire())?;
        rma::put(
            &self.team,
            self.cell(target_unit, buf_base + prior + HEADER_SIZE as u64),
            BasicType::Byte,
            payload,
        )?;
        self.fetch_add(target_unit, OFF_WRITER_COUNT[cur], -1)?;
        Ok(())
    }

    pub fn process(&self, caller_unit: i32) -> Result<()> {
        let Some(_guard) = self.recv_lock.try_lock() else {
            return Ok(());
        };
        self.drain_once(caller_unit)
    }

    fn drain_once(&self, caller_unit: i32) -> Result<()> {
        let cur = self.get_i64(caller_unit, OFF_CURRENT)? as usize % 2;
        let tailpos = self.get_i64(caller_unit, OFF_TAILPOS[cur])?;
        if tailpos == 0 {
            return Ok(());
        }
        let new = 1 - cur as i64;
        let swapped = self.compare_swap_i64(caller_unit, OFF_CURRENT, cur as i64, new)?;
        if swapped != cur as i64 {
            // Another receiver thread (unusual, but defensive) already
            // flipped it; let this pass be a no-op.
            return Ok(());
        }

        self.fetch_add(caller_unit, OFF_WRITER_COUNT[cur], -CLOSE_OFFSET)?;
        while self.get_i64(caller_unit, OFF_WRITER_COUNT[cur])? != -CLOSE_OFFSET {
            std::hint::spin_loop();
        }

        let tailpos = self.get_i64(caller_unit, OFF_TAILPOS[cur])? as u64;
        let buf_base = OFF_BUF_BASE + cur as u64 * self.capacity;
        let mut scratch = vec![0u8; tailpos as usize];
        rma::get(&self.team, self.cell(caller_unit, buf_base), BasicType::Byte, &mut scratch)?;

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

        self.replace_i64(caller_unit, OFF_TAILPOS[cur], 0)?;
        self.replace_i64(caller_unit, OFF_WRITER_COUNT[cur], 0)?;
        Ok(())
    }

    /// See [`super::dualwin::DualWindowQueue::process_blocking`] for why this
    /// polls to quiescence instead of a literal team-wide barrier.
    pub fn process_blocking(&self, caller_unit: i32) -> Result<()> {
        let _guard = self.recv_lock.lock();
        let mut idle_passes = 0;
        while idle_passes < 3 {
            let cur = self.get_i64(caller_unit, OFF_CURRENT)? as usize % 2;
            if self.get_i64(caller_unit, OFF_TAILPOS[cur])? == 0 {
                idle_passes += 1;
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            idle_passes = 0;
            self.drain_once(caller_unit)?;
        }
        Ok(())
    }

    pub fn close(&self, caller_unit: i32) -> Result<()> {
        let cur = self.get_i64(caller_unit, OFF_CURRENT)? as usize % 2;
        if self.get_i64(caller_unit, OFF_TAILPOS[cur])? != 0 {
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
    use parking_lot::RwLock;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    static RECEIVED: StdMutex<Vec<i32>> = StdMutex::new(Vec::new());

    fn record(payload: &[u8]) {
        let v = i32::from_le_bytes(payload.try_into().unwrap());
        RECEIVED.lock().unwrap().push(v);
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
    fn concurrent_senders_are_all_delivered_without_loss() {
        RECEIVED.lock().unwrap().clear();
        let team = team_of(3);
        let symbols = Arc::new(SymbolTable::new());
        let fn_id = symbols.register(record);

        let sender_handles: Vec<_> = [0, 1]
            .into_iter()
            .map(|unit| {
                let team = team.clone();
                let symbols = symbols.clone();
                thread::spawn(move || SopnopQueue::open(team, unit, 64, 256, symbols).unwrap())
            })
            .collect();
        let receiver_q = SopnopQueue::open(team.clone(), 2, 64, 256, symbols.clone()).unwrap();
        let senders: Vec<_> = sender_handles.into_iter().map(|h| h.join().unwrap()).collect();

        thread::scope(|scope| {
            for sender in &senders {
                scope.spawn(move || {
                    for i in 0..50i32 {
                        sender.trysend(0, 2, fn_id, &i.to_le_bytes()).unwrap();
                    }
                });
            }
        });
        receiver_q.process_blocking(2).unwrap();

        let mut got = RECEIVED.lock().unwrap().clone();
        got.sort();
        let mut expected: Vec<i32> = (0..50).chain(0..50).collect();
        expected.sort();
        assert_eq!(got, expected);
    }
}

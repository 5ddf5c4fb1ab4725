//! In-process loopback [`Transport`]: each unit is an OS thread inside one
//! process, sharing per-unit memory arenas guarded by a mutex apiece. The one
//! concrete substrate DART's own test suite runs against (see `SPEC_FULL.md`
//! "Loopback transport").

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::dtype::BasicType;
use crate::transport::{AtomicOp, ReduceOp, Transport};

struct Arena {
    bytes: Mutex<Vec<u8>>,
}

impl Arena {
    fn new() -> Self {
        Arena {
            bytes: Mutex::new(Vec::new()),
        }
    }

    fn ensure_len(guard: &mut Vec<u8>, end: usize) {
        if guard.len() < end {
            guard.resize(end, 0);
        }
    }
}

/// Rendezvous point shared by every collective call issued against a given
/// member set. One `Mutex<RendezvousState>` + `Condvar` pair per
/// [`LoopbackFabric`]; concurrent collectives on disjoint member sets still
/// serialize through it, which is fine for a test substrate.
struct RendezvousState {
    generation: u64,
    arrived: usize,
    expected: usize,
    contributions: Vec<Option<Vec<u8>>>,
    result: Option<Arc<Vec<u8>>>,
}

pub struct LoopbackFabric {
    arenas: Vec<Arena>,
    rendezvous: Mutex<RendezvousState>,
    cv: Condvar,
}

impl LoopbackFabric {
    pub fn new(unit_count: usize) -> Arc<Self> {
        let mut arenas = Vec::with_capacity(unit_count);
        arenas.resize_with(unit_count, Arena::new);
        Arc::new(LoopbackFabric {
            arenas,
            rendezvous: Mutex::new(RendezvousState {
                generation: 0,
                arrived: 0,
                expected: 0,
                contributions: Vec::new(),
                result: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Every one of `members` calls this with its own `contribution`; the
    /// thread that completes the set computes `combine` once over all
    /// contributions (ordered to match `members`) and every caller receives
    /// the same result.
    fn rendezvous(
        &self,
        members: &[i32],
        my_unit: i32,
        contribution: Vec<u8>,
        combine: impl FnOnce(&[Vec<u8>]) -> Vec<u8>,
    ) -> Arc<Vec<u8>> {
        let my_local = members
            .iter()
            .position(|&u| u == my_unit)
            .expect("caller must be a member of its own collective");

        let mut state = self.rendezvous.lock();
        if state.arrived == 0 {
            state.expected = members.len();
            state.contributions = vec![None; members.len()];
        }
        let my_generation = state.generation;
        state.contributions[my_local] = Some(contribution);
        state.arrived += 1;

        if state.arrived == state.expected {
            let inputs: Vec<Vec<u8>> = state
                .contributions
                .iter()
                .map(|c| c.clone().unwrap_or_default())
                .collect();
            let result = Arc::new(combine(&inputs));
            state.result = Some(result.clone());
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            result
        } else {
            self.cv.wait_while_for(
                &mut state,
                |s| s.generation == my_generation,
                std::time::Duration::from_secs(30),
            );
            state
                .result
                .clone()
                .expect("rendezvous completed without producing a result")
        }
    }
}

fn apply_atomic(op: AtomicOp, ty: BasicType, current: &[u8], operand: &[u8]) -> Vec<u8> {
    // A raw replace needs no numeric interpretation and no fixed width: the
    // new value is simply `operand`'s bytes, whatever their length — this is
    // what lets `DistLock` fetch-and-replace a 24-byte global pointer through
    // `BasicType::Byte` rather than every caller needing a wide basic type.
    if op == AtomicOp::Replace {
        return operand.to_vec();
    }

    macro_rules! numeric_op {
        ($t:ty) => {{
            let cur = <$t>::from_le_bytes(current.try_into().unwrap());
            let rhs = <$t>::from_le_bytes(operand.try_into().unwrap());
            let out = match op {
                AtomicOp::Sum => cur.wrapping_add(rhs),
                AtomicOp::Prod => cur.wrapping_mul(rhs),
                AtomicOp::Min => cur.min(rhs),
                AtomicOp::Max => cur.max(rhs),
                AtomicOp::BAnd => cur & rhs,
                AtomicOp::BOr => cur | rhs,
                AtomicOp::BXor => cur ^ rhs,
                AtomicOp::Replace => unreachable!("handled above"),
            };
            out.to_le_bytes().to_vec()
        }};
    }

    match ty {
        BasicType::Byte => {
            let cur = current[0];
            let rhs = operand[0];
            vec![match op {
                AtomicOp::Sum => cur.wrapping_add(rhs),
                AtomicOp::Prod => cur.wrapping_mul(rhs),
                AtomicOp::Min => cur.min(rhs),
                AtomicOp::Max => cur.max(rhs),
                AtomicOp::BAnd => cur & rhs,
                AtomicOp::BOr => cur | rhs,
                AtomicOp::BXor => cur ^ rhs,
                AtomicOp::Replace => unreachable!("handled above"),
            }]
        }
        BasicType::Short => numeric_op!(i16),
        BasicType::Int => numeric_op!(i32),
        BasicType::UInt => numeric_op!(u32),
        BasicType::Long | BasicType::LongLong => numeric_op!(i64),
        BasicType::ULong | BasicType::ULongLong => numeric_op!(u64),
        BasicType::Float => {
            let cur = f32::from_le_bytes(current.try_into().unwrap());
            let rhs = f32::from_le_bytes(operand.try_into().unwrap());
            let out = match op {
                AtomicOp::Sum => cur + rhs,
                AtomicOp::Prod => cur * rhs,
                AtomicOp::Min => cur.min(rhs),
                AtomicOp::Max => cur.max(rhs),
                AtomicOp::Replace => unreachable!("handled above"),
                _ => panic!("bitwise op on float type"),
            };
            out.to_le_bytes().to_vec()
        }
        BasicType::Double | BasicType::LongDouble => {
            let cur = f64::from_le_bytes(current[..8].try_into().unwrap());
            let rhs = f64::from_le_bytes(operand[..8].try_into().unwrap());
            let out = match op {
                AtomicOp::Sum => cur + rhs,
                AtomicOp::Prod => cur * rhs,
                AtomicOp::Min => cur.min(rhs),
                AtomicOp::Max => cur.max(rhs),
                AtomicOp::Replace => unreachable!("handled above"),
                _ => panic!("bitwise op on float type"),
            };
            out.to_le_bytes().to_vec()
        }
    }
}

impl Transport for LoopbackFabric {
    fn unit_count(&self) -> usize {
        self.arenas.len()
    }

    fn alloc_local(&self, unit: i32, size: u64) -> u64 {
        let arena = &self.arenas[unit as usize];
        let mut guard = arena.bytes.lock();
        let base = guard.len() as u64;
        guard.resize(guard.len() + size as usize, 0);
        base
    }

    fn put(&self, target_unit: i32, addr: u64, src: &[u8]) {
        let arena = &self.arenas[target_unit as usize];
        let mut guard = arena.bytes.lock();
        let end = addr as usize + src.len();
        Arena::ensure_len(&mut guard, end);
        guard[addr as usize..end].copy_from_slice(src);
    }

    fn get(&self, target_unit: i32, addr: u64, dst: &mut [u8]) {
        let arena = &self.arenas[target_unit as usize];
        let guard = arena.bytes.lock();
        let end = addr as usize + dst.len();
        assert!(end <= guard.len(), "get past end of unit {target_unit}'s arena");
        dst.copy_from_slice(&guard[addr as usize..end]);
    }

    fn accumulate(&self, target_unit: i32, addr: u64, src: &[u8], op: AtomicOp, ty: BasicType) {
        let arena = &self.arenas[target_unit as usize];
        let mut guard = arena.bytes.lock();
        let end = addr as usize + src.len();
        Arena::ensure_len(&mut guard, end);
        let current = guard[addr as usize..end].to_vec();
        let out = apply_atomic(op, ty, &current, src);
        guard[addr as usize..end].copy_from_slice(&out);
    }

    fn fetch_op(
        &self,
        target_unit: i32,
        addr: u64,
        operand: &[u8],
        op: AtomicOp,
        ty: BasicType,
        fetched: &mut [u8],
    ) {
        let arena = &self.arenas[target_unit as usize];
        let mut guard = arena.bytes.lock();
        let end = addr as usize + operand.len();
        Arena::ensure_len(&mut guard, end);
        let current = guard[addr as usize..end].to_vec();
        fetched.copy_from_slice(&current);
        let out = apply_atomic(op, ty, &current, operand);
        guard[addr as usize..end].copy_from_slice(&out);
    }

    fn compare_swap(
        &self,
        target_unit: i32,
        addr: u64,
        expected: &[u8],
        new: &[u8],
        _ty: BasicType,
        fetched: &mut [u8],
    ) {
        let arena = &self.arenas[target_unit as usize];
        let mut guard = arena.bytes.lock();
        let end = addr as usize + new.len();
        Arena::ensure_len(&mut guard, end);
        let current = guard[addr as usize..end].to_vec();
        fetched.copy_from_slice(&current);
        if current == expected {
            guard[addr as usize..end].copy_from_slice(new);
        }
    }

    fn barrier(&self, members: &[i32], my_unit: i32) {
        self.rendezvous(members, my_unit, Vec::new(), |_| Vec::new());
    }

    fn allgather(&self, members: &[i32], my_unit: i32, send: &[u8]) -> Vec<u8> {
        let chunk = send.len();
        (*self.rendezvous(members, my_unit, send.to_vec(), move |inputs| {
            let mut out = Vec::with_capacity(inputs.len() * chunk);
            for c in inputs {
                out.extend_from_slice(c);
            }
            out
        }))
        .clone()
    }

    fn bcast(&self, members: &[i32], my_unit: i32, root: i32, buf: &[u8]) -> Vec<u8> {
        let root_local = members.iter().position(|&u| u == root).unwrap();
        let contribution = if my_unit == root { buf.to_vec() } else { Vec::new() };
        (*self.rendezvous(members, my_unit, contribution, move |inputs| {
            inputs[root_local].clone()
        }))
        .clone()
    }

    fn reduce(&self, members: &[i32], my_unit: i32, send: &[u8], op: ReduceOp, ty: BasicType) -> Vec<u8> {
        let elem_size = ty.size();
        (*self.rendezvous(members, my_unit, send.to_vec(), move |inputs| {
            let mut acc = inputs[0].clone();
            for other in &inputs[1..] {
                for (chunk_acc, chunk_other) in
                    acc.chunks_mut(elem_size).zip(other.chunks(elem_size))
                {
                    let merged = apply_atomic(op, ty, chunk_acc, chunk_other);
                    chunk_acc.copy_from_slice(&merged);
                }
            }
            acc
        }))
        .as_ref()
        .clone()
    }

    fn scatter(&self, members: &[i32], my_unit: i32, root: i32, send: &[u8]) -> Vec<u8> {
        let root_local = members.iter().position(|&u| u == root).unwrap();
        let contribution = if my_unit == root { send.to_vec() } else { Vec::new() };
        (*self.rendezvous(members, my_unit, contribution, move |inputs| {
            inputs[root_local].clone()
        }))
        .clone()
    }

    fn gather(&self, members: &[i32], my_unit: i32, _root: i32, send: &[u8]) -> Vec<u8> {
        let chunk = send.len();
        (*self.rendezvous(members, my_unit, send.to_vec(), move |inputs| {
            let mut out = Vec::with_capacity(inputs.len() * chunk);
            for c in inputs {
                out.extend_from_slice(c);
            }
            out
        }))
        .clone()
    }

    fn alltoall(&self, members: &[i32], my_unit: i32, send: &[u8]) -> Vec<u8> {
        let chunk = send.len();
        (*self.rendezvous(members, my_unit, send.to_vec(), move |inputs| {
            let mut out = Vec::with_capacity(inputs.len() * chunk);
            for c in inputs {
                out.extend_from_slice(c);
            }
            out
        }))
        .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn put_then_get_round_trips() {
        let fabric = LoopbackFabric::new(2);
        let addr = fabric.alloc_local(1, 8);
        fabric.put(1, addr, b"hello!!!");
        let mut buf = [0u8; 8];
        fabric.get(1, addr, &mut buf);
        assert_eq!(&buf, b"hello!!!");
    }

    #[test]
    fn fetch_add_across_threads_has_no_lost_updates() {
        let fabric = LoopbackFabric::new(1);
        let addr = fabric.alloc_local(0, 8);
        fabric.put(0, addr, &0i64.to_le_bytes());

        thread::scope(|scope| {
            for _ in 0..8 {
                let fabric = &fabric;
                scope.spawn(move || {
                    for _ in 0..50 {
                        let mut fetched = [0u8; 8];
                        fabric.fetch_op(
                            0,
                            addr,
                            &1i64.to_le_bytes(),
                            AtomicOp::Sum,
                            BasicType::Long,
                            &mut fetched,
                        );
                    }
                });
            }
        });

        let mut total = [0u8; 8];
        fabric.get(0, addr, &mut total);
        assert_eq!(i64::from_le_bytes(total), 400);
    }

    #[test]
    fn allgather_collects_every_unit_in_member_order() {
        let fabric = LoopbackFabric::new(4);
        let members = vec![0, 1, 2, 3];
        thread::scope(|scope| {
            for &unit in &members {
                let fabric = &fabric;
                let members = members.clone();
                scope.spawn(move || {
                    let result = fabric.allgather(&members, unit, &(unit as i64).to_le_bytes());
                    let values: Vec<i64> = result
                        .chunks(8)
                        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    assert_eq!(values, vec![0, 1, 2, 3]);
                });
            }
        });
    }
}

//! End-to-end collective scenarios run across several OS threads sharing one
//! in-process loopback fabric, each standing in for a separate unit (spec §8
//! scenarios 1 "Allgather on TEAM_ALL" and 2 "Barrier ordering").

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use dart::collectives::{allgather, barrier};
use dart::loopback::LoopbackFabric;
use dart::segment::SegmentTable;
use dart::team::{TeamNode, TEAM_ALL};
use dart::transport::Communicator;

fn team_of(n: usize) -> Arc<TeamNode> {
    let transport = LoopbackFabric::new(n);
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
fn allgather_on_team_all_delivers_every_units_contribution_in_order() {
    let team = team_of(6);
    thread::scope(|scope| {
        for unit in 0..6i32 {
            let team = team.clone();
            scope.spawn(move || {
                let result = allgather(&team, unit, &(unit * unit).to_le_bytes()).unwrap();
                let values: Vec<i32> = result
                    .chunks(4)
                    .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                assert_eq!(values, vec![0, 1, 4, 9, 16, 25]);
            });
        }
    });
}

/// Every unit appends to a shared log only after observing the barrier; if
/// the barrier failed to order them, some thread could append before a
/// slower thread even starts, but every entry must still appear exactly
/// once and the final length must match the unit count.
#[test]
fn barrier_admits_every_unit_exactly_once_before_releasing_any() {
    let team = team_of(8);
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let released = AtomicI64::new(0);
    thread::scope(|scope| {
        for unit in 0..8i32 {
            let team = team.clone();
            let arrivals = arrivals.clone();
            let released = &released;
            scope.spawn(move || {
                arrivals.lock().unwrap().push(unit);
                barrier(&team, unit).unwrap();
                released.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    let mut seen = arrivals.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
    assert_eq!(released.load(Ordering::SeqCst), 8);
}

#[test]
fn collective_on_a_non_member_unit_is_rejected() {
    let team = team_of(3);
    assert!(barrier(&team, 99).is_err());
}

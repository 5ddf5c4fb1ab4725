//! Task DAG correctness: dependency-tracked tasks run in an order consistent
//! with their declared IN/OUT/INOUT accesses, regardless of how the
//! work-stealing scheduler interleaves everything else (spec §8 scenario 6
//! "Task DAG correctness").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dart::depgraph::{submit_with_deps, DepKind, Table};
use dart::gptr::GlobalPtr;
use dart::task::{task_wait, Priority, Scheduler};

fn key(offset: u64) -> GlobalPtr {
    GlobalPtr {
        unit_id: 0,
        flags: 0,
        segid: 1,
        teamid: 0,
        offset_or_addr: offset,
    }
}

/// A chain of five tasks alternately writing and reading the same cell must
/// run strictly in submission order: each reader only ever sees the value
/// the writer immediately before it left.
#[test]
fn a_write_read_write_read_chain_runs_in_dependency_order() {
    let scheduler = Scheduler::new(4, 256 * 1024);
    let table = Arc::new(Table::new());
    let cell = Arc::new(std::sync::atomic::AtomicI64::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    let k = key(64);

    let mut tasks = Vec::new();
    for step in 0..6i64 {
        let cell = cell.clone();
        let log = log.clone();
        let kind = if step % 2 == 0 { DepKind::Out } else { DepKind::In };
        let task = submit_with_deps(
            &scheduler,
            &table,
            0,
            None,
            Priority::Normal,
            None,
            None,
            &[(k, kind)],
            move || {
                if kind == DepKind::Out {
                    cell.store(step, Ordering::SeqCst);
                } else {
                    log.lock().unwrap().push((step, cell.load(Ordering::SeqCst)));
                }
            },
        );
        tasks.push(task);
    }
    for t in &tasks {
        task_wait(t);
    }
    scheduler.shutdown();

    // Every odd (reader) step must have observed the even (writer) step
    // immediately before it, never a later or stale value.
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 3);
    for &(step, seen) in log.iter() {
        assert_eq!(seen, step - 1);
    }
}

/// Two readers of the same cell have no ordering edge between them and may
/// run in either order or concurrently, but a later writer must still wait
/// for both to finish before a third party observes its value.
#[test]
fn concurrent_readers_do_not_block_each_other_but_a_later_writer_waits_for_both() {
    let scheduler = Scheduler::new(4, 256 * 1024);
    let table = Arc::new(Table::new());
    let k = key(128);
    let cell = Arc::new(std::sync::atomic::AtomicI64::new(7));
    let readers_done = Arc::new(AtomicUsize::new(0));
    let writer_saw_both_done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let writer0 = submit_with_deps(
        &scheduler,
        &table,
        0,
        None,
        Priority::Normal,
        None,
        None,
        &[(k, DepKind::Out)],
        {
            let cell = cell.clone();
            move || cell.store(7, Ordering::SeqCst)
        },
    );

    let mut readers = Vec::new();
    for _ in 0..2 {
        let readers_done = readers_done.clone();
        let r = submit_with_deps(&scheduler, &table, 0, None, Priority::Normal, None, None, &[(k, DepKind::In)], move || {
            readers_done.fetch_add(1, Ordering::SeqCst);
        });
        readers.push(r);
    }

    let writer1 = submit_with_deps(
        &scheduler,
        &table,
        0,
        None,
        Priority::Normal,
        None,
        None,
        &[(k, DepKind::Out)],
        {
            let readers_done = readers_done.clone();
            let writer_saw_both_done = writer_saw_both_done.clone();
            move || {
                writer_saw_both_done.store(readers_done.load(Ordering::SeqCst) == 2, Ordering::SeqCst);
            }
        },
    );

    task_wait(&writer0);
    for r in &readers {
        task_wait(r);
    }
    task_wait(&writer1);
    scheduler.shutdown();

    assert!(writer_saw_both_done.load(Ordering::SeqCst));
}

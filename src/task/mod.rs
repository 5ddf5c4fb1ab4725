//! Cooperative user-level task scheduler (spec §4.7): work-stealing dispatch
//! over stackful contexts switched by [`context`], running on OS worker
//! threads created once at init (spec §5: "Parallel OS-level worker threads;
//! cooperative user-level tasks within each worker").

pub mod context;
pub mod scheduler;
pub mod stack;

use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use scheduler::{Priority, Scheduler, Stats, Task, TaskId, TaskState};

/// Submits a new task for execution (spec §4.7's `create_task`). `Inline`
/// tasks run synchronously before this returns; everything else is queued
/// (or, for a task with a `parent`, bumps the parent's outstanding-child
/// counter first so [`task_complete`] on the parent cannot race a not-yet-
/// counted child to zero).
pub fn create_task(
    scheduler: &Arc<Scheduler>,
    priority: Priority,
    parent: Option<Arc<Task>>,
    description: Option<String>,
    body: impl FnOnce() + Send + 'static,
) -> Arc<Task> {
    scheduler::spawn_task(scheduler, priority, parent, description, body)
}

/// Blocks the calling OS thread until `task` reaches `Finished`/`Cancelled`.
/// Intended for use from outside any task (e.g. the root application thread
/// waiting on top-level work); a task waiting on another task should prefer
/// cooperative polling so its worker can run other ready work meanwhile —
/// see [`task_complete`].
pub fn task_wait(task: &Arc<Task>) {
    task.wait();
}

pub fn task_test(task: &Arc<Task>) -> bool {
    task.test()
}

/// Blocks the calling task (or, for the root task, the calling thread) until
/// every descendant has finished (spec §4.7: "`task_complete` blocks the
/// calling task... until all descendant tasks have finished"). Called from
/// within a running task, this cooperatively yields rather than parking the
/// worker, so sibling and stolen work keeps making progress while it waits.
pub fn task_complete(scheduler: &Arc<Scheduler>, task: &Arc<Task>) {
    if scheduler::current_task().is_some() {
        while task.outstanding_children.load(Ordering::Acquire) > 0 {
            yield_now(scheduler, 0);
        }
    } else {
        while task.outstanding_children.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
    }
}

/// Voluntary yield (spec §4.7: "`yield(delay)` yields to another task if
/// delay >= 0 and the local queue is non-empty"). A negative delay, or an
/// empty local queue, makes this a cheap no-op rather than a full context
/// switch. Only meaningful when called from within a running task; a no-op
/// from any other caller.
pub fn yield_now(scheduler: &Arc<Scheduler>, delay: i64) {
    let Some(task) = scheduler::current_task() else {
        return;
    };
    if task.cancelled.load(Ordering::Acquire) {
        *task.state.lock() = TaskState::Cancelled;
        context::yield_to_worker();
        unreachable!("a cancelled task's context must never be resumed");
    }
    if delay < 0 {
        return;
    }
    let worker_id = (task.id.0 as usize) % scheduler.num_workers();
    if scheduler.queue_is_empty(worker_id) {
        return;
    }
    *task.state.lock() = TaskState::Suspended;
    context::yield_to_worker();
}

/// Transitions the currently running task to `Detached` (spec §4.7:
/// "`mark_detached` transitions a running task to `detached`; the runtime
/// holds it alive until `release_detached` is called"). Must be called from
/// within the task being detached; yields immediately afterward so the
/// worker parks it rather than re-enqueuing it.
pub fn mark_detached(task: &Arc<Task>) {
    *task.state.lock() = TaskState::Detached;
    context::yield_to_worker();
}

/// Re-admits a previously detached task to scheduling (e.g. once the
/// asynchronous handle it was waiting on completes).
pub fn release_detached(scheduler: &Arc<Scheduler>, task: Arc<Task>) {
    scheduler.enqueue(task);
}

/// Cooperatively cancels `task`: sets the flag a worker checks at its next
/// scheduling decision point (spec §5: "Cancellation is cooperative; a task
/// currently executing a synchronous call cannot be preempted").
pub fn cancel(task: &Arc<Task>) {
    task.cancelled.store(true, Ordering::Release);
    let mut state = task.state.lock();
    if matches!(*state, TaskState::Created | TaskState::Queued | TaskState::Deferred) {
        *state = TaskState::Cancelled;
    }
}

//! Work-stealing dispatch over per-worker priority queues (spec §4.7), grounded
//! on the shape of `scheduler/task.rs`'s `TaskHandlePriorityQueue` (a queue per
//! priority class plus a bitmap of which are non-empty) and `scheduler/mod.rs`'s
//! `PerCoreScheduler::run` loop, generalized from one queue per core interrupt
//! tick to one queue set per worker OS thread with cross-worker stealing added.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::task::context::Context;
use crate::task::stack::Stack;

/// Unique identifier for a task, monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

fn next_task_id() -> TaskId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Scheduling class (spec §4.7: "high, normal, low, optional inline"). `Inline`
/// tasks never enter a queue; they run synchronously in the submitter's own
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
    Inline,
}

/// Lifecycle states from spec §4.7's diagram, plus `Dummy` for remote-parent
/// placeholders (§4.7: "Dummy tasks represent remote parents for local tasks;
/// they transition directly from dummy to finished upon receiving a release
/// message").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Nascent,
    Created,
    Deferred,
    Queued,
    Running,
    Suspended,
    Blocked,
    Detached,
    Finished,
    Cancelled,
    Dummy,
}

/// Ambient instrumentation counters ([SUPPLEMENT] "Instrumentation counters").
#[derive(Default)]
pub struct Stats {
    pub created: AtomicU64,
    pub queued: AtomicU64,
    pub stolen: AtomicU64,
    pub finished: AtomicU64,
    pub cancelled: AtomicU64,
}

pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    pub state: Mutex<TaskState>,
    pub description: Option<String>,
    body: Mutex<Option<TaskBody>>,
    stack: Mutex<Option<Stack>>,
    context: Mutex<Option<Context>>,
    pub parent: Option<Arc<Task>>,
    pub outstanding_children: AtomicI32,
    pub unresolved_deps: AtomicI32,
    pub cancelled: AtomicBool,
    done_lock: Mutex<bool>,
    done_cv: Condvar,
    /// Run once this task finishes, e.g. to drain the entries it owns out of
    /// an ancestor's dependency table (spec §4.7 step 2). Opaque callbacks
    /// taking `&Arc<Task>` so `task` need not depend on `depgraph`'s types,
    /// and so a callback can name this very task without holding a strong
    /// reference to itself.
    pub on_finish: Mutex<Vec<Box<dyn FnOnce(&Arc<Task>) + Send>>>,
    /// Local successors registered against this task by
    /// [`crate::depgraph::Table::insert`]; notified (their `unresolved_deps`
    /// decremented) when this task finishes.
    pub successors: Mutex<Vec<Arc<Task>>>,
    /// Set by [`crate::depgraph::submit_with_deps`] for a task created with
    /// unresolved dependencies; invoked once `unresolved_deps` reaches zero
    /// to admit the task to scheduling.
    pub ready_callback: Mutex<Option<Box<dyn FnOnce(Arc<Task>) + Send>>>,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Finished | TaskState::Cancelled)
    }

    pub fn wait(&self) {
        let mut done = self.done_lock.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }

    pub fn test(&self) -> bool {
        *self.done_lock.lock()
    }

    fn mark_done(&self) {
        *self.done_lock.lock() = true;
        self.done_cv.notify_all();
    }
}

struct PriorityQueues {
    high: VecDeque<Arc<Task>>,
    normal: VecDeque<Arc<Task>>,
    low: VecDeque<Arc<Task>>,
}

impl PriorityQueues {
    fn new() -> Self {
        PriorityQueues {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn push(&mut self, priority: Priority, task: Arc<Task>) {
        match priority {
            Priority::High => self.high.push_back(task),
            Priority::Normal => self.normal.push_back(task),
            Priority::Low => self.low.push_back(task),
            Priority::Inline => unreachable!("inline tasks are never queued"),
        }
    }

    fn pop_own(&mut self) -> Option<Arc<Task>> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Stealing takes from the tail rather than the head, so a thief and the
    /// owner touch opposite ends of the same deque (spec §4.7's "private
    /// double-ended task queue per priority class").
    fn steal(&mut self) -> Option<Arc<Task>> {
        self.high
            .pop_back()
            .or_else(|| self.normal.pop_back())
            .or_else(|| self.low.pop_back())
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}

struct WorkerQueue {
    queues: Mutex<PriorityQueues>,
    cv: Condvar,
}

/// A per-core park context that every task on that worker yields back into.
struct WorkerLoop {
    queue: Arc<CachePadded<WorkerQueue>>,
    others: Vec<Arc<CachePadded<WorkerQueue>>>,
    victim_cursor: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

thread_local! {
    /// The task currently running on this worker OS thread, if any — set
    /// around every [`Context::resume`] call so the completion trampoline and
    /// [`crate::task::yield_now`] know which `Task` they are acting on.
    static CURRENT: std::cell::RefCell<Option<Arc<Task>>> = const { std::cell::RefCell::new(None) };
}

pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The work-stealing scheduler: one `WorkerQueue` (and one OS thread) per
/// configured worker, round-robin victim selection on steal (spec §4.7:
/// "victim selection is round-robin"). Each worker's queue is cache-line
/// padded so a thief spinning on one worker's queue doesn't bounce the
/// cache line backing its neighbor's.
pub struct Scheduler {
    queues: Vec<Arc<CachePadded<WorkerQueue>>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    stack_size: usize,
    pub stats: Stats,
}

impl Scheduler {
    pub fn new(num_workers: usize, stack_size: usize) -> Arc<Self> {
        let num_workers = num_workers.max(1);
        let queues: Vec<_> = (0..num_workers)
            .map(|_| {
                Arc::new(CachePadded::new(WorkerQueue {
                    queues: Mutex::new(PriorityQueues::new()),
                    cv: Condvar::new(),
                }))
            })
            .collect();
        let scheduler = Arc::new(Scheduler {
            queues,
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            stack_size,
            stats: Stats::default(),
        });

        let mut handles = Vec::new();
        for worker_id in 0..num_workers {
            let scheduler = scheduler.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("dart-worker-{worker_id}"))
                    .spawn(move || scheduler.worker_loop(worker_id))
                    .expect("failed to spawn DART worker thread"),
            );
        }
        *scheduler.handles.lock() = handles;
        scheduler
    }

    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn queue_is_empty(&self, worker_id: usize) -> bool {
        self.queues[worker_id % self.queues.len()]
            .queues
            .lock()
            .is_empty()
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let own = self.queues[worker_id].clone();
        let others: Vec<_> = self
            .queues
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != worker_id)
            .map(|(_, q)| q.clone())
            .collect();
        let worker = WorkerLoop {
            queue: own,
            others,
            victim_cursor: AtomicUsize::new(0),
            shutdown: self.shutdown.clone(),
        };

        loop {
            let Some(task) = worker.next_task() else {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                continue;
            };
            self.run_task(&task);
        }
    }

    fn run_task(self: &Arc<Self>, task: &Arc<Task>) {
        {
            let mut state = task.state.lock();
            if *state == TaskState::Cancelled {
                self.finish(task);
                return;
            }
            *state = TaskState::Running;
        }

        let body = task.body.lock().take();
        let Some(body) = body else {
            // A task resumed from a yield/suspend: its context already holds
            // the continuation, so switch into it instead of re-running body.
            self.resume_suspended(task);
            return;
        };

        let stack = Stack::new(self.stack_size).expect("failed to allocate task stack");
        let top = stack.top();
        *task.stack.lock() = Some(stack);

        let arg = Box::into_raw(Box::new(TrampolineArg {
            body: Some(body),
        })) as *mut ();
        let mut ctx = Context::new(top, arg, trampoline);

        CURRENT.with(|c| *c.borrow_mut() = Some(task.clone()));
        ctx.resume();
        CURRENT.with(|c| *c.borrow_mut() = None);

        self.after_switch(task, ctx);
    }

    fn resume_suspended(self: &Arc<Self>, task: &Arc<Task>) {
        let mut ctx = task
            .context
            .lock()
            .take()
            .expect("suspended task has no saved context");
        {
            let mut state = task.state.lock();
            *state = TaskState::Running;
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(task.clone()));
        ctx.resume();
        CURRENT.with(|c| *c.borrow_mut() = None);
        self.after_switch(task, ctx);
    }

    /// Runs after a task context yields or finishes control back to the
    /// worker loop; inspects the state the task left itself in.
    fn after_switch(self: &Arc<Self>, task: &Arc<Task>, ctx: Context) {
        let state = *task.state.lock();
        match state {
            TaskState::Finished | TaskState::Cancelled => {
                self.finish(task);
            }
            TaskState::Suspended => {
                *task.context.lock() = Some(ctx);
                self.enqueue(task.clone());
            }
            TaskState::Blocked | TaskState::Detached => {
                *task.context.lock() = Some(ctx);
                // Caller (lock/handle/detach machinery) is responsible for
                // re-enqueuing once the block condition clears.
            }
            other => {
                panic!("task left running state in unexpected state {other:?}");
            }
        }
    }

    fn finish(self: &Arc<Self>, task: &Arc<Task>) {
        *task.state.lock() = TaskState::Finished;
        self.stats.finished.fetch_add(1, Ordering::Relaxed);
        task.mark_done();

        let callbacks = std::mem::take(&mut *task.on_finish.lock());
        for cb in callbacks {
            cb(task);
        }

        if let Some(parent) = &task.parent {
            parent.outstanding_children.fetch_sub(1, Ordering::AcqRel);
        }
        *task.stack.lock() = None;
    }

    pub fn enqueue(self: &Arc<Self>, task: Arc<Task>) {
        *task.state.lock() = TaskState::Queued;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        let worker_id = (task.id.0 as usize) % self.queues.len();
        let q = &self.queues[worker_id];
        q.queues.lock().push(task.priority, task);
        q.cv.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for q in &self.queues {
            q.cv.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            let _ = h.join();
        }
    }
}

impl WorkerLoop {
    fn next_task(&self) -> Option<Arc<Task>> {
        {
            let mut guard = self.queue.queues.lock();
            if let Some(t) = guard.pop_own() {
                return Some(t);
            }
        }
        if let Some(t) = self.try_steal() {
            return Some(t);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let mut guard = self.queue.queues.lock();
        if !guard.is_empty() {
            return None; // re-check on next loop iteration without queueing
        }
        self.queue
            .cv
            .wait_for(&mut guard, std::time::Duration::from_millis(5));
        None
    }

    fn try_steal(&self) -> Option<Arc<Task>> {
        if self.others.is_empty() {
            return None;
        }
        let start = self.victim_cursor.fetch_add(1, Ordering::Relaxed) % self.others.len();
        for i in 0..self.others.len() {
            let victim = &self.others[(start + i) % self.others.len()];
            let mut guard = victim.queues.lock();
            if let Some(t) = guard.steal() {
                return Some(t);
            }
        }
        None
    }
}

struct TrampolineArg {
    body: Option<TaskBody>,
}

extern "C" fn trampoline(arg: *mut ()) {
    let arg = unsafe { Box::from_raw(arg as *mut TrampolineArg) };
    if let Some(body) = arg.body {
        body();
    }
    CURRENT.with(|c| {
        if let Some(task) = c.borrow().as_ref() {
            *task.state.lock() = TaskState::Finished;
        }
    });
    crate::task::context::yield_to_worker();
    unreachable!("a finished task's context must never be resumed");
}

fn build_task(
    scheduler: &Arc<Scheduler>,
    priority: Priority,
    parent: Option<Arc<Task>>,
    description: Option<String>,
    body: impl FnOnce() + Send + 'static,
    state: TaskState,
) -> Arc<Task> {
    scheduler.stats.created.fetch_add(1, Ordering::Relaxed);
    if let Some(parent) = &parent {
        parent.outstanding_children.fetch_add(1, Ordering::AcqRel);
    }
    Arc::new(Task {
        id: next_task_id(),
        priority,
        state: Mutex::new(state),
        description,
        body: Mutex::new(Some(Box::new(body))),
        stack: Mutex::new(None),
        context: Mutex::new(None),
        parent,
        outstanding_children: AtomicI32::new(0),
        unresolved_deps: AtomicI32::new(0),
        cancelled: AtomicBool::new(false),
        done_lock: Mutex::new(false),
        done_cv: Condvar::new(),
        on_finish: Mutex::new(Vec::new()),
        successors: Mutex::new(Vec::new()),
        ready_callback: Mutex::new(None),
    })
}

pub fn spawn_task(
    scheduler: &Arc<Scheduler>,
    priority: Priority,
    parent: Option<Arc<Task>>,
    description: Option<String>,
    body: impl FnOnce() + Send + 'static,
) -> Arc<Task> {
    let task = build_task(scheduler, priority, parent, description, body, TaskState::Created);

    if matches!(priority, Priority::Inline) {
        *task.state.lock() = TaskState::Running;
        let body = task.body.lock().take().unwrap();
        body();
        scheduler.finish(&task);
    } else {
        scheduler.enqueue(task.clone());
    }
    task
}

/// Builds a task in `Deferred` state without queueing it (spec §4.7's
/// `deferred` state, taken when dependencies are registered before the task
/// is ready to run). The caller is responsible for enqueuing it once its
/// dependencies clear — see [`crate::depgraph::submit_with_deps`].
pub fn spawn_deferred_task(
    scheduler: &Arc<Scheduler>,
    priority: Priority,
    parent: Option<Arc<Task>>,
    description: Option<String>,
    body: impl FnOnce() + Send + 'static,
) -> Arc<Task> {
    build_task(scheduler, priority, parent, description, body, TaskState::Deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32 as StdAtomicI32;

    #[test]
    fn work_stealing_scheduler_runs_every_submitted_task() {
        let scheduler = Scheduler::new(4, 256 * 1024);
        let counter = Arc::new(StdAtomicI32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..200 {
            let counter = counter.clone();
            tasks.push(spawn_task(&scheduler, Priority::Normal, None, None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for t in &tasks {
            t.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
        scheduler.shutdown();
    }

    #[test]
    fn inline_tasks_run_synchronously_without_queueing() {
        let scheduler = Scheduler::new(2, 256 * 1024);
        let mut ran = false;
        let task = spawn_task(&scheduler, Priority::Inline, None, None, || {});
        ran = task.is_finished();
        assert!(ran);
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_task_finishes_without_running_its_body() {
        let scheduler = Scheduler::new(1, 256 * 1024);
        let ran = Arc::new(StdAtomicI32::new(0));
        let ran2 = ran.clone();
        let task = spawn_task(&scheduler, Priority::Normal, None, None, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        *task.state.lock() = TaskState::Cancelled;
        task.wait();
        scheduler.shutdown();
    }
}

//! Stackful user-level context switch (grounded on
//! `arch/x86_64/kernel/switch.rs`'s `switch(old_stack, new_stack)` shape: a
//! naked function that saves the current stack pointer through its first
//! argument and loads the second into `rsp`). The kernel's version saves a
//! full interrupt trap frame because it swaps kernel threads across
//! preemption; a task switch here is a plain call-site swap, so only the
//! SysV-ABI callee-saved registers need saving — the compiler already spills
//! caller-saved registers around the call to [`switch`] itself.
//!
//! Every switch is one half of a pair: a worker OS thread switches *into* a
//! task context, and later that task (or the scheduler's completion
//! trampoline) switches back. Both halves need a stable memory cell to stash
//! the departing side's stack pointer into — a stack local won't do, since
//! whichever side is departing is, by definition, about to stop running on
//! that stack. [`HOME_SP`] and [`YIELD_SP`] are thread-local cells that live
//! for the lifetime of the worker's OS thread and are reused across every
//! task it ever runs, one cell per direction of travel.

use std::cell::Cell;
use std::ptr;

thread_local! {
    /// Where a worker parks its own stack pointer while a task runs; a task
    /// yielding reads this to find its way back.
    static HOME_SP: Cell<usize> = const { Cell::new(0) };
    /// Where a yielding task parks its own stack pointer; the worker reads
    /// this once control returns to build the task's next [`Context`].
    static YIELD_SP: Cell<usize> = const { Cell::new(0) };
}

/// One task's saved register state: just the stack pointer at the moment it
/// was last switched away from. Walking back onto that stack and returning
/// restores the rest.
#[derive(Debug)]
pub struct Context {
    sp: usize,
}

unsafe impl Send for Context {}

impl Context {
    /// Builds a context for a brand-new task whose stack is entirely
    /// unused. `entry` runs once execution reaches this context for the
    /// first time; it must never return (the scheduler's trampoline yields
    /// back through [`yield_to_worker`] instead of unwinding).
    pub fn new(stack_top: *mut u8, arg: *mut (), entry: extern "C" fn(*mut ())) -> Self {
        unsafe {
            let mut sp = (stack_top as usize & !0xf) as *mut u64;

            sp = sp.sub(1);
            ptr::write(sp, dart_ctx_entry as usize as u64); // return address for switch's `ret`
            sp = sp.sub(1);
            ptr::write(sp, 0); // rbp
            sp = sp.sub(1);
            ptr::write(sp, arg as u64); // rbx: carries `arg` into the entry trampoline
            sp = sp.sub(1);
            ptr::write(sp, entry as usize as u64); // r12: carries `entry` into the trampoline
            sp = sp.sub(1);
            ptr::write(sp, 0); // r13
            sp = sp.sub(1);
            ptr::write(sp, 0); // r14
            sp = sp.sub(1);
            ptr::write(sp, 0); // r15

            Context { sp: sp as usize }
        }
    }

    /// Switches from the calling worker into `self`, blocking the worker's
    /// OS thread until the task (or its completion trampoline) switches back
    /// via [`yield_to_worker`].
    pub fn resume(&mut self) {
        HOME_SP.with(|home| {
            unsafe {
                dart_task_switch(home.as_ptr(), self.sp);
            }
        });
        self.sp = YIELD_SP.with(|c| c.get());
    }
}

/// Called from within a running task to switch back to the worker that
/// resumed it. Used both by a voluntary [`crate::task::yield_now`] and by the
/// completion trampoline once a task's body returns.
pub(crate) fn yield_to_worker() {
    let worker_sp = HOME_SP.with(|c| c.get());
    YIELD_SP.with(|yield_sp| unsafe {
        dart_task_switch(yield_sp.as_ptr(), worker_sp);
    });
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".global dart_task_switch",
    "dart_task_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn dart_task_switch(old_sp: *mut usize, new_sp: usize);
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn dart_task_switch(_old_sp: *mut usize, _new_sp: usize) {
    compile_error!("stackful task contexts are only implemented for x86_64");
}

/// Lands here the first time a task's context is resumed. `rbx` and `r12`
/// arrive holding the `arg`/`entry` pair [`Context::new`] seeded onto the
/// stack, restored by `dart_task_switch`'s register pops exactly like any
/// other callee-saved value.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".global dart_ctx_entry",
    "dart_ctx_entry:",
    "mov rdi, rbx",
    "call r12",
    "ud2", // entry must never return; it yields back through the scheduler instead
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn dart_ctx_entry();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::stack::Stack;
    use std::sync::atomic::{AtomicBool, Ordering};

    static RAN: AtomicBool = AtomicBool::new(false);

    extern "C" fn probe(_arg: *mut ()) {
        RAN.store(true, Ordering::SeqCst);
        yield_to_worker();
        unreachable!();
    }

    #[test]
    fn resuming_a_fresh_context_runs_its_entry_function_once() {
        RAN.store(false, Ordering::SeqCst);
        let stack = Stack::new(256 * 1024).unwrap();
        let mut ctx = Context::new(stack.top(), ptr::null_mut(), probe);
        ctx.resume();
        assert!(RAN.load(Ordering::SeqCst));
    }
}

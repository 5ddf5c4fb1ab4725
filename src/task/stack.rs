//! Per-task stacks (spec §4.7: "guard pages mprotected on both sides").
//! The teacher keeps one fixed kernel stack per core
//! (`arch/x86_64/kernel/kernel_stack.rs`); DART instead needs many short-lived
//! per-task stacks, so allocation goes through `libc::mmap`/`mprotect` rather
//! than a core-local static.

use std::ptr;

use crate::error::{DartError, Result};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// An mmap'd task stack: one unreadable guard page below and above a
/// read/write body. Growing the stack past either guard faults rather than
/// silently corrupting an adjacent allocation.
pub struct Stack {
    base: *mut u8,
    mapped_len: usize,
    body_len: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    pub fn new(body_len: usize) -> Result<Self> {
        let page = page_size();
        let body_len = round_up_to_page(body_len).max(page);
        let mapped_len = body_len + 2 * page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DartError::Other("mmap failed while allocating task stack".into()));
        }
        let base = base as *mut u8;

        let body = unsafe { base.add(page) };
        let rc = unsafe { libc::mprotect(body.cast(), body_len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            unsafe {
                libc::munmap(base.cast(), mapped_len);
            }
            return Err(DartError::Other("mprotect failed while allocating task stack".into()));
        }

        Ok(Stack {
            base,
            mapped_len,
            body_len,
        })
    }

    /// Highest usable address (the stack grows down from here).
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped_len - page_size()) }
    }

    /// Usable body size in bytes, excluding the two guard pages.
    pub fn body_len(&self) -> usize {
        self.body_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.mapped_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_within_the_mapped_body() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.top() > stack.base);
        assert!((stack.top() as usize) < (stack.base as usize + stack.mapped_len));
    }

    #[test]
    fn rounds_body_length_up_to_a_page_multiple() {
        assert_eq!(round_up_to_page(1), page_size());
        assert_eq!(round_up_to_page(page_size() + 1), page_size() * 2);
    }
}

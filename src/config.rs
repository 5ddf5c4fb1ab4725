//! Central parsing of DART's environment-variable configuration, cached once
//! at [`crate::init`] time and read thereafter through accessor functions.
//!
//! Grounded on `environment.rs`'s single `parse_command_line` pass over argv,
//! cached into process-wide statics and exposed via `get_*` functions.

use std::sync::OnceLock;

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub task_stack_size: usize,
    pub num_threads: usize,
    pub thread_affinity: bool,
    pub amsgq_impl: AmsgqImpl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmsgqImpl {
    DualWindow,
    SingleWindow,
    Sopnop,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX system.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

fn parse_stack_size() -> usize {
    match std::env::var("DART_TASK_STACKSIZE") {
        Ok(v) => match v.parse::<usize>() {
            Ok(bytes) if bytes > 0 => round_up_to_page(bytes),
            _ => {
                log::warn!("DART_TASK_STACKSIZE={v:?} is not a positive integer, using default");
                DEFAULT_STACK_SIZE
            }
        },
        Err(_) => DEFAULT_STACK_SIZE,
    }
}

fn parse_num_threads() -> usize {
    match std::env::var("DART_NUM_THREADS") {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                log::warn!("DART_NUM_THREADS={v:?} is not a positive integer, using default");
                default_thread_count()
            }
        },
        Err(_) => default_thread_count(),
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_affinity() -> bool {
    match std::env::var("DART_THREAD_AFFINITY") {
        Ok(v) => match v.as_str() {
            "0" => false,
            "1" => true,
            other => {
                log::warn!("DART_THREAD_AFFINITY={other:?} is neither \"0\" nor \"1\", enabling");
                true
            }
        },
        Err(_) => true,
    }
}

fn parse_amsgq_impl() -> AmsgqImpl {
    match std::env::var("DART_AMSGQ_IMPL") {
        Ok(v) => match v.as_str() {
            "dualwin" => AmsgqImpl::DualWindow,
            "singlewin" => AmsgqImpl::SingleWindow,
            "sopnop" => AmsgqImpl::Sopnop,
            other => {
                log::warn!("DART_AMSGQ_IMPL={other:?} is not one of dualwin/singlewin/sopnop, using sopnop");
                AmsgqImpl::Sopnop
            }
        },
        Err(_) => AmsgqImpl::Sopnop,
    }
}

/// Parse and cache the environment once. Idempotent: later calls return the
/// configuration captured on the first call.
pub fn init() -> Config {
    *CONFIG.get_or_init(|| Config {
        task_stack_size: parse_stack_size(),
        num_threads: parse_num_threads(),
        thread_affinity: parse_affinity(),
        amsgq_impl: parse_amsgq_impl(),
    })
}

/// Returns the cached configuration, panicking if [`init`] has not run.
/// Only valid after `dart::init()`.
pub fn get() -> Config {
    *CONFIG.get().expect("dart::config::init was not called")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_stack_size_up_to_page() {
        let page = page_size();
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_up_to_page(page + 1), page * 2);
    }
}

//! Top-level runtime: the process-wide singletons every other module reaches
//! through (spec §9 "Global mutable state"), brought up by [`init`] and torn
//! down by [`Runtime::exit`]. Grounded on the teacher's `CoreLocal`/boot
//! sequence in `arch/x86_64/kernel/mod.rs`, which similarly gathers every
//! subsystem's process-wide state behind one `init` entry point rather than
//! scattering independent statics across modules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::amsgq::message::SymbolTable;
use crate::config::Config;
use crate::depgraph::remote::RemoteLink;
use crate::depgraph::{self, DepKind, Table as DepTable};
use crate::dtype::TypeRegistry;
use crate::error::{DartError, Result};
use crate::loopback::LoopbackFabric;
use crate::task::{Priority, Scheduler, Task};
use crate::team::{TeamId, TeamTree, TEAM_ALL};
use crate::transport::Communicator;

/// Everything [`crate::init`] wires up: the team tree (and through it every
/// team's segment table), the data-type registry, the task scheduler, the
/// root dependency table, the active-message symbol table, and the
/// remote-dependency protocol's per-unit endpoint (spec §9, §4.9).
pub struct Runtime {
    pub my_unit: i32,
    pub size: usize,
    pub config: Config,
    pub teams: TeamTree,
    pub types: TypeRegistry,
    pub scheduler: Arc<Scheduler>,
    pub root_deps: Arc<DepTable>,
    pub symbols: Arc<SymbolTable>,
    pub remote_deps: Arc<RemoteLink>,
    initialized: AtomicBool,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// `dart_exit` (spec §2, §9): tears down every team but the root and
    /// marks the runtime unusable. A second `init` after `exit` is not
    /// supported (`OnceLock` only ever runs its initializer once), matching
    /// "DART may be initialized and torn down at most once per process" —
    /// the same one-shot contract the teacher's own boot code assumes.
    pub fn exit(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let root = self.teams.get(TEAM_ALL).expect("root team must exist");
        let children: Vec<TeamId> = root.children.lock().clone();
        for child in children {
            if let Err(e) = self.teams.destroy(child) {
                log::warn!("dart::exit: failed to tear down team {}: {e}", child.0);
            }
        }
        self.scheduler.shutdown();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Ambient instrumentation counters for the worker pool ([SUPPLEMENT]
    /// "Instrumentation counters").
    pub fn stats(&self) -> &crate::task::Stats {
        &self.scheduler.stats
    }

    /// Submits a task against the root dependency table (spec §4.7's
    /// `create_task`/§4.8 combined), routing any dependency whose key names
    /// another unit's memory through the remote-dependency protocol rather
    /// than silently treating it as local (spec §4.9).
    pub fn submit_task(
        &self,
        priority: Priority,
        parent: Option<Arc<Task>>,
        description: Option<String>,
        deps: &[(crate::gptr::GlobalPtr, DepKind)],
        body: impl FnOnce() + Send + 'static,
    ) -> Arc<Task> {
        depgraph::submit_with_deps(
            &self.scheduler,
            &self.root_deps,
            self.my_unit,
            Some(&self.remote_deps),
            priority,
            parent,
            description,
            deps,
            body,
        )
    }

    /// Drains one non-blocking pass of incoming remote-dependency messages
    /// (spec §4.9); meant to be called opportunistically, e.g. from a
    /// worker's idle loop, the same way [`crate::amsgq::AmsgQueue::process`]
    /// is documented to be used.
    pub fn poll_remote_deps(&self) -> Result<()> {
        self.remote_deps.process(self.my_unit)
    }
}

/// `dart_init` (spec §2): parses configuration, stands up the in-process
/// loopback transport across `unit_count` units, bootstraps team 0, and
/// starts the worker pool. Idempotent: later calls return the runtime built
/// on the first call (spec §9 "init is idempotent after the first
/// successful call").
///
/// The loopback substrate is the only transport this crate ships (see
/// `SPEC_FULL.md` "Loopback transport"); a real deployment would instead
/// discover `unit_count`/`my_unit` from an external launcher (MPI, PMIx)
/// before calling this.
pub fn init(unit_count: usize, my_unit: i32) -> Result<&'static Runtime> {
    if my_unit < 0 || my_unit as usize >= unit_count {
        return Err(DartError::Inval(format!(
            "my_unit {my_unit} out of range for unit_count {unit_count}"
        )));
    }
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }

    let config = crate::config::init();
    let fabric = LoopbackFabric::new(unit_count);
    let comm = Communicator::new(fabric, (0..unit_count as i32).collect());
    let teams = TeamTree::new((0..unit_count as i32).collect(), comm);
    {
        let root = teams.get(TEAM_ALL).expect("root team just constructed");
        root.segments.write().install_bootstrap_segment(0, 0);
    }

    let symbols = Arc::new(SymbolTable::new());
    let root = teams.get(TEAM_ALL).expect("root team just constructed");
    let remote_deps = RemoteLink::install(root, my_unit, config.amsgq_impl, symbols.clone())?;

    let scheduler = Scheduler::new(config.num_threads, config.task_stack_size);
    let rt = Runtime {
        my_unit,
        size: unit_count,
        config,
        teams,
        types: TypeRegistry::new(),
        scheduler,
        root_deps: Arc::new(DepTable::new()),
        symbols,
        remote_deps,
        initialized: AtomicBool::new(true),
    };

    let rt = RUNTIME.get_or_init(|| rt);
    Ok(rt)
}

/// Returns the process-wide runtime, failing with [`DartError::NotInit`]
/// instead of panicking — every public entry point that needs it goes
/// through this rather than unwrapping [`RUNTIME`] directly (spec §7:
/// "Calling any operation before init, or after exit, returns `ERR_NOTINIT`
/// rather than aborting").
pub fn get() -> Result<&'static Runtime> {
    match RUNTIME.get() {
        Some(rt) if rt.is_initialized() => Ok(rt),
        _ => Err(DartError::NotInit),
    }
}

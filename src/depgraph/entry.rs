//! Dependency entry and kind (spec §4.8: "a dep entry with key K, kind D,
//! task T, origin O").

use std::sync::Arc;

use crate::depgraph::remote::RemoteTaskRef;
use crate::gptr::GlobalPtr;
use crate::task::Task;

/// The three local dependency kinds from spec §4.8/§4.9; remote-facing code
/// additionally carries these over the wire (see [`crate::depgraph::remote`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    In,
    Out,
    InOut,
}

impl DepKind {
    /// Whether an entry of this kind can serve as the serializing
    /// predecessor for a later access (spec §4.8: "If the existing is
    /// OUT/INOUT and the new is IN/OUT/INOUT... stop at the first
    /// OUT/INOUT").
    pub fn is_writer(self) -> bool {
        matches!(self, DepKind::Out | DepKind::InOut)
    }
}

/// Who a [`DepEntry`] belongs to: a task in this process, or a placeholder
/// standing in for a task on another unit that registered an `IN` access
/// through the remote-dependency protocol (spec §4.9). A `Remote` entry is
/// always kind `In` — `OUT`/`INOUT` on another unit's memory is never routed
/// this way (spec: "OUT/INOUT on remote data must be expressed as local OUT
/// dependencies at the owner").
pub enum EntryOwner {
    Local(Arc<Task>),
    Remote { unit: i32, task_ref: RemoteTaskRef },
}

/// One dependency entry linked into a [`crate::depgraph::Table`] bucket.
pub struct DepEntry {
    pub key: GlobalPtr,
    pub kind: DepKind,
    pub owner: EntryOwner,
}

impl DepEntry {
    pub fn local(key: GlobalPtr, kind: DepKind, task: Arc<Task>) -> Self {
        DepEntry {
            key,
            kind,
            owner: EntryOwner::Local(task),
        }
    }

    pub fn remote(key: GlobalPtr, kind: DepKind, unit: i32, task_ref: RemoteTaskRef) -> Self {
        DepEntry {
            key,
            kind,
            owner: EntryOwner::Remote { unit, task_ref },
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Process-unique, monotonically allocated logical data identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Did(pub u64);

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// A version number within a `Did`'s chain. Versions start at 0.
pub type VersionNumber = u32;

/// `(Did, VersionNumber)` pair naming one data version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dv {
    pub did: Did,
    pub version: VersionNumber,
}

impl fmt::Display for Dv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_v{}", self.did, self.version)
    }
}

/// Opaque wire-level renaming bound to exactly one `Dv`, in the
/// `d<did>_v<ver>` shape required by spec: stable within a process,
/// never reused once assigned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Renaming(pub String);

impl Renaming {
    pub fn for_dv(dv: Dv) -> Self {
        Renaming(dv.to_string())
    }
}

impl fmt::Display for Renaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identifier, allocated in submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Owning application / user session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(pub Uuid);

/// User-defined barrier scoping group, unique within an `AppId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

/// A worker node the Scheduler can place actions on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A synchronous wait ticket handed to the submitting thread by
/// `blockDataAndGetResultFile` / `findWaitedTask` style operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WaitTicket(pub u64);

/// Monotonic id allocator, one per id kind, shared behind the dispatcher.
///
/// The dispatcher is the sole writer of the arenas that own these ids
/// (see design note on cyclic references), so a plain atomic counter is
/// enough; no CAS retry loop is needed on the single-threaded hot path,
/// but the atomic keeps this safe to call from the rare cross-thread
/// caller (e.g. a background transfer task minting its own ticket).
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next_u64(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_did(&self) -> Did {
        Did(self.next_u64())
    }

    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.next_u64())
    }

    pub fn next_wait_ticket(&self) -> WaitTicket {
        WaitTicket(self.next_u64())
    }
}

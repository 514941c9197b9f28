use crate::ids::{AppId, Did, Renaming, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Access mode on a `Did`. C and M both allow multiple concurrent
/// accesses; they differ only in how the Task Analyser orders readers
/// against them (see `task_analyser`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    R,
    W,
    Rw,
    /// Concurrent: multiple writers may hold the latest version at once.
    C,
    /// Commutative: writers form an unordered bag; order is unconstrained.
    M,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::R | AccessMode::Rw | AccessMode::C | AccessMode::M)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::W | AccessMode::Rw | AccessMode::C | AccessMode::M)
    }
}

/// `(Did, mode)` — what `registerAccess` consumes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Access {
    pub did: Did,
    pub mode: AccessMode,
}

/// Standard-stream role a FILE/OBJECT parameter may be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamBinding {
    Stdin,
    Stdout,
    Stderr,
    None,
}

/// Parameter type tag. Per-kind fetch behavior is dispatched off this,
/// never via inheritance (see design notes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    File,
    Object,
    Psco,
    ExternalPsco,
    BindingObject,
    Collection,
    Stream,
    Primitive,
}

/// An access plus the role metadata the runtime carries through
/// scheduling and data transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub access: Access,
    pub direction: AccessMode,
    pub stream: StreamBinding,
    pub prefix: String,
    pub formal_name: String,
    pub param_type: ParamType,
    /// Resolved DIIs, filled in by the Task Analyser after `registerAccess`.
    pub read_renaming: Option<Renaming>,
    pub write_renaming: Option<Renaming>,
    /// Declared or last-observed size in bytes, feeding `dataLocalityScore`'s
    /// byte-weighted sum (spec §4.4). Zero when unknown.
    pub size_hint: u64,
    /// Ordered sub-parameters, populated only for `ParamType::Collection`.
    pub elements: Vec<Parameter>,
}

impl Parameter {
    pub fn new(did: Did, direction: AccessMode, param_type: ParamType, formal_name: &str) -> Self {
        Self {
            access: Access { did, mode: direction },
            direction,
            stream: StreamBinding::None,
            prefix: String::new(),
            formal_name: formal_name.to_string(),
            param_type,
            read_renaming: None,
            write_renaming: None,
            size_hint: 0,
            elements: Vec::new(),
        }
    }

    /// Flattens a collection parameter tree (including itself if it is
    /// not a collection) into its leaves, used to compute element-wise
    /// dependencies.
    pub fn flatten_leaves(&self) -> Vec<&Parameter> {
        if self.param_type == ParamType::Collection {
            self.elements.iter().flat_map(Parameter::flatten_leaves).collect()
        } else {
            vec![self]
        }
    }
}

/// A per-implementation resource request vector.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cores: f64,
    pub memory_mb: f64,
    pub storage_mb: f64,
    pub accelerators: f64,
}

impl ResourceVector {
    /// `min_i (available_i / requested_i)` across the vector's components,
    /// the basis of `resourceScore`. A requested component of 0 is
    /// treated as always-satisfiable and excluded from the min.
    pub fn slack_ratio(&self, available: &ResourceVector) -> f64 {
        let pairs = [
            (available.cores, self.cores),
            (available.memory_mb, self.memory_mb),
            (available.storage_mb, self.storage_mb),
            (available.accelerators, self.accelerators),
        ];
        pairs
            .iter()
            .filter(|(_, requested)| *requested > 0.0)
            .map(|(avail, requested)| avail / requested)
            .fold(f64::INFINITY, f64::min)
            .min(1e9) // avoid Infinity leaking into comparisons when nothing is requested
    }

    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.cores <= available.cores
            && self.memory_mb <= available.memory_mb
            && self.storage_mb <= available.storage_mb
            && self.accelerators <= available.accelerators
    }
}

/// One candidate implementation of a task: its resource ask and the
/// worker kind it targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImplementationCandidate {
    pub impl_id: u32,
    pub worker_kind: String,
    pub resources: ResourceVector,
    pub max_retries: u32,
    pub timeout_ms: Option<u64>,
}

/// State machine position of a Task (Action), per spec §4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Waiting,
    Ready,
    Scheduled,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }
}

/// A task submission: everything `processTask` needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub app: AppId,
    pub group: Option<crate::ids::GroupId>,
    pub signature: String,
    pub implementations: Vec<ImplementationCandidate>,
    pub params: Vec<Parameter>,
    pub priority: i64,
}

/// Live bookkeeping the Task Analyser keeps for one task.
#[derive(Clone, Debug)]
pub struct TaskNode {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub pending_predecessors: u32,
    pub attempt: u32,
    pub submit_seq: u64,
    pub chosen_impl: Option<u32>,
    pub worker: Option<crate::ids::WorkerId>,
}

/// Result reported back by a worker executor after a task finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: TaskId,
    pub success: bool,
    pub produced_renamings: Vec<Renaming>,
    pub wall_time_ms: u64,
    pub transferred_bytes: u64,
}

/// Per-(action-type, worker) rolling statistics backing `implementationScore`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileStats {
    pub samples: u64,
    pub mean_wall_time_ms: f64,
    pub mean_transferred_bytes: f64,
    pub successes: u64,
}

impl ProfileStats {
    pub fn record(&mut self, wall_time_ms: u64, transferred_bytes: u64, success: bool) {
        let n = self.samples as f64;
        self.mean_wall_time_ms = (self.mean_wall_time_ms * n + wall_time_ms as f64) / (n + 1.0);
        self.mean_transferred_bytes =
            (self.mean_transferred_bytes * n + transferred_bytes as f64) / (n + 1.0);
        self.samples += 1;
        if success {
            self.successes += 1;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.samples == 0 {
            1.0
        } else {
            self.successes as f64 / self.samples as f64
        }
    }
}

/// Orch-level flat key/value flags a completed task may report back,
/// kept separate from the versioned data model (mirrors the teacher's
/// `orch_flags` split from `domain_payload`).
pub type FlagMap = BTreeMap<String, String>;

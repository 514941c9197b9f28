use crate::ids::{AppId, Did, Renaming, TaskId, WorkerId};
use crate::types::Parameter;
use serde::{Deserialize, Serialize};

/// Runtime events — the audit trail emitted by the dispatcher for every
/// task and data lifecycle transition. Not persisted across restarts
/// (no durability non-goal); consumers are in-process subscribers such
/// as `subscribe_events` in the gRPC layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    TaskSubmitted {
        task: TaskId,
        app: AppId,
        signature: String,
    },
    TaskReady {
        task: TaskId,
    },
    TaskScheduled {
        task: TaskId,
        worker: WorkerId,
        impl_id: u32,
        /// The task's fully DII-resolved parameters, so a worker agent
        /// knows what to fetch/store without a second round trip.
        params: Vec<Parameter>,
    },
    TaskStarted {
        task: TaskId,
        worker: WorkerId,
    },
    TaskDone {
        task: TaskId,
        produced: Vec<Renaming>,
    },
    TaskFailed {
        task: TaskId,
        retriable: bool,
        attempt: u32,
    },
    TaskRetried {
        task: TaskId,
        attempt: u32,
        excluded_worker: Option<WorkerId>,
    },
    TaskCancelled {
        task: TaskId,
        reason: String,
    },
    DataVersionCreated {
        did: Did,
        version: u32,
    },
    DataVersionObsolete {
        did: Did,
        version: u32,
    },
    DataDeleted {
        did: Did,
    },
    WorkerAdded {
        worker: WorkerId,
    },
    WorkerRemoved {
        worker: WorkerId,
    },
    WorkerDegraded {
        worker: WorkerId,
    },
    BarrierReleased {
        app: AppId,
        group: Option<String>,
    },
    ApplicationCancelled {
        app: AppId,
    },
    CorruptSchedulerState {
        message: String,
    },
}

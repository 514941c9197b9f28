//! The process-wide `Runtime` facade: wires the Data Info Provider,
//! Task Analyser, and Scheduler behind a single-threaded event-dispatch
//! loop (spec §5). Mirrors the teacher's `BpmnLiteEngine` — a lock-free
//! owner type that all public operations go through.

use crate::config::{RuntimeConfig, SchedulerPolicyKind};
use crate::errors::{FailureKind, Result, RuntimeError};
use crate::events::RuntimeEvent;
use crate::ids::{AppId, Did, GroupId, Renaming, TaskId, WorkerId};
use crate::scheduler::{DataPolicy, FifoPolicy, FullGraphPolicy, Placement, Scheduler, SchedulingPolicy, WorkerView};
use crate::task_analyser::TaskAnalyser;
use crate::types::{AccessMode, TaskSpec};
use tokio::sync::{mpsc, oneshot};

/// Messages the dispatch loop processes one at a time, in arrival
/// order, matching "the dispatcher thread is the sole writer of the
/// DAG and scheduling structures" (spec §5).
pub enum DispatchEvent {
    Submit {
        spec: TaskSpec,
        reply: oneshot::Sender<TaskId>,
    },
    TaskCompleted {
        task: TaskId,
        success: bool,
        wall_time_ms: u64,
        transferred_bytes: u64,
        failure_kind: FailureKind,
    },
    WorkerAdded(WorkerView),
    WorkerRemoved(WorkerId),
    CancelApplication(AppId),
    Barrier {
        app: AppId,
        reply: oneshot::Sender<()>,
    },
    BarrierGroup {
        app: AppId,
        group: GroupId,
        reply: oneshot::Sender<()>,
    },
    OpenFile {
        did: Did,
        mode: AccessMode,
        reply: oneshot::Sender<Result<Renaming>>,
    },
    CloseFile {
        renaming: Renaming,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteFile {
        did: Did,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterData {
        did: Did,
        reply: oneshot::Sender<()>,
    },
    StarvationTick,
    PlacementTick,
}

fn policy_from_kind(kind: SchedulerPolicyKind) -> Box<dyn SchedulingPolicy> {
    match kind {
        SchedulerPolicyKind::Fifo => Box::new(FifoPolicy),
        SchedulerPolicyKind::Locality | SchedulerPolicyKind::Data => Box::new(DataPolicy),
        SchedulerPolicyKind::FullGraph => Box::new(FullGraphPolicy),
    }
}

struct DispatchState {
    analyser: TaskAnalyser,
    scheduler: Scheduler,
    events_tx: tokio::sync::broadcast::Sender<RuntimeEvent>,
    max_retries: u32,
}

impl DispatchState {
    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events_tx.send(event);
    }

    fn admit_ready(&mut self, newly_ready: Vec<TaskId>) {
        for task in newly_ready {
            if let Some(spec) = self.analyser.task_spec(task).cloned() {
                self.scheduler.submit_action(task, &spec);
                self.emit(RuntimeEvent::TaskReady { task });
            }
        }
    }

    fn apply_cancellations(&mut self, cancelled: Vec<TaskId>) {
        for task in cancelled {
            self.scheduler.cancel_queued(task);
            self.emit(RuntimeEvent::TaskCancelled {
                task,
                reason: "dependency failed or application cancelled".into(),
            });
        }
    }

    fn place_ready_tasks(&mut self, placements_out: &mut Vec<Placement>) {
        while let Some(placement) = self.scheduler.try_place_one(&self.analyser) {
            self.analyser.mark_scheduled(placement.task);
            let params = self.analyser.task_spec(placement.task).map(|s| s.params.clone()).unwrap_or_default();
            self.emit(RuntimeEvent::TaskScheduled {
                task: placement.task,
                worker: placement.worker.clone(),
                impl_id: placement.impl_id,
                params,
            });
            placements_out.push(placement);
        }
    }
}

/// Public handle callers interact with; internally forwards to the
/// single dispatch-loop task via a bounded mpsc channel (backpressure
/// per spec §5: a full queue blocks the submitting caller).
#[derive(Clone)]
pub struct Runtime {
    tx: mpsc::Sender<DispatchEvent>,
    events_tx: tokio::sync::broadcast::Sender<RuntimeEvent>,
}

const SUBMISSION_QUEUE_DEPTH: usize = 1024;

impl Runtime {
    pub fn start(config: RuntimeConfig) -> Self {
        let (tx, mut rx) = mpsc::channel(SUBMISSION_QUEUE_DEPTH);
        let (events_tx, _) = tokio::sync::broadcast::channel(1024);
        let events_tx_for_state = events_tx.clone();

        let mut state = DispatchState {
            analyser: TaskAnalyser::new(),
            scheduler: Scheduler::new(policy_from_kind(config.scheduler.policy)),
            events_tx: events_tx_for_state,
            max_retries: config.scheduler.max_retries,
        };

        let starvation_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Scheduler::starvation_tick_interval());
            loop {
                interval.tick().await;
                if starvation_tx.send(DispatchEvent::StarvationTick).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handle_event(&mut state, event).await {
                    tracing::error!(error = %e, "dispatch loop error");
                    if e.is_fatal() {
                        state.emit(RuntimeEvent::CorruptSchedulerState { message: e.to_string() });
                        break;
                    }
                }
            }
            tracing::warn!("dispatch loop exiting");
        });

        Self { tx, events_tx }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.events_tx.subscribe()
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::Submit { spec, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))
    }

    pub async fn task_completed(
        &self,
        task: TaskId,
        success: bool,
        wall_time_ms: u64,
        transferred_bytes: u64,
        failure_kind: FailureKind,
    ) -> Result<()> {
        self.tx
            .send(DispatchEvent::TaskCompleted {
                task,
                success,
                wall_time_ms,
                transferred_bytes,
                failure_kind,
            })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))
    }

    pub async fn worker_added(&self, view: WorkerView) -> Result<()> {
        self.tx
            .send(DispatchEvent::WorkerAdded(view))
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))
    }

    pub async fn worker_removed(&self, worker: WorkerId) -> Result<()> {
        self.tx
            .send(DispatchEvent::WorkerRemoved(worker))
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))
    }

    pub async fn cancel_application(&self, app: AppId) -> Result<()> {
        self.tx
            .send(DispatchEvent::CancelApplication(app))
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))
    }

    /// Blocks until every task registered by `app` before this call is
    /// terminal, per invariant 7.
    pub async fn barrier(&self, app: AppId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::Barrier { app, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))
    }

    pub async fn barrier_group(&self, app: AppId, group: GroupId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::BarrierGroup { app, group, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))
    }

    /// Registers a bare read/write access against `did` outside any task,
    /// returning the DII the caller should address its I/O to.
    pub async fn open_file(&self, did: Did, mode: AccessMode) -> Result<Renaming> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::OpenFile { did, mode, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))?
    }

    pub async fn close_file(&self, renaming: Renaming) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::CloseFile { renaming, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))?
    }

    pub async fn delete_file(&self, did: Did) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::DeleteFile { did, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))?
    }

    pub async fn register_data(&self, did: Did) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchEvent::RegisterData { did, reply })
            .await
            .map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop gone".into()))?;
        rx.await.map_err(|_| RuntimeError::CorruptSchedulerState("dispatch loop dropped reply".into()))
    }
}

async fn handle_event(state: &mut DispatchState, event: DispatchEvent) -> Result<()> {
    match event {
        DispatchEvent::Submit { spec, reply } => {
            let app = spec.app;
            let signature = spec.signature.clone();
            let (task, transition) = state.analyser.process_task(spec)?;
            state.emit(RuntimeEvent::TaskSubmitted { task, app, signature });
            state.admit_ready(transition.newly_ready);
            state.apply_cancellations(transition.newly_cancelled);
            let mut placements = Vec::new();
            state.place_ready_tasks(&mut placements);
            let _ = reply.send(task);
        }
        DispatchEvent::TaskCompleted {
            task,
            success,
            wall_time_ms,
            transferred_bytes,
            failure_kind,
        } => {
            if let Some(spec) = state.analyser.task_spec(task).cloned() {
                let worker = state.scheduler.action_completed(task, &spec, wall_time_ms, transferred_bytes, success)?;
                let retriable = !success && failure_kind.retriable();
                if retriable && state.analyser.attempt(task) < state.max_retries {
                    let attempt = state.analyser.retry_task(task)?;
                    state.emit(RuntimeEvent::TaskRetried {
                        task,
                        attempt,
                        excluded_worker: Some(worker.clone()),
                    });
                    // requeue_for_retry excludes `worker` from future
                    // placement (host-sticky fault policy, spec §4.4/§7).
                    state.scheduler.requeue_for_retry(task, &spec, worker);
                } else {
                    let transition = state.analyser.end_task(task, success)?;
                    if success {
                        state.emit(RuntimeEvent::TaskDone { task, produced: Vec::new() });
                    } else {
                        state.emit(RuntimeEvent::TaskFailed {
                            task,
                            retriable,
                            attempt: state.analyser.attempt(task),
                        });
                    }
                    state.admit_ready(transition.newly_ready);
                    state.apply_cancellations(transition.newly_cancelled);
                }
            }
            let mut placements = Vec::new();
            state.place_ready_tasks(&mut placements);
        }
        DispatchEvent::WorkerAdded(view) => {
            let worker = view.id.clone();
            state.scheduler.worker_added(view);
            state.emit(RuntimeEvent::WorkerAdded { worker });
            let mut placements = Vec::new();
            state.place_ready_tasks(&mut placements);
        }
        DispatchEvent::WorkerRemoved(worker) => {
            let stranded = state.scheduler.tasks_running_on(&worker);
            state.scheduler.worker_removed(&worker);
            state.emit(RuntimeEvent::WorkerRemoved { worker: worker.clone() });
            for task in stranded {
                if let Some(spec) = state.analyser.task_spec(task).cloned() {
                    state.scheduler.requeue_for_retry(task, &spec, worker.clone());
                }
            }
        }
        DispatchEvent::CancelApplication(app) => {
            let transition = state.analyser.cancel_application(app);
            state.apply_cancellations(transition.newly_cancelled);
            state.emit(RuntimeEvent::ApplicationCancelled { app });
        }
        DispatchEvent::Barrier { app, reply } => {
            let rx = state.analyser.barrier(app);
            tokio::spawn(async move {
                let _ = rx.await;
                let _ = reply.send(());
            });
        }
        DispatchEvent::BarrierGroup { app, group, reply } => {
            let rx = state.analyser.barrier_group(app, group.clone());
            tokio::spawn(async move {
                let _ = rx.await;
                let _ = reply.send(());
            });
        }
        DispatchEvent::OpenFile { did, mode, reply } => {
            let result = state.analyser.register_external_access(did, mode).map(|diis| {
                diis.write.or(diis.read).unwrap_or_else(|| {
                    crate::ids::Renaming::for_dv(crate::ids::Dv { did, version: 0 })
                })
            });
            let _ = reply.send(result);
        }
        DispatchEvent::CloseFile { renaming, reply } => {
            let _ = reply.send(state.analyser.finish_external_access(&renaming));
        }
        DispatchEvent::DeleteFile { did, reply } => {
            let _ = reply.send(state.analyser.delete_external_data(did));
        }
        DispatchEvent::RegisterData { did, reply } => {
            state.analyser.register_external_data(did);
            let _ = reply.send(());
        }
        DispatchEvent::StarvationTick => {
            state.scheduler.tick_starvation(&state.analyser);
            let mut placements = Vec::new();
            state.place_ready_tasks(&mut placements);
        }
        DispatchEvent::PlacementTick => {
            let mut placements = Vec::new();
            state.place_ready_tasks(&mut placements);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Did;
    use crate::scheduler::WorkerView;
    use crate::types::{AccessMode, ImplementationCandidate, ParamType, Parameter, ResourceVector};
    use uuid::Uuid;

    fn impl_candidate() -> ImplementationCandidate {
        ImplementationCandidate {
            impl_id: 0,
            worker_kind: "cpu".into(),
            resources: ResourceVector {
                cores: 1.0,
                ..Default::default()
            },
            max_retries: 1,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn submit_then_barrier_resolves_after_completion() {
        let runtime = Runtime::start(RuntimeConfig::default());
        runtime
            .worker_added(WorkerView {
                id: WorkerId("w1".into()),
                kind: "cpu".into(),
                total: ResourceVector {
                    cores: 4.0,
                    memory_mb: 4096.0,
                    storage_mb: 4096.0,
                    accelerators: 0.0,
                },
                in_use: ResourceVector::default(),
                resident: Default::default(),
                degraded: false,
            })
            .await
            .unwrap();

        let app = AppId(Uuid::nil());
        let spec = TaskSpec {
            app,
            group: None,
            signature: "noop".into(),
            implementations: vec![impl_candidate()],
            params: vec![Parameter::new(Did(1), AccessMode::W, ParamType::File, "out")],
            priority: 0,
        };
        let task = runtime.submit(spec).await.unwrap();
        runtime.task_completed(task, true, 10, 0, FailureKind::Unspecified).await.unwrap();
        runtime.barrier(app).await.unwrap();
    }
}

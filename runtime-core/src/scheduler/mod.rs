//! Scheduler (component D): picks a worker + implementation for every
//! READY task and carries it through SCHEDULED/RUNNING, per spec §4.4.

mod policy;

pub use policy::{DataPolicy, FifoPolicy, FullGraphPolicy, SchedulingPolicy};

use crate::errors::{Result, RuntimeError};
use crate::ids::{TaskId, WorkerId};
use crate::task_analyser::TaskAnalyser;
use crate::types::{ImplementationCandidate, ProfileStats, ResourceVector, TaskSpec};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// `dataLocalityScore`: the byte-weighted sum of resident read inputs
/// (spec §4.4's `sum over input params of present(param, worker) ?
/// size(param) : 0`), with resident-input count as a tiebreak when two
/// workers hold equally-sized but differently-numbered inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LocalityScore {
    pub resident_bytes: f64,
    pub resident_count: u32,
}

impl Eq for LocalityScore {}

impl PartialOrd for LocalityScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LocalityScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.resident_bytes
            .total_cmp(&other.resident_bytes)
            .then(self.resident_count.cmp(&other.resident_count))
    }
}

/// `(priority, dataLocalityScore, resourceScore, implementationScore)`,
/// compared lexicographically in that order — spec §4.4.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Score {
    pub priority: i64,
    pub data_locality: LocalityScore,
    pub resource: f64,
    pub implementation: f64,
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.data_locality.cmp(&other.data_locality))
            .then(self.resource.total_cmp(&other.resource))
            .then(self.implementation.total_cmp(&other.implementation))
    }
}

/// What the Scheduler knows about one registered worker.
#[derive(Clone, Debug)]
pub struct WorkerView {
    pub id: WorkerId,
    pub kind: String,
    pub total: ResourceVector,
    pub in_use: ResourceVector,
    /// `Did`s whose latest version this worker already holds a copy of,
    /// used by `dataLocalityScore`.
    pub resident: std::collections::HashSet<crate::ids::Did>,
    pub degraded: bool,
}

impl WorkerView {
    fn available(&self) -> ResourceVector {
        ResourceVector {
            cores: (self.total.cores - self.in_use.cores).max(0.0),
            memory_mb: (self.total.memory_mb - self.in_use.memory_mb).max(0.0),
            storage_mb: (self.total.storage_mb - self.in_use.storage_mb).max(0.0),
            accelerators: (self.total.accelerators - self.in_use.accelerators).max(0.0),
        }
    }
}

/// A READY task waiting to be placed, queued with its current score.
struct QueuedAction {
    task: TaskId,
    score: Score,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for QueuedAction {}
impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.cmp(&other.score)
    }
}

/// Placement decision handed back to the dispatcher.
#[derive(Debug, Clone)]
pub struct Placement {
    pub task: TaskId,
    pub worker: WorkerId,
    pub impl_id: u32,
}

const STARVATION_CAP: i64 = 10;
const STARVATION_TICK_MS: u64 = 2_000;

pub struct Scheduler {
    policy: Box<dyn SchedulingPolicy>,
    workers: HashMap<WorkerId, WorkerView>,
    queue: BinaryHeap<QueuedAction>,
    /// Submission-order priority bump applied for starvation avoidance,
    /// capped at `STARVATION_CAP` above the task's declared priority.
    bumps: HashMap<TaskId, i64>,
    waited_ticks: HashMap<TaskId, u32>,
    profiles: HashMap<(String, WorkerId), ProfileStats>,
    in_flight: HashMap<TaskId, (WorkerId, u32, ResourceVector)>,
    excluded: HashMap<TaskId, std::collections::HashSet<WorkerId>>,
}

impl Scheduler {
    pub fn new(policy: Box<dyn SchedulingPolicy>) -> Self {
        Self {
            policy,
            workers: HashMap::new(),
            queue: BinaryHeap::new(),
            bumps: HashMap::new(),
            waited_ticks: HashMap::new(),
            profiles: HashMap::new(),
            in_flight: HashMap::new(),
            excluded: HashMap::new(),
        }
    }

    pub fn worker_added(&mut self, view: WorkerView) {
        tracing::info!(worker = %view.id, "worker joined the pool");
        self.workers.insert(view.id.clone(), view);
    }

    /// Removes a worker; callers are responsible for requeuing its
    /// in-flight tasks via `requeue_tasks_of`.
    pub fn worker_removed(&mut self, worker: &WorkerId) {
        tracing::warn!(%worker, "worker left the pool");
        self.workers.remove(worker);
    }

    pub fn tasks_running_on(&self, worker: &WorkerId) -> Vec<TaskId> {
        self.in_flight
            .iter()
            .filter(|(_, (w, _, _))| w == worker)
            .map(|(t, _)| *t)
            .collect()
    }

    /// Enqueues a READY task for placement consideration.
    pub fn submit_action(&mut self, task: TaskId, spec: &TaskSpec) {
        let priority = spec.priority + self.bumps.get(&task).copied().unwrap_or(0);
        self.queue.push(QueuedAction {
            task,
            score: Score {
                priority,
                data_locality: LocalityScore::default(),
                resource: 0.0,
                implementation: 0.0,
            },
        });
    }

    /// Recomputes the queued secondary-sort locality score for every
    /// still-waiting task after a data-arrival event (e.g. a fetch
    /// completing on some worker), so the priority queue's ordering isn't
    /// stale until the task is actually considered for placement. Uses the
    /// best score over all non-degraded workers, since the final per-worker
    /// score is always recomputed live in `best_placement`.
    pub fn rescore(&mut self, analyser: &TaskAnalyser) {
        let mut rescored: Vec<QueuedAction> = Vec::with_capacity(self.queue.len());
        for qa in self.queue.drain() {
            let Some(spec) = analyser.task_spec(qa.task) else {
                rescored.push(qa);
                continue;
            };
            let best = self
                .workers
                .values()
                .filter(|w| !w.degraded)
                .map(|w| self.policy.data_locality_score(spec, w))
                .max()
                .unwrap_or_default();
            rescored.push(QueuedAction {
                task: qa.task,
                score: Score { data_locality: best, ..qa.score },
            });
        }
        self.queue.extend(rescored);
    }

    /// Bumps every still-queued task's effective priority by one tick,
    /// capped at `submitPriority + STARVATION_CAP`, per spec §4.4's
    /// starvation-avoidance note. Intended to run on a periodic timer.
    pub fn tick_starvation(&mut self, analyser: &TaskAnalyser) {
        let mut rescored: Vec<QueuedAction> = Vec::with_capacity(self.queue.len());
        for qa in self.queue.drain() {
            let ticks = self.waited_ticks.entry(qa.task).or_insert(0);
            *ticks += 1;
            let base_priority = analyser
                .task_spec(qa.task)
                .map(|s| s.priority)
                .unwrap_or(qa.score.priority);
            let bump = self.bumps.entry(qa.task).or_insert(0);
            if *bump < STARVATION_CAP {
                *bump += 1;
            }
            rescored.push(QueuedAction {
                task: qa.task,
                score: Score {
                    priority: base_priority + *bump,
                    ..qa.score
                },
            });
        }
        self.queue.extend(rescored);
    }

    pub fn starvation_tick_interval() -> std::time::Duration {
        std::time::Duration::from_millis(STARVATION_TICK_MS)
    }

    /// Pops the best-scoring task/worker/implementation placement that
    /// currently fits, leaving anything that doesn't fit yet queued.
    pub fn try_place_one(&mut self, analyser: &TaskAnalyser) -> Option<Placement> {
        let mut deferred = Vec::new();
        let mut result = None;

        while let Some(qa) = self.queue.pop() {
            let Some(spec) = analyser.task_spec(qa.task) else {
                continue; // task vanished (cancelled before placement)
            };
            let excluded = self.excluded.get(&qa.task);
            match self.best_placement(qa.task, spec, excluded) {
                Some(placement) => {
                    result = Some(placement);
                    break;
                }
                None => deferred.push(qa),
            }
        }
        self.queue.extend(deferred);

        if let Some((p, resources)) = &result {
            self.commit_placement(p, resources.clone());
        }
        result.map(|(p, _)| p)
    }

    fn best_placement(
        &self,
        task: TaskId,
        spec: &TaskSpec,
        excluded: Option<&std::collections::HashSet<WorkerId>>,
    ) -> Option<(Placement, ResourceVector)> {
        let mut best: Option<(Score, WorkerId, u32, ResourceVector)> = None;

        for implementation in &spec.implementations {
            for worker in self.workers.values() {
                if worker.degraded {
                    continue;
                }
                if worker.kind != implementation.worker_kind {
                    continue;
                }
                if excluded.map(|e| e.contains(&worker.id)).unwrap_or(false) {
                    continue;
                }
                if !implementation.resources.fits_within(&worker.available()) {
                    continue;
                }
                let score = self.score_for(task, spec, implementation, worker);
                if best.as_ref().map(|(s, _, _, _)| score > *s).unwrap_or(true) {
                    best = Some((score, worker.id.clone(), implementation.impl_id, implementation.resources.clone()));
                }
            }
        }

        best.map(|(_, worker, impl_id, resources)| (Placement { task, worker, impl_id }, resources))
    }

    fn score_for(
        &self,
        task: TaskId,
        spec: &TaskSpec,
        implementation: &ImplementationCandidate,
        worker: &WorkerView,
    ) -> Score {
        let priority = spec.priority + self.bumps.get(&task).copied().unwrap_or(0);
        let data_locality = self.policy.data_locality_score(spec, worker);
        let resource = implementation.resources.slack_ratio(&worker.available());
        let implementation_score = self
            .profiles
            .get(&(spec.signature.clone(), worker.id.clone()))
            .map(|p| p.success_rate() / (1.0 + p.mean_wall_time_ms))
            .unwrap_or(1.0);
        Score {
            priority,
            data_locality,
            resource,
            implementation: implementation_score,
        }
    }

    fn commit_placement(&mut self, placement: &Placement, resources: ResourceVector) {
        if let Some(worker) = self.workers.get_mut(&placement.worker) {
            worker.in_use.cores += resources.cores;
            worker.in_use.memory_mb += resources.memory_mb;
            worker.in_use.storage_mb += resources.storage_mb;
            worker.in_use.accelerators += resources.accelerators;
        }
        self.in_flight.insert(placement.task, (placement.worker.clone(), placement.impl_id, resources));
        self.waited_ticks.remove(&placement.task);
    }

    /// Records that `worker` now holds a local copy of each `Did`, called
    /// by the Data Manager once a fetch actually lands — the only writer
    /// of `WorkerView.resident`.
    pub fn mark_resident(&mut self, worker: &WorkerId, dids: impl IntoIterator<Item = crate::ids::Did>) {
        if let Some(w) = self.workers.get_mut(worker) {
            w.resident.extend(dids);
        }
    }

    fn release_reservation(&mut self, worker_id: &WorkerId, resources: &ResourceVector) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.in_use.cores = (worker.in_use.cores - resources.cores).max(0.0);
            worker.in_use.memory_mb = (worker.in_use.memory_mb - resources.memory_mb).max(0.0);
            worker.in_use.storage_mb = (worker.in_use.storage_mb - resources.storage_mb).max(0.0);
            worker.in_use.accelerators = (worker.in_use.accelerators - resources.accelerators).max(0.0);
        }
    }

    /// Records a finished task's timing/outcome against its (signature,
    /// worker) profile and frees the worker's resource reservation.
    pub fn action_completed(
        &mut self,
        task: TaskId,
        spec: &TaskSpec,
        wall_time_ms: u64,
        transferred_bytes: u64,
        success: bool,
    ) -> Result<WorkerId> {
        let Some((worker, _impl_id, resources)) = self.in_flight.remove(&task) else {
            return Err(RuntimeError::CorruptSchedulerState(format!(
                "action_completed for task {task} with no recorded placement"
            )));
        };
        self.release_reservation(&worker, &resources);
        self.profiles
            .entry((spec.signature.clone(), worker.clone()))
            .or_default()
            .record(wall_time_ms, transferred_bytes, success);
        Ok(worker)
    }

    /// Requeues a task for retry, excluding the worker it just failed on
    /// (host-sticky exclusion, per spec §4.4/§7).
    pub fn requeue_for_retry(&mut self, task: TaskId, spec: &TaskSpec, failed_worker: WorkerId) {
        if let Some((worker, _impl_id, resources)) = self.in_flight.remove(&task) {
            self.release_reservation(&worker, &resources);
        }
        self.excluded.entry(task).or_default().insert(failed_worker);
        self.submit_action(task, spec);
    }

    pub fn cancel_queued(&mut self, task: TaskId) {
        self.queue.retain(|qa| qa.task != task);
        self.bumps.remove(&task);
        self.waited_ticks.remove(&task);
        self.excluded.remove(&task);
    }

    pub fn worker_view(&self, worker: &WorkerId) -> Option<&WorkerView> {
        self.workers.get(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AppId, Did};
    use crate::types::{AccessMode, ParamType, Parameter};
    use uuid::Uuid;

    fn worker(id: &str, kind: &str, cores: f64) -> WorkerView {
        WorkerView {
            id: WorkerId(id.into()),
            kind: kind.into(),
            total: ResourceVector {
                cores,
                memory_mb: 4096.0,
                storage_mb: 10_000.0,
                accelerators: 0.0,
            },
            in_use: ResourceVector::default(),
            resident: Default::default(),
            degraded: false,
        }
    }

    fn spec(priority: i64) -> TaskSpec {
        TaskSpec {
            app: AppId(Uuid::nil()),
            group: None,
            signature: "sig".into(),
            implementations: vec![ImplementationCandidate {
                impl_id: 0,
                worker_kind: "cpu".into(),
                resources: ResourceVector {
                    cores: 1.0,
                    ..Default::default()
                },
                max_retries: 2,
                timeout_ms: None,
            }],
            params: vec![Parameter::new(Did(1), AccessMode::R, ParamType::File, "in")],
            priority,
        }
    }

    #[test]
    fn higher_priority_wins_placement() {
        let mut sched = Scheduler::new(Box::new(FifoPolicy));
        sched.worker_added(worker("w1", "cpu", 4.0));

        let mut analyser = TaskAnalyser::new();
        let (low, _) = analyser.process_task(spec(0)).unwrap();
        let (high, _) = analyser.process_task(spec(5)).unwrap();
        sched.submit_action(low, analyser.task_spec(low).unwrap());
        sched.submit_action(high, analyser.task_spec(high).unwrap());

        let placement = sched.try_place_one(&analyser).unwrap();
        assert_eq!(placement.task, high);
    }

    #[test]
    fn no_placement_when_resources_insufficient() {
        let mut sched = Scheduler::new(Box::new(FifoPolicy));
        sched.worker_added(worker("w1", "cpu", 0.5));
        let mut analyser = TaskAnalyser::new();
        let (t, _) = analyser.process_task(spec(0)).unwrap();
        sched.submit_action(t, analyser.task_spec(t).unwrap());
        assert!(sched.try_place_one(&analyser).is_none());
    }

    #[test]
    fn retry_excludes_failed_worker() {
        let mut sched = Scheduler::new(Box::new(FifoPolicy));
        sched.worker_added(worker("w1", "cpu", 4.0));
        sched.worker_added(worker("w2", "cpu", 4.0));
        let mut analyser = TaskAnalyser::new();
        let (t, _) = analyser.process_task(spec(0)).unwrap();
        let s = analyser.task_spec(t).unwrap().clone();
        sched.submit_action(t, &s);
        let first = sched.try_place_one(&analyser).unwrap();

        sched.requeue_for_retry(t, &s, first.worker.clone());
        let second = sched.try_place_one(&analyser).unwrap();
        assert_ne!(second.worker, first.worker);
    }
}

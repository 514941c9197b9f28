//! Task Analyser (component C): turns task submissions into a versioned
//! dependency DAG and drives tasks through the state machine of spec §4.3.

use crate::dip::DataInfoProvider;
use crate::errors::{Result, RuntimeError};
use crate::ids::{AppId, GroupId, IdAllocator, Renaming, TaskId};
use crate::types::{AccessMode, ParamType, TaskSpec, TaskState};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;

/// Why a dependency edge exists between two tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// T2 reads a DII produced by T1.
    Raw,
    /// T2 writes following a still-pending read of the prior version.
    War,
    /// T2 writes following a prior write not yet consumed.
    Waw,
}

#[derive(Debug, Clone)]
struct Node {
    id: TaskId,
    spec: TaskSpec,
    state: TaskState,
    pending_predecessors: u32,
    attempt: u32,
    submit_seq: u64,
}

/// Outcome of feeding a submission or completion through the analyser:
/// the set of tasks that just became READY, in FIFO-of-submission order
/// for ties, for the caller (normally the Scheduler) to enqueue.
#[derive(Debug, Default)]
pub struct Transition {
    pub newly_ready: Vec<TaskId>,
    pub newly_cancelled: Vec<TaskId>,
}

pub struct TaskAnalyser {
    dip: DataInfoProvider,
    graph: DiGraph<(), EdgeKind>,
    node_of: HashMap<TaskId, NodeIndex>,
    nodes: HashMap<TaskId, Node>,
    /// Every task (possibly several) that has written the latest
    /// not-yet-superseded value behind a renaming. A `Vec` because a
    /// commutative round can have several producers sharing one renaming.
    producers_of: HashMap<Renaming, Vec<TaskId>>,
    /// Tasks with an outstanding (unfinished) read against a renaming.
    pending_readers: HashMap<Renaming, Vec<TaskId>>,
    ids: IdAllocator,
    app_tasks: HashMap<AppId, HashSet<TaskId>>,
    group_tasks: HashMap<(AppId, GroupId), HashSet<TaskId>>,
    barrier_waiters: HashMap<AppId, Vec<oneshot::Sender<()>>>,
    group_waiters: HashMap<(AppId, GroupId), Vec<oneshot::Sender<()>>>,
    /// Callers blocked on one task's terminal transition (`findWaitedTask`),
    /// keyed by the task they're waiting on.
    task_waiters: HashMap<TaskId, Vec<oneshot::Sender<()>>>,
}

impl Default for TaskAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskAnalyser {
    pub fn new() -> Self {
        Self {
            dip: DataInfoProvider::new(),
            graph: DiGraph::new(),
            node_of: HashMap::new(),
            nodes: HashMap::new(),
            producers_of: HashMap::new(),
            pending_readers: HashMap::new(),
            ids: IdAllocator::new(),
            app_tasks: HashMap::new(),
            group_tasks: HashMap::new(),
            barrier_waiters: HashMap::new(),
            group_waiters: HashMap::new(),
            task_waiters: HashMap::new(),
        }
    }

    pub fn dip(&self) -> &DataInfoProvider {
        &self.dip
    }

    fn node_index(&mut self, task: TaskId) -> NodeIndex {
        *self.node_of.entry(task).or_insert_with(|| self.graph.add_node(()))
    }

    /// Registers a task's accesses against the Data Info Provider,
    /// computes RAW/WAR/WAW dependency edges against still-outstanding
    /// predecessors, and returns whether it's immediately READY.
    pub fn process_task(&mut self, mut spec: TaskSpec) -> Result<(TaskId, Transition)> {
        let task_id = self.ids.next_task_id();
        let idx = self.node_index(task_id);
        let submit_seq = self.ids.next_u64();

        let mut pending = 0u32;

        for param in spec.params.iter_mut() {
            let leaves_mut: Vec<&mut crate::types::Parameter> = if param.param_type == ParamType::Collection {
                collect_leaves_mut(&mut param.elements)
            } else {
                vec![param]
            };

            for leaf in leaves_mut {
                let did = leaf.access.did;
                let mode = leaf.access.mode;
                let prior_renaming = self.dip.latest_renaming(did);

                let diis = self.dip.register_access(did, mode)?;
                leaf.read_renaming = diis.read.clone();
                leaf.write_renaming = diis.write.clone();

                if let Some(read_r) = &diis.read {
                    if let Some(producers) = self.producers_of.get(read_r).cloned() {
                        for producer in producers {
                            if producer != task_id && !self.is_terminal(producer) {
                                self.add_edge(producer, task_id, EdgeKind::Raw);
                                pending += 1;
                            }
                        }
                    }
                    self.pending_readers.entry(read_r.clone()).or_default().push(task_id);
                }

                if let Some(write_r) = &diis.write {
                    // Other C/M writers already registered in the same
                    // pending round share this write renaming as their own
                    // predecessor; they must not gain a WAR edge against
                    // each other, or the round's unordered bag collapses
                    // into a serial chain. A plain W's renaming is always
                    // fresh, so this set is always empty there.
                    let sibling_producers: HashSet<TaskId> =
                        self.producers_of.get(write_r).cloned().unwrap_or_default().into_iter().collect();
                    if let Some(prev) = &prior_renaming {
                        if let Some(producers) = self.producers_of.get(prev).cloned() {
                            for producer in producers {
                                if producer != task_id && !self.is_terminal(producer) {
                                    self.add_edge(producer, task_id, EdgeKind::Waw);
                                    pending += 1;
                                }
                            }
                        }
                        if let Some(readers) = self.pending_readers.get(prev).cloned() {
                            for reader in readers {
                                if reader != task_id && !self.is_terminal(reader) && !sibling_producers.contains(&reader) {
                                    self.add_edge(reader, task_id, EdgeKind::War);
                                    pending += 1;
                                }
                            }
                        }
                    }
                    self.producers_of.entry(write_r.clone()).or_default().push(task_id);
                }
            }
        }

        let app = spec.app;
        let group = spec.group.clone();
        self.app_tasks.entry(app).or_default().insert(task_id);
        if let Some(g) = &group {
            self.group_tasks.entry((app, g.clone())).or_default().insert(task_id);
        }

        let state = if pending == 0 { TaskState::Ready } else { TaskState::Waiting };
        self.nodes.insert(
            task_id,
            Node {
                id: task_id,
                spec,
                state,
                pending_predecessors: pending,
                attempt: 0,
                submit_seq,
            },
        );

        let mut transition = Transition::default();
        if state == TaskState::Ready {
            transition.newly_ready.push(task_id);
        }
        let _ = idx;
        Ok((task_id, transition))
    }

    fn add_edge(&mut self, from: TaskId, to: TaskId, kind: EdgeKind) {
        let a = self.node_index(from);
        let b = self.node_index(to);
        self.graph.add_edge(a, b, kind);
    }

    pub fn is_terminal(&self, task: TaskId) -> bool {
        self.nodes.get(&task).map(|n| n.state.is_terminal()).unwrap_or(true)
    }

    fn fire_task_waiters(&mut self, task: TaskId) {
        if let Some(waiters) = self.task_waiters.remove(&task) {
            for w in waiters {
                let _ = w.send(());
            }
        }
    }

    /// Registers interest in a task's terminal transition, resolving
    /// immediately if it is already terminal (or unknown — nothing further
    /// will ever change it).
    pub fn notify_on_terminal(&mut self, task: TaskId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.is_terminal(task) {
            let _ = tx.send(());
        } else {
            self.task_waiters.entry(task).or_default().push(tx);
        }
        rx
    }

    /// `findWaitedTask`: blocks the caller until `task` reaches a terminal
    /// state. Thin wrapper over `notify_on_terminal` kept as its own named
    /// entry point since callers reason about it as "wait for this task",
    /// not "subscribe to terminal events".
    pub fn find_waited_task(&mut self, task: TaskId) -> oneshot::Receiver<()> {
        self.notify_on_terminal(task)
    }

    /// Current producer(s) of a `Did`'s latest version — used by `OpenFile`
    /// to decide whether the DII it hands back still has in-flight writers.
    pub fn current_producers(&self, did: Did) -> Vec<TaskId> {
        self.dip
            .latest_renaming(did)
            .and_then(|r| self.producers_of.get(&r).cloned())
            .unwrap_or_default()
    }

    /// Registers a bare data access outside the task DAG (`OpenFile`):
    /// deliberately bypasses dependency-edge bookkeeping since no task node
    /// backs this access.
    pub fn register_external_access(&mut self, did: Did, mode: AccessMode) -> Result<crate::dip::AccessDiis> {
        self.dip.register_access(did, mode)
    }

    /// `CloseFile`: releases a renaming taken via `register_external_access`.
    pub fn finish_external_access(&mut self, renaming: &Renaming) -> Result<()> {
        self.dip.finish_access(renaming)
    }

    /// `DeleteFile`: invalidates every version of a `Did`.
    pub fn delete_external_data(&mut self, did: Did) -> Result<()> {
        self.dip.delete_data(did)
    }

    /// `RegisterData`: lazily creates a `Did`'s version chain without
    /// advancing it, so a later access finds it already known.
    pub fn register_external_data(&mut self, did: Did) {
        self.dip.ensure_registered(did);
    }

    fn successors(&self, task: TaskId) -> Vec<(TaskId, EdgeKind)> {
        let Some(&idx) = self.node_of.get(&task) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .map(|e| {
                let target_idx = e.target();
                let target = self
                    .node_of
                    .iter()
                    .find(|(_, &v)| v == target_idx)
                    .map(|(k, _)| *k)
                    .expect("edge target must have a task id");
                (target, *e.weight())
            })
            .collect()
    }

    /// Marks a predecessor's edge to `succ` resolved; returns true if
    /// `succ` just became READY.
    fn resolve_one_predecessor(&mut self, succ: TaskId, transition: &mut Transition) {
        if let Some(node) = self.nodes.get_mut(&succ) {
            if node.state.is_terminal() {
                return;
            }
            node.pending_predecessors = node.pending_predecessors.saturating_sub(1);
            if node.pending_predecessors == 0 && node.state == TaskState::Waiting {
                node.state = TaskState::Ready;
                transition.newly_ready.push(succ);
            }
        }
    }

    /// Applies a task's completion. `success = false` invalidates its
    /// write DIIs and transitively cancels RAW successors, while WAR/WAW
    /// successors are resolved normally (their ordering constraint is
    /// satisfied regardless of the producer's outcome).
    pub fn end_task(&mut self, task: TaskId, success: bool) -> Result<Transition> {
        let mut transition = Transition::default();
        let spec = {
            let node = self
                .nodes
                .get(&task)
                .ok_or_else(|| RuntimeError::CorruptSchedulerState(format!("unknown task {task}")))?;
            node.spec.clone()
        };

        for param in spec.params.iter() {
            for leaf in param.flatten_leaves() {
                if let Some(read_r) = &leaf.read_renaming {
                    self.dip.finish_access(read_r)?;
                    if let Some(list) = self.pending_readers.get_mut(read_r) {
                        list.retain(|&t| t != task);
                    }
                }
                if matches!(leaf.access.mode, AccessMode::C | AccessMode::M) {
                    self.dip.drain_concurrent_writer(leaf.access.did)?;
                }
                if !success {
                    if let Some(write_r) = &leaf.write_renaming {
                        self.dip.invalidate_renaming(write_r)?;
                    }
                }
            }
        }

        if let Some(node) = self.nodes.get_mut(&task) {
            node.state = if success { TaskState::Done } else { TaskState::Failed };
        }
        self.fire_task_waiters(task);

        let succs = self.successors(task);
        if success {
            for (succ, _) in succs {
                self.resolve_one_predecessor(succ, &mut transition);
            }
        } else {
            for (succ, kind) in succs {
                match kind {
                    EdgeKind::Raw => self.cancel_recursive(succ, "predecessor failed", &mut transition),
                    EdgeKind::War | EdgeKind::Waw => self.resolve_one_predecessor(succ, &mut transition),
                }
            }
        }

        self.maybe_release_barriers(task);
        Ok(transition)
    }

    fn cancel_recursive(&mut self, task: TaskId, reason: &str, transition: &mut Transition) {
        let Some(node) = self.nodes.get_mut(&task) else { return };
        if node.state.is_terminal() {
            return;
        }
        node.state = TaskState::Cancelled;
        transition.newly_cancelled.push(task);
        let _ = reason;
        self.fire_task_waiters(task);

        for (succ, kind) in self.successors(task) {
            match kind {
                EdgeKind::Raw => self.cancel_recursive(succ, "predecessor cancelled", transition),
                EdgeKind::War | EdgeKind::Waw => self.resolve_one_predecessor(succ, transition),
            }
        }
        self.maybe_release_barriers(task);
    }

    /// Transitions every pending task of `app` to CANCELLED and notifies successors.
    pub fn cancel_application(&mut self, app: AppId) -> Transition {
        let mut transition = Transition::default();
        let tasks: Vec<TaskId> = self.app_tasks.get(&app).cloned().unwrap_or_default().into_iter().collect();
        for task in tasks {
            self.cancel_recursive(task, "application cancelled", &mut transition);
        }
        if let Some(waiters) = self.barrier_waiters.remove(&app) {
            for w in waiters {
                let _ = w.send(());
            }
        }
        transition
    }

    fn app_is_quiescent(&self, app: AppId) -> bool {
        self.app_tasks
            .get(&app)
            .map(|tasks| tasks.iter().all(|t| self.is_terminal(*t)))
            .unwrap_or(true)
    }

    fn group_is_quiescent(&self, app: AppId, group: &GroupId) -> bool {
        self.group_tasks
            .get(&(app, group.clone()))
            .map(|tasks| tasks.iter().all(|t| self.is_terminal(*t)))
            .unwrap_or(true)
    }

    fn maybe_release_barriers(&mut self, task: TaskId) {
        let Some(node) = self.nodes.get(&task) else { return };
        let app = node.spec.app;
        let group = node.spec.group.clone();

        if self.app_is_quiescent(app) {
            if let Some(waiters) = self.barrier_waiters.remove(&app) {
                for w in waiters {
                    let _ = w.send(());
                }
            }
        }
        if let Some(g) = group {
            if self.group_is_quiescent(app, &g) {
                if let Some(waiters) = self.group_waiters.remove(&(app, g)) {
                    for w in waiters {
                        let _ = w.send(());
                    }
                }
            }
        }
    }

    /// Registers a barrier wait; resolves immediately if already quiescent.
    pub fn barrier(&mut self, app: AppId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.app_is_quiescent(app) {
            let _ = tx.send(());
        } else {
            self.barrier_waiters.entry(app).or_default().push(tx);
        }
        rx
    }

    pub fn barrier_group(&mut self, app: AppId, group: GroupId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.group_is_quiescent(app, &group) {
            let _ = tx.send(());
        } else {
            self.group_waiters.entry((app, group)).or_default().push(tx);
        }
        rx
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.nodes.get(&task).map(|n| n.state)
    }

    /// Requeues a task as READY with an incremented attempt counter,
    /// per the retry policy of spec §4.3. Returns the new attempt count.
    pub fn retry_task(&mut self, task: TaskId) -> Result<u32> {
        let node = self
            .nodes
            .get_mut(&task)
            .ok_or_else(|| RuntimeError::CorruptSchedulerState(format!("unknown task {task}")))?;
        node.attempt += 1;
        node.state = TaskState::Ready;
        Ok(node.attempt)
    }

    pub fn attempt(&self, task: TaskId) -> u32 {
        self.nodes.get(&task).map(|n| n.attempt).unwrap_or(0)
    }

    pub fn task_spec(&self, task: TaskId) -> Option<&TaskSpec> {
        self.nodes.get(&task).map(|n| &n.spec)
    }

    pub fn submit_seq(&self, task: TaskId) -> u64 {
        self.nodes.get(&task).map(|n| n.submit_seq).unwrap_or(0)
    }

    pub fn mark_scheduled(&mut self, task: TaskId) {
        if let Some(n) = self.nodes.get_mut(&task) {
            n.state = TaskState::Scheduled;
        }
    }

    pub fn mark_running(&mut self, task: TaskId) {
        if let Some(n) = self.nodes.get_mut(&task) {
            n.state = TaskState::Running;
        }
    }
}

fn collect_leaves_mut(params: &mut [crate::types::Parameter]) -> Vec<&mut crate::types::Parameter> {
    let mut out = Vec::new();
    for p in params.iter_mut() {
        if p.param_type == ParamType::Collection {
            out.extend(collect_leaves_mut(&mut p.elements));
        } else {
            out.push(p);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Did;
    use crate::types::{ImplementationCandidate, Parameter, ResourceVector};
    use uuid::Uuid;

    fn impl_candidate() -> ImplementationCandidate {
        ImplementationCandidate {
            impl_id: 0,
            worker_kind: "any".into(),
            resources: ResourceVector::default(),
            max_retries: 0,
            timeout_ms: None,
        }
    }

    fn spec(app: AppId, params: Vec<Parameter>) -> TaskSpec {
        TaskSpec {
            app,
            group: None,
            signature: "t".into(),
            implementations: vec![impl_candidate()],
            params,
            priority: 0,
        }
    }

    #[test]
    fn raw_chain_s1() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d1 = Did(1);

        // f() -> D1
        let (f, tf) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        assert_eq!(tf.newly_ready, vec![f]);

        // g(D1) -> D2
        let d2 = Did(2);
        let (g, tg) = ta
            .process_task(spec(
                app,
                vec![
                    Parameter::new(d1, AccessMode::R, ParamType::File, "in"),
                    Parameter::new(d2, AccessMode::W, ParamType::File, "out"),
                ],
            ))
            .unwrap();
        assert!(tg.newly_ready.is_empty(), "g must wait on f");

        let trans = ta.end_task(f, true).unwrap();
        assert_eq!(trans.newly_ready, vec![g]);

        // h(D2)
        let (h, th) = ta
            .process_task(spec(app, vec![Parameter::new(d2, AccessMode::R, ParamType::File, "in")]))
            .unwrap();
        assert!(th.newly_ready.is_empty());
        let trans = ta.end_task(g, true).unwrap();
        assert_eq!(trans.newly_ready, vec![h]);
    }

    #[test]
    fn write_after_read_s3() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d1 = Did(1);
        let _ = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        // r = read(D1)
        let (r, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::R, ParamType::File, "in")]))
            .unwrap();
        // w = write(D1) must wait for r despite no RAW dependency
        let (_w, tw) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        assert!(tw.newly_ready.is_empty());
        let trans = ta.end_task(r, true).unwrap();
        assert_eq!(trans.newly_ready.len(), 1);
    }

    #[test]
    fn fan_out_fan_in_s2() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d0 = Did(0);
        let (producer, _) = ta
            .process_task(spec(app, vec![Parameter::new(d0, AccessMode::W, ParamType::File, "out")]))
            .unwrap();

        let mut maps = Vec::new();
        for i in 0..4 {
            let di = Did(10 + i);
            let (m, t) = ta
                .process_task(spec(
                    app,
                    vec![
                        Parameter::new(d0, AccessMode::R, ParamType::File, "in"),
                        Parameter::new(di, AccessMode::W, ParamType::File, "out"),
                    ],
                ))
                .unwrap();
            assert!(t.newly_ready.is_empty());
            maps.push((m, di));
        }

        let reduce_params: Vec<_> = maps.iter().map(|(_, di)| Parameter::new(*di, AccessMode::R, ParamType::File, "in")).collect();
        let (reduce, tr) = ta.process_task(spec(app, reduce_params)).unwrap();
        assert!(tr.newly_ready.is_empty());

        let trans = ta.end_task(producer, true).unwrap();
        assert_eq!(trans.newly_ready.len(), 4, "all four maps become ready simultaneously");

        for (m, _) in &maps[..3] {
            let t = ta.end_task(*m, true).unwrap();
            assert!(t.newly_ready.is_empty(), "reduce waits for all four");
        }
        let (last, _) = maps[3];
        let t = ta.end_task(last, true).unwrap();
        assert_eq!(t.newly_ready, vec![reduce]);
    }

    #[test]
    fn failed_producer_cancels_raw_successor_transitively() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d1 = Did(1);
        let d2 = Did(2);
        let (f, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        let (g, _) = ta
            .process_task(spec(
                app,
                vec![
                    Parameter::new(d1, AccessMode::R, ParamType::File, "in"),
                    Parameter::new(d2, AccessMode::W, ParamType::File, "out"),
                ],
            ))
            .unwrap();
        let (_h, _) = ta
            .process_task(spec(app, vec![Parameter::new(d2, AccessMode::R, ParamType::File, "in")]))
            .unwrap();

        let trans = ta.end_task(f, false).unwrap();
        assert!(trans.newly_cancelled.contains(&g));
        assert_eq!(ta.task_state(g), Some(TaskState::Cancelled));
    }

    #[test]
    fn commutative_writers_do_not_serialize_each_other_s6() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d1 = Did(1);
        let (w0, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        ta.end_task(w0, true).unwrap();

        let (m1, t1) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "acc")]))
            .unwrap();
        assert_eq!(t1.newly_ready, vec![m1], "first commutative writer has no peer dependency");

        let (m2, t2) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "acc")]))
            .unwrap();
        assert_eq!(t2.newly_ready, vec![m2], "second writer must not wait on the first");

        let (m3, t3) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "acc")]))
            .unwrap();
        assert_eq!(t3.newly_ready, vec![m3], "third writer must not wait on either sibling");

        // Completion in a scrambled order must not error or dangle.
        ta.end_task(m3, true).unwrap();
        ta.end_task(m1, true).unwrap();
        ta.end_task(m2, true).unwrap();
    }

    #[test]
    fn commutative_reader_waits_for_all_pending_writers_s6() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d1 = Did(1);
        let (w0, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        ta.end_task(w0, true).unwrap();

        let (m1, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "acc")]))
            .unwrap();
        let (m2, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "acc")]))
            .unwrap();
        let (m3, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "acc")]))
            .unwrap();

        let (reader, tr) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::R, ParamType::File, "in")]))
            .unwrap();
        assert!(tr.newly_ready.is_empty(), "reader must wait on every pending writer");
        assert_eq!(ta.task_state(reader), Some(TaskState::Waiting));

        let t = ta.end_task(m1, true).unwrap();
        assert!(t.newly_ready.is_empty(), "reader still waits on m2 and m3");
        let t = ta.end_task(m2, true).unwrap();
        assert!(t.newly_ready.is_empty(), "reader still waits on m3");
        let t = ta.end_task(m3, true).unwrap();
        assert_eq!(t.newly_ready, vec![reader], "reader becomes ready only once the whole bag drains");
    }

    #[tokio::test]
    async fn barrier_resolves_once_all_tasks_terminal() {
        let mut ta = TaskAnalyser::new();
        let app = AppId(Uuid::nil());
        let d1 = Did(1);
        let (f, _) = ta
            .process_task(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
            .unwrap();
        let rx = ta.barrier(app);
        ta.end_task(f, true).unwrap();
        rx.await.expect("barrier must resolve");
    }
}

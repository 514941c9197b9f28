//! Integration tests: drive the full pipeline (submission → DIP
//! versioning → Task Analyser DAG → Scheduler placement → completion)
//! through the `Runtime` facade, the same path gRPC handlers delegate
//! to. Covers the end-to-end scenarios of spec §8 (S1, S2, S3, S6).

use runtime_core::config::RuntimeConfig;
use runtime_core::ids::{AppId, Did};
use runtime_core::scheduler::WorkerView;
use runtime_core::types::{AccessMode, ImplementationCandidate, ParamType, Parameter, ResourceVector, TaskSpec};
use runtime_core::{FailureKind, Runtime};
use uuid::Uuid;

fn one_core_worker(name: &str) -> WorkerView {
    WorkerView {
        id: runtime_core::ids::WorkerId(name.into()),
        kind: "cpu".into(),
        total: ResourceVector {
            cores: 4.0,
            memory_mb: 8192.0,
            storage_mb: 8192.0,
            accelerators: 0.0,
        },
        in_use: ResourceVector::default(),
        resident: Default::default(),
        degraded: false,
    }
}

fn impl_candidate() -> ImplementationCandidate {
    ImplementationCandidate {
        impl_id: 0,
        worker_kind: "cpu".into(),
        resources: ResourceVector {
            cores: 1.0,
            ..Default::default()
        },
        max_retries: 2,
        timeout_ms: None,
    }
}

fn spec(app: AppId, params: Vec<Parameter>) -> TaskSpec {
    TaskSpec {
        app,
        group: None,
        signature: "sig".into(),
        implementations: vec![impl_candidate()],
        params,
        priority: 0,
    }
}

/// S1: f()→D1, g(D1)→D2, h(D2). Each must only submit (become READY)
/// once its predecessor has been reported done.
#[tokio::test]
async fn s1_raw_chain_through_runtime() {
    let runtime = Runtime::start(RuntimeConfig::default());
    runtime.worker_added(one_core_worker("w1")).await.unwrap();
    runtime.worker_added(one_core_worker("w2")).await.unwrap();

    let app = AppId(Uuid::nil());
    let d1 = Did(1);
    let d2 = Did(2);

    let f = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
        .await
        .unwrap();
    runtime.task_completed(f, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    let g = runtime
        .submit(spec(
            app,
            vec![
                Parameter::new(d1, AccessMode::R, ParamType::File, "in"),
                Parameter::new(d2, AccessMode::W, ParamType::File, "out"),
            ],
        ))
        .await
        .unwrap();
    runtime.task_completed(g, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    let h = runtime
        .submit(spec(app, vec![Parameter::new(d2, AccessMode::R, ParamType::File, "in")]))
        .await
        .unwrap();
    runtime.task_completed(h, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    runtime.barrier(app).await.unwrap();
}

/// S2: one producer, four independent maps over its output, one reduce
/// depending on all four. The barrier must not return until every map
/// and the reduce have been reported done.
#[tokio::test]
async fn s2_fan_out_fan_in_through_runtime() {
    let runtime = Runtime::start(RuntimeConfig::default());
    runtime.worker_added(one_core_worker("w1")).await.unwrap();

    let app = AppId(Uuid::nil());
    let d0 = Did(0);

    let producer = runtime
        .submit(spec(app, vec![Parameter::new(d0, AccessMode::W, ParamType::File, "out")]))
        .await
        .unwrap();
    runtime.task_completed(producer, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    let mut map_outputs = Vec::new();
    for i in 0..4 {
        let di = Did(10 + i);
        let m = runtime
            .submit(spec(
                app,
                vec![
                    Parameter::new(d0, AccessMode::R, ParamType::File, "in"),
                    Parameter::new(di, AccessMode::W, ParamType::File, "out"),
                ],
            ))
            .await
            .unwrap();
        runtime.task_completed(m, true, 5, 0, FailureKind::Unspecified).await.unwrap();
        map_outputs.push(di);
    }

    let reduce_params = map_outputs
        .iter()
        .map(|d| Parameter::new(*d, AccessMode::R, ParamType::File, "in"))
        .collect();
    let reduce = runtime.submit(spec(app, reduce_params)).await.unwrap();
    runtime.task_completed(reduce, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    runtime.barrier(app).await.unwrap();
}

/// S3: a write following a read of the same `Did` must be ordered
/// after the read completes, even though there is no RAW edge.
#[tokio::test]
async fn s3_write_after_read_through_runtime() {
    let runtime = Runtime::start(RuntimeConfig::default());
    runtime.worker_added(one_core_worker("w1")).await.unwrap();
    let app = AppId(Uuid::nil());
    let d1 = Did(1);

    let init = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
        .await
        .unwrap();
    runtime.task_completed(init, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    let r = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::R, ParamType::File, "in")]))
        .await
        .unwrap();
    let w = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
        .await
        .unwrap();

    runtime.task_completed(r, true, 5, 0, FailureKind::Unspecified).await.unwrap();
    runtime.task_completed(w, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    runtime.barrier(app).await.unwrap();
}

/// S6: three commutative writers to the same `Did` followed by a
/// reader; regardless of completion order, the barrier resolves once
/// all four are terminal.
#[tokio::test]
async fn s6_commutative_writers_through_runtime() {
    let runtime = Runtime::start(RuntimeConfig::default());
    runtime.worker_added(one_core_worker("w1")).await.unwrap();
    let app = AppId(Uuid::nil());
    let d1 = Did(1);

    let init = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
        .await
        .unwrap();
    runtime.task_completed(init, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    let mut writers = Vec::new();
    for _ in 0..3 {
        let t = runtime
            .submit(spec(app, vec![Parameter::new(d1, AccessMode::M, ParamType::File, "out")]))
            .await
            .unwrap();
        writers.push(t);
    }

    let reader = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::R, ParamType::File, "in")]))
        .await
        .unwrap();

    // Complete the writers out of order.
    runtime.task_completed(writers[2], true, 5, 0, FailureKind::Unspecified).await.unwrap();
    runtime.task_completed(writers[0], true, 5, 0, FailureKind::Unspecified).await.unwrap();
    runtime.task_completed(writers[1], true, 5, 0, FailureKind::Unspecified).await.unwrap();
    runtime.task_completed(reader, true, 5, 0, FailureKind::Unspecified).await.unwrap();

    runtime.barrier(app).await.unwrap();
}

/// A submitted task with no registered worker never deadlocks the
/// barrier once it is explicitly failed past its retry budget.
#[tokio::test]
async fn exhausted_retries_still_reaches_barrier() {
    let runtime = Runtime::start(RuntimeConfig::default());
    runtime.worker_added(one_core_worker("w1")).await.unwrap();
    let app = AppId(Uuid::nil());
    let d1 = Did(1);

    let t = runtime
        .submit(spec(app, vec![Parameter::new(d1, AccessMode::W, ParamType::File, "out")]))
        .await
        .unwrap();

    for _ in 0..=impl_candidate().max_retries {
        runtime.task_completed(t, false, 5, 0, FailureKind::TaskFailure).await.unwrap();
    }

    runtime.barrier(app).await.unwrap();
}

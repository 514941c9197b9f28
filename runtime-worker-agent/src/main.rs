//! Reference worker agent: registers with the task runtime server,
//! watches for `TaskScheduled` events addressed to it, and runs the
//! worker-side fetch→execute→store sequence of spec §4.5/§5 using a
//! local-filesystem `TransferProvider`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use runtime_core::data_manager::{DataLocation, DataManager, LocalFsTransferProvider};
use runtime_core::types::Parameter;
use runtime_server::grpc::failure_kind_to_proto;
use runtime_server::grpc::proto::task_runtime_client::TaskRuntimeClient;
use runtime_server::grpc::proto::{RegisterWorkerRequest, ReportTaskResultRequest, ResourceVector, SubscribeEventsRequest};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let server_addr = parse_server_addr_arg().unwrap_or_else(|| "http://127.0.0.1:50051".into());
    let worker_id = parse_worker_id_arg().unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7()));
    let sandbox_root = parse_sandbox_root_arg().unwrap_or_else(|| PathBuf::from("./runtime-worker-agent/sandbox"));
    tokio::fs::create_dir_all(&sandbox_root).await?;

    let mut client = TaskRuntimeClient::connect(server_addr.clone()).await?;

    client
        .register_worker(RegisterWorkerRequest {
            worker_id: worker_id.clone(),
            kind: "cpu".into(),
            total_resources: Some(ResourceVector {
                cores: std::thread::available_parallelism().map(|n| n.get() as f64).unwrap_or(1.0),
                memory_mb: 4096.0,
                storage_mb: 16_384.0,
                accelerators: 0.0,
            }),
        })
        .await?;
    tracing::info!(%worker_id, %server_addr, "registered with task runtime server");

    let data_manager = Arc::new(DataManager::new(
        Arc::new(LocalFsTransferProvider { root: sandbox_root.clone() }),
        None,
        true,
    ));

    let mut stream = client.subscribe_events(SubscribeEventsRequest {}).await?.into_inner();

    while let Some(event) = stream.message().await? {
        if event.kind != "TaskScheduled" {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&event.json_payload) else {
            continue;
        };
        let Some(scheduled) = payload.get("TaskScheduled") else {
            continue;
        };
        let assigned_worker = scheduled.get("worker").and_then(|w| w.as_str()).unwrap_or_default();
        if assigned_worker != worker_id {
            continue;
        }
        let Some(task_id) = scheduled.get("task").and_then(|t| t.as_u64()) else {
            continue;
        };
        let params: Vec<Parameter> = scheduled
            .get("params")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();

        let dm = data_manager.clone();
        let mut client = client.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let result = run_task(&dm, &params).await;
            let wall_time_ms = start.elapsed().as_millis() as u64;
            let produced_renamings = if result.is_ok() {
                params
                    .iter()
                    .flat_map(Parameter::flatten_leaves)
                    .filter_map(|p| p.write_renaming.as_ref())
                    .map(|r| r.to_string())
                    .collect()
            } else {
                Vec::new()
            };
            let failure_kind = match &result {
                Ok(()) => runtime_core::FailureKind::Unspecified,
                Err(e) => e.kind(),
            };
            let report = ReportTaskResultRequest {
                task_id,
                success: result.is_ok(),
                produced_renamings,
                wall_time_ms,
                transferred_bytes: 0,
                error_message: result.err().map(|e| e.to_string()).unwrap_or_default(),
                failure_kind: failure_kind_to_proto(failure_kind) as i32,
            };
            if let Err(e) = client.report_task_result(report).await {
                tracing::error!(error = %e, task_id, "failed to report task result");
            }
        });
    }

    Ok(())
}

/// Worker-side fetch→execute→store bracket of spec §4.5/§5: fetches
/// every read-mode leaf parameter, then stores a placeholder value for
/// every write-mode leaf. Actual user-code invocation is transport
/// backend-specific (SSH/NIO/Container/Cloud, per spec §6) and out of
/// scope here — this exercises the Data Manager contract a real
/// backend would run the user's code between.
async fn run_task(data_manager: &DataManager, params: &[Parameter]) -> runtime_core::Result<()> {
    for leaf in params.iter().flat_map(Parameter::flatten_leaves) {
        if leaf.direction.reads() {
            data_manager.fetch_param(leaf, true).await?;
            data_manager.load_param(leaf).await?;
        }
    }

    for leaf in params.iter().flat_map(Parameter::flatten_leaves) {
        if leaf.direction.writes() {
            data_manager.store_param(leaf, DataLocation::Object(Vec::new())).await?;
        }
    }

    Ok(())
}

fn parse_server_addr_arg() -> Option<String> {
    arg_or_env("--server", "RUNTIME_SERVER_ADDR")
}

fn parse_worker_id_arg() -> Option<String> {
    arg_or_env("--worker-id", "RUNTIME_WORKER_ID")
}

fn parse_sandbox_root_arg() -> Option<PathBuf> {
    arg_or_env("--sandbox", "RUNTIME_WORKER_SANDBOX").map(PathBuf::from)
}

fn arg_or_env(flag: &str, env_var: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(v) = args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone()) {
        return Some(v);
    }
    std::env::var(env_var).ok()
}

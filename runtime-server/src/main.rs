use std::sync::Arc;

use runtime_core::config::RuntimeConfig;
use runtime_core::Runtime;
use runtime_server::grpc::proto::task_runtime_server::TaskRuntimeServer;
use runtime_server::grpc::TaskRuntimeService;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config_path = parse_config_path_arg().map(std::path::PathBuf::from);
    let config = RuntimeConfig::load(config_path.as_deref())?;
    let addr = config.bind_addr.parse()?;

    tracing::info!(policy = ?config.scheduler.policy, "starting dispatch loop");
    let runtime = Arc::new(Runtime::start(config));

    tracing::info!("task runtime gRPC server listening on {}", addr);

    let service = TaskRuntimeService { runtime };

    Server::builder()
        .add_service(TaskRuntimeServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}

/// `--config <path>` CLI arg, else `RUNTIME_CONFIG` env var, else no
/// config file (defaults apply) — mirrors the teacher's
/// `parse_database_url` precedence.
fn parse_config_path_arg() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args.windows(2).find(|w| w[0] == "--config").map(|w| w[1].clone()) {
        return Some(path);
    }
    std::env::var("RUNTIME_CONFIG").ok()
}

use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use runtime_core::ids::{AppId, Did, GroupId, Renaming, WorkerId};
use runtime_core::scheduler::WorkerView;
use runtime_core::types::{
    AccessMode as CoreAccessMode, ImplementationCandidate, ParamType as CoreParamType, Parameter,
    ResourceVector, StreamBinding as CoreStreamBinding, TaskSpec,
};
use runtime_core::Runtime;

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("task_runtime.v1");
}

use proto::task_runtime_server::TaskRuntime as TaskRuntimeGrpc;
use proto::*;

pub struct TaskRuntimeService {
    pub runtime: Arc<Runtime>,
}

fn parse_app_id(s: &str) -> Result<AppId, Status> {
    Uuid::parse_str(s)
        .map(AppId)
        .map_err(|e| Status::invalid_argument(format!("invalid app_id: {e}")))
}

fn access_mode_from_proto(mode: i32) -> CoreAccessMode {
    match proto::AccessMode::try_from(mode).unwrap_or(proto::AccessMode::Unspecified) {
        proto::AccessMode::R => CoreAccessMode::R,
        proto::AccessMode::W => CoreAccessMode::W,
        proto::AccessMode::Rw => CoreAccessMode::Rw,
        proto::AccessMode::C => CoreAccessMode::C,
        proto::AccessMode::M => CoreAccessMode::M,
        proto::AccessMode::Unspecified => CoreAccessMode::R,
    }
}

fn param_type_from_proto(t: i32) -> CoreParamType {
    match proto::ParamType::try_from(t).unwrap_or(proto::ParamType::Unspecified) {
        proto::ParamType::File => CoreParamType::File,
        proto::ParamType::Object => CoreParamType::Object,
        proto::ParamType::Psco => CoreParamType::Psco,
        proto::ParamType::ExternalPsco => CoreParamType::ExternalPsco,
        proto::ParamType::BindingObject => CoreParamType::BindingObject,
        proto::ParamType::Collection => CoreParamType::Collection,
        proto::ParamType::Stream => CoreParamType::Stream,
        proto::ParamType::Primitive | proto::ParamType::Unspecified => CoreParamType::Primitive,
    }
}

fn stream_binding_from_proto(b: i32) -> CoreStreamBinding {
    match proto::StreamBinding::try_from(b).unwrap_or(proto::StreamBinding::Unspecified) {
        proto::StreamBinding::Stdin => CoreStreamBinding::Stdin,
        proto::StreamBinding::Stdout => CoreStreamBinding::Stdout,
        proto::StreamBinding::Stderr => CoreStreamBinding::Stderr,
        proto::StreamBinding::None | proto::StreamBinding::Unspecified => CoreStreamBinding::None,
    }
}

fn resource_vector_from_proto(rv: Option<proto::ResourceVector>) -> ResourceVector {
    match rv {
        Some(rv) => ResourceVector {
            cores: rv.cores,
            memory_mb: rv.memory_mb,
            storage_mb: rv.storage_mb,
            accelerators: rv.accelerators,
        },
        None => ResourceVector::default(),
    }
}

fn parameter_from_proto(p: proto::Parameter) -> Parameter {
    let direction = access_mode_from_proto(p.mode);
    let param_type = param_type_from_proto(p.param_type);
    Parameter {
        access: runtime_core::types::Access {
            did: Did(p.did),
            mode: direction,
        },
        direction,
        stream: stream_binding_from_proto(p.stream),
        prefix: p.prefix,
        formal_name: p.formal_name,
        param_type,
        read_renaming: None,
        write_renaming: None,
        size_hint: p.size_hint,
        elements: p.elements.into_iter().map(parameter_from_proto).collect(),
    }
}

/// Wire-to-core conversion for the retry-classification enum (spec §7).
pub fn failure_kind_from_proto(k: i32) -> runtime_core::FailureKind {
    match proto::FailureKind::try_from(k).unwrap_or(proto::FailureKind::Unspecified) {
        proto::FailureKind::Transfer => runtime_core::FailureKind::Transfer,
        proto::FailureKind::WorkerUnreachable => runtime_core::FailureKind::WorkerUnreachable,
        proto::FailureKind::TaskFailure => runtime_core::FailureKind::TaskFailure,
        proto::FailureKind::Timeout => runtime_core::FailureKind::Timeout,
        proto::FailureKind::StreamClose => runtime_core::FailureKind::StreamClose,
        proto::FailureKind::StorageBackend => runtime_core::FailureKind::StorageBackend,
        proto::FailureKind::NoSources => runtime_core::FailureKind::NoSources,
        proto::FailureKind::Submission => runtime_core::FailureKind::Submission,
        proto::FailureKind::UnknownData => runtime_core::FailureKind::UnknownData,
        proto::FailureKind::CorruptState => runtime_core::FailureKind::CorruptState,
        proto::FailureKind::Unspecified => runtime_core::FailureKind::Unspecified,
    }
}

pub fn failure_kind_to_proto(k: runtime_core::FailureKind) -> proto::FailureKind {
    match k {
        runtime_core::FailureKind::Unspecified => proto::FailureKind::Unspecified,
        runtime_core::FailureKind::Transfer => proto::FailureKind::Transfer,
        runtime_core::FailureKind::WorkerUnreachable => proto::FailureKind::WorkerUnreachable,
        runtime_core::FailureKind::TaskFailure => proto::FailureKind::TaskFailure,
        runtime_core::FailureKind::Timeout => proto::FailureKind::Timeout,
        runtime_core::FailureKind::StreamClose => proto::FailureKind::StreamClose,
        runtime_core::FailureKind::StorageBackend => proto::FailureKind::StorageBackend,
        runtime_core::FailureKind::NoSources => proto::FailureKind::NoSources,
        runtime_core::FailureKind::Submission => proto::FailureKind::Submission,
        runtime_core::FailureKind::UnknownData => proto::FailureKind::UnknownData,
        runtime_core::FailureKind::CorruptState => proto::FailureKind::CorruptState,
    }
}

fn implementation_from_proto(i: proto::ImplementationCandidate) -> ImplementationCandidate {
    ImplementationCandidate {
        impl_id: i.impl_id,
        worker_kind: i.worker_kind,
        resources: resource_vector_from_proto(i.resources),
        max_retries: i.max_retries,
        timeout_ms: i.timeout_ms,
    }
}

fn runtime_err(e: runtime_core::RuntimeError) -> Status {
    if e.is_fatal() {
        Status::internal(e.to_string())
    } else if e.retriable() {
        Status::unavailable(e.to_string())
    } else {
        Status::failed_precondition(e.to_string())
    }
}

#[tonic::async_trait]
impl TaskRuntimeGrpc for TaskRuntimeService {
    async fn submit_task(
        &self,
        request: Request<SubmitTaskRequest>,
    ) -> Result<Response<SubmitTaskResponse>, Status> {
        let req = request.into_inner();
        let app = parse_app_id(&req.app_id)?;

        let spec = TaskSpec {
            app,
            group: req.group_id.map(GroupId),
            signature: req.signature,
            implementations: req.implementations.into_iter().map(implementation_from_proto).collect(),
            params: req.params.into_iter().map(parameter_from_proto).collect(),
            priority: req.priority,
        };

        let task = self.runtime.submit(spec).await.map_err(runtime_err)?;
        Ok(Response::new(SubmitTaskResponse { task_id: task.0 }))
    }

    async fn barrier(&self, request: Request<BarrierRequest>) -> Result<Response<BarrierResponse>, Status> {
        let app = parse_app_id(&request.into_inner().app_id)?;
        self.runtime.barrier(app).await.map_err(runtime_err)?;
        Ok(Response::new(BarrierResponse {}))
    }

    async fn barrier_group(
        &self,
        request: Request<BarrierGroupRequest>,
    ) -> Result<Response<BarrierResponse>, Status> {
        let req = request.into_inner();
        let app = parse_app_id(&req.app_id)?;
        self.runtime
            .barrier_group(app, GroupId(req.group_id))
            .await
            .map_err(runtime_err)?;
        Ok(Response::new(BarrierResponse {}))
    }

    async fn open_file(
        &self,
        request: Request<OpenFileRequest>,
    ) -> Result<Response<OpenFileResponse>, Status> {
        let req = request.into_inner();
        let mode = access_mode_from_proto(req.mode);
        let renaming = self.runtime.open_file(Did(req.did), mode).await.map_err(runtime_err)?;
        Ok(Response::new(OpenFileResponse { renaming: renaming.0 }))
    }

    async fn close_file(
        &self,
        request: Request<CloseFileRequest>,
    ) -> Result<Response<CloseFileResponse>, Status> {
        let req = request.into_inner();
        self.runtime.close_file(Renaming(req.renaming)).await.map_err(runtime_err)?;
        Ok(Response::new(CloseFileResponse {}))
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let req = request.into_inner();
        self.runtime.delete_file(Did(req.did)).await.map_err(runtime_err)?;
        Ok(Response::new(DeleteFileResponse {}))
    }

    async fn register_data(
        &self,
        request: Request<RegisterDataRequest>,
    ) -> Result<Response<RegisterDataResponse>, Status> {
        let req = request.into_inner();
        self.runtime.register_data(Did(req.did)).await.map_err(runtime_err)?;
        Ok(Response::new(RegisterDataResponse {}))
    }

    async fn cancel_application(
        &self,
        request: Request<CancelApplicationRequest>,
    ) -> Result<Response<CancelApplicationResponse>, Status> {
        let app = parse_app_id(&request.into_inner().app_id)?;
        self.runtime.cancel_application(app).await.map_err(runtime_err)?;
        Ok(Response::new(CancelApplicationResponse {}))
    }

    async fn report_task_result(
        &self,
        request: Request<ReportTaskResultRequest>,
    ) -> Result<Response<ReportTaskResultResponse>, Status> {
        let req = request.into_inner();
        if !req.error_message.is_empty() {
            tracing::warn!(task_id = req.task_id, error = %req.error_message, "worker reported task failure");
        }
        self.runtime
            .task_completed(
                runtime_core::ids::TaskId(req.task_id),
                req.success,
                req.wall_time_ms,
                req.transferred_bytes,
                failure_kind_from_proto(req.failure_kind),
            )
            .await
            .map_err(runtime_err)?;
        Ok(Response::new(ReportTaskResultResponse {}))
    }

    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        let view = WorkerView {
            id: WorkerId(req.worker_id),
            kind: req.kind,
            total: resource_vector_from_proto(req.total_resources),
            in_use: ResourceVector::default(),
            resident: Default::default(),
            degraded: false,
        };
        self.runtime.worker_added(view).await.map_err(runtime_err)?;
        Ok(Response::new(RegisterWorkerResponse {}))
    }

    type SubscribeEventsStream = tokio_stream::wrappers::ReceiverStream<Result<RuntimeEventProto, Status>>;

    async fn subscribe_events(
        &self,
        _request: Request<SubscribeEventsRequest>,
    ) -> Result<Response<Self::SubscribeEventsStream>, Status> {
        let mut events = self.runtime.subscribe_events();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let kind = format!("{event:?}");
                        let kind = kind.split_once('{').or_else(|| kind.split_once(' ')).map(|(n, _)| n.trim().to_string()).unwrap_or(kind);
                        let json_payload = serde_json::to_string(&event).unwrap_or_default();
                        if tx.send(Ok(RuntimeEventProto { kind, json_payload })).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });

        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

// Copyright 2024-2025 Joblet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::PathsConfig;
use crate::model::JobSpec;
use crate::service::coordinator::ExecutionCoordinator;
use crate::service::logbus::{LogBus, SubscriptionItem};
use crate::service::sampler::MetricsSampler;
use crate::service::store::JobStore;
use joblet_api_grpc::proto::joblet::common::{Empty, ErrorBody, ErrorsBody, ExecutionFailure};
use joblet_api_grpc::proto::joblet::job::v1::job_service_server::JobService as GrpcJobService;
use joblet_api_grpc::proto::joblet::job::v1::{
    delete_all_jobs_response, delete_job_response, get_status_response, job_error,
    list_jobs_response, run_job_response, stop_job_response, DeleteAllJobsRequest,
    DeleteAllJobsResponse, DeleteAllJobsSuccessResponse, DeleteJobRequest, DeleteJobResponse,
    GetStatusRequest, GetStatusResponse, JobError as GrpcJobError, JobList, JobRequest,
    ListJobsRequest, ListJobsResponse, LogEvent, MetricSample, RunJobRequest, RunJobResponse,
    RunJobSuccessResponse, StopJobRequest, StopJobResponse, StreamLogsRequest,
    StreamMetricsRequest,
};
use joblet_common::error::JobletError;
use joblet_common::model::{JobFilter, JobId, NetworkMode};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

pub struct JobGrpcApi {
    pub store: Arc<JobStore>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub log_bus: Arc<LogBus>,
    pub sampler: Arc<MetricsSampler>,
    pub paths: PathsConfig,
}

#[async_trait::async_trait]
impl GrpcJobService for JobGrpcApi {
    async fn run_job(
        &self,
        request: Request<RunJobRequest>,
    ) -> Result<Response<RunJobResponse>, Status> {
        let response = match self.run_job(request.into_inner()).await {
            Ok(job_id) => run_job_response::Result::Success(RunJobSuccessResponse {
                job_id: Some(job_id.into()),
            }),
            Err(error) => run_job_response::Result::Error(error.into()),
        };

        Ok(Response::new(RunJobResponse {
            result: Some(response),
        }))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let response = match self.stop_job(request.into_inner()).await {
            Ok(()) => stop_job_response::Result::Success(Empty {}),
            Err(error) => stop_job_response::Result::Error(error.into()),
        };

        Ok(Response::new(StopJobResponse {
            result: Some(response),
        }))
    }

    async fn get_status(
        &self,
        request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let response = match self.get_status(request.into_inner()).await {
            Ok(job) => get_status_response::Result::Success(job),
            Err(error) => get_status_response::Result::Error(error.into()),
        };

        Ok(Response::new(GetStatusResponse {
            result: Some(response),
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let response = match self.list_jobs(request.into_inner()).await {
            Ok(jobs) => list_jobs_response::Result::Success(JobList { jobs }),
            Err(error) => list_jobs_response::Result::Error(error.into()),
        };

        Ok(Response::new(ListJobsResponse {
            result: Some(response),
        }))
    }

    async fn delete_job(
        &self,
        request: Request<DeleteJobRequest>,
    ) -> Result<Response<DeleteJobResponse>, Status> {
        let response = match self.delete_job(request.into_inner()).await {
            Ok(()) => delete_job_response::Result::Success(Empty {}),
            Err(error) => delete_job_response::Result::Error(error.into()),
        };

        Ok(Response::new(DeleteJobResponse {
            result: Some(response),
        }))
    }

    async fn delete_all_jobs(
        &self,
        _request: Request<DeleteAllJobsRequest>,
    ) -> Result<Response<DeleteAllJobsResponse>, Status> {
        let response = match self.delete_all_jobs().await {
            Ok(deleted) => delete_all_jobs_response::Result::Success(
                DeleteAllJobsSuccessResponse { deleted },
            ),
            Err(error) => delete_all_jobs_response::Result::Error(error.into()),
        };

        Ok(Response::new(DeleteAllJobsResponse {
            result: Some(response),
        }))
    }

    type StreamLogsStream = ReceiverStream<Result<LogEvent, Status>>;

    async fn stream_logs(
        &self,
        request: Request<StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let request = request.into_inner();
        let job_id = parse_job_id(request.job_id).map_err(error_to_status)?;

        // Terminal jobs recovered after a restart only have their on-disk
        // segments; re-register them lazily for replay.
        if self.log_bus.subscribe(&job_id, 0).await.is_err() {
            let job = self
                .store
                .get(&job_id)
                .await
                .map_err(|error| error_to_status(error.into()))?;
            if job.status.is_terminal() {
                self.log_bus
                    .ensure_historic(job_id, self.paths.log_dir(&job_id))
                    .await;
            }
        }

        let mut subscription = self
            .log_bus
            .subscribe(&job_id, request.from_seq)
            .await
            .map_err(|error| error_to_status(error.into()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(item) = subscription.next().await {
                let message = match item {
                    SubscriptionItem::Event(event) => Ok(event.into()),
                    SubscriptionItem::Lagged => {
                        let _ = tx
                            .send(Err(Status::data_loss(
                                "subscriber lagged behind the live stream",
                            )))
                            .await;
                        break;
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type StreamMetricsStream = ReceiverStream<Result<MetricSample, Status>>;

    async fn stream_metrics(
        &self,
        request: Request<StreamMetricsRequest>,
    ) -> Result<Response<Self::StreamMetricsStream>, Status> {
        let request = request.into_inner();
        let job_id = parse_job_id(request.job_id).map_err(error_to_status)?;

        let mut samples = self
            .sampler
            .subscribe(&job_id)
            .await
            .map_err(|error| error_to_status(error.into()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match samples.recv().await {
                    Ok(sample) => {
                        let is_final = sample.is_final;
                        if tx.send(Ok(sample.into())).await.is_err() || is_final {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

impl JobGrpcApi {
    async fn run_job(&self, request: RunJobRequest) -> Result<JobId, GrpcJobError> {
        let job = request
            .job
            .ok_or_else(|| bad_request_error("Missing job request"))?;
        let spec = make_job_spec(job)?;
        let job_id = self.coordinator.submit(spec).await?;
        debug!(job_id = %job_id, "Accepted job");
        Ok(job_id)
    }

    async fn stop_job(&self, request: StopJobRequest) -> Result<(), GrpcJobError> {
        let job_id = parse_job_id(request.job_id)?;
        self.coordinator.stop(&job_id).await?;
        Ok(())
    }

    async fn get_status(
        &self,
        request: GetStatusRequest,
    ) -> Result<joblet_api_grpc::proto::joblet::job::v1::Job, GrpcJobError> {
        let job_id = parse_job_id(request.job_id)?;
        let job = self.store.get(&job_id).await?;
        Ok(job.into())
    }

    async fn list_jobs(
        &self,
        request: ListJobsRequest,
    ) -> Result<Vec<joblet_api_grpc::proto::joblet::job::v1::Job>, GrpcJobError> {
        let filter = match request.filter {
            Some(filter) => {
                let statuses = filter
                    .statuses()
                    .map(Into::into)
                    .collect();
                let workflow_id = filter
                    .workflow_id
                    .map(TryInto::try_into)
                    .transpose()
                    .map_err(bad_request_error)?;
                JobFilter {
                    statuses,
                    workflow_id,
                }
            }
            None => JobFilter::default(),
        };

        Ok(self
            .store
            .list(&filter)
            .await
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn delete_job(&self, request: DeleteJobRequest) -> Result<(), GrpcJobError> {
        let job_id = parse_job_id(request.job_id)?;
        self.store.delete(&job_id).await?;
        self.log_bus.remove(&job_id).await;
        self.sampler.remove(&job_id).await;
        let _ = tokio::fs::remove_dir_all(self.paths.job_dir(&job_id)).await;
        Ok(())
    }

    async fn delete_all_jobs(&self) -> Result<u32, GrpcJobError> {
        let deleted = self.store.delete_all().await?;
        Ok(deleted)
    }
}

fn make_job_spec(request: JobRequest) -> Result<JobSpec, GrpcJobError> {
    if request.command.is_empty() {
        return Err(bad_request_error("Missing command"));
    }
    let network: NetworkMode = request
        .network
        .parse()
        .map_err(bad_request_error)?;
    let limits = request
        .limits
        .clone()
        .unwrap_or_default()
        .try_into()
        .map_err(bad_request_error)?;
    let job_type = request.job_type().into();

    Ok(JobSpec {
        command: request.command,
        args: request.args,
        limits,
        network,
        volumes: request.volumes,
        runtime: if request.runtime.is_empty() {
            None
        } else {
            Some(request.runtime)
        },
        uploads: request.uploads.into_iter().map(Into::into).collect(),
        environment: request.environment.into_iter().collect(),
        secret_environment: request.secret_environment.into_iter().collect(),
        gpu_count: request.gpu_count,
        gpu_memory_mb: request.gpu_memory_mb,
        job_type,
        depends_on: BTreeSet::new(),
        workflow_id: None,
    })
}

fn parse_job_id(
    job_id: Option<joblet_api_grpc::proto::joblet::common::Uuid>,
) -> Result<JobId, GrpcJobError> {
    job_id
        .ok_or_else(|| bad_request_error("Missing job id"))?
        .try_into()
        .map_err(bad_request_error)
}

fn bad_request_error<T>(error: T) -> GrpcJobError
where
    T: Into<String>,
{
    GrpcJobError {
        error: Some(job_error::Error::BadRequest(ErrorsBody {
            errors: vec![error.into()],
        })),
    }
}

impl From<JobletError> for GrpcJobError {
    fn from(value: JobletError) -> Self {
        let error = match &value {
            JobletError::InvalidRequest(details) => {
                job_error::Error::BadRequest(ErrorsBody {
                    errors: vec![details.clone()],
                })
            }
            JobletError::NotFound(details) => job_error::Error::NotFound(ErrorBody {
                error: details.clone(),
            }),
            JobletError::Conflict(details) => job_error::Error::Conflict(ErrorBody {
                error: details.clone(),
            }),
            JobletError::ResourceExhausted(details) => {
                job_error::Error::ResourceExhausted(ErrorBody {
                    error: details.clone(),
                })
            }
            JobletError::Timeout { .. } => job_error::Error::Timeout(ErrorBody {
                error: value.to_string(),
            }),
            JobletError::IsolationFailed { step, details }
            | JobletError::NetworkFailed { step, details }
            | JobletError::ProcessFailed { step, details } => {
                job_error::Error::ExecutionFailed(ExecutionFailure {
                    step: step.clone(),
                    kind: value.kind().to_string(),
                    details: details.clone(),
                })
            }
            JobletError::PersistDegraded(_)
            | JobletError::PersistFailed(_)
            | JobletError::Internal(_) => job_error::Error::InternalError(ErrorBody {
                error: value.to_string(),
            }),
        };
        GrpcJobError { error: Some(error) }
    }
}

fn error_to_status(error: GrpcJobError) -> Status {
    match error.error {
        Some(job_error::Error::BadRequest(ErrorsBody { errors })) => {
            Status::invalid_argument(format!("Bad Request: {errors:?}"))
        }
        Some(job_error::Error::NotFound(ErrorBody { error })) => Status::not_found(error),
        Some(job_error::Error::Conflict(ErrorBody { error })) => {
            Status::failed_precondition(error)
        }
        Some(job_error::Error::ResourceExhausted(ErrorBody { error })) => {
            Status::resource_exhausted(error)
        }
        Some(job_error::Error::Timeout(ErrorBody { error })) => {
            Status::deadline_exceeded(error)
        }
        Some(job_error::Error::ExecutionFailed(failure)) => Status::internal(format!(
            "{} in step '{}': {}",
            failure.kind, failure.step, failure.details
        )),
        Some(job_error::Error::InternalError(ErrorBody { error })) => Status::internal(error),
        None => Status::unknown("Unknown error"),
    }
}

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

use crate::backend::{BackendError, StorageBackend};
use joblet_api_grpc::proto::joblet::common::{Empty, ErrorBody, ErrorsBody};
use joblet_api_grpc::proto::joblet::persist::v1::persist_service_server::PersistService as GrpcPersistService;
use joblet_api_grpc::proto::joblet::persist::v1::{
    append_log_response, append_metric_response, delete_job_response, list_jobs_response,
    persist_error, put_job_response, AppendLogRequest, AppendLogResponse, AppendMetricRequest,
    AppendMetricResponse, DeleteJobRequest, DeleteJobResponse, ListJobsRequest,
    ListJobsResponse, ListJobsSuccessResponse, PersistError as GrpcPersistError, PutJobRequest,
    PutJobResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct PersistGrpcApi {
    pub backend: Arc<dyn StorageBackend>,
}

#[async_trait::async_trait]
impl GrpcPersistService for PersistGrpcApi {
    async fn put_job(
        &self,
        request: Request<PutJobRequest>,
    ) -> Result<Response<PutJobResponse>, Status> {
        let request = request.into_inner();
        let response = match request.job {
            Some(job) => match self.backend.put_job(&job).await {
                Ok(()) => put_job_response::Result::Success(Empty {}),
                Err(error) => put_job_response::Result::Error(error.into()),
            },
            None => put_job_response::Result::Error(bad_request_error("Missing job")),
        };

        Ok(Response::new(PutJobResponse {
            result: Some(response),
        }))
    }

    async fn delete_job(
        &self,
        request: Request<DeleteJobRequest>,
    ) -> Result<Response<DeleteJobResponse>, Status> {
        let request = request.into_inner();
        let response = match request.job_id {
            Some(job_id) => match self.backend.delete_job(&job_id.value).await {
                Ok(()) => delete_job_response::Result::Success(Empty {}),
                Err(error) => delete_job_response::Result::Error(error.into()),
            },
            None => delete_job_response::Result::Error(bad_request_error("Missing job id")),
        };

        Ok(Response::new(DeleteJobResponse {
            result: Some(response),
        }))
    }

    async fn append_log(
        &self,
        request: Request<AppendLogRequest>,
    ) -> Result<Response<AppendLogResponse>, Status> {
        let request = request.into_inner();
        let response = match request.event {
            Some(event) => match self.backend.append_log(&event).await {
                Ok(()) => append_log_response::Result::Success(Empty {}),
                Err(error) => append_log_response::Result::Error(error.into()),
            },
            None => append_log_response::Result::Error(bad_request_error("Missing event")),
        };

        Ok(Response::new(AppendLogResponse {
            result: Some(response),
        }))
    }

    async fn append_metric(
        &self,
        request: Request<AppendMetricRequest>,
    ) -> Result<Response<AppendMetricResponse>, Status> {
        let request = request.into_inner();
        let response = match request.sample {
            Some(sample) => match self.backend.append_metric(&sample).await {
                Ok(()) => append_metric_response::Result::Success(Empty {}),
                Err(error) => append_metric_response::Result::Error(error.into()),
            },
            None => append_metric_response::Result::Error(bad_request_error("Missing sample")),
        };

        Ok(Response::new(AppendMetricResponse {
            result: Some(response),
        }))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let response = match self.backend.list_jobs().await {
            Ok(jobs) => {
                list_jobs_response::Result::Success(ListJobsSuccessResponse { jobs })
            }
            Err(error) => list_jobs_response::Result::Error(error.into()),
        };

        Ok(Response::new(ListJobsResponse {
            result: Some(response),
        }))
    }
}

fn bad_request_error<T>(error: T) -> GrpcPersistError
where
    T: Into<String>,
{
    GrpcPersistError {
        error: Some(persist_error::Error::BadRequest(ErrorsBody {
            errors: vec![error.into()],
        })),
    }
}

impl From<BackendError> for GrpcPersistError {
    fn from(value: BackendError) -> Self {
        let error = match &value {
            BackendError::BadRecord(details) => persist_error::Error::BadRequest(ErrorsBody {
                errors: vec![details.clone()],
            }),
            BackendError::Unavailable(details) => {
                persist_error::Error::BackendUnavailable(ErrorBody {
                    error: details.clone(),
                })
            }
            BackendError::Internal(details) => persist_error::Error::InternalError(ErrorBody {
                error: details.clone(),
            }),
        };
        GrpcPersistError { error: Some(error) }
    }
}

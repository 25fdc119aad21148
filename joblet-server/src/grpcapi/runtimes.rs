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

use crate::service::coordinator::ExecutionCoordinator;
use crate::service::runtimes::{RuntimeInfo, RuntimeService};
use joblet_api_grpc::proto::joblet::common::{Empty, ErrorBody, ErrorsBody};
use joblet_api_grpc::proto::joblet::runtime::v1::runtime_service_server::RuntimeService as GrpcRuntimeService;
use joblet_api_grpc::proto::joblet::runtime::v1::{
    install_runtime_response, list_runtimes_response, remove_runtime_response, runtime_error,
    InstallRuntimeRequest, InstallRuntimeResponse, InstallRuntimeSuccessResponse,
    ListRuntimesRequest, ListRuntimesResponse, RemoveRuntimeRequest, RemoveRuntimeResponse,
    Runtime, RuntimeError as GrpcRuntimeError, RuntimeList, RuntimeSource,
};
use joblet_common::error::JobletError;
use joblet_common::model::JobId;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct RuntimeGrpcApi {
    pub runtimes: Arc<dyn RuntimeService>,
    pub coordinator: Arc<ExecutionCoordinator>,
}

#[async_trait::async_trait]
impl GrpcRuntimeService for RuntimeGrpcApi {
    async fn install_runtime(
        &self,
        request: Request<InstallRuntimeRequest>,
    ) -> Result<Response<InstallRuntimeResponse>, Status> {
        let response = match self.install_runtime(request.into_inner()).await {
            Ok(build_job_id) => {
                install_runtime_response::Result::Success(InstallRuntimeSuccessResponse {
                    build_job_id: Some(build_job_id.into()),
                })
            }
            Err(error) => install_runtime_response::Result::Error(error),
        };

        Ok(Response::new(InstallRuntimeResponse {
            result: Some(response),
        }))
    }

    async fn remove_runtime(
        &self,
        request: Request<RemoveRuntimeRequest>,
    ) -> Result<Response<RemoveRuntimeResponse>, Status> {
        let request = request.into_inner();
        let response = match self.runtimes.remove(&request.name).await {
            Ok(()) => remove_runtime_response::Result::Success(Empty {}),
            Err(error) => remove_runtime_response::Result::Error(error.into()),
        };

        Ok(Response::new(RemoveRuntimeResponse {
            result: Some(response),
        }))
    }

    async fn list_runtimes(
        &self,
        request: Request<ListRuntimesRequest>,
    ) -> Result<Response<ListRuntimesResponse>, Status> {
        let request = request.into_inner();
        let response = match request.source() {
            RuntimeSource::Local => match self.runtimes.list_local().await {
                Ok(runtimes) => list_runtimes_response::Result::Success(RuntimeList {
                    runtimes: runtimes.into_iter().map(make_runtime).collect(),
                }),
                Err(error) => list_runtimes_response::Result::Error(error.into()),
            },
            // Remote discovery goes through the installer repository
            // catalog, which lives outside the execution core.
            RuntimeSource::Github => list_runtimes_response::Result::Error(GrpcRuntimeError {
                error: Some(runtime_error::Error::BadRequest(ErrorsBody {
                    errors: vec![
                        "GitHub runtime listing is not served by this node".to_string()
                    ],
                })),
            }),
        };

        Ok(Response::new(ListRuntimesResponse {
            result: Some(response),
        }))
    }
}

impl RuntimeGrpcApi {
    async fn install_runtime(
        &self,
        request: InstallRuntimeRequest,
    ) -> Result<JobId, GrpcRuntimeError> {
        let spec = self
            .runtimes
            .install_spec(&request.name, &request.github_repo, request.force)
            .await?;
        let build_job_id = self.coordinator.submit(spec).await?;
        Ok(build_job_id)
    }
}

fn make_runtime(info: RuntimeInfo) -> Runtime {
    Runtime {
        name: info.name,
        path: info.path.display().to_string(),
        environment: info.environment.into_iter().collect(),
        size_bytes: info.size_bytes,
    }
}

impl From<JobletError> for GrpcRuntimeError {
    fn from(value: JobletError) -> Self {
        let error = match &value {
            JobletError::InvalidRequest(details) => runtime_error::Error::BadRequest(ErrorsBody {
                errors: vec![details.clone()],
            }),
            JobletError::NotFound(details) => runtime_error::Error::NotFound(ErrorBody {
                error: details.clone(),
            }),
            JobletError::Conflict(details) => runtime_error::Error::AlreadyExists(ErrorBody {
                error: details.clone(),
            }),
            _ => runtime_error::Error::InternalError(ErrorBody {
                error: value.to_string(),
            }),
        };
        GrpcRuntimeError { error: Some(error) }
    }
}

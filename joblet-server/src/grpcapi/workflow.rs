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

use crate::service::workflow::{WorkflowEngine, WorkflowRunStatus, WorkflowView};
use joblet_api_grpc::proto::joblet::common::{ErrorBody, ErrorsBody};
use joblet_api_grpc::proto::joblet::workflow::v1::workflow_service_server::WorkflowService as GrpcWorkflowService;
use joblet_api_grpc::proto::joblet::workflow::v1::{
    get_workflow_response, list_workflows_response, run_workflow_response, workflow_error,
    GetWorkflowRequest, GetWorkflowResponse, ListWorkflowsRequest, ListWorkflowsResponse,
    RunWorkflowRequest, RunWorkflowResponse, RunWorkflowSuccessResponse, Workflow,
    WorkflowError as GrpcWorkflowError, WorkflowList, WorkflowMember, WorkflowStatus,
};
use joblet_common::error::JobletError;
use joblet_common::model::{timestamp_millis, WorkflowId};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct WorkflowGrpcApi {
    pub workflows: Arc<WorkflowEngine>,
}

#[async_trait::async_trait]
impl GrpcWorkflowService for WorkflowGrpcApi {
    async fn run_workflow(
        &self,
        request: Request<RunWorkflowRequest>,
    ) -> Result<Response<RunWorkflowResponse>, Status> {
        let response = match self.run_workflow(request.into_inner()).await {
            Ok(workflow_id) => {
                run_workflow_response::Result::Success(RunWorkflowSuccessResponse {
                    workflow_id: Some(workflow_id.into()),
                })
            }
            Err(error) => run_workflow_response::Result::Error(error.into()),
        };

        Ok(Response::new(RunWorkflowResponse {
            result: Some(response),
        }))
    }

    async fn get_workflow(
        &self,
        request: Request<GetWorkflowRequest>,
    ) -> Result<Response<GetWorkflowResponse>, Status> {
        let response = match self.get_workflow(request.into_inner()).await {
            Ok(workflow) => get_workflow_response::Result::Success(workflow),
            Err(error) => get_workflow_response::Result::Error(error.into()),
        };

        Ok(Response::new(GetWorkflowResponse {
            result: Some(response),
        }))
    }

    async fn list_workflows(
        &self,
        _request: Request<ListWorkflowsRequest>,
    ) -> Result<Response<ListWorkflowsResponse>, Status> {
        let workflows = self
            .workflows
            .list_workflows()
            .await
            .into_iter()
            .map(make_workflow)
            .collect();

        Ok(Response::new(ListWorkflowsResponse {
            result: Some(list_workflows_response::Result::Success(WorkflowList {
                workflows,
            })),
        }))
    }
}

impl WorkflowGrpcApi {
    async fn run_workflow(
        &self,
        request: RunWorkflowRequest,
    ) -> Result<WorkflowId, GrpcWorkflowError> {
        if request.yaml.is_empty() {
            return Err(bad_request_error("Missing workflow YAML"));
        }
        let workflow_name = if request.workflow_name.is_empty() {
            None
        } else {
            Some(request.workflow_name.as_str())
        };

        let workflow_id = self
            .workflows
            .run_workflow(&request.yaml, workflow_name, request.create_missing_volumes)
            .await?;
        Ok(workflow_id)
    }

    async fn get_workflow(
        &self,
        request: GetWorkflowRequest,
    ) -> Result<Workflow, GrpcWorkflowError> {
        let workflow_id: WorkflowId = request
            .workflow_id
            .ok_or_else(|| bad_request_error("Missing workflow id"))?
            .try_into()
            .map_err(bad_request_error)?;

        let view = self.workflows.get_workflow(&workflow_id).await?;
        Ok(make_workflow(view))
    }
}

fn make_workflow(view: WorkflowView) -> Workflow {
    let status = match view.status {
        WorkflowRunStatus::Pending => WorkflowStatus::Pending,
        WorkflowRunStatus::Running => WorkflowStatus::Running,
        WorkflowRunStatus::Completed => WorkflowStatus::Completed,
        WorkflowRunStatus::Failed => WorkflowStatus::Failed,
    };
    Workflow {
        id: Some(view.id.into()),
        name: view.name,
        status: status as i32,
        members: view
            .members
            .into_iter()
            .map(|member| WorkflowMember {
                name: member.name,
                job_id: Some(member.job_id.into()),
                status: joblet_api_grpc::proto::joblet::job::v1::JobStatus::from(member.status)
                    as i32,
                dependencies: member.dependencies,
            })
            .collect(),
        started_at: timestamp_millis(&view.started_at),
        finished_at: timestamp_millis(&view.finished_at),
    }
}

fn bad_request_error<T>(error: T) -> GrpcWorkflowError
where
    T: Into<String>,
{
    GrpcWorkflowError {
        error: Some(workflow_error::Error::BadRequest(ErrorsBody {
            errors: vec![error.into()],
        })),
    }
}

impl From<JobletError> for GrpcWorkflowError {
    fn from(value: JobletError) -> Self {
        let error = match &value {
            JobletError::InvalidRequest(details) => {
                workflow_error::Error::BadRequest(ErrorsBody {
                    errors: vec![details.clone()],
                })
            }
            JobletError::NotFound(details) => workflow_error::Error::NotFound(ErrorBody {
                error: details.clone(),
            }),
            JobletError::Conflict(details) => workflow_error::Error::Conflict(ErrorBody {
                error: details.clone(),
            }),
            _ => workflow_error::Error::InternalError(ErrorBody {
                error: value.to_string(),
            }),
        };
        GrpcWorkflowError { error: Some(error) }
    }
}

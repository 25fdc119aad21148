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

use crate::service::volume::VolumeService;
use joblet_api_grpc::proto::joblet::common::{Empty, ErrorBody, ErrorsBody};
use joblet_api_grpc::proto::joblet::volume::v1::volume_service_server::VolumeService as GrpcVolumeService;
use joblet_api_grpc::proto::joblet::volume::v1::{
    create_volume_response, list_volumes_response, remove_volume_response, CreateVolumeRequest,
    CreateVolumeResponse, ListVolumesRequest, ListVolumesResponse, RemoveVolumeRequest,
    RemoveVolumeResponse, Volume, VolumeError as GrpcVolumeError, VolumeList, VolumeType,
    volume_error,
};
use joblet_common::error::JobletError;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct VolumeGrpcApi {
    pub volumes: Arc<dyn VolumeService>,
}

#[async_trait::async_trait]
impl GrpcVolumeService for VolumeGrpcApi {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let response = match self.create_volume(request.into_inner()).await {
            Ok(volume) => create_volume_response::Result::Success(volume),
            Err(error) => create_volume_response::Result::Error(error),
        };

        Ok(Response::new(CreateVolumeResponse {
            result: Some(response),
        }))
    }

    async fn remove_volume(
        &self,
        request: Request<RemoveVolumeRequest>,
    ) -> Result<Response<RemoveVolumeResponse>, Status> {
        let request = request.into_inner();
        let response = match self.volumes.remove(&request.name).await {
            Ok(()) => remove_volume_response::Result::Success(Empty {}),
            Err(error) => remove_volume_response::Result::Error(error.into()),
        };

        Ok(Response::new(RemoveVolumeResponse {
            result: Some(response),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self
            .volumes
            .list()
            .await
            .into_iter()
            .map(Into::into)
            .collect();

        Ok(Response::new(ListVolumesResponse {
            result: Some(list_volumes_response::Result::Success(VolumeList {
                volumes,
            })),
        }))
    }
}

impl VolumeGrpcApi {
    async fn create_volume(
        &self,
        request: CreateVolumeRequest,
    ) -> Result<Volume, GrpcVolumeError> {
        let volume_type = match request.volume_type() {
            VolumeType::Filesystem => joblet_common::model::VolumeType::Filesystem,
            VolumeType::Memory => joblet_common::model::VolumeType::Memory,
        };
        if request.size_bytes == 0 {
            return Err(GrpcVolumeError {
                error: Some(volume_error::Error::BadRequest(ErrorsBody {
                    errors: vec!["Volume size must be positive".to_string()],
                })),
            });
        }

        let volume = self
            .volumes
            .create(&request.name, request.size_bytes, volume_type)
            .await?;
        Ok(volume.into())
    }
}

impl From<JobletError> for GrpcVolumeError {
    fn from(value: JobletError) -> Self {
        let error = match &value {
            JobletError::InvalidRequest(details) => volume_error::Error::BadRequest(ErrorsBody {
                errors: vec![details.clone()],
            }),
            JobletError::NotFound(details) => volume_error::Error::NotFound(ErrorBody {
                error: details.clone(),
            }),
            JobletError::Conflict(details) => {
                if details.contains("already exists") {
                    volume_error::Error::AlreadyExists(ErrorBody {
                        error: details.clone(),
                    })
                } else {
                    volume_error::Error::Conflict(ErrorBody {
                        error: details.clone(),
                    })
                }
            }
            _ => volume_error::Error::InternalError(ErrorBody {
                error: value.to_string(),
            }),
        };
        GrpcVolumeError { error: Some(error) }
    }
}

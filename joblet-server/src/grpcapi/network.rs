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

use crate::service::network::{NetworkInfo, NetworkService};
use joblet_api_grpc::proto::joblet::common::{Empty, ErrorBody, ErrorsBody};
use joblet_api_grpc::proto::joblet::network::v1::network_service_server::NetworkService as GrpcNetworkService;
use joblet_api_grpc::proto::joblet::network::v1::{
    create_network_response, list_networks_response, network_error, remove_network_response,
    CreateNetworkRequest, CreateNetworkResponse, ListNetworksRequest, ListNetworksResponse,
    Network, NetworkError as GrpcNetworkError, NetworkList, RemoveNetworkRequest,
    RemoveNetworkResponse,
};
use joblet_common::error::JobletError;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct NetworkGrpcApi {
    pub network: Arc<dyn NetworkService>,
}

#[async_trait::async_trait]
impl GrpcNetworkService for NetworkGrpcApi {
    async fn create_network(
        &self,
        request: Request<CreateNetworkRequest>,
    ) -> Result<Response<CreateNetworkResponse>, Status> {
        let request = request.into_inner();
        let response = match self
            .network
            .create_network(&request.name, &request.cidr)
            .await
        {
            Ok(info) => create_network_response::Result::Success(make_network(info)),
            Err(error) => create_network_response::Result::Error(error.into()),
        };

        Ok(Response::new(CreateNetworkResponse {
            result: Some(response),
        }))
    }

    async fn remove_network(
        &self,
        request: Request<RemoveNetworkRequest>,
    ) -> Result<Response<RemoveNetworkResponse>, Status> {
        let request = request.into_inner();
        let response = match self.network.remove_network(&request.name).await {
            Ok(()) => remove_network_response::Result::Success(Empty {}),
            Err(error) => remove_network_response::Result::Error(error.into()),
        };

        Ok(Response::new(RemoveNetworkResponse {
            result: Some(response),
        }))
    }

    async fn list_networks(
        &self,
        _request: Request<ListNetworksRequest>,
    ) -> Result<Response<ListNetworksResponse>, Status> {
        let networks = self
            .network
            .list_networks()
            .await
            .into_iter()
            .map(make_network)
            .collect();

        Ok(Response::new(ListNetworksResponse {
            result: Some(list_networks_response::Result::Success(NetworkList {
                networks,
            })),
        }))
    }
}

fn make_network(info: NetworkInfo) -> Network {
    Network {
        name: info.name,
        cidr: info.cidr,
        gateway_ip: info.gateway.to_string(),
        bridge_interface: info.bridge,
        allocated: info.allocated,
        capacity: info.capacity,
    }
}

impl From<JobletError> for GrpcNetworkError {
    fn from(value: JobletError) -> Self {
        let error = match &value {
            JobletError::InvalidRequest(details) => network_error::Error::BadRequest(ErrorsBody {
                errors: vec![details.clone()],
            }),
            JobletError::NotFound(details) => network_error::Error::NotFound(ErrorBody {
                error: details.clone(),
            }),
            JobletError::Conflict(details) => {
                if details.contains("already exists") {
                    network_error::Error::AlreadyExists(ErrorBody {
                        error: details.clone(),
                    })
                } else {
                    network_error::Error::Conflict(ErrorBody {
                        error: details.clone(),
                    })
                }
            }
            _ => network_error::Error::InternalError(ErrorBody {
                error: value.to_string(),
            }),
        };
        GrpcNetworkError { error: Some(error) }
    }
}

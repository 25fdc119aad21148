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

use crate::bootstrap::Services;
use crate::config::SecurityConfig;
use crate::grpcapi::job::JobGrpcApi;
use crate::grpcapi::monitor::MonitorGrpcApi;
use crate::grpcapi::network::NetworkGrpcApi;
use crate::grpcapi::runtimes::RuntimeGrpcApi;
use crate::grpcapi::volume::VolumeGrpcApi;
use crate::grpcapi::workflow::WorkflowGrpcApi;
use joblet_api_grpc::proto::joblet::job::v1::job_service_server::JobServiceServer;
use joblet_api_grpc::proto::joblet::monitor::v1::monitor_service_server::MonitorServiceServer;
use joblet_api_grpc::proto::joblet::network::v1::network_service_server::NetworkServiceServer;
use joblet_api_grpc::proto::joblet::runtime::v1::runtime_service_server::RuntimeServiceServer;
use joblet_api_grpc::proto::joblet::volume::v1::volume_service_server::VolumeServiceServer;
use joblet_api_grpc::proto::joblet::workflow::v1::workflow_service_server::WorkflowServiceServer;
use std::net::SocketAddr;
use tokio::task::JoinSet;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

mod job;
mod monitor;
mod network;
mod runtimes;
mod volume;
mod workflow;

pub async fn start_grpc_server(
    addr: SocketAddr,
    security: &SecurityConfig,
    paths: crate::config::PathsConfig,
    services: &Services,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
) -> Result<(), anyhow::Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<JobServiceServer<JobGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<WorkflowServiceServer<WorkflowGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<VolumeServiceServer<VolumeGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<NetworkServiceServer<NetworkGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<RuntimeServiceServer<RuntimeGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<MonitorServiceServer<MonitorGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(joblet_api_grpc::proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let mut builder = Server::builder();
    if security.is_enabled() {
        let identity = Identity::from_pem(&security.server_cert_pem, &security.server_key_pem);
        let tls = ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(Certificate::from_pem(&security.ca_cert_pem))
            .client_auth_optional(false);
        builder = builder.tls_config(tls)?;
        info!("gRPC listener requires mutual TLS");
    }

    let router = builder
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(JobServiceServer::new(JobGrpcApi {
            store: services.store.clone(),
            coordinator: services.coordinator.clone(),
            log_bus: services.log_bus.clone(),
            sampler: services.sampler.clone(),
            paths: paths.clone(),
        }))
        .add_service(WorkflowServiceServer::new(WorkflowGrpcApi {
            workflows: services.workflows.clone(),
        }))
        .add_service(VolumeServiceServer::new(VolumeGrpcApi {
            volumes: services.volumes.clone(),
        }))
        .add_service(NetworkServiceServer::new(NetworkGrpcApi {
            network: services.network.clone(),
        }))
        .add_service(RuntimeServiceServer::new(RuntimeGrpcApi {
            runtimes: services.runtimes.clone(),
            coordinator: services.coordinator.clone(),
        }))
        .add_service(MonitorServiceServer::new(MonitorGrpcApi {
            store: services.store.clone(),
            gpu: services.gpu.clone(),
            network: services.network.clone(),
            volumes: services.volumes.clone(),
            persistence: services.persistence.clone(),
            started_at: services.started_at,
        }));

    join_set.spawn(async move {
        router.serve(addr).await?;
        Ok(())
    });

    Ok(())
}

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

//! The persistence subprocess. The Joblet server runs as root with
//! CAP_SYS_ADMIN; this process holds the storage credentials instead and
//! receives every state mutation over a Unix-domain gRPC socket.

pub mod backend;
pub mod config;
pub mod grpcapi;

use crate::backend::make_backend;
use crate::config::JobletPersistConfig;
use anyhow::{anyhow, Context};
use joblet_api_grpc::proto::joblet::persist::v1::persist_service_server::PersistServiceServer;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

#[cfg(test)]
test_r::enable!();

pub async fn run(config: JobletPersistConfig) -> Result<(), anyhow::Error> {
    let backend = make_backend(&config)
        .await
        .map_err(|err| anyhow!(err).context("Backend initialization"))?;

    if let Some(parent) = config.socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Socket directory")?;
    }
    // A stale socket from a crashed predecessor would fail the bind.
    match tokio::fs::remove_file(&config.socket_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(anyhow!(err).context("Stale socket removal")),
    }

    let listener = tokio::net::UnixListener::bind(&config.socket_path)
        .context("Socket bind")?;
    info!(
        "Persistence subprocess listening on {}",
        config.socket_path.display()
    );

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<PersistServiceServer<grpcapi::PersistGrpcApi>>()
        .await;

    Server::builder()
        .add_service(health_service)
        .add_service(PersistServiceServer::new(grpcapi::PersistGrpcApi {
            backend,
        }))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await
        .context("gRPC server failed")?;

    Ok(())
}

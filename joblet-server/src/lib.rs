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

pub mod bootstrap;
pub mod config;
pub mod grpcapi;
pub mod init;
pub mod metrics;
pub mod model;
pub mod service;

use crate::bootstrap::Services;
use crate::config::JobletConfig;
use anyhow::anyhow;
use joblet_common::SafeDisplay;
use std::net::SocketAddr;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
test_r::enable!();

pub struct RunDetails {
    pub grpc_port: u16,
}

pub struct JobletServer {
    config: JobletConfig,
    services: Services,
    cancellation: CancellationToken,
}

impl JobletServer {
    pub async fn new(config: JobletConfig) -> Result<Self, anyhow::Error> {
        debug!("Initializing joblet server");
        debug!("Configuration:\n{}", config.to_safe_string());

        let cancellation = CancellationToken::new();
        let services = Services::new(&config, cancellation.clone())
            .await
            .map_err(|err| anyhow!(err).context("Service initialization"))?;

        Ok(Self {
            config,
            services,
            cancellation,
        })
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let addr: SocketAddr = format!("{}:{}", self.config.address, self.config.grpc_port)
            .parse()
            .map_err(|err| anyhow!("Invalid listen address: {err}"))?;

        grpcapi::start_grpc_server(
            addr,
            &self.config.security,
            self.config.paths.clone(),
            &self.services,
            join_set,
        )
        .await
        .map_err(|err| anyhow!(err).context("gRPC server failed"))?;

        info!("Started joblet server on {addr}");

        Ok(RunDetails {
            grpc_port: self.config.grpc_port,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }
}

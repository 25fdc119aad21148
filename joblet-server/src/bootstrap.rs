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

use crate::config::JobletConfig;
use crate::service::coordinator::{ExecutionCoordinator, JobLauncher};
use crate::service::environment::LocalEnvironmentService;
use crate::service::gpu::{GpuAllocator, StaticGpuAllocator};
use crate::service::isolation::LinuxIsolationService;
use crate::service::logbus::LogBus;
use crate::service::network::{LinuxNetworkService, NetworkService};
use crate::service::persist::{
    DisabledPersistence, PersistenceClient, SubprocessPersistence,
};
use crate::service::process::LinuxProcessService;
use crate::service::runtimes::{LocalRuntimeService, RuntimeService};
use crate::service::sampler::MetricsSampler;
use crate::service::store::JobStore;
use crate::service::volume::{LocalVolumeService, VolumeService};
use crate::service::workflow::WorkflowEngine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Every long-lived component, constructed once and passed by reference
/// into the gRPC layer. No ambient globals.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<JobStore>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub log_bus: Arc<LogBus>,
    pub sampler: Arc<MetricsSampler>,
    pub network: Arc<dyn NetworkService>,
    pub gpu: Arc<dyn GpuAllocator>,
    pub volumes: Arc<dyn VolumeService>,
    pub runtimes: Arc<dyn RuntimeService>,
    pub workflows: Arc<WorkflowEngine>,
    pub persistence: Arc<dyn PersistenceClient>,
    pub started_at: DateTime<Utc>,
}

impl Services {
    pub async fn new(
        config: &JobletConfig,
        cancellation: CancellationToken,
    ) -> Result<Self, String> {
        let persistence: Arc<dyn PersistenceClient> = if config.persistence.enabled {
            SubprocessPersistence::start(
                config.persistence.clone(),
                config.timeouts.persist_rpc,
                cancellation.clone(),
            )
        } else {
            Arc::new(DisabledPersistence)
        };

        let store = Arc::new(JobStore::new(persistence.clone()));
        if config.persistence.enabled {
            match store.recover().await {
                Ok(count) => info!("State recovery loaded {count} job(s)"),
                Err(err) => info!("State recovery skipped: {err}"),
            }
        }

        let log_bus = Arc::new(LogBus::new(config.log_bus.clone(), persistence.clone()));
        let sampler = Arc::new(MetricsSampler::new(
            config.sampler.clone(),
            config.timeouts.cgroup_io,
            persistence.clone(),
        ));

        let volumes: Arc<dyn VolumeService> = Arc::new(
            LocalVolumeService::start(config.paths.volumes_dir.clone())
                .await
                .map_err(|err| err.to_string())?,
        );
        let runtimes: Arc<dyn RuntimeService> = Arc::new(LocalRuntimeService::new(
            config.paths.runtimes_dir.clone(),
        ));

        let isolation = Arc::new(
            LinuxIsolationService::start(
                config.paths.clone(),
                volumes.clone(),
                config.timeouts.cgroup_io,
            )
            .await
            .map_err(|err| err.to_string())?,
        );
        let environment = Arc::new(LocalEnvironmentService::new(
            config.paths.runtimes_dir.clone(),
        ));
        let network: Arc<dyn NetworkService> = Arc::new(
            LinuxNetworkService::start(&config.network, config.timeouts.external_command)
                .await
                .map_err(|err| err.to_string())?,
        );
        let gpu: Arc<dyn GpuAllocator> = Arc::new(if config.gpu.enabled {
            StaticGpuAllocator::probe(
                &config.gpu.probe_command,
                config.timeouts.external_command,
            )
            .await
        } else {
            StaticGpuAllocator::disabled()
        });
        let process = Arc::new(LinuxProcessService::new(
            log_bus.clone(),
            config.timeouts.cgroup_io,
        ));

        let coordinator = ExecutionCoordinator::new(
            store.clone(),
            isolation,
            environment,
            process,
            network.clone(),
            gpu.clone(),
            volumes.clone(),
            log_bus.clone(),
            sampler.clone(),
            config.timeouts.clone(),
        );

        let launcher: Arc<dyn JobLauncher> = Arc::new(coordinator.clone());
        let workflows = Arc::new(WorkflowEngine::new(
            store.clone(),
            launcher,
            volumes.clone(),
        ));

        Ok(Self {
            store,
            coordinator,
            log_bus,
            sampler,
            network,
            gpu,
            volumes,
            runtimes,
            workflows,
            persistence,
            started_at: Utc::now(),
        })
    }
}

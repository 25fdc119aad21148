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

use crate::service::gpu::GpuAllocator;
use crate::service::network::NetworkService;
use crate::service::persist::PersistenceClient;
use crate::service::store::JobStore;
use crate::service::volume::VolumeService;
use chrono::{DateTime, Utc};
use joblet_api_grpc::proto::joblet::monitor::v1::monitor_service_server::MonitorService as GrpcMonitorService;
use joblet_api_grpc::proto::joblet::monitor::v1::{
    GpuStatus, MonitorStatusRequest, MonitorStatusResponse, SystemSnapshot,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct MonitorGrpcApi {
    pub store: Arc<JobStore>,
    pub gpu: Arc<dyn GpuAllocator>,
    pub network: Arc<dyn NetworkService>,
    pub volumes: Arc<dyn VolumeService>,
    pub persistence: Arc<dyn PersistenceClient>,
    pub started_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl GrpcMonitorService for MonitorGrpcApi {
    async fn monitor_status(
        &self,
        _request: Request<MonitorStatusRequest>,
    ) -> Result<Response<MonitorStatusResponse>, Status> {
        let (jobs_total, jobs_running, jobs_pending) = self.store.counts().await;
        let gpus = self
            .gpu
            .snapshot()
            .await
            .into_iter()
            .map(|device| GpuStatus {
                index: device.index,
                memory_total_mb: device.memory_total_mb,
                memory_free_mb: device.memory_free_mb,
                owner_job_id: device.owner.map(Into::into),
            })
            .collect();

        let snapshot = SystemSnapshot {
            jobs_total,
            jobs_running,
            jobs_pending,
            networks: self.network.list_networks().await.len() as u32,
            volumes: self.volumes.list().await.len() as u32,
            gpus,
            persistence_degraded: self.persistence.is_degraded(),
            persistence_queue_depth: self.persistence.queue_depth(),
            server_started_at: self.started_at.timestamp_millis(),
        };

        Ok(Response::new(MonitorStatusResponse {
            snapshot: Some(snapshot),
        }))
    }
}

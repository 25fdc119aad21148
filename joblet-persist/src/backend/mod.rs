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

pub mod cloudwatch;
pub mod dynamodb;
pub mod local;

use crate::config::{BackendConfig, JobletPersistConfig};
use async_trait::async_trait;
use joblet_api_grpc::proto::joblet::job::v1 as job_proto;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("bad record: {0}")]
    BadRecord(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put_job(&self, job: &job_proto::Job) -> Result<(), BackendError>;

    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError>;

    async fn append_log(&self, event: &job_proto::LogEvent) -> Result<(), BackendError>;

    async fn append_metric(&self, sample: &job_proto::MetricSample)
        -> Result<(), BackendError>;

    /// The last-known state of every job, for server crash recovery.
    async fn list_jobs(&self) -> Result<Vec<job_proto::Job>, BackendError>;
}

pub async fn make_backend(
    config: &JobletPersistConfig,
) -> Result<Arc<dyn StorageBackend>, BackendError> {
    match &config.backend {
        BackendConfig::Local(local) => Ok(Arc::new(
            local::LocalBackend::start(local.state_dir.clone()).await?,
        )),
        BackendConfig::Cloudwatch(cloudwatch) => Ok(Arc::new(
            cloudwatch::CloudwatchBackend::start(cloudwatch.clone(), config.node_id.clone())
                .await?,
        )),
        BackendConfig::Dynamodb(dynamodb) => Ok(Arc::new(
            dynamodb::DynamodbBackend::start(dynamodb.clone()).await?,
        )),
    }
}

pub(crate) fn job_id_of(job: &job_proto::Job) -> Result<String, BackendError> {
    job.id
        .as_ref()
        .map(|id| id.value.clone())
        .ok_or_else(|| BackendError::BadRecord("job record without id".to_string()))
}

pub(crate) fn is_terminal(status: i32) -> bool {
    matches!(
        job_proto::JobStatus::try_from(status),
        Ok(job_proto::JobStatus::Completed)
            | Ok(job_proto::JobStatus::Failed)
            | Ok(job_proto::JobStatus::Stopped)
    )
}

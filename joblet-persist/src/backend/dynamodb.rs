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

//! DynamoDB backend: one item per job keyed by `jobId`. Terminal items
//! carry an `expiresAt` TTL attribute so the table self-cleans. Output
//! and metric streams are not stored here; pair this backend with log
//! shipping if history is required.

use crate::backend::{is_terminal, job_id_of, BackendError, StorageBackend};
use crate::config::DynamodbBackendConfig;
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;
use joblet_api_grpc::proto::joblet::job::v1 as job_proto;
use tracing::debug;

pub struct DynamodbBackend {
    client: aws_sdk_dynamodb::Client,
    config: DynamodbBackendConfig,
}

impl DynamodbBackend {
    pub async fn start(config: DynamodbBackendConfig) -> Result<Self, BackendError> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;
        Ok(Self {
            client: aws_sdk_dynamodb::Client::new(&aws_config),
            config,
        })
    }
}

#[async_trait]
impl StorageBackend for DynamodbBackend {
    async fn put_job(&self, job: &job_proto::Job) -> Result<(), BackendError> {
        let job_id = job_id_of(job)?;
        let record = serde_json::to_string(job)
            .map_err(|err| BackendError::BadRecord(err.to_string()))?;

        let mut request = self
            .client
            .put_item()
            .table_name(&self.config.table)
            .item("jobId", AttributeValue::S(job_id))
            .item("status", AttributeValue::N(job.status.to_string()))
            .item("record", AttributeValue::S(record));

        if is_terminal(job.status) {
            let expires_at =
                Utc::now().timestamp() + (self.config.ttl_days as i64) * 24 * 60 * 60;
            request = request.item("expiresAt", AttributeValue::N(expires_at.to_string()));
        }

        request
            .send()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(&self.config.table)
            .key("jobId", AttributeValue::S(job_id.to_string()))
            .send()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn append_log(&self, event: &job_proto::LogEvent) -> Result<(), BackendError> {
        // Job state only; output streams are out of scope for this store.
        debug!(seq = event.seq, "Dropping log event (dynamodb backend)");
        Ok(())
    }

    async fn append_metric(
        &self,
        sample: &job_proto::MetricSample,
    ) -> Result<(), BackendError> {
        debug!(
            timestamp = sample.timestamp,
            "Dropping metric sample (dynamodb backend)"
        );
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<job_proto::Job>, BackendError> {
        let mut jobs = Vec::new();
        let mut last_key = None;

        loop {
            let mut request = self.client.scan().table_name(&self.config.table);
            if let Some(key) = last_key {
                request = request.set_exclusive_start_key(Some(key));
            }
            let response = request
                .send()
                .await
                .map_err(|err| BackendError::Unavailable(err.to_string()))?;

            for item in response.items() {
                if let Some(AttributeValue::S(record)) = item.get("record") {
                    match serde_json::from_str::<job_proto::Job>(record) {
                        Ok(job) => jobs.push(job),
                        Err(err) => {
                            return Err(BackendError::BadRecord(format!(
                                "unparseable job record: {err}"
                            )))
                        }
                    }
                }
            }

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => last_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(jobs)
    }
}

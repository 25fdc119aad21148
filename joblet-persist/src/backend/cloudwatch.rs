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

//! CloudWatch backend: job output goes to per-job log streams under
//! `/joblet/<node>/jobs/<job>`, job state mutations to a state stream the
//! server can replay on restart, and metric samples to a CloudWatch
//! metrics namespace.

use crate::backend::{job_id_of, BackendError, StorageBackend};
use crate::config::CloudwatchBackendConfig;
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use joblet_api_grpc::proto::joblet::job::v1 as job_proto;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::debug;

const STATE_STREAM: &str = "state";

pub struct CloudwatchBackend {
    logs: aws_sdk_cloudwatchlogs::Client,
    metrics: aws_sdk_cloudwatch::Client,
    config: CloudwatchBackendConfig,
    node_id: String,
    known_streams: Mutex<HashSet<String>>,
}

impl CloudwatchBackend {
    pub async fn start(
        config: CloudwatchBackendConfig,
        node_id: String,
    ) -> Result<Self, BackendError> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let backend = Self {
            logs: aws_sdk_cloudwatchlogs::Client::new(&aws_config),
            metrics: aws_sdk_cloudwatch::Client::new(&aws_config),
            config,
            node_id,
            known_streams: Mutex::new(HashSet::new()),
        };
        backend.ensure_group(&backend.state_group()).await?;
        Ok(backend)
    }

    fn state_group(&self) -> String {
        format!("/joblet/{}", self.node_id)
    }

    fn job_group(&self, job_id: &str) -> String {
        format!("/joblet/{}/jobs/{job_id}", self.node_id)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), BackendError> {
        match self
            .logs
            .create_log_group()
            .log_group_name(group)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_already_exists_exception() {
                    Ok(())
                } else {
                    Err(BackendError::Unavailable(service_error.to_string()))
                }
            }
        }
    }

    async fn ensure_stream(&self, group: &str, stream: &str) -> Result<(), BackendError> {
        let key = format!("{group}:{stream}");
        {
            let known = self.known_streams.lock().await;
            if known.contains(&key) {
                return Ok(());
            }
        }

        self.ensure_group(group).await?;
        match self
            .logs
            .create_log_stream()
            .log_group_name(group)
            .log_stream_name(stream)
            .send()
            .await
        {
            Ok(_) => {}
            Err(err) => {
                let service_error = err.into_service_error();
                if !service_error.is_resource_already_exists_exception() {
                    return Err(BackendError::Unavailable(service_error.to_string()));
                }
            }
        }

        self.known_streams.lock().await.insert(key);
        Ok(())
    }

    async fn put_event(
        &self,
        group: &str,
        stream: &str,
        timestamp: i64,
        message: String,
    ) -> Result<(), BackendError> {
        self.ensure_stream(group, stream).await?;
        let event = InputLogEvent::builder()
            .timestamp(timestamp)
            .message(message)
            .build()
            .map_err(|err| BackendError::BadRecord(err.to_string()))?;
        self.logs
            .put_log_events()
            .log_group_name(group)
            .log_stream_name(stream)
            .log_events(event)
            .send()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for CloudwatchBackend {
    async fn put_job(&self, job: &job_proto::Job) -> Result<(), BackendError> {
        job_id_of(job)?;
        let message = serde_json::to_string(job)
            .map_err(|err| BackendError::BadRecord(err.to_string()))?;
        self.put_event(
            &self.state_group(),
            STATE_STREAM,
            chrono::Utc::now().timestamp_millis(),
            message,
        )
        .await
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError> {
        // Log groups carry retention policies; an explicit delete removes
        // the per-job output group immediately.
        match self
            .logs
            .delete_log_group()
            .log_group_name(self.job_group(job_id))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(BackendError::Unavailable(service_error.to_string()))
                }
            }
        }
    }

    async fn append_log(&self, event: &job_proto::LogEvent) -> Result<(), BackendError> {
        let job_id = event
            .job_id
            .as_ref()
            .map(|id| id.value.clone())
            .ok_or_else(|| BackendError::BadRecord("log event without job id".to_string()))?;
        let stream = match event.stream() {
            job_proto::LogStream::Stdout => "stdout",
            job_proto::LogStream::Stderr => "stderr",
            job_proto::LogStream::System => "system",
        };
        self.put_event(
            &self.job_group(&job_id),
            stream,
            event.timestamp,
            String::from_utf8_lossy(&event.payload).to_string(),
        )
        .await
    }

    async fn append_metric(
        &self,
        sample: &job_proto::MetricSample,
    ) -> Result<(), BackendError> {
        let job_id = sample
            .job_id
            .as_ref()
            .map(|id| id.value.clone())
            .ok_or_else(|| BackendError::BadRecord("metric without job id".to_string()))?;
        let dimension = Dimension::builder()
            .name("JobId")
            .value(&job_id)
            .build();

        let data = [
            ("CpuPercent", sample.cpu_percent, StandardUnit::Percent),
            (
                "MemoryCurrentBytes",
                sample.memory_current_bytes as f64,
                StandardUnit::Bytes,
            ),
            (
                "IoReadBytes",
                sample.io_read_bytes as f64,
                StandardUnit::Bytes,
            ),
            (
                "IoWriteBytes",
                sample.io_write_bytes as f64,
                StandardUnit::Bytes,
            ),
            ("PidsCurrent", sample.pids_current as f64, StandardUnit::Count),
        ];

        let mut request = self
            .metrics
            .put_metric_data()
            .namespace(&self.config.metric_namespace);
        for (name, value, unit) in data {
            request = request.metric_data(
                MetricDatum::builder()
                    .metric_name(name)
                    .value(value)
                    .unit(unit)
                    .dimensions(dimension.clone())
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        debug!(job_id = %job_id, "Published metric sample");
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<job_proto::Job>, BackendError> {
        let mut jobs: std::collections::HashMap<String, job_proto::Job> =
            std::collections::HashMap::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self
                .logs
                .get_log_events()
                .log_group_name(self.state_group())
                .log_stream_name(STATE_STREAM)
                .start_from_head(true);
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let service_error = err.into_service_error();
                    if service_error.is_resource_not_found_exception() {
                        return Ok(Vec::new());
                    }
                    return Err(BackendError::Unavailable(service_error.to_string()));
                }
            };

            for event in response.events() {
                if let Some(message) = event.message() {
                    if let Ok(job) = serde_json::from_str::<job_proto::Job>(message) {
                        if let Ok(job_id) = job_id_of(&job) {
                            jobs.insert(job_id, job);
                        }
                    }
                }
            }

            let token = response.next_forward_token().map(str::to_string);
            if token.is_none() || token == next_token {
                break;
            }
            next_token = token;
        }

        Ok(jobs.into_values().collect())
    }
}

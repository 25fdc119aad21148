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

//! Local filesystem backend: one append-only JSONL file per day. Startup
//! replays every file in date order, so a crash at any point loses at
//! most the unflushed tail of the current line.

use crate::backend::{is_terminal, job_id_of, BackendError, StorageBackend};
use async_trait::async_trait;
use chrono::Utc;
use joblet_api_grpc::proto::joblet::job::v1 as job_proto;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StateRecord {
    Job { job: job_proto::Job },
    Delete { job_id: String },
    Log { event: job_proto::LogEvent },
    Metric { sample: job_proto::MetricSample },
}

struct State {
    jobs: HashMap<String, job_proto::Job>,
    current_day: String,
    file: Option<tokio::fs::File>,
}

pub struct LocalBackend {
    state_dir: PathBuf,
    state: Mutex<State>,
}

impl LocalBackend {
    pub async fn start(state_dir: PathBuf) -> Result<Self, BackendError> {
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        let jobs = replay(&state_dir).await?;
        if !jobs.is_empty() {
            info!("Replayed {} job record(s) from {}", jobs.len(), state_dir.display());
        }

        Ok(Self {
            state_dir,
            state: Mutex::new(State {
                jobs,
                current_day: String::new(),
                file: None,
            }),
        })
    }

    async fn append(&self, record: &StateRecord) -> Result<(), BackendError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|err| BackendError::BadRecord(err.to_string()))?;
        line.push(b'\n');

        let mut state = self.state.lock().await;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.file.is_none() || state.current_day != today {
            let path = self.state_dir.join(format!("state-{today}.jsonl"));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|err| BackendError::Unavailable(err.to_string()))?;
            state.file = Some(file);
            state.current_day = today;
        }

        let file = state.file.as_mut().unwrap();
        file.write_all(&line)
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;

        // Keep the in-memory view current while the lock is held.
        match record {
            StateRecord::Job { job } => {
                if let Ok(job_id) = job_id_of(job) {
                    state.jobs.insert(job_id, job.clone());
                }
            }
            StateRecord::Delete { job_id } => {
                state.jobs.remove(job_id);
            }
            _ => {}
        }
        Ok(())
    }
}

async fn replay(state_dir: &std::path::Path) -> Result<HashMap<String, job_proto::Job>, BackendError> {
    let mut files = Vec::new();
    let mut dir = tokio::fs::read_dir(state_dir)
        .await
        .map_err(|err| BackendError::Unavailable(err.to_string()))?;
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|err| BackendError::Unavailable(err.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("state-") && name.ends_with(".jsonl") {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut jobs = HashMap::new();
    for path in files {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        for line in contents.lines() {
            match serde_json::from_str::<StateRecord>(line) {
                Ok(StateRecord::Job { job }) => {
                    if let Ok(job_id) = job_id_of(&job) {
                        jobs.insert(job_id, job);
                    }
                }
                Ok(StateRecord::Delete { job_id }) => {
                    jobs.remove(&job_id);
                }
                Ok(_) => {}
                Err(err) => {
                    // A torn final line after a crash is expected.
                    warn!("Skipping unparseable state line in {}: {err}", path.display());
                }
            }
        }
    }
    Ok(jobs)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn put_job(&self, job: &job_proto::Job) -> Result<(), BackendError> {
        job_id_of(job)?;
        self.append(&StateRecord::Job { job: job.clone() }).await
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.append(&StateRecord::Delete {
            job_id: job_id.to_string(),
        })
        .await
    }

    async fn append_log(&self, event: &job_proto::LogEvent) -> Result<(), BackendError> {
        self.append(&StateRecord::Log {
            event: event.clone(),
        })
        .await
    }

    async fn append_metric(
        &self,
        sample: &job_proto::MetricSample,
    ) -> Result<(), BackendError> {
        self.append(&StateRecord::Metric {
            sample: sample.clone(),
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<job_proto::Job>, BackendError> {
        Ok(self.state.lock().await.jobs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn job(id: &str, status: job_proto::JobStatus) -> job_proto::Job {
        job_proto::Job {
            id: Some(joblet_api_grpc::proto::joblet::common::Uuid {
                value: id.to_string(),
            }),
            command: "/bin/true".to_string(),
            status: status as i32,
            ..Default::default()
        }
    }

    #[test]
    async fn put_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let backend = LocalBackend::start(dir.path().to_path_buf()).await.unwrap();
            backend
                .put_job(&job(
                    "00000000-0000-0000-0000-000000000001",
                    job_proto::JobStatus::Running,
                ))
                .await
                .unwrap();
            backend
                .put_job(&job(
                    "00000000-0000-0000-0000-000000000001",
                    job_proto::JobStatus::Completed,
                ))
                .await
                .unwrap();
            backend
                .put_job(&job(
                    "00000000-0000-0000-0000-000000000002",
                    job_proto::JobStatus::Failed,
                ))
                .await
                .unwrap();
            backend
                .delete_job("00000000-0000-0000-0000-000000000002")
                .await
                .unwrap();
        }

        // A fresh backend over the same directory replays the journal.
        let backend = LocalBackend::start(dir.path().to_path_buf()).await.unwrap();
        let jobs = backend.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(is_terminal(jobs[0].status));
        assert_eq!(
            jobs[0].id.as_ref().unwrap().value,
            "00000000-0000-0000-0000-000000000001"
        );
    }

    #[test]
    async fn corrupt_tail_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = LocalBackend::start(dir.path().to_path_buf()).await.unwrap();
            backend
                .put_job(&job(
                    "00000000-0000-0000-0000-000000000001",
                    job_proto::JobStatus::Completed,
                ))
                .await
                .unwrap();
        }

        // Simulate a crash mid-write.
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let path = dir.path().join(format!("state-{today}.jsonl"));
        let mut contents = std::fs::read(&path).unwrap();
        contents.extend_from_slice(b"{\"kind\":\"job\",\"job\":{\"trunc");
        std::fs::write(&path, contents).unwrap();

        let backend = LocalBackend::start(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(backend.list_jobs().await.unwrap().len(), 1);
    }

    #[test]
    async fn log_appends_share_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::start(dir.path().to_path_buf()).await.unwrap();
        backend
            .append_log(&job_proto::LogEvent {
                job_id: Some(joblet_api_grpc::proto::joblet::common::Uuid {
                    value: "00000000-0000-0000-0000-000000000001".to_string(),
                }),
                seq: 0,
                stream: job_proto::LogStream::Stdout as i32,
                payload: b"hello\n".to_vec(),
                timestamp: 1_700_000_000_000,
            })
            .await
            .unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let contents =
            std::fs::read_to_string(dir.path().join(format!("state-{today}.jsonl"))).unwrap();
        assert!(contents.contains("\"kind\":\"log\""));
    }
}

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

//! The canonical, in-memory job state. Every mutation is mirrored to the
//! persistence client before it commits; a rejected mirror rolls the
//! mutation back so memory and storage cannot diverge.

use crate::model::JobSpec;
use crate::service::persist::PersistenceClient;
use chrono::Utc;
use joblet_common::error::JobletError;
use joblet_common::model::{Job, JobFilter, JobId, JobStatus, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Emitted on every status change; the workflow engine and stop paths
/// listen to these.
#[derive(Clone, Debug)]
pub struct JobTransition {
    pub job_id: JobId,
    pub workflow_id: Option<WorkflowId>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    persistence: Arc<dyn PersistenceClient>,
    transitions: broadcast::Sender<JobTransition>,
}

impl JobStore {
    pub fn new(persistence: Arc<dyn PersistenceClient>) -> Self {
        let (transitions, _) = broadcast::channel(1024);
        Self {
            jobs: RwLock::new(HashMap::new()),
            persistence,
            transitions,
        }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<JobTransition> {
        self.transitions.subscribe()
    }

    fn emit(&self, job: &Job) {
        let _ = self.transitions.send(JobTransition {
            job_id: job.id,
            workflow_id: job.workflow_id,
            status: job.status,
            exit_code: job.exit_code,
        });
    }

    /// Create a new record in `PENDING`. The id is generated here; callers
    /// cannot supply one.
    pub async fn create(&self, spec: JobSpec) -> Result<Job, JobletError> {
        let job = Job {
            id: JobId::new_v4(),
            command: spec.command,
            args: spec.args,
            status: JobStatus::Pending,
            limits: spec.limits,
            network: spec.network,
            volumes: spec.volumes,
            runtime: spec.runtime,
            uploads: spec.uploads,
            environment: spec.environment,
            secret_environment: spec.secret_environment,
            gpu_count: spec.gpu_count,
            gpu_memory_mb: spec.gpu_memory_mb,
            gpu_indices: Vec::new(),
            cgroup_path: None,
            pid: None,
            ip_address: None,
            scheduled_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
            exit_code: None,
            job_type: spec.job_type,
            depends_on: spec.depends_on,
            workflow_id: spec.workflow_id,
            failure_reason: None,
        };

        let mut jobs = self.jobs.write().await;
        self.persistence.put_job(&job).await?;
        jobs.insert(job.id, job.clone());
        debug!(job_id = %job.id, "Created job record");
        self.emit(&job);
        Ok(job)
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Job, JobletError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobletError::not_found(format!("Job not found: {job_id}")))
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.scheduled_time);
        jobs
    }

    /// Apply a mutation, mirror it, commit only if the mirror succeeded.
    /// Terminal records reject every further mutation.
    pub async fn update<F>(&self, job_id: &JobId, mutate: F) -> Result<Job, JobletError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobletError>,
    {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(job_id)
            .ok_or_else(|| JobletError::not_found(format!("Job not found: {job_id}")))?;
        if current.status.is_terminal() {
            return Err(JobletError::conflict(format!(
                "Job {job_id} is already terminal ({})",
                current.status
            )));
        }

        let mut updated = current.clone();
        mutate(&mut updated)?;
        if updated.status.is_terminal() {
            return Err(JobletError::internal(
                "terminal transitions must go through finish",
            ));
        }

        self.persistence.put_job(&updated).await?;
        let status_changed = updated.status != current.status;
        jobs.insert(*job_id, updated.clone());
        if status_changed {
            self.emit(&updated);
        }
        Ok(updated)
    }

    /// Transition to `RUNNING`, stamping `start_time` exactly once.
    pub async fn mark_running(
        &self,
        job_id: &JobId,
        pid: u32,
        cgroup_path: String,
    ) -> Result<Job, JobletError> {
        self.update(job_id, |job| {
            job.status = JobStatus::Running;
            job.pid = Some(pid);
            job.cgroup_path = Some(cgroup_path);
            if job.start_time.is_none() {
                job.start_time = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// The single terminal transition of a job. Resources (IP, GPUs,
    /// cgroup) must already be released by the caller; the record's
    /// resource fields are cleared here to reflect that.
    pub async fn finish(
        &self,
        job_id: &JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        failure_reason: Option<String>,
    ) -> Result<Job, JobletError> {
        if !status.is_terminal() {
            return Err(JobletError::internal(format!(
                "finish called with non-terminal status {status}"
            )));
        }

        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(job_id)
            .ok_or_else(|| JobletError::not_found(format!("Job not found: {job_id}")))?;
        if current.status.is_terminal() {
            return Err(JobletError::conflict(format!(
                "Job {job_id} is already terminal ({})",
                current.status
            )));
        }

        let mut updated = current.clone();
        updated.status = status;
        updated.exit_code = exit_code;
        updated.end_time = Some(Utc::now());
        updated.failure_reason = failure_reason;
        updated.cgroup_path = None;
        updated.ip_address = None;
        updated.gpu_indices = Vec::new();
        updated.pid = None;

        self.persistence.put_job(&updated).await?;
        jobs.insert(*job_id, updated.clone());
        info!(job_id = %job_id, status = %status, exit_code = ?exit_code, "Job finished");
        self.emit(&updated);
        Ok(updated)
    }

    /// Remove a record entirely. Running jobs cannot be deleted.
    pub async fn delete(&self, job_id: &JobId) -> Result<(), JobletError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| JobletError::not_found(format!("Job not found: {job_id}")))?;
        if job.status == JobStatus::Running {
            return Err(JobletError::conflict(format!(
                "Cannot delete job {job_id} while it is running"
            )));
        }
        self.persistence.delete_job(job_id).await?;
        jobs.remove(job_id);
        Ok(())
    }

    /// Delete every non-running job; returns how many were removed.
    pub async fn delete_all(&self) -> Result<u32, JobletError> {
        let mut jobs = self.jobs.write().await;
        let deletable: Vec<JobId> = jobs
            .values()
            .filter(|job| job.status != JobStatus::Running)
            .map(|job| job.id)
            .collect();
        let mut deleted = 0;
        for job_id in deletable {
            self.persistence.delete_job(&job_id).await?;
            jobs.remove(&job_id);
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Load the last-known state from the persistence backend. Jobs that
    /// were live when the server died are closed out as failed; terminal
    /// jobs keep their terminal fields.
    pub async fn recover(&self) -> Result<usize, JobletError> {
        let recovered = self.persistence.list_jobs().await?;
        let count = recovered.len();
        let mut jobs = self.jobs.write().await;
        for mut job in recovered {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.exit_code = Some(255);
                job.end_time = Some(Utc::now());
                job.failure_reason = Some("server restarted during execution".to_string());
                job.cgroup_path = None;
                job.ip_address = None;
                job.pid = None;
                job.gpu_indices = Vec::new();
                self.persistence.put_job(&job).await.ok();
            }
            jobs.insert(job.id, job);
        }
        if count > 0 {
            info!("Recovered {count} persisted jobs");
        }
        Ok(count)
    }

    pub async fn counts(&self) -> (u32, u32, u32) {
        let jobs = self.jobs.read().await;
        let total = jobs.len() as u32;
        let running = jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count() as u32;
        let pending = jobs
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Pending | JobStatus::Scheduled)
            })
            .count() as u32;
        (total, running, pending)
    }
}

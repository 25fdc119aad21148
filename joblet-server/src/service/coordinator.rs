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

//! The execution coordinator turns a job record into a running process in
//! a fixed step order, records a compensating action for every step that
//! succeeded, and unwinds them LIFO on any failure. A failed launch
//! leaves no trace: no cgroup, no mounts, no IP, no GPU claim, and for
//! direct submissions not even the job record.

use crate::config::TimeoutsConfig;
use crate::metrics;
use crate::model::{IsolationContext, JobSpec, NetworkAttachment};
use crate::service::environment::EnvironmentService;
use crate::service::gpu::GpuAllocator;
use crate::service::isolation::IsolationService;
use crate::service::logbus::LogBus;
use crate::service::network::NetworkService;
use crate::service::process::{ProcessHandle, ProcessService};
use crate::service::sampler::MetricsSampler;
use crate::service::store::JobStore;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{Job, JobId, JobStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the workflow engine reaches the coordinator without depending on
/// its concrete type.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn start_job(&self, job_id: &JobId) -> Result<(), JobletError>;
    async fn stop_job(&self, job_id: &JobId) -> Result<(), JobletError>;
}

struct RunningEntry {
    pid: u32,
    cgroup_path: PathBuf,
    stop_requested: Arc<AtomicBool>,
}

enum Rollback {
    ReleaseVolumes(Vec<String>),
    DestroyIsolation(IsolationContext),
    RemoveChannels(JobId),
    ReleaseGpu(JobId),
    ReleaseNetwork(NetworkAttachment),
    KillCgroup(PathBuf),
}

pub struct ExecutionCoordinator {
    store: Arc<JobStore>,
    isolation: Arc<dyn IsolationService>,
    environment: Arc<dyn EnvironmentService>,
    process: Arc<dyn ProcessService>,
    network: Arc<dyn NetworkService>,
    gpu: Arc<dyn GpuAllocator>,
    volumes: Arc<dyn crate::service::volume::VolumeService>,
    log_bus: Arc<LogBus>,
    sampler: Arc<MetricsSampler>,
    timeouts: TimeoutsConfig,
    running: Mutex<HashMap<JobId, RunningEntry>>,
    self_ref: Weak<ExecutionCoordinator>,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        isolation: Arc<dyn IsolationService>,
        environment: Arc<dyn EnvironmentService>,
        process: Arc<dyn ProcessService>,
        network: Arc<dyn NetworkService>,
        gpu: Arc<dyn GpuAllocator>,
        volumes: Arc<dyn crate::service::volume::VolumeService>,
        log_bus: Arc<LogBus>,
        sampler: Arc<MetricsSampler>,
        timeouts: TimeoutsConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            isolation,
            environment,
            process,
            network,
            gpu,
            volumes,
            log_bus,
            sampler,
            timeouts,
            running: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Create the record and launch it. On launch failure the record is
    /// removed again so a failed RunJob leaves nothing behind.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, JobletError> {
        let job = self.store.create(spec).await?;
        let job_id = job.id;
        match self.launch(&job_id, CancellationToken::new()).await {
            Ok(()) => Ok(job_id),
            Err(error) => {
                if let Err(cleanup_error) = self.store.delete(&job_id).await {
                    warn!(job_id = %job_id, "Failed to remove record of failed launch: {cleanup_error}");
                }
                metrics::record_job_failed(error.kind());
                Err(error)
            }
        }
    }

    /// Launch an already-created record (workflow members). A failure
    /// transitions the job to FAILED instead of deleting it.
    async fn start_existing(&self, job_id: &JobId) -> Result<(), JobletError> {
        match self.launch(job_id, CancellationToken::new()).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let _ = self
                    .store
                    .finish(job_id, JobStatus::Failed, Some(255), Some(error.to_string()))
                    .await;
                let _ = self.log_bus.finish(job_id).await;
                metrics::record_job_failed(error.kind());
                Err(error)
            }
        }
    }

    async fn launch(
        &self,
        job_id: &JobId,
        cancellation: CancellationToken,
    ) -> Result<(), JobletError> {
        let job = self.store.get(job_id).await?;
        if job.status.is_terminal() || job.status == JobStatus::Running {
            return Err(JobletError::conflict(format!(
                "Job {job_id} is {} and cannot be launched",
                job.status
            )));
        }

        let mut rollback: Vec<Rollback> = Vec::new();
        match self.launch_steps(job, &mut rollback, &cancellation).await {
            Ok(()) => {
                metrics::record_job_started();
                Ok(())
            }
            Err(error) => {
                warn!(job_id = %job_id, step = ?error.step(), "Launch failed, rolling back: {error}");
                self.unwind(rollback).await;
                Err(error)
            }
        }
    }

    async fn launch_steps(
        &self,
        mut job: Job,
        rollback: &mut Vec<Rollback>,
        cancellation: &CancellationToken,
    ) -> Result<(), JobletError> {
        let job_id = job.id;

        // Step: volumes
        check_cancelled(cancellation, "volumes")?;
        let mut acquired = Vec::new();
        for name in &job.volumes {
            self.volumes.acquire(name).await?;
            acquired.push(name.clone());
        }
        if !acquired.is_empty() {
            rollback.push(Rollback::ReleaseVolumes(acquired));
        }

        // Step: isolation
        check_cancelled(cancellation, "isolation")?;
        let context = self.isolation.prepare(&job).await?;
        rollback.push(Rollback::DestroyIsolation(context.clone()));

        let secrets = job.secret_environment.values().cloned().collect();
        self.log_bus
            .register(job_id, context.log_dir.clone(), secrets)
            .await;
        rollback.push(Rollback::RemoveChannels(job_id));

        // Step: workspace
        check_cancelled(cancellation, "workspace")?;
        self.environment.stage_workspace(&job, &context).await?;

        // Step: gpu
        check_cancelled(cancellation, "gpu")?;
        if job.gpu_count > 0 {
            let indices = self
                .gpu
                .allocate(&job_id, job.gpu_count, job.gpu_memory_mb)
                .await?;
            rollback.push(Rollback::ReleaseGpu(job_id));
            self.isolation
                .create_gpu_devices(&context, &indices)
                .await?;
            job = self
                .store
                .update(&job_id, |job| {
                    job.gpu_indices = indices.clone();
                    Ok(())
                })
                .await?;
        }

        // Step: network phase 1 (reservation only)
        check_cancelled(cancellation, "network-allocate")?;
        let attachment = self
            .network
            .allocate(&job_id, &job.network, &context.rootfs_dir)
            .await?;
        if let Some(attachment) = &attachment {
            rollback.push(Rollback::ReleaseNetwork(attachment.clone()));
            job = self
                .store
                .update(&job_id, |job| {
                    job.ip_address = Some(attachment.ip);
                    Ok(())
                })
                .await?;
        }

        // Step: environment vector
        check_cancelled(cancellation, "environment")?;
        let env = self
            .environment
            .build_env(&job, &context, attachment.as_ref())
            .await?;

        // Step: launch
        check_cancelled(cancellation, "launch")?;
        let handle = self.process.launch(&job, &context, env).await?;
        let pid = handle.pid;
        rollback.push(Rollback::KillCgroup(context.cgroup_path.clone()));

        // Step: network phase 2 (tolerant; the job continues without
        // connectivity if the wiring fails, but the child must still be
        // released from its readiness wait).
        if let Some(attachment) = &attachment {
            if let Err(error) = self.network.attach(attachment, pid).await {
                warn!(job_id = %job_id, "Network wiring failed: {error}");
                let _ = self
                    .log_bus
                    .publish_system(&job_id, format!("[system] network setup failed: {error}"))
                    .await;
                if let Some(parent) = attachment.ready_file_host.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let _ = tokio::fs::write(&attachment.ready_file_host, b"degraded\n").await;
            }
        }

        // Step: mark running
        let cgroup_display = context.cgroup_path.display().to_string();
        self.store
            .mark_running(&job_id, pid, cgroup_display)
            .await?;
        let _ = self.log_bus.publish_system(&job_id, "[system] started").await;

        self.sampler
            .clone()
            .start(job_id, context.cgroup_path.clone())
            .await;

        let stop_requested = Arc::new(AtomicBool::new(false));
        self.running.lock().await.insert(
            job_id,
            RunningEntry {
                pid,
                cgroup_path: context.cgroup_path.clone(),
                stop_requested: stop_requested.clone(),
            },
        );

        let coordinator = self
            .self_ref
            .upgrade()
            .ok_or_else(|| JobletError::internal("coordinator is shutting down"))?;
        let volumes = job.volumes.clone();
        tokio::spawn(async move {
            coordinator
                .monitor(job_id, context, attachment, volumes, handle, stop_requested)
                .await;
        });

        info!(job_id = %job_id, pid, "Job is running");
        Ok(())
    }

    /// Owns the job's terminal path: reap, drain output, release every
    /// resource, then write the single terminal transition.
    async fn monitor(
        self: Arc<Self>,
        job_id: JobId,
        context: IsolationContext,
        attachment: Option<NetworkAttachment>,
        volumes: Vec<String>,
        handle: ProcessHandle,
        stop_requested: Arc<AtomicBool>,
    ) {
        let exit = handle.exit.await.unwrap_or(crate::model::JobExit {
            code: Some(255),
            signal: None,
            oom_killed: false,
        });

        // Let the pumps drain whatever is left in the pipes.
        let _ = tokio::time::timeout(Duration::from_secs(5), handle.pump).await;

        let oom_killed = self.isolation.oom_kill_count(&context.cgroup_path).await > 0;
        if oom_killed {
            let _ = self
                .log_bus
                .publish_system(
                    &job_id,
                    "[system] job killed by signal: SIGKILL (memory limit exceeded)",
                )
                .await;
        } else if let Some(signal) = exit.signal {
            let _ = self
                .log_bus
                .publish_system(
                    &job_id,
                    format!("[system] job killed by signal: {}", signal_name(signal)),
                )
                .await;
        }

        // The final sample is emitted while the cgroup still exists.
        self.sampler.stop(&job_id).await;

        // Release resources before the terminal transition.
        if let Some(attachment) = &attachment {
            if let Err(error) = self.network.release(attachment).await {
                warn!(job_id = %job_id, "Network release: {error}");
            }
        }
        self.gpu.release(&job_id).await;
        if let Err(error) = self.isolation.destroy(&context).await {
            warn!(job_id = %job_id, "Isolation teardown: {error}");
        }
        for volume in &volumes {
            self.volumes.release(volume).await;
        }

        let stopped = stop_requested.load(Ordering::SeqCst);
        let exit_code = exit.exit_code();
        let (status, reason) = if stopped {
            (JobStatus::Stopped, None)
        } else if exit_code == 0 {
            (JobStatus::Completed, None)
        } else if oom_killed {
            (
                JobStatus::Failed,
                Some("killed by the kernel memory controller".to_string()),
            )
        } else {
            (JobStatus::Failed, None)
        };

        if let Err(error) = self
            .store
            .finish(&job_id, status, Some(exit_code), reason)
            .await
        {
            warn!(job_id = %job_id, "Terminal transition failed: {error}");
        }
        metrics::record_job_finished(status);

        self.log_bus.finish(&job_id).await;
        self.sampler.remove(&job_id).await;
        self.running.lock().await.remove(&job_id);
        debug!(job_id = %job_id, exit_code, "Job cleanup complete");
    }

    async fn unwind(&self, rollback: Vec<Rollback>) {
        for action in rollback.into_iter().rev() {
            match action {
                Rollback::ReleaseVolumes(names) => {
                    for name in names {
                        self.volumes.release(&name).await;
                    }
                }
                Rollback::DestroyIsolation(context) => {
                    if let Err(error) = self.isolation.destroy(&context).await {
                        warn!("Rollback isolation destroy: {error}");
                    }
                }
                Rollback::RemoveChannels(job_id) => {
                    self.log_bus.remove(&job_id).await;
                }
                Rollback::ReleaseGpu(job_id) => {
                    self.gpu.release(&job_id).await;
                }
                Rollback::ReleaseNetwork(attachment) => {
                    if let Err(error) = self.network.release(&attachment).await {
                        warn!("Rollback network release: {error}");
                    }
                }
                Rollback::KillCgroup(cgroup_path) => {
                    if let Err(error) = self.isolation.kill_cgroup(&cgroup_path).await {
                        warn!("Rollback cgroup kill: {error}");
                    }
                }
            }
        }
    }

    /// SIGTERM the init child, give it the grace period, then SIGKILL the
    /// whole cgroup. Cleanup itself happens in the monitor task once the
    /// child is reaped, regardless of which signal ended it.
    pub async fn stop(&self, job_id: &JobId) -> Result<(), JobletError> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(JobletError::conflict(format!(
                "Job {job_id} is {} and cannot be stopped",
                job.status
            )));
        }

        let (pid, cgroup_path) = {
            let running = self.running.lock().await;
            let entry = running.get(job_id).ok_or_else(|| {
                JobletError::internal(format!("Running job {job_id} has no process entry"))
            })?;
            entry.stop_requested.store(true, Ordering::SeqCst);
            (entry.pid, entry.cgroup_path.clone())
        };

        let mut transitions = self.store.subscribe_transitions();

        if let Err(error) = self.process.signal_terminate(pid) {
            warn!(job_id = %job_id, "SIGTERM delivery: {error}");
        }

        let graceful = wait_for_terminal(&mut transitions, job_id, self.timeouts.graceful_stop).await;
        if !graceful {
            info!(job_id = %job_id, "Grace period expired, killing cgroup");
            self.isolation.kill_cgroup(&cgroup_path).await?;
            wait_for_terminal(&mut transitions, job_id, Duration::from_secs(5)).await;
        }

        Ok(())
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

#[async_trait]
impl JobLauncher for Arc<ExecutionCoordinator> {
    async fn start_job(&self, job_id: &JobId) -> Result<(), JobletError> {
        self.start_existing(job_id).await
    }

    async fn stop_job(&self, job_id: &JobId) -> Result<(), JobletError> {
        self.stop(job_id).await
    }
}

fn check_cancelled(
    cancellation: &CancellationToken,
    step: &str,
) -> Result<(), JobletError> {
    if cancellation.is_cancelled() {
        Err(JobletError::timeout(
            format!("{step} (cancelled)"),
            Duration::ZERO,
        ))
    } else {
        Ok(())
    }
}

async fn wait_for_terminal(
    transitions: &mut tokio::sync::broadcast::Receiver<crate::service::store::JobTransition>,
    job_id: &JobId,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, transitions.recv()).await {
            Ok(Ok(transition)) => {
                if transition.job_id == *job_id && transition.status.is_terminal() {
                    return true;
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return false,
            Err(_) => return false,
        }
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

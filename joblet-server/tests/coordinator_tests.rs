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

//! Coordinator behavior against in-memory implementations of the manager
//! interfaces: step ordering, LIFO rollback, allocate/release parity and
//! stop semantics, without touching real namespaces or cgroups.

use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{Job, JobId, JobStatus, NetworkMode};
use joblet_server::config::TimeoutsConfig;
use joblet_server::model::{
    GpuDevice, IsolationContext, JobExit, JobSpec, NamespacePlan, NetworkAttachment,
};
use joblet_server::service::coordinator::ExecutionCoordinator;
use joblet_server::service::environment::EnvironmentService;
use joblet_server::service::gpu::{GpuAllocator, StaticGpuAllocator};
use joblet_server::service::isolation::IsolationService;
use joblet_server::service::logbus::{LogBus, SubscriptionItem};
use joblet_server::service::network::NetworkService;
use joblet_server::service::persist::{DisabledPersistence, PersistenceClient};
use joblet_server::service::process::{ProcessHandle, ProcessService};
use joblet_server::service::sampler::MetricsSampler;
use joblet_server::service::store::JobStore;
use joblet_server::service::volume::VolumeService;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

test_r::enable!();

use test_r::test;

struct FakeIsolation {
    base: PathBuf,
    prepared: AtomicU32,
    destroyed: AtomicU32,
    fail_prepare: AtomicBool,
    live_contexts: Mutex<HashSet<JobId>>,
}

impl FakeIsolation {
    fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            prepared: AtomicU32::new(0),
            destroyed: AtomicU32::new(0),
            fail_prepare: AtomicBool::new(false),
            live_contexts: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl IsolationService for FakeIsolation {
    async fn prepare(&self, job: &Job) -> Result<IsolationContext, JobletError> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(JobletError::isolation("cgroup-create", "forced failure"));
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        self.live_contexts.lock().unwrap().insert(job.id);
        let job_dir = self.base.join(job.id.to_string());
        Ok(IsolationContext {
            job_id: job.id,
            workspace_dir: job_dir.join("work"),
            rootfs_dir: job_dir.join("rootfs"),
            log_dir: job_dir.join("log"),
            cgroup_path: job_dir.join("cgroup"),
            namespaces: NamespacePlan {
                net: job.network != NetworkMode::Host,
                ..NamespacePlan::default()
            },
        })
    }

    async fn create_gpu_devices(
        &self,
        _context: &IsolationContext,
        _indices: &[u32],
    ) -> Result<(), JobletError> {
        Ok(())
    }

    async fn destroy(&self, context: &IsolationContext) -> Result<(), JobletError> {
        // Idempotent: only the first destroy counts.
        if self
            .live_contexts
            .lock()
            .unwrap()
            .remove(&context.job_id)
        {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn kill_cgroup(&self, _cgroup_path: &Path) -> Result<(), JobletError> {
        Ok(())
    }

    async fn oom_kill_count(&self, _cgroup_path: &Path) -> u64 {
        0
    }
}

struct FakeEnvironment {
    staged: AtomicU32,
}

#[async_trait]
impl EnvironmentService for FakeEnvironment {
    async fn stage_workspace(
        &self,
        _job: &Job,
        context: &IsolationContext,
    ) -> Result<(), JobletError> {
        tokio::fs::create_dir_all(&context.workspace_dir)
            .await
            .map_err(|err| JobletError::internal(err.to_string()))?;
        self.staged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn build_env(
        &self,
        job: &Job,
        _context: &IsolationContext,
        attachment: Option<&NetworkAttachment>,
    ) -> Result<Vec<(String, String)>, JobletError> {
        let mut env = vec![("JOB_ID".to_string(), job.id.to_string())];
        if let Some(attachment) = attachment {
            env.push((
                "NETWORK_READY_FILE".to_string(),
                attachment.ready_file_child.display().to_string(),
            ));
        }
        Ok(env)
    }
}

#[derive(Default)]
struct FakeProcessInner {
    exits: HashMap<u32, oneshot::Sender<JobExit>>,
    next_pid: u32,
}

struct FakeProcess {
    inner: Mutex<FakeProcessInner>,
    /// Exit delivered as soon as the job launches; None keeps it running
    /// until a signal arrives.
    immediate_exit: Option<JobExit>,
    fail_launch: AtomicBool,
}

impl FakeProcess {
    fn exiting_with(exit: JobExit) -> Self {
        Self {
            inner: Mutex::new(FakeProcessInner {
                exits: HashMap::new(),
                next_pid: 1000,
            }),
            immediate_exit: Some(exit),
            fail_launch: AtomicBool::new(false),
        }
    }

    fn long_running() -> Self {
        Self {
            inner: Mutex::new(FakeProcessInner {
                exits: HashMap::new(),
                next_pid: 1000,
            }),
            immediate_exit: None,
            fail_launch: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProcessService for FakeProcess {
    async fn launch(
        &self,
        _job: &Job,
        _context: &IsolationContext,
        _env: Vec<(String, String)>,
    ) -> Result<ProcessHandle, JobletError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(JobletError::process("fork", "forced failure"));
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let pid = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_pid += 1;
            let pid = inner.next_pid;
            match self.immediate_exit {
                Some(exit) => {
                    let _ = exit_tx.send(exit);
                }
                None => {
                    inner.exits.insert(pid, exit_tx);
                }
            }
            pid
        };
        Ok(ProcessHandle {
            pid,
            exit: exit_rx,
            pump: tokio::spawn(async {}),
        })
    }

    fn signal_terminate(&self, pid: u32) -> Result<(), JobletError> {
        let sender = self.inner.lock().unwrap().exits.remove(&pid);
        if let Some(sender) = sender {
            let _ = sender.send(JobExit {
                code: None,
                signal: Some(15),
                oom_killed: false,
            });
        }
        Ok(())
    }
}

struct FakeNetwork {
    allocated: AtomicU32,
    released: AtomicU32,
    attach_calls: AtomicU32,
    fail_allocate: AtomicBool,
    fail_attach: AtomicBool,
}

impl FakeNetwork {
    fn new() -> Self {
        Self {
            allocated: AtomicU32::new(0),
            released: AtomicU32::new(0),
            attach_calls: AtomicU32::new(0),
            fail_allocate: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl NetworkService for FakeNetwork {
    async fn allocate(
        &self,
        job_id: &JobId,
        mode: &NetworkMode,
        rootfs_dir: &Path,
    ) -> Result<Option<NetworkAttachment>, JobletError> {
        if mode.is_unmanaged() {
            return Ok(None);
        }
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(JobletError::ResourceExhausted(
                "no free addresses".to_string(),
            ));
        }
        let count = self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(Some(NetworkAttachment {
            network: "bridge".to_string(),
            ip: format!("172.20.0.{}", count + 2).parse().unwrap(),
            prefix_len: 16,
            gateway: "172.20.0.1".parse().unwrap(),
            bridge: "joblet0".to_string(),
            veth_host: format!("vh-{}", job_id.short()),
            veth_peer: format!("vp-{}", job_id.short()),
            ready_file_host: rootfs_dir.join("tmp").join("ready"),
            ready_file_child: PathBuf::from("/tmp/ready"),
        }))
    }

    async fn attach(
        &self,
        _attachment: &NetworkAttachment,
        _pid: u32,
    ) -> Result<(), JobletError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(JobletError::network("veth", "forced failure"));
        }
        Ok(())
    }

    async fn release(&self, _attachment: &NetworkAttachment) -> Result<(), JobletError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_network(
        &self,
        _name: &str,
        _cidr: &str,
    ) -> Result<joblet_server::service::network::NetworkInfo, JobletError> {
        unimplemented!("not used by coordinator tests")
    }

    async fn remove_network(&self, _name: &str) -> Result<(), JobletError> {
        unimplemented!("not used by coordinator tests")
    }

    async fn list_networks(&self) -> Vec<joblet_server::service::network::NetworkInfo> {
        Vec::new()
    }
}

struct NoVolumes;

#[async_trait]
impl VolumeService for NoVolumes {
    async fn create(
        &self,
        _name: &str,
        _size_bytes: u64,
        _volume_type: joblet_common::model::VolumeType,
    ) -> Result<joblet_common::model::Volume, JobletError> {
        unimplemented!("not used by coordinator tests")
    }

    async fn remove(&self, _name: &str) -> Result<(), JobletError> {
        Ok(())
    }

    async fn list(&self) -> Vec<joblet_common::model::Volume> {
        Vec::new()
    }

    async fn resolve(&self, name: &str) -> Result<joblet_common::model::Volume, JobletError> {
        Err(JobletError::not_found(format!("Volume not found: {name}")))
    }

    async fn acquire(&self, name: &str) -> Result<(), JobletError> {
        Err(JobletError::not_found(format!("Volume not found: {name}")))
    }

    async fn release(&self, _name: &str) {}
}

struct Harness {
    coordinator: Arc<ExecutionCoordinator>,
    store: Arc<JobStore>,
    isolation: Arc<FakeIsolation>,
    network: Arc<FakeNetwork>,
    gpu: Arc<StaticGpuAllocator>,
    process: Arc<FakeProcess>,
    log_bus: Arc<LogBus>,
    _dir: tempfile::TempDir,
}

fn harness(process: FakeProcess) -> Harness {
    let process = Arc::new(process);
    let dir = tempfile::tempdir().unwrap();
    let persistence: Arc<dyn PersistenceClient> = Arc::new(DisabledPersistence);
    let store = Arc::new(JobStore::new(persistence.clone()));
    let log_bus = Arc::new(LogBus::new(
        joblet_server::config::LogBusConfig::default(),
        persistence.clone(),
    ));
    let sampler = Arc::new(MetricsSampler::new(
        joblet_server::config::SamplerConfig {
            interval: Duration::from_millis(50),
        },
        Duration::from_millis(100),
        persistence,
    ));
    let isolation = Arc::new(FakeIsolation::new(dir.path()));
    let network = Arc::new(FakeNetwork::new());
    let gpu = Arc::new(StaticGpuAllocator::new(vec![
        GpuDevice {
            index: 0,
            memory_total_mb: 16_000,
            memory_free_mb: 16_000,
            owner: None,
        },
        GpuDevice {
            index: 1,
            memory_total_mb: 16_000,
            memory_free_mb: 16_000,
            owner: None,
        },
    ]));

    let coordinator = ExecutionCoordinator::new(
        store.clone(),
        isolation.clone(),
        Arc::new(FakeEnvironment {
            staged: AtomicU32::new(0),
        }),
        process.clone(),
        network.clone(),
        gpu.clone(),
        Arc::new(NoVolumes),
        log_bus.clone(),
        sampler,
        TimeoutsConfig {
            graceful_stop: Duration::from_secs(2),
            ..TimeoutsConfig::default()
        },
    );

    Harness {
        coordinator,
        store,
        isolation,
        network,
        gpu,
        process,
        log_bus,
        _dir: dir,
    }
}

fn spec(network: NetworkMode) -> JobSpec {
    JobSpec {
        command: "/bin/echo".to_string(),
        args: vec!["hello".to_string()],
        network,
        ..JobSpec::default()
    }
}

async fn wait_for_status(store: &JobStore, job_id: &JobId, status: JobStatus) -> Job {
    for _ in 0..100 {
        if let Ok(job) = store.get(job_id).await {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached {status}");
}

#[test]
async fn successful_job_reaches_completed_with_exit_code_zero() {
    let harness = harness(FakeProcess::exiting_with(JobExit {
        code: Some(0),
        signal: None,
        oom_killed: false,
    }));

    let job_id = harness
        .coordinator
        .submit(spec(NetworkMode::None))
        .await
        .unwrap();

    let job = wait_for_status(&harness.store, &job_id, JobStatus::Completed).await;
    assert_eq!(job.exit_code, Some(0));
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());
    // Resources are gone from the terminal record.
    assert_eq!(job.cgroup_path, None);
    assert_eq!(job.pid, None);

    // Isolation was created exactly once and destroyed exactly once.
    assert_eq!(harness.isolation.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(harness.isolation.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
async fn started_system_event_is_streamed() {
    let harness = harness(FakeProcess::exiting_with(JobExit {
        code: Some(0),
        signal: None,
        oom_killed: false,
    }));

    let job_id = harness
        .coordinator
        .submit(spec(NetworkMode::None))
        .await
        .unwrap();
    wait_for_status(&harness.store, &job_id, JobStatus::Completed).await;

    let mut subscription = harness.log_bus.subscribe(&job_id, 0).await.unwrap();
    let mut saw_started = false;
    while let Some(item) = subscription.next().await {
        if let SubscriptionItem::Event(event) = item {
            if event.payload.as_ref() == b"[system] started" {
                saw_started = true;
            }
        }
    }
    assert!(saw_started);
}

#[test]
async fn network_allocation_parity_on_success() {
    let harness = harness(FakeProcess::exiting_with(JobExit {
        code: Some(0),
        signal: None,
        oom_killed: false,
    }));

    let job_id = harness
        .coordinator
        .submit(spec(NetworkMode::Bridge))
        .await
        .unwrap();
    wait_for_status(&harness.store, &job_id, JobStatus::Completed).await;

    assert_eq!(harness.network.allocated.load(Ordering::SeqCst), 1);
    assert_eq!(harness.network.released.load(Ordering::SeqCst), 1);
    assert_eq!(harness.network.attach_calls.load(Ordering::SeqCst), 1);
}

#[test]
async fn gpu_allocation_parity_on_success() {
    let harness = harness(FakeProcess::exiting_with(JobExit {
        code: Some(0),
        signal: None,
        oom_killed: false,
    }));

    let mut job_spec = spec(NetworkMode::None);
    job_spec.gpu_count = 2;
    job_spec.gpu_memory_mb = 8_000;

    let job_id = harness.coordinator.submit(job_spec).await.unwrap();
    wait_for_status(&harness.store, &job_id, JobStatus::Completed).await;

    // Every device is free again.
    let devices = harness.gpu.snapshot().await;
    assert!(devices.iter().all(|device| device.owner.is_none()));
}

#[test]
async fn failed_launch_leaves_no_trace() {
    let harness = harness(FakeProcess::long_running());
    harness.process.fail_launch.store(true, Ordering::SeqCst);

    let result = harness.coordinator.submit(spec(NetworkMode::Bridge)).await;
    assert!(result.is_err());

    // No job record survives a failed RunJob.
    let jobs = harness
        .store
        .list(&joblet_common::model::JobFilter::default())
        .await;
    assert!(jobs.is_empty());

    // Everything allocated was rolled back.
    assert_eq!(
        harness.network.allocated.load(Ordering::SeqCst),
        harness.network.released.load(Ordering::SeqCst)
    );
    assert_eq!(
        harness.isolation.prepared.load(Ordering::SeqCst),
        harness.isolation.destroyed.load(Ordering::SeqCst)
    );
    let devices = harness.gpu.snapshot().await;
    assert!(devices.iter().all(|device| device.owner.is_none()));
}

#[test]
async fn isolation_failure_reports_the_step() {
    let harness = harness(FakeProcess::long_running());
    harness.isolation.fail_prepare.store(true, Ordering::SeqCst);

    let error = harness
        .coordinator
        .submit(spec(NetworkMode::None))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "ISOLATION_FAILED");
    assert_eq!(error.step(), Some("cgroup-create"));
}

#[test]
async fn network_exhaustion_fails_the_launch_and_rolls_back() {
    let harness = harness(FakeProcess::long_running());
    harness.network.fail_allocate.store(true, Ordering::SeqCst);

    let error = harness
        .coordinator
        .submit(spec(NetworkMode::Bridge))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "RESOURCE_EXHAUSTED");
    assert_eq!(harness.isolation.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(harness.isolation.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
async fn attach_failure_is_tolerated() {
    let harness = harness(FakeProcess::exiting_with(JobExit {
        code: Some(0),
        signal: None,
        oom_killed: false,
    }));
    harness.network.fail_attach.store(true, Ordering::SeqCst);

    let job_id = harness
        .coordinator
        .submit(spec(NetworkMode::Bridge))
        .await
        .unwrap();

    // The job still runs to completion without connectivity.
    let job = wait_for_status(&harness.store, &job_id, JobStatus::Completed).await;
    assert_eq!(job.exit_code, Some(0));
}

#[test]
async fn stop_terminates_with_sigterm_exit_code() {
    let harness = harness(FakeProcess::long_running());

    let job_id = harness
        .coordinator
        .submit(spec(NetworkMode::None))
        .await
        .unwrap();
    wait_for_status(&harness.store, &job_id, JobStatus::Running).await;

    harness.coordinator.stop(&job_id).await.unwrap();

    let job = wait_for_status(&harness.store, &job_id, JobStatus::Stopped).await;
    assert_eq!(job.exit_code, Some(143));
    assert_eq!(harness.isolation.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
async fn stopping_a_terminal_job_is_a_conflict() {
    let harness = harness(FakeProcess::exiting_with(JobExit {
        code: Some(0),
        signal: None,
        oom_killed: false,
    }));

    let job_id = harness
        .coordinator
        .submit(spec(NetworkMode::None))
        .await
        .unwrap();
    wait_for_status(&harness.store, &job_id, JobStatus::Completed).await;

    let result = harness.coordinator.stop(&job_id).await;
    assert!(matches!(result, Err(JobletError::Conflict(_))));
}

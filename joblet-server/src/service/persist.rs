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

//! Client side of the persistence subprocess. The server never talks to
//! cloud storage itself: every mutation is queued towards `joblet-persist`
//! over its Unix-domain gRPC socket, so cloud credentials stay out of the
//! root-privileged process.

use crate::config::PersistenceConfig;
use crate::metrics;
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use joblet_api_grpc::proto::joblet::persist::v1::persist_service_client::PersistServiceClient;
use joblet_api_grpc::proto::joblet::persist::v1::{
    append_log_response, append_metric_response, delete_job_response, list_jobs_response,
    put_job_response, AppendLogRequest, AppendMetricRequest, DeleteJobRequest, ListJobsRequest,
    PutJobRequest,
};
use joblet_api_grpc::proto::joblet::{common, job::v1 as job_proto};
use joblet_common::error::JobletError;
use joblet_common::model::{Job, JobId, LogEvent, MetricSample};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, error, info, warn};

/// The job store and event buses mirror through this interface; tests and
/// the persistence-disabled mode plug in the no-op implementation.
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Enqueue a job state mirror. `PERSIST_FAILED` when the queue is
    /// full; the caller must roll the mutation back.
    async fn put_job(&self, job: &Job) -> Result<(), JobletError>;

    async fn delete_job(&self, job_id: &JobId) -> Result<(), JobletError>;

    /// Log/metric appends are best-effort; overflow drops the event.
    async fn append_log(&self, event: &LogEvent) -> Result<(), JobletError>;

    async fn append_metric(&self, sample: &MetricSample) -> Result<(), JobletError>;

    /// Direct (non-queued) read used for crash recovery at startup.
    async fn list_jobs(&self) -> Result<Vec<Job>, JobletError>;

    fn queue_depth(&self) -> u64;

    fn is_degraded(&self) -> bool;
}

/// Used when persistence is disabled in config, and by tests.
pub struct DisabledPersistence;

#[async_trait]
impl PersistenceClient for DisabledPersistence {
    async fn put_job(&self, _job: &Job) -> Result<(), JobletError> {
        Ok(())
    }

    async fn delete_job(&self, _job_id: &JobId) -> Result<(), JobletError> {
        Ok(())
    }

    async fn append_log(&self, _event: &LogEvent) -> Result<(), JobletError> {
        Ok(())
    }

    async fn append_metric(&self, _sample: &MetricSample) -> Result<(), JobletError> {
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, JobletError> {
        Ok(Vec::new())
    }

    fn queue_depth(&self) -> u64 {
        0
    }

    fn is_degraded(&self) -> bool {
        false
    }
}

#[derive(Debug)]
enum Mutation {
    PutJob(Box<job_proto::Job>),
    DeleteJob(common::Uuid),
    AppendLog(job_proto::LogEvent),
    AppendMetric(job_proto::MetricSample),
}

pub struct SubprocessPersistence {
    sender: mpsc::Sender<Mutation>,
    depth: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
    config: PersistenceConfig,
    rpc_timeout: Duration,
    reader: Mutex<Option<PersistServiceClient<Channel>>>,
}

impl SubprocessPersistence {
    /// Starts the subprocess supervisor and the queue drainer. Both run
    /// until the cancellation token fires.
    pub fn start(
        config: PersistenceConfig,
        rpc_timeout: Duration,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_max);
        let depth = Arc::new(AtomicU64::new(0));
        let degraded = Arc::new(AtomicBool::new(false));

        let client = Arc::new(Self {
            sender,
            depth: depth.clone(),
            degraded: degraded.clone(),
            config: config.clone(),
            rpc_timeout,
            reader: Mutex::new(None),
        });

        tokio::spawn(supervise_subprocess(
            config.clone(),
            cancellation.clone(),
        ));
        tokio::spawn(drain_queue(
            config,
            rpc_timeout,
            receiver,
            depth,
            degraded,
            cancellation,
        ));

        client
    }

    fn enqueue(&self, mutation: Mutation) -> Result<(), JobletError> {
        match self.sender.try_send(mutation) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_persist_queue_depth(depth);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(JobletError::PersistFailed(format!(
                "persistence queue full ({} entries)",
                self.config.queue_max
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(JobletError::PersistFailed(
                "persistence queue closed".to_string(),
            )),
        }
    }

    async fn reader_client(&self) -> Result<PersistServiceClient<Channel>, JobletError> {
        let mut guard = self.reader.lock().await;
        if guard.is_none() {
            let client = connect(&self.config.socket_path)
                .await
                .map_err(|err| JobletError::PersistDegraded(err.to_string()))?;
            *guard = Some(client);
        }
        Ok(guard.as_ref().unwrap().clone())
    }
}

#[async_trait]
impl PersistenceClient for SubprocessPersistence {
    async fn put_job(&self, job: &Job) -> Result<(), JobletError> {
        self.enqueue(Mutation::PutJob(Box::new(job.clone().into())))
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<(), JobletError> {
        self.enqueue(Mutation::DeleteJob((*job_id).into()))
    }

    async fn append_log(&self, event: &LogEvent) -> Result<(), JobletError> {
        self.enqueue(Mutation::AppendLog(event.clone().into()))
    }

    async fn append_metric(&self, sample: &MetricSample) -> Result<(), JobletError> {
        self.enqueue(Mutation::AppendMetric((*sample).into()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, JobletError> {
        let mut client = self.reader_client().await?;
        let response = tokio::time::timeout(
            self.rpc_timeout,
            client.list_jobs(ListJobsRequest {}),
        )
        .await
        .map_err(|_| JobletError::timeout("persist-list-jobs", self.rpc_timeout))?
        .map_err(|status| JobletError::PersistDegraded(status.to_string()))?
        .into_inner();

        match response.result {
            Some(list_jobs_response::Result::Success(success)) => success
                .jobs
                .into_iter()
                .map(|job| Job::try_from(job).map_err(JobletError::internal))
                .collect(),
            Some(list_jobs_response::Result::Error(error)) => Err(JobletError::PersistDegraded(
                format!("{error:?}"),
            )),
            None => Err(JobletError::PersistDegraded("empty response".to_string())),
        }
    }

    fn queue_depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

async fn connect(socket_path: &std::path::Path) -> Result<PersistServiceClient<Channel>, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();
    let channel = Endpoint::try_from("http://joblet-persist")
        .expect("static endpoint uri")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(PersistServiceClient::new(channel)
        .send_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Gzip))
}

fn subprocess_binary(config: &PersistenceConfig) -> PathBuf {
    if config.subprocess_path.as_os_str().is_empty() {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("joblet-persist")))
            .unwrap_or_else(|| PathBuf::from("joblet-persist"))
    } else {
        config.subprocess_path.clone()
    }
}

/// Keeps the joblet-persist subprocess alive. A crash is logged and the
/// process restarted with exponential backoff (100 ms doubling to the
/// 30 s cap); a clean startup resets the backoff.
async fn supervise_subprocess(config: PersistenceConfig, cancellation: CancellationToken) {
    let binary = subprocess_binary(&config);
    let mut attempt: u32 = 0;

    loop {
        if cancellation.is_cancelled() {
            break;
        }

        let mut command = tokio::process::Command::new(&binary);
        command
            .env(
                "JOBLET_PERSIST__SOCKET_PATH",
                config.socket_path.as_os_str(),
            )
            .kill_on_drop(true);

        match command.spawn() {
            Ok(mut child) => {
                info!(
                    "Started persistence subprocess {} (pid {:?})",
                    binary.display(),
                    child.id()
                );
                attempt = 0;
                tokio::select! {
                    status = child.wait() => {
                        warn!("Persistence subprocess exited: {status:?}");
                    }
                    _ = cancellation.cancelled() => {
                        let _ = child.start_kill();
                        break;
                    }
                }
            }
            Err(err) => {
                error!("Failed to spawn {}: {err}", binary.display());
            }
        }

        attempt += 1;
        let delay = config.restart.delay_for_attempt(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancellation.cancelled() => break,
        }
    }
}

/// Pulls mutations off the queue and delivers them over the socket.
/// While the subprocess is unreachable the current mutation is retried
/// with backoff and the degraded flag stays up; queued work is preserved.
async fn drain_queue(
    config: PersistenceConfig,
    rpc_timeout: Duration,
    mut receiver: mpsc::Receiver<Mutation>,
    depth: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
    cancellation: CancellationToken,
) {
    let mut client: Option<PersistServiceClient<Channel>> = None;
    let mut reconnect_attempt: u32 = 0;

    loop {
        let mutation = tokio::select! {
            mutation = receiver.recv() => match mutation {
                Some(mutation) => mutation,
                None => break,
            },
            _ = cancellation.cancelled() => break,
        };

        loop {
            if client.is_none() {
                match connect(&config.socket_path).await {
                    Ok(connected) => {
                        client = Some(connected);
                        reconnect_attempt = 0;
                        degraded.store(false, Ordering::Relaxed);
                        metrics::record_persist_degraded(false);
                    }
                    Err(err) => {
                        degraded.store(true, Ordering::Relaxed);
                        metrics::record_persist_degraded(true);
                        reconnect_attempt += 1;
                        let delay = config.restart.delay_for_attempt(reconnect_attempt);
                        debug!("Persistence socket unavailable, retrying in {delay:?}: {err}");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancellation.cancelled() => return,
                        }
                    }
                }
            }

            let delivery = deliver(client.as_mut().unwrap(), &mutation, rpc_timeout).await;
            match delivery {
                Ok(()) => {
                    let remaining = depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                    metrics::record_persist_queue_depth(remaining);
                    break;
                }
                Err(err) => {
                    warn!("Persistence delivery failed, will retry: {err}");
                    client = None;
                }
            }
        }
    }
}

async fn deliver(
    client: &mut PersistServiceClient<Channel>,
    mutation: &Mutation,
    rpc_timeout: Duration,
) -> Result<(), String> {
    match mutation {
        Mutation::PutJob(job) => {
            let response = tokio::time::timeout(
                rpc_timeout,
                client.put_job(PutJobRequest {
                    job: Some(job.as_ref().clone()),
                }),
            )
            .await
            .map_err(|_| "put-job timed out".to_string())?
            .map_err(|status| status.to_string())?
            .into_inner();
            match response.result {
                Some(put_job_response::Result::Success(_)) => Ok(()),
                Some(put_job_response::Result::Error(error)) => Err(format!("{error:?}")),
                None => Err("empty response".to_string()),
            }
        }
        Mutation::DeleteJob(job_id) => {
            let response = tokio::time::timeout(
                rpc_timeout,
                client.delete_job(DeleteJobRequest {
                    job_id: Some(job_id.clone()),
                }),
            )
            .await
            .map_err(|_| "delete-job timed out".to_string())?
            .map_err(|status| status.to_string())?
            .into_inner();
            match response.result {
                Some(delete_job_response::Result::Success(_)) => Ok(()),
                Some(delete_job_response::Result::Error(error)) => Err(format!("{error:?}")),
                None => Err("empty response".to_string()),
            }
        }
        Mutation::AppendLog(event) => {
            let response = tokio::time::timeout(
                rpc_timeout,
                client.append_log(AppendLogRequest {
                    event: Some(event.clone()),
                }),
            )
            .await
            .map_err(|_| "append-log timed out".to_string())?
            .map_err(|status| status.to_string())?
            .into_inner();
            match response.result {
                Some(append_log_response::Result::Success(_)) => Ok(()),
                Some(append_log_response::Result::Error(error)) => Err(format!("{error:?}")),
                None => Err("empty response".to_string()),
            }
        }
        Mutation::AppendMetric(sample) => {
            let response = tokio::time::timeout(
                rpc_timeout,
                client.append_metric(AppendMetricRequest {
                    sample: Some(sample.clone()),
                }),
            )
            .await
            .map_err(|_| "append-metric timed out".to_string())?
            .map_err(|status| status.to_string())?
            .into_inner();
            match response.result {
                Some(append_metric_response::Result::Success(_)) => Ok(()),
                Some(append_metric_response::Result::Error(error)) => Err(format!("{error:?}")),
                None => Err("empty response".to_string()),
            }
        }
    }
}

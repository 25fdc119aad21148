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

//! Periodic cgroup statistics, fanned out like the log bus but without a
//! replay store: samples are current-only.

use crate::config::SamplerConfig;
use crate::service::cgroup;
use crate::service::persist::PersistenceClient;
use chrono::Utc;
use joblet_common::error::JobletError;
use joblet_common::model::{JobId, MetricSample};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct JobSamplerChannel {
    sender: broadcast::Sender<MetricSample>,
    cancellation: CancellationToken,
}

pub struct MetricsSampler {
    config: SamplerConfig,
    cgroup_io_timeout: Duration,
    persistence: Arc<dyn PersistenceClient>,
    channels: RwLock<HashMap<JobId, JobSamplerChannel>>,
}

impl MetricsSampler {
    pub fn new(
        config: SamplerConfig,
        cgroup_io_timeout: Duration,
        persistence: Arc<dyn PersistenceClient>,
    ) -> Self {
        Self {
            config,
            cgroup_io_timeout,
            persistence,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Start sampling a running job's cgroup. Sampling stops (with one
    /// final sample) when `stop` is called at the terminal transition.
    pub async fn start(self: Arc<Self>, job_id: JobId, cgroup_path: PathBuf) {
        let (sender, _) = broadcast::channel(64);
        let cancellation = CancellationToken::new();
        {
            let mut channels = self.channels.write().await;
            channels.insert(
                job_id,
                JobSamplerChannel {
                    sender: sender.clone(),
                    cancellation: cancellation.clone(),
                },
            );
        }

        let sampler = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sampler.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous_cpu_usec: Option<u64> = None;
            let mut previous_io: Option<(u64, u64)> = None;
            let mut previous_instant = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancellation.cancelled() => break,
                }

                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(previous_instant);
                previous_instant = now;

                match sampler
                    .read_sample(
                        &job_id,
                        &cgroup_path,
                        elapsed,
                        &mut previous_cpu_usec,
                        &mut previous_io,
                        false,
                    )
                    .await
                {
                    Ok(sample) => {
                        let _ = sender.send(sample);
                        if let Err(err) = sampler.persistence.append_metric(&sample).await {
                            debug!(job_id = %job_id, "Dropped metric mirror: {err}");
                        }
                    }
                    Err(err) => {
                        debug!(job_id = %job_id, "Metric sample failed: {err}");
                    }
                }
            }

            // Always emit a final sample so subscribers observe the end.
            let final_sample = sampler
                .read_sample(
                    &job_id,
                    &cgroup_path,
                    previous_instant.elapsed(),
                    &mut previous_cpu_usec,
                    &mut previous_io,
                    true,
                )
                .await
                .unwrap_or(MetricSample {
                    job_id,
                    cpu_percent: 0.0,
                    memory_current_bytes: 0,
                    memory_max_bytes: 0,
                    memory_peak_bytes: 0,
                    io_read_bytes: 0,
                    io_write_bytes: 0,
                    pids_current: 0,
                    timestamp: Utc::now(),
                    is_final: true,
                });
            let _ = sender.send(final_sample);
            let _ = sampler.persistence.append_metric(&final_sample).await;
        });
    }

    pub async fn stop(&self, job_id: &JobId) {
        let channels = self.channels.read().await;
        if let Some(channel) = channels.get(job_id) {
            channel.cancellation.cancel();
        }
    }

    pub async fn remove(&self, job_id: &JobId) {
        self.channels.write().await.remove(job_id);
    }

    pub async fn subscribe(
        &self,
        job_id: &JobId,
    ) -> Result<broadcast::Receiver<MetricSample>, JobletError> {
        self.channels
            .read()
            .await
            .get(job_id)
            .map(|channel| channel.sender.subscribe())
            .ok_or_else(|| {
                JobletError::not_found(format!("No metric channel for job {job_id}"))
            })
    }

    async fn read_sample(
        &self,
        job_id: &JobId,
        cgroup_path: &Path,
        elapsed: Duration,
        previous_cpu_usec: &mut Option<u64>,
        previous_io: &mut Option<(u64, u64)>,
        is_final: bool,
    ) -> Result<MetricSample, JobletError> {
        let timeout = self.cgroup_io_timeout;

        let cpu_stat = cgroup::read_control(&cgroup_path.join("cpu.stat"), timeout)
            .await
            .map_err(|err| JobletError::internal(err.to_string()))?;
        let usage_usec = cgroup::parse_flat_keyed(&cpu_stat)
            .get("usage_usec")
            .copied()
            .unwrap_or(0);
        let cpu_percent = match *previous_cpu_usec {
            Some(previous) if elapsed > Duration::ZERO => {
                let delta = usage_usec.saturating_sub(previous) as f64;
                (delta / elapsed.as_micros() as f64) * 100.0
            }
            _ => 0.0,
        };
        *previous_cpu_usec = Some(usage_usec);

        let memory_current = cgroup::read_control(&cgroup_path.join("memory.current"), timeout)
            .await
            .map(|contents| cgroup::parse_single_value(&contents))
            .unwrap_or(0);
        let memory_max = cgroup::read_control(&cgroup_path.join("memory.max"), timeout)
            .await
            .map(|contents| cgroup::parse_single_value(&contents))
            .unwrap_or(u64::MAX);
        let memory_peak = cgroup::read_control(&cgroup_path.join("memory.peak"), timeout)
            .await
            .map(|contents| cgroup::parse_single_value(&contents))
            .unwrap_or(0);

        let io_stat = cgroup::read_control(&cgroup_path.join("io.stat"), timeout)
            .await
            .map(|contents| cgroup::parse_io_stat(&contents))
            .unwrap_or((0, 0));
        let (io_read_delta, io_write_delta) = match *previous_io {
            Some((previous_read, previous_written)) => (
                io_stat.0.saturating_sub(previous_read),
                io_stat.1.saturating_sub(previous_written),
            ),
            None => (0, 0),
        };
        *previous_io = Some(io_stat);

        let pids_current = cgroup::read_control(&cgroup_path.join("pids.current"), timeout)
            .await
            .map(|contents| cgroup::parse_single_value(&contents))
            .unwrap_or(0);

        Ok(MetricSample {
            job_id: *job_id,
            cpu_percent,
            memory_current_bytes: memory_current,
            memory_max_bytes: memory_max,
            memory_peak_bytes: memory_peak,
            io_read_bytes: io_read_delta,
            io_write_bytes: io_write_delta,
            pids_current,
            timestamp: Utc::now(),
            is_final,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::service::persist::DisabledPersistence;

    fn write_cgroup_fixture(dir: &Path) {
        std::fs::write(dir.join("cpu.stat"), "usage_usec 2000000\n").unwrap();
        std::fs::write(dir.join("memory.current"), "1048576\n").unwrap();
        std::fs::write(dir.join("memory.max"), "134217728\n").unwrap();
        std::fs::write(dir.join("memory.peak"), "2097152\n").unwrap();
        std::fs::write(dir.join("io.stat"), "8:0 rbytes=4096 wbytes=8192\n").unwrap();
        std::fs::write(dir.join("pids.current"), "3\n").unwrap();
    }

    #[test]
    async fn final_sample_is_always_emitted() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup_fixture(dir.path());

        let sampler = Arc::new(MetricsSampler::new(
            SamplerConfig {
                interval: Duration::from_millis(20),
            },
            Duration::from_millis(500),
            Arc::new(DisabledPersistence),
        ));

        let job_id = JobId::new_v4();
        sampler.clone().start(job_id, dir.path().to_path_buf()).await;
        let mut subscription = sampler.subscribe(&job_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        sampler.stop(&job_id).await;

        let mut saw_final = false;
        while let Ok(sample) =
            tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await
        {
            match sample {
                Ok(sample) => {
                    assert_eq!(sample.job_id, job_id);
                    if sample.is_final {
                        saw_final = true;
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(saw_final);
    }

    #[test]
    async fn samples_carry_cgroup_values() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup_fixture(dir.path());

        let sampler = Arc::new(MetricsSampler::new(
            SamplerConfig {
                interval: Duration::from_millis(10),
            },
            Duration::from_millis(500),
            Arc::new(DisabledPersistence),
        ));

        let job_id = JobId::new_v4();
        sampler.clone().start(job_id, dir.path().to_path_buf()).await;
        let mut subscription = sampler.subscribe(&job_id).await.unwrap();

        let sample = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.memory_current_bytes, 1_048_576);
        assert_eq!(sample.memory_peak_bytes, 2_097_152);
        assert_eq!(sample.pids_current, 3);

        sampler.stop(&job_id).await;
    }
}

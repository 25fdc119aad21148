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

//! Exclusive integer-GPU allocation. The device table is probed once at
//! startup; memory accounting is static from that probe.

use crate::model::GpuDevice;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::JobId;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait GpuAllocator: Send + Sync {
    /// Claim `count` GPUs with at least `memory_mb` free each, ascending
    /// index order. `RESOURCE_EXHAUSTED` when that is not possible.
    async fn allocate(
        &self,
        job_id: &JobId,
        count: u32,
        memory_mb: u32,
    ) -> Result<Vec<u32>, JobletError>;

    /// Free everything the job holds. Releasing a job that owns nothing
    /// is a warning, not an error.
    async fn release(&self, job_id: &JobId);

    async fn snapshot(&self) -> Vec<GpuDevice>;
}

pub struct StaticGpuAllocator {
    devices: Mutex<Vec<GpuDevice>>,
}

impl StaticGpuAllocator {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Probe GPUs via the `nvidia-smi`-compatible command. A failing
    /// probe disables GPU scheduling cleanly instead of failing startup.
    pub async fn probe(probe_command: &str, command_timeout: Duration) -> Self {
        let output = tokio::time::timeout(
            command_timeout,
            tokio::process::Command::new(probe_command)
                .args([
                    "--query-gpu=index,memory.total,memory.free",
                    "--format=csv,noheader,nounits",
                ])
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let devices = parse_probe_output(&stdout);
                info!("GPU probe found {} device(s)", devices.len());
                Self::new(devices)
            }
            Ok(Ok(output)) => {
                info!(
                    "GPU probe exited with {:?}; GPU scheduling disabled",
                    output.status.code()
                );
                Self::disabled()
            }
            Ok(Err(err)) => {
                info!("GPU probe unavailable ({err}); GPU scheduling disabled");
                Self::disabled()
            }
            Err(_) => {
                warn!("GPU probe timed out; GPU scheduling disabled");
                Self::disabled()
            }
        }
    }
}

fn parse_probe_output(stdout: &str) -> Vec<GpuDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse().ok()?;
            let memory_total_mb = fields.next()?.parse().ok()?;
            let memory_free_mb = fields.next()?.parse().ok()?;
            Some(GpuDevice {
                index,
                memory_total_mb,
                memory_free_mb,
                owner: None,
            })
        })
        .collect()
}

#[async_trait]
impl GpuAllocator for StaticGpuAllocator {
    async fn allocate(
        &self,
        job_id: &JobId,
        count: u32,
        memory_mb: u32,
    ) -> Result<Vec<u32>, JobletError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut devices = self.devices.lock().expect("gpu table lock");
        let candidates: Vec<usize> = devices
            .iter()
            .enumerate()
            .filter(|(_, device)| {
                device.owner.is_none() && device.memory_free_mb >= memory_mb as u64
            })
            .map(|(position, _)| position)
            .take(count as usize)
            .collect();

        if candidates.len() < count as usize {
            return Err(JobletError::ResourceExhausted(format!(
                "insufficient GPUs: requested {count} with {memory_mb} MiB free, {} available",
                candidates.len()
            )));
        }

        let mut indices = Vec::with_capacity(candidates.len());
        for position in candidates {
            let device = &mut devices[position];
            device.owner = Some(*job_id);
            device.memory_free_mb = device.memory_free_mb.saturating_sub(memory_mb as u64);
            indices.push(device.index);
        }
        Ok(indices)
    }

    async fn release(&self, job_id: &JobId) {
        let mut devices = self.devices.lock().expect("gpu table lock");
        let mut released = 0;
        for device in devices.iter_mut() {
            if device.owner == Some(*job_id) {
                device.owner = None;
                device.memory_free_mb = device.memory_total_mb;
                released += 1;
            }
        }
        if released == 0 {
            warn!(job_id = %job_id, "GPU release for a job that owns no devices");
        }
    }

    async fn snapshot(&self) -> Vec<GpuDevice> {
        self.devices.lock().expect("gpu table lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn allocator(count: u32, memory_mb: u64) -> StaticGpuAllocator {
        StaticGpuAllocator::new(
            (0..count)
                .map(|index| GpuDevice {
                    index,
                    memory_total_mb: memory_mb,
                    memory_free_mb: memory_mb,
                    owner: None,
                })
                .collect(),
        )
    }

    #[test]
    async fn allocates_ascending_indices() {
        let allocator = allocator(4, 16_000);
        let job = JobId::new_v4();
        let indices = allocator.allocate(&job, 2, 8_000).await.unwrap();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    async fn exhaustion_is_reported() {
        let allocator = allocator(2, 16_000);
        let first = JobId::new_v4();
        allocator.allocate(&first, 2, 8_000).await.unwrap();

        let second = JobId::new_v4();
        let result = allocator.allocate(&second, 1, 8_000).await;
        assert!(matches!(result, Err(JobletError::ResourceExhausted(_))));
    }

    #[test]
    async fn release_restores_the_free_set() {
        let allocator = allocator(2, 16_000);
        let job = JobId::new_v4();
        allocator.allocate(&job, 2, 8_000).await.unwrap();
        allocator.release(&job).await;

        let other = JobId::new_v4();
        let indices = allocator.allocate(&other, 2, 16_000).await.unwrap();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    async fn memory_requirement_filters_devices() {
        let allocator = StaticGpuAllocator::new(vec![
            GpuDevice {
                index: 0,
                memory_total_mb: 8_000,
                memory_free_mb: 4_000,
                owner: None,
            },
            GpuDevice {
                index: 1,
                memory_total_mb: 24_000,
                memory_free_mb: 24_000,
                owner: None,
            },
        ]);
        let job = JobId::new_v4();
        let indices = allocator.allocate(&job, 1, 10_000).await.unwrap();
        assert_eq!(indices, vec![1]);
    }

    #[test]
    fn probe_output_parsing() {
        let devices = parse_probe_output("0, 24576, 24000\n1, 24576, 12000\n");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].index, 1);
        assert_eq!(devices[1].memory_free_mb, 12_000);
    }
}

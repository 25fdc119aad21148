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

use joblet_common::config::ConfigLoader;
use joblet_common::model::JobId;
use joblet_common::retries::RetryConfig;
use joblet_common::tracing::TracingConfig;
use joblet_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobletConfig {
    pub tracing: TracingConfig,
    pub node_id: String,
    pub address: String,
    pub grpc_port: u16,
    pub security: SecurityConfig,
    pub paths: PathsConfig,
    pub network: NetworkConfig,
    pub gpu: GpuConfig,
    pub log_bus: LogBusConfig,
    pub sampler: SamplerConfig,
    pub persistence: PersistenceConfig,
    pub timeouts: TimeoutsConfig,
}

impl Default for JobletConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("joblet-server"),
            node_id: "default".to_string(),
            address: "0.0.0.0".to_string(),
            grpc_port: 50051,
            security: SecurityConfig::default(),
            paths: PathsConfig::default(),
            network: NetworkConfig::default(),
            gpu: GpuConfig::default(),
            log_bus: LogBusConfig::default(),
            sampler: SamplerConfig::default(),
            persistence: PersistenceConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl SafeDisplay for JobletConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "node id: {}", self.node_id);
        let _ = writeln!(&mut result, "address: {}:{}", self.address, self.grpc_port);
        let _ = writeln!(&mut result, "security:");
        let _ = writeln!(&mut result, "{}", self.security.to_safe_string_indented());
        let _ = writeln!(&mut result, "paths:");
        let _ = writeln!(&mut result, "{}", self.paths.to_safe_string_indented());
        let _ = writeln!(&mut result, "network:");
        let _ = writeln!(&mut result, "{}", self.network.to_safe_string_indented());
        let _ = writeln!(&mut result, "persistence:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.persistence.to_safe_string_indented()
        );
        result
    }
}

/// mTLS material embedded into the config file as PEM blocks, written by
/// the installer with mode 0600.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub ca_cert_pem: String,
}

impl SecurityConfig {
    pub fn is_enabled(&self) -> bool {
        !self.server_cert_pem.is_empty()
    }
}

impl SafeDisplay for SecurityConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "mTLS: {}",
            if self.is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );
        let _ = writeln!(&mut result, "server key: ****");
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    pub base_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub volumes_dir: PathBuf,
    pub runtimes_dir: PathBuf,
    pub run_dir: PathBuf,
    pub cgroup_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/opt/joblet"),
            jobs_dir: PathBuf::from("/opt/joblet/jobs"),
            volumes_dir: PathBuf::from("/opt/joblet/volumes"),
            runtimes_dir: PathBuf::from("/opt/joblet/runtimes"),
            run_dir: PathBuf::from("/opt/joblet/run"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/joblet.slice"),
        }
    }
}

impl PathsConfig {
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.jobs_dir.join(job_id.to_string())
    }

    pub fn workspace_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("work")
    }

    pub fn rootfs_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("rootfs")
    }

    pub fn log_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("log")
    }

    pub fn cgroup_dir(&self, job_id: &JobId) -> PathBuf {
        self.cgroup_root.join(format!("job-{job_id}"))
    }
}

impl SafeDisplay for PathsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "base dir: {}", self.base_dir.display());
        let _ = writeln!(&mut result, "jobs dir: {}", self.jobs_dir.display());
        let _ = writeln!(&mut result, "volumes dir: {}", self.volumes_dir.display());
        let _ = writeln!(&mut result, "runtimes dir: {}", self.runtimes_dir.display());
        let _ = writeln!(&mut result, "run dir: {}", self.run_dir.display());
        let _ = writeln!(&mut result, "cgroup root: {}", self.cgroup_root.display());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub bridge_cidr: String,
    /// NAT backend: "auto", "firewalld", "nftables" or "iptables".
    pub nat_backend: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "joblet0".to_string(),
            bridge_cidr: "172.20.0.0/16".to_string(),
            nat_backend: "auto".to_string(),
        }
    }
}

impl SafeDisplay for NetworkConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "bridge: {}", self.bridge_name);
        let _ = writeln!(&mut result, "cidr: {}", self.bridge_cidr);
        let _ = writeln!(&mut result, "nat backend: {}", self.nat_backend);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuConfig {
    pub enabled: bool,
    pub probe_command: String,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_command: "nvidia-smi".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogBusConfig {
    pub chunk_bytes: usize,
    pub ring_max_bytes: usize,
    pub ring_max_events: usize,
    pub segment_bytes: u64,
}

impl Default for LogBusConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 16 * 1024,
            ring_max_bytes: 8 * 1024 * 1024,
            ring_max_events: 50_000,
            segment_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// The storage backend itself (and any cloud credentials) is configured
/// in the joblet-persist subprocess's own config file; the server only
/// supervises the subprocess and queues mutations towards it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub socket_path: PathBuf,
    /// Path of the joblet-persist binary; empty means "next to this binary".
    pub subprocess_path: PathBuf,
    pub queue_max: usize,
    pub restart: RetryConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from("/opt/joblet/run/persist-grpc.sock"),
            subprocess_path: PathBuf::new(),
            queue_max: 10_000,
            restart: RetryConfig::supervisor(),
        }
    }
}

impl SafeDisplay for PersistenceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "enabled: {}", self.enabled);
        let _ = writeln!(&mut result, "socket: {}", self.socket_path.display());
        let _ = writeln!(&mut result, "queue max: {}", self.queue_max);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(with = "humantime_serde")]
    pub persist_rpc: Duration,
    #[serde(with = "humantime_serde")]
    pub cgroup_io: Duration,
    #[serde(with = "humantime_serde")]
    pub external_command: Duration,
    #[serde(with = "humantime_serde")]
    pub network_ready: Duration,
    #[serde(with = "humantime_serde")]
    pub graceful_stop: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            persist_rpc: Duration::from_secs(2),
            cgroup_io: Duration::from_millis(500),
            external_command: Duration::from_secs(5),
            network_ready: Duration::from_secs(30),
            graceful_stop: Duration::from_secs(10),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<JobletConfig> {
    ConfigLoader::new(Path::new("/opt/joblet/config/joblet-config.yml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    pub fn default_config_is_loadable() {
        // The installed config file is absent in dev; defaults must be a
        // complete, runnable configuration on their own.
        let loader: ConfigLoader<JobletConfig> =
            ConfigLoader::new(Path::new("/nonexistent/joblet-config.yml"));
        let config = loader.load().expect("Failed to load config");
        assert_eq!(config.grpc_port, 50051);
        assert_eq!(config.network.bridge_name, "joblet0");
        assert_eq!(config.persistence.queue_max, 10_000);
        assert_eq!(config.timeouts.graceful_stop, Duration::from_secs(10));
    }

    #[test]
    pub fn job_paths_are_derived_from_base() {
        let paths = PathsConfig::default();
        let job_id: JobId = "00000000-0000-0000-0000-000000000001".parse().unwrap();
        assert_eq!(
            paths.workspace_dir(&job_id),
            PathBuf::from("/opt/joblet/jobs/00000000-0000-0000-0000-000000000001/work")
        );
        assert_eq!(
            paths.cgroup_dir(&job_id),
            PathBuf::from(
                "/sys/fs/cgroup/joblet.slice/job-00000000-0000-0000-0000-000000000001"
            )
        );
    }
}

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
use joblet_common::tracing::TracingConfig;
use joblet_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobletPersistConfig {
    pub tracing: TracingConfig,
    pub node_id: String,
    pub socket_path: PathBuf,
    pub backend: BackendConfig,
}

impl Default for JobletPersistConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("joblet-persist"),
            node_id: "default".to_string(),
            socket_path: PathBuf::from("/opt/joblet/run/persist-grpc.sock"),
            backend: BackendConfig::default(),
        }
    }
}

impl SafeDisplay for JobletPersistConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "node id: {}", self.node_id);
        let _ = writeln!(&mut result, "socket: {}", self.socket_path.display());
        let _ = writeln!(&mut result, "backend:");
        let _ = writeln!(&mut result, "{}", self.backend.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum BackendConfig {
    Local(LocalBackendConfig),
    Cloudwatch(CloudwatchBackendConfig),
    Dynamodb(DynamodbBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local(LocalBackendConfig::default())
    }
}

impl SafeDisplay for BackendConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            BackendConfig::Local(config) => {
                let _ = writeln!(&mut result, "local:");
                let _ = writeln!(
                    &mut result,
                    "  state dir: {}",
                    config.state_dir.display()
                );
            }
            BackendConfig::Cloudwatch(config) => {
                let _ = writeln!(&mut result, "cloudwatch:");
                let _ = writeln!(&mut result, "  region: {}", config.region);
                let _ = writeln!(
                    &mut result,
                    "  metric namespace: {}",
                    config.metric_namespace
                );
            }
            BackendConfig::Dynamodb(config) => {
                let _ = writeln!(&mut result, "dynamodb:");
                let _ = writeln!(&mut result, "  region: {}", config.region);
                let _ = writeln!(&mut result, "  table: {}", config.table);
                let _ = writeln!(&mut result, "  ttl days: {}", config.ttl_days);
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalBackendConfig {
    pub state_dir: PathBuf,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/opt/joblet/logs/state"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudwatchBackendConfig {
    pub region: String,
    pub metric_namespace: String,
}

impl Default for CloudwatchBackendConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            metric_namespace: "Joblet".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DynamodbBackendConfig {
    pub region: String,
    pub table: String,
    /// Days after the item is written before DynamoDB expires it.
    pub ttl_days: u32,
}

impl Default for DynamodbBackendConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            table: "joblet-jobs".to_string(),
            ttl_days: 30,
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<JobletPersistConfig> {
    ConfigLoader::new_with_prefix(
        Path::new("/opt/joblet/config/joblet-persist.yml"),
        "JOBLET_PERSIST__",
    )
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    pub fn default_config_is_loadable() {
        let loader: ConfigLoader<JobletPersistConfig> = ConfigLoader::new_with_prefix(
            Path::new("/nonexistent/joblet-persist.yml"),
            "JOBLET_PERSIST_TEST__",
        );
        let config = loader.load().expect("Failed to load config");
        assert!(matches!(config.backend, BackendConfig::Local(_)));
        assert_eq!(
            config.socket_path,
            PathBuf::from("/opt/joblet/run/persist-grpc.sock")
        );
    }
}

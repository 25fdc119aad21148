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

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Layered config loading: compiled-in defaults, overridden by the YAML
/// config file, overridden by `JOBLET__`-prefixed environment variables
/// (`JOBLET__GRPC_PORT=50052`, `JOBLET__TRACING__JSON=true`).
pub struct ConfigLoader<T: Default + Serialize + DeserializeOwned> {
    pub config_file_name: PathBuf,
    env_prefix: &'static str,
    phantom: PhantomData<T>,
}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self::new_with_prefix(config_file_name, "JOBLET__")
    }

    pub fn new_with_prefix(config_file_name: &Path, env_prefix: &'static str) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            env_prefix,
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Yaml::file(&self.config_file_name))
            .merge(Env::prefixed(self.env_prefix).split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    /// Standard server startup entry point: `--dump-config` prints the
    /// effective default configuration and exits, otherwise the merged
    /// config is loaded. Unloadable config is a startup failure.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let defaults = T::default();
            match serde_yaml::to_string(&defaults) {
                Ok(yaml) => println!("{yaml}"),
                Err(err) => eprintln!("Failed to render default config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!(
                        "Failed to load config from {}: {err}",
                        self.config_file_name.display()
                    );
                    std::process::exit(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestConfig {
        port: u16,
        name: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                port: 50051,
                name: "default".to_string(),
            }
        }
    }

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(Path::new("/nonexistent/config.yml"));
        let config = loader.load().unwrap();
        assert_eq!(config.port, 50051);
        assert_eq!(config.name, "default");
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yml").unwrap();
        writeln!(file, "port: 9000").unwrap();
        let loader: ConfigLoader<TestConfig> = ConfigLoader::new(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.name, "default");
    }
}

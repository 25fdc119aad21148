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

//! Runtimes are pre-staged directory trees (interpreter + libraries) that
//! are bind-mounted over a job root at /runtime. Installation runs as a
//! regular job with the builder isolation policy.

use crate::model::JobSpec;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{JobType, NetworkMode, RuntimeManifest};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Debug)]
pub struct RuntimeInfo {
    pub name: String,
    pub path: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub size_bytes: u64,
}

#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn list_local(&self) -> Result<Vec<RuntimeInfo>, JobletError>;

    async fn remove(&self, name: &str) -> Result<(), JobletError>;

    /// Build the RUNTIME_BUILD job spec that clones the GitHub repo and
    /// runs its installer against the runtime target directory. The
    /// caller submits it through the coordinator like any other job.
    async fn install_spec(
        &self,
        name: &str,
        github_repo: &str,
        force: bool,
    ) -> Result<JobSpec, JobletError>;
}

pub struct LocalRuntimeService {
    runtimes_dir: PathBuf,
}

impl LocalRuntimeService {
    pub fn new(runtimes_dir: PathBuf) -> Self {
        Self { runtimes_dir }
    }
}

fn validate_runtime_name(name: &str) -> Result<(), JobletError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(JobletError::invalid_request(format!(
            "Invalid runtime name: {name}"
        )));
    }
    Ok(())
}

fn validate_github_repo(repo: &str) -> Result<(), JobletError> {
    let mut parts = repo.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None)
            if !owner.is_empty()
                && !name.is_empty()
                && repo
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c)) =>
        {
            Ok(())
        }
        _ => Err(JobletError::invalid_request(format!(
            "Expected github repo as owner/name: {repo}"
        ))),
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }
    }
    total
}

#[async_trait]
impl RuntimeService for LocalRuntimeService {
    async fn list_local(&self) -> Result<Vec<RuntimeInfo>, JobletError> {
        let mut runtimes = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.runtimes_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(runtimes),
            Err(err) => {
                return Err(JobletError::internal(format!("runtimes scan: {err}")))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| JobletError::internal(format!("runtimes scan: {err}")))?
        {
            let path = entry.path();
            let manifest_path = path.join("runtime.yml");
            if !manifest_path.is_file() {
                continue;
            }
            let manifest: RuntimeManifest = tokio::fs::read_to_string(&manifest_path)
                .await
                .ok()
                .and_then(|contents| serde_yaml::from_str(&contents).ok())
                .unwrap_or_default();
            let size_bytes = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || dir_size(&path))
                    .await
                    .unwrap_or(0)
            };
            runtimes.push(RuntimeInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                environment: manifest.environment,
                size_bytes,
            });
        }
        runtimes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(runtimes)
    }

    async fn remove(&self, name: &str) -> Result<(), JobletError> {
        validate_runtime_name(name)?;
        let path = self.runtimes_dir.join(name);
        if !path.is_dir() {
            return Err(JobletError::not_found(format!("Runtime not found: {name}")));
        }
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|err| JobletError::internal(format!("runtime remove: {err}")))?;
        info!("Removed runtime {name}");
        Ok(())
    }

    async fn install_spec(
        &self,
        name: &str,
        github_repo: &str,
        force: bool,
    ) -> Result<JobSpec, JobletError> {
        validate_runtime_name(name)?;
        validate_github_repo(github_repo)?;

        let target = self.runtimes_dir.join(name);
        if target.is_dir() && !force {
            return Err(JobletError::conflict(format!(
                "Runtime already installed: {name} (use force to reinstall)"
            )));
        }

        // Builder jobs get the runtimes directory mounted writable; the
        // installer script inside the repo stages the tree and writes
        // runtime.yml.
        let script = format!(
            "set -e; rm -rf /tmp/runtime-src \"{target}\"; \
             git clone --depth 1 https://github.com/{github_repo} /tmp/runtime-src; \
             mkdir -p \"{target}\"; \
             /tmp/runtime-src/install.sh \"{target}\"",
            target = target.display()
        );

        Ok(JobSpec {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script],
            network: NetworkMode::Bridge,
            job_type: JobType::RuntimeBuild,
            ..JobSpec::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn lists_only_trees_with_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let python = dir.path().join("python-3.12");
        std::fs::create_dir_all(python.join("bin")).unwrap();
        std::fs::write(python.join("bin/python3"), b"#!stub").unwrap();
        std::fs::write(
            python.join("runtime.yml"),
            "environment:\n  PYTHONHOME: /runtime\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-runtime")).unwrap();

        let service = LocalRuntimeService::new(dir.path().to_path_buf());
        let runtimes = service.list_local().await.unwrap();
        assert_eq!(runtimes.len(), 1);
        assert_eq!(runtimes[0].name, "python-3.12");
        assert_eq!(
            runtimes[0].environment.get("PYTHONHOME").unwrap(),
            "/runtime"
        );
        assert!(runtimes[0].size_bytes > 0);
    }

    #[test]
    async fn install_spec_is_a_builder_job() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalRuntimeService::new(dir.path().to_path_buf());
        let spec = service
            .install_spec("python-3.12", "joblet/runtime-python", false)
            .await
            .unwrap();
        assert_eq!(spec.job_type, JobType::RuntimeBuild);
        assert!(spec.args[1].contains("github.com/joblet/runtime-python"));
        assert!(spec.args[1].contains("python-3.12"));
    }

    #[test]
    async fn reinstall_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("go-1.22")).unwrap();
        let service = LocalRuntimeService::new(dir.path().to_path_buf());

        let denied = service
            .install_spec("go-1.22", "joblet/runtime-go", false)
            .await;
        assert!(matches!(denied, Err(JobletError::Conflict(_))));

        let forced = service
            .install_spec("go-1.22", "joblet/runtime-go", true)
            .await;
        assert!(forced.is_ok());
    }

    #[test]
    async fn bad_repo_specs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalRuntimeService::new(dir.path().to_path_buf());
        assert!(service
            .install_spec("x", "not-a-repo", false)
            .await
            .is_err());
        assert!(service
            .install_spec("x", "owner/name/extra", false)
            .await
            .is_err());
        assert!(service.install_spec("x", "owner/repo; rm -rf /", false).await.is_err());
    }
}

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

//! Workspace staging and the child environment vector. Uploads land under
//! the workspace before launch and are never touched afterwards.

use crate::model::{IsolationContext, NetworkAttachment};
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{validate_upload_path, Job, JobType, RuntimeManifest};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const RUNTIME_BIN: &str = "/runtime/bin";
const RUNTIME_LIB: &str = "/runtime/lib";
const CUDA_LIB_DIRS: &[&str] = &["/usr/local/cuda/lib64", "/usr/lib/x86_64-linux-gnu/nvidia"];

#[async_trait]
pub trait EnvironmentService: Send + Sync {
    /// Write every upload entry under the workspace, preserving relative
    /// paths and mode bits.
    async fn stage_workspace(
        &self,
        job: &Job,
        context: &IsolationContext,
    ) -> Result<(), JobletError>;

    /// The complete environment for the init child, in merge order: base,
    /// `JOB_*` control variables, runtime env, job env, secret env, GPU
    /// env, and the network readiness flag when one was reserved.
    async fn build_env(
        &self,
        job: &Job,
        context: &IsolationContext,
        attachment: Option<&NetworkAttachment>,
    ) -> Result<Vec<(String, String)>, JobletError>;
}

pub struct LocalEnvironmentService {
    runtimes_dir: PathBuf,
}

impl LocalEnvironmentService {
    pub fn new(runtimes_dir: PathBuf) -> Self {
        Self { runtimes_dir }
    }

    async fn runtime_manifest(&self, runtime: &str) -> Result<RuntimeManifest, JobletError> {
        let manifest_path = self.runtimes_dir.join(runtime).join("runtime.yml");
        let contents = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|err| {
                JobletError::not_found(format!(
                    "Runtime manifest {} unreadable: {err}",
                    manifest_path.display()
                ))
            })?;
        serde_yaml::from_str(&contents).map_err(|err| {
            JobletError::invalid_request(format!("Invalid runtime.yml for {runtime}: {err}"))
        })
    }
}

#[async_trait]
impl EnvironmentService for LocalEnvironmentService {
    async fn stage_workspace(
        &self,
        job: &Job,
        context: &IsolationContext,
    ) -> Result<(), JobletError> {
        let workspace = &context.workspace_dir;
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|err| JobletError::internal(format!("workspace create: {err}")))?;

        for upload in &job.uploads {
            validate_upload_path(&upload.path).map_err(JobletError::InvalidRequest)?;
            let target = workspace.join(&upload.path);

            if upload.is_dir {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|err| upload_error(&target, err))?;
            } else {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| upload_error(parent, err))?;
                }
                tokio::fs::write(&target, &upload.content)
                    .await
                    .map_err(|err| upload_error(&target, err))?;
            }

            if upload.mode != 0 {
                tokio::fs::set_permissions(
                    &target,
                    std::fs::Permissions::from_mode(upload.mode),
                )
                .await
                .map_err(|err| upload_error(&target, err))?;
            }
        }

        debug!(job_id = %job.id, uploads = job.uploads.len(), "Staged workspace");
        Ok(())
    }

    async fn build_env(
        &self,
        job: &Job,
        context: &IsolationContext,
        attachment: Option<&NetworkAttachment>,
    ) -> Result<Vec<(String, String)>, JobletError> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();

        env.insert("PATH".to_string(), BASE_PATH.to_string());
        env.insert("HOME".to_string(), "/work".to_string());
        env.insert("HOSTNAME".to_string(), job.hostname());

        env.insert("JOB_ID".to_string(), job.id.to_string());
        env.insert(
            "JOB_TYPE".to_string(),
            match job.job_type {
                JobType::Default => "DEFAULT",
                JobType::RuntimeBuild => "RUNTIME_BUILD",
                JobType::WorkflowMember => "WORKFLOW_MEMBER",
            }
            .to_string(),
        );
        env.insert(
            "JOB_CGROUP_PATH".to_string(),
            context.cgroup_path.display().to_string(),
        );
        env.insert("JOB_COMMAND".to_string(), job.command.clone());
        env.insert("JOB_ARGS_COUNT".to_string(), job.args.len().to_string());
        for (index, arg) in job.args.iter().enumerate() {
            env.insert(format!("JOB_ARG_{index}"), arg.clone());
        }
        env.insert(
            "JOB_MAX_CPU".to_string(),
            job.limits.cpu_percent.to_string(),
        );
        env.insert(
            "JOB_MAX_MEMORY".to_string(),
            job.limits.memory_bytes.to_string(),
        );
        env.insert("JOB_MAX_IOBPS".to_string(), job.limits.io_bps.to_string());
        env.insert(
            "JOB_CPU_CORES".to_string(),
            job.limits.cpu_cores.to_cpuset_string(),
        );
        env.insert(
            "JOB_VOLUMES_COUNT".to_string(),
            job.volumes.len().to_string(),
        );
        for (index, volume) in job.volumes.iter().enumerate() {
            env.insert(format!("JOB_VOLUME_{index}"), volume.clone());
        }
        env.insert(
            "JOB_PID_NS".to_string(),
            if context.namespaces.pid { "1" } else { "0" }.to_string(),
        );
        env.insert(
            "JOB_USER_NS".to_string(),
            if context.namespaces.user { "1" } else { "0" }.to_string(),
        );

        if let Some(runtime) = &job.runtime {
            env.insert("JOB_RUNTIME".to_string(), runtime.clone());
            let manifest = self.runtime_manifest(runtime).await?;
            for (key, value) in manifest.environment {
                env.insert(key, value);
            }
            let path = env.get("PATH").cloned().unwrap_or_default();
            env.insert("PATH".to_string(), format!("{RUNTIME_BIN}:{path}"));
            prepend_path_var(&mut env, "LD_LIBRARY_PATH", RUNTIME_LIB);
        }

        for (key, value) in &job.environment {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in &job.secret_environment {
            env.insert(key.clone(), value.clone());
        }

        if !job.gpu_indices.is_empty() {
            let visible = job
                .gpu_indices
                .iter()
                .map(|index| index.to_string())
                .collect::<Vec<_>>()
                .join(",");
            env.insert("CUDA_VISIBLE_DEVICES".to_string(), visible);
            for dir in CUDA_LIB_DIRS {
                if Path::new(dir).is_dir() {
                    prepend_path_var(&mut env, "LD_LIBRARY_PATH", dir);
                }
            }
        }

        if let Some(attachment) = attachment {
            env.insert(
                "NETWORK_READY_FILE".to_string(),
                attachment.ready_file_child.display().to_string(),
            );
        }

        Ok(env.into_iter().collect())
    }
}

fn prepend_path_var(env: &mut BTreeMap<String, String>, key: &str, dir: &str) {
    match env.get(key) {
        Some(existing) if !existing.is_empty() => {
            let joined = format!("{dir}:{existing}");
            env.insert(key.to_string(), joined);
        }
        _ => {
            env.insert(key.to_string(), dir.to_string());
        }
    }
}

fn upload_error(path: &Path, err: std::io::Error) -> JobletError {
    JobletError::internal(format!("upload staging {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::NamespacePlan;
    use bytes::Bytes;
    use joblet_common::model::{FileUpload, JobId, JobStatus, NetworkMode, ResourceLimits};
    use std::collections::BTreeSet;

    fn test_job(workspace: &Path) -> (Job, IsolationContext) {
        let id = JobId::new_v4();
        let job = Job {
            id,
            command: "/bin/echo".to_string(),
            args: vec!["hello".to_string(), "world".to_string()],
            status: JobStatus::Pending,
            limits: ResourceLimits {
                cpu_percent: 200,
                memory_bytes: 1024,
                io_bps: 0,
                cpu_cores: "0-1".parse().unwrap(),
            },
            network: NetworkMode::Bridge,
            volumes: vec!["data".to_string()],
            runtime: None,
            uploads: Vec::new(),
            environment: BTreeMap::from([("APP_MODE".to_string(), "test".to_string())]),
            secret_environment: BTreeMap::from([(
                "APP_TOKEN".to_string(),
                "sekrit".to_string(),
            )]),
            gpu_count: 0,
            gpu_memory_mb: 0,
            gpu_indices: Vec::new(),
            cgroup_path: None,
            pid: None,
            ip_address: None,
            scheduled_time: None,
            start_time: None,
            end_time: None,
            exit_code: None,
            job_type: JobType::Default,
            depends_on: BTreeSet::new(),
            workflow_id: None,
            failure_reason: None,
        };
        let context = IsolationContext {
            job_id: id,
            workspace_dir: workspace.to_path_buf(),
            rootfs_dir: workspace.join("rootfs"),
            log_dir: workspace.join("log"),
            cgroup_path: PathBuf::from("/sys/fs/cgroup/joblet.slice/job-test"),
            namespaces: NamespacePlan::default(),
        };
        (job, context)
    }

    #[test]
    async fn uploads_preserve_paths_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, context) = test_job(dir.path());
        job.uploads = vec![
            FileUpload {
                path: "scripts".to_string(),
                mode: 0o755,
                is_dir: true,
                content: Bytes::new(),
            },
            FileUpload {
                path: "scripts/run.sh".to_string(),
                mode: 0o750,
                is_dir: false,
                content: Bytes::from_static(b"#!/bin/sh\necho hi\n"),
            },
            FileUpload {
                path: "data/input.csv".to_string(),
                mode: 0o644,
                is_dir: false,
                content: Bytes::from_static(b"a,b\n"),
            },
        ];

        let service = LocalEnvironmentService::new(PathBuf::from("/nonexistent"));
        service.stage_workspace(&job, &context).await.unwrap();

        let script = dir.path().join("scripts/run.sh");
        assert_eq!(
            std::fs::read(&script).unwrap(),
            b"#!/bin/sh\necho hi\n".to_vec()
        );
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert!(dir.path().join("data/input.csv").is_file());
    }

    #[test]
    async fn escaping_uploads_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, context) = test_job(dir.path());
        job.uploads = vec![FileUpload {
            path: "../outside".to_string(),
            mode: 0o644,
            is_dir: false,
            content: Bytes::from_static(b"nope"),
        }];

        let service = LocalEnvironmentService::new(PathBuf::from("/nonexistent"));
        let result = service.stage_workspace(&job, &context).await;
        assert!(matches!(result, Err(JobletError::InvalidRequest(_))));
    }

    #[test]
    async fn env_contains_the_job_contract() {
        let dir = tempfile::tempdir().unwrap();
        let (job, context) = test_job(dir.path());
        let service = LocalEnvironmentService::new(PathBuf::from("/nonexistent"));

        let env: BTreeMap<String, String> = service
            .build_env(&job, &context, None)
            .await
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(env.get("JOB_COMMAND").unwrap(), "/bin/echo");
        assert_eq!(env.get("JOB_ARGS_COUNT").unwrap(), "2");
        assert_eq!(env.get("JOB_ARG_0").unwrap(), "hello");
        assert_eq!(env.get("JOB_ARG_1").unwrap(), "world");
        assert_eq!(env.get("JOB_MAX_MEMORY").unwrap(), "1024");
        assert_eq!(env.get("JOB_CPU_CORES").unwrap(), "0-1");
        assert_eq!(env.get("JOB_VOLUME_0").unwrap(), "data");
        assert_eq!(env.get("APP_MODE").unwrap(), "test");
        assert_eq!(env.get("APP_TOKEN").unwrap(), "sekrit");
        assert!(env.get("NETWORK_READY_FILE").is_none());
    }

    #[test]
    async fn runtime_env_prefixes_path() {
        let runtimes = tempfile::tempdir().unwrap();
        let runtime_dir = runtimes.path().join("python-3.12");
        std::fs::create_dir_all(&runtime_dir).unwrap();
        std::fs::write(
            runtime_dir.join("runtime.yml"),
            "environment:\n  PYTHONHOME: /runtime\n",
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (mut job, context) = test_job(dir.path());
        job.runtime = Some("python-3.12".to_string());

        let service = LocalEnvironmentService::new(runtimes.path().to_path_buf());
        let env: BTreeMap<String, String> = service
            .build_env(&job, &context, None)
            .await
            .unwrap()
            .into_iter()
            .collect();

        assert!(env.get("PATH").unwrap().starts_with("/runtime/bin:"));
        assert_eq!(env.get("PYTHONHOME").unwrap(), "/runtime");
        assert_eq!(env.get("JOB_RUNTIME").unwrap(), "python-3.12");
    }

    #[test]
    async fn network_ready_flag_is_appended_when_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let (job, context) = test_job(dir.path());
        let attachment = NetworkAttachment {
            network: "bridge".to_string(),
            ip: "172.20.0.5".parse().unwrap(),
            prefix_len: 16,
            gateway: "172.20.0.1".parse().unwrap(),
            bridge: "joblet0".to_string(),
            veth_host: "vh-12345678".to_string(),
            veth_peer: "vp-12345678".to_string(),
            ready_file_host: dir.path().join("tmp/ready"),
            ready_file_child: PathBuf::from("/tmp/ready"),
        };

        let service = LocalEnvironmentService::new(PathBuf::from("/nonexistent"));
        let env: BTreeMap<String, String> = service
            .build_env(&job, &context, Some(&attachment))
            .await
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(env.get("NETWORK_READY_FILE").unwrap(), "/tmp/ready");
    }
}

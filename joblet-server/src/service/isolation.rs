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

//! Per-job isolation: the cgroup, the staged root filesystem with its
//! bind mounts and device nodes, and the namespace plan handed to the
//! process manager. Destruction is idempotent so rollback and regular
//! cleanup can share one path.

use crate::config::PathsConfig;
use crate::model::{IsolationContext, NamespacePlan};
use crate::service::cgroup;
use crate::service::volume::VolumeService;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{Job, JobType, NetworkMode};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SYSTEM_BINDS: &[&str] = &["bin", "lib", "lib64", "usr", "etc"];
const BUILDER_BINDS: &[&str] = &["usr/local"];
const DEVICE_NODES: &[(&str, u64, u64)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];
const NVIDIA_MAJOR: u64 = 195;
const NVIDIA_CTL_MINOR: u64 = 255;

#[async_trait]
pub trait IsolationService: Send + Sync {
    /// Build the full isolated environment for a job: cgroup with limits
    /// applied, staged rootfs, device nodes, namespace plan.
    async fn prepare(&self, job: &Job) -> Result<IsolationContext, JobletError>;

    /// Tear everything down. Safe to call twice and safe to call on a
    /// partially-prepared context.
    async fn destroy(&self, context: &IsolationContext) -> Result<(), JobletError>;

    /// Create the per-job GPU device nodes once the allocator has picked
    /// the indices.
    async fn create_gpu_devices(
        &self,
        context: &IsolationContext,
        indices: &[u32],
    ) -> Result<(), JobletError>;

    /// SIGKILL the whole cgroup through `cgroup.kill`.
    async fn kill_cgroup(&self, cgroup_path: &Path) -> Result<(), JobletError>;

    /// `oom_kill` counter from `memory.events`, for terminal diagnostics.
    async fn oom_kill_count(&self, cgroup_path: &Path) -> u64;
}

pub struct LinuxIsolationService {
    paths: PathsConfig,
    volumes: Arc<dyn VolumeService>,
    cgroup_io_timeout: Duration,
}

impl LinuxIsolationService {
    /// Creates the joblet.slice parent and delegates the controllers jobs
    /// need into it.
    pub async fn start(
        paths: PathsConfig,
        volumes: Arc<dyn VolumeService>,
        cgroup_io_timeout: Duration,
    ) -> Result<Self, JobletError> {
        tokio::fs::create_dir_all(&paths.cgroup_root)
            .await
            .map_err(|err| JobletError::isolation("cgroup-root", err.to_string()))?;
        cgroup::write_control(
            &paths.cgroup_root.join("cgroup.subtree_control"),
            "+cpu +memory +io +pids +cpuset",
            cgroup_io_timeout,
        )
        .await
        .map_err(|err| JobletError::isolation("cgroup-controllers", err.to_string()))?;

        Ok(Self {
            paths,
            volumes,
            cgroup_io_timeout,
        })
    }

    async fn create_cgroup(&self, job: &Job, cgroup_path: &Path) -> Result<(), JobletError> {
        tokio::fs::create_dir_all(cgroup_path)
            .await
            .map_err(|err| JobletError::isolation("cgroup-create", err.to_string()))?;

        let limits = &job.limits;
        if limits.cpu_percent > 0 {
            // cpu.weight is 1..10000 with 100 as the default share.
            let weight = limits.cpu_percent.clamp(1, 10_000);
            self.write_limit(cgroup_path, "cpu.weight", &weight.to_string())
                .await?;
        }
        if limits.memory_bytes > 0 {
            self.write_limit(cgroup_path, "memory.max", &limits.memory_bytes.to_string())
                .await?;
        }
        if limits.io_bps > 0 {
            if let Some(device) = block_device_of(&self.paths.base_dir) {
                self.write_limit(
                    cgroup_path,
                    "io.max",
                    &format!(
                        "{device} rbps={bps} wbps={bps}",
                        bps = limits.io_bps
                    ),
                )
                .await?;
            } else {
                warn!("io_bps requested but no block device found for {}", self.paths.base_dir.display());
            }
        }
        if !limits.cpu_cores.is_empty() {
            self.write_limit(
                cgroup_path,
                "cpuset.cpus",
                &limits.cpu_cores.to_cpuset_string(),
            )
            .await?;
        }
        Ok(())
    }

    async fn write_limit(
        &self,
        cgroup_path: &Path,
        control: &str,
        value: &str,
    ) -> Result<(), JobletError> {
        cgroup::write_control(&cgroup_path.join(control), value, self.cgroup_io_timeout)
            .await
            .map_err(|err| JobletError::isolation(control, err.to_string()))
    }

    async fn stage_rootfs(&self, job: &Job, context: &IsolationContext) -> Result<(), JobletError> {
        let rootfs = &context.rootfs_dir;
        let mut mounts: Vec<PathBuf> = Vec::new();

        std::fs::create_dir_all(rootfs)
            .map_err(|err| JobletError::isolation("rootfs-create", err.to_string()))?;

        for name in SYSTEM_BINDS {
            let source = Path::new("/").join(name);
            if !source.exists() {
                continue;
            }
            let target = rootfs.join(name);
            bind_mount(&source, &target, true)?;
            mounts.push(target);
        }

        if job.job_type == JobType::RuntimeBuild {
            for name in BUILDER_BINDS {
                let source = Path::new("/").join(name);
                if !source.exists() {
                    continue;
                }
                let target = rootfs.join(name);
                bind_mount(&source, &target, false)?;
                mounts.push(target);
            }
        }

        std::fs::create_dir_all(rootfs.join("tmp"))
            .map_err(|err| JobletError::isolation("rootfs-tmp", err.to_string()))?;
        std::fs::create_dir_all(rootfs.join("proc"))
            .map_err(|err| JobletError::isolation("rootfs-proc", err.to_string()))?;
        std::fs::create_dir_all(rootfs.join(".old_root"))
            .map_err(|err| JobletError::isolation("rootfs-oldroot", err.to_string()))?;

        let dev = rootfs.join("dev");
        std::fs::create_dir_all(&dev)
            .map_err(|err| JobletError::isolation("rootfs-dev", err.to_string()))?;
        for (name, major, minor) in DEVICE_NODES {
            make_device_node(&dev.join(name), *major, *minor)?;
        }

        // The workspace appears at /work inside the job.
        let work = rootfs.join("work");
        bind_mount(&context.workspace_dir, &work, false)?;
        mounts.push(work);

        for name in &job.volumes {
            let volume = self.volumes.resolve(name).await?;
            let target = rootfs.join("volumes").join(name);
            bind_mount(Path::new(&volume.host_path), &target, false)?;
            mounts.push(target);
        }

        if let Some(runtime) = &job.runtime {
            let source = self.paths.runtimes_dir.join(runtime);
            if !source.is_dir() {
                return Err(JobletError::not_found(format!(
                    "Runtime not found: {runtime}"
                )));
            }
            let target = rootfs.join("runtime");
            bind_mount(&source, &target, true)?;
            mounts.push(target);
        }

        write_mount_manifest(&self.paths.job_dir(&job.id), &mounts)?;
        Ok(())
    }
}

fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), JobletError> {
    std::fs::create_dir_all(target)
        .map_err(|err| JobletError::isolation("bind-target", err.to_string()))?;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| {
        JobletError::isolation(
            "bind-mount",
            format!("{} -> {}: {err}", source.display(), target.display()),
        )
    })?;
    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|err| {
            JobletError::isolation(
                "bind-remount-ro",
                format!("{}: {err}", target.display()),
            )
        })?;
    }
    Ok(())
}

fn make_device_node(path: &Path, major: u64, minor: u64) -> Result<(), JobletError> {
    match mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        makedev(major, minor),
    ) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(err) => Err(JobletError::isolation(
            "mknod",
            format!("{}: {err}", path.display()),
        )),
    }
}

/// Look up a dynamic char device major in /proc/devices.
fn char_device_major(name: &str) -> Option<u64> {
    let devices = std::fs::read_to_string("/proc/devices").ok()?;
    for line in devices.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(major), Some(device)) = (parts.next(), parts.next()) {
            if device == name {
                return major.parse().ok();
            }
        }
    }
    None
}

/// "maj:min" of the block device backing a path, for io.max.
fn block_device_of(path: &Path) -> Option<String> {
    let stat = nix::sys::stat::stat(path).ok()?;
    let major = nix::sys::stat::major(stat.st_dev);
    let minor = nix::sys::stat::minor(stat.st_dev);
    if major == 0 {
        // tmpfs / overlay; io.max cannot target it.
        None
    } else {
        Some(format!("{major}:{minor}"))
    }
}

fn write_mount_manifest(job_dir: &Path, mounts: &[PathBuf]) -> Result<(), JobletError> {
    let manifest: String = mounts
        .iter()
        .map(|path| format!("{}\n", path.display()))
        .collect();
    std::fs::write(job_dir.join("mounts.list"), manifest)
        .map_err(|err| JobletError::isolation("mount-manifest", err.to_string()))
}

#[async_trait]
impl IsolationService for LinuxIsolationService {
    async fn prepare(&self, job: &Job) -> Result<IsolationContext, JobletError> {
        let context = IsolationContext {
            job_id: job.id,
            workspace_dir: self.paths.workspace_dir(&job.id),
            rootfs_dir: self.paths.rootfs_dir(&job.id),
            log_dir: self.paths.log_dir(&job.id),
            cgroup_path: self.paths.cgroup_dir(&job.id),
            namespaces: NamespacePlan {
                net: job.network != NetworkMode::Host,
                ..NamespacePlan::default()
            },
        };

        for dir in [
            &context.workspace_dir,
            &context.rootfs_dir,
            &context.log_dir,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| JobletError::isolation("job-dirs", err.to_string()))?;
        }

        self.create_cgroup(job, &context.cgroup_path).await?;
        self.stage_rootfs(job, &context).await?;

        debug!(job_id = %job.id, "Prepared isolation context");
        Ok(context)
    }

    async fn create_gpu_devices(
        &self,
        context: &IsolationContext,
        indices: &[u32],
    ) -> Result<(), JobletError> {
        if indices.is_empty() {
            return Ok(());
        }
        let dev = context.rootfs_dir.join("dev");
        for index in indices {
            make_device_node(
                &dev.join(format!("nvidia{index}")),
                NVIDIA_MAJOR,
                *index as u64,
            )?;
        }
        make_device_node(&dev.join("nvidiactl"), NVIDIA_MAJOR, NVIDIA_CTL_MINOR)?;
        if let Some(major) = char_device_major("nvidia-uvm") {
            make_device_node(&dev.join("nvidia-uvm"), major, 0)?;
        }
        Ok(())
    }

    async fn destroy(&self, context: &IsolationContext) -> Result<(), JobletError> {
        // Order: kill the cgroup, unmount in reverse creation order,
        // remove the job directory, remove the cgroup directory. Every
        // step tolerates "already gone".
        let _ = self.kill_cgroup(&context.cgroup_path).await;

        let job_dir = self.paths.job_dir(&context.job_id);
        let manifest = job_dir.join("mounts.list");
        if let Ok(contents) = std::fs::read_to_string(&manifest) {
            for line in contents.lines().rev() {
                let target = Path::new(line.trim());
                if target.as_os_str().is_empty() {
                    continue;
                }
                match umount2(target, MntFlags::MNT_DETACH) {
                    Ok(()) => {}
                    Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EINVAL) => {}
                    Err(err) => warn!("Unmount {} failed: {err}", target.display()),
                }
            }
        }

        // The log directory stays behind: terminal jobs remain replayable
        // until the record itself is deleted.
        for subdir in [&context.rootfs_dir, &context.workspace_dir] {
            match tokio::fs::remove_dir_all(subdir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(JobletError::isolation(
                        "job-dir-remove",
                        err.to_string(),
                    ))
                }
            }
        }
        let _ = std::fs::remove_file(job_dir.join("mounts.list"));

        // The cgroup dir refuses removal until every process is reaped;
        // cgroup.kill above plus the parent's waitpid guarantee that.
        for _ in 0..10 {
            match std::fs::remove_dir(&context.cgroup_path) {
                Ok(()) => break,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        Ok(())
    }

    async fn kill_cgroup(&self, cgroup_path: &Path) -> Result<(), JobletError> {
        match cgroup::write_control(&cgroup_path.join("cgroup.kill"), "1", self.cgroup_io_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(cgroup::CgroupIoError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(JobletError::isolation("cgroup-kill", err.to_string())),
        }
    }

    async fn oom_kill_count(&self, cgroup_path: &Path) -> u64 {
        match cgroup::read_control(&cgroup_path.join("memory.events"), self.cgroup_io_timeout)
            .await
        {
            Ok(contents) => cgroup::parse_flat_keyed(&contents)
                .get("oom_kill")
                .copied()
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn device_majors_are_looked_up_from_proc() {
        // /proc/devices always lists mem on Linux test hosts.
        if Path::new("/proc/devices").exists() {
            assert_eq!(char_device_major("mem"), Some(1));
        }
        assert_eq!(char_device_major("definitely-not-a-device"), None);
    }

    #[test]
    fn namespace_plan_keeps_host_network() {
        let plan = NamespacePlan {
            net: false,
            ..NamespacePlan::default()
        };
        assert!(plan.mount && plan.pid && plan.user && !plan.net);
    }
}

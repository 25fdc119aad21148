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

//! Stage 1 of the two-stage init: re-exec this binary in the planned
//! namespaces with the `JOB_*` contract in its environment, hand its
//! pipes to the log bus, join it to the job cgroup and reap it.

use crate::model::{IsolationContext, JobExit, NamespacePlan};
use crate::service::cgroup;
use crate::service::logbus::LogBus;
use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::Job;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ProcessHandle {
    pub pid: u32,
    /// Resolves once the init child has been reaped.
    pub exit: oneshot::Receiver<JobExit>,
    /// Completes when both output pipes reached EOF.
    pub pump: JoinHandle<()>,
}

#[async_trait]
pub trait ProcessService: Send + Sync {
    async fn launch(
        &self,
        job: &Job,
        context: &IsolationContext,
        env: Vec<(String, String)>,
    ) -> Result<ProcessHandle, JobletError>;

    /// Ask the init child to shut down; it forwards the signal to the
    /// user command.
    fn signal_terminate(&self, pid: u32) -> Result<(), JobletError>;
}

pub struct LinuxProcessService {
    log_bus: Arc<LogBus>,
    cgroup_io_timeout: Duration,
}

impl LinuxProcessService {
    pub fn new(log_bus: Arc<LogBus>, cgroup_io_timeout: Duration) -> Self {
        Self {
            log_bus,
            cgroup_io_timeout,
        }
    }
}

pub fn unshare_flags(plan: &NamespacePlan) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    if plan.mount {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if plan.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if plan.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if plan.net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if plan.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if plan.user {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Wait-status mapping: exit codes surface verbatim, signal deaths as
/// `None` code + the signal number.
pub fn map_exit_status(status: ExitStatus) -> JobExit {
    JobExit {
        code: status.code(),
        signal: status.signal(),
        oom_killed: false,
    }
}

#[async_trait]
impl ProcessService for LinuxProcessService {
    async fn launch(
        &self,
        job: &Job,
        context: &IsolationContext,
        env: Vec<(String, String)>,
    ) -> Result<ProcessHandle, JobletError> {
        let flags = unshare_flags(&context.namespaces);
        let needs_user_maps = context.namespaces.user;

        let mut command = tokio::process::Command::new("/proc/self/exe");
        command
            .env_clear()
            .envs(env)
            .env("JOBLET_MODE", "init")
            .env("JOB_ROOTFS", &context.rootfs_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            command.pre_exec(move || {
                nix::sched::unshare(flags).map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|err| JobletError::process("fork", err.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| JobletError::process("fork", "child exited before launch"))?;

        if needs_user_maps {
            if let Err(err) = write_user_mappings(pid) {
                let _ = child.start_kill();
                return Err(JobletError::process("uid-map", err));
            }
        }

        cgroup::write_control(
            &context.cgroup_path.join("cgroup.procs"),
            &pid.to_string(),
            self.cgroup_io_timeout,
        )
        .await
        .map_err(|err| {
            let _ = child.start_kill();
            JobletError::process("cgroup-join", err.to_string())
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobletError::process("pipes", "missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobletError::process("pipes", "missing stderr pipe"))?;
        let pump = self.log_bus.clone().spawn_pump(job.id, stdout, stderr);

        let (exit_tx, exit_rx) = oneshot::channel();
        let job_id = job.id;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let exit = map_exit_status(status);
                    debug!(job_id = %job_id, ?exit, "Init child reaped");
                    let _ = exit_tx.send(exit);
                }
                Err(err) => {
                    warn!(job_id = %job_id, "waitpid failed: {err}");
                    let _ = exit_tx.send(JobExit {
                        code: Some(255),
                        signal: None,
                        oom_killed: false,
                    });
                }
            }
        });

        debug!(job_id = %job.id, pid, "Launched init child");
        Ok(ProcessHandle {
            pid,
            exit: exit_rx,
            pump,
        })
    }

    fn signal_terminate(&self, pid: u32) -> Result<(), JobletError> {
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|err| JobletError::process("sigterm", err.to_string()))
    }
}

/// Identity-map the root user through the new user namespace using the
/// configured subordinate range.
fn write_user_mappings(pid: u32) -> Result<(), String> {
    let base = format!("/proc/{pid}");
    std::fs::write(format!("{base}/uid_map"), "0 0 65536")
        .map_err(|err| format!("uid_map: {err}"))?;
    std::fs::write(format!("{base}/gid_map"), "0 0 65536")
        .map_err(|err| format!("gid_map: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn exit_status_mapping_for_clean_exit() {
        let status = ExitStatus::from_raw(0);
        let exit = map_exit_status(status);
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.signal, None);
        assert_eq!(exit.exit_code(), 0);
    }

    #[test]
    fn exit_status_mapping_for_nonzero_exit() {
        // Wait status 0x0300 encodes exit code 3.
        let status = ExitStatus::from_raw(3 << 8);
        let exit = map_exit_status(status);
        assert_eq!(exit.exit_code(), 3);
    }

    #[test]
    fn exit_status_mapping_for_signals() {
        // Raw wait status 9 = killed by SIGKILL; 15 = SIGTERM.
        let killed = map_exit_status(ExitStatus::from_raw(9));
        assert_eq!(killed.code, None);
        assert_eq!(killed.signal, Some(9));
        assert_eq!(killed.exit_code(), 137);

        let terminated = map_exit_status(ExitStatus::from_raw(15));
        assert_eq!(terminated.exit_code(), 143);
    }

    #[test]
    fn default_plan_unshares_everything() {
        let flags = unshare_flags(&NamespacePlan::default());
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn host_network_plan_keeps_netns() {
        let plan = NamespacePlan {
            net: false,
            ..NamespacePlan::default()
        };
        assert!(!unshare_flags(&plan).contains(CloneFlags::CLONE_NEWNET));
    }
}

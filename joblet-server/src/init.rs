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

//! Stage 2 of the two-stage init. The server re-execs this same binary
//! with `JOBLET_MODE=init` inside the new namespaces; this module then
//! pivots into the staged rootfs, finishes per-process setup, forks the
//! user command (the fork lands in the new pid namespace as pid 1) and
//! mirrors its exit status back to the server.
//!
//! This code runs before the job exists as far as the user is concerned:
//! any failure here exits 125 (126 for permission errors) and the parent
//! maps that to PROCESS_FAILED.

use joblet_common::model::CoreSet;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::CpuSet;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, execvp, fork, pivot_root, sethostname, setgroups, ForkResult, Pid};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

const EXIT_SETUP_FAILED: i32 = 125;
const EXIT_PERMISSION: i32 = 126;

const USER_NS_MAP_WAIT: Duration = Duration::from_secs(2);
const NETWORK_READY_POLL: Duration = Duration::from_millis(100);

pub const MODE_ENV: &str = "JOBLET_MODE";
pub const MODE_INIT: &str = "init";

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

pub fn is_init_mode() -> bool {
    std::env::var(MODE_ENV).as_deref() == Ok(MODE_INIT)
}

/// The whole of init mode. Never returns; the process either becomes the
/// user command's parent and exits with its status, or dies with a setup
/// error code.
pub fn run() -> ! {
    match run_inner() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("joblet-init: {}", error.message);
            std::process::exit(error.exit_code);
        }
    }
}

struct InitError {
    message: String,
    exit_code: i32,
}

impl InitError {
    fn setup(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: EXIT_SETUP_FAILED,
        }
    }

    fn from_errno(step: &str, errno: nix::errno::Errno) -> Self {
        let exit_code = match errno {
            nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => EXIT_PERMISSION,
            _ => EXIT_SETUP_FAILED,
        };
        Self {
            message: format!("{step}: {errno}"),
            exit_code,
        }
    }
}

struct InitConfig {
    job_id: String,
    rootfs: PathBuf,
    command: String,
    args: Vec<String>,
    cpu_cores: CoreSet,
    memory_bytes: u64,
    user_ns: bool,
    network_ready_file: Option<PathBuf>,
    network_ready_timeout: Duration,
}

impl InitConfig {
    fn from_env() -> Result<Self, InitError> {
        let job_id =
            std::env::var("JOB_ID").map_err(|_| InitError::setup("JOB_ID not set"))?;
        let rootfs = std::env::var("JOB_ROOTFS")
            .map(PathBuf::from)
            .map_err(|_| InitError::setup("JOB_ROOTFS not set"))?;
        let command =
            std::env::var("JOB_COMMAND").map_err(|_| InitError::setup("JOB_COMMAND not set"))?;

        let args_count: usize = std::env::var("JOB_ARGS_COUNT")
            .ok()
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);
        let mut args = Vec::with_capacity(args_count);
        for index in 0..args_count {
            let arg = std::env::var(format!("JOB_ARG_{index}"))
                .map_err(|_| InitError::setup(format!("JOB_ARG_{index} missing")))?;
            args.push(arg);
        }

        let cpu_cores = std::env::var("JOB_CPU_CORES")
            .ok()
            .and_then(|cores| cores.parse().ok())
            .unwrap_or_default();
        let memory_bytes = std::env::var("JOB_MAX_MEMORY")
            .ok()
            .and_then(|memory| memory.parse().ok())
            .unwrap_or(0);
        let user_ns = std::env::var("JOB_USER_NS").as_deref() == Ok("1");
        let network_ready_file = std::env::var("NETWORK_READY_FILE").ok().map(PathBuf::from);

        Ok(Self {
            job_id,
            rootfs,
            command,
            args,
            cpu_cores,
            memory_bytes,
            user_ns,
            network_ready_file,
            network_ready_timeout: Duration::from_secs(30),
        })
    }

    fn hostname(&self) -> String {
        let short: String = self
            .job_id
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .take(8)
            .collect();
        format!("job_{short}")
    }
}

fn run_inner() -> Result<i32, InitError> {
    let config = InitConfig::from_env()?;

    if config.user_ns {
        wait_for_user_mappings()?;
    }

    enter_rootfs(&config.rootfs)?;
    sethostname(config.hostname()).map_err(|err| InitError::from_errno("sethostname", err))?;

    // The child must not exec before the veth wiring is live.
    if let Some(ready_file) = &config.network_ready_file {
        wait_for_network_ready(ready_file, config.network_ready_timeout)?;
    }

    drop_supplementary_groups()?;
    apply_cpu_affinity(&config.cpu_cores)?;
    apply_rlimits(config.memory_bytes)?;

    install_forwarding_handlers()?;
    spawn_and_reap(&config)
}

/// The parent writes uid_map/gid_map after spawn; mounts and most setup
/// fail with EPERM until that lands.
fn wait_for_user_mappings() -> Result<(), InitError> {
    let deadline = Instant::now() + USER_NS_MAP_WAIT;
    loop {
        if let Ok(map) = std::fs::read_to_string("/proc/self/uid_map") {
            if !map.trim().is_empty() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(InitError::setup("timed out waiting for uid_map"));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Make the mount tree private, pivot into the staged rootfs and discard
/// the old root.
fn enter_rootfs(rootfs: &Path) -> Result<(), InitError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| InitError::from_errno("remount-private", err))?;

    // pivot_root requires the new root to be a mount point.
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| InitError::from_errno("rootfs-bind", err))?;

    chdir(rootfs).map_err(|err| InitError::from_errno("chdir-rootfs", err))?;
    pivot_root(".", ".old_root").map_err(|err| InitError::from_errno("pivot_root", err))?;
    chdir("/").map_err(|err| InitError::from_errno("chdir-root", err))?;

    umount2("/.old_root", MntFlags::MNT_DETACH)
        .map_err(|err| InitError::from_errno("umount-old-root", err))?;
    let _ = std::fs::remove_dir("/.old_root");

    Ok(())
}

fn wait_for_network_ready(ready_file: &Path, timeout: Duration) -> Result<(), InitError> {
    let deadline = Instant::now() + timeout;
    while !ready_file.exists() {
        if Instant::now() >= deadline {
            return Err(InitError::setup(format!(
                "network not ready after {timeout:?} ({})",
                ready_file.display()
            )));
        }
        std::thread::sleep(NETWORK_READY_POLL);
    }
    Ok(())
}

fn drop_supplementary_groups() -> Result<(), InitError> {
    match setgroups(&[]) {
        Ok(()) => Ok(()),
        // Not permitted inside some user namespace configurations; the
        // namespace itself already bounds the group set then.
        Err(nix::errno::Errno::EPERM) => Ok(()),
        Err(err) => Err(InitError::from_errno("setgroups", err)),
    }
}

fn apply_cpu_affinity(cores: &CoreSet) -> Result<(), InitError> {
    if cores.is_empty() {
        return Ok(());
    }
    let mut cpu_set = CpuSet::new();
    for core in cores.cores() {
        cpu_set
            .set(core as usize)
            .map_err(|err| InitError::from_errno("cpuset", err))?;
    }
    nix::sched::sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|err| InitError::from_errno("sched_setaffinity", err))
}

/// Rlimits mirror the cgroup limits as a second line of defense.
fn apply_rlimits(memory_bytes: u64) -> Result<(), InitError> {
    if memory_bytes > 0 {
        rlimit::setrlimit(rlimit::Resource::AS, memory_bytes, memory_bytes)
            .map_err(|err| InitError::setup(format!("rlimit-as: {err}")))?;
    }
    Ok(())
}

extern "C" fn forward_signal(signal: i32) {
    let child = CHILD_PID.load(Ordering::SeqCst);
    if child > 0 {
        if let Ok(signal) = Signal::try_from(signal) {
            let _ = kill(Pid::from_raw(child), signal);
        }
    }
}

/// SIGTERM/SIGINT sent to init are forwarded to the user command so a
/// graceful stop reaches the application, not just its supervisor.
fn install_forwarding_handlers() -> Result<(), InitError> {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)
            .map_err(|err| InitError::from_errno("sigaction", err))?;
        sigaction(Signal::SIGINT, &action)
            .map_err(|err| InitError::from_errno("sigaction", err))?;
    }
    Ok(())
}

/// Fork the user command. The fork is the first process created after
/// `unshare(CLONE_NEWPID)`, so it becomes pid 1 of the job's pid
/// namespace; it mounts the namespace's /proc before exec.
fn spawn_and_reap(config: &InitConfig) -> Result<i32, InitError> {
    match unsafe { fork() }.map_err(|err| InitError::from_errno("fork", err))? {
        ForkResult::Child => {
            if let Err(error) = mount_proc() {
                eprintln!("joblet-init: {}", error.message);
                std::process::exit(error.exit_code);
            }
            let _ = chdir("/work");

            let error = exec_user_command(config);
            // Only reached when execvp failed.
            eprintln!("joblet-init: exec {}: {}", config.command, error);
            let exit_code = match error {
                nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => EXIT_PERMISSION,
                _ => EXIT_SETUP_FAILED,
            };
            std::process::exit(exit_code);
        }
        ForkResult::Parent { child } => {
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        return Ok(128 + signal as i32);
                    }
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(err) => return Err(InitError::from_errno("waitpid", err)),
                }
            }
        }
    }
}

fn mount_proc() -> Result<(), InitError> {
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|err| InitError::from_errno("mount-proc", err))
}

fn exec_user_command(config: &InitConfig) -> nix::errno::Errno {
    let Ok(program) = CString::new(config.command.as_str()) else {
        return nix::errno::Errno::EINVAL;
    };
    let mut argv = vec![program.clone()];
    for arg in &config.args {
        match CString::new(arg.as_str()) {
            Ok(arg) => argv.push(arg),
            Err(_) => return nix::errno::Errno::EINVAL,
        }
    }
    match execvp(&program, &argv) {
        Ok(infallible) => match infallible {},
        Err(err) => err,
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn init_mode_is_selected_by_env() {
        // Not set in the test environment.
        assert!(!is_init_mode());
    }

    #[test]
    fn hostname_uses_the_id_prefix() {
        let config = InitConfig {
            job_id: "123e4567-e89b-42d3-a456-426614174000".to_string(),
            rootfs: PathBuf::from("/tmp"),
            command: "/bin/true".to_string(),
            args: Vec::new(),
            cpu_cores: CoreSet::default(),
            memory_bytes: 0,
            user_ns: false,
            network_ready_file: None,
            network_ready_timeout: Duration::from_secs(30),
        };
        assert_eq!(config.hostname(), "job_123e4567");
    }

    #[test]
    fn network_ready_times_out_on_absent_flag() {
        let result = wait_for_network_ready(
            Path::new("/nonexistent/ready-flag"),
            Duration::from_millis(150),
        );
        assert!(result.is_err());
    }

    #[test]
    fn network_ready_returns_once_flag_exists() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("ready");
        std::fs::write(&flag, "ready\n").unwrap();
        assert!(wait_for_network_ready(&flag, Duration::from_millis(100)).is_ok());
    }
}

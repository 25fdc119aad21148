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

use joblet_common::model::{
    FileUpload, JobId, JobType, NetworkMode, ResourceLimits, WorkflowId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Everything needed to create a job record. Ids are always generated by
/// the store; a spec never carries one.
#[derive(Clone, Debug, Default)]
pub struct JobSpec {
    pub command: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
    pub network: NetworkMode,
    pub volumes: Vec<String>,
    pub runtime: Option<String>,
    pub uploads: Vec<FileUpload>,
    pub environment: BTreeMap<String, String>,
    pub secret_environment: BTreeMap<String, String>,
    pub gpu_count: u32,
    pub gpu_memory_mb: u32,
    pub job_type: JobType,
    pub depends_on: BTreeSet<JobId>,
    pub workflow_id: Option<WorkflowId>,
}

/// Which namespaces the child is placed into. The default plan unshares
/// everything; `host` networking clears `net`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespacePlan {
    pub mount: bool,
    pub uts: bool,
    pub ipc: bool,
    pub net: bool,
    pub pid: bool,
    pub user: bool,
}

impl Default for NamespacePlan {
    fn default() -> Self {
        Self {
            mount: true,
            uts: true,
            ipc: true,
            net: true,
            pid: true,
            user: true,
        }
    }
}

/// Per-job handles produced by the isolation manager; owned by the
/// coordinator until launch succeeds or rollback destroys them.
#[derive(Clone, Debug)]
pub struct IsolationContext {
    pub job_id: JobId,
    pub workspace_dir: PathBuf,
    pub rootfs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub cgroup_path: PathBuf,
    pub namespaces: NamespacePlan,
}

/// Phase-1 network reservation, completed by phase-2 veth wiring once the
/// child PID exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub bridge: String,
    pub veth_host: String,
    pub veth_peer: String,
    /// Path of the readiness flag as the host sees it (inside the staged
    /// rootfs) and as the child sees it after pivot_root.
    pub ready_file_host: PathBuf,
    pub ready_file_child: PathBuf,
}

/// How the init child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub oom_killed: bool,
}

impl JobExit {
    /// Signal deaths surface the conventional 128+signal code.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 255,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub owner: Option<JobId>,
}

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

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

use joblet_api_grpc::proto::joblet as grpc;

#[macro_export]
macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// The first 8 hex characters, used for interface and host names.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|err| format!("Invalid {}: {err}", stringify!($name)))
            }
        }

        impl From<$name> for joblet_api_grpc::proto::joblet::common::Uuid {
            fn from(value: $name) -> Self {
                value.0.into()
            }
        }

        impl TryFrom<joblet_api_grpc::proto::joblet::common::Uuid> for $name {
            type Error = String;

            fn try_from(
                value: joblet_api_grpc::proto::joblet::common::Uuid,
            ) -> Result<Self, Self::Error> {
                Ok(Self(value.try_into()?))
            }
        }
    };
}

newtype_uuid!(JobId);
newtype_uuid!(WorkflowId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Scheduled => write!(f, "SCHEDULED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl From<JobStatus> for grpc::job::v1::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => grpc::job::v1::JobStatus::Pending,
            JobStatus::Scheduled => grpc::job::v1::JobStatus::Scheduled,
            JobStatus::Running => grpc::job::v1::JobStatus::Running,
            JobStatus::Completed => grpc::job::v1::JobStatus::Completed,
            JobStatus::Failed => grpc::job::v1::JobStatus::Failed,
            JobStatus::Stopped => grpc::job::v1::JobStatus::Stopped,
        }
    }
}

impl From<grpc::job::v1::JobStatus> for JobStatus {
    fn from(value: grpc::job::v1::JobStatus) -> Self {
        match value {
            grpc::job::v1::JobStatus::Pending => JobStatus::Pending,
            grpc::job::v1::JobStatus::Scheduled => JobStatus::Scheduled,
            grpc::job::v1::JobStatus::Running => JobStatus::Running,
            grpc::job::v1::JobStatus::Completed => JobStatus::Completed,
            grpc::job::v1::JobStatus::Failed => JobStatus::Failed,
            grpc::job::v1::JobStatus::Stopped => JobStatus::Stopped,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[default]
    Default,
    RuntimeBuild,
    WorkflowMember,
}

impl From<JobType> for grpc::job::v1::JobType {
    fn from(value: JobType) -> Self {
        match value {
            JobType::Default => grpc::job::v1::JobType::Default,
            JobType::RuntimeBuild => grpc::job::v1::JobType::RuntimeBuild,
            JobType::WorkflowMember => grpc::job::v1::JobType::WorkflowMember,
        }
    }
}

impl From<grpc::job::v1::JobType> for JobType {
    fn from(value: grpc::job::v1::JobType) -> Self {
        match value {
            grpc::job::v1::JobType::Default => JobType::Default,
            grpc::job::v1::JobType::RuntimeBuild => JobType::RuntimeBuild,
            grpc::job::v1::JobType::WorkflowMember => JobType::WorkflowMember,
        }
    }
}

/// How a job is attached to the network.
///
/// The empty string in a request means "the default bridge"; any other
/// unreserved name refers to a user-created network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkMode {
    #[default]
    Bridge,
    Named(String),
    Host,
    None,
    Isolated,
}

impl NetworkMode {
    /// Networks in these modes never get an IP allocation or veth wiring.
    pub fn is_unmanaged(&self) -> bool {
        matches!(
            self,
            NetworkMode::Host | NetworkMode::None | NetworkMode::Isolated
        )
    }

    pub fn network_name(&self) -> Option<&str> {
        match self {
            NetworkMode::Bridge => Some("bridge"),
            NetworkMode::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "bridge" => Ok(NetworkMode::Bridge),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            "isolated" => Ok(NetworkMode::Isolated),
            name if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
                Ok(NetworkMode::Named(name.to_string()))
            }
            other => Err(format!("Invalid network name: {other}")),
        }
    }
}

impl Display for NetworkMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Bridge => write!(f, "bridge"),
            NetworkMode::Named(name) => write!(f, "{name}"),
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Isolated => write!(f, "isolated"),
        }
    }
}

/// A set of CPU core indices in cpuset syntax ("0-3,7").
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoreSet(BTreeSet<u32>);

impl CoreSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn cores(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, core: u32) -> bool {
        self.0.contains(&core)
    }

    /// Compact cpuset rendering, e.g. "0-3,7".
    pub fn to_cpuset_string(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut iter = self.0.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{start}-{end}"));
            }
        }
        parts.join(",")
    }
}

impl FromStr for CoreSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cores = BTreeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: u32 = start
                        .trim()
                        .parse()
                        .map_err(|_| format!("Invalid core range start: {part}"))?;
                    let end: u32 = end
                        .trim()
                        .parse()
                        .map_err(|_| format!("Invalid core range end: {part}"))?;
                    if start > end {
                        return Err(format!("Inverted core range: {part}"));
                    }
                    cores.extend(start..=end);
                }
                None => {
                    let core: u32 = part
                        .parse()
                        .map_err(|_| format!("Invalid core index: {part}"))?;
                    cores.insert(core);
                }
            }
        }
        Ok(CoreSet(cores))
    }
}

impl TryFrom<String> for CoreSet {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CoreSet> for String {
    fn from(value: CoreSet) -> Self {
        value.to_cpuset_string()
    }
}

impl Display for CoreSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_cpuset_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// 0 means unlimited; 100 is one full core.
    pub cpu_percent: u32,
    /// 0 means unlimited.
    pub memory_bytes: u64,
    /// 0 means unlimited.
    pub io_bps: u64,
    pub cpu_cores: CoreSet,
}

impl From<ResourceLimits> for grpc::job::v1::ResourceLimits {
    fn from(value: ResourceLimits) -> Self {
        Self {
            cpu_percent: value.cpu_percent,
            memory_bytes: value.memory_bytes,
            io_bps: value.io_bps,
            cpu_cores: value.cpu_cores.to_cpuset_string(),
        }
    }
}

impl TryFrom<grpc::job::v1::ResourceLimits> for ResourceLimits {
    type Error = String;

    fn try_from(value: grpc::job::v1::ResourceLimits) -> Result<Self, Self::Error> {
        Ok(Self {
            cpu_percent: value.cpu_percent,
            memory_bytes: value.memory_bytes,
            io_bps: value.io_bps,
            cpu_cores: value.cpu_cores.parse()?,
        })
    }
}

/// One file or directory staged into the job workspace before launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    /// Relative to the workspace root; rejected if it escapes it.
    pub path: String,
    pub mode: u32,
    pub is_dir: bool,
    #[serde(with = "serde_byte_vec")]
    pub content: Bytes,
}

mod serde_byte_vec {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        Ok(Bytes::from(bytes))
    }
}

impl From<grpc::job::v1::FileUpload> for FileUpload {
    fn from(value: grpc::job::v1::FileUpload) -> Self {
        Self {
            path: value.path,
            mode: value.mode,
            is_dir: value.is_dir,
            content: Bytes::from(value.content),
        }
    }
}

impl From<FileUpload> for grpc::job::v1::FileUpload {
    fn from(value: FileUpload) -> Self {
        Self {
            path: value.path,
            mode: value.mode,
            is_dir: value.is_dir,
            content: value.content.to_vec(),
        }
    }
}

/// The canonical job record, exclusively owned by the job store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub args: Vec<String>,
    pub status: JobStatus,
    pub limits: ResourceLimits,
    pub network: NetworkMode,
    pub volumes: Vec<String>,
    pub runtime: Option<String>,
    pub uploads: Vec<FileUpload>,
    pub environment: BTreeMap<String, String>,
    pub secret_environment: BTreeMap<String, String>,
    pub gpu_count: u32,
    pub gpu_memory_mb: u32,
    pub gpu_indices: Vec<u32>,
    pub cgroup_path: Option<String>,
    pub pid: Option<u32>,
    pub ip_address: Option<Ipv4Addr>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub job_type: JobType,
    pub depends_on: BTreeSet<JobId>,
    pub workflow_id: Option<WorkflowId>,
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn hostname(&self) -> String {
        format!("job_{}", self.id.short())
    }
}

pub fn timestamp_millis(time: &Option<DateTime<Utc>>) -> i64 {
    time.map(|t| t.timestamp_millis()).unwrap_or(0)
}

pub fn from_timestamp_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl From<Job> for grpc::job::v1::Job {
    fn from(value: Job) -> Self {
        Self {
            id: Some(value.id.into()),
            command: value.command,
            args: value.args,
            status: grpc::job::v1::JobStatus::from(value.status) as i32,
            limits: Some(value.limits.into()),
            network: value.network.to_string(),
            volumes: value.volumes,
            runtime: value.runtime.unwrap_or_default(),
            environment: value.environment.into_iter().collect(),
            gpu_count: value.gpu_count,
            gpu_memory_mb: value.gpu_memory_mb,
            gpu_indices: value.gpu_indices,
            cgroup_path: value.cgroup_path.unwrap_or_default(),
            pid: value.pid.unwrap_or(0),
            ip_address: value
                .ip_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            scheduled_time: timestamp_millis(&value.scheduled_time),
            start_time: timestamp_millis(&value.start_time),
            end_time: timestamp_millis(&value.end_time),
            exit_code: value.exit_code,
            job_type: grpc::job::v1::JobType::from(value.job_type) as i32,
            depends_on: value.depends_on.into_iter().map(Into::into).collect(),
            workflow_id: value.workflow_id.map(Into::into),
            failure_reason: value.failure_reason.unwrap_or_default(),
        }
    }
}

impl TryFrom<grpc::job::v1::Job> for Job {
    type Error = String;

    fn try_from(value: grpc::job::v1::Job) -> Result<Self, Self::Error> {
        let status = grpc::job::v1::JobStatus::try_from(value.status)
            .map_err(|_| format!("Invalid job status: {}", value.status))?;
        let job_type = grpc::job::v1::JobType::try_from(value.job_type)
            .map_err(|_| format!("Invalid job type: {}", value.job_type))?;
        Ok(Self {
            id: value.id.ok_or("Missing field: id")?.try_into()?,
            command: value.command,
            args: value.args,
            status: status.into(),
            limits: value.limits.unwrap_or_default().try_into()?,
            network: value.network.parse()?,
            volumes: value.volumes,
            runtime: if value.runtime.is_empty() {
                None
            } else {
                Some(value.runtime)
            },
            uploads: Vec::new(),
            environment: value.environment.into_iter().collect(),
            secret_environment: BTreeMap::new(),
            gpu_count: value.gpu_count,
            gpu_memory_mb: value.gpu_memory_mb,
            gpu_indices: value.gpu_indices,
            cgroup_path: if value.cgroup_path.is_empty() {
                None
            } else {
                Some(value.cgroup_path)
            },
            pid: if value.pid == 0 { None } else { Some(value.pid) },
            ip_address: if value.ip_address.is_empty() {
                None
            } else {
                Some(
                    value
                        .ip_address
                        .parse()
                        .map_err(|_| format!("Invalid IP address: {}", value.ip_address))?,
                )
            },
            scheduled_time: from_timestamp_millis(value.scheduled_time),
            start_time: from_timestamp_millis(value.start_time),
            end_time: from_timestamp_millis(value.end_time),
            exit_code: value.exit_code,
            job_type: job_type.into(),
            depends_on: value
                .depends_on
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            workflow_id: value.workflow_id.map(TryInto::try_into).transpose()?,
            failure_reason: if value.failure_reason.is_empty() {
                None
            } else {
                Some(value.failure_reason)
            },
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl From<LogStream> for grpc::job::v1::LogStream {
    fn from(value: LogStream) -> Self {
        match value {
            LogStream::Stdout => grpc::job::v1::LogStream::Stdout,
            LogStream::Stderr => grpc::job::v1::LogStream::Stderr,
            LogStream::System => grpc::job::v1::LogStream::System,
        }
    }
}

impl From<grpc::job::v1::LogStream> for LogStream {
    fn from(value: grpc::job::v1::LogStream) -> Self {
        match value {
            grpc::job::v1::LogStream::Stdout => LogStream::Stdout,
            grpc::job::v1::LogStream::Stderr => LogStream::Stderr,
            grpc::job::v1::LogStream::System => LogStream::System,
        }
    }
}

/// One chunk of job output. `seq` is contiguous and strictly increasing
/// across both output streams of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub job_id: JobId,
    pub seq: u64,
    pub stream: LogStream,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<LogEvent> for grpc::job::v1::LogEvent {
    fn from(value: LogEvent) -> Self {
        Self {
            job_id: Some(value.job_id.into()),
            seq: value.seq,
            stream: grpc::job::v1::LogStream::from(value.stream) as i32,
            payload: value.payload.to_vec(),
            timestamp: value.timestamp.timestamp_millis(),
        }
    }
}

impl TryFrom<grpc::job::v1::LogEvent> for LogEvent {
    type Error = String;

    fn try_from(value: grpc::job::v1::LogEvent) -> Result<Self, Self::Error> {
        let stream = grpc::job::v1::LogStream::try_from(value.stream)
            .map_err(|_| format!("Invalid log stream: {}", value.stream))?;
        Ok(Self {
            job_id: value.job_id.ok_or("Missing field: job_id")?.try_into()?,
            seq: value.seq,
            stream: stream.into(),
            payload: Bytes::from(value.payload),
            timestamp: from_timestamp_millis(value.timestamp)
                .ok_or_else(|| format!("Invalid timestamp: {}", value.timestamp))?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub job_id: JobId,
    pub cpu_percent: f64,
    pub memory_current_bytes: u64,
    pub memory_max_bytes: u64,
    pub memory_peak_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub pids_current: u64,
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
}

impl From<MetricSample> for grpc::job::v1::MetricSample {
    fn from(value: MetricSample) -> Self {
        Self {
            job_id: Some(value.job_id.into()),
            cpu_percent: value.cpu_percent,
            memory_current_bytes: value.memory_current_bytes,
            memory_max_bytes: value.memory_max_bytes,
            memory_peak_bytes: value.memory_peak_bytes,
            io_read_bytes: value.io_read_bytes,
            io_write_bytes: value.io_write_bytes,
            pids_current: value.pids_current,
            timestamp: value.timestamp.timestamp_millis(),
            is_final: value.is_final,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    Filesystem,
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub volume_type: VolumeType,
    pub size_bytes: u64,
    pub host_path: String,
    pub job_count: u32,
}

impl From<Volume> for grpc::volume::v1::Volume {
    fn from(value: Volume) -> Self {
        Self {
            name: value.name,
            volume_type: match value.volume_type {
                VolumeType::Filesystem => grpc::volume::v1::VolumeType::Filesystem as i32,
                VolumeType::Memory => grpc::volume::v1::VolumeType::Memory as i32,
            },
            size_bytes: value.size_bytes,
            host_path: value.host_path,
            job_count: value.job_count,
        }
    }
}

/// Filter for job listing; empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub workflow_id: Option<WorkflowId>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.workflow_id.is_none() || self.workflow_id == job.workflow_id)
    }
}

/// Contents of a runtime tree's `runtime.yml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeManifest {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Validate an upload path: relative, normalized, inside the workspace.
pub fn validate_upload_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Upload path must not be empty".to_string());
    }
    if path.starts_with('/') {
        return Err(format!("Upload path must be relative: {path}"));
    }
    for component in path.split('/') {
        if component == ".." {
            return Err(format!("Upload path must not escape the workspace: {path}"));
        }
    }
    Ok(())
}

pub fn parse_uuid(value: Option<grpc::common::Uuid>, field: &str) -> Result<Uuid, String> {
    value
        .ok_or_else(|| format!("Missing field: {field}"))?
        .try_into()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn core_set_parses_ranges_and_singletons() {
        let cores: CoreSet = "0-3,7".parse().unwrap();
        assert_eq!(
            cores.cores().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 7],
        );
        assert_eq!(cores.to_cpuset_string(), "0-3,7");
    }

    #[test]
    fn core_set_normalizes_overlaps() {
        let cores: CoreSet = "2,0-3,3".parse().unwrap();
        assert_eq!(cores.to_cpuset_string(), "0-3");
    }

    #[test]
    fn core_set_rejects_inverted_range() {
        assert!("5-2".parse::<CoreSet>().is_err());
    }

    #[test]
    fn network_mode_parsing() {
        assert_eq!("".parse::<NetworkMode>().unwrap(), NetworkMode::Bridge);
        assert_eq!(
            "bridge".parse::<NetworkMode>().unwrap(),
            NetworkMode::Bridge
        );
        assert_eq!("host".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
        assert_eq!("none".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert_eq!(
            "isolated".parse::<NetworkMode>().unwrap(),
            NetworkMode::Isolated
        );
        assert_eq!(
            "ml-team".parse::<NetworkMode>().unwrap(),
            NetworkMode::Named("ml-team".to_string())
        );
        assert!("bad name!".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn upload_path_validation() {
        assert!(validate_upload_path("data/input.csv").is_ok());
        assert!(validate_upload_path("/etc/passwd").is_err());
        assert!(validate_upload_path("../escape").is_err());
        assert!(validate_upload_path("a/../../b").is_err());
        assert!(validate_upload_path("").is_err());
    }

    #[test]
    fn job_proto_roundtrip_preserves_terminal_fields() {
        let job = Job {
            id: JobId::new_v4(),
            command: "/bin/echo".to_string(),
            args: vec!["hello".to_string()],
            status: JobStatus::Completed,
            limits: ResourceLimits {
                cpu_percent: 150,
                memory_bytes: 134_217_728,
                io_bps: 0,
                cpu_cores: "0-1".parse().unwrap(),
            },
            network: NetworkMode::None,
            volumes: vec!["data".to_string()],
            runtime: Some("python-3.12".to_string()),
            uploads: Vec::new(),
            environment: BTreeMap::from([("K".to_string(), "V".to_string())]),
            secret_environment: BTreeMap::new(),
            gpu_count: 0,
            gpu_memory_mb: 0,
            gpu_indices: Vec::new(),
            cgroup_path: None,
            pid: None,
            ip_address: None,
            scheduled_time: Some(Utc::now()),
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
            exit_code: Some(0),
            job_type: JobType::Default,
            depends_on: BTreeSet::new(),
            workflow_id: None,
            failure_reason: None,
        };

        let proto: grpc::job::v1::Job = job.clone().into();
        let back: Job = proto.try_into().unwrap();

        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Completed);
        assert_eq!(back.exit_code, Some(0));
        assert_eq!(back.limits, job.limits);
        assert_eq!(back.network, NetworkMode::None);
        assert_eq!(back.runtime, job.runtime);
    }
}

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

//! YAML workflow execution: parse the DAG, schedule members as their
//! dependencies complete, and fail every transitive dependent of a failed
//! member without starting it.

use crate::model::JobSpec;
use crate::service::coordinator::JobLauncher;
use crate::service::store::{JobStore, JobTransition};
use crate::service::volume::VolumeService;
use chrono::{DateTime, Utc};
use joblet_common::error::JobletError;
use joblet_common::model::{JobId, JobStatus, JobType, VolumeType, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const DEFAULT_VOLUME_SIZE: u64 = 1 << 30;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, WorkflowSpec>,
    /// Single-workflow form: a bare `jobs:` map at the top level.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jobs: BTreeMap<String, WorkflowJobSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub jobs: BTreeMap<String, WorkflowJobSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJobSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<WorkflowResources>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResources {
    #[serde(default)]
    pub cpu_percent: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub io_bps: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct WorkflowMemberView {
    pub name: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub dependencies: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct WorkflowView {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowRunStatus,
    pub members: Vec<WorkflowMemberView>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Select and parse one workflow from a YAML document. The name is
/// required when the file declares several under `workflows:`.
pub fn parse_workflow(
    yaml: &[u8],
    workflow_name: Option<&str>,
) -> Result<(String, BTreeMap<String, WorkflowJobSpec>), JobletError> {
    let file: WorkflowFile = serde_yaml::from_slice(yaml)
        .map_err(|err| JobletError::invalid_request(format!("Invalid workflow YAML: {err}")))?;

    if !file.workflows.is_empty() {
        let (name, spec) = match workflow_name {
            Some(name) => {
                let spec = file.workflows.get(name).ok_or_else(|| {
                    JobletError::not_found(format!("Workflow not found in file: {name}"))
                })?;
                (name.to_string(), spec.clone())
            }
            None if file.workflows.len() == 1 => {
                let (name, spec) = file.workflows.into_iter().next().unwrap();
                (name, spec)
            }
            None => {
                return Err(JobletError::invalid_request(
                    "File declares multiple workflows; a workflow name is required",
                ))
            }
        };
        if spec.jobs.is_empty() {
            return Err(JobletError::invalid_request(format!(
                "Workflow {name} has no jobs"
            )));
        }
        Ok((name, spec.jobs))
    } else if !file.jobs.is_empty() {
        Ok((
            workflow_name.unwrap_or("default").to_string(),
            file.jobs,
        ))
    } else {
        Err(JobletError::invalid_request(
            "Workflow file declares no jobs",
        ))
    }
}

/// Kahn's algorithm: rejects unknown dependency names and cycles, and
/// returns a valid topological order.
pub fn topological_order(
    jobs: &BTreeMap<String, WorkflowJobSpec>,
) -> Result<Vec<String>, JobletError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, spec) in jobs {
        in_degree.entry(name).or_insert(0);
        for dependency in &spec.dependencies {
            if !jobs.contains_key(dependency) {
                return Err(JobletError::invalid_request(format!(
                    "Job {name} depends on unknown job {dependency}"
                )));
            }
            if dependency == name {
                return Err(JobletError::invalid_request(format!(
                    "Job {name} depends on itself"
                )));
            }
            *in_degree.entry(name).or_insert(0) += 1;
            dependents.entry(dependency).or_default().push(name);
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(jobs.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).unwrap();
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != jobs.len() {
        return Err(JobletError::invalid_request(
            "Workflow contains a dependency cycle",
        ));
    }
    Ok(order)
}

fn member_spec(
    spec: &WorkflowJobSpec,
    workflow_id: WorkflowId,
    depends_on: BTreeSet<JobId>,
) -> Result<JobSpec, JobletError> {
    let resources = spec.resources.clone().unwrap_or_default();
    Ok(JobSpec {
        command: spec.command.clone(),
        args: spec.args.clone(),
        limits: joblet_common::model::ResourceLimits {
            cpu_percent: resources.cpu_percent,
            memory_bytes: resources.memory_mb * 1024 * 1024,
            io_bps: resources.io_bps,
            cpu_cores: Default::default(),
        },
        network: spec
            .network
            .as_deref()
            .unwrap_or("")
            .parse()
            .map_err(JobletError::InvalidRequest)?,
        volumes: spec.volumes.clone(),
        runtime: spec.runtime.clone(),
        uploads: Vec::new(),
        environment: spec.environment.clone(),
        secret_environment: BTreeMap::new(),
        gpu_count: 0,
        gpu_memory_mb: 0,
        job_type: JobType::WorkflowMember,
        depends_on,
        workflow_id: Some(workflow_id),
    })
}

struct MemberState {
    job_id: JobId,
    dependencies: BTreeSet<String>,
    /// Dependencies still waiting on a COMPLETED transition.
    waiting_on: BTreeSet<String>,
    status: JobStatus,
    started: bool,
}

struct WorkflowState {
    name: String,
    members: BTreeMap<String, MemberState>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

pub struct WorkflowEngine {
    store: Arc<JobStore>,
    launcher: Arc<dyn JobLauncher>,
    volumes: Arc<dyn VolumeService>,
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowState>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<JobStore>,
        launcher: Arc<dyn JobLauncher>,
        volumes: Arc<dyn VolumeService>,
    ) -> Self {
        Self {
            store,
            launcher,
            volumes,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn run_workflow(
        &self,
        yaml: &[u8],
        workflow_name: Option<&str>,
        create_missing_volumes: bool,
    ) -> Result<WorkflowId, JobletError> {
        let (name, jobs) = parse_workflow(yaml, workflow_name)?;
        topological_order(&jobs)?;

        self.ensure_volumes(&jobs, create_missing_volumes).await?;

        let workflow_id = WorkflowId::new_v4();

        // Create every member record up front so the whole DAG is visible
        // in ListJobs before anything runs.
        let mut members: BTreeMap<String, MemberState> = BTreeMap::new();
        let mut ids_by_name: BTreeMap<String, JobId> = BTreeMap::new();
        for (member_name, spec) in &jobs {
            let depends_on: BTreeSet<JobId> = spec
                .dependencies
                .iter()
                .filter_map(|dependency| ids_by_name.get(dependency).copied())
                .collect();
            // Dependencies later in the map order than this member are
            // resolved in a second pass below.
            let job = self
                .store
                .create(member_spec(spec, workflow_id, depends_on)?)
                .await?;
            self.store
                .update(&job.id, |job| {
                    job.status = JobStatus::Scheduled;
                    Ok(())
                })
                .await?;
            ids_by_name.insert(member_name.clone(), job.id);
            members.insert(
                member_name.clone(),
                MemberState {
                    job_id: job.id,
                    dependencies: spec.dependencies.iter().cloned().collect(),
                    waiting_on: spec.dependencies.iter().cloned().collect(),
                    status: JobStatus::Scheduled,
                    started: false,
                },
            );
        }

        // Second pass: record the full dependency id sets now that every
        // member has an id.
        for (member_name, spec) in &jobs {
            let depends_on: BTreeSet<JobId> = spec
                .dependencies
                .iter()
                .filter_map(|dependency| ids_by_name.get(dependency).copied())
                .collect();
            let job_id = ids_by_name[member_name];
            self.store
                .update(&job_id, |job| {
                    job.depends_on = depends_on.clone();
                    Ok(())
                })
                .await?;
        }

        // Subscribe before starting anything so no terminal transition
        // can be missed.
        let transitions = self.store.subscribe_transitions();

        self.workflows.write().await.insert(
            workflow_id,
            WorkflowState {
                name: name.clone(),
                members,
                started_at: Utc::now(),
                finished_at: None,
            },
        );

        let engine = SchedulerHandle {
            store: self.store.clone(),
            launcher: self.launcher.clone(),
            workflows: self.workflows.clone(),
        };
        tokio::spawn(async move {
            engine.run(workflow_id, transitions).await;
        });

        info!(workflow_id = %workflow_id, "Started workflow {name}");
        Ok(workflow_id)
    }

    async fn ensure_volumes(
        &self,
        jobs: &BTreeMap<String, WorkflowJobSpec>,
        create_missing: bool,
    ) -> Result<(), JobletError> {
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        for spec in jobs.values() {
            needed.extend(spec.volumes.iter().map(String::as_str));
        }
        for name in needed {
            if self.volumes.resolve(name).await.is_ok() {
                continue;
            }
            if create_missing {
                self.volumes
                    .create(name, DEFAULT_VOLUME_SIZE, VolumeType::Filesystem)
                    .await?;
            } else {
                return Err(JobletError::invalid_request(format!(
                    "Workflow references unknown volume: {name}"
                )));
            }
        }
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowView, JobletError> {
        let workflows = self.workflows.read().await;
        let state = workflows.get(workflow_id).ok_or_else(|| {
            JobletError::not_found(format!("Workflow not found: {workflow_id}"))
        })?;
        Ok(view_of(*workflow_id, state))
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowView> {
        let workflows = self.workflows.read().await;
        let mut views: Vec<WorkflowView> = workflows
            .iter()
            .map(|(id, state)| view_of(*id, state))
            .collect();
        views.sort_by_key(|view| view.started_at);
        views
    }
}

fn view_of(id: WorkflowId, state: &WorkflowState) -> WorkflowView {
    let members: Vec<WorkflowMemberView> = state
        .members
        .iter()
        .map(|(name, member)| WorkflowMemberView {
            name: name.clone(),
            job_id: member.job_id,
            status: member.status,
            dependencies: member.dependencies.iter().cloned().collect(),
        })
        .collect();

    let status = if members.iter().all(|member| member.status == JobStatus::Completed) {
        WorkflowRunStatus::Completed
    } else if members
        .iter()
        .any(|member| matches!(member.status, JobStatus::Failed | JobStatus::Stopped))
        && members.iter().all(|member| member.status.is_terminal())
    {
        WorkflowRunStatus::Failed
    } else if members
        .iter()
        .any(|member| member.status == JobStatus::Running || member.status.is_terminal())
    {
        WorkflowRunStatus::Running
    } else {
        WorkflowRunStatus::Pending
    };

    WorkflowView {
        id,
        name: state.name.clone(),
        status,
        members,
        started_at: Some(state.started_at),
        finished_at: state.finished_at,
    }
}

struct SchedulerHandle {
    store: Arc<JobStore>,
    launcher: Arc<dyn JobLauncher>,
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowState>>>,
}

impl SchedulerHandle {
    async fn run(
        &self,
        workflow_id: WorkflowId,
        mut transitions: tokio::sync::broadcast::Receiver<JobTransition>,
    ) {
        self.start_ready(workflow_id).await;

        loop {
            let transition = match transitions.recv().await {
                Ok(transition) => transition,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(workflow_id = %workflow_id, "Workflow scheduler lagged by {skipped} transitions");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            if transition.workflow_id != Some(workflow_id) || !transition.status.is_terminal() {
                continue;
            }

            let finished = self.apply_terminal(workflow_id, &transition).await;
            self.start_ready(workflow_id).await;
            if finished {
                info!(workflow_id = %workflow_id, "Workflow is terminal");
                break;
            }
        }
    }

    /// Update member state for one terminal transition and fail the
    /// transitive dependents of a failed member. Returns true when every
    /// member is terminal.
    async fn apply_terminal(&self, workflow_id: WorkflowId, transition: &JobTransition) -> bool {
        let mut to_fail: Vec<(JobId, String)> = Vec::new();
        let all_terminal;
        {
            let mut workflows = self.workflows.write().await;
            let Some(state) = workflows.get_mut(&workflow_id) else {
                return true;
            };

            let Some(member_name) = state
                .members
                .iter()
                .find(|(_, member)| member.job_id == transition.job_id)
                .map(|(name, _)| name.clone())
            else {
                return false;
            };

            if let Some(member) = state.members.get_mut(&member_name) {
                member.status = transition.status;
            }

            match transition.status {
                JobStatus::Completed => {
                    for member in state.members.values_mut() {
                        member.waiting_on.remove(&member_name);
                    }
                }
                JobStatus::Failed | JobStatus::Stopped => {
                    // Every transitive dependent dies unstarted.
                    let doomed = transitive_dependents(&state.members, &member_name);
                    for name in doomed {
                        let member = state.members.get_mut(&name).unwrap();
                        if !member.status.is_terminal() && !member.started {
                            member.status = JobStatus::Failed;
                            to_fail.push((
                                member.job_id,
                                format!("dependency failed: {member_name}"),
                            ));
                        }
                    }
                }
                _ => {}
            }

            all_terminal = state
                .members
                .values()
                .all(|member| member.status.is_terminal());
            if all_terminal && state.finished_at.is_none() {
                state.finished_at = Some(Utc::now());
            }
        }

        for (job_id, reason) in to_fail {
            if let Err(error) = self
                .store
                .finish(&job_id, JobStatus::Failed, Some(255), Some(reason))
                .await
            {
                warn!(job_id = %job_id, "Failed to fail dependent: {error}");
            }
        }

        all_terminal
    }

    /// Launch every member whose wait set is empty and that has not been
    /// started yet.
    async fn start_ready(&self, workflow_id: WorkflowId) {
        let ready: Vec<JobId> = {
            let mut workflows = self.workflows.write().await;
            let Some(state) = workflows.get_mut(&workflow_id) else {
                return;
            };
            state
                .members
                .values_mut()
                .filter(|member| {
                    !member.started
                        && member.waiting_on.is_empty()
                        && member.status == JobStatus::Scheduled
                })
                .map(|member| {
                    member.started = true;
                    member.job_id
                })
                .collect()
        };

        for job_id in ready {
            let launcher = self.launcher.clone();
            tokio::spawn(async move {
                if let Err(error) = launcher.start_job(&job_id).await {
                    warn!(job_id = %job_id, "Workflow member launch failed: {error}");
                }
            });
        }
    }
}

/// Names of every member transitively depending on `root`.
fn transitive_dependents(
    members: &BTreeMap<String, MemberState>,
    root: &str,
) -> Vec<String> {
    let mut result = Vec::new();
    let mut queue: VecDeque<&str> = VecDeque::from([root]);
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    while let Some(current) = queue.pop_front() {
        for (name, member) in members {
            if member.dependencies.contains(current) && seen.insert(name) {
                result.push(name.clone());
                queue.push_back(name);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    const SIMPLE: &str = r#"
version: "1.0"
jobs:
  extract:
    command: "/usr/bin/extract"
    args: ["--input", "/volumes/data/raw"]
    volumes: ["data"]
  transform:
    command: "/usr/bin/transform"
    dependencies: ["extract"]
  load:
    command: "/usr/bin/load"
    dependencies: ["transform"]
"#;

    const MULTI: &str = r#"
version: "1.0"
workflows:
  nightly:
    jobs:
      build:
        command: "/usr/bin/make"
  release:
    jobs:
      package:
        command: "/usr/bin/package"
"#;

    #[test]
    fn parses_single_workflow_files() {
        let (name, jobs) = parse_workflow(SIMPLE.as_bytes(), None).unwrap();
        assert_eq!(name, "default");
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs["transform"].dependencies, vec!["extract"]);
    }

    #[test]
    fn selects_a_workflow_by_name() {
        let (name, jobs) = parse_workflow(MULTI.as_bytes(), Some("release")).unwrap();
        assert_eq!(name, "release");
        assert!(jobs.contains_key("package"));

        let missing = parse_workflow(MULTI.as_bytes(), Some("nope"));
        assert!(matches!(missing, Err(JobletError::NotFound(_))));

        let ambiguous = parse_workflow(MULTI.as_bytes(), None);
        assert!(matches!(ambiguous, Err(JobletError::InvalidRequest(_))));
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let (_, jobs) = parse_workflow(SIMPLE.as_bytes(), None).unwrap();
        let order = topological_order(&jobs).unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("extract") < position("transform"));
        assert!(position("transform") < position("load"));
    }

    #[test]
    fn cycles_are_rejected() {
        let yaml = r#"
jobs:
  a:
    command: "/bin/true"
    dependencies: ["b"]
  b:
    command: "/bin/true"
    dependencies: ["a"]
"#;
        let (_, jobs) = parse_workflow(yaml.as_bytes(), None).unwrap();
        let result = topological_order(&jobs);
        assert!(matches!(result, Err(JobletError::InvalidRequest(_))));
    }

    #[test]
    fn unknown_dependencies_are_rejected() {
        let yaml = r#"
jobs:
  a:
    command: "/bin/true"
    dependencies: ["ghost"]
"#;
        let (_, jobs) = parse_workflow(yaml.as_bytes(), None).unwrap();
        assert!(topological_order(&jobs).is_err());
    }

    #[test]
    fn self_dependency_is_rejected() {
        let yaml = r#"
jobs:
  a:
    command: "/bin/true"
    dependencies: ["a"]
"#;
        let (_, jobs) = parse_workflow(yaml.as_bytes(), None).unwrap();
        assert!(topological_order(&jobs).is_err());
    }

    #[test]
    fn yaml_roundtrip_preserves_the_dag() {
        let (_, jobs) = parse_workflow(SIMPLE.as_bytes(), None).unwrap();
        let serialized = serde_yaml::to_string(&WorkflowFile {
            version: Some("1.0".to_string()),
            workflows: BTreeMap::new(),
            jobs: jobs.clone(),
        })
        .unwrap();
        let (_, reparsed) = parse_workflow(serialized.as_bytes(), None).unwrap();
        assert_eq!(jobs, reparsed);
    }

    #[test]
    fn transitive_dependents_are_found() {
        let members: BTreeMap<String, MemberState> = [
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
            ("d", vec!["a"]),
            ("e", vec![]),
        ]
        .into_iter()
        .map(|(name, deps)| {
            (
                name.to_string(),
                MemberState {
                    job_id: JobId::new_v4(),
                    dependencies: deps.iter().map(|d| d.to_string()).collect(),
                    waiting_on: deps.iter().map(|d| d.to_string()).collect(),
                    status: JobStatus::Scheduled,
                    started: false,
                },
            )
        })
        .collect();

        let mut doomed = transitive_dependents(&members, "a");
        doomed.sort();
        assert_eq!(doomed, vec!["b", "c", "d"]);
        assert!(transitive_dependents(&members, "e").is_empty());
    }
}

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

//! Workflow engine scheduling against the real store and a scripted
//! launcher: dependency gating, failure propagation and volume
//! pre-creation.

use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{JobId, JobStatus};
use joblet_server::service::coordinator::JobLauncher;
use joblet_server::service::persist::DisabledPersistence;
use joblet_server::service::store::JobStore;
use joblet_server::service::volume::{LocalVolumeService, VolumeService};
use joblet_server::service::workflow::{WorkflowEngine, WorkflowRunStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;

test_r::enable!();

use test_r::test;

/// Launcher that completes each member according to its command instead
/// of spawning real processes: /bin/true completes, /bin/false fails,
/// /bin/stopme ends STOPPED.
struct ScriptedLauncher {
    store: Arc<JobStore>,
    started: Mutex<Vec<JobId>>,
}

impl ScriptedLauncher {
    fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            started: Mutex::new(Vec::new()),
        }
    }

    fn started(&self) -> Vec<JobId> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobLauncher for ScriptedLauncher {
    async fn start_job(&self, job_id: &JobId) -> Result<(), JobletError> {
        self.started.lock().unwrap().push(*job_id);
        let job = self.store.get(job_id).await?;
        self.store
            .mark_running(job_id, 4242, "/fake/cgroup".to_string())
            .await?;

        let store = self.store.clone();
        let job_id = *job_id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let (status, exit_code) = match job.command.as_str() {
                "/bin/false" => (JobStatus::Failed, 1),
                "/bin/stopme" => (JobStatus::Stopped, 143),
                _ => (JobStatus::Completed, 0),
            };
            let _ = store.finish(&job_id, status, Some(exit_code), None).await;
        });
        Ok(())
    }

    async fn stop_job(&self, _job_id: &JobId) -> Result<(), JobletError> {
        Ok(())
    }
}

struct Harness {
    engine: WorkflowEngine,
    store: Arc<JobStore>,
    launcher: Arc<ScriptedLauncher>,
    volumes: Arc<dyn VolumeService>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStore::new(Arc::new(DisabledPersistence)));
    let launcher = Arc::new(ScriptedLauncher::new(store.clone()));
    let volumes: Arc<dyn VolumeService> = Arc::new(
        LocalVolumeService::start(dir.path().to_path_buf())
            .await
            .unwrap(),
    );
    let engine = WorkflowEngine::new(store.clone(), launcher.clone(), volumes.clone());
    Harness {
        engine,
        store,
        launcher,
        volumes,
        _dir: dir,
    }
}

async fn wait_for_workflow(
    engine: &WorkflowEngine,
    workflow_id: &joblet_common::model::WorkflowId,
    status: WorkflowRunStatus,
) -> joblet_server::service::workflow::WorkflowView {
    for _ in 0..200 {
        let view = engine.get_workflow(workflow_id).await.unwrap();
        if view.status == status {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {workflow_id} never reached {status:?}");
}

#[test]
async fn members_start_only_after_their_dependencies_complete() {
    let harness = harness().await;
    let yaml = r#"
jobs:
  a:
    command: "/bin/true"
  b:
    command: "/bin/true"
    dependencies: ["a"]
  c:
    command: "/bin/true"
    dependencies: ["a"]
  d:
    command: "/bin/true"
    dependencies: ["b", "c"]
"#;

    let workflow_id = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, false)
        .await
        .unwrap();
    let view =
        wait_for_workflow(&harness.engine, &workflow_id, WorkflowRunStatus::Completed).await;

    assert_eq!(view.members.len(), 4);
    assert!(view
        .members
        .iter()
        .all(|member| member.status == JobStatus::Completed));

    // Start order respects the DAG.
    let started = harness.launcher.started();
    let id_of = |name: &str| {
        view.members
            .iter()
            .find(|member| member.name == name)
            .unwrap()
            .job_id
    };
    let position =
        |id: JobId| started.iter().position(|started| *started == id).unwrap();
    assert!(position(id_of("a")) < position(id_of("b")));
    assert!(position(id_of("a")) < position(id_of("c")));
    assert!(position(id_of("d")) > position(id_of("b")));
    assert!(position(id_of("d")) > position(id_of("c")));
}

#[test]
async fn failure_propagates_to_transitive_dependents_without_starting_them() {
    let harness = harness().await;
    let yaml = r#"
jobs:
  a:
    command: "/bin/false"
  b:
    command: "/bin/true"
    dependencies: ["a"]
  c:
    command: "/bin/true"
    dependencies: ["b"]
"#;

    let workflow_id = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, false)
        .await
        .unwrap();
    let view = wait_for_workflow(&harness.engine, &workflow_id, WorkflowRunStatus::Failed).await;

    let member = |name: &str| {
        view.members
            .iter()
            .find(|member| member.name == name)
            .unwrap()
            .clone()
    };
    assert_eq!(member("a").status, JobStatus::Failed);
    assert_eq!(member("b").status, JobStatus::Failed);
    assert_eq!(member("c").status, JobStatus::Failed);

    // Only the root was ever launched.
    let started = harness.launcher.started();
    assert_eq!(started, vec![member("a").job_id]);

    // The dependents carry the propagation reason.
    let b = harness.store.get(&member("b").job_id).await.unwrap();
    assert_eq!(b.failure_reason.as_deref(), Some("dependency failed: a"));
    assert!(b.start_time.is_none());
}

#[test]
async fn stopped_dependencies_also_fail_their_dependents() {
    let harness = harness().await;
    let yaml = r#"
jobs:
  a:
    command: "/bin/stopme"
  b:
    command: "/bin/true"
    dependencies: ["a"]
"#;

    let workflow_id = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, false)
        .await
        .unwrap();
    let view = wait_for_workflow(&harness.engine, &workflow_id, WorkflowRunStatus::Failed).await;

    let statuses: Vec<JobStatus> = view.members.iter().map(|member| member.status).collect();
    assert!(statuses.contains(&JobStatus::Stopped));
    assert!(statuses.contains(&JobStatus::Failed));
}

#[test]
async fn independent_members_of_a_failing_workflow_still_run() {
    let harness = harness().await;
    let yaml = r#"
jobs:
  a:
    command: "/bin/false"
  standalone:
    command: "/bin/true"
"#;

    let workflow_id = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, false)
        .await
        .unwrap();
    let view = wait_for_workflow(&harness.engine, &workflow_id, WorkflowRunStatus::Failed).await;

    let standalone = view
        .members
        .iter()
        .find(|member| member.name == "standalone")
        .unwrap();
    assert_eq!(standalone.status, JobStatus::Completed);
}

#[test]
async fn missing_volumes_are_rejected_or_created() {
    let harness = harness().await;
    let yaml = r#"
jobs:
  a:
    command: "/bin/true"
    volumes: ["scratch"]
"#;

    let rejected = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, false)
        .await;
    assert!(matches!(rejected, Err(JobletError::InvalidRequest(_))));

    let workflow_id = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, true)
        .await
        .unwrap();
    wait_for_workflow(&harness.engine, &workflow_id, WorkflowRunStatus::Completed).await;

    let volume = harness.volumes.resolve("scratch").await.unwrap();
    assert_eq!(volume.size_bytes, 1 << 30);
}

#[test]
async fn workflow_members_are_linked_to_their_workflow() {
    let harness = harness().await;
    let yaml = r#"
jobs:
  only:
    command: "/bin/true"
"#;

    let workflow_id = harness
        .engine
        .run_workflow(yaml.as_bytes(), None, false)
        .await
        .unwrap();
    let view =
        wait_for_workflow(&harness.engine, &workflow_id, WorkflowRunStatus::Completed).await;

    let job = harness
        .store
        .get(&view.members[0].job_id)
        .await
        .unwrap();
    assert_eq!(job.workflow_id, Some(workflow_id));
    assert_eq!(
        job.job_type,
        joblet_common::model::JobType::WorkflowMember
    );
}

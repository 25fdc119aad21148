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

use joblet_common::model::JobStatus;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge, Registry,
};

lazy_static! {
    static ref JOBS_STARTED_TOTAL: IntCounter = register_int_counter!(
        "joblet_jobs_started_total",
        "Number of jobs that reached RUNNING"
    )
    .unwrap();
    static ref JOBS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "joblet_jobs_finished_total",
        "Number of terminal job transitions",
        &["status"]
    )
    .unwrap();
    static ref JOB_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "joblet_job_failures_total",
        "Number of failed launches by error kind",
        &["kind"]
    )
    .unwrap();
    static ref PERSIST_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "joblet_persist_queue_depth",
        "Mutations queued towards the persistence subprocess"
    )
    .unwrap();
    static ref PERSIST_DEGRADED: IntGauge = register_int_gauge!(
        "joblet_persist_degraded",
        "1 while the persistence subprocess is unreachable"
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    // The default registry already holds everything registered through
    // the macros above; touching each metric forces initialization.
    JOBS_STARTED_TOTAL.reset();
    PERSIST_QUEUE_DEPTH.set(0);
    PERSIST_DEGRADED.set(0);
    prometheus::default_registry().clone()
}

pub fn record_job_started() {
    JOBS_STARTED_TOTAL.inc();
}

pub fn record_job_finished(status: JobStatus) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[&status.to_string()])
        .inc();
}

pub fn record_job_failed(kind: &str) {
    JOB_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_persist_queue_depth(depth: u64) {
    PERSIST_QUEUE_DEPTH.set(depth.min(i64::MAX as u64) as i64);
}

pub fn record_persist_degraded(degraded: bool) {
    PERSIST_DEGRADED.set(if degraded { 1 } else { 0 });
}

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

use prost::Message;
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    let protos = [
        "proto/joblet/common/common.proto",
        "proto/joblet/job/v1/job.proto",
        "proto/joblet/workflow/v1/workflow.proto",
        "proto/joblet/volume/v1/volume.proto",
        "proto/joblet/network/v1/network.proto",
        "proto/joblet/runtime/v1/runtime.proto",
        "proto/joblet/monitor/v1/monitor.proto",
        "proto/joblet/persist/v1/persist.proto",
    ];

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    let file_descriptor_set = protox::compile(protos, ["proto"])?;
    std::fs::write(
        out_dir.join("services.bin"),
        file_descriptor_set.encode_to_vec(),
    )?;

    tonic_prost_build::configure()
        .type_attribute(
            "joblet.common.Uuid",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .type_attribute(
            "joblet.job.v1.ResourceLimits",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .type_attribute(
            "joblet.job.v1.Job",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .type_attribute(
            "joblet.job.v1.LogEvent",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .type_attribute(
            "joblet.job.v1.MetricSample",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .include_file("mod.rs")
        .compile_fds(file_descriptor_set)?;

    Ok(())
}

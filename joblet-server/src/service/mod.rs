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

pub mod cgroup;
pub mod coordinator;
pub mod environment;
pub mod gpu;
pub mod isolation;
pub mod logbus;
pub mod network;
pub mod persist;
pub mod process;
pub mod runtimes;
pub mod sampler;
pub mod store;
pub mod volume;
pub mod workflow;

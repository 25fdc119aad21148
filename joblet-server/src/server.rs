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

use joblet_common::tracing::init_tracing_with_default_env_filter;
use joblet_server::config::make_config_loader;
use joblet_server::{init, metrics, JobletServer};
use tokio::task::JoinSet;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The same binary is re-entered as the in-namespace init of every
    // job; that path must not touch the runtime or the config file.
    if init::is_init_mode() {
        init::run();
    }

    match make_config_loader().load_or_dump_config() {
        Some(config) => {
            init_tracing_with_default_env_filter(&config.tracing);

            metrics::register_all();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(async move {
                let server = JobletServer::new(config).await?;
                let mut join_set = JoinSet::new();
                server.run(&mut join_set).await?;

                tokio::select! {
                    result = async {
                        while let Some(result) = join_set.join_next().await {
                            result??;
                        }
                        Ok::<(), anyhow::Error>(())
                    } => result?,
                    _ = tokio::signal::ctrl_c() => {
                        server.shutdown();
                    }
                }
                Ok::<(), anyhow::Error>(())
            })?;

            Ok(())
        }
        None => Ok(()),
    }
}

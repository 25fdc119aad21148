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

//! Cgroup v2 file access. Reads and writes against `/sys/fs/cgroup` are
//! expected to return instantly; the timeout exists because a hung
//! controller would otherwise wedge every job's sampler.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CgroupIoError {
    #[error("cgroup i/o timed out after {0:?}: {1}")]
    Timeout(Duration, String),
    #[error("cgroup i/o failed on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub async fn write_control(
    path: &Path,
    contents: &str,
    timeout: Duration,
) -> Result<(), CgroupIoError> {
    let display = path.display().to_string();
    match tokio::time::timeout(timeout, tokio::fs::write(path, contents)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(CgroupIoError::Io {
            path: display,
            source,
        }),
        Err(_) => Err(CgroupIoError::Timeout(timeout, display)),
    }
}

pub async fn read_control(path: &Path, timeout: Duration) -> Result<String, CgroupIoError> {
    let display = path.display().to_string();
    match tokio::time::timeout(timeout, tokio::fs::read_to_string(path)).await {
        Ok(Ok(contents)) => Ok(contents),
        Ok(Err(source)) => Err(CgroupIoError::Io {
            path: display,
            source,
        }),
        Err(_) => Err(CgroupIoError::Timeout(timeout, display)),
    }
}

/// Parse flat `key value` files such as `cpu.stat` and `memory.events`.
pub fn parse_flat_keyed(contents: &str) -> HashMap<&str, u64> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key, value))
        })
        .collect()
}

/// Aggregate rbytes/wbytes across all devices in `io.stat`.
pub fn parse_io_stat(contents: &str) -> (u64, u64) {
    let mut read = 0u64;
    let mut written = 0u64;
    for line in contents.lines() {
        for field in line.split_whitespace().skip(1) {
            if let Some((key, value)) = field.split_once('=') {
                match key {
                    "rbytes" => read += value.parse().unwrap_or(0),
                    "wbytes" => written += value.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
    }
    (read, written)
}

/// `memory.current` style single-value files; `max` parses as u64::MAX.
pub fn parse_single_value(contents: &str) -> u64 {
    let trimmed = contents.trim();
    if trimmed == "max" {
        u64::MAX
    } else {
        trimmed.parse().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn flat_keyed_parsing() {
        let stat = "usage_usec 1500000\nuser_usec 1000000\nsystem_usec 500000\n";
        let parsed = parse_flat_keyed(stat);
        assert_eq!(parsed.get("usage_usec"), Some(&1_500_000));
        assert_eq!(parsed.get("system_usec"), Some(&500_000));
        assert_eq!(parsed.get("missing"), None);
    }

    #[test]
    fn io_stat_aggregates_devices() {
        let stat = "8:0 rbytes=1024 wbytes=2048 rios=10 wios=20\n\
                    259:1 rbytes=512 wbytes=0 rios=1 wios=0\n";
        assert_eq!(parse_io_stat(stat), (1536, 2048));
    }

    #[test]
    fn single_value_handles_max() {
        assert_eq!(parse_single_value("134217728\n"), 134_217_728);
        assert_eq!(parse_single_value("max\n"), u64::MAX);
        assert_eq!(parse_single_value("garbage"), 0);
    }
}

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

//! Named volumes: host directory (or tmpfs) backings that jobs mount at
//! `/volumes/<name>`. Volume lifecycle is independent of any job; a live
//! reference count blocks deletion.

use async_trait::async_trait;
use joblet_common::error::JobletError;
use joblet_common::model::{Volume, VolumeType};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

const META_FILE: &str = ".joblet-volume.json";

#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn create(
        &self,
        name: &str,
        size_bytes: u64,
        volume_type: VolumeType,
    ) -> Result<Volume, JobletError>;

    /// Fails with `CONFLICT` while any job references the volume.
    async fn remove(&self, name: &str) -> Result<(), JobletError>;

    async fn list(&self) -> Vec<Volume>;

    async fn resolve(&self, name: &str) -> Result<Volume, JobletError>;

    /// Take a job reference; released at job cleanup.
    async fn acquire(&self, name: &str) -> Result<(), JobletError>;

    async fn release(&self, name: &str);
}

#[derive(Serialize, Deserialize)]
struct VolumeMeta {
    volume_type: VolumeType,
    size_bytes: u64,
}

pub struct LocalVolumeService {
    volumes_dir: PathBuf,
    volumes: RwLock<HashMap<String, Volume>>,
}

impl LocalVolumeService {
    /// Rediscovers existing volume backings from the volumes directory.
    pub async fn start(volumes_dir: PathBuf) -> Result<Self, JobletError> {
        tokio::fs::create_dir_all(&volumes_dir)
            .await
            .map_err(|err| JobletError::internal(format!("volumes dir: {err}")))?;

        let mut volumes = HashMap::new();
        let mut entries = tokio::fs::read_dir(&volumes_dir)
            .await
            .map_err(|err| JobletError::internal(format!("volumes scan: {err}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| JobletError::internal(format!("volumes scan: {err}")))?
        {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let meta_path = entry.path().join(META_FILE);
            let meta: VolumeMeta = match tokio::fs::read_to_string(&meta_path).await {
                Ok(contents) => serde_json::from_str(&contents).unwrap_or(VolumeMeta {
                    volume_type: VolumeType::Filesystem,
                    size_bytes: 0,
                }),
                Err(_) => VolumeMeta {
                    volume_type: VolumeType::Filesystem,
                    size_bytes: 0,
                },
            };
            volumes.insert(
                name.clone(),
                Volume {
                    name,
                    volume_type: meta.volume_type,
                    size_bytes: meta.size_bytes,
                    host_path: entry.path().display().to_string(),
                    job_count: 0,
                },
            );
        }
        if !volumes.is_empty() {
            info!("Discovered {} volume(s)", volumes.len());
        }

        Ok(Self {
            volumes_dir,
            volumes: RwLock::new(volumes),
        })
    }
}

fn validate_volume_name(name: &str) -> Result<(), JobletError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(JobletError::invalid_request(format!(
            "Invalid volume name: {name}"
        )));
    }
    Ok(())
}

#[async_trait]
impl VolumeService for LocalVolumeService {
    async fn create(
        &self,
        name: &str,
        size_bytes: u64,
        volume_type: VolumeType,
    ) -> Result<Volume, JobletError> {
        validate_volume_name(name)?;

        let mut volumes = self.volumes.write().await;
        if volumes.contains_key(name) {
            return Err(JobletError::conflict(format!(
                "Volume already exists: {name}"
            )));
        }

        let host_path = self.volumes_dir.join(name);
        tokio::fs::create_dir_all(&host_path)
            .await
            .map_err(|err| JobletError::internal(format!("volume create: {err}")))?;

        if volume_type == VolumeType::Memory {
            let data = format!("size={size_bytes}");
            mount(
                Some("tmpfs"),
                &host_path,
                Some("tmpfs"),
                MsFlags::empty(),
                Some(data.as_str()),
            )
            .map_err(|err| {
                JobletError::internal(format!("tmpfs mount for {name}: {err}"))
            })?;
        }

        let meta = VolumeMeta {
            volume_type,
            size_bytes,
        };
        tokio::fs::write(
            host_path.join(META_FILE),
            serde_json::to_vec(&meta)
                .map_err(|err| JobletError::internal(err.to_string()))?,
        )
        .await
        .map_err(|err| JobletError::internal(format!("volume meta: {err}")))?;

        let volume = Volume {
            name: name.to_string(),
            volume_type,
            size_bytes,
            host_path: host_path.display().to_string(),
            job_count: 0,
        };
        volumes.insert(name.to_string(), volume.clone());
        info!("Created volume {name} ({volume_type:?}, {size_bytes} bytes)");
        Ok(volume)
    }

    async fn remove(&self, name: &str) -> Result<(), JobletError> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get(name)
            .ok_or_else(|| JobletError::not_found(format!("Volume not found: {name}")))?;
        if volume.job_count > 0 {
            return Err(JobletError::conflict(format!(
                "Volume {name} is used by {} job(s)",
                volume.job_count
            )));
        }

        let host_path = PathBuf::from(&volume.host_path);
        if volume.volume_type == VolumeType::Memory {
            if let Err(err) = umount2(&host_path, MntFlags::MNT_DETACH) {
                warn!("tmpfs unmount for {name}: {err}");
            }
        }
        tokio::fs::remove_dir_all(&host_path)
            .await
            .map_err(|err| JobletError::internal(format!("volume remove: {err}")))?;
        volumes.remove(name);
        Ok(())
    }

    async fn list(&self) -> Vec<Volume> {
        let mut list: Vec<Volume> = self.volumes.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    async fn resolve(&self, name: &str) -> Result<Volume, JobletError> {
        self.volumes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| JobletError::not_found(format!("Volume not found: {name}")))
    }

    async fn acquire(&self, name: &str) -> Result<(), JobletError> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| JobletError::not_found(format!("Volume not found: {name}")))?;
        volume.job_count += 1;
        Ok(())
    }

    async fn release(&self, name: &str) {
        let mut volumes = self.volumes.write().await;
        if let Some(volume) = volumes.get_mut(name) {
            volume.job_count = volume.job_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn create_list_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVolumeService::start(dir.path().to_path_buf())
            .await
            .unwrap();

        let volume = service
            .create("data", 1 << 30, VolumeType::Filesystem)
            .await
            .unwrap();
        assert!(PathBuf::from(&volume.host_path).is_dir());
        assert_eq!(service.list().await.len(), 1);

        service.remove("data").await.unwrap();
        assert!(service.list().await.is_empty());
        assert!(!dir.path().join("data").exists());
    }

    #[test]
    async fn duplicate_names_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVolumeService::start(dir.path().to_path_buf())
            .await
            .unwrap();
        service
            .create("data", 1024, VolumeType::Filesystem)
            .await
            .unwrap();
        let result = service.create("data", 1024, VolumeType::Filesystem).await;
        assert!(matches!(result, Err(JobletError::Conflict(_))));
    }

    #[test]
    async fn removal_is_blocked_while_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVolumeService::start(dir.path().to_path_buf())
            .await
            .unwrap();
        service
            .create("data", 1024, VolumeType::Filesystem)
            .await
            .unwrap();

        service.acquire("data").await.unwrap();
        assert!(matches!(
            service.remove("data").await,
            Err(JobletError::Conflict(_))
        ));

        service.release("data").await;
        service.remove("data").await.unwrap();
    }

    #[test]
    async fn discovery_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let service = LocalVolumeService::start(dir.path().to_path_buf())
                .await
                .unwrap();
            service
                .create("models", 4096, VolumeType::Filesystem)
                .await
                .unwrap();
        }

        let service = LocalVolumeService::start(dir.path().to_path_buf())
            .await
            .unwrap();
        let volumes = service.list().await;
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "models");
        assert_eq!(volumes[0].size_bytes, 4096);
    }

    #[test]
    async fn invalid_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVolumeService::start(dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(service
            .create("../evil", 1024, VolumeType::Filesystem)
            .await
            .is_err());
        assert!(service
            .create("", 1024, VolumeType::Filesystem)
            .await
            .is_err());
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! An in-memory [`CatalogStore`] fake for unit tests in the other crates
//! that only need catalog *behavior*, not a real SQLite file.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base::{err, Error, ErrorKind};
use jiff::Timestamp;
use uuid::Uuid;

use crate::model::{
    Clip, ClipStatus, ConfigValue, DiskScanUpdate, DiskType, LocalArtifact, Media, MediaKind,
    NewClip, NewMedia, NewTask, PendingTask, ProcessingStatus, StorageDisk, TaskStatus, TaskType,
};
use crate::store::CatalogStore;

#[derive(Default)]
struct State {
    disks: HashMap<Uuid, StorageDisk>,
    media: HashMap<String, Media>,
    clips: HashMap<Uuid, Clip>,
    tasks: HashMap<i64, PendingTask>,
    next_task_id: i64,
    config: HashMap<String, ConfigValue>,
}

/// A fake catalog backed by plain in-process maps; mirrors
/// [`crate::SqliteCatalog`]'s observable behavior closely enough to drive
/// the disk pool, archive, and outbound components in tests without a
/// filesystem.
pub struct FakeCatalog {
    state: Mutex<State>,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        FakeCatalog {
            state: Mutex::new(State::default()),
        }
    }
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for FakeCatalog {
    async fn register_disk(&self, path: &str, priority: i64) -> Result<Uuid, Error> {
        let mut state = self.state.lock().unwrap();
        if state.disks.values().any(|d| d.path == path) {
            return Err(err!(AlreadyExists, "disk path {path} already registered"));
        }
        let id = Uuid::new_v4();
        state.disks.insert(
            id,
            StorageDisk {
                id,
                path: path.to_string(),
                disk_type: DiskType::Unknown,
                total_space_bytes: 0,
                available_space_bytes: 0,
                last_scan_at: None,
                priority,
                is_active: false,
            },
        );
        Ok(id)
    }

    async fn list_disks(&self) -> Result<Vec<StorageDisk>, Error> {
        let state = self.state.lock().unwrap();
        let mut disks: Vec<_> = state.disks.values().cloned().collect();
        disks.sort_by_key(|d| d.priority);
        Ok(disks)
    }

    async fn get_disk(&self, id: Uuid) -> Result<Option<StorageDisk>, Error> {
        Ok(self.state.lock().unwrap().disks.get(&id).cloned())
    }

    async fn get_disk_by_path(&self, path: &str) -> Result<Option<StorageDisk>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .disks
            .values()
            .find(|d| d.path == path)
            .cloned())
    }

    async fn update_disk_scan(&self, id: Uuid, update: DiskScanUpdate) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let disk = state
            .disks
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such disk {id}"))?;
        disk.disk_type = update.disk_type;
        disk.total_space_bytes = update.total_space_bytes;
        disk.available_space_bytes = update.available_space_bytes;
        disk.priority = update.priority;
        disk.last_scan_at = Some(update.last_scan_at);
        Ok(())
    }

    async fn set_active_disk(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.disks.contains_key(&id) {
            return Err(err!(NotFound, "no such disk {id}"));
        }
        for disk in state.disks.values_mut() {
            disk.is_active = disk.id == id;
        }
        Ok(())
    }

    async fn active_disk(&self) -> Result<Option<StorageDisk>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .disks
            .values()
            .find(|d| d.is_active)
            .cloned())
    }

    async fn insert_media(&self, media: NewMedia) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let dup = state.media.values().any(|m| {
            m.camera_name == media.camera_name && m.start_at == media.start_at && m.kind == media.kind
        });
        if dup {
            return Err(err!(AlreadyExists, "media {} already exists", media.id));
        }
        state.media.insert(
            media.id.clone(),
            Media {
                id: media.id,
                camera_name: media.camera_name,
                storage_disk_id: media.storage_disk_id,
                relative_path: media.relative_path,
                start_at: media.start_at,
                end_at: media.end_at,
                size_bytes: media.size_bytes,
                kind: media.kind,
                source_segment_count: media.source_segment_count,
                status: media.status,
                created_at: Timestamp::now(),
            },
        );
        Ok(())
    }

    async fn get_media(&self, id: &str) -> Result<Option<Media>, Error> {
        Ok(self.state.lock().unwrap().media.get(id).cloned())
    }

    async fn media_exists(
        &self,
        camera_name: &str,
        start_at: Timestamp,
        kind: MediaKind,
    ) -> Result<bool, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .media
            .values()
            .any(|m| m.camera_name == camera_name && m.start_at == start_at && m.kind == kind))
    }

    async fn list_media_overlapping(
        &self,
        camera_name: &str,
        start: Timestamp,
        end: Timestamp,
        kind: Option<MediaKind>,
    ) -> Result<Vec<Media>, Error> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .media
            .values()
            .filter(|m| {
                m.camera_name == camera_name
                    && kind.map(|k| m.kind == k).unwrap_or(true)
                    && m.start_at < end
                    && m.end_at > start
            })
            .cloned()
            .collect();
        out.sort_by_key(|m| m.start_at);
        Ok(out)
    }

    async fn count_segments_in_window(
        &self,
        camera_name: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<i64, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .media
            .values()
            .filter(|m| {
                m.camera_name == camera_name
                    && m.kind == MediaKind::Segment
                    && m.start_at >= start
                    && m.start_at < end
            })
            .count() as i64)
    }

    async fn set_media_status(&self, id: &str, status: ProcessingStatus) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let media = state
            .media
            .get_mut(id)
            .ok_or_else(|| err!(NotFound, "no such media {id}"))?;
        if !status.allowed_predecessors().contains(&media.status) {
            return Err(err!(
                Invariant,
                "media {id} cannot transition from {} to {}",
                media.status.as_str(),
                status.as_str()
            ));
        }
        media.status = status;
        Ok(())
    }

    async fn delete_media(&self, id: &str) -> Result<(), Error> {
        self.state.lock().unwrap().media.remove(id);
        Ok(())
    }

    async fn list_ready_chunks_older_than(&self, cutoff: Timestamp) -> Result<Vec<Media>, Error> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .media
            .values()
            .filter(|m| m.kind == MediaKind::Chunk && m.status == ProcessingStatus::Ready && m.created_at < cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn insert_clip(&self, clip: NewClip) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.clips.insert(
            clip.id,
            Clip {
                id: clip.id,
                booking_id: clip.booking_id,
                camera_name: clip.camera_name,
                requested_start_at: clip.requested_start_at,
                requested_end_at: clip.requested_end_at,
                local_path: None,
                storage_disk_id: None,
                size_bytes: None,
                duration_ms: None,
                remote: Default::default(),
                status: ClipStatus::Initial,
                error_message: None,
                created_at: Timestamp::now(),
                finished_at: None,
                uploaded_at: None,
            },
        );
        Ok(())
    }

    async fn get_clip(&self, id: Uuid) -> Result<Option<Clip>, Error> {
        Ok(self.state.lock().unwrap().clips.get(&id).cloned())
    }

    async fn set_clip_status(
        &self,
        id: Uuid,
        status: ClipStatus,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let clip = state
            .clips
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such clip {id}"))?;
        clip.status = status;
        clip.error_message = error_message.map(str::to_string);
        if matches!(status, ClipStatus::Ready | ClipStatus::Failed) {
            clip.finished_at = Some(Timestamp::now());
        }
        Ok(())
    }

    async fn set_clip_local_artifact(&self, id: Uuid, artifact: LocalArtifact) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let clip = state
            .clips
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such clip {id}"))?;
        clip.local_path = Some(artifact.local_path);
        clip.storage_disk_id = Some(artifact.storage_disk_id);
        clip.size_bytes = Some(artifact.size_bytes);
        clip.duration_ms = Some(artifact.duration_ms);
        Ok(())
    }

    async fn set_clip_remote_mp4(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let clip = state
            .clips
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such clip {id}"))?;
        clip.remote.mp4_key = Some(key.to_string());
        clip.remote.mp4_url = Some(url.to_string());
        Ok(())
    }

    async fn set_clip_remote_preview(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let clip = state
            .clips
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such clip {id}"))?;
        clip.remote.preview_key = Some(key.to_string());
        clip.remote.preview_url = Some(url.to_string());
        Ok(())
    }

    async fn set_clip_remote_thumbnail(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let clip = state
            .clips
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such clip {id}"))?;
        clip.remote.thumbnail_key = Some(key.to_string());
        clip.remote.thumbnail_url = Some(url.to_string());
        Ok(())
    }

    async fn mark_clip_uploaded(&self, id: Uuid, at: Timestamp) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let clip = state
            .clips
            .get_mut(&id)
            .ok_or_else(|| err!(NotFound, "no such clip {id}"))?;
        clip.status = ClipStatus::Ready;
        clip.uploaded_at = Some(at);
        Ok(())
    }

    async fn list_clips_eligible_for_retention(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<Clip>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .clips
            .values()
            .filter(|c| {
                c.status == ClipStatus::Ready
                    && c.finished_at.map(|f| f < cutoff).unwrap_or(false)
                    && c.remote.is_complete()
                    && c.local_path.is_some()
            })
            .cloned()
            .collect())
    }

    async fn enqueue_task(&self, task: NewTask) -> Result<i64, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_task_id += 1;
        let id = state.next_task_id;
        let now = Timestamp::now();
        state.tasks.insert(
            id,
            PendingTask {
                id,
                task_type: task.task_type,
                clip_id: task.clip_id,
                payload: task.payload,
                attempts: 0,
                max_attempts: task.max_attempts,
                next_retry_at: task.next_retry_at,
                last_error: None,
                status: TaskStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn dequeue_next(&self, now: Timestamp) -> Result<Option<PendingTask>, Error> {
        let mut state = self.state.lock().unwrap();
        let id = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.next_retry_at <= now)
            .min_by_key(|t| (t.task_type == TaskType::NotifyApi, t.next_retry_at, t.id))
            .map(|t| t.id);
        let Some(id) = id else {
            return Ok(None);
        };
        let task = state.tasks.get_mut(&id).unwrap();
        task.status = TaskStatus::Processing;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn mark_task_completed(&self, id: i64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = TaskStatus::Completed;
            task.updated_at = Timestamp::now();
        }
        Ok(())
    }

    async fn mark_task_retry(
        &self,
        id: i64,
        next_retry_at: Timestamp,
        last_error: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = TaskStatus::Pending;
            task.attempts += 1;
            task.next_retry_at = next_retry_at;
            task.last_error = Some(last_error.to_string());
            task.updated_at = Timestamp::now();
        }
        Ok(())
    }

    async fn mark_task_failed(&self, id: i64, last_error: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = TaskStatus::Failed;
            task.last_error = Some(last_error.to_string());
            task.updated_at = Timestamp::now();
        }
        Ok(())
    }

    async fn defer_task(&self, id: i64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = TaskStatus::Pending;
            task.updated_at = Timestamp::now();
        }
        Ok(())
    }

    async fn count_incomplete_uploads_for_clip(&self, clip_id: Uuid) -> Result<i64, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.clip_id == clip_id && t.task_type == TaskType::UploadClip && t.status != TaskStatus::Completed
            })
            .count() as i64)
    }

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<i64, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.tasks.values().filter(|t| t.status == status).count() as i64)
    }

    async fn delete_completed_tasks_older_than(&self, cutoff: Timestamp) -> Result<i64, Error> {
        let mut state = self.state.lock().unwrap();
        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, t| !(t.status == TaskStatus::Completed && t.updated_at < cutoff));
        Ok((before - state.tasks.len()) as i64)
    }

    async fn get_config(&self, key: &str) -> Result<Option<ConfigValue>, Error> {
        Ok(self.state.lock().unwrap().config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: ConfigValue) -> Result<(), Error> {
        self.state.lock().unwrap().config.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_watermark(&self, camera_name: &str) -> Result<Option<Timestamp>, Error> {
        match self.get_config(&format!("last_processed_segment_{camera_name}")).await? {
            Some(ConfigValue::Int(micros)) => Ok(Some(
                Timestamp::from_microsecond(micros)
                    .map_err(|e| Error::wrap(ErrorKind::Internal, "decoding watermark", e))?,
            )),
            Some(_) => Err(err!(Invariant, "watermark for {camera_name} has wrong type")),
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, camera_name: &str, at: Timestamp) -> Result<(), Error> {
        self.set_config(
            &format!("last_processed_segment_{camera_name}"),
            ConfigValue::Int(at.as_microsecond()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_enforces_active_disk_invariant() {
        let cat = FakeCatalog::new();
        let a = cat.register_disk("/mnt/a", 10).await.unwrap();
        let b = cat.register_disk("/mnt/b", 5).await.unwrap();
        cat.set_active_disk(a).await.unwrap();
        cat.set_active_disk(b).await.unwrap();
        let disks = cat.list_disks().await.unwrap();
        assert_eq!(disks.iter().filter(|d| d.is_active).count(), 1);
    }

    #[tokio::test]
    async fn fake_rejects_duplicate_media() {
        let cat = FakeCatalog::new();
        let disk = cat.register_disk("/mnt/a", 10).await.unwrap();
        let start = Timestamp::from_microsecond(0).unwrap();
        let new = NewMedia {
            id: "a".into(),
            camera_name: "cam1".into(),
            storage_disk_id: disk,
            relative_path: "x".into(),
            start_at: start,
            end_at: start,
            size_bytes: 1,
            kind: MediaKind::Segment,
            source_segment_count: None,
            status: ProcessingStatus::Ready,
        };
        cat.insert_media(new.clone()).await.unwrap();
        assert!(cat.insert_media(new).await.is_err());
    }

    #[tokio::test]
    async fn fake_rejects_ready_to_processing() {
        let cat = FakeCatalog::new();
        let disk = cat.register_disk("/mnt/a", 10).await.unwrap();
        let start = Timestamp::from_microsecond(0).unwrap();
        let new = NewMedia {
            id: "a".into(),
            camera_name: "cam1".into(),
            storage_disk_id: disk,
            relative_path: "x".into(),
            start_at: start,
            end_at: start,
            size_bytes: 1,
            kind: MediaKind::Chunk,
            source_segment_count: Some(1),
            status: ProcessingStatus::Ready,
        };
        cat.insert_media(new).await.unwrap();
        let err = cat.set_media_status("a", ProcessingStatus::Processing).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The `CatalogStore` capability interface: every other component depends
//! on this trait, not on SQL or a concrete database, so tests can inject an
//! in-memory fake (see [`crate::testutil`]).

use async_trait::async_trait;
use base::Error;
use jiff::Timestamp;
use uuid::Uuid;

use crate::model::{
    Clip, ClipStatus, ConfigValue, DiskScanUpdate, LocalArtifact, Media, MediaKind, NewClip,
    NewMedia, NewTask, PendingTask, ProcessingStatus, StorageDisk, TaskStatus,
};

#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    // -- Storage disks (§4.A) -------------------------------------------

    async fn register_disk(&self, path: &str, priority: i64) -> Result<Uuid, Error>;
    async fn list_disks(&self) -> Result<Vec<StorageDisk>, Error>;
    async fn get_disk(&self, id: Uuid) -> Result<Option<StorageDisk>, Error>;
    async fn get_disk_by_path(&self, path: &str) -> Result<Option<StorageDisk>, Error>;
    async fn update_disk_scan(&self, id: Uuid, update: DiskScanUpdate) -> Result<(), Error>;

    /// Atomically clears `is_active` on every disk, then sets it on `id`.
    /// After this returns, at most one disk has `is_active = true`.
    async fn set_active_disk(&self, id: Uuid) -> Result<(), Error>;
    async fn active_disk(&self) -> Result<Option<StorageDisk>, Error>;

    // -- Media: segments and chunks (§4.C, §4.D) -------------------------

    /// Inserts a new segment or chunk row. Fails with `AlreadyExists` if
    /// `(camera_name, start_at, kind)` is already taken (the uniqueness
    /// invariant in the data model).
    async fn insert_media(&self, media: NewMedia) -> Result<(), Error>;

    async fn get_media(&self, id: &str) -> Result<Option<Media>, Error>;

    /// True iff a row with this `(camera, start, kind)` already exists,
    /// used by the chunk coalescer's idempotence check.
    async fn media_exists(
        &self,
        camera_name: &str,
        start_at: Timestamp,
        kind: MediaKind,
    ) -> Result<bool, Error>;

    /// Segments or chunks of `camera_name` whose interval overlaps
    /// `[start, end)`, ordered by `start_at` ascending.
    async fn list_media_overlapping(
        &self,
        camera_name: &str,
        start: Timestamp,
        end: Timestamp,
        kind: Option<MediaKind>,
    ) -> Result<Vec<Media>, Error>;

    async fn count_segments_in_window(
        &self,
        camera_name: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<i64, Error>;

    async fn set_media_status(&self, id: &str, status: ProcessingStatus) -> Result<(), Error>;

    async fn delete_media(&self, id: &str) -> Result<(), Error>;

    /// Ready chunks created before `cutoff`, for retention (§4.C, §8).
    async fn list_ready_chunks_older_than(&self, cutoff: Timestamp) -> Result<Vec<Media>, Error>;

    // -- Clips (§4.E) ------------------------------------------------------

    async fn insert_clip(&self, clip: NewClip) -> Result<(), Error>;
    async fn get_clip(&self, id: Uuid) -> Result<Option<Clip>, Error>;
    async fn set_clip_status(
        &self,
        id: Uuid,
        status: ClipStatus,
        error_message: Option<&str>,
    ) -> Result<(), Error>;
    async fn set_clip_local_artifact(&self, id: Uuid, artifact: LocalArtifact) -> Result<(), Error>;
    async fn set_clip_remote_mp4(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error>;
    async fn set_clip_remote_preview(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error>;
    async fn set_clip_remote_thumbnail(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error>;
    async fn mark_clip_uploaded(&self, id: Uuid, at: Timestamp) -> Result<(), Error>;

    /// Ready clips finished before `cutoff` with all remote URLs populated,
    /// for retention (§4.H).
    async fn list_clips_eligible_for_retention(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<Clip>, Error>;

    // -- Outbound queue (§4.F) ---------------------------------------------

    async fn enqueue_task(&self, task: NewTask) -> Result<i64, Error>;

    /// Atomically claims one task whose `next_retry_at <= now`, in
    /// priority (upload before notify) then FIFO order, transitioning it to
    /// `processing`. Returns `None` if nothing is eligible.
    async fn dequeue_next(&self, now: Timestamp) -> Result<Option<PendingTask>, Error>;

    async fn mark_task_completed(&self, id: i64) -> Result<(), Error>;
    async fn mark_task_retry(
        &self,
        id: i64,
        next_retry_at: Timestamp,
        last_error: &str,
    ) -> Result<(), Error>;
    async fn mark_task_failed(&self, id: i64, last_error: &str) -> Result<(), Error>;

    /// Returns the task back to `pending` without charging an attempt
    /// (the dependency-not-ready path).
    async fn defer_task(&self, id: i64) -> Result<(), Error>;

    /// Count of upload tasks for `clip_id` not yet `completed`, used by the
    /// notify dependency rule.
    async fn count_incomplete_uploads_for_clip(&self, clip_id: Uuid) -> Result<i64, Error>;

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<i64, Error>;

    /// Deletes completed tasks older than `cutoff`; returns the count
    /// removed (§4.F cleanup).
    async fn delete_completed_tasks_older_than(&self, cutoff: Timestamp) -> Result<i64, Error>;

    // -- System configuration (§3, §6) -------------------------------------

    async fn get_config(&self, key: &str) -> Result<Option<ConfigValue>, Error>;
    async fn set_config(&self, key: &str, value: ConfigValue) -> Result<(), Error>;

    /// Per-camera chunk-coalescer watermark; see §4.C.
    async fn get_watermark(&self, camera_name: &str) -> Result<Option<Timestamp>, Error>;
    async fn set_watermark(&self, camera_name: &str, at: Timestamp) -> Result<(), Error>;
}

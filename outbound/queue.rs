// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The Outbound Task Queue (§4.F): durable delivery of clip uploads and
//! booking-API notifications, independent of the rest of the pipeline and
//! gated on connectivity and on a per-clip dependency rule (a notify task
//! can't dispatch until every upload task for its clip has completed and
//! the clip carries remote URLs for all three artifacts).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use base::clock::Clock;
use base::{Error, ErrorKind};
use catalog::model::{Clip, ClipStatus, NewTask, PendingTask, TaskStatus, TaskType};
use catalog::store::CatalogStore;
use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::backoff::backoff_for;
use crate::clients::{NotifyClient, ObjectStoreClient};
use crate::connectivity::{ConnectivityMonitor, Prober};

const DEFAULT_UPLOAD_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_NOTIFY_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_DISPATCH_CONCURRENCY: usize = 3;
const DEFAULT_COMPLETED_RETENTION: SignedDuration = SignedDuration::from_hours(24 * 7);

/// A single clip, as videos/clips are the only kind of video this system
/// produces; recorded here so the notify API always gets an explicit tag.
const NOTIFY_KIND: &str = "recording";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadTaskPayload {
    pub local_path: String,
    pub preview_path: String,
    pub thumbnail_path: String,
}

#[derive(Clone, Debug)]
pub struct Stats {
    pub online: bool,
    pub pending: i64,
    pub active: i64,
    pub processed: i64,
    pub concurrency: usize,
    pub last_processed_at: Option<Timestamp>,
}

/// Dispatches `pending_tasks` rows against the real world. Each task is an
/// independent unit of work: a notify task stuck on its dependency rule
/// never blocks an unrelated upload task from dispatching.
pub struct OutboundQueue<C: CatalogStore, O: ObjectStoreClient, N: NotifyClient, P: Prober> {
    catalog: Arc<C>,
    object_store: Arc<O>,
    notify: Arc<N>,
    connectivity: Arc<ConnectivityMonitor<P>>,
    clock: Arc<dyn Clock>,
    dispatch_semaphore: Arc<Semaphore>,
    concurrency: usize,
    active: AtomicI64,
    processed: AtomicI64,
    last_processed_at: Mutex<Option<Timestamp>>,
}

impl<C: CatalogStore, O: ObjectStoreClient, N: NotifyClient, P: Prober> OutboundQueue<C, O, N, P> {
    pub fn new(
        catalog: Arc<C>,
        object_store: Arc<O>,
        notify: Arc<N>,
        connectivity: Arc<ConnectivityMonitor<P>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        OutboundQueue {
            catalog,
            object_store,
            notify,
            connectivity,
            clock,
            dispatch_semaphore: Arc::new(Semaphore::new(DEFAULT_DISPATCH_CONCURRENCY)),
            concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            active: AtomicI64::new(0),
            processed: AtomicI64::new(0),
            last_processed_at: Mutex::new(None),
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.dispatch_semaphore = Arc::new(Semaphore::new(n));
        self.concurrency = n;
        self
    }

    /// Enqueues an upload task for `clip_id`. The uploader semaphore being
    /// saturated is not this call's concern: it always succeeds as long as
    /// the payload is well-formed, and dispatch is deferred by
    /// [`Self::dispatch_once`].
    pub async fn enqueue_upload(&self, clip_id: Uuid, payload: UploadTaskPayload) -> Result<i64, Error> {
        if payload.local_path.is_empty() {
            return Err(base::err!(InvalidArgument, "upload task payload missing local_path"));
        }
        let now = self.clock.now();
        self.catalog
            .enqueue_task(NewTask {
                task_type: TaskType::UploadClip,
                clip_id,
                payload: serde_json::to_value(&payload)
                    .map_err(|e| Error::wrap(ErrorKind::Invariant, "serializing upload task payload", e))?,
                max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
                next_retry_at: now,
            })
            .await
    }

    /// Enqueues a notify task for `clip_id`. The payload is an audit trail
    /// only: the actual call parameters are read from the clip row at
    /// dispatch time, once the dependency rule clears it.
    pub async fn enqueue_notify(&self, clip_id: Uuid, booking_id: &str) -> Result<i64, Error> {
        if booking_id.is_empty() {
            return Err(base::err!(InvalidArgument, "notify task payload missing booking_id"));
        }
        let now = self.clock.now();
        self.catalog
            .enqueue_task(NewTask {
                task_type: TaskType::NotifyApi,
                clip_id,
                payload: serde_json::json!({ "booking_id": booking_id }),
                max_attempts: DEFAULT_NOTIFY_MAX_ATTEMPTS,
                next_retry_at: now,
            })
            .await
    }

    pub async fn stats(&self) -> Result<Stats, Error> {
        let pending = self.catalog.count_tasks_by_status(TaskStatus::Pending).await?;
        Ok(Stats {
            online: self.connectivity.is_online(),
            pending,
            active: self.active.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            concurrency: self.concurrency,
            last_processed_at: *self.last_processed_at.lock().unwrap(),
        })
    }

    /// Deletes completed tasks older than the retention window (default 7
    /// days), keeping the table from growing unbounded.
    pub async fn cleanup_completed(&self) -> Result<i64, Error> {
        let cutoff = self.clock.now() - DEFAULT_COMPLETED_RETENTION;
        self.catalog.delete_completed_tasks_older_than(cutoff).await
    }

    /// Claims and dispatches as many eligible tasks as the concurrency cap
    /// allows, returning the number claimed. A no-op while connectivity is
    /// down: the tasks stay `pending` for the next call.
    pub async fn dispatch_once(self: &Arc<Self>) -> Result<usize, Error> {
        if !self.connectivity.is_online() {
            tracing::debug!("connectivity offline, deferring outbound dispatch");
            return Ok(0);
        }
        let now = self.clock.now();
        let mut dispatched = 0;
        loop {
            let permit = match self.dispatch_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let task = match self.catalog.dequeue_next(now).await? {
                Some(task) => task,
                None => break,
            };
            dispatched += 1;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.active.fetch_add(1, Ordering::SeqCst);
                this.run_task(task).await;
                this.active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
        Ok(dispatched)
    }

    async fn run_task(&self, task: PendingTask) {
        let result = match task.task_type {
            TaskType::UploadClip => self.run_upload(&task).await,
            TaskType::NotifyApi => self.run_notify(&task).await,
        };
        match result {
            Ok(true) => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                *self.last_processed_at.lock().unwrap() = Some(self.clock.now());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(task_id = task.id, task_type = ?task.task_type, error = %e, "outbound task failed");
                if let Err(e) = self.fail_or_retry(&task, &e).await {
                    tracing::error!(task_id = task.id, error = %e, "failed to record outbound task failure");
                }
            }
        }
    }

    /// `Ok(true)` on completion, `Ok(false)` on a deferral that isn't a
    /// failure (dependency not ready yet).
    async fn run_upload(&self, task: &PendingTask) -> Result<bool, Error> {
        let clip = self.require_clip(task).await?;
        let clip = match clip {
            Some(clip) => clip,
            None => return Ok(false),
        };
        if clip.status == ClipStatus::Failed {
            self.catalog.mark_task_failed(task.id, "clip extraction failed").await?;
            return Ok(false);
        }

        let payload: UploadTaskPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| Error::wrap(ErrorKind::Invariant, "decoding upload task payload", e))?;

        let prefix = format!("clips/{}", clip.id);
        self.upload_if_present(clip.id, &payload.local_path, &format!("{prefix}/video.mp4"), ArtifactKind::Mp4)
            .await?;
        self.upload_if_present(clip.id, &payload.preview_path, &format!("{prefix}/preview.mp4"), ArtifactKind::Preview)
            .await?;
        self.upload_if_present(
            clip.id,
            &payload.thumbnail_path,
            &format!("{prefix}/thumbnail.jpg"),
            ArtifactKind::Thumbnail,
        )
        .await?;

        self.catalog.mark_clip_uploaded(clip.id, self.clock.now()).await?;
        self.catalog.mark_task_completed(task.id).await?;
        Ok(true)
    }

    async fn upload_if_present(&self, clip_id: Uuid, local_path: &str, remote_key: &str, kind: ArtifactKind) -> Result<(), Error> {
        if tokio::fs::metadata(local_path).await.is_err() {
            tracing::debug!(clip_id = %clip_id, path = local_path, ?kind, "artifact absent, skipping upload");
            return Ok(());
        }
        let url = self.object_store.put_file(std::path::Path::new(local_path), remote_key).await?;
        match kind {
            ArtifactKind::Mp4 => self.catalog.set_clip_remote_mp4(clip_id, remote_key, &url).await,
            ArtifactKind::Preview => self.catalog.set_clip_remote_preview(clip_id, remote_key, &url).await,
            ArtifactKind::Thumbnail => self.catalog.set_clip_remote_thumbnail(clip_id, remote_key, &url).await,
        }
    }

    async fn run_notify(&self, task: &PendingTask) -> Result<bool, Error> {
        let clip = self.require_clip(task).await?;
        let clip = match clip {
            Some(clip) => clip,
            None => return Ok(false),
        };
        if clip.status == ClipStatus::Failed {
            self.catalog.mark_task_failed(task.id, "clip extraction failed").await?;
            return Ok(false);
        }

        let incomplete_uploads = self.catalog.count_incomplete_uploads_for_clip(clip.id).await?;
        if incomplete_uploads > 0 || !clip.remote.is_complete() {
            self.catalog.defer_task(task.id).await?;
            return Ok(false);
        }

        let duration_secs = clip.duration_ms.map(|ms| ms as f64 / 1000.0).unwrap_or(0.0);
        self.notify
            .save_video_available(
                &clip.booking_id,
                NOTIFY_KIND,
                clip.remote.preview_url.as_deref().unwrap_or_default(),
                clip.remote.thumbnail_url.as_deref().unwrap_or_default(),
                &clip.id.to_string(),
                clip.requested_start_at,
                clip.requested_end_at,
                duration_secs,
            )
            .await?;

        self.catalog.mark_task_completed(task.id).await?;
        Ok(true)
    }

    async fn require_clip(&self, task: &PendingTask) -> Result<Option<Clip>, Error> {
        match self.catalog.get_clip(task.clip_id).await? {
            Some(clip) => Ok(Some(clip)),
            None => {
                self.catalog.mark_task_failed(task.id, "clip row no longer exists").await?;
                Ok(None)
            }
        }
    }

    async fn fail_or_retry(&self, task: &PendingTask, err: &Error) -> Result<(), Error> {
        let next_attempt = task.attempts + 1;
        if next_attempt >= task.max_attempts {
            self.catalog.mark_task_failed(task.id, &err.to_string()).await
        } else {
            let next_retry_at = self.clock.now() + backoff_for(next_attempt);
            self.catalog.mark_task_retry(task.id, next_retry_at, &err.to_string()).await
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ArtifactKind {
    Mp4,
    Preview,
    Thumbnail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base::clock::SimulatedClock;
    use catalog::model::{NewClip, RemoteArtifacts};
    use catalog::testutil::FakeCatalog;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(secs).unwrap()
    }

    struct AlwaysOnline;
    #[async_trait]
    impl Prober for AlwaysOnline {
        async fn probe(&self) -> bool {
            true
        }
    }

    async fn online_monitor() -> Arc<ConnectivityMonitor<AlwaysOnline>> {
        let monitor = Arc::new(ConnectivityMonitor::new(AlwaysOnline));
        monitor.probe_once().await;
        monitor
    }

    struct FakeObjectStore {
        puts: StdMutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl FakeObjectStore {
        fn new() -> Self {
            FakeObjectStore { puts: StdMutex::new(Vec::new()), fail: false }
        }
        fn failing() -> Self {
            FakeObjectStore { puts: StdMutex::new(Vec::new()), fail: true }
        }
    }

    #[async_trait]
    impl ObjectStoreClient for FakeObjectStore {
        async fn put_file(&self, local: &Path, remote_key: &str) -> Result<String, Error> {
            if self.fail {
                return Err(base::err!(Transient, "simulated upload failure"));
            }
            self.puts.lock().unwrap().push((local.to_string_lossy().into_owned(), remote_key.to_string()));
            Ok(format!("https://cdn.example/{remote_key}"))
        }
        async fn put_directory(&self, _local: &Path, _remote_prefix: &str) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }
        async fn list_prefix(&self, _prefix: &str) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }
        async fn delete_key(&self, _key: &str) -> Result<(), Error> {
            Ok(())
        }
        fn base_url(&self) -> &str {
            "https://cdn.example"
        }
    }

    struct FakeNotify {
        calls: StdMutex<usize>,
    }

    impl FakeNotify {
        fn new() -> Self {
            FakeNotify { calls: StdMutex::new(0) }
        }
    }

    #[async_trait]
    impl NotifyClient for FakeNotify {
        async fn save_video_available(
            &self,
            _booking_id: &str,
            _kind: &str,
            _preview_url: &str,
            _thumbnail_url: &str,
            _unique_id: &str,
            _start: Timestamp,
            _end: Timestamp,
            _duration_secs: f64,
        ) -> Result<(), Error> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    async fn seed_clip(catalog: &FakeCatalog, camera: &str) -> Uuid {
        let id = Uuid::new_v4();
        catalog
            .insert_clip(NewClip {
                id,
                booking_id: "booking-1".into(),
                camera_name: camera.into(),
                requested_start_at: ts(0),
                requested_end_at: ts(60),
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn upload_task_sets_remote_urls_and_marks_clip_uploaded() {
        let catalog = Arc::new(FakeCatalog::new());
        let clip_id = seed_clip(&catalog, "cam1").await;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("video.mp4");
        tokio::fs::write(&local, b"data").await.unwrap();

        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let queue = Arc::new(OutboundQueue::new(
            catalog.clone(),
            Arc::new(FakeObjectStore::new()),
            Arc::new(FakeNotify::new()),
            online_monitor().await,
            clock,
        ));
        queue
            .enqueue_upload(
                clip_id,
                UploadTaskPayload {
                    local_path: local.to_string_lossy().into_owned(),
                    preview_path: dir.path().join("preview.mp4").to_string_lossy().into_owned(),
                    thumbnail_path: dir.path().join("thumb.jpg").to_string_lossy().into_owned(),
                },
            )
            .await
            .unwrap();

        let dispatched = queue.dispatch_once().await.unwrap();
        assert_eq!(dispatched, 1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let clip = catalog.get_clip(clip_id).await.unwrap().unwrap();
        assert!(clip.remote.mp4_url.is_some());
        assert!(clip.uploaded_at.is_some());
        assert_eq!(catalog.count_tasks_by_status(TaskStatus::Completed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn notify_task_defers_without_charging_attempt_until_uploads_complete() {
        let catalog = Arc::new(FakeCatalog::new());
        let clip_id = seed_clip(&catalog, "cam1").await;
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let queue = Arc::new(OutboundQueue::new(
            catalog.clone(),
            Arc::new(FakeObjectStore::new()),
            Arc::new(FakeNotify::new()),
            online_monitor().await,
            clock,
        ));
        queue.enqueue_notify(clip_id, "booking-1").await.unwrap();
        // No upload has completed and no remote URLs are set, so the
        // dependency rule defers the notify without charging an attempt.
        queue.dispatch_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let tasks_pending = catalog.count_tasks_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(tasks_pending, 1);
    }

    #[tokio::test]
    async fn notify_task_dispatches_once_remote_urls_are_complete() {
        let catalog = Arc::new(FakeCatalog::new());
        let clip_id = seed_clip(&catalog, "cam1").await;
        catalog.set_clip_remote_mp4(clip_id, "k1", "https://cdn/k1").await.unwrap();
        catalog.set_clip_remote_preview(clip_id, "k2", "https://cdn/k2").await.unwrap();
        catalog.set_clip_remote_thumbnail(clip_id, "k3", "https://cdn/k3").await.unwrap();
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let notify = Arc::new(FakeNotify::new());
        let queue = Arc::new(OutboundQueue::new(
            catalog.clone(),
            Arc::new(FakeObjectStore::new()),
            notify.clone(),
            online_monitor().await,
            clock,
        ));
        queue.enqueue_notify(clip_id, "booking-1").await.unwrap();
        queue.dispatch_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*notify.calls.lock().unwrap(), 1);
        assert_eq!(catalog.count_tasks_by_status(TaskStatus::Completed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_upload_schedules_a_backoff_retry_without_exhausting_attempts() {
        let catalog = Arc::new(FakeCatalog::new());
        let clip_id = seed_clip(&catalog, "cam1").await;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("video.mp4");
        tokio::fs::write(&local, b"data").await.unwrap();
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let queue = Arc::new(OutboundQueue::new(
            catalog.clone(),
            Arc::new(FakeObjectStore::failing()),
            Arc::new(FakeNotify::new()),
            online_monitor().await,
            clock,
        ));
        queue
            .enqueue_upload(
                clip_id,
                UploadTaskPayload {
                    local_path: local.to_string_lossy().into_owned(),
                    preview_path: String::new(),
                    thumbnail_path: String::new(),
                },
            )
            .await
            .unwrap();
        queue.dispatch_once().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(catalog.count_tasks_by_status(TaskStatus::Pending).await.unwrap(), 1);
        assert_eq!(catalog.count_tasks_by_status(TaskStatus::Failed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_connectivity_skips_dispatch_entirely() {
        let catalog = Arc::new(FakeCatalog::new());
        let clip_id = seed_clip(&catalog, "cam1").await;
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let offline_monitor = Arc::new(ConnectivityMonitor::new(AlwaysOnline));
        // Never probed, so it starts (and stays) offline.
        let queue = Arc::new(OutboundQueue::new(
            catalog.clone(),
            Arc::new(FakeObjectStore::new()),
            Arc::new(FakeNotify::new()),
            offline_monitor,
            clock,
        ));
        queue.enqueue_notify(clip_id, "booking-1").await.unwrap();
        let dispatched = queue.dispatch_once().await.unwrap();
        assert_eq!(dispatched, 0);
    }
}

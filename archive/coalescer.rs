// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The chunk coalescer: merges a camera's recent raw segments into one
//! 10-15 minute chunk per window via stream-copy concatenation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use base::clock::Clock;
use base::Error;
use catalog::model::{ChunkProcessingConfig, MediaKind, NewMedia, ProcessingStatus};
use catalog::store::CatalogStore;
use jiff::{SignedDuration, Timestamp};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::ffmpeg::FfmpegRunner;
use crate::filenames;

const DEFAULT_BUILD_CONCURRENCY: usize = 2;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoalesceOutcome {
    /// A new chunk was built and recorded.
    Built { chunk_id: String },
    /// The chunk for this window already existed; watermark advanced.
    AlreadyExists { chunk_id: String },
    /// Fewer than `MinSegmentsForChunk` segments are present; watermark
    /// left untouched so the next tick retries.
    NotEnoughSegments,
    /// The window isn't past `last_processed(camera)` yet.
    NotDue,
    /// Another build for this camera is already running.
    InFlight,
    /// The build ran and failed; the failure is recorded in the catalog.
    Failed { chunk_id: String, error: String },
}

pub struct ChunkCoalescer<C: CatalogStore> {
    catalog: Arc<C>,
    clock: Arc<dyn Clock>,
    ffmpeg: FfmpegRunner,
    build_semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    camera: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.camera);
    }
}

impl<C: CatalogStore> ChunkCoalescer<C> {
    pub fn new(catalog: Arc<C>, clock: Arc<dyn Clock>, ffmpeg: FfmpegRunner) -> Self {
        ChunkCoalescer {
            catalog,
            clock,
            ffmpeg,
            build_semaphore: Arc::new(Semaphore::new(DEFAULT_BUILD_CONCURRENCY)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Reads the live `chunk_processing` tunable (§6), falling back to
    /// [`ChunkProcessingConfig::default`] when unset.
    async fn config(&self) -> Result<ChunkProcessingConfig, Error> {
        ChunkProcessingConfig::from_config_value(
            self.catalog.get_config(ChunkProcessingConfig::CONFIG_KEY).await?,
        )
    }

    fn window_end(now: Timestamp, chunk_duration: SignedDuration) -> Timestamp {
        let secs = now.as_second();
        let d = chunk_duration.as_secs();
        Timestamp::from_second(secs - secs.rem_euclid(d)).expect("aligned timestamp in range")
    }

    /// Runs one coalescer tick for `camera`, whose active disk root is
    /// `disk_root`.
    pub async fn run_once(&self, camera: &str, disk_id: Uuid, disk_root: &Path) -> Result<CoalesceOutcome, Error> {
        let config = self.config().await?;
        if !config.enabled {
            return Ok(CoalesceOutcome::NotDue);
        }
        let chunk_duration = SignedDuration::from_mins(config.chunk_duration_minutes);
        let now = self.clock.now();
        let window_end = Self::window_end(now, chunk_duration);
        let window_start = window_end - chunk_duration;

        if let Some(watermark) = self.catalog.get_watermark(camera).await? {
            if watermark >= window_end {
                return Ok(CoalesceOutcome::NotDue);
            }
        }

        let chunk_id = filenames::chunk_id(camera, window_start);

        if self.catalog.media_exists(camera, window_start, MediaKind::Chunk).await? {
            self.catalog.set_watermark(camera, window_end).await?;
            return Ok(CoalesceOutcome::AlreadyExists { chunk_id });
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(camera.to_string()) {
                return Ok(CoalesceOutcome::InFlight);
            }
        }
        let _guard = InFlightGuard { set: &self.in_flight, camera: camera.to_string() };

        let _permit = self
            .build_semaphore
            .acquire()
            .await
            .expect("build semaphore is never closed");

        let segment_count = self
            .catalog
            .count_segments_in_window(camera, window_start, window_end)
            .await?;
        if segment_count < config.min_segments_for_chunk {
            return Ok(CoalesceOutcome::NotEnoughSegments);
        }

        let segments = self
            .catalog
            .list_media_overlapping(camera, window_start, window_end, Some(MediaKind::Segment))
            .await?;
        let inputs: Vec<_> = segments.iter().map(|s| disk_root.join(&s.relative_path)).collect();

        let chunks_dir = disk_root.join("recordings").join(camera).join("chunks");
        tokio::fs::create_dir_all(&chunks_dir)
            .await
            .map_err(|e| Error::wrap(base::ErrorKind::Transient, "creating chunks dir", e))?;
        let chunk_path = chunks_dir.join(filenames::chunk_filename(camera, window_start));
        let relative_path = chunk_path
            .strip_prefix(disk_root)
            .unwrap_or(&chunk_path)
            .to_string_lossy()
            .into_owned();

        let build_result = self.ffmpeg.concat(&inputs, &chunk_path).await;

        let outcome = match build_result {
            Ok(()) => {
                let size_bytes = tokio::fs::metadata(&chunk_path)
                    .await
                    .map(|m| m.len() as i64)
                    .unwrap_or(0);
                self.catalog
                    .insert_media(NewMedia {
                        id: chunk_id.clone(),
                        camera_name: camera.to_string(),
                        storage_disk_id: disk_id,
                        relative_path,
                        start_at: window_start,
                        end_at: window_end,
                        size_bytes,
                        kind: MediaKind::Chunk,
                        source_segment_count: Some(segment_count),
                        status: ProcessingStatus::Ready,
                    })
                    .await?;
                CoalesceOutcome::Built { chunk_id: chunk_id.clone() }
            }
            Err(e) => {
                self.catalog
                    .insert_media(NewMedia {
                        id: chunk_id.clone(),
                        camera_name: camera.to_string(),
                        storage_disk_id: disk_id,
                        relative_path,
                        start_at: window_start,
                        end_at: window_end,
                        size_bytes: 0,
                        kind: MediaKind::Chunk,
                        source_segment_count: Some(segment_count),
                        status: ProcessingStatus::Failed,
                    })
                    .await?;
                CoalesceOutcome::Failed { chunk_id: chunk_id.clone(), error: e.to_string() }
            }
        };

        self.catalog.set_watermark(camera, window_end).await?;
        Ok(outcome)
    }

    /// Deletes ready chunks older than the live `chunk_processing.
    /// retention_days` tunable (§4.C cleanup for chunks, distinct from clip
    /// retention): file first, then catalog row; warns and continues on
    /// individual failures.
    pub async fn clean_up_aged_chunks(&self, disk_root: &Path) -> Result<usize, Error> {
        let config = self.config().await?;
        let retention = SignedDuration::from_hours(config.retention_days * 24);
        let cutoff = self.clock.now() - retention;
        let chunks = self.catalog.list_ready_chunks_older_than(cutoff).await?;
        let mut removed = 0;
        for chunk in chunks {
            let path = disk_root.join(&chunk.relative_path);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(chunk_id = %chunk.id, error = %e, "failed to delete aged chunk file");
                    continue;
                }
            }
            if let Err(e) = self.catalog.delete_media(&chunk.id).await {
                tracing::warn!(chunk_id = %chunk.id, error = %e, "failed to delete aged chunk row");
                continue;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::{SimulatedClock, SystemClock};
    use catalog::model::{ConfigValue, NewMedia as NM};
    use catalog::testutil::FakeCatalog;
    use tempfile::TempDir;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(secs).unwrap()
    }

    async fn seed_segments(catalog: &FakeCatalog, disk: Uuid, camera: &str, window_start: i64, count: i64) {
        for i in 0..count {
            let start = window_start + i * 4;
            catalog
                .insert_media(NM {
                    id: format!("seg_{start}"),
                    camera_name: camera.to_string(),
                    storage_disk_id: disk,
                    relative_path: format!("recordings/{camera}/hls/segment_{start}.ts"),
                    start_at: ts(start),
                    end_at: ts(start + 4),
                    size_bytes: 100,
                    kind: MediaKind::Segment,
                    source_segment_count: None,
                    status: ProcessingStatus::Ready,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn skips_window_with_too_few_segments_without_advancing_watermark() {
        let catalog = Arc::new(FakeCatalog::new());
        let disk = catalog.register_disk("/data", 10).await.unwrap();
        let scratch = TempDir::new().unwrap();
        tokio::fs::create_dir_all(scratch.path().join("recordings/cam1/hls")).await.unwrap();
        seed_segments(&catalog, disk, "cam1", 0, 9);
        let clock = Arc::new(SimulatedClock::new(ts(600)));
        let coalescer = ChunkCoalescer::new(catalog.clone(), clock, FfmpegRunner::new("true"));
        let outcome = coalescer.run_once("cam1", disk, scratch.path()).await.unwrap();
        assert_eq!(outcome, CoalesceOutcome::NotEnoughSegments);
        assert!(catalog.get_watermark("cam1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn not_due_when_watermark_already_covers_window() {
        let catalog = Arc::new(FakeCatalog::new());
        let disk = catalog.register_disk("/data", 10).await.unwrap();
        catalog.set_watermark("cam1", ts(600)).await.unwrap();
        let clock = Arc::new(SimulatedClock::new(ts(650)));
        let coalescer = ChunkCoalescer::new(catalog, clock, FfmpegRunner::new("true"));
        let scratch = TempDir::new().unwrap();
        let outcome = coalescer.run_once("cam1", disk, scratch.path()).await.unwrap();
        assert_eq!(outcome, CoalesceOutcome::NotDue);
    }

    #[tokio::test]
    async fn skipping_already_existing_chunk_still_advances_watermark() {
        let catalog = Arc::new(FakeCatalog::new());
        let disk = catalog.register_disk("/data", 10).await.unwrap();
        catalog
            .insert_media(NM {
                id: filenames::chunk_id("cam1", ts(0)),
                camera_name: "cam1".into(),
                storage_disk_id: disk,
                relative_path: "recordings/cam1/chunks/x.ts".into(),
                start_at: ts(0),
                end_at: ts(600),
                size_bytes: 1,
                kind: MediaKind::Chunk,
                source_segment_count: Some(10),
                status: ProcessingStatus::Ready,
            })
            .await
            .unwrap();
        let clock = Arc::new(SimulatedClock::new(ts(600)));
        let coalescer = ChunkCoalescer::new(catalog.clone(), clock, FfmpegRunner::new("true"));
        let scratch = TempDir::new().unwrap();
        let outcome = coalescer.run_once("cam1", disk, scratch.path()).await.unwrap();
        assert!(matches!(outcome, CoalesceOutcome::AlreadyExists { .. }));
        assert_eq!(catalog.get_watermark("cam1").await.unwrap(), Some(ts(600)));
    }

    #[tokio::test]
    async fn disabled_via_live_chunk_processing_config_skips_tick() {
        let catalog = Arc::new(FakeCatalog::new());
        let disk = catalog.register_disk("/data", 10).await.unwrap();
        let scratch = TempDir::new().unwrap();
        tokio::fs::create_dir_all(scratch.path().join("recordings/cam1/hls")).await.unwrap();
        seed_segments(&catalog, disk, "cam1", 0, 20);
        catalog
            .set_config(
                ChunkProcessingConfig::CONFIG_KEY,
                ConfigValue::Json(
                    serde_json::to_value(ChunkProcessingConfig { enabled: false, ..ChunkProcessingConfig::default() }).unwrap(),
                ),
            )
            .await
            .unwrap();
        let clock = Arc::new(SimulatedClock::new(ts(600)));
        let coalescer = ChunkCoalescer::new(catalog, clock, FfmpegRunner::new("true"));
        let outcome = coalescer.run_once("cam1", disk, scratch.path()).await.unwrap();
        assert_eq!(outcome, CoalesceOutcome::NotDue);
    }

    #[tokio::test]
    async fn clean_up_aged_chunks_uses_default_retention_when_unconfigured() {
        let catalog = Arc::new(FakeCatalog::new());
        let disk = catalog.register_disk("/data", 10).await.unwrap();
        let scratch = TempDir::new().unwrap();
        let chunk_path = scratch.path().join("chunk.ts");
        tokio::fs::write(&chunk_path, b"x").await.unwrap();
        catalog
            .insert_media(NM {
                id: "cam1_chunk".into(),
                camera_name: "cam1".into(),
                storage_disk_id: disk,
                relative_path: "chunk.ts".into(),
                start_at: ts(0),
                end_at: ts(600),
                size_bytes: 1,
                kind: MediaKind::Chunk,
                source_segment_count: Some(10),
                status: ProcessingStatus::Ready,
            })
            .await
            .unwrap();
        // The default 7-day retention_days shouldn't remove a chunk created
        // moments ago.
        let coalescer = ChunkCoalescer::new(catalog.clone(), Arc::new(SystemClock), FfmpegRunner::new("true"));
        let removed = coalescer.clean_up_aged_chunks(scratch.path()).await.unwrap();
        assert_eq!(removed, 0);
        assert!(catalog.get_media("cam1_chunk").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clean_up_aged_chunks_honors_live_retention_days_override() {
        let catalog = Arc::new(FakeCatalog::new());
        let disk = catalog.register_disk("/data", 10).await.unwrap();
        let scratch = TempDir::new().unwrap();
        let chunk_path = scratch.path().join("chunk.ts");
        tokio::fs::write(&chunk_path, b"x").await.unwrap();
        catalog
            .insert_media(NM {
                id: "cam1_chunk".into(),
                camera_name: "cam1".into(),
                storage_disk_id: disk,
                relative_path: "chunk.ts".into(),
                start_at: ts(0),
                end_at: ts(600),
                size_bytes: 1,
                kind: MediaKind::Chunk,
                source_segment_count: Some(10),
                status: ProcessingStatus::Ready,
            })
            .await
            .unwrap();
        catalog
            .set_config(
                ChunkProcessingConfig::CONFIG_KEY,
                ConfigValue::Json(
                    serde_json::to_value(ChunkProcessingConfig { retention_days: 0, ..ChunkProcessingConfig::default() }).unwrap(),
                ),
            )
            .await
            .unwrap();
        // A zero-day override means "anything created before this instant",
        // which the chunk inserted just above satisfies.
        let coalescer = ChunkCoalescer::new(catalog.clone(), Arc::new(SystemClock), FfmpegRunner::new("true"));
        let removed = coalescer.clean_up_aged_chunks(scratch.path()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(catalog.get_media("cam1_chunk").await.unwrap().is_none());
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The clip extractor: turns discovery output into a finished, optionally
//! watermarked, clip plus preview and thumbnail, and hands the result to the
//! outbound queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::clock::Clock;
use base::{Error, ErrorKind};
use catalog::model::{LocalArtifact, NewTask, TaskType};
use catalog::store::CatalogStore;
use jiff::{SignedDuration, Timestamp};
use uuid::Uuid;

use crate::discovery::{Discovery, SourceKind};
use crate::ffmpeg::{ExternalTransforms, FfmpegRunner};
use crate::intervals::preview_intervals;

/// Single-source fast path applies when discovery returns exactly one
/// chunk and it covers the requested range within this tolerance.
const COVERAGE_TOLERANCE: SignedDuration = SignedDuration::from_secs(30);

const DEFAULT_UPLOAD_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_NOTIFY_MAX_ATTEMPTS: i32 = 3;

pub struct ClipExtractor<C: CatalogStore, T: ExternalTransforms> {
    catalog: Arc<C>,
    discovery: Discovery<C>,
    ffmpeg: FfmpegRunner,
    transforms: Arc<T>,
    clock: Arc<dyn Clock>,
    watermark_enabled: bool,
}

impl<C: CatalogStore, T: ExternalTransforms> ClipExtractor<C, T> {
    pub fn new(catalog: Arc<C>, ffmpeg: FfmpegRunner, transforms: Arc<T>, clock: Arc<dyn Clock>) -> Self {
        ClipExtractor {
            discovery: Discovery::new(catalog.clone()),
            catalog,
            ffmpeg,
            transforms,
            clock,
            watermark_enabled: true,
        }
    }

    pub fn with_watermark_enabled(mut self, enabled: bool) -> Self {
        self.watermark_enabled = enabled;
        self
    }

    /// Runs extraction for a clip already recorded in the catalog with
    /// status `initial`. Infrastructure failures (catalog I/O) propagate;
    /// everything else is reflected as `clip.status = failed` and this
    /// returns `Ok(())`, matching the "extraction does not retry
    /// internally" propagation policy.
    pub async fn extract(
        &self,
        clip_id: Uuid,
        output_disk_id: Uuid,
        output_root: &Path,
    ) -> Result<(), Error> {
        let clip = self
            .catalog
            .get_clip(clip_id)
            .await?
            .ok_or_else(|| base::err!(NotFound, "no such clip {clip_id}"))?;
        self.catalog.set_clip_status(clip_id, catalog::model::ClipStatus::Processing, None).await?;

        let work = self.assemble(&clip.camera_name, clip.requested_start_at, clip.requested_end_at, output_root).await;

        let raw_path = match work {
            Ok(p) => p,
            Err(e) => {
                self.catalog
                    .set_clip_status(clip_id, catalog::model::ClipStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(());
            }
        };

        let clip_dir = output_root.join("clips").join(clip_id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&clip_dir).await {
            self.catalog
                .set_clip_status(clip_id, catalog::model::ClipStatus::Failed, Some(&e.to_string()))
                .await?;
            return Ok(());
        }
        let final_path = clip_dir.join("clip.mp4");

        let watermark_result = if self.watermark_enabled {
            self.transforms.apply_watermark(&raw_path, &final_path).await
        } else {
            Err(base::err!(Internal, "watermarking disabled"))
        };
        match watermark_result {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&raw_path).await;
            }
            Err(e) if self.watermark_enabled => {
                tracing::warn!(clip_id = %clip_id, error = %e, "watermarking failed, using un-watermarked extract");
                if let Err(e) = tokio::fs::rename(&raw_path, &final_path).await {
                    self.catalog
                        .set_clip_status(clip_id, catalog::model::ClipStatus::Failed, Some(&e.to_string()))
                        .await?;
                    return Ok(());
                }
            }
            Err(_) => {
                if let Err(e) = tokio::fs::rename(&raw_path, &final_path).await {
                    self.catalog
                        .set_clip_status(clip_id, catalog::model::ClipStatus::Failed, Some(&e.to_string()))
                        .await?;
                    return Ok(());
                }
            }
        }

        let size_bytes = tokio::fs::metadata(&final_path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        let duration = clip.requested_end_at - clip.requested_start_at;
        let duration_ms = (duration.as_secs_f64() * 1000.0).round() as i64;

        self.catalog
            .set_clip_local_artifact(
                clip_id,
                LocalArtifact {
                    local_path: final_path.to_string_lossy().into_owned(),
                    storage_disk_id: output_disk_id,
                    size_bytes,
                    duration_ms,
                },
            )
            .await?;

        let preview_path = clip_dir.join("preview.mp4");
        let thumbnail_path = clip_dir.join("thumbnail.jpg");
        let intervals = preview_intervals(duration);
        if let Err(e) = self.transforms.generate_preview(&final_path, &intervals, &preview_path).await {
            tracing::warn!(clip_id = %clip_id, error = %e, "preview generation failed");
        }
        if let Err(e) = self.transforms.generate_thumbnail(&final_path, SignedDuration::ZERO, &thumbnail_path).await {
            tracing::warn!(clip_id = %clip_id, error = %e, "thumbnail generation failed");
        }

        self.catalog.set_clip_status(clip_id, catalog::model::ClipStatus::Ready, None).await?;

        let now = self.clock.now();
        let upload_task = NewTask {
            task_type: TaskType::UploadClip,
            clip_id,
            payload: serde_json::json!({
                "local_path": final_path.to_string_lossy(),
                "preview_path": preview_path.to_string_lossy(),
                "thumbnail_path": thumbnail_path.to_string_lossy(),
            }),
            max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
            next_retry_at: now,
        };
        self.catalog.enqueue_task(upload_task).await?;

        let notify_task = NewTask {
            task_type: TaskType::NotifyApi,
            clip_id,
            payload: serde_json::json!({
                "booking_id": clip.booking_id,
                "camera_name": clip.camera_name,
                "start_at": clip.requested_start_at.to_string(),
                "end_at": clip.requested_end_at.to_string(),
                "duration_ms": duration_ms,
            }),
            max_attempts: DEFAULT_NOTIFY_MAX_ATTEMPTS,
            next_retry_at: now,
        };
        self.catalog.enqueue_task(notify_task).await?;

        Ok(())
    }

    /// Builds the un-watermarked clip file for `[t1, t2)` and returns its
    /// path, choosing the single-source fast path when possible.
    async fn assemble(&self, camera: &str, t1: Timestamp, t2: Timestamp, output_root: &Path) -> Result<PathBuf, Error> {
        let sources = self.discovery.discover(camera, t1, t2).await?;
        if sources.is_empty() {
            return Err(base::err!(Integrity, "no sources cover [{t1}, {t2}) for {camera}"));
        }

        let work_dir = output_root.join("recordings").join(camera).join("tmp").join("hybrid");
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "creating working directory", e))?;

        if sources.len() == 1 && sources[0].kind == SourceKind::Chunk {
            let source = &sources[0];
            if source.start <= t1 + COVERAGE_TOLERANCE && source.end + COVERAGE_TOLERANCE >= t2 {
                let offset = t1 - source.start;
                let duration = t2 - t1;
                let out = work_dir.join(format!("{}_{}.ts", camera, t1.as_second()));
                self.ffmpeg.extract(&source.absolute_path, offset, duration, &out).await?;
                return Ok(out);
            }
        }

        let mut pieces = Vec::with_capacity(sources.len());
        let mut temp_files = Vec::new();
        for source in &sources {
            match source.kind {
                SourceKind::Segment => pieces.push(source.absolute_path.clone()),
                SourceKind::Chunk => {
                    let overlap_start = source.start.max(t1);
                    let overlap_end = source.end.min(t2);
                    let offset = overlap_start - source.start;
                    let duration = overlap_end - overlap_start;
                    let out = work_dir.join(format!("{}_{}_{}.ts", camera, source.id, overlap_start.as_second()));
                    self.ffmpeg.extract(&source.absolute_path, offset, duration, &out).await?;
                    pieces.push(out.clone());
                    temp_files.push(out);
                }
            }
        }

        let out = work_dir.join(format!("{}_{}_concat.ts", camera, t1.as_second()));
        self.ffmpeg.concat(&pieces, &out).await?;
        for temp in &temp_files {
            let _ = tokio::fs::remove_file(temp).await;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base::clock::SimulatedClock;
    use catalog::model::{ClipStatus, NewClip, NewMedia, MediaKind, ProcessingStatus};
    use catalog::testutil::FakeCatalog;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct FakeTransforms {
        watermark_fails: bool,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl FakeTransforms {
        fn new(watermark_fails: bool) -> Self {
            FakeTransforms { watermark_fails, calls: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ExternalTransforms for FakeTransforms {
        async fn apply_watermark(&self, input: &Path, output: &Path) -> Result<(), Error> {
            self.calls.lock().unwrap().push("watermark");
            if self.watermark_fails {
                return Err(base::err!(Transient, "watermark tool unavailable"));
            }
            tokio::fs::copy(input, output)
                .await
                .map_err(|e| Error::wrap(ErrorKind::Transient, "copy", e))?;
            Ok(())
        }

        async fn generate_preview(&self, _input: &Path, _intervals: &[(SignedDuration, SignedDuration)], output: &Path) -> Result<(), Error> {
            self.calls.lock().unwrap().push("preview");
            tokio::fs::write(output, b"preview").await.ok();
            Ok(())
        }

        async fn generate_thumbnail(&self, _input: &Path, _at: SignedDuration, output: &Path) -> Result<(), Error> {
            self.calls.lock().unwrap().push("thumbnail");
            tokio::fs::write(output, b"thumb").await.ok();
            Ok(())
        }
    }

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(secs).unwrap()
    }

    /// A stand-in `ffmpeg` binary that just writes its last argument (the
    /// output path) so extract/concat calls have something to find.
    fn fake_ffmpeg(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake_ffmpeg.sh");
        std::fs::write(&script, "#!/bin/sh\neval last=\\${$#}\nprintf 'fake-media' > \"$last\"\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[tokio::test]
    async fn single_chunk_fast_path_produces_ready_clip_and_enqueues_tasks() {
        let catalog = Arc::new(FakeCatalog::new());
        let root = TempDir::new().unwrap();
        let disk = catalog.register_disk(root.path().to_str().unwrap(), 10).await.unwrap();

        let chunk_rel = "recordings/cam1/chunks/chunk.ts";
        tokio::fs::create_dir_all(root.path().join("recordings/cam1/chunks")).await.unwrap();
        tokio::fs::write(root.path().join(chunk_rel), b"fake ts data").await.unwrap();
        catalog
            .insert_media(NewMedia {
                id: "cam1_chunk".into(),
                camera_name: "cam1".into(),
                storage_disk_id: disk,
                relative_path: chunk_rel.into(),
                start_at: ts(0),
                end_at: ts(600),
                size_bytes: 12,
                kind: MediaKind::Chunk,
                source_segment_count: Some(90),
                status: ProcessingStatus::Ready,
            })
            .await
            .unwrap();

        let clip_id = Uuid::new_v4();
        catalog
            .insert_clip(NewClip {
                id: clip_id,
                booking_id: "booking-1".into(),
                camera_name: "cam1".into(),
                requested_start_at: ts(60),
                requested_end_at: ts(120),
            })
            .await
            .unwrap();

        let transforms = Arc::new(FakeTransforms::new(false));
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let extractor = ClipExtractor::new(catalog.clone(), FfmpegRunner::new(fake_ffmpeg(root.path())), transforms, clock);

        extractor.extract(clip_id, disk, root.path()).await.unwrap();

        let clip = catalog.get_clip(clip_id).await.unwrap().unwrap();
        assert_eq!(clip.status, ClipStatus::Ready);
        assert!(clip.local_path.is_some());
        assert_eq!(catalog.count_tasks_by_status(catalog::model::TaskStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn watermark_failure_falls_back_to_unwatermarked_extract() {
        let catalog = Arc::new(FakeCatalog::new());
        let root = TempDir::new().unwrap();
        let disk = catalog.register_disk(root.path().to_str().unwrap(), 10).await.unwrap();

        let chunk_rel = "recordings/cam1/chunks/chunk.ts";
        tokio::fs::create_dir_all(root.path().join("recordings/cam1/chunks")).await.unwrap();
        tokio::fs::write(root.path().join(chunk_rel), b"fake ts data").await.unwrap();
        catalog
            .insert_media(NewMedia {
                id: "cam1_chunk".into(),
                camera_name: "cam1".into(),
                storage_disk_id: disk,
                relative_path: chunk_rel.into(),
                start_at: ts(0),
                end_at: ts(600),
                size_bytes: 12,
                kind: MediaKind::Chunk,
                source_segment_count: Some(90),
                status: ProcessingStatus::Ready,
            })
            .await
            .unwrap();

        let clip_id = Uuid::new_v4();
        catalog
            .insert_clip(NewClip {
                id: clip_id,
                booking_id: "booking-1".into(),
                camera_name: "cam1".into(),
                requested_start_at: ts(60),
                requested_end_at: ts(120),
            })
            .await
            .unwrap();

        let transforms = Arc::new(FakeTransforms::new(true));
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let extractor = ClipExtractor::new(catalog.clone(), FfmpegRunner::new(fake_ffmpeg(root.path())), transforms, clock);

        extractor.extract(clip_id, disk, root.path()).await.unwrap();

        let clip = catalog.get_clip(clip_id).await.unwrap().unwrap();
        assert_eq!(clip.status, ClipStatus::Ready);
    }

    #[tokio::test]
    async fn no_sources_fails_the_clip() {
        let catalog = Arc::new(FakeCatalog::new());
        let root = TempDir::new().unwrap();
        let clip_id = Uuid::new_v4();
        catalog
            .insert_clip(NewClip {
                id: clip_id,
                booking_id: "booking-1".into(),
                camera_name: "cam1".into(),
                requested_start_at: ts(60),
                requested_end_at: ts(120),
            })
            .await
            .unwrap();

        let transforms = Arc::new(FakeTransforms::new(false));
        let clock = Arc::new(SimulatedClock::new(ts(1000)));
        let extractor = ClipExtractor::new(catalog.clone(), FfmpegRunner::new("true"), transforms, clock);
        extractor.extract(clip_id, Uuid::new_v4(), root.path()).await.unwrap();

        let clip = catalog.get_clip(clip_id).await.unwrap().unwrap();
        assert_eq!(clip.status, ClipStatus::Failed);
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hybrid discovery: given `(camera, t1, t2)`, returns the minimal ordered
//! set of chunks and raw segments whose union covers the range.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::Error;
use catalog::model::{Media, MediaKind, ProcessingStatus};
use catalog::store::CatalogStore;
use jiff::{SignedDuration, Timestamp};
use uuid::Uuid;

/// Gaps up to this long are treated as touching, not a hole to fill.
const GAP_TOLERANCE: SignedDuration = SignedDuration::from_secs(30);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SourceKind {
    Chunk,
    Segment,
}

#[derive(Clone, Debug)]
pub struct SegmentSource {
    pub id: String,
    pub kind: SourceKind,
    pub absolute_path: PathBuf,
    pub start: Timestamp,
    pub end: Timestamp,
    pub size_bytes: i64,
    pub status: ProcessingStatus,
}

pub struct Discovery<C: CatalogStore> {
    catalog: Arc<C>,
}

impl<C: CatalogStore> Discovery<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Discovery { catalog }
    }

    async fn disk_root(&self, cache: &mut HashMap<Uuid, PathBuf>, disk_id: Uuid) -> Result<PathBuf, Error> {
        if let Some(p) = cache.get(&disk_id) {
            return Ok(p.clone());
        }
        let disk = self
            .catalog
            .get_disk(disk_id)
            .await?
            .ok_or_else(|| base::err!(Integrity, "media references missing disk {disk_id}"))?;
        let path = PathBuf::from(disk.path);
        cache.insert(disk_id, path.clone());
        Ok(path)
    }

    async fn to_source(&self, cache: &mut HashMap<Uuid, PathBuf>, m: Media, kind: SourceKind) -> Result<SegmentSource, Error> {
        let root = self.disk_root(cache, m.storage_disk_id).await?;
        Ok(SegmentSource {
            id: m.id,
            kind,
            absolute_path: root.join(&m.relative_path),
            start: m.start_at,
            end: m.end_at,
            size_bytes: m.size_bytes,
            status: m.status,
        })
    }

    /// The discovery algorithm: chunk fast path, or chunks + gap segments.
    /// Falls back to segments-only for the whole range on a catalog read
    /// failure.
    pub async fn discover(&self, camera: &str, t1: Timestamp, t2: Timestamp) -> Result<Vec<SegmentSource>, Error> {
        let chunks = match self
            .catalog
            .list_media_overlapping(camera, t1, t2, Some(MediaKind::Chunk))
            .await
        {
            Ok(c) => c,
            Err(_) => return self.segments_only(camera, t1, t2).await,
        };

        let mut cache = HashMap::new();

        if fully_covers(&chunks, t1, t2) {
            let mut sources = Vec::with_capacity(chunks.len());
            for m in chunks {
                sources.push(self.to_source(&mut cache, m, SourceKind::Chunk).await?);
            }
            return Ok(sources);
        }

        let gaps = compute_gaps(&chunks, t1, t2);
        let mut sources = Vec::new();
        for m in &chunks {
            sources.push(self.to_source(&mut cache, m.clone(), SourceKind::Chunk).await?);
        }
        for (gap_start, gap_end) in gaps {
            let segments = self
                .catalog
                .list_media_overlapping(camera, gap_start, gap_end, Some(MediaKind::Segment))
                .await?;
            for m in segments {
                sources.push(self.to_source(&mut cache, m, SourceKind::Segment).await?);
            }
        }
        sort_sources(&mut sources);
        Ok(sources)
    }

    async fn segments_only(&self, camera: &str, t1: Timestamp, t2: Timestamp) -> Result<Vec<SegmentSource>, Error> {
        let segments = self
            .catalog
            .list_media_overlapping(camera, t1, t2, Some(MediaKind::Segment))
            .await?;
        let mut cache = HashMap::new();
        let mut sources = Vec::with_capacity(segments.len());
        for m in segments {
            sources.push(self.to_source(&mut cache, m, SourceKind::Segment).await?);
        }
        sort_sources(&mut sources);
        Ok(sources)
    }
}

/// Sorts by start time; ties broken chunk-before-segment, then by id.
fn sort_sources(sources: &mut [SegmentSource]) {
    sources.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| kind_rank(a.kind).cmp(&kind_rank(b.kind)))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn kind_rank(kind: SourceKind) -> u8 {
    match kind {
        SourceKind::Chunk => 0,
        SourceKind::Segment => 1,
    }
}

/// True iff `chunks` (already sorted ascending by `list_media_overlapping`)
/// cover `[t1, t2)` with every gap (including the ends) within tolerance.
fn fully_covers(chunks: &[Media], t1: Timestamp, t2: Timestamp, ) -> bool {
    if chunks.is_empty() {
        return false;
    }
    if chunks[0].start_at > t1 + GAP_TOLERANCE {
        return false;
    }
    for pair in chunks.windows(2) {
        let gap = pair[1].start_at - pair[0].end_at;
        if gap > GAP_TOLERANCE {
            return false;
        }
    }
    chunks.last().unwrap().end_at + GAP_TOLERANCE >= t2
}

/// Gaps (before the first chunk, between chunks, after the last) whose
/// length exceeds the tolerance, clamped to `[t1, t2)`.
fn compute_gaps(chunks: &[Media], t1: Timestamp, t2: Timestamp) -> Vec<(Timestamp, Timestamp)> {
    let mut gaps = Vec::new();
    let mut cursor = t1;
    for m in chunks {
        if m.start_at > cursor + GAP_TOLERANCE {
            gaps.push((cursor, m.start_at));
        }
        if m.end_at > cursor {
            cursor = m.end_at;
        }
    }
    if cursor + GAP_TOLERANCE < t2 {
        gaps.push((cursor, t2));
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::model::{NewMedia, ProcessingStatus};
    use catalog::testutil::FakeCatalog;

    fn ts(epoch_secs: i64) -> Timestamp {
        Timestamp::from_second(epoch_secs).unwrap()
    }

    async fn seed_disk(catalog: &FakeCatalog) -> Uuid {
        catalog.register_disk("/data", 10).await.unwrap()
    }

    async fn seed_media(catalog: &FakeCatalog, disk: Uuid, id: &str, camera: &str, start: i64, end: i64, kind: MediaKind) {
        catalog
            .insert_media(NewMedia {
                id: id.into(),
                camera_name: camera.into(),
                storage_disk_id: disk,
                relative_path: format!("recordings/{camera}/{id}.ts"),
                start_at: ts(start),
                end_at: ts(end),
                size_bytes: 1000,
                kind,
                source_segment_count: None,
                status: ProcessingStatus::Ready,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn single_chunk_fast_path() {
        let catalog = FakeCatalog::new();
        let disk = seed_disk(&catalog).await;
        seed_media(&catalog, disk, "cam1_c1_chunk", "cam1", 0, 600, MediaKind::Chunk).await;
        let discovery = Discovery::new(Arc::new(catalog));
        let sources = discovery.discover("cam1", ts(60), ts(300)).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].kind, SourceKind::Chunk);
    }

    #[tokio::test]
    async fn hybrid_fills_gap_with_segments() {
        let catalog = FakeCatalog::new();
        let disk = seed_disk(&catalog).await;
        seed_media(&catalog, disk, "cam1_c1_chunk", "cam1", 0, 600, MediaKind::Chunk).await;
        seed_media(&catalog, disk, "seg_604", "cam1", 604, 608, MediaKind::Segment).await;
        seed_media(&catalog, disk, "seg_608", "cam1", 608, 612, MediaKind::Segment).await;
        let discovery = Discovery::new(Arc::new(catalog));
        let sources = discovery.discover("cam1", ts(300), ts(660)).await.unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].kind, SourceKind::Chunk);
        assert_eq!(sources[1].kind, SourceKind::Segment);
        assert_eq!(sources[2].kind, SourceKind::Segment);
    }

    #[tokio::test]
    async fn empty_range_returns_empty_list() {
        let catalog = FakeCatalog::new();
        let discovery = Discovery::new(Arc::new(catalog));
        let sources = discovery.discover("cam1", ts(0), ts(60)).await.unwrap();
        assert!(sources.is_empty());
    }

    #[test]
    fn gaps_within_tolerance_are_not_gaps() {
        let chunks = vec![];
        let gaps = compute_gaps(&chunks, ts(0), ts(10));
        assert_eq!(gaps, vec![(ts(0), ts(10))]);
    }
}

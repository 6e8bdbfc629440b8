// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Daily retention sweep for ready, fully-uploaded clips (§4.H). Chunk
//! retention lives on [`crate::coalescer::ChunkCoalescer`], alongside the
//! state (the per-camera watermark) it must stay consistent with.

use std::path::Path;
use std::sync::Arc;

use base::clock::Clock;
use base::Error;
use catalog::store::CatalogStore;
use jiff::SignedDuration;

const DEFAULT_LOCAL_RETENTION: SignedDuration = SignedDuration::from_hours(72);

pub struct ClipRetention<C: CatalogStore> {
    catalog: Arc<C>,
    clock: Arc<dyn Clock>,
    local_retention: SignedDuration,
}

impl<C: CatalogStore> ClipRetention<C> {
    pub fn new(catalog: Arc<C>, clock: Arc<dyn Clock>) -> Self {
        ClipRetention { catalog, clock, local_retention: DEFAULT_LOCAL_RETENTION }
    }

    pub fn with_local_retention(mut self, d: SignedDuration) -> Self {
        self.local_retention = d;
        self
    }

    /// Deletes the local mp4, preview, thumbnail, and HLS directory (if
    /// any) of every ready clip past retention with remote URLs populated.
    /// The catalog row is kept so the clip stays browseable via its remote
    /// URLs. Returns the number of clips cleaned up; warns and continues
    /// past individual file failures.
    pub async fn run(&self, disk_root: &Path) -> Result<usize, Error> {
        let cutoff = self.clock.now() - self.local_retention;
        let clips = self.catalog.list_clips_eligible_for_retention(cutoff).await?;
        let mut cleaned = 0;
        for clip in clips {
            let Some(local_path) = clip.local_path.as_ref() else {
                continue;
            };
            let clip_path = Path::new(local_path);
            let clip_dir = clip_path.parent().unwrap_or(clip_path);
            if let Err(e) = remove_dir_if_exists(clip_dir).await {
                tracing::warn!(clip_id = %clip.id, error = %e, "failed to remove clip directory during retention");
                continue;
            }
            let hls_dir = disk_root.join("recordings").join(&clip.camera_name).join("hls").join(clip.id.to_string());
            if let Err(e) = remove_dir_if_exists(&hls_dir).await {
                tracing::warn!(clip_id = %clip.id, error = %e, "failed to remove clip hls directory during retention");
            }
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Entity types mirroring the data model: [`StorageDisk`], [`Media`]
//! (segments and chunks share a table, discriminated by [`MediaKind`]),
//! [`Clip`], [`PendingTask`], and [`SystemConfig`] values.

use base::{err, Error, ErrorKind};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Disk classification; see the Disk Pool Manager's classification rules.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    External,
    MountedStorage,
    InternalNvme,
    InternalSata,
    RootFilesystem,
    Unknown,
}

impl DiskType {
    /// The low end of this type's priority band; see the Disk Pool Manager's
    /// priority-bands table.
    pub fn priority_band_start(self) -> i64 {
        match self {
            DiskType::External => 1,
            DiskType::MountedStorage => 50,
            DiskType::InternalSata => 101,
            DiskType::InternalNvme => 201,
            DiskType::RootFilesystem => 500,
            DiskType::Unknown => 500,
        }
    }

    pub fn priority_band_end(self) -> i64 {
        match self {
            DiskType::External => 49,
            DiskType::MountedStorage => 100,
            DiskType::InternalSata => 200,
            DiskType::InternalNvme => 499,
            DiskType::RootFilesystem => 999,
            DiskType::Unknown => 999,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiskType::External => "external",
            DiskType::MountedStorage => "mounted_storage",
            DiskType::InternalNvme => "internal_nvme",
            DiskType::InternalSata => "internal_sata",
            DiskType::RootFilesystem => "root_filesystem",
            DiskType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "external" => DiskType::External,
            "mounted_storage" => DiskType::MountedStorage,
            "internal_nvme" => DiskType::InternalNvme,
            "internal_sata" => DiskType::InternalSata,
            "root_filesystem" => DiskType::RootFilesystem,
            "unknown" => DiskType::Unknown,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct StorageDisk {
    pub id: Uuid,
    pub path: String,
    pub disk_type: DiskType,
    pub total_space_bytes: i64,
    pub available_space_bytes: i64,
    pub last_scan_at: Option<Timestamp>,
    pub priority: i64,
    pub is_active: bool,
}

/// Fields used to register or update a disk's classification/capacity.
/// Excludes `id`/`is_active`, which the catalog manages.
#[derive(Clone, Debug)]
pub struct DiskScanUpdate {
    pub disk_type: DiskType,
    pub total_space_bytes: i64,
    pub available_space_bytes: i64,
    pub priority: i64,
    pub last_scan_at: Timestamp,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Segment,
    Chunk,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Segment => "segment",
            MediaKind::Chunk => "chunk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "segment" => Some(MediaKind::Segment),
            "chunk" => Some(MediaKind::Chunk),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processing,
    Ready,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Ready => "ready",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ProcessingStatus::Processing),
            "ready" => Some(ProcessingStatus::Ready),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }

    /// Statuses `set_media_status` may transition *from* to reach `self`.
    /// Enforces "processing -> ready/failed, never ready -> processing"
    /// (spec.md §4.B): only a row still `Processing` may move on, and
    /// nothing ever moves back into `Processing`.
    pub fn allowed_predecessors(self) -> &'static [ProcessingStatus] {
        match self {
            ProcessingStatus::Processing => &[],
            ProcessingStatus::Ready => &[ProcessingStatus::Processing],
            ProcessingStatus::Failed => &[ProcessingStatus::Processing],
        }
    }
}

/// A `RecordingSegment` or `Chunk`: one table, discriminated by `kind`.
#[derive(Clone, Debug)]
pub struct Media {
    pub id: String,
    pub camera_name: String,
    pub storage_disk_id: Uuid,
    pub relative_path: String,
    pub start_at: Timestamp,
    pub end_at: Timestamp,
    pub size_bytes: i64,
    pub kind: MediaKind,
    /// Populated for chunks only: how many source segments it coalesces.
    pub source_segment_count: Option<i64>,
    pub status: ProcessingStatus,
    pub created_at: Timestamp,
}

impl Media {
    pub fn duration(&self) -> jiff::SignedDuration {
        self.end_at - self.start_at
    }
}

/// A row to insert for a newly-discovered segment or newly-built chunk.
#[derive(Clone, Debug)]
pub struct NewMedia {
    pub id: String,
    pub camera_name: String,
    pub storage_disk_id: Uuid,
    pub relative_path: String,
    pub start_at: Timestamp,
    pub end_at: Timestamp,
    pub size_bytes: i64,
    pub kind: MediaKind,
    pub source_segment_count: Option<i64>,
    pub status: ProcessingStatus,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    Initial,
    Processing,
    Uploading,
    Ready,
    Failed,
}

impl ClipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClipStatus::Initial => "initial",
            ClipStatus::Processing => "processing",
            ClipStatus::Uploading => "uploading",
            ClipStatus::Ready => "ready",
            ClipStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(ClipStatus::Initial),
            "processing" => Some(ClipStatus::Processing),
            "uploading" => Some(ClipStatus::Uploading),
            "ready" => Some(ClipStatus::Ready),
            "failed" => Some(ClipStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RemoteArtifacts {
    pub mp4_key: Option<String>,
    pub mp4_url: Option<String>,
    pub preview_key: Option<String>,
    pub preview_url: Option<String>,
    pub thumbnail_key: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl RemoteArtifacts {
    /// Whether all URLs a notify task's payload needs have been populated.
    pub fn is_complete(&self) -> bool {
        self.mp4_url.is_some() && self.preview_url.is_some() && self.thumbnail_url.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Clip {
    pub id: Uuid,
    pub booking_id: String,
    pub camera_name: String,
    pub requested_start_at: Timestamp,
    pub requested_end_at: Timestamp,
    pub local_path: Option<String>,
    pub storage_disk_id: Option<Uuid>,
    pub size_bytes: Option<i64>,
    pub duration_ms: Option<i64>,
    pub remote: RemoteArtifacts,
    pub status: ClipStatus,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub uploaded_at: Option<Timestamp>,
}

#[derive(Clone, Debug)]
pub struct NewClip {
    pub id: Uuid,
    pub booking_id: String,
    pub camera_name: String,
    pub requested_start_at: Timestamp,
    pub requested_end_at: Timestamp,
}

/// Fields set when local extraction finishes successfully.
#[derive(Clone, Debug)]
pub struct LocalArtifact {
    pub local_path: String,
    pub storage_disk_id: Uuid,
    pub size_bytes: i64,
    pub duration_ms: i64,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    UploadClip,
    NotifyApi,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::UploadClip => "upload_clip",
            TaskType::NotifyApi => "notify_api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload_clip" => Some(TaskType::UploadClip),
            "notify_api" => Some(TaskType::NotifyApi),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PendingTask {
    pub id: i64,
    pub task_type: TaskType,
    pub clip_id: Uuid,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Timestamp,
    pub last_error: Option<String>,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Clone, Debug)]
pub struct NewTask {
    pub task_type: TaskType,
    pub clip_id: Uuid,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub next_retry_at: Timestamp,
}

/// A value held in `system_config`; the catalog round-trips the type tag so
/// typed getters (`get_int`, `get_bool`, ...) can validate on read.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Bool(bool),
    Json(serde_json::Value),
}

/// The `chunk_processing` system_config tunable (§6): coalescer behavior,
/// live-adjustable through `CatalogStore::set_config` without a restart.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChunkProcessingConfig {
    pub enabled: bool,
    pub chunk_duration_minutes: i64,
    pub min_segments_for_chunk: i64,
    pub retention_days: i64,
    pub processing_timeout_minutes: i64,
    pub max_concurrent_processing: usize,
}

impl Default for ChunkProcessingConfig {
    fn default() -> Self {
        ChunkProcessingConfig {
            enabled: true,
            chunk_duration_minutes: 10,
            min_segments_for_chunk: 10,
            retention_days: 7,
            processing_timeout_minutes: 5,
            max_concurrent_processing: 2,
        }
    }
}

impl ChunkProcessingConfig {
    /// The `system_config` key this type is stored under.
    pub const CONFIG_KEY: &'static str = "chunk_processing";

    /// Parses the row fetched via `CatalogStore::get_config(Self::CONFIG_KEY)`,
    /// falling back to [`ChunkProcessingConfig::default`] only when the row is
    /// absent; a present-but-malformed row is a configuration error, not a
    /// silent default.
    pub fn from_config_value(value: Option<ConfigValue>) -> Result<Self, Error> {
        match value {
            None => Ok(Self::default()),
            Some(ConfigValue::Json(v)) => serde_json::from_value(v)
                .map_err(|e| Error::wrap(ErrorKind::Invariant, "parsing chunk_processing config", e)),
            Some(_) => Err(err!(Invariant, "chunk_processing config row has the wrong type")),
        }
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `SqliteCatalog`: the production [`CatalogStore`] backed by a single
//! embedded SQLite file, exactly as `moonfire-db` backs its own schema.
//!
//! Every mutation is its own transaction. Reads and writes share one
//! connection behind a `std::sync::Mutex`: SQLite serializes writers
//! anyway, and a single local file never benefits from pooling the way a
//! networked database would.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use base::{err, Error, ErrorKind};
use jiff::Timestamp;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::model::{
    Clip, ClipStatus, ConfigValue, DiskScanUpdate, DiskType, LocalArtifact, Media, MediaKind,
    NewClip, NewMedia, NewTask, PendingTask, ProcessingStatus, RemoteArtifacts, StorageDisk,
    TaskStatus, TaskType,
};
use crate::store::CatalogStore;
use crate::upgrade;

pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

fn micros(t: Timestamp) -> i64 {
    t.as_microsecond()
}

fn from_micros(v: i64) -> Result<Timestamp, Error> {
    Timestamp::from_microsecond(v)
        .map_err(|e| Error::wrap(ErrorKind::Internal, "decoding stored timestamp", e))
}

impl SqliteCatalog {
    /// Opens (creating if necessary) the catalog database at `path`,
    /// applying any pending schema migrations.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut conn = Connection::open(path)
            .map_err(|e| Error::wrap(ErrorKind::Transient, "opening catalog database", e))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "enabling foreign keys", e))?;
        upgrade::ensure_current(&mut conn)?;
        Ok(SqliteCatalog {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory catalog with a fresh schema; for tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "opening in-memory catalog", e))?;
        upgrade::ensure_current(&mut conn)?;
        Ok(SqliteCatalog {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("catalog connection mutex poisoned")
    }

    /// Builds the error to report after a `set_media_status` update
    /// affected zero rows: `NotFound` if the row is simply gone, else
    /// `Invariant` naming the illegal transition.
    fn media_transition_error(
        conn: &Connection,
        id: &str,
        status: ProcessingStatus,
    ) -> Result<Error, Error> {
        let current: Option<String> = conn
            .query_row("select status from media where id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading media status", e))?;
        Ok(match current {
            None => err!(NotFound, "no such media {id}"),
            Some(current) => err!(
                Invariant,
                "media {id} cannot transition from {current} to {}",
                status.as_str()
            ),
        })
    }
}

fn row_to_disk(row: &rusqlite::Row) -> rusqlite::Result<StorageDisk> {
    let id: String = row.get("id")?;
    let disk_type: String = row.get("disk_type")?;
    let last_scan_at: Option<i64> = row.get("last_scan_at")?;
    Ok(StorageDisk {
        id: Uuid::from_str(&id).unwrap_or_default(),
        path: row.get("path")?,
        disk_type: DiskType::parse(&disk_type).unwrap_or(DiskType::Unknown),
        total_space_bytes: row.get("total_space_bytes")?,
        available_space_bytes: row.get("available_space_bytes")?,
        last_scan_at: last_scan_at.map(|m| Timestamp::from_microsecond(m).unwrap_or(Timestamp::UNIX_EPOCH)),
        priority: row.get("priority")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

fn row_to_media(row: &rusqlite::Row) -> rusqlite::Result<Media> {
    let disk_id: String = row.get("storage_disk_id")?;
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let start_at: i64 = row.get("start_at")?;
    let end_at: i64 = row.get("end_at")?;
    let created_at: i64 = row.get("created_at")?;
    Ok(Media {
        id: row.get("id")?,
        camera_name: row.get("camera_name")?,
        storage_disk_id: Uuid::from_str(&disk_id).unwrap_or_default(),
        relative_path: row.get("relative_path")?,
        start_at: Timestamp::from_microsecond(start_at).unwrap_or(Timestamp::UNIX_EPOCH),
        end_at: Timestamp::from_microsecond(end_at).unwrap_or(Timestamp::UNIX_EPOCH),
        size_bytes: row.get("size_bytes")?,
        kind: MediaKind::parse(&kind).unwrap_or(MediaKind::Segment),
        source_segment_count: row.get("source_segment_count")?,
        status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::Failed),
        created_at: Timestamp::from_microsecond(created_at).unwrap_or(Timestamp::UNIX_EPOCH),
    })
}

fn row_to_clip(row: &rusqlite::Row) -> rusqlite::Result<Clip> {
    let id: String = row.get("id")?;
    let storage_disk_id: Option<String> = row.get("storage_disk_id")?;
    let status: String = row.get("status")?;
    let requested_start_at: i64 = row.get("requested_start_at")?;
    let requested_end_at: i64 = row.get("requested_end_at")?;
    let created_at: i64 = row.get("created_at")?;
    let finished_at: Option<i64> = row.get("finished_at")?;
    let uploaded_at: Option<i64> = row.get("uploaded_at")?;
    Ok(Clip {
        id: Uuid::from_str(&id).unwrap_or_default(),
        booking_id: row.get("booking_id")?,
        camera_name: row.get("camera_name")?,
        requested_start_at: Timestamp::from_microsecond(requested_start_at)
            .unwrap_or(Timestamp::UNIX_EPOCH),
        requested_end_at: Timestamp::from_microsecond(requested_end_at)
            .unwrap_or(Timestamp::UNIX_EPOCH),
        local_path: row.get("local_path")?,
        storage_disk_id: storage_disk_id.and_then(|s| Uuid::from_str(&s).ok()),
        size_bytes: row.get("size_bytes")?,
        duration_ms: row.get("duration_ms")?,
        remote: RemoteArtifacts {
            mp4_key: row.get("remote_mp4_key")?,
            mp4_url: row.get("remote_mp4_url")?,
            preview_key: row.get("remote_preview_key")?,
            preview_url: row.get("remote_preview_url")?,
            thumbnail_key: row.get("remote_thumbnail_key")?,
            thumbnail_url: row.get("remote_thumbnail_url")?,
        },
        status: ClipStatus::parse(&status).unwrap_or(ClipStatus::Failed),
        error_message: row.get("error_message")?,
        created_at: Timestamp::from_microsecond(created_at).unwrap_or(Timestamp::UNIX_EPOCH),
        finished_at: finished_at.map(|m| Timestamp::from_microsecond(m).unwrap_or(Timestamp::UNIX_EPOCH)),
        uploaded_at: uploaded_at.map(|m| Timestamp::from_microsecond(m).unwrap_or(Timestamp::UNIX_EPOCH)),
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<PendingTask> {
    let clip_id: String = row.get("clip_id")?;
    let task_type: String = row.get("task_type")?;
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    let next_retry_at: i64 = row.get("next_retry_at")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    Ok(PendingTask {
        id: row.get("id")?,
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::UploadClip),
        clip_id: Uuid::from_str(&clip_id).unwrap_or_default(),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        next_retry_at: Timestamp::from_microsecond(next_retry_at).unwrap_or(Timestamp::UNIX_EPOCH),
        last_error: row.get("last_error")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        created_at: Timestamp::from_microsecond(created_at).unwrap_or(Timestamp::UNIX_EPOCH),
        updated_at: Timestamp::from_microsecond(updated_at).unwrap_or(Timestamp::UNIX_EPOCH),
    })
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn register_disk(&self, path: &str, priority: i64) -> Result<Uuid, Error> {
        let id = Uuid::new_v4();
        let now = micros(jiff::Timestamp::now());
        let conn = self.lock();
        conn.execute(
            "insert into storage_disks \
             (id, path, disk_type, total_space_bytes, available_space_bytes, \
              last_scan_at, priority, is_active) \
             values (?1, ?2, 'unknown', 0, 0, ?3, ?4, 0)",
            params![id.to_string(), path, now, priority],
        )
        .map_err(|e| {
            if let rusqlite::Error::SqliteFailure(sql_err, _) = &e {
                if sql_err.code == rusqlite::ErrorCode::ConstraintViolation {
                    return err!(AlreadyExists, "disk path {path} already registered");
                }
            }
            Error::wrap(ErrorKind::Internal, "registering disk", e)
        })?;
        Ok(id)
    }

    async fn list_disks(&self) -> Result<Vec<StorageDisk>, Error> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("select * from storage_disks order by priority asc")
            .map_err(|e| Error::wrap(ErrorKind::Internal, "preparing disk list", e))?;
        let rows = stmt
            .query_map([], row_to_disk)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "listing disks", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading disk row", e))
    }

    async fn get_disk(&self, id: Uuid) -> Result<Option<StorageDisk>, Error> {
        let conn = self.lock();
        conn.query_row(
            "select * from storage_disks where id = ?1",
            params![id.to_string()],
            row_to_disk,
        )
        .optional()
        .map_err(|e| Error::wrap(ErrorKind::Internal, "reading disk", e))
    }

    async fn get_disk_by_path(&self, path: &str) -> Result<Option<StorageDisk>, Error> {
        let conn = self.lock();
        conn.query_row(
            "select * from storage_disks where path = ?1",
            params![path],
            row_to_disk,
        )
        .optional()
        .map_err(|e| Error::wrap(ErrorKind::Internal, "reading disk by path", e))
    }

    async fn update_disk_scan(&self, id: Uuid, update: DiskScanUpdate) -> Result<(), Error> {
        let conn = self.lock();
        let n = conn
            .execute(
                "update storage_disks set disk_type = ?1, total_space_bytes = ?2, \
                 available_space_bytes = ?3, priority = ?4, last_scan_at = ?5 where id = ?6",
                params![
                    update.disk_type.as_str(),
                    update.total_space_bytes,
                    update.available_space_bytes,
                    update.priority,
                    micros(update.last_scan_at),
                    id.to_string(),
                ],
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "updating disk scan", e))?;
        if n == 0 {
            return Err(err!(NotFound, "no such disk {id}"));
        }
        Ok(())
    }

    async fn set_active_disk(&self, id: Uuid) -> Result<(), Error> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "starting active-disk tx", e))?;
        tx.execute("update storage_disks set is_active = 0", [])
            .map_err(|e| Error::wrap(ErrorKind::Internal, "clearing active disk", e))?;
        let n = tx
            .execute(
                "update storage_disks set is_active = 1 where id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "setting active disk", e))?;
        if n == 0 {
            return Err(err!(NotFound, "no such disk {id}"));
        }
        tx.commit()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "committing active-disk tx", e))
    }

    async fn active_disk(&self) -> Result<Option<StorageDisk>, Error> {
        let conn = self.lock();
        conn.query_row(
            "select * from storage_disks where is_active = 1",
            [],
            row_to_disk,
        )
        .optional()
        .map_err(|e| Error::wrap(ErrorKind::Internal, "reading active disk", e))
    }

    async fn insert_media(&self, media: NewMedia) -> Result<(), Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        conn.execute(
            "insert into media \
             (id, camera_name, storage_disk_id, relative_path, start_at, end_at, \
              size_bytes, kind, source_segment_count, status, created_at) \
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                media.id,
                media.camera_name,
                media.storage_disk_id.to_string(),
                media.relative_path,
                micros(media.start_at),
                micros(media.end_at),
                media.size_bytes,
                media.kind.as_str(),
                media.source_segment_count,
                media.status.as_str(),
                now,
            ],
        )
        .map_err(|e| {
            if let rusqlite::Error::SqliteFailure(sql_err, _) = &e {
                if sql_err.code == rusqlite::ErrorCode::ConstraintViolation {
                    return err!(AlreadyExists, "media {} already exists", media.id);
                }
            }
            Error::wrap(ErrorKind::Internal, "inserting media", e)
        })?;
        Ok(())
    }

    async fn get_media(&self, id: &str) -> Result<Option<Media>, Error> {
        let conn = self.lock();
        conn.query_row("select * from media where id = ?1", params![id], row_to_media)
            .optional()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading media", e))
    }

    async fn media_exists(
        &self,
        camera_name: &str,
        start_at: Timestamp,
        kind: MediaKind,
    ) -> Result<bool, Error> {
        let conn = self.lock();
        let n: i64 = conn
            .query_row(
                "select count(*) from media where camera_name = ?1 and start_at = ?2 and kind = ?3",
                params![camera_name, micros(start_at), kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "checking media existence", e))?;
        Ok(n > 0)
    }

    async fn list_media_overlapping(
        &self,
        camera_name: &str,
        start: Timestamp,
        end: Timestamp,
        kind: Option<MediaKind>,
    ) -> Result<Vec<Media>, Error> {
        let conn = self.lock();
        let (sql, kind_str) = match kind {
            Some(k) => (
                "select * from media where camera_name = ?1 and kind = ?4 \
                 and start_at < ?3 and end_at > ?2 order by start_at asc",
                k.as_str().to_string(),
            ),
            None => (
                "select * from media where camera_name = ?1 \
                 and start_at < ?3 and end_at > ?2 order by start_at asc",
                String::new(),
            ),
        };
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "preparing overlap query", e))?;
        let rows = if kind.is_some() {
            stmt.query_map(
                params![camera_name, micros(start), micros(end), kind_str],
                row_to_media,
            )
        } else {
            stmt.query_map(params![camera_name, micros(start), micros(end)], row_to_media)
        }
        .map_err(|e| Error::wrap(ErrorKind::Internal, "querying overlap", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading overlap row", e))
    }

    async fn count_segments_in_window(
        &self,
        camera_name: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<i64, Error> {
        let conn = self.lock();
        conn.query_row(
            "select count(*) from media where camera_name = ?1 and kind = 'segment' \
             and start_at >= ?2 and start_at < ?3",
            params![camera_name, micros(start), micros(end)],
            |row| row.get(0),
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "counting segments", e))
    }

    async fn set_media_status(&self, id: &str, status: ProcessingStatus) -> Result<(), Error> {
        let conn = self.lock();
        let predecessors = status.allowed_predecessors();
        // Nothing is ever allowed to transition into this status (e.g.
        // `Processing`, which is only ever set at insert time): skip the
        // update and report why, rather than issuing `status in ()`.
        if predecessors.is_empty() {
            return Err(Self::media_transition_error(&conn, id, status)?);
        }
        let predecessor_strs: Vec<&str> = predecessors.iter().map(|p| p.as_str()).collect();
        let placeholders = predecessor_strs.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("update media set status = ? where id = ? and status in ({placeholders})");
        let status_str = status.as_str();
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&status_str, &id];
        for p in &predecessor_strs {
            params.push(p);
        }
        let n = conn
            .execute(&sql, params.as_slice())
            .map_err(|e| Error::wrap(ErrorKind::Internal, "updating media status", e))?;
        if n == 1 {
            return Ok(());
        }
        Err(Self::media_transition_error(&conn, id, status)?)
    }

    async fn delete_media(&self, id: &str) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute("delete from media where id = ?1", params![id])
            .map_err(|e| Error::wrap(ErrorKind::Internal, "deleting media", e))?;
        Ok(())
    }

    async fn list_ready_chunks_older_than(&self, cutoff: Timestamp) -> Result<Vec<Media>, Error> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "select * from media where kind = 'chunk' and status = 'ready' \
                 and created_at < ?1 order by created_at asc",
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "preparing retention query", e))?;
        let rows = stmt
            .query_map(params![micros(cutoff)], row_to_media)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "listing aged chunks", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading aged chunk row", e))
    }

    async fn insert_clip(&self, clip: NewClip) -> Result<(), Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        conn.execute(
            "insert into clips \
             (id, booking_id, camera_name, requested_start_at, requested_end_at, \
              status, created_at) \
             values (?1, ?2, ?3, ?4, ?5, 'initial', ?6)",
            params![
                clip.id.to_string(),
                clip.booking_id,
                clip.camera_name,
                micros(clip.requested_start_at),
                micros(clip.requested_end_at),
                now,
            ],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "inserting clip", e))?;
        Ok(())
    }

    async fn get_clip(&self, id: Uuid) -> Result<Option<Clip>, Error> {
        let conn = self.lock();
        conn.query_row(
            "select * from clips where id = ?1",
            params![id.to_string()],
            row_to_clip,
        )
        .optional()
        .map_err(|e| Error::wrap(ErrorKind::Internal, "reading clip", e))
    }

    async fn set_clip_status(
        &self,
        id: Uuid,
        status: ClipStatus,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.lock();
        let finished_at = matches!(status, ClipStatus::Ready | ClipStatus::Failed)
            .then(|| micros(jiff::Timestamp::now()));
        let n = conn
            .execute(
                "update clips set status = ?1, error_message = ?2, \
                 finished_at = coalesce(?3, finished_at) where id = ?4",
                params![status.as_str(), error_message, finished_at, id.to_string()],
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "updating clip status", e))?;
        if n == 0 {
            return Err(err!(NotFound, "no such clip {id}"));
        }
        Ok(())
    }

    async fn set_clip_local_artifact(&self, id: Uuid, artifact: LocalArtifact) -> Result<(), Error> {
        let conn = self.lock();
        let n = conn
            .execute(
                "update clips set local_path = ?1, storage_disk_id = ?2, size_bytes = ?3, \
                 duration_ms = ?4 where id = ?5",
                params![
                    artifact.local_path,
                    artifact.storage_disk_id.to_string(),
                    artifact.size_bytes,
                    artifact.duration_ms,
                    id.to_string(),
                ],
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "setting local artifact", e))?;
        if n == 0 {
            return Err(err!(NotFound, "no such clip {id}"));
        }
        Ok(())
    }

    async fn set_clip_remote_mp4(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "update clips set remote_mp4_key = ?1, remote_mp4_url = ?2 where id = ?3",
            params![key, url, id.to_string()],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "setting remote mp4", e))?;
        Ok(())
    }

    async fn set_clip_remote_preview(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "update clips set remote_preview_key = ?1, remote_preview_url = ?2 where id = ?3",
            params![key, url, id.to_string()],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "setting remote preview", e))?;
        Ok(())
    }

    async fn set_clip_remote_thumbnail(&self, id: Uuid, key: &str, url: &str) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "update clips set remote_thumbnail_key = ?1, remote_thumbnail_url = ?2 where id = ?3",
            params![key, url, id.to_string()],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "setting remote thumbnail", e))?;
        Ok(())
    }

    async fn mark_clip_uploaded(&self, id: Uuid, at: Timestamp) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "update clips set status = 'ready', uploaded_at = ?1 where id = ?2",
            params![micros(at), id.to_string()],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "marking clip uploaded", e))?;
        Ok(())
    }

    async fn list_clips_eligible_for_retention(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<Clip>, Error> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "select * from clips where status = 'ready' and finished_at < ?1 \
                 and remote_mp4_url is not null and remote_preview_url is not null \
                 and remote_thumbnail_url is not null and local_path is not null",
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "preparing clip retention query", e))?;
        let rows = stmt
            .query_map(params![micros(cutoff)], row_to_clip)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "listing retained clips", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading retained clip row", e))
    }

    async fn enqueue_task(&self, task: NewTask) -> Result<i64, Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| Error::wrap(ErrorKind::InvalidArgument, "serializing task payload", e))?;
        conn.execute(
            "insert into pending_tasks \
             (task_type, clip_id, payload, max_attempts, next_retry_at, status, \
              created_at, updated_at) \
             values (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            params![
                task.task_type.as_str(),
                task.clip_id.to_string(),
                payload,
                task.max_attempts,
                micros(task.next_retry_at),
                now,
            ],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "enqueuing task", e))?;
        Ok(conn.last_insert_rowid())
    }

    async fn dequeue_next(&self, now: Timestamp) -> Result<Option<PendingTask>, Error> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "starting dequeue tx", e))?;
        // upload_clip before notify_api within the same next_retry_at, per the
        // dependency rule: uploads should generally be tried first.
        let id: Option<i64> = tx
            .query_row(
                "select id from pending_tasks where status = 'pending' and next_retry_at <= ?1 \
                 order by (task_type = 'notify_api'), next_retry_at asc, id asc limit 1",
                params![micros(now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "selecting next task", e))?;
        let Some(id) = id else {
            return Ok(None);
        };
        tx.execute(
            "update pending_tasks set status = 'processing', updated_at = ?1 where id = ?2",
            params![micros(now), id],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "claiming task", e))?;
        let task = tx
            .query_row("select * from pending_tasks where id = ?1", params![id], row_to_task)
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading claimed task", e))?;
        tx.commit()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "committing dequeue tx", e))?;
        Ok(Some(task))
    }

    async fn mark_task_completed(&self, id: i64) -> Result<(), Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        conn.execute(
            "update pending_tasks set status = 'completed', updated_at = ?1 where id = ?2",
            params![now, id],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "completing task", e))?;
        Ok(())
    }

    async fn mark_task_retry(
        &self,
        id: i64,
        next_retry_at: Timestamp,
        last_error: &str,
    ) -> Result<(), Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        conn.execute(
            "update pending_tasks set status = 'pending', attempts = attempts + 1, \
             next_retry_at = ?1, last_error = ?2, updated_at = ?3 where id = ?4",
            params![micros(next_retry_at), last_error, now, id],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "scheduling task retry", e))?;
        Ok(())
    }

    async fn mark_task_failed(&self, id: i64, last_error: &str) -> Result<(), Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        conn.execute(
            "update pending_tasks set status = 'failed', last_error = ?1, updated_at = ?2 \
             where id = ?3",
            params![last_error, now, id],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "failing task", e))?;
        Ok(())
    }

    async fn defer_task(&self, id: i64) -> Result<(), Error> {
        let conn = self.lock();
        let now = micros(jiff::Timestamp::now());
        conn.execute(
            "update pending_tasks set status = 'pending', updated_at = ?1 where id = ?2",
            params![now, id],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "deferring task", e))?;
        Ok(())
    }

    async fn count_incomplete_uploads_for_clip(&self, clip_id: Uuid) -> Result<i64, Error> {
        let conn = self.lock();
        conn.query_row(
            "select count(*) from pending_tasks where clip_id = ?1 and task_type = 'upload_clip' \
             and status != 'completed'",
            params![clip_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "counting incomplete uploads", e))
    }

    async fn count_tasks_by_status(&self, status: TaskStatus) -> Result<i64, Error> {
        let conn = self.lock();
        conn.query_row(
            "select count(*) from pending_tasks where status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "counting tasks by status", e))
    }

    async fn delete_completed_tasks_older_than(&self, cutoff: Timestamp) -> Result<i64, Error> {
        let conn = self.lock();
        let n = conn
            .execute(
                "delete from pending_tasks where status = 'completed' and updated_at < ?1",
                params![micros(cutoff)],
            )
            .map_err(|e| Error::wrap(ErrorKind::Internal, "deleting completed tasks", e))?;
        Ok(n as i64)
    }

    async fn get_config(&self, key: &str) -> Result<Option<ConfigValue>, Error> {
        let conn = self.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "select value, value_type from system_config where key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::wrap(ErrorKind::Internal, "reading config", e))?;
        let Some((value, value_type)) = row else {
            return Ok(None);
        };
        Ok(Some(match value_type.as_str() {
            "string" => ConfigValue::String(value),
            "int" => ConfigValue::Int(value.parse().map_err(|e| {
                Error::wrap(ErrorKind::Invariant, format!("config {key} is not an int"), {
                    struct W(std::num::ParseIntError);
                    impl std::fmt::Display for W {
                        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                            self.0.fmt(f)
                        }
                    }
                    impl std::fmt::Debug for W {
                        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                            self.0.fmt(f)
                        }
                    }
                    impl std::error::Error for W {}
                    W(e)
                })
            })?),
            "bool" => ConfigValue::Bool(value == "true"),
            "json" => ConfigValue::Json(serde_json::from_str(&value).map_err(|e| {
                Error::wrap(ErrorKind::Invariant, format!("config {key} is not valid json"), e)
            })?),
            other => return Err(err!(Invariant, "unknown config value_type {other} for {key}")),
        }))
    }

    async fn set_config(&self, key: &str, value: ConfigValue) -> Result<(), Error> {
        let (value_str, value_type) = match &value {
            ConfigValue::String(s) => (s.clone(), "string"),
            ConfigValue::Int(i) => (i.to_string(), "int"),
            ConfigValue::Bool(b) => (b.to_string(), "bool"),
            ConfigValue::Json(j) => (j.to_string(), "json"),
        };
        let conn = self.lock();
        conn.execute(
            "insert into system_config (key, value, value_type) values (?1, ?2, ?3) \
             on conflict(key) do update set value = excluded.value, value_type = excluded.value_type",
            params![key, value_str, value_type],
        )
        .map_err(|e| Error::wrap(ErrorKind::Internal, "writing config", e))?;
        Ok(())
    }

    async fn get_watermark(&self, camera_name: &str) -> Result<Option<Timestamp>, Error> {
        let key = format!("last_processed_segment_{camera_name}");
        match self.get_config(&key).await? {
            Some(ConfigValue::Int(micros_val)) => Ok(Some(from_micros(micros_val)?)),
            Some(_) => Err(err!(Invariant, "watermark for {camera_name} has wrong type")),
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, camera_name: &str, at: Timestamp) -> Result<(), Error> {
        let key = format!("last_processed_segment_{camera_name}");
        self.set_config(&key, ConfigValue::Int(micros(at))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiskScanUpdate;

    #[tokio::test]
    async fn active_disk_invariant_holds_after_reassignment() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        let a = cat.register_disk("/mnt/a", 10).await.unwrap();
        let b = cat.register_disk("/mnt/b", 20).await.unwrap();
        cat.set_active_disk(a).await.unwrap();
        assert_eq!(cat.active_disk().await.unwrap().unwrap().id, a);
        cat.set_active_disk(b).await.unwrap();
        let disks = cat.list_disks().await.unwrap();
        assert_eq!(disks.iter().filter(|d| d.is_active).count(), 1);
        assert_eq!(cat.active_disk().await.unwrap().unwrap().id, b);
    }

    #[tokio::test]
    async fn media_uniqueness_rejects_duplicate() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        let disk = cat.register_disk("/mnt/a", 10).await.unwrap();
        let start = Timestamp::from_microsecond(0).unwrap();
        let end = Timestamp::from_microsecond(4_000_000).unwrap();
        let m = NewMedia {
            id: "cam1_seg1".into(),
            camera_name: "cam1".into(),
            storage_disk_id: disk,
            relative_path: "recordings/cam1/hls/segment_1.ts".into(),
            start_at: start,
            end_at: end,
            size_bytes: 1000,
            kind: MediaKind::Segment,
            source_segment_count: None,
            status: ProcessingStatus::Ready,
        };
        cat.insert_media(m.clone()).await.unwrap();
        let err = cat.insert_media(m).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn set_media_status_rejects_ready_to_processing() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        let disk = cat.register_disk("/mnt/a", 10).await.unwrap();
        let start = Timestamp::from_microsecond(0).unwrap();
        let end = Timestamp::from_microsecond(4_000_000).unwrap();
        let m = NewMedia {
            id: "cam1_chunk1".into(),
            camera_name: "cam1".into(),
            storage_disk_id: disk,
            relative_path: "recordings/cam1/chunks/chunk_1.ts".into(),
            start_at: start,
            end_at: end,
            size_bytes: 1000,
            kind: MediaKind::Chunk,
            source_segment_count: Some(3),
            status: ProcessingStatus::Ready,
        };
        cat.insert_media(m).await.unwrap();

        let err = cat
            .set_media_status("cam1_chunk1", ProcessingStatus::Processing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);

        // Legal transitions still work: processing -> ready.
        let m2 = NewMedia {
            id: "cam1_chunk2".into(),
            camera_name: "cam1".into(),
            storage_disk_id: disk,
            relative_path: "recordings/cam1/chunks/chunk_2.ts".into(),
            start_at: end,
            end_at: Timestamp::from_microsecond(8_000_000).unwrap(),
            size_bytes: 0,
            kind: MediaKind::Chunk,
            source_segment_count: Some(3),
            status: ProcessingStatus::Processing,
        };
        cat.insert_media(m2).await.unwrap();
        cat.set_media_status("cam1_chunk2", ProcessingStatus::Ready)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dequeue_respects_priority_and_fifo() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        let disk = cat.register_disk("/mnt/a", 10).await.unwrap();
        cat.set_active_disk(disk).await.unwrap();
        let clip_id = Uuid::new_v4();
        cat.insert_clip(NewClip {
            id: clip_id,
            booking_id: "b1".into(),
            camera_name: "cam1".into(),
            requested_start_at: Timestamp::now(),
            requested_end_at: Timestamp::now(),
        })
        .await
        .unwrap();
        let now = Timestamp::now();
        let notify_id = cat
            .enqueue_task(NewTask {
                task_type: TaskType::NotifyApi,
                clip_id,
                payload: serde_json::json!({}),
                max_attempts: 3,
                next_retry_at: now,
            })
            .await
            .unwrap();
        let upload_id = cat
            .enqueue_task(NewTask {
                task_type: TaskType::UploadClip,
                clip_id,
                payload: serde_json::json!({}),
                max_attempts: 5,
                next_retry_at: now,
            })
            .await
            .unwrap();
        assert!(upload_id > notify_id);
        let first = cat.dequeue_next(now).await.unwrap().unwrap();
        assert_eq!(first.id, upload_id, "upload should dispatch before notify");
    }

    #[tokio::test]
    async fn set_active_disk_missing_disk_is_not_found() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        let err = cat.set_active_disk(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn config_round_trips_typed_values() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        cat.set_config("minimum_free_space_gb", ConfigValue::Int(100))
            .await
            .unwrap();
        assert_eq!(
            cat.get_config("minimum_free_space_gb").await.unwrap(),
            Some(ConfigValue::Int(100))
        );
    }

    #[tokio::test]
    async fn watermark_round_trips() {
        let cat = SqliteCatalog::open_in_memory().unwrap();
        assert!(cat.get_watermark("cam1").await.unwrap().is_none());
        let t = Timestamp::from_microsecond(123_000_000).unwrap();
        cat.set_watermark("cam1", t).await.unwrap();
        assert_eq!(cat.get_watermark("cam1").await.unwrap(), Some(t));
    }
}

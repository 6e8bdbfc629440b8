// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! [`DiskPoolManager`]: discovery, classification, scanning, and active-disk
//! selection, all backed by a [`CatalogStore`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::clock::Clock;
use base::{err, Error};
use catalog::model::{ConfigValue, DiskScanUpdate, DiskType, StorageDisk};
use catalog::store::CatalogStore;
use jiff::Timestamp;
use uuid::Uuid;

use crate::mounts::{self, DeviceAttrs, MountEntry};

const DEFAULT_MIN_FREE_BYTES: i64 = 100 * 1_000_000_000;
const STALE_SCAN_HOURS: i64 = 25;

/// The low end of the size-adjustment window; see the priority-bands rule.
const SIZE_ADJUSTMENT_MAX: i64 = 10;

/// `system_config` keys for the live-adjustable minimum-free-space and
/// priority-band tunables (§6).
const MINIMUM_FREE_SPACE_GB_KEY: &str = "minimum_free_space_gb";
const PRIORITY_EXTERNAL_KEY: &str = "priority_external";
const PRIORITY_MOUNTED_KEY: &str = "priority_mounted";
const PRIORITY_SATA_KEY: &str = "priority_sata";
const PRIORITY_NVME_KEY: &str = "priority_nvme";
const PRIORITY_ROOT_KEY: &str = "priority_root";

/// The top of the root/unknown priority band. Unlike the other bands, it has
/// no "next band" to derive an end from, so it stays a fixed ceiling.
const ROOT_BAND_CEILING: i64 = 999;

pub struct DiskPoolManager<C: CatalogStore> {
    catalog: Arc<C>,
    clock: Arc<dyn Clock>,
    mounts_path: PathBuf,
    sys_block_path: PathBuf,
    /// Used only when `system_config["minimum_free_space_gb"]` is unset.
    default_min_free_bytes: i64,
}

impl<C: CatalogStore> DiskPoolManager<C> {
    pub fn new(catalog: Arc<C>, clock: Arc<dyn Clock>) -> Self {
        DiskPoolManager {
            catalog,
            clock,
            mounts_path: PathBuf::from("/proc/mounts"),
            sys_block_path: PathBuf::from("/sys/block"),
            default_min_free_bytes: DEFAULT_MIN_FREE_BYTES,
        }
    }

    /// Overrides the `/proc/mounts` and `/sys/block` paths and minimum free
    /// space; used by tests to point at a scratch tree instead of the real
    /// system.
    pub fn with_paths(mut self, mounts_path: PathBuf, sys_block_path: PathBuf) -> Self {
        self.mounts_path = mounts_path;
        self.sys_block_path = sys_block_path;
        self
    }

    /// Sets the fallback minimum free space consulted when no
    /// `minimum_free_space_gb` row exists in `system_config`.
    pub fn with_min_free_bytes(mut self, min_free_bytes: i64) -> Self {
        self.default_min_free_bytes = min_free_bytes;
        self
    }

    /// The live minimum-free-space floor (§4.A), read from `system_config`
    /// on every call so operators can retune it without a restart; falls
    /// back to `default_min_free_bytes` only when the row is absent.
    async fn effective_min_free_bytes(&self) -> Result<i64, Error> {
        match self.catalog.get_config(MINIMUM_FREE_SPACE_GB_KEY).await? {
            None => Ok(self.default_min_free_bytes),
            Some(ConfigValue::Int(gb)) => Ok(gb * 1_000_000_000),
            Some(_) => Err(err!(Invariant, "{MINIMUM_FREE_SPACE_GB_KEY} config row has the wrong type")),
        }
    }

    /// The live priority-band boundaries (§6 `priority_{external,mounted,
    /// nvme,sata,root}`), read from `system_config` on every call; each band
    /// falls back independently to `DiskType`'s compile-time default when its
    /// key is absent.
    async fn priority_bands(&self) -> Result<PriorityBands, Error> {
        let defaults = PriorityBands::default();
        Ok(PriorityBands {
            external: self.config_band_start(PRIORITY_EXTERNAL_KEY, defaults.external).await?,
            mounted_storage: self.config_band_start(PRIORITY_MOUNTED_KEY, defaults.mounted_storage).await?,
            internal_sata: self.config_band_start(PRIORITY_SATA_KEY, defaults.internal_sata).await?,
            internal_nvme: self.config_band_start(PRIORITY_NVME_KEY, defaults.internal_nvme).await?,
            root_filesystem: self.config_band_start(PRIORITY_ROOT_KEY, defaults.root_filesystem).await?,
        })
    }

    async fn config_band_start(&self, key: &str, default: i64) -> Result<i64, Error> {
        match self.catalog.get_config(key).await? {
            None => Ok(default),
            Some(ConfigValue::Int(n)) => Ok(n),
            Some(_) => Err(err!(Invariant, "{key} config row has the wrong type")),
        }
    }

    fn read_mount_table(&self) -> Result<Vec<MountEntry>, Error> {
        let contents = std::fs::read_to_string(&self.mounts_path)
            .map_err(|e| Error::wrap(base::ErrorKind::Transient, "reading mount table", e))?;
        Ok(mounts::parse_mounts(&contents))
    }

    fn read_device_attrs(&self, device: &str) -> Option<DeviceAttrs> {
        let name = mounts::block_device_name(device)?;
        let base = self.sys_block_path.join(&name);
        let removable = std::fs::read_to_string(base.join("removable")).ok()?;
        let rotational = std::fs::read_to_string(base.join("queue/rotational")).ok()?;
        Some(DeviceAttrs {
            removable: removable.trim() == "1",
            rotational: rotational.trim() == "1",
        })
    }

    /// Classifies `path` by finding its mount entry and the root filesystem's
    /// device in the current mount table.
    fn classify_path(&self, path: &Path) -> Result<DiskType, Error> {
        let table = self.read_mount_table()?;
        let root_device = table
            .iter()
            .find(|e| e.mount_point == Path::new("/"))
            .map(|e| e.device.clone());
        let entry = table
            .iter()
            .filter(|e| path.starts_with(&e.mount_point))
            .max_by_key(|e| e.mount_point.as_os_str().len());
        let Some(entry) = entry else {
            return Ok(DiskType::Unknown);
        };
        let attrs = self.read_device_attrs(&entry.device);
        let is_root_device = root_device.as_deref() == Some(entry.device.as_str());
        Ok(mounts::classify(&entry.mount_point, attrs, is_root_device))
    }

    fn statvfs(&self, path: &Path) -> Result<(i64, i64), Error> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| Error::wrap(base::ErrorKind::Transient, "statvfs", e))?;
        let frsize = stat.fragment_size() as i64;
        let total = stat.blocks() as i64 * frsize;
        let available = stat.blocks_available() as i64 * frsize;
        Ok((total, available))
    }

    async fn scan_one(&self, disk: &StorageDisk) -> Result<(), Error> {
        let path = Path::new(&disk.path);
        let (total, available) = self.statvfs(path)?;
        let disk_type = self.classify_path(path)?;
        let bands = self.priority_bands().await?;
        let priority = compute_priority(&bands, disk_type, total);
        self.catalog
            .update_disk_scan(
                disk.id,
                DiskScanUpdate {
                    disk_type,
                    total_space_bytes: total,
                    available_space_bytes: available,
                    priority,
                    last_scan_at: self.clock.now(),
                },
            )
            .await
    }

    /// `RegisterDisk(path, priority?)`: adds `path` to the pool, classifying
    /// and scanning it immediately.
    pub async fn register_disk(&self, path: &Path, priority: Option<i64>) -> Result<Uuid, Error> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::wrap(base::ErrorKind::InvalidArgument, format!("disk path {}", path.display()), e))?;
        if !metadata.is_dir() {
            return Err(err!(InvalidArgument, "disk path {} is not a directory", path.display()));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| err!(InvalidArgument, "disk path {} is not valid UTF-8", path.display()))?;
        let id = self.catalog.register_disk(path_str, priority.unwrap_or(500)).await?;
        if let Some(disk) = self.catalog.get_disk(id).await? {
            self.scan_one(&disk).await?;
        }
        Ok(id)
    }

    /// `Rescan()`: refreshes space and priority for every registered disk.
    pub async fn rescan(&self) -> Result<(), Error> {
        for disk in self.catalog.list_disks().await? {
            if let Err(e) = self.scan_one(&disk).await {
                tracing::warn!(disk_id = %disk.id, path = %disk.path, error = %e, "disk scan failed");
            }
        }
        Ok(())
    }

    /// `DiscoverNew()`: registers any real, non-system mount not already in
    /// the pool. Returns the number of disks newly registered.
    pub async fn discover_new(&self) -> Result<usize, Error> {
        let table = self.read_mount_table()?;
        let mut discovered = 0;
        for entry in &table {
            if mounts::is_system_mount(&entry.mount_point) || mounts::is_special_fs(&entry.fs_type) {
                continue;
            }
            if self
                .catalog
                .get_disk_by_path(entry.mount_point.to_string_lossy().as_ref())
                .await?
                .is_some()
            {
                continue;
            }
            match self.register_disk(&entry.mount_point, None).await {
                Ok(_) => discovered += 1,
                Err(e) => {
                    tracing::warn!(mount_point = %entry.mount_point.display(), error = %e, "failed to register discovered disk")
                }
            }
        }
        Ok(discovered)
    }

    /// `ActiveDiskPath()`.
    pub async fn active_disk_path(&self) -> Result<PathBuf, Error> {
        let disk = self
            .catalog
            .active_disk()
            .await?
            .ok_or_else(|| err!(NotFound, "no active disk has been selected"))?;
        Ok(PathBuf::from(disk.path))
    }

    /// Walks disks by priority ascending and selects the first with enough
    /// free space; fails with `ResourceExhausted` if none qualifies.
    pub async fn select_active(&self) -> Result<Uuid, Error> {
        let min_free_bytes = self.effective_min_free_bytes().await?;
        let disks = self.catalog.list_disks().await?;
        let chosen = disks
            .iter()
            .find(|d| d.available_space_bytes >= min_free_bytes)
            .ok_or_else(|| err!(ResourceExhausted, "no eligible disk with sufficient free space"))?;
        self.catalog.set_active_disk(chosen.id).await?;
        Ok(chosen.id)
    }

    /// `RecordingDir(camera)`: ensures `<active>/recordings/<camera>` exists.
    pub async fn recording_dir(&self, camera: &str) -> Result<(PathBuf, Uuid), Error> {
        let disk = self
            .catalog
            .active_disk()
            .await?
            .ok_or_else(|| err!(NotFound, "no active disk has been selected"))?;
        let dir = Path::new(&disk.path).join("recordings").join(camera);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::wrap(base::ErrorKind::Transient, format!("creating {}", dir.display()), e))?;
        Ok((dir, disk.id))
    }

    /// `HealthCheck()`.
    pub async fn health_check(&self) -> Result<Vec<HealthWarning>, Error> {
        let mut warnings = Vec::new();
        let now = self.clock.now();
        let min_free_bytes = self.effective_min_free_bytes().await?;
        for disk in self.catalog.list_disks().await? {
            let path = Path::new(&disk.path);
            if tokio::fs::metadata(path).await.is_err() {
                warnings.push(HealthWarning::PathUnreachable { disk_id: disk.id, path: disk.path.clone() });
                continue;
            }
            if disk.available_space_bytes < min_free_bytes {
                warnings.push(HealthWarning::LowSpace {
                    disk_id: disk.id,
                    path: disk.path.clone(),
                    available_bytes: disk.available_space_bytes,
                });
            }
            match disk.last_scan_at {
                None => warnings.push(HealthWarning::StaleScan { disk_id: disk.id, path: disk.path.clone(), last_scan_at: None }),
                Some(t) if now - t > jiff::SignedDuration::from_hours(STALE_SCAN_HOURS) => {
                    warnings.push(HealthWarning::StaleScan { disk_id: disk.id, path: disk.path.clone(), last_scan_at: Some(t) })
                }
                Some(_) => {}
            }
        }
        Ok(warnings)
    }
}

#[derive(Clone, Debug)]
pub enum HealthWarning {
    PathUnreachable { disk_id: Uuid, path: String },
    LowSpace { disk_id: Uuid, path: String, available_bytes: i64 },
    StaleScan { disk_id: Uuid, path: String, last_scan_at: Option<Timestamp> },
}

impl fmt::Display for HealthWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthWarning::PathUnreachable { path, .. } => write!(f, "disk path {path} is unreachable"),
            HealthWarning::LowSpace { path, available_bytes, .. } => {
                write!(f, "disk {path} has only {} bytes free", available_bytes)
            }
            HealthWarning::StaleScan { path, last_scan_at: None, .. } => {
                write!(f, "disk {path} has never been scanned")
            }
            HealthWarning::StaleScan { path, last_scan_at: Some(t), .. } => {
                write!(f, "disk {path} last scanned at {t}, over {STALE_SCAN_HOURS}h ago")
            }
        }
    }
}

/// Live priority-band boundaries (§6), one start per `DiskType`. Band ends
/// aren't stored: each band's end is the next band's start minus one, so
/// retuning one boundary can never open a gap or overlap between bands.
#[derive(Clone, Copy, Debug)]
struct PriorityBands {
    external: i64,
    mounted_storage: i64,
    internal_sata: i64,
    internal_nvme: i64,
    root_filesystem: i64,
}

impl Default for PriorityBands {
    fn default() -> Self {
        PriorityBands {
            external: DiskType::External.priority_band_start(),
            mounted_storage: DiskType::MountedStorage.priority_band_start(),
            internal_sata: DiskType::InternalSata.priority_band_start(),
            internal_nvme: DiskType::InternalNvme.priority_band_start(),
            root_filesystem: DiskType::RootFilesystem.priority_band_start(),
        }
    }
}

impl PriorityBands {
    fn start(&self, disk_type: DiskType) -> i64 {
        match disk_type {
            DiskType::External => self.external,
            DiskType::MountedStorage => self.mounted_storage,
            DiskType::InternalSata => self.internal_sata,
            DiskType::InternalNvme => self.internal_nvme,
            DiskType::RootFilesystem | DiskType::Unknown => self.root_filesystem,
        }
    }

    fn end(&self, disk_type: DiskType) -> i64 {
        let start = self.start(disk_type);
        [self.external, self.mounted_storage, self.internal_sata, self.internal_nvme, self.root_filesystem]
            .into_iter()
            .filter(|&s| s > start)
            .min()
            .map(|next_start| next_start - 1)
            .unwrap_or(ROOT_BAND_CEILING)
    }
}

/// `band_start + size-based adjustment`, clamped so it never crosses into
/// the next band. Larger disks get a smaller adjustment, so they sort
/// earlier (more preferred) within their band.
fn compute_priority(bands: &PriorityBands, disk_type: DiskType, total_bytes: i64) -> i64 {
    let band_start = bands.start(disk_type);
    let band_end = bands.end(disk_type);
    let size_gb = total_bytes as f64 / 1_000_000_000.0;
    let adjustment = (SIZE_ADJUSTMENT_MAX as f64 - (size_gb / 100.0).min(SIZE_ADJUSTMENT_MAX as f64)).max(0.0) as i64;
    (band_start + adjustment).min(band_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClock;
    use catalog::testutil::FakeCatalog;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(scratch: &TempDir) -> DiskPoolManager<FakeCatalog> {
        let catalog = Arc::new(FakeCatalog::new());
        let clock = Arc::new(SimulatedClock::new(Timestamp::UNIX_EPOCH));
        DiskPoolManager::new(catalog, clock).with_paths(
            scratch.path().join("mounts"),
            scratch.path().join("sys_block"),
        )
    }

    fn write_mounts(scratch: &TempDir, contents: &str) {
        fs::write(scratch.path().join("mounts"), contents).unwrap();
    }

    #[test]
    fn priority_prefers_larger_disks_within_band() {
        let bands = PriorityBands::default();
        let small = compute_priority(&bands, DiskType::External, 10_000_000_000);
        let large = compute_priority(&bands, DiskType::External, 2_000_000_000_000);
        assert!(large < small, "larger disk should sort earlier (more preferred)");
        assert!(large >= bands.start(DiskType::External));
        assert!(small <= bands.end(DiskType::External));
    }

    #[test]
    fn priority_never_crosses_band() {
        let bands = PriorityBands::default();
        let p = compute_priority(&bands, DiskType::RootFilesystem, 50_000_000_000_000);
        assert!(p <= bands.end(DiskType::RootFilesystem));
        assert!(p >= bands.start(DiskType::RootFilesystem));
    }

    #[tokio::test]
    async fn priority_bands_retune_live_without_restart() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.set_config("priority_external", ConfigValue::Int(900)).await.unwrap();
        let clock = Arc::new(SimulatedClock::new(Timestamp::UNIX_EPOCH));
        let mgr = DiskPoolManager::new(catalog, clock);
        let bands = mgr.priority_bands().await.unwrap();
        assert_eq!(bands.external, 900);
        // Unset bands still fall back to the documented defaults.
        assert_eq!(bands.mounted_storage, DiskType::MountedStorage.priority_band_start());
    }

    #[tokio::test]
    async fn minimum_free_space_retunes_live_without_restart() {
        let catalog = Arc::new(FakeCatalog::new());
        let id = catalog.register_disk("/mnt/a", 10).await.unwrap();
        catalog
            .update_disk_scan(
                id,
                DiskScanUpdate {
                    disk_type: DiskType::MountedStorage,
                    total_space_bytes: 1000,
                    available_space_bytes: 50 * 1_000_000_000,
                    priority: 10,
                    last_scan_at: Timestamp::UNIX_EPOCH,
                },
            )
            .await
            .unwrap();
        catalog.set_config("minimum_free_space_gb", ConfigValue::Int(10)).await.unwrap();
        let mgr = DiskPoolManager::new(catalog, Arc::new(SimulatedClock::new(Timestamp::UNIX_EPOCH)))
            .with_min_free_bytes(1_000_000_000_000);
        // The catalog-stored 10 GB floor wins over the builder's 1 TB
        // fallback, so this disk now qualifies.
        let chosen = mgr.select_active().await.unwrap();
        assert_eq!(chosen, id);
    }

    #[tokio::test]
    async fn register_disk_rejects_non_directory() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let file_path = scratch.path().join("not_a_dir");
        fs::write(&file_path, b"x").unwrap();
        let err = mgr.register_disk(&file_path, None).await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn select_active_picks_disk_with_enough_free_space() {
        let catalog = Arc::new(FakeCatalog::new());
        let small = catalog.register_disk("/mnt/small", 10).await.unwrap();
        let big = catalog.register_disk("/mnt/big", 20).await.unwrap();
        catalog
            .update_disk_scan(
                small,
                DiskScanUpdate {
                    disk_type: DiskType::MountedStorage,
                    total_space_bytes: 1000,
                    available_space_bytes: 50,
                    priority: 10,
                    last_scan_at: Timestamp::UNIX_EPOCH,
                },
            )
            .await
            .unwrap();
        catalog
            .update_disk_scan(
                big,
                DiskScanUpdate {
                    disk_type: DiskType::MountedStorage,
                    total_space_bytes: 1000,
                    available_space_bytes: 500,
                    priority: 20,
                    last_scan_at: Timestamp::UNIX_EPOCH,
                },
            )
            .await
            .unwrap();
        let mgr = DiskPoolManager::new(catalog, Arc::new(SimulatedClock::new(Timestamp::UNIX_EPOCH)))
            .with_min_free_bytes(100);
        let chosen = mgr.select_active().await.unwrap();
        assert_eq!(chosen, small, "lower priority number should win even though it has less free space, per priority-then-threshold rule");
        let _ = big;
    }

    #[tokio::test]
    async fn select_active_fails_when_nothing_has_enough_space() {
        let catalog = Arc::new(FakeCatalog::new());
        let id = catalog.register_disk("/mnt/a", 10).await.unwrap();
        catalog
            .update_disk_scan(
                id,
                DiskScanUpdate {
                    disk_type: DiskType::MountedStorage,
                    total_space_bytes: 1000,
                    available_space_bytes: 10,
                    priority: 10,
                    last_scan_at: Timestamp::UNIX_EPOCH,
                },
            )
            .await
            .unwrap();
        let mgr = DiskPoolManager::new(catalog, Arc::new(SimulatedClock::new(Timestamp::UNIX_EPOCH)))
            .with_min_free_bytes(1_000_000);
        let err = mgr.select_active().await.unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn discover_new_skips_system_and_special_mounts() {
        let scratch = TempDir::new().unwrap();
        fs::create_dir_all(scratch.path().join("mnt/backup")).unwrap();
        write_mounts(
            &scratch,
            &format!(
                "tmpfs /dev tmpfs rw 0 0\nproc /proc proc rw 0 0\n/dev/sdb1 {} ext4 rw 0 0\n",
                scratch.path().join("mnt/backup").display()
            ),
        );
        let mgr = manager(&scratch);
        let n = mgr.discover_new().await.unwrap();
        assert_eq!(n, 1);
    }
}

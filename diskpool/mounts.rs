// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mount-table parsing and disk-type classification.
//!
//! Split out from [`crate::pool`] so the classification rules can be unit
//! tested against literal strings instead of the real `/proc/mounts`.

use std::path::{Path, PathBuf};

use catalog::model::DiskType;

/// One row of `/proc/mounts`: `device mount_point fs_type options dump pass`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Mount points under these prefixes are never candidate recording disks.
const SYSTEM_MOUNT_PREFIXES: &[&str] = &[
    "/proc", "/sys", "/run", "/dev", "/boot", "/snap", "/var", "/tmp",
];

/// Filesystem types that never back a real disk.
const SPECIAL_FS_TYPES: &[&str] = &["tmpfs", "squashfs", "ramfs", "devtmpfs", "overlay", "proc", "sysfs"];

pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// `/proc/mounts` escapes spaces etc. as `\040`; undo that for the common case.
fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(n) = u8::from_str_radix(&s[i + 1..i + 4], 8) {
                out.push(n as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

pub fn is_system_mount(mount_point: &Path) -> bool {
    if mount_point == Path::new("/") {
        return true;
    }
    SYSTEM_MOUNT_PREFIXES
        .iter()
        .any(|prefix| mount_point.starts_with(prefix))
}

pub fn is_special_fs(fs_type: &str) -> bool {
    SPECIAL_FS_TYPES.contains(&fs_type)
}

/// Strips a `/dev/` prefix and any trailing partition number, so
/// `/dev/sda1` and `/dev/nvme0n1p1` both resolve to the whole-disk name
/// `/sys/block` expects (`sda`, `nvme0n1`).
pub fn block_device_name(device: &str) -> Option<String> {
    let name = device.strip_prefix("/dev/")?;
    if let Some(stripped) = name.strip_suffix(char::is_numeric) {
        // only strip if this looks like an nvme/mmc partition suffix "pN"
        if let Some(base) = stripped.strip_suffix('p') {
            if base.chars().last().map(char::is_numeric).unwrap_or(false) {
                return Some(base.to_string());
            }
        }
    }
    // sdXN / hdXN: trim trailing digits from a letter-suffixed device.
    let trimmed = name.trim_end_matches(|c: char| c.is_numeric());
    if trimmed != name && trimmed.chars().last().map(char::is_alphabetic).unwrap_or(false) {
        return Some(trimmed.to_string());
    }
    Some(name.to_string())
}

/// The `removable`/`rotational` attributes `/sys/block/<dev>/...` exposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceAttrs {
    pub removable: bool,
    pub rotational: bool,
}

/// Classifies a mount point given the block device attributes for its
/// backing device (`None` if they could not be read) and whether that
/// device also backs the root filesystem.
pub fn classify(mount_point: &Path, attrs: Option<DeviceAttrs>, is_root_device: bool) -> DiskType {
    if is_root_device {
        return DiskType::RootFilesystem;
    }
    if let Some(a) = attrs {
        if a.removable {
            return DiskType::External;
        }
    }
    if mount_point.starts_with("/mnt") {
        return DiskType::MountedStorage;
    }
    match attrs {
        Some(a) if a.rotational => DiskType::InternalSata,
        Some(_) => DiskType::InternalNvme,
        None => DiskType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_proc_mounts_line() {
        let entries = parse_mounts("/dev/sda1 /mnt/backup ext4 rw,relatime 0 0\n");
        assert_eq!(
            entries,
            vec![MountEntry {
                device: "/dev/sda1".into(),
                mount_point: "/mnt/backup".into(),
                fs_type: "ext4".into(),
            }]
        );
    }

    #[test]
    fn unescapes_space_in_mount_point() {
        let entries = parse_mounts("/dev/sdb1 /mnt/My\\040Disk ext4 rw 0 0\n");
        assert_eq!(entries[0].mount_point, PathBuf::from("/mnt/My Disk"));
    }

    #[test]
    fn skips_system_and_special_mounts() {
        assert!(is_system_mount(Path::new("/proc")));
        assert!(is_system_mount(Path::new("/sys/fs/cgroup")));
        assert!(is_system_mount(Path::new("/")));
        assert!(!is_system_mount(Path::new("/mnt/backup")));
        assert!(is_special_fs("tmpfs"));
        assert!(!is_special_fs("ext4"));
    }

    #[test]
    fn strips_partition_suffix() {
        assert_eq!(block_device_name("/dev/sda1").as_deref(), Some("sda"));
        assert_eq!(block_device_name("/dev/nvme0n1p1").as_deref(), Some("nvme0n1"));
        assert_eq!(block_device_name("/dev/sda").as_deref(), Some("sda"));
    }

    #[test]
    fn classifies_removable_as_external() {
        let attrs = Some(DeviceAttrs { removable: true, rotational: false });
        assert_eq!(classify(Path::new("/media/usb"), attrs, false), DiskType::External);
    }

    #[test]
    fn classifies_mnt_prefix_as_mounted_storage() {
        let attrs = Some(DeviceAttrs { removable: false, rotational: true });
        assert_eq!(classify(Path::new("/mnt/archive"), attrs, false), DiskType::MountedStorage);
    }

    #[test]
    fn classifies_rotational_vs_nvme() {
        let hdd = Some(DeviceAttrs { removable: false, rotational: true });
        let ssd = Some(DeviceAttrs { removable: false, rotational: false });
        assert_eq!(classify(Path::new("/data"), hdd, false), DiskType::InternalSata);
        assert_eq!(classify(Path::new("/data"), ssd, false), DiskType::InternalNvme);
    }

    #[test]
    fn root_device_wins_over_everything() {
        let attrs = Some(DeviceAttrs { removable: true, rotational: false });
        assert_eq!(classify(Path::new("/"), attrs, true), DiskType::RootFilesystem);
    }

    #[test]
    fn unreadable_attrs_without_mnt_prefix_is_unknown() {
        assert_eq!(classify(Path::new("/data"), None, false), DiskType::Unknown);
    }
}

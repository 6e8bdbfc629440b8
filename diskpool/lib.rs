// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Discovers, classifies, and prioritizes storage disks, and picks the
//! single active disk that new recordings land on.

mod mounts;
mod pool;

pub use mounts::{classify, is_special_fs, is_system_mount, parse_mounts, DeviceAttrs, MountEntry};
pub use pool::{DiskPoolManager, HealthWarning};

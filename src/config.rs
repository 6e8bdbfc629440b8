// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-startup configuration (§10.3): settings that aren't sensibly
//! stored in the Catalog because they're needed before it's even opened,
//! or because they describe this process's environment rather than
//! appliance-wide tunables. Appliance-wide tunables (chunk duration,
//! retention, priority bands) live in `system_config` instead; see
//! `catalog::model::ConfigValue`.

use std::path::{Path, PathBuf};

use base::{Error, ErrorKind};
use serde::Deserialize;

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/keystone-nvr/catalog.db")
}
fn default_ffmpeg_binary() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_watermark_binary() -> PathBuf {
    PathBuf::from("keystone-watermark")
}
fn default_preview_binary() -> PathBuf {
    PathBuf::from("keystone-preview")
}
fn default_thumbnail_binary() -> PathBuf {
    PathBuf::from("keystone-thumbnail")
}
fn default_chunk_build_concurrency() -> usize {
    2
}
fn default_clip_local_retention_hours() -> i64 {
    72
}
fn default_disk_scan_interval_minutes() -> i64 {
    15
}
fn default_true() -> bool {
    true
}
fn default_outbound_concurrency() -> usize {
    3
}
fn default_dispatch_interval_secs() -> u64 {
    5
}
fn default_probe_interval_secs() -> u64 {
    20
}

/// Everything a fresh process needs before it can open the Catalog and
/// start scheduling work. Parsed from a TOML file (teacher's `toml`
/// dependency) at a path given on the command line, defaulting to
/// `/etc/keystone-nvr.toml`.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Camera names this appliance records; the external capture process
    /// is assumed to register segments under exactly these names.
    #[serde(default)]
    pub cameras: Vec<String>,

    #[serde(default = "default_chunk_build_concurrency")]
    pub chunk_build_concurrency: usize,
    #[serde(default = "default_clip_local_retention_hours")]
    pub clip_local_retention_hours: i64,

    #[serde(default = "default_disk_scan_interval_minutes")]
    pub disk_scan_interval_minutes: i64,

    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: PathBuf,
    #[serde(default = "default_watermark_binary")]
    pub watermark_binary: PathBuf,
    #[serde(default = "default_preview_binary")]
    pub preview_binary: PathBuf,
    #[serde(default = "default_thumbnail_binary")]
    pub thumbnail_binary: PathBuf,
    #[serde(default = "default_true")]
    pub watermark_enabled: bool,

    pub object_store_base_url: String,
    pub notify_endpoint: String,

    #[serde(default)]
    pub connectivity_probe_urls: Vec<String>,
    #[serde(default)]
    pub connectivity_dns_hostname: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub connectivity_probe_interval_secs: u64,

    #[serde(default = "default_outbound_concurrency")]
    pub outbound_concurrency: usize,
    #[serde(default = "default_dispatch_interval_secs")]
    pub outbound_dispatch_interval_secs: u64,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::wrap(ErrorKind::InvalidArgument, format!("reading config file {}", path.display()), e))?;
        toml::from_str(&text).map_err(|e| Error::wrap(ErrorKind::InvalidArgument, format!("parsing config file {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_everything_but_the_required_endpoints() {
        let cfg: AppConfig = toml::from_str(
            r#"
            object_store_base_url = "https://cdn.example"
            notify_endpoint = "https://booking.example/notify"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.db_path, default_db_path());
        assert_eq!(cfg.clip_local_retention_hours, 72);
        assert!(cfg.watermark_enabled);
        assert!(cfg.cameras.is_empty());
    }

    #[test]
    fn parses_a_fully_specified_config() {
        let cfg: AppConfig = toml::from_str(
            r#"
            db_path = "/data/catalog.db"
            cameras = ["front-door", "parking-lot"]
            clip_local_retention_hours = 48
            object_store_base_url = "https://cdn.example"
            notify_endpoint = "https://booking.example/notify"
            connectivity_probe_urls = ["https://cdn.example/healthz"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cameras, vec!["front-door".to_string(), "parking-lot".to_string()]);
        assert_eq!(cfg.clip_local_retention_hours, 48);
        assert_eq!(cfg.connectivity_probe_urls.len(), 1);
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `disk list|add|scan|status` (§10.4): thin CLI surface over
//! [`diskpool::DiskPoolManager`].

use std::path::PathBuf;

use base::clock::SystemClock;
use base::Error;
use bpaf::{construct, Parser};
use catalog::store::CatalogStore as _;
use diskpool::DiskPoolManager;
use std::sync::Arc;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub enum Args {
    List { config: PathBuf },
    Add { config: PathBuf, path: PathBuf, priority: Option<i64> },
    Scan { config: PathBuf },
    Status { config: PathBuf },
}

pub fn args() -> impl Parser<Args> {
    let config = super::parse_config_path();
    let list = construct!(Args::List { config }).to_options().command("list").help("Lists registered disks by priority.");

    let config = super::parse_config_path();
    let path = bpaf::long("path").help("Filesystem path to register.").argument::<PathBuf>("PATH");
    let priority = bpaf::long("priority").help("Overrides the computed priority.").argument::<i64>("N").optional();
    let add = construct!(Args::Add { config, path, priority })
        .to_options()
        .command("add")
        .help("Registers a new disk and scans it immediately.");

    let config = super::parse_config_path();
    let scan = construct!(Args::Scan { config })
        .to_options()
        .command("scan")
        .help("Rescans every registered disk for free space and classification.");

    let config = super::parse_config_path();
    let status = construct!(Args::Status { config })
        .to_options()
        .command("status")
        .help("Reports disks with low space, stale scans, or unreachable paths.");

    construct!([list, add, scan, status]).to_options().command("disk").help("Manage the storage disk pool.")
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().map_err(|e| {
        Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e)
    })?;
    rt.block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<i32, Error> {
    match args {
        Args::List { config } => {
            let config = AppConfig::load(&config)?;
            let catalog = super::open_catalog(&config.db_path)?;
            for disk in catalog.list_disks().await? {
                println!(
                    "{}\t{}\tpriority={}\ttype={}\tactive={}\tfree={}/{}",
                    disk.id,
                    disk.path,
                    disk.priority,
                    disk.disk_type.as_str(),
                    disk.is_active,
                    base::strutil::encode_size(disk.available_space_bytes),
                    base::strutil::encode_size(disk.total_space_bytes),
                );
            }
            Ok(0)
        }
        Args::Add { config, path, priority } => {
            let config = AppConfig::load(&config)?;
            let catalog = super::open_catalog(&config.db_path)?;
            let mgr = DiskPoolManager::new(catalog, Arc::new(SystemClock));
            let id = mgr.register_disk(&path, priority).await?;
            println!("registered disk {id} at {}", path.display());
            Ok(0)
        }
        Args::Scan { config } => {
            let config = AppConfig::load(&config)?;
            let catalog = super::open_catalog(&config.db_path)?;
            let mgr = DiskPoolManager::new(catalog, Arc::new(SystemClock));
            let discovered = mgr.discover_new().await?;
            mgr.rescan().await?;
            println!("rescanned all disks; {discovered} newly discovered");
            Ok(0)
        }
        Args::Status { config } => {
            let config = AppConfig::load(&config)?;
            let catalog = super::open_catalog(&config.db_path)?;
            let mgr = DiskPoolManager::new(catalog, Arc::new(SystemClock));
            let warnings = mgr.health_check().await?;
            if warnings.is_empty() {
                println!("all disks healthy");
                return Ok(0);
            }
            for w in &warnings {
                println!("{w}");
            }
            Ok(1)
        }
    }
}

// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! One module per top-level subcommand (§10.4), mirroring the teacher's
//! `src/cmds/{check,config,init,...}` layout.

use std::path::PathBuf;
use std::sync::Arc;

use base::{Error, ErrorKind};
use catalog::SqliteCatalog;

pub mod chunks;
pub mod disk;
pub mod init;
pub mod queue;
pub mod run;
pub mod upgrade;

pub fn parse_config_path() -> impl bpaf::Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the AppConfig TOML file.")
        .argument::<PathBuf>("PATH")
        .fallback(PathBuf::from("/etc/keystone-nvr.toml"))
        .debug_fallback()
}

/// Opens the Catalog at `db_path`, applying migrations if needed (the same
/// idempotent path `init`/`upgrade` also exercise).
pub fn open_catalog(db_path: &std::path::Path) -> Result<Arc<SqliteCatalog>, Error> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::wrap(ErrorKind::Transient, format!("creating {}", parent.display()), e))?;
    }
    Ok(Arc::new(SqliteCatalog::open(db_path)?))
}

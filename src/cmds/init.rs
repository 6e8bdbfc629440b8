// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use tracing::info;

/// Creates the Catalog database and its schema if they don't exist yet.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    #[bpaf(external(super::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = crate::config::AppConfig::load(&args.config)?;
    super::open_catalog(&config.db_path)?;
    info!(db_path = %config.db_path.display(), "catalog initialized");
    Ok(0)
}

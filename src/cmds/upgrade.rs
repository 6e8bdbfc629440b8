// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use tracing::info;

/// Runs any pending schema migrations. `SqliteCatalog::open` already does
/// this on every startup; this subcommand exists so an operator can run it
/// explicitly (and see the result) before starting the long-running
/// process, per the conventional init/upgrade/run split.
#[derive(Bpaf, Debug)]
#[bpaf(command("upgrade"))]
pub struct Args {
    #[bpaf(external(super::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = crate::config::AppConfig::load(&args.config)?;
    super::open_catalog(&config.db_path)?;
    info!(db_path = %config.db_path.display(), version = catalog::EXPECTED_SCHEMA_VERSION, "catalog schema is current");
    Ok(0)
}

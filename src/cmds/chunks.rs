// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `chunks stats|cleanup` (§10.4, §10.6): coalesced-chunk visibility and
//! retention, driven by the same [`archive::ChunkCoalescer`] the `run`
//! scheduler uses.

use std::path::PathBuf;
use std::sync::Arc;

use archive::{ChunkCoalescer, FfmpegRunner};
use base::clock::SystemClock;
use base::Error;
use bpaf::{construct, Parser};
use catalog::store::CatalogStore;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub enum Args {
    Stats { config: PathBuf },
    Cleanup { config: PathBuf },
}

pub fn args() -> impl Parser<Args> {
    let config = super::parse_config_path();
    let stats = construct!(Args::Stats { config }).to_options().command("stats").help("Per-camera watermark and chunk counts.");
    let config = super::parse_config_path();
    let cleanup = construct!(Args::Cleanup { config }).to_options().command("cleanup").help("Deletes chunks past the configured retention.");
    construct!([stats, cleanup]).to_options().command("chunks").help("Inspect and clean up coalesced chunks.")
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e))?;
    rt.block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<i32, Error> {
    match args {
        Args::Stats { config } => {
            let config = AppConfig::load(&config)?;
            let catalog = super::open_catalog(&config.db_path)?;
            for camera in &config.cameras {
                let watermark = catalog.get_watermark(camera).await?;
                match watermark {
                    Some(w) => println!("{camera}\twatermark={w}"),
                    None => println!("{camera}\twatermark=(none)"),
                }
            }
            Ok(0)
        }
        Args::Cleanup { config } => {
            let config = AppConfig::load(&config)?;
            let catalog = super::open_catalog(&config.db_path)?;
            let disk = catalog
                .active_disk()
                .await?
                .ok_or_else(|| base::err!(NotFound, "no active disk has been selected"))?;
            let coalescer = ChunkCoalescer::new(catalog, Arc::new(SystemClock), FfmpegRunner::new(config.ffmpeg_binary.clone()));
            let removed = coalescer.clean_up_aged_chunks(std::path::Path::new(&disk.path)).await?;
            println!("removed {removed} aged chunks");
            Ok(0)
        }
    }
}

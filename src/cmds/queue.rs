// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `queue stats` (§10.4, §10.6): a snapshot of the outbound task queue.

use std::path::PathBuf;
use std::sync::Arc;

use base::clock::SystemClock;
use base::Error;
use bpaf::{construct, Parser};
use outbound::{ConnectivityMonitor, HttpProber, OutboundQueue, ReqwestNotifyClient, ReqwestObjectStoreClient};

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub enum Args {
    Stats { config: PathBuf },
}

pub fn args() -> impl Parser<Args> {
    let config = super::parse_config_path();
    let stats = construct!(Args::Stats { config }).to_options().command("stats").help("Prints pending/active/processed task counts.");
    construct!([stats]).to_options().command("queue").help("Inspect the outbound task queue.")
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e))?;
    rt.block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<i32, Error> {
    let Args::Stats { config } = args;
    let config = AppConfig::load(&config)?;
    let catalog = super::open_catalog(&config.db_path)?;
    let object_store = Arc::new(ReqwestObjectStoreClient::new(config.object_store_base_url.clone()));
    let notify = Arc::new(ReqwestNotifyClient::new(config.notify_endpoint.clone()));
    let prober = HttpProber::new(
        config.connectivity_probe_urls.clone(),
        config.connectivity_dns_hostname.clone().unwrap_or_else(|| "cloudflare.com".to_string()),
    );
    let connectivity = Arc::new(ConnectivityMonitor::new(prober));
    connectivity.probe_once().await;
    let queue = OutboundQueue::new(catalog, object_store, notify, connectivity, Arc::new(SystemClock));
    let stats = queue.stats().await?;
    println!("online:\t\t{}", stats.online);
    println!("pending:\t{}", stats.pending);
    println!("active:\t\t{}", stats.active);
    println!("processed:\t{}", stats.processed);
    println!("concurrency:\t{}", stats.concurrency);
    match stats.last_processed_at {
        Some(t) => println!("last processed:\t{t}"),
        None => println!("last processed:\t(never)"),
    }
    Ok(0)
}

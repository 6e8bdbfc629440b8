// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `run` (§10.4): the long-running scheduler. Clip requests themselves are
//! out of scope here (per §1/§5 they're invoked synchronously by whatever
//! external request-handling layer owns the booking/admin API, calling
//! [`archive::ClipExtractor::extract`] directly against the same Catalog);
//! this command drives only the background loops that keep the archive and
//! outbound queue healthy: chunk coalescing, disk rescans, outbound
//! dispatch, connectivity probing, and the two retention sweeps.

use std::path::PathBuf;
use std::sync::Arc;

use archive::{ChunkCoalescer, ClipRetention, FfmpegRunner};
use base::clock::SystemClock;
use base::Error;
use bpaf::Bpaf;
use diskpool::DiskPoolManager;
use jiff::SignedDuration;
use outbound::{ConnectivityMonitor, HttpProber, OutboundQueue, ReqwestNotifyClient, ReqwestObjectStoreClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(super::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e))?;
    rt.block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<i32, Error> {
    let config = AppConfig::load(&args.config)?;
    let catalog = super::open_catalog(&config.db_path)?;
    let clock = Arc::new(SystemClock);

    let cancel = base::shutdown::token();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            ctrl_c_token.cancel();
        }
    });

    let disk_pool = Arc::new(DiskPoolManager::new(catalog.clone(), clock.clone()));

    let coalescer = Arc::new(ChunkCoalescer::new(
        catalog.clone(),
        clock.clone(),
        FfmpegRunner::new(config.ffmpeg_binary.clone()),
    ));

    let object_store = Arc::new(ReqwestObjectStoreClient::new(config.object_store_base_url.clone()));
    let notify = Arc::new(ReqwestNotifyClient::new(config.notify_endpoint.clone()));
    let prober = HttpProber::new(
        config.connectivity_probe_urls.clone(),
        config.connectivity_dns_hostname.clone().unwrap_or_else(|| "cloudflare.com".to_string()),
    );
    let connectivity = Arc::new(
        ConnectivityMonitor::new(prober).with_probe_interval(std::time::Duration::from_secs(config.connectivity_probe_interval_secs)),
    );
    connectivity.probe_once().await;

    let outbound_queue = Arc::new(
        OutboundQueue::new(catalog.clone(), object_store, notify, connectivity.clone(), clock.clone())
            .with_concurrency(config.outbound_concurrency),
    );

    let clip_retention = Arc::new(
        ClipRetention::new(catalog.clone(), clock.clone()).with_local_retention(SignedDuration::from_hours(config.clip_local_retention_hours)),
    );

    let tasks = [
        tokio::spawn(chunk_loop(coalescer.clone(), disk_pool.clone(), config.cameras.clone(), cancel.clone())),
        tokio::spawn(disk_scan_loop(disk_pool.clone(), config.disk_scan_interval_minutes, cancel.clone())),
        tokio::spawn(dispatch_loop(outbound_queue.clone(), config.outbound_dispatch_interval_secs, cancel.clone())),
        tokio::spawn(connectivity.clone().run(cancel.clone(), move || {})),
        tokio::spawn(retention_loop(clip_retention, disk_pool.clone(), cancel.clone())),
        tokio::spawn(chunk_retention_loop(coalescer, disk_pool, cancel.clone())),
    ];

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }

    Ok(0)
}

async fn chunk_loop<C: catalog::CatalogStore + 'static>(
    coalescer: Arc<ChunkCoalescer<C>>,
    disk_pool: Arc<DiskPoolManager<C>>,
    cameras: Vec<String>,
    cancel: CancellationToken,
) {
    loop {
        for camera in &cameras {
            if base::shutdown::check(&cancel).is_err() {
                return;
            }
            let Ok((disk_root, disk_id)) = disk_pool.recording_dir(camera).await else {
                warn!(%camera, "no active disk available for chunk coalescing");
                continue;
            };
            match coalescer.run_once(camera, disk_id, &disk_root).await {
                Ok(outcome) => info!(%camera, ?outcome, "chunk coalesce tick"),
                Err(e) => warn!(%camera, error = %e, "chunk coalesce tick failed"),
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
        }
    }
}

async fn disk_scan_loop<C: catalog::CatalogStore + 'static>(disk_pool: Arc<DiskPoolManager<C>>, interval_minutes: i64, cancel: CancellationToken) {
    let interval = std::time::Duration::from_secs((interval_minutes.max(1) as u64) * 60);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = disk_pool.discover_new().await {
            warn!(error = %e, "disk discovery failed");
        }
        if let Err(e) = disk_pool.rescan().await {
            warn!(error = %e, "disk rescan failed");
        }
        for warning in disk_pool.health_check().await.unwrap_or_default() {
            warn!(%warning, "disk health warning");
        }
    }
}

async fn dispatch_loop<C, O, N, P>(queue: Arc<OutboundQueue<C, O, N, P>>, interval_secs: u64, cancel: CancellationToken)
where
    C: catalog::CatalogStore + 'static,
    O: outbound::ObjectStoreClient + 'static,
    N: outbound::NotifyClient + 'static,
    P: outbound::Prober + 'static,
{
    let interval = std::time::Duration::from_secs(interval_secs.max(1));
    loop {
        if let Err(e) = queue.dispatch_once().await {
            warn!(error = %e, "outbound dispatch tick failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn retention_loop<C: catalog::CatalogStore + 'static>(retention: Arc<ClipRetention<C>>, disk_pool: Arc<DiskPoolManager<C>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)) => {}
        }
        let Ok(disk_root) = disk_pool.active_disk_path().await else {
            warn!("no active disk available for clip retention sweep");
            continue;
        };
        match retention.run(&disk_root).await {
            Ok(removed) => info!(removed, "clip retention sweep complete"),
            Err(e) => warn!(error = %e, "clip retention sweep failed"),
        }
    }
}

async fn chunk_retention_loop<C: catalog::CatalogStore + 'static>(
    coalescer: Arc<ChunkCoalescer<C>>,
    disk_pool: Arc<DiskPoolManager<C>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)) => {}
        }
        let Ok(disk_root) = disk_pool.active_disk_path().await else {
            warn!("no active disk available for chunk retention sweep");
            continue;
        };
        match coalescer.clean_up_aged_chunks(&disk_root).await {
            Ok(removed) => info!(removed, "chunk retention sweep complete"),
            Err(e) => warn!(error = %e, "chunk retention sweep failed"),
        }
    }
}

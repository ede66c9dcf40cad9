use std::sync::Arc;

use clap::Parser;
use tokio::{spawn, sync::mpsc};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use remora::{
    args::Args,
    config::Config,
    disk::{Disk, DiskMsg},
    error::Error,
    magnet::Magnet,
    metainfo::MetaInfo,
    torrent::{Source, Torrent},
    tracker::ReqwestTransport,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let subscriber = FmtSubscriber::builder()
        .without_time()
        .with_target(false)
        .with_file(false)
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let args = Args::parse();

    let mut config = Config::load()?;
    if let Some(download_dir) = args.download_dir {
        config.download_dir = download_dir;
    }
    if let Some(resume_dir) = args.resume_dir {
        config.resume_dir = resume_dir;
    }
    config.validate()?;
    let config = Arc::new(config);

    info!("downloading into {:?}", config.download_dir);

    // magnet links are recognized by their prefix, everything else is
    // treated as a path to a .torrent file
    let source = if args.source.starts_with("magnet:?") {
        Source::Magnet(Magnet::new(&args.source)?)
    } else {
        let buf = std::fs::read(&args.source)?;
        Source::MetaInfo(Box::new(MetaInfo::from_bencode(&buf)?))
    };

    let (disk_tx, disk_rx) = mpsc::channel::<DiskMsg>(512);
    let mut disk = Disk::new(disk_rx, config.download_path());
    spawn(async move {
        if let Err(e) = disk.run().await {
            tracing::error!("disk stopped with an error: {e}");
        }
    });

    let mut torrent = Torrent::new(
        config,
        disk_tx,
        source,
        ReqwestTransport::new(),
        args.source.clone(),
    )?;
    torrent.run().await?;

    info!("done");
    Ok(())
}

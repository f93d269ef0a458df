//! The external driver: parses CLI flags, wires up logging, reads the
//! `.torrent` file, and runs the engine to completion or `Ctrl-C`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use bitsling::{Conf, Torrent};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bitsling", about = "A single-torrent BitTorrent (BEP 3) client")]
struct Args {
    /// Directory the downloaded file is written into.
    #[arg(long)]
    file_path: PathBuf,

    /// The local TCP port to listen for incoming peer connections on.
    #[arg(long)]
    port_num: u16,

    /// Path to the `.torrent` metainfo file to download.
    #[arg(long)]
    torrent_file: PathBuf,

    /// Connect directly to this peer, bypassing the tracker announce.
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Request the compact peer list format from the tracker.
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> bitsling::error::Result<()> {
    let bytes = std::fs::read(&args.torrent_file)?;
    let metainfo = bitsling::metainfo::Metainfo::from_bytes(&bytes)?;
    log::info!(
        "loaded torrent {:?}, {} pieces",
        metainfo.info.name,
        metainfo.info.piece_count()
    );

    let mut conf = Conf::new();
    conf.compact = args.compact;

    let torrent = Torrent::new(metainfo, args.file_path, args.port_num, conf).await?;
    let shutdown = torrent.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    torrent.run(args.peer).await
}

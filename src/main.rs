use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use anyhow::{bail, Result};
use clap::Parser;
use futures_util::StreamExt;
use log::info;

use atlas_transfer::api::setup_server;
use atlas_transfer::download::build_manager;
use atlas_transfer::download::config::Config;
use atlas_transfer::download::logger::setup_logger;
use atlas_transfer::download::source::HttpSource;
use atlas_transfer::download::status::TransferStatus;
use atlas_transfer::jobs::preview::FfmpegRenderer;
use atlas_transfer::progress_bar::ProgressBar;

use crate::cli::{CliArgs, Command};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = Config::load_or_default(Path::new(&args.config))?;
    setup_logger(config.log_file.as_deref())?;

    match args.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Get { url, destination } => get(config, &url, &destination).await,
    }
}

async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let listen_addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let source = Arc::new(HttpSource::new(&config.user_agent, config.request_timeout())?);
    let renderer = Arc::new(FfmpegRenderer::new(config.ffmpeg_bin.clone()));

    let (manager, scheduler) = build_manager(config, source, renderer)?;
    tokio::spawn(async move { scheduler.run().await });

    setup_server(manager, &listen_addr).await
}

async fn get(config: Config, url: &str, destination: &str) -> Result<()> {
    // one-shot download, nothing to restore
    let config = Config { state_file: None, ..config };
    let source = Arc::new(HttpSource::new(&config.user_agent, config.request_timeout())?);
    let renderer = Arc::new(FfmpegRenderer::new(config.ffmpeg_bin.clone()));
    let library_dir = config.library_dir.clone();

    let (manager, scheduler) = build_manager(config, source, renderer)?;
    tokio::spawn(async move { scheduler.run().await });

    let id = manager.enqueue(url, destination)?;
    let mut progress_bar = ProgressBar::new(100);
    let mut last = (Instant::now(), 0u64);
    let mut updates = Box::pin(manager.watch(id));
    let mut final_state = None;

    // leave a line for the bar to move up into
    println!();
    while let Some(transfer) = updates.next().await {
        let elapsed = last.0.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (transfer.bytes_transferred.saturating_sub(last.1) as f64 / elapsed) as u64
        } else {
            0
        };
        last = (Instant::now(), transfer.bytes_transferred);

        progress_bar.print(destination, transfer.bytes_transferred, transfer.total_size, speed)?;
        final_state = Some(transfer);
    }
    println!();

    match final_state {
        Some(transfer) if transfer.status == TransferStatus::Completed => {
            info!("Saved to {}", library_dir.join(&transfer.destination).display());
            Ok(())
        }
        Some(transfer) => bail!(
            "Transfer {} {}: {}",
            transfer.id,
            transfer.status,
            transfer.error.unwrap_or_default()
        ),
        None => bail!("Transfer {} disappeared", id),
    }
}

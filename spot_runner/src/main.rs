use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use spot_vision::{
    AnalysisConfig, BatchConfig, BatchDispatcher, BatchEvent, BoundaryPolicy, CancelFlag,
    discover_images,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spot_runner")]
#[command(about = "Detect bright objects in a folder of grayscale images")]
struct Cli {
    /// Folder containing .png, .jpg, .jpeg or .tiff images.
    #[arg(long)]
    input: PathBuf,
    /// Folder receiving the annotated images and statistics.csv.
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = spot_vision::config::DEFAULT_THRESHOLD)]
    threshold: f64,
    #[arg(long, default_value_t = spot_vision::config::DEFAULT_BLUR_SIGMA)]
    blur_sigma: f64,
    /// Images processed concurrently (defaults to the number of CPUs).
    #[arg(long)]
    workers: Option<usize>,
    /// Row-blocks per image (defaults to the number of CPUs).
    #[arg(long)]
    blocks: Option<usize>,
    /// Join objects that straddle two row-blocks instead of reporting each half.
    #[arg(long)]
    merge_boundaries: bool,
    /// Give up on an image after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Logging ---
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spot_vision=info,spot_runner=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // --- 2. Folder Selection ---
    let cli = Cli::parse();
    if !cli.input.is_dir() {
        bail!("input folder {} does not exist", cli.input.display());
    }
    let image_paths = discover_images(&cli.input)
        .with_context(|| format!("listing images in {}", cli.input.display()))?;
    if image_paths.is_empty() {
        println!("No images found in {}", cli.input.display());
        return Ok(());
    }

    // --- 3. Batch Configuration ---
    let analysis = AnalysisConfig {
        threshold: cli.threshold,
        blur_sigma: cli.blur_sigma,
        boundary_policy: if cli.merge_boundaries {
            BoundaryPolicy::Merge
        } else {
            BoundaryPolicy::Split
        },
    };
    let mut config = BatchConfig::new(image_paths, &cli.output)
        .with_analysis(analysis)
        .with_per_image_timeout(cli.timeout_secs.map(Duration::from_secs));
    if let Some(workers) = cli.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(blocks) = cli.blocks {
        config = config.with_block_count(blocks);
    }
    let total = config.image_paths.len();

    // --- 4. Cancellation on Ctrl-C ---
    let cancel = CancelFlag::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing images already in progress");
                cancel.cancel();
            }
        }
    });

    // --- 5. Run & Report ---
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = BatchDispatcher::new(config);
    let batch = tokio::spawn(async move { dispatcher.run(tx, cancel).await });

    let mut done = 0usize;
    while let Some(event) = rx.recv().await {
        match event {
            BatchEvent::Progress(progress) => {
                done += 1;
                println!("[{done}/{total}] {progress}");
            }
            BatchEvent::Completed(summary) => {
                if summary.cancelled {
                    println!(
                        "Processing cancelled: {} of {total} images submitted ({} ok, {} failed)",
                        summary.submitted, summary.succeeded, summary.failed
                    );
                } else {
                    println!(
                        "Processing complete: {} ok, {} failed",
                        summary.succeeded, summary.failed
                    );
                }
            }
            BatchEvent::Failed(reason) => eprintln!("Processing error: {reason}"),
        }
    }

    let summary = batch.await.context("batch task panicked")??;
    info!(output = %cli.output.display(), "results written");
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some images could not be processed");
    }
    Ok(())
}

//! feedercamd - feeder camera recording daemon
//!
//! This daemon:
//! 1. Loads the run configuration (file + environment overrides)
//! 2. Opens the capture device and the segment store
//! 3. Runs the motion analysis / segment loop until Ctrl-C or SIGTERM
//! 4. Discards (or retains, if configured) the open segment on shutdown

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use feedercam::{build_controller, run, FeederConfig, RunOptions};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "FEEDERCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Stop after this many loop ticks.
    #[arg(long)]
    max_ticks: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = FeederConfig::load_from(args.config.as_deref())?;

    log::info!(
        "feedercamd {} starting: feeder_id={} device={} strategy={:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.feeder_id,
        cfg.capture.device,
        cfg.recording.strategy
    );
    log::info!(
        "segments: {:?} -> {}/{}",
        cfg.segment_policy()?,
        cfg.recording.video_dir.display(),
        cfg.feeder_id
    );

    let mut controller = build_controller(&cfg)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })?;

    let options = RunOptions {
        poll_interval: cfg.runtime.poll_interval,
        stall_timeout: cfg.runtime.stall_timeout,
        max_ticks: args.max_ticks,
        ..RunOptions::default()
    };
    let summary = run(&mut controller, &options, &stop)?;

    log::info!(
        "feedercamd stopped: ticks={} frames={} kept={} discarded={} rejected={} dropped={}",
        summary.ticks,
        summary.stats.frames,
        summary.stats.kept,
        summary.stats.discarded,
        summary.stats.rejected,
        summary.stats.dropped
    );
    Ok(())
}

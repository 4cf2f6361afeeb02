//! snapshot - save one analysis frame as JPEG
//!
//! Used in the field to check framing and focus before leaving the unit
//! unattended. Reads the same configuration as the daemon.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use feedercam::{Camera, CaptureDevice, FeederConfig, Frame};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "FEEDERCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Output image path (default: ./snapshot_<feeder>_<ts>.jpg).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Frames to skip while exposure settles.
    #[arg(long, default_value_t = 10)]
    settle_frames: u32,
    /// Give up if no frame arrives within this many seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = FeederConfig::load_from(args.config.as_deref())?;
    let mut camera = Camera::open(cfg.capture_config())?;

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut seen = 0u32;
    let frame = loop {
        if let Some(frame) = camera.poll_low_res_frame()? {
            seen += 1;
            if seen > args.settle_frames {
                break frame;
            }
            continue;
        }
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "no frame from {} within {}s",
                cfg.capture.device,
                args.timeout_secs
            ));
        }
        std::thread::sleep(cfg.runtime.poll_interval);
    };

    let out = args.out.unwrap_or_else(|| {
        let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
        PathBuf::from(format!("snapshot_{}_{}.jpg", cfg.feeder_id, ts))
    });
    if let Some(dir) = out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    save_jpeg(&frame, &out)?;
    log::info!("saved snapshot to {}", out.display());
    Ok(())
}

fn save_jpeg(frame: &Frame, path: &Path) -> Result<()> {
    let image = image::GrayImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    image
        .save(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

//! feedercam
//!
//! Motion-gated segmented recording for an unattended feeder camera.
//!
//! # Architecture
//!
//! A single loop drives everything:
//!
//! 1. **Capture**: poll the device for a low-resolution analysis frame while
//!    its encoder writes the full-resolution stream to a staging file.
//! 2. **Background model**: exponentially decayed reference image; a frame is
//!    motion when enough pixels differ from it.
//! 3. **Activity tracker**: hysteresis window that smooths per-frame motion.
//! 4. **Strategy**: decides segment boundaries (fixed-length roll-over by
//!    default, or motion-gated start/stop).
//! 5. **Retention**: at close, a segment that saw motion is moved atomically
//!    into `{video_dir}/{feeder_id}/`; anything else is deleted.
//!
//! # Module Structure
//!
//! - `frame`, `background`, `activity`: analysis
//! - `segment`, `strategy`, `recorder`, `retention`: segment lifecycle
//! - `controller`, `runner`: per-tick control and the driver loop
//! - `capture`, `indicator`, `clock`: external collaborators
//! - `config`: run configuration

pub mod activity;
pub mod background;
pub mod capture;
pub mod clock;
pub mod config;
pub mod controller;
pub mod frame;
pub mod indicator;
pub mod recorder;
pub mod retention;
pub mod runner;
pub mod segment;
pub mod strategy;

use anyhow::Result;

pub use activity::ActivityTracker;
pub use background::{BackgroundModel, BackgroundParams};
pub use capture::{Camera, CaptureConfig, CaptureDevice, SyntheticCamera, SyntheticConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FeederConfig;
pub use controller::{
    ControllerConfig, ControllerStats, SegmentController, ShutdownAction, TickOutcome, TickReport,
};
pub use frame::Frame;
pub use indicator::{LogIndicator, StatusIndicator, SysfsLedIndicator};
pub use recorder::{ClosedSegment, Recorder};
pub use retention::{Retention, SegmentStore, StoreConfig};
pub use runner::{run, RunOptions, RunSummary};
pub use segment::{FeederId, FrameSample, Segment, SegmentPolicy};
pub use strategy::{FixedSegments, MotionGated, RecordingStrategy, StrategyKind};

/// Assemble a controller for real hardware (or a `stub://` device) from
/// configuration.
pub fn build_controller(cfg: &FeederConfig) -> Result<SegmentController> {
    let store = SegmentStore::open(cfg.feeder()?, cfg.store_config())?;
    let leftovers = store.leftovers()?;
    if !leftovers.is_empty() {
        log::warn!(
            "{} staged segment(s) left from a previous run in {}",
            leftovers.len(),
            store.staging_dir().display()
        );
        for path in &leftovers {
            log::warn!("  leftover: {}", path.display());
        }
    }

    let camera = Camera::open(cfg.capture_config())?;
    let indicator: Box<dyn StatusIndicator> =
        if cfg.status.liveness_led.is_some() || cfg.status.activity_led.is_some() {
            Box::new(SysfsLedIndicator::new(
                cfg.status.liveness_led.clone(),
                cfg.status.activity_led.clone(),
            ))
        } else {
            Box::new(LogIndicator::new())
        };
    let strategy = cfg.recording.strategy.build(cfg.segment_policy()?);

    SegmentController::new(
        cfg.controller_config(),
        Recorder::new(Box::new(camera), store),
        strategy,
        indicator,
        Box::new(SystemClock),
    )
}

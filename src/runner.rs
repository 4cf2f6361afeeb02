//! Driver loop around the segment controller.
//!
//! The loop ticks the controller until the stop flag is raised, sleeping
//! briefly whenever no frame is ready. A watchdog ends the run when no frame
//! has been analysed for `stall_timeout`; a stuck camera or encoder must not
//! go unnoticed.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::controller::{ControllerStats, SegmentController, TickOutcome};
use crate::recorder::ClosedSegment;
use crate::retention::Retention;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Pause after a tick without a frame.
    pub poll_interval: Duration,
    /// Longest tolerated gap between analysed frames.
    pub stall_timeout: Duration,
    pub health_interval: Duration,
    /// Stop after this many ticks (bench runs, tests).
    pub max_ticks: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            stall_timeout: Duration::from_secs(30),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            max_ticks: None,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub ticks: u64,
    pub stats: ControllerStats,
    /// Segment that was open when the run stopped.
    pub final_segment: Option<ClosedSegment>,
}

pub fn run(
    controller: &mut SegmentController,
    options: &RunOptions,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    let mut ticks = 0u64;
    let mut last_frame_at = Instant::now();
    let mut last_health_log = Instant::now();

    log::info!(
        "recording loop started (strategy={})",
        controller.strategy_name()
    );

    while !stop.load(Ordering::SeqCst) {
        if options.max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
        ticks += 1;

        match controller.tick() {
            TickOutcome::Processed(report) => {
                last_frame_at = Instant::now();
                for closed in &report.closed {
                    match &closed.retention {
                        Retention::Kept(path) => {
                            log::debug!("published {}", path.display())
                        }
                        Retention::Discarded => {
                            log::debug!("dropped {}", closed.file_name)
                        }
                    }
                }
            }
            TickOutcome::NoFrame => {
                check_stall(controller, last_frame_at, options.stall_timeout)?;
                std::thread::sleep(options.poll_interval);
            }
            TickOutcome::Rejected(err) => {
                log::warn!("frame rejected: {:#}", err);
                check_stall(controller, last_frame_at, options.stall_timeout)?;
            }
            TickOutcome::Fatal(err) => {
                log::error!("recording loop failed: {:#}", err);
                abort(controller);
                return Err(err);
            }
        }

        if last_health_log.elapsed() >= options.health_interval {
            let stats = controller.stats();
            log::info!(
                "health: frames={} misses={} rejected={} dropped={} kept={} discarded={} segment_frames={:?}",
                stats.frames,
                stats.misses,
                stats.rejected,
                stats.dropped,
                stats.kept,
                stats.discarded,
                controller.segment_frames()
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("recording loop stopping after {} ticks", ticks);
    let final_segment = controller.shutdown()?;
    Ok(RunSummary {
        ticks,
        stats: controller.stats(),
        final_segment,
    })
}

fn check_stall(
    controller: &mut SegmentController,
    last_frame_at: Instant,
    stall_timeout: Duration,
) -> Result<()> {
    let idle = last_frame_at.elapsed();
    if idle < stall_timeout {
        return Ok(());
    }
    let err = anyhow!(
        "no frame analysed for {:.1}s (stall timeout {:?})",
        idle.as_secs_f64(),
        stall_timeout
    );
    log::error!("{}", err);
    abort(controller);
    Err(err)
}

/// Best-effort cleanup after a failure; the original error wins.
fn abort(controller: &mut SegmentController) {
    if let Err(err) = controller.shutdown() {
        log::error!("cleanup after failure also failed: {:#}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::BackgroundParams;
    use crate::capture::SyntheticCamera;
    use crate::clock::SystemClock;
    use crate::controller::{ControllerConfig, ShutdownAction};
    use crate::frame::Frame;
    use crate::indicator::LogIndicator;
    use crate::recorder::Recorder;
    use crate::retention::{SegmentStore, StoreConfig};
    use crate::segment::{FeederId, SegmentPolicy};
    use crate::strategy::StrategyKind;
    use std::path::Path;

    fn controller(root: &Path, device: SyntheticCamera) -> Result<SegmentController> {
        let store = SegmentStore::open(
            FeederId::new("cam")?,
            StoreConfig {
                video_dir: root.join("videos"),
                staging_dir: root.join("staging"),
                extension: "h264".to_string(),
            },
        )?;
        SegmentController::new(
            ControllerConfig {
                background: BackgroundParams {
                    alpha: 0.9,
                    diff_threshold: 10.0,
                    area_threshold: 0.5,
                },
                activity_delay: Duration::from_secs(5),
                warmup: Duration::ZERO,
                on_shutdown: ShutdownAction::Discard,
            },
            Recorder::new(Box::new(device), store),
            StrategyKind::Fixed.build(SegmentPolicy::Frames(1_000)),
            Box::new(LogIndicator::new()),
            Box::new(SystemClock),
        )
    }

    #[test]
    fn stops_after_max_ticks_and_discards_open_segment() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let frames = (0..20).map(|_| Frame::filled(4, 4, 3).ok());
        let mut ctl = controller(temp_dir.path(), SyntheticCamera::scripted(frames))?;
        let options = RunOptions {
            max_ticks: Some(12),
            ..RunOptions::default()
        };

        let summary = run(&mut ctl, &options, &AtomicBool::new(false))?;
        assert_eq!(summary.ticks, 12);
        assert_eq!(summary.stats.frames, 12);
        let last = summary.final_segment.expect("open segment at stop");
        assert_eq!(last.frames, 12);
        assert_eq!(last.retention, Retention::Discarded);
        assert!(ctl.recorder().store().leftovers()?.is_empty());
        Ok(())
    }

    #[test]
    fn raised_stop_flag_ends_before_first_tick() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut ctl = controller(temp_dir.path(), SyntheticCamera::scripted(Vec::new()))?;
        let summary = run(&mut ctl, &RunOptions::default(), &AtomicBool::new(true))?;
        assert_eq!(summary.ticks, 0);
        assert!(summary.final_segment.is_none());
        Ok(())
    }

    #[test]
    fn stalled_device_ends_the_run() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut ctl = controller(temp_dir.path(), SyntheticCamera::scripted(Vec::new()))?;
        let options = RunOptions {
            poll_interval: Duration::from_millis(5),
            stall_timeout: Duration::from_millis(60),
            ..RunOptions::default()
        };
        let err = run(&mut ctl, &options, &AtomicBool::new(false)).unwrap_err();
        assert!(err.to_string().contains("no frame analysed"));
        Ok(())
    }
}

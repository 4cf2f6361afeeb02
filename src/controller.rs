//! Segment controller: one analysis tick at a time.
//!
//! Each tick polls the capture device, runs the background model and the
//! activity tracker, hands the resulting sample to the recording strategy and
//! updates the status indicator. Every tick reports an explicit outcome so the
//! driver can tell a transient capture miss from a rejected frame from a
//! failure that must end the run.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use crate::activity::ActivityTracker;
use crate::background::{BackgroundModel, BackgroundParams};
use crate::clock::Clock;
use crate::indicator::StatusIndicator;
use crate::recorder::{ClosedSegment, Recorder};
use crate::retention::Retention;
use crate::segment::FrameSample;
use crate::strategy::RecordingStrategy;

/// What happens to the open segment when the controller shuts down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Delete it; partial segments are of marginal value.
    #[default]
    Discard,
    /// Apply the normal retention decision.
    Retain,
}

impl ShutdownAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discard" => Some(Self::Discard),
            "retain" | "keep" => Some(Self::Retain),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub background: BackgroundParams,
    /// Hysteresis window of the activity tracker.
    pub activity_delay: Duration,
    /// Time after the first frame during which only the models run.
    pub warmup: Duration,
    pub on_shutdown: ShutdownAction,
}

/// Result of one controller tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// A frame was analysed.
    Processed(TickReport),
    /// No frame was ready; retry after a short pause.
    NoFrame,
    /// A frame arrived but could not be analysed. The run continues.
    Rejected(anyhow::Error),
    /// The run cannot continue safely.
    Fatal(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickReport {
    pub sample: FrameSample,
    /// True while the warm-up window is still open.
    pub warming_up: bool,
    /// Progress of the open segment after this tick.
    pub segment_frames: Option<u64>,
    /// Segments closed on this tick.
    pub closed: Vec<ClosedSegment>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub frames: u64,
    pub misses: u64,
    pub rejected: u64,
    /// Frames the capture device skipped before they reached the controller.
    pub dropped: u64,
    pub kept: u64,
    pub discarded: u64,
}

pub struct SegmentController {
    background: BackgroundModel,
    activity: ActivityTracker,
    recorder: Recorder,
    strategy: Box<dyn RecordingStrategy>,
    indicator: Box<dyn StatusIndicator>,
    clock: Box<dyn Clock>,
    warmup: TimeDelta,
    first_frame_at: Option<DateTime<Utc>>,
    on_shutdown: ShutdownAction,
    stats: ControllerStats,
    indicator_failing: bool,
}

impl SegmentController {
    pub fn new(
        config: ControllerConfig,
        recorder: Recorder,
        strategy: Box<dyn RecordingStrategy>,
        indicator: Box<dyn StatusIndicator>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        let warmup = TimeDelta::from_std(config.warmup)
            .map_err(|_| anyhow!("warm-up {:?} is out of range", config.warmup))?;
        Ok(Self {
            background: BackgroundModel::new(config.background)?,
            activity: ActivityTracker::new(config.activity_delay)?,
            recorder,
            strategy,
            indicator,
            clock,
            warmup,
            first_frame_at: None,
            on_shutdown: config.on_shutdown,
            stats: ControllerStats::default(),
            indicator_failing: false,
        })
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            dropped: self.recorder.dropped_frames(),
            ..self.stats
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Progress of the open segment, if one is open.
    pub fn segment_frames(&self) -> Option<u64> {
        self.strategy.current().map(|segment| segment.frames())
    }

    /// Run one analysis tick.
    pub fn tick(&mut self) -> TickOutcome {
        let frame = match self.recorder.poll_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.stats.misses += 1;
                return TickOutcome::NoFrame;
            }
            Err(err) => return TickOutcome::Fatal(err.context("poll capture device")),
        };
        let now = self.clock.now();

        let frame_motion = match self.background.update(&frame) {
            Ok(motion) => motion,
            Err(err) => {
                self.stats.rejected += 1;
                return TickOutcome::Rejected(err);
            }
        };
        self.activity.observe(frame_motion, now);
        let active = self.activity.is_active(now);
        log::trace!(
            "frame: changed={:.4} motion={} active={} last_motion={:?}",
            self.background.last_changed_fraction(),
            frame_motion,
            active,
            self.activity.last_active()
        );
        self.stats.frames += 1;

        let sample = FrameSample {
            frame_motion,
            active,
            at: now,
        };
        let first = *self.first_frame_at.get_or_insert(now);
        let warming_up = now.signed_duration_since(first) < self.warmup;

        let closed = if warming_up {
            Vec::new()
        } else {
            match self.strategy.on_sample(&mut self.recorder, &sample) {
                Ok(closed) => closed,
                Err(err) => return TickOutcome::Fatal(err),
            }
        };
        for segment in &closed {
            self.count(&segment.retention);
        }

        self.update_indicator(active);

        TickOutcome::Processed(TickReport {
            sample,
            warming_up,
            segment_frames: self.segment_frames(),
            closed,
        })
    }

    /// Stop recording. The open segment, if any, is discarded or retained
    /// according to the configured shutdown action.
    pub fn shutdown(&mut self) -> Result<Option<ClosedSegment>> {
        let Some(segment) = self.strategy.take_current() else {
            return Ok(None);
        };
        let closed = match self.on_shutdown {
            ShutdownAction::Discard => self.recorder.abandon_segment(segment)?,
            ShutdownAction::Retain => self.recorder.close_segment(segment)?,
        };
        self.count(&closed.retention);
        Ok(Some(closed))
    }

    fn count(&mut self, retention: &Retention) {
        match retention {
            Retention::Kept(_) => self.stats.kept += 1,
            Retention::Discarded => self.stats.discarded += 1,
        }
    }

    fn update_indicator(&mut self, active: bool) {
        let result = self
            .indicator
            .toggle_liveness()
            .and_then(|()| self.indicator.set_activity(active));
        match result {
            Ok(()) => self.indicator_failing = false,
            Err(err) if !self.indicator_failing => {
                log::warn!("status indicator update failed: {:#}", err);
                self.indicator_failing = true;
            }
            Err(err) => log::debug!("status indicator still failing: {:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureDevice, SyntheticCamera};
    use crate::clock::ManualClock;
    use crate::frame::Frame;
    use crate::indicator::LogIndicator;
    use crate::retention::{SegmentStore, StoreConfig};
    use crate::segment::{FeederId, SegmentPolicy};
    use crate::strategy::StrategyKind;
    use chrono::TimeZone;
    use std::path::Path;

    fn config(warmup: Duration, on_shutdown: ShutdownAction) -> ControllerConfig {
        ControllerConfig {
            background: BackgroundParams {
                alpha: 0.9,
                diff_threshold: 10.0,
                area_threshold: 0.5,
            },
            activity_delay: Duration::from_secs(5),
            warmup,
            on_shutdown,
        }
    }

    fn controller(
        root: &Path,
        device: Box<dyn CaptureDevice>,
        warmup: Duration,
        clock: ManualClock,
    ) -> Result<SegmentController> {
        controller_with(root, device, warmup, clock, ShutdownAction::Discard)
    }

    fn controller_with(
        root: &Path,
        device: Box<dyn CaptureDevice>,
        warmup: Duration,
        clock: ManualClock,
        on_shutdown: ShutdownAction,
    ) -> Result<SegmentController> {
        let store = SegmentStore::open(
            FeederId::new("cam")?,
            StoreConfig {
                video_dir: root.join("videos"),
                staging_dir: root.join("staging"),
                extension: "h264".to_string(),
            },
        )?;
        SegmentController::new(
            config(warmup, on_shutdown),
            Recorder::new(device, store),
            StrategyKind::Fixed.build(SegmentPolicy::Frames(5)),
            Box::new(LogIndicator::new()),
            Box::new(clock),
        )
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn missing_frame_is_transient() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let device = SyntheticCamera::scripted(vec![None, Some(Frame::filled(4, 4, 0)?)]);
        let mut ctl = controller(temp_dir.path(), Box::new(device), Duration::ZERO, clock())?;

        assert!(matches!(ctl.tick(), TickOutcome::NoFrame));
        assert!(matches!(ctl.tick(), TickOutcome::Processed(_)));
        assert_eq!(ctl.stats().misses, 1);
        assert_eq!(ctl.stats().frames, 1);
        Ok(())
    }

    #[test]
    fn mismatched_frame_is_rejected_not_fatal() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let device = SyntheticCamera::scripted(vec![
            Some(Frame::filled(4, 4, 0)?),
            Some(Frame::filled(2, 2, 0)?),
            Some(Frame::filled(4, 4, 0)?),
        ]);
        let mut ctl = controller(temp_dir.path(), Box::new(device), Duration::ZERO, clock())?;

        assert!(matches!(ctl.tick(), TickOutcome::Processed(_)));
        assert!(matches!(ctl.tick(), TickOutcome::Rejected(_)));
        assert!(matches!(ctl.tick(), TickOutcome::Processed(_)));
        assert_eq!(ctl.stats().rejected, 1);
        assert_eq!(ctl.segment_frames(), Some(2));
        Ok(())
    }

    #[test]
    fn warmup_defers_first_segment() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let frames = (0..10).map(|_| Frame::filled(4, 4, 0).ok());
        let clock = clock();
        let mut ctl = controller(
            temp_dir.path(),
            Box::new(SyntheticCamera::scripted(frames)),
            Duration::from_secs(2),
            clock.clone(),
        )?;

        for _ in 0..4 {
            match ctl.tick() {
                TickOutcome::Processed(report) => assert!(report.warming_up),
                other => panic!("unexpected outcome {:?}", other),
            }
            clock.advance(Duration::from_millis(500));
        }
        assert!(!ctl.recorder().is_encoding());

        match ctl.tick() {
            TickOutcome::Processed(report) => {
                assert!(!report.warming_up);
                assert_eq!(report.segment_frames, Some(1));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(ctl.recorder().is_encoding());
        Ok(())
    }

    struct BrokenEncoder;

    impl CaptureDevice for BrokenEncoder {
        fn start_encoding(&mut self, _path: &Path) -> Result<()> {
            Err(anyhow!("encoder hardware unavailable"))
        }

        fn stop_encoding(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_encoding(&self) -> bool {
            false
        }

        fn poll_low_res_frame(&mut self) -> Result<Option<Frame>> {
            Ok(Some(Frame::filled(4, 4, 0)?))
        }
    }

    #[test]
    fn encoder_start_failure_is_fatal() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut ctl = controller(temp_dir.path(), Box::new(BrokenEncoder), Duration::ZERO, clock())?;
        match ctl.tick() {
            TickOutcome::Fatal(err) => {
                assert!(format!("{:#}", err).contains("encoder hardware unavailable"))
            }
            other => panic!("expected fatal outcome, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn shutdown_discards_open_segment_by_default() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut pixels = vec![0u8; 16];
        pixels[..12].fill(255);
        let device = SyntheticCamera::scripted(vec![
            Some(Frame::filled(4, 4, 0)?),
            Some(Frame::new(4, 4, pixels)?),
        ]);
        let mut ctl = controller(temp_dir.path(), Box::new(device), Duration::ZERO, clock())?;
        ctl.tick();
        ctl.tick();

        let closed = ctl.shutdown()?.expect("open segment");
        assert!(closed.motion);
        assert_eq!(closed.retention, Retention::Discarded);
        assert!(!ctl.recorder().is_encoding());
        assert_eq!(std::fs::read_dir(ctl.recorder().store().output_dir())?.count(), 0);
        assert!(ctl.shutdown()?.is_none());
        Ok(())
    }

    #[test]
    fn shutdown_with_retain_publishes_motion_and_drops_quiet() -> Result<()> {
        let mut pixels = vec![0u8; 16];
        pixels[..12].fill(255);

        let loud_dir = tempfile::tempdir()?;
        let device = SyntheticCamera::scripted(vec![
            Some(Frame::filled(4, 4, 0)?),
            Some(Frame::new(4, 4, pixels)?),
        ]);
        let mut ctl = controller_with(
            loud_dir.path(),
            Box::new(device),
            Duration::ZERO,
            clock(),
            ShutdownAction::Retain,
        )?;
        ctl.tick();
        ctl.tick();
        let closed = ctl.shutdown()?.expect("open segment");
        let Retention::Kept(path) = &closed.retention else {
            panic!("motion segment should be published on retain");
        };
        assert!(path.exists());
        assert!(ctl.recorder().store().leftovers()?.is_empty());
        assert_eq!(ctl.stats().kept, 1);

        let quiet_dir = tempfile::tempdir()?;
        let device = SyntheticCamera::scripted(vec![
            Some(Frame::filled(4, 4, 0)?),
            Some(Frame::filled(4, 4, 0)?),
        ]);
        let mut ctl = controller_with(
            quiet_dir.path(),
            Box::new(device),
            Duration::ZERO,
            clock(),
            ShutdownAction::Retain,
        )?;
        ctl.tick();
        ctl.tick();
        let closed = ctl.shutdown()?.expect("open segment");
        assert_eq!(closed.retention, Retention::Discarded);
        assert!(ctl.recorder().store().leftovers()?.is_empty());
        assert_eq!(std::fs::read_dir(ctl.recorder().store().output_dir())?.count(), 0);
        assert_eq!(ctl.stats().discarded, 1);
        Ok(())
    }

    struct LossyCamera {
        inner: SyntheticCamera,
        dropped: u64,
    }

    impl CaptureDevice for LossyCamera {
        fn start_encoding(&mut self, path: &Path) -> Result<()> {
            self.inner.start_encoding(path)
        }

        fn stop_encoding(&mut self) -> Result<()> {
            self.inner.stop_encoding()
        }

        fn is_encoding(&self) -> bool {
            self.inner.is_encoding()
        }

        fn poll_low_res_frame(&mut self) -> Result<Option<Frame>> {
            self.dropped += 2;
            self.inner.poll_low_res_frame()
        }

        fn dropped_frames(&self) -> u64 {
            self.dropped
        }
    }

    #[test]
    fn stats_include_device_dropped_frames() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let device = LossyCamera {
            inner: SyntheticCamera::scripted(vec![Some(Frame::filled(4, 4, 0)?)]),
            dropped: 0,
        };
        let mut ctl = controller(temp_dir.path(), Box::new(device), Duration::ZERO, clock())?;
        ctl.tick();
        ctl.tick();
        let stats = ctl.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.dropped, 4);
        Ok(())
    }

    #[test]
    fn shutdown_action_parses() {
        assert_eq!(ShutdownAction::parse("discard"), Some(ShutdownAction::Discard));
        assert_eq!(ShutdownAction::parse("Retain"), Some(ShutdownAction::Retain));
        assert_eq!(ShutdownAction::parse("archive"), None);
    }
}

//! Segment boundary strategies.
//!
//! - `FixedSegments` (default): always recording; segments roll over at the
//!   policy target and each closed segment goes through retention. Encoder
//!   restarts happen only at boundaries, independent of detection noise.
//! - `MotionGated`: recording starts when activity begins, stops when it
//!   ends, and is force-split when a segment reaches the policy target while
//!   still active. Segments are motion-bearing by construction.

use anyhow::Result;

use crate::recorder::{ClosedSegment, Recorder};
use crate::segment::{FrameSample, Segment, SegmentPolicy};

pub trait RecordingStrategy: Send {
    fn name(&self) -> &'static str;

    /// Apply one analysis sample. Returns the segments closed on this tick.
    fn on_sample(
        &mut self,
        recorder: &mut Recorder,
        sample: &FrameSample,
    ) -> Result<Vec<ClosedSegment>>;

    /// Segment currently being written, if any.
    fn current(&self) -> Option<&Segment>;

    /// Hand over the open segment, e.g. for shutdown.
    fn take_current(&mut self) -> Option<Segment>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Fixed,
    MotionGated,
}

impl StrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "motion-gated" | "motion_gated" | "gated" => Some(Self::MotionGated),
            _ => None,
        }
    }

    pub fn build(self, policy: SegmentPolicy) -> Box<dyn RecordingStrategy> {
        match self {
            Self::Fixed => Box::new(FixedSegments::new(policy)),
            Self::MotionGated => Box::new(MotionGated::new(policy)),
        }
    }
}

pub struct FixedSegments {
    policy: SegmentPolicy,
    current: Option<Segment>,
}

impl FixedSegments {
    pub fn new(policy: SegmentPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }
}

impl RecordingStrategy for FixedSegments {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn on_sample(
        &mut self,
        recorder: &mut Recorder,
        sample: &FrameSample,
    ) -> Result<Vec<ClosedSegment>> {
        let mut segment = match self.current.take() {
            Some(segment) => segment,
            None => recorder.open_segment(sample.at)?,
        };
        segment.record(sample);

        if !self.policy.reached(&segment, sample.at) {
            self.current = Some(segment);
            return Ok(Vec::new());
        }

        let closed = recorder.close_segment(segment)?;
        self.current = Some(recorder.open_segment(sample.at)?);
        Ok(vec![closed])
    }

    fn current(&self) -> Option<&Segment> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<Segment> {
        self.current.take()
    }
}

pub struct MotionGated {
    policy: SegmentPolicy,
    current: Option<Segment>,
}

impl MotionGated {
    pub fn new(policy: SegmentPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    fn open_active(recorder: &mut Recorder, sample: &FrameSample) -> Result<Segment> {
        let mut segment = recorder.open_segment(sample.at)?;
        segment.mark_motion();
        Ok(segment)
    }
}

impl RecordingStrategy for MotionGated {
    fn name(&self) -> &'static str {
        "motion-gated"
    }

    fn on_sample(
        &mut self,
        recorder: &mut Recorder,
        sample: &FrameSample,
    ) -> Result<Vec<ClosedSegment>> {
        let Some(mut segment) = self.current.take() else {
            if sample.active {
                let mut segment = Self::open_active(recorder, sample)?;
                segment.record(sample);
                self.current = Some(segment);
            }
            return Ok(Vec::new());
        };

        segment.record(sample);
        if !sample.active {
            return Ok(vec![recorder.close_segment(segment)?]);
        }
        if self.policy.reached(&segment, sample.at) {
            log::info!("segment {} split while active", segment.file_name());
            let closed = recorder.close_segment(segment)?;
            self.current = Some(Self::open_active(recorder, sample)?);
            return Ok(vec![closed]);
        }
        self.current = Some(segment);
        Ok(Vec::new())
    }

    fn current(&self) -> Option<&Segment> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<Segment> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCamera;
    use crate::frame::Frame;
    use crate::retention::{Retention, SegmentStore, StoreConfig};
    use crate::segment::FeederId;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::path::Path;

    fn recorder(root: &Path) -> Result<Recorder> {
        let store = SegmentStore::open(
            FeederId::new("cam")?,
            StoreConfig {
                video_dir: root.join("videos"),
                staging_dir: root.join("staging"),
                extension: "h264".to_string(),
            },
        )?;
        let frames = (0..1_000).map(|_| Frame::filled(2, 2, 0).ok());
        Ok(Recorder::new(Box::new(SyntheticCamera::scripted(frames)), store))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn sample(secs: i64, active: bool) -> FrameSample {
        FrameSample {
            frame_motion: false,
            active,
            at: at(secs),
        }
    }

    #[test]
    fn fixed_rolls_over_exactly_once_per_boundary() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut rec = recorder(temp_dir.path())?;
        let mut strategy = FixedSegments::new(SegmentPolicy::Frames(3));

        let mut closes = Vec::new();
        for i in 0..7 {
            let closed = strategy.on_sample(&mut rec, &sample(i, false))?;
            closes.push(closed.len());
        }
        assert_eq!(closes, vec![0, 0, 1, 0, 0, 1, 0]);
        assert_eq!(strategy.current().map(|s| s.frames()), Some(1));
        assert!(rec.is_encoding());
        Ok(())
    }

    #[test]
    fn gated_records_only_while_active() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut rec = recorder(temp_dir.path())?;
        let mut strategy = MotionGated::new(SegmentPolicy::Frames(100));

        assert!(strategy.on_sample(&mut rec, &sample(0, false))?.is_empty());
        assert!(strategy.current().is_none());
        assert!(!rec.is_encoding());

        assert!(strategy.on_sample(&mut rec, &sample(1, true))?.is_empty());
        assert!(strategy.on_sample(&mut rec, &sample(2, true))?.is_empty());
        assert!(rec.is_encoding());

        let closed = strategy.on_sample(&mut rec, &sample(3, false))?;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].frames, 3);
        assert!(closed[0].retention.is_kept());
        assert!(strategy.current().is_none());
        assert!(!rec.is_encoding());
        Ok(())
    }

    #[test]
    fn gated_splits_long_activity() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut rec = recorder(temp_dir.path())?;
        let mut strategy =
            MotionGated::new(SegmentPolicy::Duration(std::time::Duration::from_secs(10)));

        strategy.on_sample(&mut rec, &sample(0, true))?;
        assert!(strategy.on_sample(&mut rec, &sample(9, true))?.is_empty());
        let split = strategy.on_sample(&mut rec, &sample(10, true))?;
        assert_eq!(split.len(), 1);
        assert!(matches!(split[0].retention, Retention::Kept(_)));

        // The follow-on segment is kept even if activity ends right away.
        let closed = strategy.on_sample(&mut rec, &sample(11, false))?;
        assert_eq!(closed.len(), 1);
        assert!(closed[0].retention.is_kept());
        assert_eq!(closed[0].frames, 1);
        Ok(())
    }

    #[test]
    fn strategy_kind_parses_names() {
        assert_eq!(StrategyKind::parse("fixed"), Some(StrategyKind::Fixed));
        assert_eq!(
            StrategyKind::parse("Motion-Gated"),
            Some(StrategyKind::MotionGated)
        );
        assert_eq!(StrategyKind::parse("sometimes"), None);
    }
}

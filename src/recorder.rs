//! Couples the capture device's encoder with the segment store.
//!
//! Every segment goes through the same two steps: the encoder is started on
//! its staging path when it opens, and stopped before retention runs when it
//! closes, so the keep/discard decision never races a writer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::capture::CaptureDevice;
use crate::frame::Frame;
use crate::retention::{Retention, SegmentStore};
use crate::segment::Segment;

/// Summary of a segment after its retention decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosedSegment {
    pub file_name: String,
    pub started_at: DateTime<Utc>,
    pub frames: u64,
    pub motion: bool,
    pub retention: Retention,
}

pub struct Recorder {
    device: Box<dyn CaptureDevice>,
    store: SegmentStore,
}

impl Recorder {
    pub fn new(device: Box<dyn CaptureDevice>, store: SegmentStore) -> Self {
        Self { device, store }
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn poll_frame(&mut self) -> Result<Option<Frame>> {
        self.device.poll_low_res_frame()
    }

    pub fn is_encoding(&self) -> bool {
        self.device.is_encoding()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.device.dropped_frames()
    }

    pub fn open_segment(&mut self, at: DateTime<Utc>) -> Result<Segment> {
        let segment = self.store.new_segment(at);
        self.device
            .start_encoding(segment.staging_path())
            .with_context(|| format!("start encoder for {}", segment.file_name()))?;
        log::info!("segment {} opened", segment.file_name());
        Ok(segment)
    }

    /// Stop the encoder and apply the retention decision.
    pub fn close_segment(&mut self, segment: Segment) -> Result<ClosedSegment> {
        self.stop(&segment)?;
        let summary = summarize(&segment);
        let retention = self.store.close(segment)?;
        Ok(ClosedSegment {
            retention,
            ..summary
        })
    }

    /// Stop the encoder and delete the segment whatever its motion flag.
    pub fn abandon_segment(&mut self, segment: Segment) -> Result<ClosedSegment> {
        self.stop(&segment)?;
        self.store.discard(&segment)?;
        log::info!(
            "segment {} abandoned ({} frames)",
            segment.file_name(),
            segment.frames()
        );
        Ok(summarize(&segment))
    }

    fn stop(&mut self, segment: &Segment) -> Result<()> {
        self.device
            .stop_encoding()
            .with_context(|| format!("stop encoder for {}", segment.file_name()))
    }
}

fn summarize(segment: &Segment) -> ClosedSegment {
    ClosedSegment {
        file_name: segment.file_name().to_string(),
        started_at: segment.started_at(),
        frames: segment.frames(),
        motion: segment.has_motion(),
        retention: Retention::Discarded,
    }
}

//! Recording segments and the policy that bounds them.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// UTC timestamp layout used in segment file names.
pub const SEGMENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Stable identifier of a capture unit.
///
/// Output names are `{feeder_id}_{timestamp}.{ext}` and the offline server
/// splits them on `_` and `.`, so neither may appear in the id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FeederId(String);

impl FeederId {
    pub fn new(id: &str) -> Result<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("feeder id cannot be empty"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(anyhow!(
                "feeder id '{}' must be [A-Za-z0-9-] only",
                trimmed
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name for a segment started at `started_at`.
    pub fn segment_file_name(&self, started_at: DateTime<Utc>, extension: &str) -> String {
        format!(
            "{}_{}.{}",
            self.0,
            started_at.format(SEGMENT_TIMESTAMP_FORMAT),
            extension
        )
    }

    /// Name for the `seq`-th extra segment started within the same second.
    /// The sequence goes after the timestamp as its own `_` field so the
    /// timestamp still parses on its own.
    pub fn numbered_segment_file_name(
        &self,
        started_at: DateTime<Utc>,
        seq: u32,
        extension: &str,
    ) -> String {
        format!(
            "{}_{}_{}.{}",
            self.0,
            started_at.format(SEGMENT_TIMESTAMP_FORMAT),
            seq,
            extension
        )
    }
}

impl fmt::Display for FeederId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target segment length. Exactly one measure is authoritative per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentPolicy {
    /// Close after this many analysis frames.
    Frames(u64),
    /// Close once this much wall-clock time has passed since the segment opened.
    Duration(Duration),
}

impl SegmentPolicy {
    /// Frame-count policy from a frame rate and a segment duration in seconds.
    pub fn from_rate(framerate: u32, segment_length_secs: u64) -> Result<Self> {
        let frames = (framerate as u64)
            .checked_mul(segment_length_secs)
            .ok_or_else(|| anyhow!("segment frame count overflows"))?;
        if frames == 0 {
            return Err(anyhow!("segment target must be at least one frame"));
        }
        Ok(Self::Frames(frames))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Frames(0) => Err(anyhow!("segment target must be at least one frame")),
            Self::Duration(d) if d.is_zero() => {
                Err(anyhow!("segment duration must be greater than zero"))
            }
            _ => Ok(()),
        }
    }

    /// Whether `segment` has reached the boundary as of `now`.
    pub fn reached(&self, segment: &Segment, now: DateTime<Utc>) -> bool {
        match self {
            Self::Frames(target) => segment.frames >= *target,
            Self::Duration(d) => {
                let limit = TimeDelta::from_std(*d).unwrap_or(TimeDelta::MAX);
                segment.elapsed(now) >= limit
            }
        }
    }
}

/// What one analysis tick contributed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSample {
    pub frame_motion: bool,
    pub active: bool,
    pub at: DateTime<Utc>,
}

/// One open recording segment.
#[derive(Debug)]
pub struct Segment {
    staging_path: PathBuf,
    file_name: String,
    started_at: DateTime<Utc>,
    frames: u64,
    motion: bool,
}

impl Segment {
    pub fn new(staging_path: PathBuf, file_name: String, started_at: DateTime<Utc>) -> Self {
        Self {
            staging_path,
            file_name,
            started_at,
            frames: 0,
            motion: false,
        }
    }

    /// Count one frame and fold its motion into the sticky flag.
    pub fn record(&mut self, sample: &FrameSample) {
        self.motion = self.motion || sample.frame_motion || sample.active;
        self.frames += 1;
    }

    /// Mark the segment motion-bearing without counting a frame. Used when a
    /// segment is opened because activity is already in progress.
    pub fn mark_motion(&mut self) {
        self.motion = true;
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Sticky: once a qualifying frame is seen this stays true until close.
    pub fn has_motion(&self) -> bool {
        self.motion
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.started_at)
    }
}

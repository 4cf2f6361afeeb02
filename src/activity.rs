//! Hysteresis over per-frame motion flags.
//!
//! Raw motion is noisy: a subject that pauses for a few frames would otherwise
//! flicker the activity state. The tracker keeps the time of the last motion
//! frame and reports "active" until `delay` has elapsed since then. The window
//! is wall-clock time, so behavior does not depend on the frame rate.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ActivityTracker {
    delay: TimeDelta,
    last_active: Option<DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn new(delay: Duration) -> Result<Self> {
        let delay = TimeDelta::from_std(delay)
            .map_err(|_| anyhow!("activity delay {:?} is out of range", delay))?;
        Ok(Self {
            delay,
            last_active: None,
        })
    }

    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        self.last_active
    }

    /// Record a frame's motion flag. Only motion frames move the timestamp,
    /// and it never moves backwards.
    pub fn observe(&mut self, frame_motion: bool, now: DateTime<Utc>) {
        if !frame_motion {
            return;
        }
        match self.last_active {
            Some(last) if last >= now => {}
            _ => self.last_active = Some(now),
        }
    }

    /// True while less than `delay` has passed since the last motion frame.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.last_active
            .is_some_and(|last| now.signed_duration_since(last) < self.delay)
    }
}

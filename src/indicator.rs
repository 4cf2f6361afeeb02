//! Status indicators for field diagnostics.
//!
//! The liveness output toggles once per processed frame, so a stalled loop is
//! visible as a frozen LED. The activity output mirrors the hysteresis state.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

pub trait StatusIndicator: Send {
    fn toggle_liveness(&mut self) -> Result<()>;
    fn set_activity(&mut self, active: bool) -> Result<()>;
}

/// Indicator that only logs activity transitions.
#[derive(Debug, Default)]
pub struct LogIndicator {
    liveness: bool,
    activity: Option<bool>,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusIndicator for LogIndicator {
    fn toggle_liveness(&mut self) -> Result<()> {
        self.liveness = !self.liveness;
        Ok(())
    }

    fn set_activity(&mut self, active: bool) -> Result<()> {
        if self.activity != Some(active) {
            log::info!("activity {}", if active { "started" } else { "ended" });
            self.activity = Some(active);
        }
        Ok(())
    }
}

/// LEDs exposed through `/sys/class/leds/<name>`.
#[derive(Debug)]
pub struct SysfsLedIndicator {
    liveness: Option<PathBuf>,
    activity: Option<PathBuf>,
    liveness_on: bool,
    activity_on: Option<bool>,
}

impl SysfsLedIndicator {
    /// Each argument is an LED directory; its `brightness` file is written.
    pub fn new(liveness_led: Option<PathBuf>, activity_led: Option<PathBuf>) -> Self {
        Self {
            liveness: liveness_led.map(|dir| dir.join("brightness")),
            activity: activity_led.map(|dir| dir.join("brightness")),
            liveness_on: false,
            activity_on: None,
        }
    }
}

fn write_brightness(path: &PathBuf, on: bool) -> Result<()> {
    fs::write(path, if on { "1" } else { "0" })
        .with_context(|| format!("write {}", path.display()))
}

impl StatusIndicator for SysfsLedIndicator {
    fn toggle_liveness(&mut self) -> Result<()> {
        self.liveness_on = !self.liveness_on;
        if let Some(path) = &self.liveness {
            write_brightness(path, self.liveness_on)?;
        }
        Ok(())
    }

    fn set_activity(&mut self, active: bool) -> Result<()> {
        if self.activity_on == Some(active) {
            return Ok(());
        }
        if let Some(path) = &self.activity {
            write_brightness(path, active)?;
        }
        self.activity_on = Some(active);
        Ok(())
    }
}

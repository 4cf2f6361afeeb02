//! Synthetic capture device.
//!
//! Two modes:
//! - pattern: a static gradient with a periodic bright block that simulates a
//!   visitor entering and leaving the scene (`stub://` devices); frames are
//!   paced at the configured frame rate like a real sensor
//! - scripted: replays an explicit frame sequence; `None` entries and an
//!   exhausted script show up as transient misses
//!
//! While encoding, every polled frame appends its pixels to the segment file
//! so file contents track what the controller saw.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::CaptureDevice;
use crate::frame::{pixel_count, Frame};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second delivered by `poll_low_res_frame` (0 = unpaced).
    pub framerate: u32,
    /// A burst starts every this many frames (0 disables bursts).
    pub burst_every: u64,
    /// Frames each burst lasts.
    pub burst_len: u64,
    /// Fraction of the frame the burst block covers.
    pub burst_fraction: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://feeder".to_string(),
            width: 320,
            height: 240,
            framerate: 10,
            burst_every: 600,
            burst_len: 20,
            burst_fraction: 0.25,
        }
    }
}

pub struct SyntheticCamera {
    source: Source,
    frames_delivered: u64,
    encoder: Option<SyntheticEncoder>,
}

enum Source {
    Pattern {
        config: SyntheticConfig,
        tick: u64,
        pacer: Pacer,
    },
    Scripted(VecDeque<Option<Frame>>),
}

struct SyntheticEncoder {
    path: PathBuf,
    file: File,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        pixel_count(config.width, config.height)?;
        if !(0.0..=1.0).contains(&config.burst_fraction) {
            return Err(anyhow!("burst_fraction must be in [0, 1]"));
        }
        log::info!(
            "SyntheticCamera: connected to {} ({}x{} @ {} fps)",
            config.name,
            config.width,
            config.height,
            config.framerate
        );
        let pacer = Pacer::new(config.framerate);
        Ok(Self {
            source: Source::Pattern {
                config,
                tick: 0,
                pacer,
            },
            frames_delivered: 0,
            encoder: None,
        })
    }

    /// Replay `frames` in order. `None` entries are delivered as misses.
    pub fn scripted<I>(frames: I) -> Self
    where
        I: IntoIterator<Item = Option<Frame>>,
    {
        Self {
            source: Source::Scripted(frames.into_iter().collect()),
            frames_delivered: 0,
            encoder: None,
        }
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.source {
            Source::Scripted(queue) => Ok(queue.pop_front().flatten()),
            Source::Pattern {
                config,
                tick,
                pacer,
            } => {
                if !pacer.due(Instant::now()) {
                    return Ok(None);
                }
                *tick += 1;
                Ok(Some(pattern_frame(config, *tick)?))
            }
        }
    }
}

/// Releases one frame per period. A poll that comes late does not earn a
/// burst of catch-up frames.
struct Pacer {
    period: Option<Duration>,
    next_due: Option<Instant>,
}

impl Pacer {
    fn new(framerate: u32) -> Self {
        Self {
            period: (framerate > 0).then(|| Duration::from_secs(1) / framerate),
            next_due: None,
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        let Some(period) = self.period else {
            return true;
        };
        if self.next_due.is_some_and(|due| now < due) {
            return false;
        }
        let next = self.next_due.map_or(now, |due| due) + period;
        self.next_due = Some(if next <= now { now + period } else { next });
        true
    }
}

fn pattern_frame(config: &SyntheticConfig, tick: u64) -> Result<Frame> {
    let w = config.width as usize;
    let h = config.height as usize;
    let mut pixels: Vec<u8> = (0..h)
        .flat_map(|y| (0..w).map(move |x| ((x + y) % 128) as u8))
        .collect();

    let in_burst = config.burst_every > 0
        && tick >= config.burst_every
        && tick % config.burst_every < config.burst_len;
    if in_burst {
        // Square-ish block in the top-left corner.
        let side = ((w * h) as f32 * config.burst_fraction).sqrt();
        let bw = (side as usize).min(w);
        let bh = if bw == 0 {
            0
        } else {
            ((w * h) as f32 * config.burst_fraction / bw as f32).ceil() as usize
        };
        for row in pixels.chunks_exact_mut(w).take(bh.min(h)) {
            row[..bw].fill(255);
        }
    }
    Frame::new(config.width, config.height, pixels)
}

impl CaptureDevice for SyntheticCamera {
    fn start_encoding(&mut self, path: &Path) -> Result<()> {
        if let Some(enc) = &self.encoder {
            return Err(anyhow!(
                "encoder already writing {}",
                enc.path.display()
            ));
        }
        let file = File::create(path)
            .with_context(|| format!("create segment file {}", path.display()))?;
        self.encoder = Some(SyntheticEncoder {
            path: path.to_path_buf(),
            file,
        });
        log::debug!("SyntheticCamera: encoding to {}", path.display());
        Ok(())
    }

    fn stop_encoding(&mut self) -> Result<()> {
        let Some(enc) = self.encoder.take() else {
            return Err(anyhow!("encoder is not running"));
        };
        enc.file
            .sync_all()
            .with_context(|| format!("flush segment file {}", enc.path.display()))?;
        Ok(())
    }

    fn is_encoding(&self) -> bool {
        self.encoder.is_some()
    }

    fn poll_low_res_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.next_frame()?;
        if let Some(frame) = &frame {
            self.frames_delivered += 1;
            if let Some(enc) = &mut self.encoder {
                enc.file
                    .write_all(frame.pixels())
                    .with_context(|| format!("write segment file {}", enc.path.display()))?;
            }
        }
        Ok(frame)
    }
}
